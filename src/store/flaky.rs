//! A [`MemoryStore`] wrapper that fails on request: it can abort transactions
//! with write conflicts, the way a contended MongoDB does, and refuse every
//! lifecycle write for one election.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::model::{
    ballot::AnonymousBallot,
    election::Election,
    eligibility::EligibilityRecord,
    mongodb::Id,
    nomination::{Nomination, NominationStatus},
    policy::PolicyAcceptance,
    student::Student,
    token::{TokenHash, VotingToken},
};

use super::{Enrolment, MemoryStore, VoteStore, VoteTransaction};

#[derive(Clone, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    conflicts: Arc<AtomicUsize>,
    broken_election: Option<Id>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Abort the next `count` transaction steps that take a lock (including `begin`).
    pub fn with_conflicts(self, count: usize) -> Self {
        self.conflicts.store(count, Ordering::SeqCst);
        self
    }

    /// Fail every lifecycle write to the given election.
    pub fn breaking(mut self, election_id: Id) -> Self {
        self.broken_election = Some(election_id);
        self
    }

    /// Conflicts injected but not yet raised.
    pub fn pending_conflicts(&self) -> usize {
        self.conflicts.load(Ordering::SeqCst)
    }

    fn check(&self, election_id: Id) -> Result<()> {
        if self.broken_election == Some(election_id) {
            return Err(Error::Conflict(format!(
                "election {election_id} is unavailable"
            )));
        }
        Ok(())
    }
}

fn take_conflict(conflicts: &AtomicUsize) -> Result<()> {
    let taken = conflicts
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if taken {
        Err(Error::WriteConflict("injected write conflict".to_string()))
    } else {
        Ok(())
    }
}

struct FlakyTransaction {
    inner: Box<dyn VoteTransaction>,
    conflicts: Arc<AtomicUsize>,
}

#[rocket::async_trait]
impl VoteTransaction for FlakyTransaction {
    async fn election(&mut self, election_id: Id) -> Result<Option<Election>> {
        self.inner.election(election_id).await
    }

    async fn lock_token_by_hash(
        &mut self,
        election_id: Id,
        hash: &TokenHash,
    ) -> Result<Option<VotingToken>> {
        take_conflict(&self.conflicts)?;
        self.inner.lock_token_by_hash(election_id, hash).await
    }

    async fn lock_unused_token(
        &mut self,
        voter_id: Id,
        election_id: Id,
    ) -> Result<Option<VotingToken>> {
        take_conflict(&self.conflicts)?;
        self.inner.lock_unused_token(voter_id, election_id).await
    }

    async fn lock_eligibility(
        &mut self,
        voter_id: Id,
        election_id: Id,
    ) -> Result<Option<EligibilityRecord>> {
        take_conflict(&self.conflicts)?;
        self.inner.lock_eligibility(voter_id, election_id).await
    }

    async fn policy_accepted(&mut self, voter_id: Id, election_id: Id) -> Result<bool> {
        self.inner.policy_accepted(voter_id, election_id).await
    }

    async fn is_approved(&mut self, election_id: Id, candidate_id: Id) -> Result<bool> {
        self.inner.is_approved(election_id, candidate_id).await
    }

    async fn insert_token(&mut self, token: &VotingToken) -> Result<()> {
        self.inner.insert_token(token).await
    }

    async fn rehash_token(
        &mut self,
        token_id: Id,
        hash: &TokenHash,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.rehash_token(token_id, hash, now).await
    }

    async fn insert_ballot(&mut self, ballot: &AnonymousBallot) -> Result<()> {
        self.inner.insert_ballot(ballot).await
    }

    async fn consume_token(&mut self, token_id: Id, now: DateTime<Utc>) -> Result<()> {
        self.inner.consume_token(token_id, now).await
    }

    async fn mark_voted(
        &mut self,
        voter_id: Id,
        election_id: Id,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.inner.mark_voted(voter_id, election_id, now).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.inner.commit().await
    }
}

#[rocket::async_trait]
impl VoteStore for FlakyStore {
    async fn begin(&self) -> Result<Box<dyn VoteTransaction>> {
        take_conflict(&self.conflicts)?;
        Ok(Box::new(FlakyTransaction {
            inner: self.inner.begin().await?,
            conflicts: self.conflicts.clone(),
        }))
    }

    async fn election(&self, election_id: Id) -> Result<Option<Election>> {
        self.inner.election(election_id).await
    }

    async fn unpublished_elections(&self) -> Result<Vec<Election>> {
        self.inner.unpublished_elections().await
    }

    async fn nomination(&self, nomination_id: Id) -> Result<Option<Nomination>> {
        self.inner.nomination(nomination_id).await
    }

    async fn insert_nomination(&self, nomination: &Nomination) -> Result<bool> {
        self.inner.insert_nomination(nomination).await
    }

    async fn decide_nomination(
        &self,
        nomination_id: Id,
        status: NominationStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Nomination>> {
        self.inner
            .decide_nomination(nomination_id, status, reason, now)
            .await
    }

    async fn approved_nominations(&self, election_id: Id) -> Result<Vec<Nomination>> {
        self.inner.approved_nominations(election_id).await
    }

    async fn is_approved(&self, election_id: Id, candidate_id: Id) -> Result<bool> {
        self.inner.is_approved(election_id, candidate_id).await
    }

    async fn ballot_counts(&self, election_id: Id) -> Result<HashMap<Id, u64>> {
        self.inner.ballot_counts(election_id).await
    }

    async fn eligible_voters(&self, election_id: Id) -> Result<u64> {
        self.inner.eligible_voters(election_id).await
    }

    async fn eligibility(
        &self,
        voter_id: Id,
        election_id: Id,
    ) -> Result<Option<EligibilityRecord>> {
        self.inner.eligibility(voter_id, election_id).await
    }

    async fn accept_policy(&self, acceptance: &PolicyAcceptance) -> Result<()> {
        self.inner.accept_policy(acceptance).await
    }

    async fn student(&self, student_id: Id) -> Result<Option<Student>> {
        self.inner.student(student_id).await
    }

    async fn members_of(&self, class_id: Id) -> Result<Vec<Student>> {
        self.inner.members_of(class_id).await
    }

    async fn reject_pending_nominations(
        &self,
        election_id: Id,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Nomination>> {
        self.check(election_id)?;
        self.inner
            .reject_pending_nominations(election_id, reason, now)
            .await
    }

    async fn close_election(&self, election_id: Id) -> Result<bool> {
        self.check(election_id)?;
        self.inner.close_election(election_id).await
    }

    async fn expire_unused_tokens(&self, election_id: Id, now: DateTime<Utc>) -> Result<u64> {
        self.check(election_id)?;
        self.inner.expire_unused_tokens(election_id, now).await
    }

    async fn class_has_other_active_election(
        &self,
        class_id: Id,
        election_id: Id,
    ) -> Result<bool> {
        self.inner
            .class_has_other_active_election(class_id, election_id)
            .await
    }

    async fn activate_election(
        &self,
        election_id: Id,
        enrolments: Vec<Enrolment>,
    ) -> Result<bool> {
        self.check(election_id)?;
        self.inner.activate_election(election_id, enrolments).await
    }
}
