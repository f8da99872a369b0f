use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rocket::tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{Error, Result};
use crate::model::{
    audit::{AuditEvent, AuditSink},
    ballot::AnonymousBallot,
    election::Election,
    eligibility::EligibilityRecord,
    mongodb::Id,
    nomination::{Nomination, NominationStatus},
    policy::PolicyAcceptance,
    student::Student,
    token::{TokenHash, VotingToken},
};

use super::{Enrolment, VoteStore, VoteTransaction};

#[derive(Debug, Default, Clone)]
struct Tables {
    elections: HashMap<Id, Election>,
    nominations: HashMap<Id, Nomination>,
    /// Keyed by (voter, election).
    eligibility: HashMap<(Id, Id), EligibilityRecord>,
    tokens: HashMap<Id, VotingToken>,
    ballots: Vec<AnonymousBallot>,
    students: HashMap<Id, Student>,
    /// Keyed by (voter, election).
    policies: HashMap<(Id, Id), PolicyAcceptance>,
    audit: Vec<AuditEvent>,
}

impl Tables {
    fn unused_token_of(&self, voter_id: Id, election_id: Id) -> Option<&VotingToken> {
        self.tokens
            .values()
            .find(|t| t.election_id == election_id && t.belongs_to(voter_id))
    }

    fn is_approved(&self, election_id: Id, candidate_id: Id) -> bool {
        self.nominations.values().any(|n| {
            n.election_id == election_id && n.candidate_id == candidate_id && n.is_approved()
        })
    }
}

/// A process-local store. Transactions are fully serialized: each one holds
/// the only lock on the tables from `begin` until it is committed or dropped,
/// and works on a private copy that is only published on commit.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an election.
    pub async fn put_election(&self, election: Election) {
        self.tables
            .lock()
            .await
            .elections
            .insert(election.id, election);
    }

    /// Insert or replace a roster entry.
    pub async fn put_student(&self, student: Student) {
        self.tables.lock().await.students.insert(student.id, student);
    }

    /// Insert or replace a nomination, bypassing the uniqueness check.
    pub async fn put_nomination(&self, nomination: Nomination) {
        self.tables
            .lock()
            .await
            .nominations
            .insert(nomination.id, nomination);
    }

    pub async fn tokens(&self, election_id: Id) -> Vec<VotingToken> {
        self.tables
            .lock()
            .await
            .tokens
            .values()
            .filter(|t| t.election_id == election_id)
            .cloned()
            .collect()
    }

    /// The election's ballots, ordered by ballot id rather than by when they were cast.
    pub async fn ballots(&self, election_id: Id) -> Vec<AnonymousBallot> {
        let mut ballots: Vec<_> = self
            .tables
            .lock()
            .await
            .ballots
            .iter()
            .filter(|b| b.election_id == election_id)
            .cloned()
            .collect();
        ballots.sort_by(|a, b| a.ballot_id.cmp(&b.ballot_id));
        ballots
    }

    pub async fn eligibility_records(&self, election_id: Id) -> Vec<EligibilityRecord> {
        self.tables
            .lock()
            .await
            .eligibility
            .values()
            .filter(|r| r.election_id == election_id)
            .cloned()
            .collect()
    }

    pub async fn audit_events(&self) -> Vec<AuditEvent> {
        self.tables.lock().await.audit.clone()
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
}

impl MemoryTransaction {
    fn token_mut(&mut self, token_id: Id) -> Result<&mut VotingToken> {
        self.staged
            .tokens
            .get_mut(&token_id)
            .ok_or_else(|| Error::not_found(format!("Voting token {token_id}")))
    }
}

#[rocket::async_trait]
impl VoteTransaction for MemoryTransaction {
    async fn election(&mut self, election_id: Id) -> Result<Option<Election>> {
        Ok(self.staged.elections.get(&election_id).cloned())
    }

    async fn lock_token_by_hash(
        &mut self,
        election_id: Id,
        hash: &TokenHash,
    ) -> Result<Option<VotingToken>> {
        Ok(self
            .staged
            .tokens
            .values()
            .find(|t| t.election_id == election_id && t.token_hash.as_ref() == Some(hash))
            .cloned())
    }

    async fn lock_unused_token(
        &mut self,
        voter_id: Id,
        election_id: Id,
    ) -> Result<Option<VotingToken>> {
        Ok(self.staged.unused_token_of(voter_id, election_id).cloned())
    }

    async fn lock_eligibility(
        &mut self,
        voter_id: Id,
        election_id: Id,
    ) -> Result<Option<EligibilityRecord>> {
        Ok(self.staged.eligibility.get(&(voter_id, election_id)).cloned())
    }

    async fn policy_accepted(&mut self, voter_id: Id, election_id: Id) -> Result<bool> {
        Ok(self.staged.policies.contains_key(&(voter_id, election_id)))
    }

    async fn is_approved(&mut self, election_id: Id, candidate_id: Id) -> Result<bool> {
        Ok(self.staged.is_approved(election_id, candidate_id))
    }

    async fn insert_token(&mut self, token: &VotingToken) -> Result<()> {
        if let Some(voter_id) = token.voter_id {
            if self.staged.unused_token_of(voter_id, token.election_id).is_some() {
                return Err(Error::Conflict(format!(
                    "Voter {voter_id} already holds a token for election {}",
                    token.election_id
                )));
            }
        }
        self.staged.tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn rehash_token(
        &mut self,
        token_id: Id,
        hash: &TokenHash,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.token_mut(token_id)?.rehash(hash.clone(), now);
        Ok(())
    }

    async fn insert_ballot(&mut self, ballot: &AnonymousBallot) -> Result<()> {
        self.staged.ballots.push(ballot.clone());
        Ok(())
    }

    async fn consume_token(&mut self, token_id: Id, now: DateTime<Utc>) -> Result<()> {
        self.token_mut(token_id)?.consume(now);
        Ok(())
    }

    async fn mark_voted(&mut self, voter_id: Id, election_id: Id, now: DateTime<Utc>) -> Result<()> {
        let record = self
            .staged
            .eligibility
            .get_mut(&(voter_id, election_id))
            .ok_or_else(|| Error::not_found(format!("Eligibility of voter {voter_id}")))?;
        if !record.mark_voted(now) {
            return Err(Error::Conflict(format!("Voter {voter_id} has already voted")));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}

#[rocket::async_trait]
impl VoteStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn VoteTransaction>> {
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, staged }))
    }

    async fn election(&self, election_id: Id) -> Result<Option<Election>> {
        Ok(self.tables.lock().await.elections.get(&election_id).cloned())
    }

    async fn unpublished_elections(&self) -> Result<Vec<Election>> {
        Ok(self
            .tables
            .lock()
            .await
            .elections
            .values()
            .filter(|e| !e.published)
            .cloned()
            .collect())
    }

    async fn nomination(&self, nomination_id: Id) -> Result<Option<Nomination>> {
        Ok(self.tables.lock().await.nominations.get(&nomination_id).cloned())
    }

    async fn insert_nomination(&self, nomination: &Nomination) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let duplicate = tables.nominations.values().any(|n| {
            n.election_id == nomination.election_id && n.candidate_id == nomination.candidate_id
        });
        if duplicate {
            return Ok(false);
        }
        tables.nominations.insert(nomination.id, nomination.clone());
        Ok(true)
    }

    async fn decide_nomination(
        &self,
        nomination_id: Id,
        status: NominationStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Nomination>> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .nominations
            .get_mut(&nomination_id)
            .filter(|n| n.status == NominationStatus::Pending)
            .and_then(|n| n.decide(status, reason, now).then(|| n.clone())))
    }

    async fn approved_nominations(&self, election_id: Id) -> Result<Vec<Nomination>> {
        Ok(self
            .tables
            .lock()
            .await
            .nominations
            .values()
            .filter(|n| n.election_id == election_id && n.is_approved())
            .cloned()
            .collect())
    }

    async fn is_approved(&self, election_id: Id, candidate_id: Id) -> Result<bool> {
        Ok(self.tables.lock().await.is_approved(election_id, candidate_id))
    }

    async fn ballot_counts(&self, election_id: Id) -> Result<HashMap<Id, u64>> {
        let tables = self.tables.lock().await;
        let mut counts = HashMap::new();
        for ballot in tables.ballots.iter().filter(|b| b.election_id == election_id) {
            *counts.entry(ballot.candidate_id).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn eligible_voters(&self, election_id: Id) -> Result<u64> {
        let tables = self.tables.lock().await;
        Ok(tables
            .eligibility
            .values()
            .filter(|r| r.election_id == election_id)
            .count() as u64)
    }

    async fn eligibility(
        &self,
        voter_id: Id,
        election_id: Id,
    ) -> Result<Option<EligibilityRecord>> {
        Ok(self
            .tables
            .lock()
            .await
            .eligibility
            .get(&(voter_id, election_id))
            .cloned())
    }

    async fn accept_policy(&self, acceptance: &PolicyAcceptance) -> Result<()> {
        self.tables
            .lock()
            .await
            .policies
            .entry((acceptance.voter_id, acceptance.election_id))
            .or_insert_with(|| acceptance.clone());
        Ok(())
    }

    async fn student(&self, student_id: Id) -> Result<Option<Student>> {
        Ok(self.tables.lock().await.students.get(&student_id).cloned())
    }

    async fn members_of(&self, class_id: Id) -> Result<Vec<Student>> {
        Ok(self
            .tables
            .lock()
            .await
            .students
            .values()
            .filter(|s| s.class_id == class_id)
            .cloned()
            .collect())
    }

    async fn reject_pending_nominations(
        &self,
        election_id: Id,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Nomination>> {
        let mut tables = self.tables.lock().await;
        let mut rejected = Vec::new();
        for nomination in tables
            .nominations
            .values_mut()
            .filter(|n| n.election_id == election_id)
        {
            if nomination.decide(NominationStatus::Rejected, Some(reason.to_string()), now) {
                rejected.push(nomination.clone());
            }
        }
        Ok(rejected)
    }

    async fn close_election(&self, election_id: Id) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.elections.get_mut(&election_id) {
            Some(election) if !election.published => {
                election.active = false;
                election.published = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_unused_tokens(&self, election_id: Id, now: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let mut expired = 0;
        for token in tables
            .tokens
            .values_mut()
            .filter(|t| t.election_id == election_id && !t.used)
        {
            token.consume(now);
            expired += 1;
        }
        Ok(expired)
    }

    async fn class_has_other_active_election(
        &self,
        class_id: Id,
        election_id: Id,
    ) -> Result<bool> {
        Ok(self
            .tables
            .lock()
            .await
            .elections
            .values()
            .any(|e| e.class_id == class_id && e.id != election_id && e.active))
    }

    async fn activate_election(
        &self,
        election_id: Id,
        enrolments: Vec<Enrolment>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.elections.get_mut(&election_id) {
            Some(election) if !election.active && !election.published => election.active = true,
            _ => return Ok(false),
        }
        for (record, token) in enrolments {
            let key = (record.voter_id, record.election_id);
            if tables.eligibility.contains_key(&key) {
                continue;
            }
            tables.eligibility.insert(key, record);
            tables.tokens.insert(token.id, token);
        }
        Ok(true)
    }
}

#[rocket::async_trait]
impl AuditSink for MemoryStore {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        self.tables.lock().await.audit.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::token::TokenHasher;

    #[rocket::async_test]
    async fn dropped_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        let election = Id::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_ballot(&AnonymousBallot::new(election, Id::new()))
                .await
                .unwrap();
            // Dropped without commit.
        }
        assert!(store.ballots(election).await.is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.insert_ballot(&AnonymousBallot::new(election, Id::new()))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.ballots(election).await.len(), 1);
    }

    #[rocket::async_test]
    async fn ballots_are_listed_by_id_not_by_casting_order() {
        let store = MemoryStore::new();
        let election = Id::new();
        for _ in 0..8 {
            let mut tx = store.begin().await.unwrap();
            tx.insert_ballot(&AnonymousBallot::new(election, Id::new()))
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }
        let ids: Vec<_> = store
            .ballots(election)
            .await
            .into_iter()
            .map(|b| b.ballot_id)
            .collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[rocket::async_test]
    async fn one_unused_token_per_voter() {
        let store = MemoryStore::new();
        let hasher = TokenHasher::new(b"key");
        let (voter, election) = (Id::new(), Id::new());

        let mut tx = store.begin().await.unwrap();
        tx.insert_token(&VotingToken::new(voter, election, hasher.issue().1, Utc::now()))
            .await
            .unwrap();
        let second = VotingToken::new(voter, election, hasher.issue().1, Utc::now());
        assert!(matches!(
            tx.insert_token(&second).await,
            Err(Error::Conflict(_))
        ));
    }

    #[rocket::async_test]
    async fn activation_is_conditional_and_skips_existing_records() {
        let store = MemoryStore::new();
        let hasher = TokenHasher::new(b"key");
        let election = Election::voting_example(Id::new());
        let mut inactive = election.clone();
        inactive.active = false;
        store.put_election(inactive).await;

        let voter = Id::new();
        let enrolment = || {
            (
                EligibilityRecord::new(voter, election.id),
                VotingToken::new(voter, election.id, hasher.issue().1, Utc::now()),
            )
        };
        assert!(store
            .activate_election(election.id, vec![enrolment()])
            .await
            .unwrap());
        assert!(!store
            .activate_election(election.id, vec![enrolment()])
            .await
            .unwrap());
        assert_eq!(store.eligibility_records(election.id).await.len(), 1);
        assert_eq!(store.tokens(election.id).await.len(), 1);
    }
}
