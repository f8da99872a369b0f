//! Persistence for the voting core.
//!
//! Everything that must be atomic goes through a [`VoteTransaction`]: reading a
//! token or eligibility record through it locks that record until the
//! transaction commits or is dropped, and dropping without committing discards
//! every write made through it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::Result;
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

mod memory;
mod mongo;

#[cfg(test)]
mod flaky;
#[cfg(test)]
pub use flaky::FlakyStore;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

pub type SharedStore = Arc<dyn VoteStore>;

/// One eligibility record plus the unused token issued alongside it,
/// written for each class member when an election activates.
pub type Enrolment = (EligibilityRecord, VotingToken);

/// A storage transaction used by the token issuer and the ballot coordinator.
#[rocket::async_trait]
pub trait VoteTransaction: Send {
    async fn election(&mut self, election_id: Id) -> Result<Option<Election>>;

    /// Find and lock the token with the given hash in the given election.
    async fn lock_token_by_hash(
        &mut self,
        election_id: Id,
        hash: &TokenHash,
    ) -> Result<Option<VotingToken>>;

    /// Find and lock the voter's unused token for the given election.
    async fn lock_unused_token(
        &mut self,
        voter_id: Id,
        election_id: Id,
    ) -> Result<Option<VotingToken>>;

    /// Find and lock the voter's eligibility record for the given election.
    async fn lock_eligibility(
        &mut self,
        voter_id: Id,
        election_id: Id,
    ) -> Result<Option<EligibilityRecord>>;

    async fn policy_accepted(&mut self, voter_id: Id, election_id: Id) -> Result<bool>;

    async fn is_approved(&mut self, election_id: Id, candidate_id: Id) -> Result<bool>;

    async fn insert_token(&mut self, token: &VotingToken) -> Result<()>;

    /// Overwrite the hash of a locked, unused token.
    async fn rehash_token(&mut self, token_id: Id, hash: &TokenHash, now: DateTime<Utc>)
        -> Result<()>;

    async fn insert_ballot(&mut self, ballot: &AnonymousBallot) -> Result<()>;

    /// Mark a locked token used and strip its voter and hash.
    async fn consume_token(&mut self, token_id: Id, now: DateTime<Utc>) -> Result<()>;

    /// Flip a locked eligibility record to voted.
    async fn mark_voted(&mut self, voter_id: Id, election_id: Id, now: DateTime<Utc>)
        -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// The database behind the voting core.
#[rocket::async_trait]
pub trait VoteStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn VoteTransaction>>;

    async fn election(&self, election_id: Id) -> Result<Option<Election>>;

    /// Elections the lifecycle clock may still have work to do on.
    async fn unpublished_elections(&self) -> Result<Vec<Election>>;

    async fn nomination(&self, nomination_id: Id) -> Result<Option<Nomination>>;

    /// Returns false if the candidate had already been nominated for the election.
    async fn insert_nomination(&self, nomination: &Nomination) -> Result<bool>;

    /// Decide a nomination, only if it is still pending.
    /// Returns the decided nomination, or `None` if there was nothing pending to decide.
    async fn decide_nomination(
        &self,
        nomination_id: Id,
        status: NominationStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Nomination>>;

    async fn approved_nominations(&self, election_id: Id) -> Result<Vec<Nomination>>;

    /// Nomination service view: is the candidate an approved nominee?
    async fn is_approved(&self, election_id: Id, candidate_id: Id) -> Result<bool>;

    async fn ballot_counts(&self, election_id: Id) -> Result<HashMap<Id, u64>>;

    async fn eligible_voters(&self, election_id: Id) -> Result<u64>;

    async fn eligibility(&self, voter_id: Id, election_id: Id)
        -> Result<Option<EligibilityRecord>>;

    /// Idempotent: accepting twice keeps the first acceptance.
    async fn accept_policy(&self, acceptance: &PolicyAcceptance) -> Result<()>;

    async fn student(&self, student_id: Id) -> Result<Option<Student>>;

    /// Class roster service view.
    async fn members_of(&self, class_id: Id) -> Result<Vec<Student>>;

    /// Reject every still-pending nomination of the election, returning those rejected.
    async fn reject_pending_nominations(
        &self,
        election_id: Id,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Nomination>>;

    /// Deactivate and publish the election, if not already published.
    async fn close_election(&self, election_id: Id) -> Result<bool>;

    /// Spend and strip every unused token of the election, returning how many.
    async fn expire_unused_tokens(&self, election_id: Id, now: DateTime<Utc>) -> Result<u64>;

    async fn class_has_other_active_election(&self, class_id: Id, election_id: Id)
        -> Result<bool>;

    /// Atomically activate the election and write the enrolments, skipping any
    /// voter that already has a record. Returns false, writing nothing, if the
    /// election was already active or published.
    async fn activate_election(&self, election_id: Id, enrolments: Vec<Enrolment>)
        -> Result<bool>;
}
