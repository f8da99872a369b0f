use std::ops::Deref;

use mongodb::{
    bson::doc, error::Error as DbError, options::IndexOptions, Collection, Database, IndexModel,
};

use crate::model::{
    audit::AuditEvent,
    ballot::AnonymousBallot,
    election::Election,
    eligibility::EligibilityRecord,
    nomination::Nomination,
    policy::PolicyAcceptance,
    student::Student,
    token::VotingToken,
};

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl MongoCollection for Election {
    const NAME: &'static str = "elections";
}

impl MongoCollection for Nomination {
    const NAME: &'static str = "nominations";
}

impl MongoCollection for EligibilityRecord {
    const NAME: &'static str = "eligibility";
}

impl MongoCollection for VotingToken {
    const NAME: &'static str = "voting_tokens";
}

impl MongoCollection for AnonymousBallot {
    const NAME: &'static str = "ballots";
}

impl MongoCollection for Student {
    const NAME: &'static str = "students";
}

impl MongoCollection for PolicyAcceptance {
    const NAME: &'static str = "policy_acceptances";
}

impl MongoCollection for AuditEvent {
    const NAME: &'static str = "audit_log";
}

/// Ensure that all the required indexes exist on the given database.
///
/// This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    let unique = IndexOptions::builder().unique(true).build();

    // One eligibility record per voter per election.
    let eligibility_index = IndexModel::builder()
        .keys(doc! {"voter_id": 1, "election_id": 1})
        .options(unique.clone())
        .build();
    Coll::<EligibilityRecord>::from_db(db)
        .create_index(eligibility_index, None)
        .await?;

    // One nomination per candidate per election.
    let nomination_index = IndexModel::builder()
        .keys(doc! {"election_id": 1, "candidate_id": 1})
        .options(unique.clone())
        .build();
    Coll::<Nomination>::from_db(db)
        .create_index(nomination_index, None)
        .await?;

    // Live token hashes are unique; consumed tokens have a null hash and are excluded.
    let live_hashes = IndexOptions::builder()
        .unique(true)
        .partial_filter_expression(doc! {"token_hash": {"$type": "string"}})
        .build();
    let token_index = IndexModel::builder()
        .keys(doc! {"election_id": 1, "token_hash": 1})
        .options(live_hashes)
        .build();
    Coll::<VotingToken>::from_db(db)
        .create_index(token_index, None)
        .await?;

    // At most one unused token per voter per election.
    let unused_per_voter = IndexOptions::builder()
        .unique(true)
        .partial_filter_expression(doc! {"used": false})
        .build();
    let owner_index = IndexModel::builder()
        .keys(doc! {"voter_id": 1, "election_id": 1})
        .options(unused_per_voter)
        .build();
    Coll::<VotingToken>::from_db(db)
        .create_index(owner_index, None)
        .await?;

    let ballot_index = IndexModel::builder()
        .keys(doc! {"election_id": 1, "candidate_id": 1})
        .build();
    Coll::<AnonymousBallot>::from_db(db)
        .create_index(ballot_index, None)
        .await?;

    let policy_index = IndexModel::builder()
        .keys(doc! {"voter_id": 1, "election_id": 1})
        .options(unique)
        .build();
    Coll::<PolicyAcceptance>::from_db(db)
        .create_index(policy_index, None)
        .await?;

    let roster_index = IndexModel::builder().keys(doc! {"class_id": 1}).build();
    Coll::<Student>::from_db(db)
        .create_index(roster_index, None)
        .await?;

    Ok(())
}
