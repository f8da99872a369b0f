use std::collections::HashMap;

use chrono::{DateTime, Utc};
use mongodb::{
    bson::{self, doc, Bson, Document},
    options::{FindOneAndUpdateOptions, ReturnDocument},
    Client, ClientSession, Database,
};
use rocket::futures::TryStreamExt;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{
    audit::{AuditEvent, AuditSink},
    ballot::AnonymousBallot,
    election::Election,
    eligibility::EligibilityRecord,
    mongodb::{is_duplicate_key_error, Coll, Id, MongoCollection},
    nomination::{Nomination, NominationStatus},
    policy::PolicyAcceptance,
    student::Student,
    token::{TokenHash, VotingToken},
};

use super::{Enrolment, VoteStore, VoteTransaction};

/// The production store, backed by a MongoDB replica set.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    pub fn new(client: Client, db: Database) -> Self {
        Self { client, db }
    }

    fn coll<T: MongoCollection>(&self) -> Coll<T> {
        Coll::from_db(&self.db)
    }
}

fn bson_time(time: DateTime<Utc>) -> Bson {
    Bson::DateTime(bson::DateTime::from_chrono(time))
}

/// Return the document after the update.
fn return_updated() -> FindOneAndUpdateOptions {
    FindOneAndUpdateOptions::builder()
        .return_document(ReturnDocument::After)
        .build()
}

/// Spend a token and sever it from its holder.
fn consumed(now: DateTime<Utc>) -> Document {
    doc! {
        "$set": {
            "used": true,
            "used_at": bson_time(now),
            "voter_id": Bson::Null,
            "token_hash": Bson::Null,
        }
    }
}

/// A transaction on a causally consistent session.
///
/// Locking is done by writing: each `lock_*` read stamps the document it
/// returns, so any concurrent transaction touching the same document hits a
/// write conflict and aborts with a transient error. Dropping the session
/// aborts the transaction.
struct MongoTransaction {
    session: ClientSession,
    elections: Coll<Election>,
    nominations: Coll<Nomination>,
    eligibility: Coll<EligibilityRecord>,
    tokens: Coll<VotingToken>,
    ballots: Coll<AnonymousBallot>,
    policies: Coll<PolicyAcceptance>,
}

impl MongoTransaction {
    fn lock_stamp() -> Document {
        doc! {"$set": {"locked_at": bson_time(Utc::now())}}
    }
}

#[rocket::async_trait]
impl VoteTransaction for MongoTransaction {
    async fn election(&mut self, election_id: Id) -> Result<Option<Election>> {
        Ok(self
            .elections
            .find_one_with_session(election_id.as_doc(), None, &mut self.session)
            .await?)
    }

    async fn lock_token_by_hash(
        &mut self,
        election_id: Id,
        hash: &TokenHash,
    ) -> Result<Option<VotingToken>> {
        let filter = doc! {
            "election_id": election_id,
            "token_hash": hash.as_str(),
        };
        Ok(self
            .tokens
            .find_one_and_update_with_session(
                filter,
                Self::lock_stamp(),
                return_updated(),
                &mut self.session,
            )
            .await?)
    }

    async fn lock_unused_token(
        &mut self,
        voter_id: Id,
        election_id: Id,
    ) -> Result<Option<VotingToken>> {
        let filter = doc! {
            "voter_id": voter_id,
            "election_id": election_id,
            "used": false,
        };
        Ok(self
            .tokens
            .find_one_and_update_with_session(
                filter,
                Self::lock_stamp(),
                return_updated(),
                &mut self.session,
            )
            .await?)
    }

    async fn lock_eligibility(
        &mut self,
        voter_id: Id,
        election_id: Id,
    ) -> Result<Option<EligibilityRecord>> {
        let filter = doc! {
            "voter_id": voter_id,
            "election_id": election_id,
        };
        Ok(self
            .eligibility
            .find_one_and_update_with_session(
                filter,
                Self::lock_stamp(),
                return_updated(),
                &mut self.session,
            )
            .await?)
    }

    async fn policy_accepted(&mut self, voter_id: Id, election_id: Id) -> Result<bool> {
        let filter = doc! {
            "voter_id": voter_id,
            "election_id": election_id,
        };
        let count = self
            .policies
            .count_documents_with_session(filter, None, &mut self.session)
            .await?;
        Ok(count > 0)
    }

    async fn is_approved(&mut self, election_id: Id, candidate_id: Id) -> Result<bool> {
        let filter = doc! {
            "election_id": election_id,
            "candidate_id": candidate_id,
            "status": NominationStatus::Approved,
        };
        let count = self
            .nominations
            .count_documents_with_session(filter, None, &mut self.session)
            .await?;
        Ok(count > 0)
    }

    async fn insert_token(&mut self, token: &VotingToken) -> Result<()> {
        match self
            .tokens
            .insert_one_with_session(token, None, &mut self.session)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key_error(&e) => Err(Error::Conflict(format!(
                "A live token already exists for election {}",
                token.election_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn rehash_token(
        &mut self,
        token_id: Id,
        hash: &TokenHash,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let filter = doc! {
            "_id": token_id,
            "used": false,
        };
        let update = doc! {
            "$set": {
                "token_hash": hash.as_str(),
                "issued_at": bson_time(now),
            }
        };
        let result = self
            .tokens
            .update_one_with_session(filter, update, None, &mut self.session)
            .await?;
        if result.matched_count == 0 {
            return Err(Error::not_found(format!("Unused voting token {token_id}")));
        }
        Ok(())
    }

    async fn insert_ballot(&mut self, ballot: &AnonymousBallot) -> Result<()> {
        self.ballots
            .insert_one_with_session(ballot, None, &mut self.session)
            .await?;
        Ok(())
    }

    async fn consume_token(&mut self, token_id: Id, now: DateTime<Utc>) -> Result<()> {
        let filter = doc! {
            "_id": token_id,
            "used": false,
        };
        let result = self
            .tokens
            .update_one_with_session(filter, consumed(now), None, &mut self.session)
            .await?;
        if result.modified_count == 0 {
            return Err(Error::Conflict(format!("Voting token {token_id} is already spent")));
        }
        Ok(())
    }

    async fn mark_voted(&mut self, voter_id: Id, election_id: Id, now: DateTime<Utc>) -> Result<()> {
        let filter = doc! {
            "voter_id": voter_id,
            "election_id": election_id,
            "has_voted": false,
        };
        let update = doc! {
            "$set": {
                "has_voted": true,
                "voted_at": bson_time(now),
            }
        };
        let result = self
            .eligibility
            .update_one_with_session(filter, update, None, &mut self.session)
            .await?;
        if result.modified_count == 0 {
            return Err(Error::Conflict(format!("Voter {voter_id} has already voted")));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut tx = *self;
        tx.session.commit_transaction().await?;
        Ok(())
    }
}

/// One group of the ballot count aggregation.
#[derive(Deserialize)]
struct CandidateCount {
    #[serde(rename = "_id")]
    candidate_id: Id,
    count: u64,
}

#[rocket::async_trait]
impl VoteStore for MongoStore {
    async fn begin(&self) -> Result<Box<dyn VoteTransaction>> {
        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;
        Ok(Box::new(MongoTransaction {
            session,
            elections: self.coll(),
            nominations: self.coll(),
            eligibility: self.coll(),
            tokens: self.coll(),
            ballots: self.coll(),
            policies: self.coll(),
        }))
    }

    async fn election(&self, election_id: Id) -> Result<Option<Election>> {
        Ok(self
            .coll::<Election>()
            .find_one(election_id.as_doc(), None)
            .await?)
    }

    async fn unpublished_elections(&self) -> Result<Vec<Election>> {
        Ok(self
            .coll::<Election>()
            .find(doc! {"published": false}, None)
            .await?
            .try_collect()
            .await?)
    }

    async fn nomination(&self, nomination_id: Id) -> Result<Option<Nomination>> {
        Ok(self
            .coll::<Nomination>()
            .find_one(nomination_id.as_doc(), None)
            .await?)
    }

    async fn insert_nomination(&self, nomination: &Nomination) -> Result<bool> {
        match self.coll::<Nomination>().insert_one(nomination, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key_error(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn decide_nomination(
        &self,
        nomination_id: Id,
        status: NominationStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<Nomination>> {
        if status == NominationStatus::Pending {
            return Ok(None);
        }
        let filter = doc! {
            "_id": nomination_id,
            "status": NominationStatus::Pending,
        };
        let update = doc! {
            "$set": {
                "status": status,
                "reason": reason,
                "decided_at": bson_time(now),
            }
        };
        Ok(self
            .coll::<Nomination>()
            .find_one_and_update(filter, update, return_updated())
            .await?)
    }

    async fn approved_nominations(&self, election_id: Id) -> Result<Vec<Nomination>> {
        let filter = doc! {
            "election_id": election_id,
            "status": NominationStatus::Approved,
        };
        Ok(self
            .coll::<Nomination>()
            .find(filter, None)
            .await?
            .try_collect()
            .await?)
    }

    async fn is_approved(&self, election_id: Id, candidate_id: Id) -> Result<bool> {
        let filter = doc! {
            "election_id": election_id,
            "candidate_id": candidate_id,
            "status": NominationStatus::Approved,
        };
        Ok(self
            .coll::<Nomination>()
            .count_documents(filter, None)
            .await?
            > 0)
    }

    async fn ballot_counts(&self, election_id: Id) -> Result<HashMap<Id, u64>> {
        let pipeline = [
            doc! {"$match": {"election_id": election_id}},
            doc! {"$group": {"_id": "$candidate_id", "count": {"$sum": 1}}},
        ];
        let mut groups = self
            .coll::<AnonymousBallot>()
            .aggregate(pipeline, None)
            .await?;

        let mut counts = HashMap::new();
        while let Some(group) = groups.try_next().await? {
            let group: CandidateCount = bson::from_document(group)
                .map_err(|e| Error::Db(mongodb::error::Error::from(e)))?;
            counts.insert(group.candidate_id, group.count);
        }
        Ok(counts)
    }

    async fn eligible_voters(&self, election_id: Id) -> Result<u64> {
        Ok(self
            .coll::<EligibilityRecord>()
            .count_documents(doc! {"election_id": election_id}, None)
            .await?)
    }

    async fn eligibility(
        &self,
        voter_id: Id,
        election_id: Id,
    ) -> Result<Option<EligibilityRecord>> {
        let filter = doc! {
            "voter_id": voter_id,
            "election_id": election_id,
        };
        Ok(self
            .coll::<EligibilityRecord>()
            .find_one(filter, None)
            .await?)
    }

    async fn accept_policy(&self, acceptance: &PolicyAcceptance) -> Result<()> {
        match self
            .coll::<PolicyAcceptance>()
            .insert_one(acceptance, None)
            .await
        {
            Err(e) if !is_duplicate_key_error(&e) => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn student(&self, student_id: Id) -> Result<Option<Student>> {
        Ok(self
            .coll::<Student>()
            .find_one(student_id.as_doc(), None)
            .await?)
    }

    async fn members_of(&self, class_id: Id) -> Result<Vec<Student>> {
        Ok(self
            .coll::<Student>()
            .find(doc! {"class_id": class_id}, None)
            .await?
            .try_collect()
            .await?)
    }

    async fn reject_pending_nominations(
        &self,
        election_id: Id,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Nomination>> {
        let filter = doc! {
            "election_id": election_id,
            "status": NominationStatus::Pending,
        };
        let pending: Vec<Nomination> = self
            .coll::<Nomination>()
            .find(filter, None)
            .await?
            .try_collect()
            .await?;

        // Each rejection is conditional, so an admin decision racing the
        // sweep wins or loses as a whole.
        let mut rejected = Vec::with_capacity(pending.len());
        for nomination in pending {
            if let Some(nomination) = self
                .decide_nomination(
                    nomination.id,
                    NominationStatus::Rejected,
                    Some(reason.to_string()),
                    now,
                )
                .await?
            {
                rejected.push(nomination);
            }
        }
        Ok(rejected)
    }

    async fn close_election(&self, election_id: Id) -> Result<bool> {
        let filter = doc! {
            "_id": election_id,
            "published": false,
        };
        let update = doc! {
            "$set": {
                "active": false,
                "published": true,
            }
        };
        let result = self
            .coll::<Election>()
            .update_one(filter, update, None)
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn expire_unused_tokens(&self, election_id: Id, now: DateTime<Utc>) -> Result<u64> {
        let filter = doc! {
            "election_id": election_id,
            "used": false,
        };
        let result = self
            .coll::<VotingToken>()
            .update_many(filter, consumed(now), None)
            .await?;
        Ok(result.modified_count)
    }

    async fn class_has_other_active_election(
        &self,
        class_id: Id,
        election_id: Id,
    ) -> Result<bool> {
        let filter = doc! {
            "class_id": class_id,
            "_id": {"$ne": election_id},
            "active": true,
        };
        Ok(self
            .coll::<Election>()
            .count_documents(filter, None)
            .await?
            > 0)
    }

    async fn activate_election(
        &self,
        election_id: Id,
        enrolments: Vec<Enrolment>,
    ) -> Result<bool> {
        let elections = self.coll::<Election>();
        let eligibility = self.coll::<EligibilityRecord>();
        let tokens = self.coll::<VotingToken>();

        let mut session = self.client.start_session(None).await?;
        session.start_transaction(None).await?;

        let filter = doc! {
            "_id": election_id,
            "active": false,
            "published": false,
        };
        let update = doc! {"$set": {"active": true}};
        let activated = elections
            .update_one_with_session(filter, update, None, &mut session)
            .await?;
        if activated.modified_count == 0 {
            return Ok(false);
        }

        for (record, token) in enrolments {
            let existing = doc! {
                "voter_id": record.voter_id,
                "election_id": record.election_id,
            };
            if eligibility
                .count_documents_with_session(existing, None, &mut session)
                .await?
                > 0
            {
                continue;
            }
            eligibility
                .insert_one_with_session(&record, None, &mut session)
                .await?;
            tokens
                .insert_one_with_session(&token, None, &mut session)
                .await?;
        }

        session.commit_transaction().await?;
        Ok(true)
    }
}

#[rocket::async_trait]
impl AuditSink for MongoStore {
    async fn record(&self, event: &AuditEvent) -> Result<()> {
        self.coll::<AuditEvent>().insert_one(event, None).await?;
        Ok(())
    }
}

/// These run against a live replica set, on a fresh database per test:
/// `CLASS_REP_TEST_DB_URI=mongodb://... cargo test -- --ignored`.
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;
    use rocket::futures::future::join_all;

    use super::*;
    use crate::config::get_database_name;
    use crate::error::VoteError;
    use crate::lifecycle::{LifecycleClock, SweepReport};
    use crate::model::{
        audit::AuditLog,
        token::{TokenHasher, TokenSecret},
    };
    use crate::model::{election::Schedule, mongodb::ensure_indexes_exist};
    use crate::notify::LogNotifier;
    use crate::voting::{cast_ballot, issue_token, IssueOutcome, Vote};

    const DEFAULT_URI: &str = "mongodb://localhost:27017/?replicaSet=rs0";

    async fn test_store() -> MongoStore {
        let uri =
            std::env::var("CLASS_REP_TEST_DB_URI").unwrap_or_else(|_| DEFAULT_URI.to_string());
        let client = Client::with_uri_str(&uri).await.unwrap();
        let db = client.database(&get_database_name());
        ensure_indexes_exist(&db).await.unwrap();
        MongoStore::new(client, db)
    }

    /// A running election with one enrolled voter who accepted the policy,
    /// and one approved candidate.
    async fn running_election(store: &MongoStore) -> (Election, Id, Id) {
        let mut election = Election::voting_example(Id::new());
        election.active = false;
        store
            .coll::<Election>()
            .insert_one(&election, None)
            .await
            .unwrap();

        let voter = Id::new();
        let hasher = TokenHasher::new(b"enrolment key");
        let enrolment = (
            EligibilityRecord::new(voter, election.id),
            VotingToken::new(voter, election.id, hasher.issue().1, Utc::now()),
        );
        assert!(store
            .activate_election(election.id, vec![enrolment])
            .await
            .unwrap());
        store
            .accept_policy(&PolicyAcceptance::new(voter, election.id, Utc::now()))
            .await
            .unwrap();

        let candidate = Id::new();
        store
            .coll::<Nomination>()
            .insert_one(&Nomination::approved_example(election.id, candidate, "Mia"), None)
            .await
            .unwrap();
        (election, voter, candidate)
    }

    async fn issue(
        store: &MongoStore,
        hasher: &TokenHasher,
        voter: Id,
        election: Id,
    ) -> TokenSecret {
        match issue_token(store, hasher, voter, election, Utc::now())
            .await
            .unwrap()
        {
            IssueOutcome::Issued(secret) => secret,
            IssueOutcome::AlreadyVoted => panic!("voter {voter} has already voted"),
        }
    }

    #[rocket::async_test]
    #[ignore = "needs a MongoDB replica set"]
    async fn concurrent_votes_with_one_token_succeed_once() {
        let store = test_store().await;
        let hasher = TokenHasher::new(b"test key");
        let audit = AuditLog::new(Arc::new(store.clone()));
        let (election, voter, candidate) = running_election(&store).await;
        let vote = Vote {
            token: issue(&store, &hasher, voter, election.id).await,
            candidate,
        };

        let attempts = (0..16).map(|_| {
            cast_ballot(
                &store,
                &hasher,
                &audit,
                voter,
                None,
                election.id,
                &vote,
                Utc::now(),
            )
        });
        let results = join_all(attempts).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for err in results.into_iter().filter_map(|r| r.err()) {
            assert_eq!(err.vote_error(), VoteError::TokenAlreadyUsed);
        }
        assert_eq!(store.ballot_counts(election.id).await.unwrap()[&candidate], 1);
        assert!(store
            .eligibility(voter, election.id)
            .await
            .unwrap()
            .unwrap()
            .has_voted);

        store.db.drop(None).await.unwrap();
    }

    #[rocket::async_test]
    #[ignore = "needs a MongoDB replica set"]
    async fn reissue_keeps_one_unused_token_per_voter() {
        let store = test_store().await;
        let hasher = TokenHasher::new(b"test key");
        let (election, voter, _) = running_election(&store).await;

        issue(&store, &hasher, voter, election.id).await;
        let latest = issue(&store, &hasher, voter, election.id).await;

        let unused: Vec<VotingToken> = store
            .coll::<VotingToken>()
            .find(doc! {"election_id": election.id, "voter_id": voter, "used": false}, None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(unused.len(), 1);
        assert_eq!(unused[0].token_hash, Some(hasher.hash(&latest)));

        // A second unused token for the voter breaks the partial unique index.
        let duplicate = VotingToken::new(voter, election.id, hasher.issue().1, Utc::now());
        let err = store
            .coll::<VotingToken>()
            .insert_one(&duplicate, None)
            .await
            .unwrap_err();
        assert!(is_duplicate_key_error(&err));

        store.db.drop(None).await.unwrap();
    }

    #[rocket::async_test]
    #[ignore = "needs a MongoDB replica set"]
    async fn expiry_strips_voter_and_hash() {
        let store = test_store().await;
        let (election, _, _) = running_election(&store).await;

        let after_end = election.schedule.voting_end() + Duration::seconds(1);
        assert_eq!(store.expire_unused_tokens(election.id, after_end).await.unwrap(), 1);
        assert_eq!(store.expire_unused_tokens(election.id, after_end).await.unwrap(), 0);

        let raw: Vec<Document> = store
            .coll::<VotingToken>()
            .clone_with_type::<Document>()
            .find(doc! {"election_id": election.id}, None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(raw.len(), 1);
        assert!(raw[0].get_bool("used").unwrap());
        for field in ["voter_id", "token_hash"] {
            assert!(matches!(raw[0].get(field), None | Some(Bson::Null)));
        }

        store.db.drop(None).await.unwrap();
    }

    #[rocket::async_test]
    #[ignore = "needs a MongoDB replica set"]
    async fn double_sweep_changes_nothing() {
        let store = test_store().await;
        let now = Utc::now();
        let class = Id::new();
        let schedule = Schedule::new(
            now - Duration::hours(1),
            now + Duration::hours(1),
            now + Duration::hours(2),
            now + Duration::hours(3),
        )
        .unwrap();
        let election = Election::new(class, "CR election", schedule);
        store
            .coll::<Election>()
            .insert_one(&election, None)
            .await
            .unwrap();
        for i in 0..3 {
            store
                .coll::<Student>()
                .insert_one(
                    &Student::new(class, format!("Student {i}"), format!("s{i}@example.edu")),
                    None,
                )
                .await
                .unwrap();
        }

        let store = Arc::new(store);
        let clock = LifecycleClock::new(
            store.clone(),
            Arc::new(LogNotifier),
            AuditLog::new(store.clone()),
            TokenHasher::new(b"clock key"),
        );
        assert_eq!(clock.sweep(now).await.activated, 1);
        assert_eq!(clock.sweep(now).await, SweepReport::default());
        assert_eq!(store.eligible_voters(election.id).await.unwrap(), 3);

        let after_end = election.schedule.voting_end() + Duration::seconds(1);
        let closing = clock.sweep(after_end).await;
        assert_eq!((closing.closed, closing.expired), (1, 3));
        assert_eq!(clock.sweep(after_end).await, SweepReport::default());

        store.db.drop(None).await.unwrap();
    }
}
