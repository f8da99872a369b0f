use chrono::{DateTime, Utc};

use crate::error::{Error, Result, VoteError};
use crate::model::{
    mongodb::Id,
    token::{TokenHasher, TokenSecret, VotingToken},
};
use crate::store::VoteStore;

use super::{with_retries, RetryPolicy};

/// What a voter gets back when asking for a voting token.
#[derive(Debug)]
pub enum IssueOutcome {
    /// A fresh plaintext token. This is the only time it exists outside the voter's hands.
    Issued(TokenSecret),
    /// The voter has already voted; there is nothing to issue.
    AlreadyVoted,
}

/// Issue a voting token to an eligible voter.
///
/// Asking again before voting replaces the stored hash, so any plaintext
/// handed out earlier stops working. Asking after voting is a no-op.
pub async fn issue_token(
    store: &dyn VoteStore,
    hasher: &TokenHasher,
    voter_id: Id,
    election_id: Id,
    now: DateTime<Utc>,
) -> Result<IssueOutcome> {
    with_retries("Token issue", RetryPolicy::default(), || {
        issue_once(store, hasher, voter_id, election_id, now)
    })
    .await
}

async fn issue_once(
    store: &dyn VoteStore,
    hasher: &TokenHasher,
    voter_id: Id,
    election_id: Id,
    now: DateTime<Utc>,
) -> Result<IssueOutcome> {
    let mut tx = store.begin().await?;

    let election = tx
        .election(election_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Election with ID '{election_id}'")))?;
    if !election.accepts_votes_at(now) {
        return Err(VoteError::ElectionNotOpen.into());
    }

    let eligibility = tx
        .lock_eligibility(voter_id, election_id)
        .await?
        .ok_or(VoteError::NotEligible)?;
    if !tx.policy_accepted(voter_id, election_id).await? {
        return Err(VoteError::PolicyNotAccepted.into());
    }
    if eligibility.has_voted {
        return Ok(IssueOutcome::AlreadyVoted);
    }

    let (secret, hash) = hasher.issue();
    match tx.lock_unused_token(voter_id, election_id).await? {
        Some(token) => tx.rehash_token(token.id, &hash, now).await?,
        None => {
            tx.insert_token(&VotingToken::new(voter_id, election_id, hash, now))
                .await?
        }
    }
    tx.commit().await?;

    Ok(IssueOutcome::Issued(secret))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::store::FlakyStore;
    use crate::voting::fixture::Fixture;

    #[rocket::async_test]
    async fn reissue_replaces_the_stored_hash() {
        let f = Fixture::new().await;
        let now = Utc::now();

        let first = f.issue(f.voter, now).await;
        let second = f.issue(f.voter, now).await;
        assert_ne!(first, second);

        let tokens = f.store.tokens(f.election.id).await;
        let mine: Vec<_> = tokens.iter().filter(|t| t.belongs_to(f.voter)).collect();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].token_hash, Some(f.hasher.hash(&second)));

        // Neither plaintext is recoverable from what is stored.
        for token in &tokens {
            let stored = token.token_hash.as_ref().map(|h| h.as_str().to_string());
            assert_ne!(stored.as_deref(), Some(first.as_str()));
            assert_ne!(stored.as_deref(), Some(second.as_str()));
        }
    }

    #[rocket::async_test]
    async fn concurrent_requests_leave_one_live_token() {
        let f = Fixture::new().await;
        let store = FlakyStore::new(f.store.clone()).with_conflicts(20);

        let requests =
            (0..6).map(|_| issue_token(&store, &f.hasher, f.voter, f.election.id, Utc::now()));
        let outcomes = rocket::futures::future::join_all(requests).await;
        let secrets: Vec<_> = outcomes
            .into_iter()
            .map(|outcome| match outcome.unwrap() {
                IssueOutcome::Issued(secret) => secret,
                IssueOutcome::AlreadyVoted => panic!("nobody has voted"),
            })
            .collect();
        assert_eq!(store.pending_conflicts(), 0);

        let tokens = f.store.tokens(f.election.id).await;
        let mine: Vec<_> = tokens.iter().filter(|t| t.belongs_to(f.voter)).collect();
        assert_eq!(mine.len(), 1);
        let live = secrets
            .iter()
            .filter(|secret| mine[0].token_hash == Some(f.hasher.hash(secret)))
            .count();
        assert_eq!(live, 1);
    }

    #[rocket::async_test]
    async fn voters_who_voted_get_nothing() {
        let f = Fixture::new().await;
        let token = f.issue(f.voter, Utc::now()).await;
        f.vote(f.voter, &token, f.candidate).await.unwrap();

        let outcome = issue_token(&f.store, &f.hasher, f.voter, f.election.id, Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, IssueOutcome::AlreadyVoted));
        assert!(!f
            .store
            .tokens(f.election.id)
            .await
            .iter()
            .any(|t| t.belongs_to(f.voter)));
    }

    #[rocket::async_test]
    async fn preconditions_are_checked() {
        let f = Fixture::new().await;
        let stranger = Id::new();
        let err = issue_token(&f.store, &f.hasher, stranger, f.election.id, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.vote_error(), VoteError::NotEligible);

        let err = issue_token(&f.store, &f.hasher, f.abstainer, f.election.id, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.vote_error(), VoteError::PolicyNotAccepted);

        let too_late = f.election.schedule.voting_end() + Duration::milliseconds(1);
        let err = issue_token(&f.store, &f.hasher, f.voter, f.election.id, too_late)
            .await
            .unwrap_err();
        assert_eq!(err.vote_error(), VoteError::ElectionNotOpen);

        let err = issue_token(&f.store, &f.hasher, f.voter, Id::new(), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
