use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{Result, VoteError};
use crate::model::{
    audit::{AuditEvent, AuditEventType, AuditLog, AuditOutcome},
    auth::Rights,
    ballot::{AnonymousBallot, BallotId},
    mongodb::{id_as_string, Id},
    token::{TokenHasher, TokenSecret},
};
use crate::store::VoteStore;

use super::{validate_candidate, with_retries, RetryPolicy};

/// A ballot as submitted by a voter.
#[derive(Debug, Deserialize)]
pub struct Vote {
    pub token: TokenSecret,
    #[serde(with = "id_as_string")]
    pub candidate: Id,
}

/// Cast a ballot, spending the presented token.
///
/// Either every effect happens (ballot stored, token spent and stripped,
/// voter marked as voted) or none does. On success the audit trail records
/// that *a* vote was cast, with no actor and no candidate. A refusal is
/// recorded against the voter and the address they voted from.
#[allow(clippy::too_many_arguments)]
pub async fn cast_ballot(
    store: &dyn VoteStore,
    hasher: &TokenHasher,
    audit: &AuditLog,
    voter_id: Id,
    ip: Option<IpAddr>,
    election_id: Id,
    vote: &Vote,
    now: DateTime<Utc>,
) -> Result<BallotId> {
    let result = with_retries("Ballot", RetryPolicy::default(), || {
        cast_once(store, hasher, voter_id, election_id, vote, now)
    })
    .await;

    match &result {
        Ok(_) => {
            let details = format!("election {election_id}");
            audit.emit(AuditEvent::anonymous(AuditEventType::VoteCast, &details));
            audit.emit(AuditEvent::anonymous(AuditEventType::TokenUsed, details));
        }
        Err(e) => {
            let code = e.vote_error().code();
            audit.emit(AuditEvent::by(
                voter_id,
                Rights::Student,
                AuditEventType::VoteFailed,
                format!("election {election_id}: {code}"),
                AuditOutcome::Failure,
            )
            .from_ip(ip));
        }
    }
    result
}

async fn cast_once(
    store: &dyn VoteStore,
    hasher: &TokenHasher,
    voter_id: Id,
    election_id: Id,
    vote: &Vote,
    now: DateTime<Utc>,
) -> Result<BallotId> {
    let mut tx = store.begin().await?;

    // Token first, eligibility second, always in this order.
    let hash = hasher.hash(&vote.token);
    let token = match tx.lock_token_by_hash(election_id, &hash).await? {
        Some(token) => token,
        None => {
            // Spent tokens lose their hash, so a replayed token looks unknown.
            // Tell the voter who has already voted what actually happened.
            let voted = tx
                .lock_eligibility(voter_id, election_id)
                .await?
                .map_or(false, |record| record.has_voted);
            return Err(if voted {
                VoteError::TokenAlreadyUsed
            } else {
                VoteError::InvalidToken
            }
            .into());
        }
    };
    if token.used {
        return Err(VoteError::TokenAlreadyUsed.into());
    }
    if token.voter_id != Some(voter_id) {
        return Err(VoteError::InvalidToken.into());
    }

    let eligibility = tx
        .lock_eligibility(voter_id, election_id)
        .await?
        .ok_or(VoteError::NotEligible)?;
    if eligibility.has_voted {
        return Err(VoteError::AlreadyVoted.into());
    }

    let open = tx
        .election(election_id)
        .await?
        .map_or(false, |election| election.accepts_votes_at(now));
    if !open {
        return Err(VoteError::VotingClosed.into());
    }

    validate_candidate(tx.as_mut(), election_id, vote.candidate).await?;

    let ballot = AnonymousBallot::new(election_id, vote.candidate);
    tx.insert_ballot(&ballot).await?;
    tx.consume_token(token.id, now).await?;
    tx.mark_voted(voter_id, election_id, now).await?;
    tx.commit().await?;

    Ok(ballot.ballot_id)
}
