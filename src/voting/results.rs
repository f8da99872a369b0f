use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{
    election::{Election, ElectionStatus},
    mongodb::{id_as_string, Id},
};
use crate::store::VoteStore;

/// Vote count for one approved candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateResult {
    #[serde(with = "id_as_string")]
    pub candidate_id: Id,
    pub name: String,
    pub votes: u64,
}

#[derive(Debug, Serialize)]
pub struct ElectionResults {
    #[serde(with = "id_as_string")]
    pub election_id: Id,
    pub name: String,
    /// Only shown to admins.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ElectionStatus>,
    pub candidates: Vec<CandidateResult>,
    pub total_ballots: u64,
    pub eligible_voters: u64,
}

/// Count ballots per approved candidate, including those nobody voted for,
/// ordered by votes (most first) and then by name.
pub async fn tally(store: &dyn VoteStore, election_id: Id) -> Result<Vec<CandidateResult>> {
    let counts = store.ballot_counts(election_id).await?;
    let mut results: Vec<_> = store
        .approved_nominations(election_id)
        .await?
        .into_iter()
        .map(|nomination| CandidateResult {
            candidate_id: nomination.candidate_id,
            name: nomination.candidate_name,
            votes: counts.get(&nomination.candidate_id).copied().unwrap_or(0),
        })
        .collect();
    results.sort_by(|a, b| b.votes.cmp(&a.votes).then_with(|| a.name.cmp(&b.name)));
    Ok(results)
}

async fn results_of(
    store: &dyn VoteStore,
    election: Election,
    status: Option<ElectionStatus>,
) -> Result<ElectionResults> {
    let candidates = tally(store, election.id).await?;
    let total_ballots = candidates.iter().map(|c| c.votes).sum();
    let eligible_voters = store.eligible_voters(election.id).await?;
    Ok(ElectionResults {
        election_id: election.id,
        name: election.name,
        status,
        candidates,
        total_ballots,
        eligible_voters,
    })
}

/// Results as anyone may see them: only once the election is published.
pub async fn public_results(store: &dyn VoteStore, election_id: Id) -> Result<ElectionResults> {
    match store.election(election_id).await? {
        Some(election) if election.published => results_of(store, election, None).await,
        _ => Err(Error::not_found(format!("Election with ID '{election_id}'"))),
    }
}

/// Results as an admin sees them: at any time, labelled with the election's
/// current phase.
pub async fn admin_results(
    store: &dyn VoteStore,
    election_id: Id,
    now: DateTime<Utc>,
) -> Result<ElectionResults> {
    let election = store
        .election(election_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Election with ID '{election_id}'")))?;
    let status = election.schedule.status_at(now);
    results_of(store, election, Some(status)).await
}
