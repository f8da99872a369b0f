use crate::error::{Result, VoteError};
use crate::model::mongodb::Id;
use crate::store::VoteTransaction;

/// Check that the candidate is an approved nominee of this particular election.
pub async fn validate_candidate(
    tx: &mut dyn VoteTransaction,
    election_id: Id,
    candidate_id: Id,
) -> Result<()> {
    if tx.is_approved(election_id, candidate_id).await? {
        Ok(())
    } else {
        Err(VoteError::InvalidCandidate.into())
    }
}
