use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::mongodb::{optional_datetime, Id};

/// Whether a voter may vote in an election, and whether they already have.
///
/// Created in bulk when the election activates; `has_voted` only ever moves
/// from false to true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityRecord {
    #[serde(rename = "_id")]
    pub id: Id,
    pub voter_id: Id,
    pub election_id: Id,
    pub has_voted: bool,
    #[serde(default, with = "optional_datetime")]
    pub voted_at: Option<DateTime<Utc>>,
}

impl EligibilityRecord {
    pub fn new(voter_id: Id, election_id: Id) -> Self {
        Self {
            id: Id::new(),
            voter_id,
            election_id,
            has_voted: false,
            voted_at: None,
        }
    }

    /// Record that the vote has been cast. Returns false if it already had been.
    pub fn mark_voted(&mut self, now: DateTime<Utc>) -> bool {
        if self.has_voted {
            return false;
        }
        self.has_voted = true;
        self.voted_at = Some(now);
        true
    }
}
