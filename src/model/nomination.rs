use chrono::{DateTime, Utc};
use mongodb::bson::{serde_helpers::chrono_datetime_as_bson_datetime, to_bson, Bson};
use serde::{Deserialize, Serialize};

use crate::model::mongodb::{optional_datetime, Id};

/// Review state of a nomination.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NominationStatus {
    Pending,
    Approved,
    Rejected,
}

impl From<NominationStatus> for Bson {
    fn from(status: NominationStatus) -> Self {
        to_bson(&status).expect("Serialisation is infallible")
    }
}

/// A student standing as candidate in an election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nomination {
    #[serde(rename = "_id")]
    pub id: Id,
    pub election_id: Id,
    pub candidate_id: Id,
    /// Display name captured at nomination time, used to order results.
    pub candidate_name: String,
    pub status: NominationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub submitted_at: DateTime<Utc>,
    #[serde(default, with = "optional_datetime")]
    pub decided_at: Option<DateTime<Utc>>,
}

impl Nomination {
    pub fn new(
        election_id: Id,
        candidate_id: Id,
        candidate_name: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Id::new(),
            election_id,
            candidate_id,
            candidate_name: candidate_name.into(),
            status: NominationStatus::Pending,
            reason: None,
            submitted_at: now,
            decided_at: None,
        }
    }

    pub fn is_approved(&self) -> bool {
        self.status == NominationStatus::Approved
    }

    /// Move a pending nomination to a decided state.
    /// Returns false, leaving the nomination untouched, if it was already decided.
    pub fn decide(
        &mut self,
        status: NominationStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status != NominationStatus::Pending || status == NominationStatus::Pending {
            return false;
        }
        self.status = status;
        self.reason = reason;
        self.decided_at = Some(now);
        true
    }
}
