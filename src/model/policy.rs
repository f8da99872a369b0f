use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::model::mongodb::Id;

/// A voter's acceptance of the voting policy for one election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyAcceptance {
    #[serde(rename = "_id")]
    pub id: Id,
    pub voter_id: Id,
    pub election_id: Id,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub accepted_at: DateTime<Utc>,
}

impl PolicyAcceptance {
    pub fn new(voter_id: Id, election_id: Id, now: DateTime<Utc>) -> Self {
        Self {
            id: Id::new(),
            voter_id,
            election_id,
            accepted_at: now,
        }
    }
}
