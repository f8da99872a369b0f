use std::fmt;

use data_encoding::HEXLOWER;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::model::mongodb::Id;

/// An opaque random ballot identifier. Carries no meaning beyond uniqueness.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BallotId(String);

impl BallotId {
    pub fn generate(mut rng: impl RngCore + CryptoRng) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        Self(HEXLOWER.encode(&bytes))
    }
}

impl fmt::Display for BallotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cast vote. Holds neither voter nor timestamp, and the random primary key
/// avoids the creation time an `ObjectId` would embed.
///
/// The store still keeps ballots roughly in insertion order, which follows the
/// order of `voted_at`. Ballots are only ever tallied; anything that reads them
/// one by one must sort them by `ballot_id` first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymousBallot {
    #[serde(rename = "_id")]
    pub ballot_id: BallotId,
    pub election_id: Id,
    pub candidate_id: Id,
}

impl AnonymousBallot {
    pub fn new(election_id: Id, candidate_id: Id) -> Self {
        Self {
            ballot_id: BallotId::generate(rand::thread_rng()),
            election_id,
            candidate_id,
        }
    }
}
