use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use data_encoding::{BASE64URL_NOPAD, HEXLOWER};
use hmac::{Hmac, Mac};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::model::mongodb::{optional_datetime, Id};

pub type HmacSha256 = Hmac<Sha256>;

/// Number of random bytes in a voting token secret.
const SECRET_BYTES: usize = 32;

/// The plaintext voting token. Handed to the voter exactly once and never stored.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenSecret(String);

impl TokenSecret {
    /// Generate a fresh random secret.
    pub fn generate(mut rng: impl RngCore + CryptoRng) -> Self {
        let mut bytes = [0u8; SECRET_BYTES];
        rng.fill_bytes(&mut bytes);
        Self(BASE64URL_NOPAD.encode(&bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TokenSecret {
    fn from(secret: String) -> Self {
        Self(secret)
    }
}

// Keep secrets out of logs.
impl fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenSecret(..)")
    }
}

/// The one-way keyed hash of a [`TokenSecret`], which is all the database ever sees.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenHash(String);

impl TokenHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Hashes token secrets with HMAC-SHA256 under the server's token key.
#[derive(Clone)]
pub struct TokenHasher {
    key: Arc<[u8]>,
}

impl TokenHasher {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.into() }
    }

    pub fn hash(&self, secret: &TokenSecret) -> TokenHash {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC can take a key of any size");
        mac.update(secret.0.as_bytes());
        TokenHash(HEXLOWER.encode(&mac.finalize().into_bytes()))
    }

    /// Generate a fresh secret together with its hash.
    pub fn issue(&self) -> (TokenSecret, TokenHash) {
        let secret = TokenSecret::generate(rand::thread_rng());
        let hash = self.hash(&secret);
        (secret, hash)
    }
}

/// A single-use voting token.
///
/// While unused it belongs to exactly one voter and carries a hash. Once used
/// (or expired at election close) both are cleared, so nothing links the
/// spent token back to whoever held it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingToken {
    #[serde(rename = "_id")]
    pub id: Id,
    pub election_id: Id,
    pub voter_id: Option<Id>,
    pub token_hash: Option<TokenHash>,
    pub used: bool,
    #[serde(default, with = "optional_datetime")]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub issued_at: DateTime<Utc>,
}

impl VotingToken {
    pub fn new(voter_id: Id, election_id: Id, hash: TokenHash, now: DateTime<Utc>) -> Self {
        Self {
            id: Id::new(),
            election_id,
            voter_id: Some(voter_id),
            token_hash: Some(hash),
            used: false,
            used_at: None,
            issued_at: now,
        }
    }

    /// Replace the hash, invalidating whichever secret was issued before.
    pub fn rehash(&mut self, hash: TokenHash, now: DateTime<Utc>) {
        self.token_hash = Some(hash);
        self.issued_at = now;
    }

    /// Spend the token and sever it from its voter.
    pub fn consume(&mut self, now: DateTime<Utc>) {
        self.used = true;
        self.used_at = Some(now);
        self.voter_id = None;
        self.token_hash = None;
    }

    pub fn belongs_to(&self, voter_id: Id) -> bool {
        !self.used && self.voter_id == Some(voter_id)
    }
}
