use jsonwebtoken::errors::{Error as JwtError, ErrorKind as JwtErrorKind};
use mongodb::error::Error as DbError;
use rocket::{http::Status, response::Responder, serde::json::Json, Request};
use serde::Serialize;
use thiserror::Error;

use crate::logging::RequestId;
use crate::model::mongodb::is_transient_transaction_error;

pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a voting operation can be refused.
///
/// Every variant is terminal for the request that produced it; none of them
/// is retried automatically.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Error, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteError {
    #[error("You are not eligible to vote in this election")]
    NotEligible,
    #[error("This election is not open for voting")]
    ElectionNotOpen,
    #[error("Voting for this election has closed")]
    VotingClosed,
    #[error("The voting token is not valid for this election")]
    InvalidToken,
    #[error("This voting token has already been used")]
    TokenAlreadyUsed,
    #[error("You have already voted in this election")]
    AlreadyVoted,
    #[error("The chosen candidate is not an approved nominee of this election")]
    InvalidCandidate,
    #[error("The voting policy for this election has not been accepted")]
    PolicyNotAccepted,
    #[error("The request could not be completed")]
    InternalFailure,
}

impl VoteError {
    /// Stable machine-readable code, for clients to match on.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotEligible => "NOT_ELIGIBLE",
            Self::ElectionNotOpen => "ELECTION_NOT_OPEN",
            Self::VotingClosed => "VOTING_CLOSED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::TokenAlreadyUsed => "TOKEN_ALREADY_USED",
            Self::AlreadyVoted => "ALREADY_VOTED",
            Self::InvalidCandidate => "INVALID_CANDIDATE",
            Self::PolicyNotAccepted => "POLICY_NOT_ACCEPTED",
            Self::InternalFailure => "INTERNAL_FAILURE",
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::NotEligible | Self::PolicyNotAccepted => Status::Forbidden,
            Self::AlreadyVoted | Self::TokenAlreadyUsed => Status::Conflict,
            Self::InvalidToken | Self::InvalidCandidate => Status::BadRequest,
            Self::ElectionNotOpen | Self::VotingClosed => Status::UnprocessableEntity,
            Self::InternalFailure => Status::InternalServerError,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Db(DbError),
    /// The store aborted a transaction because a concurrent one wrote the
    /// same records first. Restarting the transaction may succeed.
    #[error("Write conflict: {0}")]
    WriteConflict(String),
    #[error(transparent)]
    Jwt(#[from] JwtError),
    #[error(transparent)]
    Vote(#[from] VoteError),
    #[error("Notification failed: {0}")]
    Notification(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<DbError> for Error {
    fn from(err: DbError) -> Self {
        if is_transient_transaction_error(&err) {
            Self::WriteConflict(err.to_string())
        } else {
            Self::Db(err)
        }
    }
}

impl Error {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Did the storage layer abort because of a conflicting concurrent
    /// transaction? Such attempts can be restarted from scratch.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WriteConflict(_))
    }

    /// The voting error kind this error presents as.
    pub fn vote_error(&self) -> VoteError {
        match self {
            Self::Vote(e) => *e,
            _ => VoteError::InternalFailure,
        }
    }

    fn status(&self) -> Status {
        match self {
            Self::Vote(e) => e.status(),
            Self::Db(_) | Self::WriteConflict(_) | Self::Notification(_) => {
                Status::InternalServerError
            }
            Self::Jwt(err) => match err.kind() {
                JwtErrorKind::ExpiredSignature | JwtErrorKind::ImmatureSignature => {
                    Status::Unauthorized
                }
                _ => Status::BadRequest,
            },
            Self::BadRequest(_) => Status::BadRequest,
            Self::Unauthorized(_) => Status::Unauthorized,
            Self::NotFound(_) => Status::NotFound,
            Self::Conflict(_) => Status::Conflict,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Vote(e) => e.code(),
            Self::Db(_) | Self::WriteConflict(_) | Self::Notification(_) => {
                VoteError::InternalFailure.code()
            }
            Self::Jwt(_) | Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> rocket::response::Result<'o> {
        let status = self.status();
        let id = RequestId::of(req);
        let message = if status == Status::InternalServerError {
            // Log the cause, but do not leak internals to the client.
            error!("req{id} internal error: {self}");
            VoteError::InternalFailure.to_string()
        } else {
            debug!("req{id} refused: {self}");
            self.to_string()
        };
        let body = ErrorBody {
            error: self.code(),
            message,
        };
        (status, Json(body)).respond_to(req)
    }
}
