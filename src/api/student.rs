use std::net::IpAddr;

use chrono::Utc;
use rocket::{serde::json::Json, Route, State};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result, VoteError},
    model::{
        audit::{AuditEvent, AuditEventType, AuditLog, AuditOutcome},
        auth::{AuthToken, Rights, Voter},
        ballot::BallotId,
        election::Election,
        mongodb::{id_as_string, Id},
        nomination::{Nomination, NominationStatus},
        policy::PolicyAcceptance,
        student::Student,
        token::{TokenHasher, TokenSecret},
    },
    store::{SharedStore, VoteStore},
    voting::{cast_ballot, issue_token, IssueOutcome, Vote},
};

pub fn routes() -> Vec<Route> {
    routes![accept_policy, nominate, request_token, vote]
}

/// Response to a token request.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TokenResponse {
    Issued { token: TokenSecret },
    AlreadyVoted,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NominationReceipt {
    #[serde(with = "id_as_string")]
    pub nomination_id: Id,
    pub status: NominationStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BallotReceipt {
    pub ballot_id: BallotId,
}

/// Look up the election and check the student belongs to its class.
async fn election_of_member(
    store: &dyn VoteStore,
    student_id: Id,
    election_id: Id,
) -> Result<(Election, Student)> {
    let election = store
        .election(election_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Election with ID '{election_id}'")))?;
    match store.student(student_id).await? {
        Some(student) if student.class_id == election.class_id => Ok((election, student)),
        _ => Err(VoteError::NotEligible.into()),
    }
}

fn student_event(
    token: &AuthToken<Voter>,
    event: AuditEventType,
    details: String,
    ip: Option<IpAddr>,
) -> AuditEvent {
    AuditEvent::by(token.id(), Rights::Student, event, details, AuditOutcome::Success).from_ip(ip)
}

#[post("/elections/<election_id>/policy")]
async fn accept_policy(
    token: AuthToken<Voter>,
    election_id: Id,
    ip: Option<IpAddr>,
    store: &State<SharedStore>,
    audit: &State<AuditLog>,
) -> Result<()> {
    let store = store.inner().as_ref();
    election_of_member(store, token.id(), election_id).await?;

    store
        .accept_policy(&PolicyAcceptance::new(token.id(), election_id, Utc::now()))
        .await?;
    audit.emit(student_event(
        &token,
        AuditEventType::PolicyAccepted,
        format!("election {election_id}"),
        ip,
    ));
    Ok(())
}

#[post("/elections/<election_id>/nominations")]
async fn nominate(
    token: AuthToken<Voter>,
    election_id: Id,
    ip: Option<IpAddr>,
    store: &State<SharedStore>,
    audit: &State<AuditLog>,
) -> Result<Json<NominationReceipt>> {
    let store = store.inner().as_ref();
    let now = Utc::now();
    let (election, student) = election_of_member(store, token.id(), election_id).await?;
    if !election.schedule.nomination_open_at(now) {
        return Err(Error::BadRequest(format!(
            "Nominations for election {election_id} are not open"
        )));
    }

    let nomination = Nomination::new(election_id, student.id, student.name, now);
    if !store.insert_nomination(&nomination).await? {
        return Err(Error::Conflict(format!(
            "Already nominated for election {election_id}"
        )));
    }
    audit.emit(student_event(
        &token,
        AuditEventType::NominationSubmitted,
        format!("nomination {} in election {election_id}", nomination.id),
        ip,
    ));

    Ok(Json(NominationReceipt {
        nomination_id: nomination.id,
        status: nomination.status,
    }))
}

#[post("/elections/<election_id>/token")]
async fn request_token(
    token: AuthToken<Voter>,
    election_id: Id,
    ip: Option<IpAddr>,
    store: &State<SharedStore>,
    hasher: &State<TokenHasher>,
    audit: &State<AuditLog>,
) -> Result<Json<TokenResponse>> {
    let outcome = issue_token(
        store.inner().as_ref(),
        hasher,
        token.id(),
        election_id,
        Utc::now(),
    )
    .await?;

    let response = match outcome {
        IssueOutcome::Issued(secret) => {
            audit.emit(student_event(
                &token,
                AuditEventType::TokenIssued,
                format!("election {election_id}"),
                ip,
            ));
            TokenResponse::Issued { token: secret }
        }
        IssueOutcome::AlreadyVoted => TokenResponse::AlreadyVoted,
    };
    Ok(Json(response))
}

#[post("/elections/<election_id>/vote", data = "<ballot>", format = "json")]
async fn vote(
    token: AuthToken<Voter>,
    election_id: Id,
    ballot: Json<Vote>,
    ip: Option<IpAddr>,
    store: &State<SharedStore>,
    hasher: &State<TokenHasher>,
    audit: &State<AuditLog>,
) -> Result<Json<BallotReceipt>> {
    let ballot_id = cast_ballot(
        store.inner().as_ref(),
        hasher,
        audit,
        token.id(),
        ip,
        election_id,
        &ballot,
        Utc::now(),
    )
    .await?;
    Ok(Json(BallotReceipt { ballot_id }))
}
