use std::net::IpAddr;

use chrono::Utc;
use rocket::{serde::json::Json, Route, State};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    lifecycle::{LifecycleClock, SweepReport},
    model::{
        audit::{AuditEvent, AuditEventType, AuditLog, AuditOutcome},
        auth::{Admin, AuthToken, Rights},
        mongodb::{id_as_string, Id},
        nomination::{Nomination, NominationStatus},
    },
    notify::{self, Notification, SharedNotifier},
    store::{SharedStore, VoteStore},
};

pub fn routes() -> Vec<Route> {
    routes![approve_nomination, reject_nomination, sweep]
}

/// Optional body of a rejection.
#[derive(Debug, Default, Deserialize)]
pub struct Rejection {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NominationDecision {
    #[serde(with = "id_as_string")]
    pub nomination_id: Id,
    #[serde(with = "id_as_string")]
    pub candidate_id: Id,
    pub status: NominationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<Nomination> for NominationDecision {
    fn from(nomination: Nomination) -> Self {
        Self {
            nomination_id: nomination.id,
            candidate_id: nomination.candidate_id,
            status: nomination.status,
            reason: nomination.reason,
        }
    }
}

/// Decide a pending nomination, then tell the candidate and record who decided.
#[allow(clippy::too_many_arguments)]
async fn decide(
    token: &AuthToken<Admin>,
    nomination_id: Id,
    status: NominationStatus,
    reason: Option<String>,
    ip: Option<IpAddr>,
    store: &dyn VoteStore,
    notifier: &SharedNotifier,
    audit: &AuditLog,
) -> Result<Json<NominationDecision>> {
    let now = Utc::now();
    let nomination = store
        .nomination(nomination_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Nomination with ID '{nomination_id}'")))?;
    let election = store
        .election(nomination.election_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("Election with ID '{}'", nomination.election_id)))?;
    if election.schedule.voting_start() <= now {
        return Err(Error::Conflict(format!(
            "Voting has started in election {}, nominations can no longer be decided",
            election.id
        )));
    }

    let decided = store
        .decide_nomination(nomination_id, status, reason, now)
        .await?
        .ok_or_else(|| {
            Error::Conflict(format!("Nomination {nomination_id} has already been decided"))
        })?;

    let (event, notification) = match status {
        NominationStatus::Approved => (
            AuditEventType::NominationApproved,
            Notification::NominationApproved {
                election: election.name,
            },
        ),
        _ => (
            AuditEventType::NominationRejected,
            Notification::NominationRejected {
                election: election.name,
                reason: decided.reason.clone(),
            },
        ),
    };
    audit.emit(
        AuditEvent::by(
            token.id(),
            Rights::Admin,
            event,
            format!("nomination {nomination_id} in election {}", election.id),
            AuditOutcome::Success,
        )
        .from_ip(ip),
    );
    match store.student(decided.candidate_id).await {
        Ok(Some(candidate)) => notify::deliver(notifier.clone(), candidate, notification),
        Ok(None) => warn!("Candidate {} is not on any roster", decided.candidate_id),
        Err(e) => warn!("Could not look up candidate {}: {e}", decided.candidate_id),
    }

    Ok(Json(decided.into()))
}

#[post("/admin/nominations/<nomination_id>/approve")]
async fn approve_nomination(
    token: AuthToken<Admin>,
    nomination_id: Id,
    ip: Option<IpAddr>,
    store: &State<SharedStore>,
    notifier: &State<SharedNotifier>,
    audit: &State<AuditLog>,
) -> Result<Json<NominationDecision>> {
    decide(
        &token,
        nomination_id,
        NominationStatus::Approved,
        None,
        ip,
        store.inner().as_ref(),
        notifier,
        audit,
    )
    .await
}

#[post("/admin/nominations/<nomination_id>/reject", data = "<rejection>")]
async fn reject_nomination(
    token: AuthToken<Admin>,
    nomination_id: Id,
    rejection: Option<Json<Rejection>>,
    ip: Option<IpAddr>,
    store: &State<SharedStore>,
    notifier: &State<SharedNotifier>,
    audit: &State<AuditLog>,
) -> Result<Json<NominationDecision>> {
    let reason = rejection.and_then(|r| r.into_inner().reason);
    decide(
        &token,
        nomination_id,
        NominationStatus::Rejected,
        reason,
        ip,
        store.inner().as_ref(),
        notifier,
        audit,
    )
    .await
}

/// Run the lifecycle clock now rather than waiting for the next tick.
#[post("/admin/sweep")]
async fn sweep(_token: AuthToken<Admin>, clock: &State<LifecycleClock>) -> Json<SweepReport> {
    Json(clock.sweep(Utc::now()).await)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use rocket::{
        http::{ContentType, Status},
        local::asynchronous::Client,
        serde::json::{json, serde_json},
    };

    use super::*;
    use crate::model::{
        election::{Election, Schedule},
        student::Student,
    };
    use crate::store::MemoryStore;
    use crate::testing::Login;

    /// An election in its nomination phase with one pending nomination.
    async fn pending_nomination(store: &MemoryStore) -> Nomination {
        let now = Utc::now();
        let schedule = Schedule::new(
            now - Duration::hours(1),
            now + Duration::hours(1),
            now + Duration::hours(2),
            now + Duration::hours(3),
        )
        .unwrap();
        let election = Election::new(Id::new(), "CR election", schedule);
        store.put_election(election.clone()).await;
        let candidate = Student::new(election.class_id, "Ada", "ada@example.edu");
        store.put_student(candidate.clone()).await;
        let nomination = Nomination::new(election.id, candidate.id, candidate.name, now);
        store.put_nomination(nomination.clone()).await;
        nomination
    }

    #[backend_test(admin)]
    async fn approve_once(client: Client, store: MemoryStore, login: Login) {
        let nomination = pending_nomination(&store).await;

        let response = client
            .post(uri!(approve_nomination(nomination.id)))
            .cookie(login.cookie())
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        let decision: NominationDecision = response.into_json().await.unwrap();
        assert_eq!(decision.status, NominationStatus::Approved);
        assert!(store.is_approved(nomination.election_id, nomination.candidate_id).await.unwrap());

        let response = client
            .post(uri!(reject_nomination(nomination.id)))
            .cookie(login.cookie())
            .dispatch()
            .await;
        assert_eq!(Status::Conflict, response.status());
    }

    #[backend_test(admin)]
    async fn reject_with_reason(client: Client, store: MemoryStore, login: Login) {
        let nomination = pending_nomination(&store).await;

        let response = client
            .post(uri!(reject_nomination(nomination.id)))
            .cookie(login.cookie())
            .header(ContentType::JSON)
            .body(json!({"reason": "Missing statement"}).to_string())
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        let decided = store.nomination(nomination.id).await.unwrap().unwrap();
        assert_eq!(decided.status, NominationStatus::Rejected);
        assert_eq!(decided.reason.as_deref(), Some("Missing statement"));
    }

    #[backend_test(student)]
    async fn students_cannot_decide(client: Client, store: MemoryStore, login: Login) {
        let nomination = pending_nomination(&store).await;

        let response = client
            .post(uri!(approve_nomination(nomination.id)))
            .cookie(login.cookie())
            .dispatch()
            .await;
        assert_eq!(Status::Forbidden, response.status());
        let unchanged = store.nomination(nomination.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, NominationStatus::Pending);
    }

    #[backend_test(admin)]
    async fn sweep_on_demand(client: Client, store: MemoryStore, login: Login) {
        let nomination = pending_nomination(&store).await;

        let response = client
            .post(uri!(sweep))
            .cookie(login.cookie())
            .dispatch()
            .await;
        assert_eq!(Status::Ok, response.status());
        let report: serde_json::Value = response.into_json().await.unwrap();
        assert_eq!(report["activated"], 1);

        let election = store.election(nomination.election_id).await.unwrap().unwrap();
        assert!(election.active);
    }
}
