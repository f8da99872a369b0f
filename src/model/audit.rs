use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::{auth::Rights, mongodb::Id};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    PolicyAccepted,
    NominationSubmitted,
    NominationApproved,
    NominationRejected,
    NominationAutoRejected,
    TokenIssued,
    VoteCast,
    TokenUsed,
    VoteFailed,
    ElectionActivated,
    ElectionClosed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// One entry of the audit trail.
///
/// Events about casting a ballot are recorded with no actor at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(rename = "_id")]
    pub id: Id,
    /// `None` for anonymous and system events.
    pub actor_id: Option<Id>,
    pub role: Option<Rights>,
    pub ip: Option<String>,
    pub event: AuditEventType,
    pub details: String,
    pub outcome: AuditOutcome,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    fn new(
        actor_id: Option<Id>,
        role: Option<Rights>,
        event: AuditEventType,
        details: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            id: Id::new(),
            actor_id,
            role,
            ip: None,
            event,
            details: details.into(),
            outcome,
            at: Utc::now(),
        }
    }

    /// An event performed by an identified user.
    pub fn by(
        actor_id: Id,
        role: Rights,
        event: AuditEventType,
        details: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self::new(Some(actor_id), Some(role), event, details, outcome)
    }

    /// A successful event with no recorded actor: either anonymous by
    /// design, or performed by the lifecycle clock.
    pub fn anonymous(event: AuditEventType, details: impl Into<String>) -> Self {
        Self::new(None, None, event, details, AuditOutcome::Success)
    }

    pub fn from_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.ip = ip.map(|ip| ip.to_string());
        self
    }
}

/// Somewhere to durably record audit events.
#[rocket::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Fire-and-forget front end to an [`AuditSink`]: recording never blocks
/// or fails the operation being audited.
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, event: AuditEvent) {
        let sink = self.sink.clone();
        rocket::tokio::spawn(async move {
            if let Err(e) = sink.record(&event).await {
                warn!("Failed to record audit event {:?}: {e}", event.event);
            }
        });
    }
}
