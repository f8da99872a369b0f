//! Best-effort notifications to students about their nominations.

use std::sync::Arc;

use aws_sdk_sns::{types::MessageAttributeValue, Client as SnsClient};

use crate::error::{Error, Result};
use crate::model::student::Student;

/// Something worth telling a student about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    NominationApproved { election: String },
    NominationRejected { election: String, reason: Option<String> },
    /// The nomination was still pending when voting opened.
    NominationAutoRejected { election: String },
}

impl Notification {
    pub fn subject(&self) -> String {
        match self {
            Self::NominationApproved { election } => format!("Nomination approved: {election}"),
            Self::NominationRejected { election, .. }
            | Self::NominationAutoRejected { election } => {
                format!("Nomination rejected: {election}")
            }
        }
    }

    pub fn message(&self, recipient: &Student) -> String {
        let body = match self {
            Self::NominationApproved { election } => {
                format!("Your nomination for {election} has been approved. You will appear on the ballot.")
            }
            Self::NominationRejected { election, reason } => match reason {
                Some(reason) => format!("Your nomination for {election} was rejected: {reason}"),
                None => format!("Your nomination for {election} was rejected."),
            },
            Self::NominationAutoRejected { election } => format!(
                "Your nomination for {election} was not reviewed before voting opened and has been rejected."
            ),
        };
        format!("Dear {},\n\n{body}", recipient.name)
    }
}

/// A channel that can deliver notifications to students.
#[rocket::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient: &Student, notification: &Notification) -> Result<()>;
}

pub type SharedNotifier = Arc<dyn Notifier>;

/// Deliver in the background. Failures are logged and otherwise ignored,
/// so they can never undo the change being announced.
pub fn deliver(notifier: SharedNotifier, recipient: Student, notification: Notification) {
    rocket::tokio::spawn(async move {
        if let Err(e) = notifier.notify(&recipient, &notification).await {
            warn!("Failed to notify student {}: {e}", recipient.id);
        }
    });
}

/// Publishes notifications to an SNS topic. The recipient address travels as
/// the `email` message attribute so topic subscriptions can filter on it.
pub struct SnsNotifier {
    client: SnsClient,
    topic_arn: String,
}

impl SnsNotifier {
    pub fn new(client: SnsClient, topic_arn: String) -> Self {
        Self { client, topic_arn }
    }
}

#[rocket::async_trait]
impl Notifier for SnsNotifier {
    async fn notify(&self, recipient: &Student, notification: &Notification) -> Result<()> {
        let address = MessageAttributeValue::builder()
            .data_type("String")
            .string_value(&recipient.email)
            .build()
            .map_err(|e| Error::Notification(e.to_string()))?;
        self.client
            .publish()
            .topic_arn(&self.topic_arn)
            .subject(notification.subject())
            .message(notification.message(recipient))
            .message_attributes("email", address)
            .send()
            .await
            .map_err(|e| Error::Notification(e.to_string()))?;
        debug!("Published notification for student {}", recipient.id);
        Ok(())
    }
}

/// Writes notifications to the log instead of delivering them.
/// Used when no SNS topic is configured.
pub struct LogNotifier;

#[rocket::async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipient: &Student, notification: &Notification) -> Result<()> {
        info!(
            "Notification for student {}: {}",
            recipient.id,
            notification.subject()
        );
        Ok(())
    }
}
