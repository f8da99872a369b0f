//! The election lifecycle clock: a background sweep that moves elections
//! through their phases as their scheduled times pass.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rocket::{
    fairing::{Fairing, Info, Kind},
    tokio::sync::Mutex,
    Build, Orbit, Rocket,
};
use serde::Serialize;

use crate::config::Config;
use crate::error::Result;
use crate::model::{
    audit::{AuditEvent, AuditEventType, AuditLog},
    election::Election,
    eligibility::EligibilityRecord,
    token::{TokenHasher, VotingToken},
};
use crate::notify::{self, Notification, SharedNotifier};
use crate::store::{Enrolment, SharedStore};

mod periodic;

pub use periodic::PeriodicTask;

/// Reason given to candidates still pending when voting opens.
const AUTO_REJECT_REASON: &str = "Not reviewed before voting opened";

/// What a single sweep did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Pending nominations rejected because voting had started.
    pub rejected: u64,
    /// Elections closed and published.
    pub closed: u64,
    /// Unused tokens expired at closure.
    pub expired: u64,
    /// Elections activated, with their electorate enrolled.
    pub activated: u64,
    /// Elections whose sweep failed and will be retried next time.
    pub failed: u64,
}

/// Drives time-based election transitions.
///
/// Every step is conditional on the state it expects, so running a sweep
/// twice for the same instant changes nothing the second time.
#[derive(Clone)]
pub struct LifecycleClock {
    store: SharedStore,
    notifier: SharedNotifier,
    audit: AuditLog,
    hasher: TokenHasher,
}

impl LifecycleClock {
    pub fn new(
        store: SharedStore,
        notifier: SharedNotifier,
        audit: AuditLog,
        hasher: TokenHasher,
    ) -> Self {
        Self {
            store,
            notifier,
            audit,
            hasher,
        }
    }

    /// Run every due transition as of `now`. Failures are logged per election
    /// and never stop the rest of the sweep.
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let elections = match self.store.unpublished_elections().await {
            Ok(elections) => elections,
            Err(e) => {
                error!("Lifecycle sweep could not list elections: {e}");
                report.failed += 1;
                return report;
            }
        };

        for election in elections {
            if let Err(e) = self.sweep_election(&election, now, &mut report).await {
                error!("Lifecycle sweep failed for election {}: {e}", election.id);
                report.failed += 1;
            }
        }

        if report != SweepReport::default() {
            info!("Lifecycle sweep: {report:?}");
        } else {
            trace!("Lifecycle sweep had nothing to do");
        }
        report
    }

    async fn sweep_election(
        &self,
        election: &Election,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<()> {
        let schedule = &election.schedule;

        if schedule.voting_start() <= now {
            report.rejected += self.reject_pending(election, now).await?;
        }

        if schedule.voting_end() < now {
            // Expire before closing: a failure in between leaves the election
            // unpublished, so the next sweep finishes the job.
            report.expired += self.store.expire_unused_tokens(election.id, now).await?;
            if self.store.close_election(election.id).await? {
                report.closed += 1;
                info!("Closed election {}", election.id);
                self.audit.emit(AuditEvent::anonymous(
                    AuditEventType::ElectionClosed,
                    format!("election {}", election.id),
                ));
            }
            return Ok(());
        }

        if schedule.nomination_start() <= now
            && !election.active
            && self.activate(election, now).await?
        {
            report.activated += 1;
        }
        Ok(())
    }

    async fn reject_pending(&self, election: &Election, now: DateTime<Utc>) -> Result<u64> {
        let rejected = self
            .store
            .reject_pending_nominations(election.id, AUTO_REJECT_REASON, now)
            .await?;

        for nomination in &rejected {
            debug!(
                "Auto-rejected nomination {} in election {}",
                nomination.id, election.id
            );
            self.audit.emit(AuditEvent::anonymous(
                AuditEventType::NominationAutoRejected,
                format!("nomination {} in election {}", nomination.id, election.id),
            ));
            match self.store.student(nomination.candidate_id).await {
                Ok(Some(candidate)) => notify::deliver(
                    self.notifier.clone(),
                    candidate,
                    Notification::NominationAutoRejected {
                        election: election.name.clone(),
                    },
                ),
                Ok(None) => warn!("Candidate {} is not on any roster", nomination.candidate_id),
                Err(e) => warn!("Could not look up candidate {}: {e}", nomination.candidate_id),
            }
        }
        Ok(rejected.len() as u64)
    }

    async fn activate(&self, election: &Election, now: DateTime<Utc>) -> Result<bool> {
        if self
            .store
            .class_has_other_active_election(election.class_id, election.id)
            .await?
        {
            info!(
                "Not activating election {}: class {} already has an active election",
                election.id, election.class_id
            );
            return Ok(false);
        }

        // Tokens minted here are never shown to anyone; voters get a usable
        // secret by asking for one, which replaces this hash.
        let enrolments: Vec<Enrolment> = self
            .store
            .members_of(election.class_id)
            .await?
            .into_iter()
            .map(|student| {
                let (_, hash) = self.hasher.issue();
                (
                    EligibilityRecord::new(student.id, election.id),
                    VotingToken::new(student.id, election.id, hash, now),
                )
            })
            .collect();
        let electorate = enrolments.len();

        let activated = self.store.activate_election(election.id, enrolments).await?;
        if activated {
            info!(
                "Activated election {} with {electorate} eligible voters",
                election.id
            );
            self.audit.emit(AuditEvent::anonymous(
                AuditEventType::ElectionActivated,
                format!("election {}, {electorate} eligible voters", election.id),
            ));
        }
        Ok(activated)
    }
}

/// A fairing that places a [`LifecycleClock`] into managed state and, unless
/// created [on demand](Self::on_demand), runs it periodically from liftoff
/// until shutdown.
///
/// This fairing depends on the store, notifier, audit log and config being
/// available in managed state, and so must be attached after the fairings
/// responsible for those.
pub struct LifecycleClockFairing {
    periodic: bool,
    task: Mutex<Option<PeriodicTask>>,
}

impl LifecycleClockFairing {
    pub fn new() -> Self {
        Self {
            periodic: true,
            task: Mutex::new(None),
        }
    }

    /// Only sweep when asked to, e.g. through the admin API.
    pub fn on_demand() -> Self {
        Self {
            periodic: false,
            task: Mutex::new(None),
        }
    }
}

impl Default for LifecycleClockFairing {
    fn default() -> Self {
        Self::new()
    }
}

#[rocket::async_trait]
impl Fairing for LifecycleClockFairing {
    fn info(&self) -> Info {
        Info {
            name: "Election Lifecycle Clock",
            kind: Kind::Ignite | Kind::Liftoff | Kind::Shutdown,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let clock = match (
            rocket.state::<SharedStore>(),
            rocket.state::<SharedNotifier>(),
            rocket.state::<AuditLog>(),
            rocket.state::<TokenHasher>(),
        ) {
            (Some(store), Some(notifier), Some(audit), Some(hasher)) => LifecycleClock::new(
                store.clone(),
                notifier.clone(),
                audit.clone(),
                hasher.clone(),
            ),
            _ => {
                error!("Store, notifier, audit log or config unavailable for the lifecycle clock");
                return Err(rocket);
            }
        };
        Ok(rocket.manage(clock))
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        if !self.periodic {
            return;
        }
        let (Some(clock), Some(config)) =
            (rocket.state::<LifecycleClock>(), rocket.state::<Config>())
        else {
            error!("Lifecycle clock not in managed state, elections will not advance");
            return;
        };

        let clock = Arc::new(clock.clone());
        let period = config.sweep_interval();
        let task = PeriodicTask::new(period, move || {
            let clock = clock.clone();
            async move {
                clock.sweep(Utc::now()).await;
            }
        });
        info!("Lifecycle clock running every {}s", period.as_secs());
        *self.task.lock().await = Some(task);
    }

    async fn on_shutdown(&self, _rocket: &Rocket<Orbit>) {
        if let Some(task) = self.task.lock().await.take() {
            task.cancel().await;
            info!("Lifecycle clock stopped");
        }
    }
}
