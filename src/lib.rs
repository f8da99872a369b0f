#[macro_use]
extern crate rocket;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use std::sync::Arc;

use rocket::{figment::Figment, Build, Rocket};

use crate::config::{ConfigFairing, DatabaseFairing, NotifierFairing};
use crate::lifecycle::LifecycleClockFairing;
use crate::logging::LoggerFairing;
use crate::model::audit::{AuditLog, AuditSink};
use crate::notify::SharedNotifier;
use crate::store::{SharedStore, VoteStore};

pub mod api;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod notify;
pub mod store;
pub mod voting;

#[cfg(test)]
mod testing;

/// The production server: MongoDB storage, SNS notifications (if configured)
/// and the periodic lifecycle clock.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .mount("/", api::routes())
        .attach(ConfigFairing)
        .attach(NotifierFairing)
        .attach(DatabaseFairing)
        .attach(LifecycleClockFairing::new())
        .attach(LoggerFairing)
}

/// A server over the given store and notifier, whose lifecycle clock only
/// runs when swept through the admin API.
pub fn rocket_for_store<S>(figment: Figment, store: Arc<S>, notifier: SharedNotifier) -> Rocket<Build>
where
    S: VoteStore + AuditSink + 'static,
{
    let audit = AuditLog::new(store.clone());
    rocket::custom(figment)
        .mount("/", api::routes())
        .manage(store as SharedStore)
        .manage(audit)
        .manage(notifier)
        .attach(ConfigFairing)
        .attach(LifecycleClockFairing::on_demand())
        .attach(LoggerFairing)
}
