use std::sync::Arc;

use aws_config::{BehaviorVersion, SdkConfig};
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_sdk_sns::{
    config::{Credentials, Region},
    Client as SnsClient,
};
use chrono::Duration;
use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::Deserialize;

use crate::model::{audit::AuditLog, mongodb::ensure_indexes_exist, token::TokenHasher};
use crate::notify::{LogNotifier, SharedNotifier, SnsNotifier};
use crate::store::{MongoStore, SharedStore};

/// Seconds between lifecycle sweeps when `sweep_interval` is not configured.
const DEFAULT_SWEEP_INTERVAL: u32 = 60;

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Deserialize)]
pub struct Config {
    // non-secrets
    auth_ttl: u32,
    #[serde(default = "default_sweep_interval")]
    sweep_interval: u32,
    // secrets
    jwt_secret: String,
    token_secret: String,
}

fn default_sweep_interval() -> u32 {
    DEFAULT_SWEEP_INTERVAL
}

impl Config {
    /// Valid lifetime of auth token cookies in seconds.
    pub fn auth_ttl(&self) -> Duration {
        Duration::seconds(self.auth_ttl.into())
    }

    /// Time between lifecycle clock sweeps.
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval.max(1).into())
    }

    /// Secret key used to sign and verify JWTs.
    pub fn jwt_secret(&self) -> &[u8] {
        self.jwt_secret.as_bytes()
    }

    /// Secret key under which voting token hashes are computed.
    pub fn token_secret(&self) -> &[u8] {
        self.token_secret.as_bytes()
    }
}

/// A fairing that loads the application config and puts it in managed state,
/// together with the [`TokenHasher`] keyed from it.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        // Manage the state.
        let hasher = TokenHasher::new(config.token_secret());
        rocket = rocket.manage(config).manage(hasher);
        Ok(rocket)
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
struct DbConfig {
    // secrets
    db_uri: String,
}

/// A fairing that loads the MongoDB config, connects to the database,
/// ensures its indexes exist, and places the resulting [`SharedStore`] and
/// an [`AuditLog`] writing to the same database into managed state.
pub struct DatabaseFairing;

#[rocket::async_trait]
impl Fairing for DatabaseFairing {
    fn info(&self) -> Info {
        Info {
            name: "MongoDB",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<DbConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load database config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        info!("Loaded database config, connecting...");
        // Construct the connection.
        let client = match MongoClient::with_uri_str(config.db_uri).await {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to connect to database: {e}");
                return Err(rocket);
            }
        };
        let db = client.database(&get_database_name());

        // Ensure the required indexes exist.
        if let Err(e) = ensure_indexes_exist(&db).await {
            error!("Failed to set up database indexes: {e}");
            return Err(rocket);
        }
        info!("...database connection online!");

        // Manage the state.
        let store = Arc::new(MongoStore::new(client, db));
        let audit = AuditLog::new(store.clone());
        rocket = rocket.manage(store as SharedStore).manage(audit);
        Ok(rocket)
    }
}

/// Get the name of the database to use (production version).
#[cfg(not(test))]
pub(crate) fn get_database_name() -> String {
    "class_rep".to_string()
}

/// Get the name of the database to use (test version).
/// Use a random name to avoid collisions between tests.
#[cfg(test)]
pub(crate) fn get_database_name() -> String {
    let random: u32 = rand::random();
    let db = format!("test{random}");
    info!("Using database {db}");
    db
}

/// Configuration for the AWS connection.
#[derive(Deserialize)]
struct AwsConfig {
    // non-secrets
    aws_region: String,
    aws_access_key_id: String,
    sns_topic_arn: Option<String>,
    // secrets
    aws_secret_access_key: String,
}

/// A fairing that places a [`SharedNotifier`] into managed state: an SNS
/// publisher if AWS and a topic are configured, otherwise a notifier that
/// only logs.
pub struct NotifierFairing;

#[rocket::async_trait]
impl Fairing for NotifierFairing {
    fn info(&self) -> Info {
        Info {
            name: "Notifications",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let notifier: SharedNotifier = match rocket.figment().extract::<AwsConfig>() {
            Ok(AwsConfig {
                aws_region,
                aws_access_key_id,
                sns_topic_arn: Some(topic_arn),
                aws_secret_access_key,
            }) => {
                // Construct the connection.
                let aws_config = SdkConfig::builder()
                    .region(Region::new(aws_region))
                    .credentials_provider(SharedCredentialsProvider::new(Credentials::new(
                        aws_access_key_id,
                        aws_secret_access_key,
                        None,
                        None,
                        "rocket config",
                    )))
                    .behavior_version(BehaviorVersion::latest())
                    .build();
                info!("Loaded Amazon SNS config, publishing to {topic_arn}");
                Arc::new(SnsNotifier::new(SnsClient::new(&aws_config), topic_arn))
            }
            Ok(_) => {
                warn!("No `sns_topic_arn` configured, notifications will only be logged");
                Arc::new(LogNotifier)
            }
            Err(e) => {
                warn!("No AWS config ({e}), notifications will only be logged");
                Arc::new(LogNotifier)
            }
        };

        // Manage the state.
        Ok(rocket.manage(notifier))
    }
}
