//! The anonymous voting core: token issuance, ballot casting and tallying.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use rocket::tokio::time::sleep;

use crate::error::Result;

mod candidate;
mod coordinator;
mod issuer;
mod results;

pub use candidate::validate_candidate;
pub use coordinator::{cast_ballot, Vote};
pub use issuer::{issue_token, IssueOutcome};
pub use results::{admin_results, public_results, tally, CandidateResult, ElectionResults};

/// How long to keep restarting a storage transaction that loses write conflicts.
///
/// The delay before each restart doubles from `first_delay` up to `max_delay`
/// and is jittered, so that requests queued behind the same record spread out
/// instead of colliding again. No attempt is started once `budget` has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub first_delay: Duration,
    pub max_delay: Duration,
    pub budget: Duration,
}

impl RetryPolicy {
    pub const fn new(first_delay: Duration, max_delay: Duration, budget: Duration) -> Self {
        Self {
            first_delay,
            max_delay,
            budget,
        }
    }

    /// A random pause in the upper half of `delay`.
    fn jittered(delay: Duration) -> Duration {
        let micros = delay.as_micros() as u64;
        Duration::from_micros(rand::thread_rng().gen_range(micros / 2..=micros))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(5),
            Duration::from_millis(500),
            Duration::from_secs(30),
        )
    }
}

/// Run `attempt` until it succeeds, fails with a non-transient error, or the
/// policy's time budget is spent. Each attempt starts a fresh transaction, so
/// it sees everything committed by whoever it conflicted with.
async fn with_retries<T, F, Fut>(what: &str, policy: RetryPolicy, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut delay = policy.first_delay;
    let mut attempts = 1;
    loop {
        match attempt().await {
            Err(e) if e.is_transient() && started.elapsed() < policy.budget => {
                let pause = RetryPolicy::jittered(delay);
                debug!("{what}: transaction conflict on attempt {attempts}, retrying in {pause:?}");
                sleep(pause).await;
                delay = (delay * 2).min(policy.max_delay);
                attempts += 1;
            }
            Err(e) if e.is_transient() => {
                warn!("{what}: gave up after {attempts} conflicting attempts");
                return Err(e);
            }
            result => return result,
        }
    }
}
