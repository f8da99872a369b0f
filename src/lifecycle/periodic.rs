use std::future::Future;

use rocket::tokio::{
    self,
    task::JoinHandle,
    time::{Duration, MissedTickBehavior},
};

/// A job run in the background at a fixed period until cancelled.
/// The first run happens immediately.
pub struct PeriodicTask {
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn new<F, Fut>(period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            // A slow run pushes the schedule back rather than causing a burst.
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                job().await;
            }
        });
        Self { handle }
    }

    /// Stop the task. A run in progress is abandoned at its next await point.
    pub async fn cancel(self) {
        self.handle.abort();
        if let Err(e) = self.handle.await {
            if !e.is_cancelled() {
                error!("Periodic task ended abnormally: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[rocket::async_test]
    async fn runs_repeatedly_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let task = PeriodicTask::new(Duration::from_millis(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        task.cancel().await;
        let after_cancel = runs.load(Ordering::SeqCst);
        assert!(after_cancel >= 2, "only ran {after_cancel} times");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_cancel);
    }
}
