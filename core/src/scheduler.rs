/// Poll scheduler: a cancellable repeating task.
///
/// Every tick is spawned on its own so a slow pass never delays the timer;
/// overlap is resolved by the callee (the in-flight guard), not queued here.
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

pub struct PollScheduler {
    period: Duration,
    handle: JoinHandle<()>,
}

impl PollScheduler {
    /// Start ticking after one full `period`; the caller does the initial load itself.
    pub fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                tokio::spawn(tick());
            }
        });
        debug!("poll scheduler started ({:?})", period);
        Self { period, handle }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop future ticks. Ticks already running finish on their own.
    pub fn stop(&self) {
        if !self.handle.is_finished() {
            self.handle.abort();
            debug!("poll scheduler stopped");
        }
    }
}

impl Drop for PollScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
