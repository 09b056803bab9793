//! Cancellable timers
//!
//! Delayed and repeating tasks on the tokio runtime. They use tokio's clock,
//! so tests drive them with a paused runtime instead of real delays.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A delayed or repeating task that is aborted when cancelled or dropped
#[derive(Debug)]
pub struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Run `fut` once after `delay`
    pub fn after<F>(delay: Duration, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Run `tick` every `period`, first after one full period
    ///
    /// Ticks never overlap: a slow tick delays the next one.
    pub fn every<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Abort the task if it has not finished
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Release the task without aborting it
    ///
    /// Used when the task itself clears the slot that owns it.
    pub fn detach(mut self) {
        self.handle.take();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
