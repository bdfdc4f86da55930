//! Deferred and periodic background work that can be cancelled.
//!
//! Restart backoff, idle sweeps and reconnect grace periods all run through
//! [`ScheduledTask`]. The timers are tokio timers, so tests drive them with
//! `tokio::time::pause()` / `advance()`.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Handle to a scheduled task. Dropping the handle cancels the task.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Run `f` once, `delay` after this call.
    pub fn after<F, Fut>(delay: Duration, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            f().await;
        });
        Self { handle }
    }

    /// Run `f` every `period`, first run one period from now.
    ///
    /// Returning `false` from `f` ends the schedule.
    pub fn every<F, Fut>(period: Duration, mut f: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let start = Instant::now() + period;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if !f().await {
                    break;
                }
            }
        });
        Self { handle }
    }

    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_task_fires_after_delay() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let task = ScheduledTask::after(Duration::from_millis(250), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_millis(249)).await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        drop(task);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_counts_from_scheduling_not_first_poll() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let task = ScheduledTask::after(Duration::from_millis(100), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let periodic_hits = Arc::new(AtomicUsize::new(0));
        let periodic_counter = periodic_hits.clone();
        let periodic = ScheduledTask::every(Duration::from_millis(100), move || {
            let counter = periodic_counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });

        // Time passes before either spawned task gets polled.
        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(periodic_hits.load(Ordering::SeqCst), 1);
        drop((task, periodic));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_never_fires() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let task = ScheduledTask::after(Duration::from_millis(100), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_runs_each_period_until_it_declines() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _task = ScheduledTask::every(Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move { counter.fetch_add(1, Ordering::SeqCst) + 1 < 3 }
        });

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(10)).await;
            settle().await;
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
