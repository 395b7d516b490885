//! Scheduled background tasks with explicit cancellation
//!
//! Every periodic loop in the server runs through this handle so that
//! dropping the owner also stops its timers.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;

/// Handle to a periodic background task. Aborts the task on drop.
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Runs `tick` every `period` until the handle is cancelled or dropped.
    pub fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut timer = interval(period);
            // The first tick of tokio's interval fires immediately; skip it
            // so `period` elapses before the first real tick.
            timer.tick().await;
            loop {
                timer.tick().await;
                tick().await;
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

    #[tokio::test]
    async fn test_task_ticks_and_stops_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let task = ScheduledTask::spawn(Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(55)).await;
        drop(task);
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least 2 ticks, saw {}", seen);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen, "task kept ticking after drop");
    }

    #[tokio::test]
    async fn test_cancel_stops_ticks_without_dropping_handle() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let task = ScheduledTask::spawn(Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(35)).await;
        task.cancel();
        let seen = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen, "task kept ticking after cancel");
    }
}
