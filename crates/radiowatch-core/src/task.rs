//! Single-instance delayed-task primitive backing the engine tick loops.
//!
//! Each engine runs one logical periodic task.  [`TickTask`] owns that
//! task's [`JoinHandle`] plus a `watch`-channel shutdown signal; the task
//! body is expected to `tokio::select!` between its timer and the shutdown
//! receiver.  [`TickTask::cancel_sync`] sends the signal and awaits the
//! handle: a pending delay is abandoned promptly, a tick body already in
//! flight runs to completion, and no later instance starts.

use std::future::Future;
use std::sync::Mutex;

use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct Running {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Handle to an engine's single periodic task.
#[derive(Debug, Default)]
pub(crate) struct TickTask {
    running: Mutex<Option<Running>>,
}

impl TickTask {
    pub(crate) fn new() -> Self {
        Self {
            running: Mutex::new(None),
        }
    }

    /// Spawn the task body, handing it the shutdown receiver to select on.
    ///
    /// Replacing a live task drops its shutdown sender, which the old body
    /// observes as a closed channel and exits.
    pub(crate) fn spawn<F, Fut>(&self, body: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(body(rx));
        *self.running.lock().unwrap() = Some(Running { shutdown, handle });
    }

    /// Spawn the body only when no live instance exists; the check and the
    /// spawn are atomic with respect to other callers.  Returns whether a
    /// new task was spawned.
    pub(crate) fn spawn_if_idle<F, Fut>(&self, body: F) -> bool
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock().unwrap();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(body(rx));
        *running = Some(Running { shutdown, handle });
        true
    }

    /// Whether a task instance is live (spawned and not yet finished).
    pub(crate) fn is_scheduled(&self) -> bool {
        self.running
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Signal shutdown and wait for the current instance to complete.
    ///
    /// Idempotent: a second call (or a call with no task spawned) returns
    /// immediately.
    pub(crate) async fn cancel_sync(&self) {
        let running = self.running.lock().unwrap().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            let _ = running.handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn cancel_sync_stops_a_periodic_body() {
        let task = TickTask::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);

        task.spawn(move |mut shutdown| async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_millis(10)) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });
        assert!(task.is_scheduled());

        tokio::time::sleep(Duration::from_millis(55)).await;
        task.cancel_sync().await;
        let at_cancel = ticks.load(Ordering::SeqCst);
        assert!(at_cancel >= 5, "expected several ticks, got {at_cancel}");
        assert!(!task.is_scheduled());

        // No later instance may run after cancel_sync returns.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), at_cancel);
    }

    #[tokio::test]
    async fn cancel_sync_without_spawn_is_a_no_op() {
        let task = TickTask::new();
        assert!(!task.is_scheduled());
        task.cancel_sync().await;
        task.cancel_sync().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_sync_drains_a_running_body() {
        let task = TickTask::new();
        let done = Arc::new(AtomicU64::new(0));
        let flag = Arc::clone(&done);

        task.spawn(move |mut shutdown| async move {
            // Body that takes a while after its timer fires.
            tokio::time::sleep(Duration::from_millis(5)).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(1, Ordering::SeqCst);
            let _ = shutdown.changed().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        task.cancel_sync().await;
        assert_eq!(done.load(Ordering::SeqCst), 1, "in-flight body must drain");
    }
}
