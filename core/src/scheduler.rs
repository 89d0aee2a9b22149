//! Delayed-task schedulers for automatic state transitions
//!
//! Components never reach for a process-wide executor; the host passes a
//! [`Scheduler`] in, and owns its lifecycle.

use crossbeam_channel::{RecvTimeoutError, bounded};
use std::fmt;
use std::thread;
use std::time::Duration;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task once after a delay
pub trait Scheduler: Send + Sync + fmt::Debug {
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledTask;
}

/// Handle to a pending task; dropping it cancels the task
///
/// Cancellation is best effort: a task that already started keeps running,
/// so tasks must check for themselves whether they are still wanted.
#[must_use = "dropping a ScheduledTask cancels it"]
pub struct ScheduledTask {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl ScheduledTask {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle with nothing to cancel
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("pending", &self.cancel.is_some())
            .finish()
    }
}

/// One parked OS thread per pending task
///
/// The thread waits on a channel with a timeout; cancelling the handle
/// disconnects the channel and wakes the thread without running the task.
#[derive(Debug, Clone, Default)]
pub struct ThreadScheduler {
    thread_name: Option<String>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thread_name(name: impl Into<String>) -> Self {
        Self {
            thread_name: Some(name.into()),
        }
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledTask {
        let (cancel_tx, cancel_rx) = bounded::<()>(1);

        let mut builder = thread::Builder::new();
        if let Some(name) = &self.thread_name {
            builder = builder.name(name.clone());
        }

        let spawned = builder.spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(delay) {
                task();
            }
        });

        match spawned {
            Ok(_) => ScheduledTask::new(move || drop(cancel_tx)),
            Err(error) => {
                tracing::warn!(%error, "failed to spawn scheduler thread; task dropped");
                ScheduledTask::detached()
            }
        }
    }
}

/// Schedules onto a Tokio runtime
#[cfg(feature = "tokio")]
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

#[cfg(feature = "tokio")]
impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Scheduler for the runtime this is called from, if any
    pub fn try_current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

#[cfg(feature = "tokio")]
impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> ScheduledTask {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        ScheduledTask::new(move || join.abort())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_thread_scheduler_runs_task_after_delay() {
        let scheduler = ThreadScheduler::with_thread_name("test-scheduler");
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        let _handle = scheduler.schedule(
            Duration::from_millis(20),
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_thread_scheduler_cancel_prevents_run() {
        let scheduler = ThreadScheduler::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        let handle = scheduler.schedule(
            Duration::from_millis(50),
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();

        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[cfg(feature = "tokio")]
    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_runs_and_cancels() {
        let scheduler = TokioScheduler::try_current().expect("inside a runtime");
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        let keep = scheduler.schedule(
            Duration::from_secs(1),
            Box::new(move || {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let fired_clone = Arc::clone(&fired);
        let cancelled = scheduler.schedule(
            Duration::from_secs(1),
            Box::new(move || {
                fired_clone.fetch_add(10, Ordering::SeqCst);
            }),
        );
        drop(cancelled);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        drop(keep);
    }
}
