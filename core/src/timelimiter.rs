//! Time limiter for async calls

use crate::errors::{CallError, ConfigError};
use crate::events::{Event, EventPublisher};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_DURATION: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLimiterConfig {
    pub timeout_duration: Duration,
    /// Drop the future on timeout; otherwise it keeps running as a detached task
    pub cancel_running_future: bool,
}

impl Default for TimeLimiterConfig {
    fn default() -> Self {
        Self {
            timeout_duration: DEFAULT_TIMEOUT_DURATION,
            cancel_running_future: true,
        }
    }
}

impl TimeLimiterConfig {
    pub fn builder() -> TimeLimiterConfigBuilder {
        TimeLimiterConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check_duration("timeout_duration", self.timeout_duration)
    }
}

#[derive(Debug, Clone)]
pub struct TimeLimiterConfigBuilder {
    config: TimeLimiterConfig,
}

impl TimeLimiterConfigBuilder {
    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.config.timeout_duration = timeout;
        self
    }

    pub fn cancel_running_future(mut self, cancel: bool) -> Self {
        self.config.cancel_running_future = cancel;
        self
    }

    pub fn build(self) -> Result<TimeLimiterConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeLimiterEvent {
    Success { name: String },
    Error { name: String },
    Timeout { name: String, after: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeLimiterEventKind {
    Success,
    Error,
    Timeout,
}

impl Event for TimeLimiterEvent {
    type Kind = TimeLimiterEventKind;

    fn kind(&self) -> TimeLimiterEventKind {
        match self {
            TimeLimiterEvent::Success { .. } => TimeLimiterEventKind::Success,
            TimeLimiterEvent::Error { .. } => TimeLimiterEventKind::Error,
            TimeLimiterEvent::Timeout { .. } => TimeLimiterEventKind::Timeout,
        }
    }
}

struct Inner {
    name: String,
    config: TimeLimiterConfig,
    events: EventPublisher<TimeLimiterEvent>,
}

/// Bounds how long a future may run
#[derive(Clone)]
pub struct TimeLimiter {
    inner: Arc<Inner>,
}

impl TimeLimiter {
    pub fn new(name: impl Into<String>, config: TimeLimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let name = name.into();
        Ok(Self {
            inner: Arc::new(Inner {
                events: EventPublisher::new(name.clone()),
                name,
                config,
            }),
        })
    }

    pub fn of_defaults(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(Inner {
                events: EventPublisher::new(name.clone()),
                name,
                config: TimeLimiterConfig::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &TimeLimiterConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventPublisher<TimeLimiterEvent> {
        &self.inner.events
    }

    /// Await the future for at most `timeout_duration`
    ///
    /// With `cancel_running_future` off the future runs on its own task and
    /// is left running when the timeout fires. A panic inside it is resumed
    /// on the caller.
    pub async fn call_async<T, E, F, Fut>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let timeout = self.inner.config.timeout_duration;
        let outcome = if self.inner.config.cancel_running_future {
            tokio::time::timeout(timeout, f()).await.ok()
        } else {
            let handle = tokio::spawn(f());
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(result)) => Some(result),
                Ok(Err(join)) if join.is_panic() => std::panic::resume_unwind(join.into_panic()),
                // Runtime shut down under the task
                Ok(Err(_)) => None,
                Err(_) => None,
            }
        };

        let name = self.inner.name.clone();
        match outcome {
            Some(Ok(value)) => {
                self.inner.events.publish(TimeLimiterEvent::Success { name });
                Ok(value)
            }
            Some(Err(err)) => {
                self.inner.events.publish(TimeLimiterEvent::Error { name });
                Err(CallError::Execution(err))
            }
            None => {
                tracing::debug!(time_limiter = %name, after = ?timeout, "call timed out");
                self.inner.events.publish(TimeLimiterEvent::Timeout {
                    name: name.clone(),
                    after: timeout,
                });
                Err(CallError::Timeout {
                    name,
                    after: timeout,
                })
            }
        }
    }
}

impl fmt::Debug for TimeLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeLimiter")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn limiter(timeout: Duration, cancel: bool) -> TimeLimiter {
        TimeLimiter::new(
            "slow-api",
            TimeLimiterConfig::builder()
                .timeout_duration(timeout)
                .cancel_running_future(cancel)
                .build()
                .unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        assert_eq!(
            TimeLimiterConfig::builder()
                .timeout_duration(Duration::ZERO)
                .build(),
            Err(ConfigError::NotPositive {
                field: "timeout_duration"
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_call_completes() {
        let limiter = limiter(Duration::from_secs(1), true);

        let value = limiter
            .call_async(|| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, String>(7)
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let limiter = limiter(Duration::from_secs(1), true);
        let timeouts = Arc::new(AtomicUsize::new(0));
        let timeouts_clone = Arc::clone(&timeouts);
        limiter
            .events()
            .subscribe_kind(TimeLimiterEventKind::Timeout, move |_| {
                timeouts_clone.fetch_add(1, Ordering::SeqCst);
            });

        let err = limiter
            .call_async(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, String>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CallError::Timeout { ref name, after } if name == "slow-api" && after == Duration::from_secs(1)
        ));
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_passes_through() {
        let limiter = limiter(Duration::from_secs(1), true);

        let err = limiter
            .call_async(|| async { Err::<(), _>("refused".to_string()) })
            .await
            .unwrap_err();

        assert_eq!(err.into_execution(), Some("refused".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_future_does_not_finish() {
        let limiter = limiter(Duration::from_millis(50), true);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        let _ = limiter
            .call_async(move || async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_future_keeps_running() {
        let limiter = limiter(Duration::from_millis(50), false);
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        let result = limiter
            .call_async(move || async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                flag.store(true, Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(CallError::Timeout { .. })));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(finished.load(Ordering::SeqCst));
    }
}
