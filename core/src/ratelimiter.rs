//! Rate limiter over a `governor` token bucket
//!
//! `limit_for_period` permits are available per `limit_refresh_period`. The
//! bucket refills continuously (one permit every `refresh / limit`) and holds
//! at most `limit_for_period` permits.

use crate::errors::{CallError, ConfigError, Rejection};
use crate::events::{Event, EventPublisher};
use governor::clock::{Clock as _, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota};
use parking_lot::RwLock;
use std::fmt;
#[cfg(feature = "tokio")]
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

pub const DEFAULT_LIMIT_FOR_PERIOD: u32 = 50;
pub const DEFAULT_LIMIT_REFRESH_PERIOD: Duration = Duration::from_millis(500);
pub const DEFAULT_TIMEOUT_DURATION: Duration = Duration::from_secs(5);

/// Floor for a blocking wait when governor reports a permit is due now
const MIN_WAIT: Duration = Duration::from_micros(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub limit_for_period: u32,
    /// At least 1ms
    pub limit_refresh_period: Duration,
    /// Longest wait for a permission; zero never waits
    pub timeout_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_for_period: DEFAULT_LIMIT_FOR_PERIOD,
            limit_refresh_period: DEFAULT_LIMIT_REFRESH_PERIOD,
            timeout_duration: DEFAULT_TIMEOUT_DURATION,
        }
    }
}

impl RateLimiterConfig {
    pub fn builder() -> RateLimiterConfigBuilder {
        RateLimiterConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.quota().map(|_| ())
    }

    fn quota(&self) -> Result<Quota, ConfigError> {
        let limit = NonZeroU32::new(self.limit_for_period).ok_or(ConfigError::NotPositive {
            field: "limit_for_period",
        })?;
        if self.limit_refresh_period < Duration::from_millis(1) {
            return Err(ConfigError::invalid(
                "limit_refresh_period",
                format!("must be at least 1ms, got {:?}", self.limit_refresh_period),
            ));
        }
        let quota = Quota::with_period(self.limit_refresh_period / limit.get()).ok_or_else(|| {
            ConfigError::invalid(
                "limit_refresh_period",
                "too short to spread over limit_for_period permits",
            )
        })?;
        Ok(quota.allow_burst(limit))
    }
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfigBuilder {
    config: RateLimiterConfig,
}

impl RateLimiterConfigBuilder {
    pub fn limit_for_period(mut self, limit: u32) -> Self {
        self.config.limit_for_period = limit;
        self
    }

    pub fn limit_refresh_period(mut self, period: Duration) -> Self {
        self.config.limit_refresh_period = period;
        self
    }

    pub fn timeout_duration(mut self, timeout: Duration) -> Self {
        self.config.timeout_duration = timeout;
        self
    }

    pub fn build(self) -> Result<RateLimiterConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Events published by [`RateLimiter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimiterEvent {
    /// A permission was granted
    Success { name: String },
    /// No permission within the timeout
    Failure { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimiterEventKind {
    Success,
    Failure,
}

impl Event for RateLimiterEvent {
    type Kind = RateLimiterEventKind;

    fn kind(&self) -> RateLimiterEventKind {
        match self {
            RateLimiterEvent::Success { .. } => RateLimiterEventKind::Success,
            RateLimiterEvent::Failure { .. } => RateLimiterEventKind::Failure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterMetrics {
    pub limit_for_period: u32,
    pub number_of_waiting_threads: usize,
    pub number_of_permitted_calls: u64,
    pub number_of_rejected_calls: u64,
}

struct Inner {
    name: String,
    config: RwLock<RateLimiterConfig>,
    limiter: RwLock<Arc<DefaultDirectRateLimiter>>,
    waiting: AtomicUsize,
    permitted: AtomicU64,
    rejected: AtomicU64,
    events: EventPublisher<RateLimiterEvent>,
}

/// Named rate limiter; cloning shares the bucket
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Result<Self, ConfigError> {
        let quota = config.quota()?;
        let name = name.into();
        Ok(Self {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                limiter: RwLock::new(Arc::new(governor::RateLimiter::direct(quota))),
                waiting: AtomicUsize::new(0),
                permitted: AtomicU64::new(0),
                rejected: AtomicU64::new(0),
                events: EventPublisher::new(name.clone()),
                name,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> RateLimiterConfig {
        *self.inner.config.read()
    }

    pub fn events(&self) -> &EventPublisher<RateLimiterEvent> {
        &self.inner.events
    }

    /// Take a permission if one is available right now
    pub fn try_acquire_permission(&self) -> bool {
        let permitted = self.limiter().check().is_ok();
        self.record(permitted);
        permitted
    }

    /// Take a permission, blocking up to `timeout_duration`
    pub fn acquire_permission(&self) -> Result<(), Rejection> {
        let limiter = self.limiter();
        let timeout = self.inner.config.read().timeout_duration;

        let permitted = limiter.check().is_ok() || {
            let _waiting = Waiting::enter(&self.inner.waiting);
            let clock = DefaultClock::default();
            let deadline = Instant::now() + timeout;
            loop {
                let not_until = match limiter.check() {
                    Ok(()) => break true,
                    Err(not_until) => not_until,
                };
                let now = Instant::now();
                if now >= deadline {
                    break false;
                }
                // Another waiter may take the permit first; check again after waking
                let wait = not_until.wait_time_from(clock.now()).max(MIN_WAIT);
                std::thread::sleep(wait.min(deadline - now));
            }
        };

        self.record(permitted);
        if permitted {
            Ok(())
        } else {
            Err(self.rejection())
        }
    }

    /// Wait for a permission on the runtime, up to `timeout_duration`
    #[cfg(feature = "tokio")]
    pub async fn acquire_permission_async(&self) -> Result<(), Rejection> {
        let limiter = self.limiter();
        let timeout = self.inner.config.read().timeout_duration;

        let permitted = limiter.check().is_ok() || {
            let _waiting = Waiting::enter(&self.inner.waiting);
            tokio::time::timeout(timeout, limiter.until_ready())
                .await
                .is_ok()
        };

        self.record(permitted);
        if permitted {
            Ok(())
        } else {
            Err(self.rejection())
        }
    }

    /// Replace the limit; permits already handed out this period are forgotten
    pub fn change_limit_for_period(&self, limit: u32) -> Result<(), ConfigError> {
        let mut config = self.inner.config.write();
        let next = RateLimiterConfig {
            limit_for_period: limit,
            ..*config
        };
        let quota = next.quota()?;
        *self.inner.limiter.write() = Arc::new(governor::RateLimiter::direct(quota));
        *config = next;
        tracing::debug!(rate_limiter = %self.inner.name, limit, "limit for period changed");
        Ok(())
    }

    /// Affects waits that start after the change
    pub fn change_timeout_duration(&self, timeout: Duration) {
        self.inner.config.write().timeout_duration = timeout;
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        RateLimiterMetrics {
            limit_for_period: self.inner.config.read().limit_for_period,
            number_of_waiting_threads: self.inner.waiting.load(Ordering::SeqCst),
            number_of_permitted_calls: self.inner.permitted.load(Ordering::Relaxed),
            number_of_rejected_calls: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    /// Run `f` once a permission is granted
    pub fn call<T, E, F>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.acquire_permission()?;
        f().map_err(CallError::Execution)
    }

    /// Run the future once a permission is granted, waiting on the runtime
    #[cfg(feature = "tokio")]
    pub async fn call_async<T, E, F, Fut>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.acquire_permission_async().await?;
        f().await.map_err(CallError::Execution)
    }

    fn limiter(&self) -> Arc<DefaultDirectRateLimiter> {
        Arc::clone(&self.inner.limiter.read())
    }

    fn record(&self, permitted: bool) {
        let name = self.inner.name.clone();
        if permitted {
            self.inner.permitted.fetch_add(1, Ordering::Relaxed);
            self.inner.events.publish(RateLimiterEvent::Success { name });
        } else {
            self.inner.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(rate_limiter = %self.inner.name, "permission not granted");
            self.inner.events.publish(RateLimiterEvent::Failure { name });
        }
    }

    fn rejection(&self) -> Rejection {
        Rejection::RequestNotPermitted {
            name: self.inner.name.clone(),
        }
    }
}

/// Counts a waiter until dropped, including when an async wait is cancelled
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.inner.name)
            .field("config", &self.config())
            .finish()
    }
}
