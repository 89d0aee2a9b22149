//! Retry with pluggable backoff and an optional retry budget
//!
//! A [`RetryContext`] lives for one protected call. It counts attempts and
//! answers, after each outcome, whether and when to try again.

use crate::classifier::{
    Classification, ExceptionClassifier, FailureClassifier, FailureContext, ResultPredicate,
};
use crate::errors::{CallError, ConfigError};
use crate::events::{Event, EventPublisher};
use crate::interval::{IntervalFunction, check_interval};
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
#[cfg(feature = "tokio")]
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_WAIT_DURATION: Duration = Duration::from_millis(500);

/// Caps retries to a share of recent calls
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryBudgetConfig {
    /// Number of recent decisions remembered
    pub buffer_size: usize,
    /// Share in (0, 1] of remembered decisions that may be retries
    pub retry_threshold: f64,
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,
    pub interval_function: IntervalFunction,
    /// `Record` means retryable; anything else is returned to the caller at once
    pub error_classifier: Arc<dyn FailureClassifier>,
    /// Successful values matching this are retried
    pub retry_on_result: Option<ResultPredicate>,
    /// Surface `MaxRetriesExceeded` when attempts run out on a retried result
    pub fail_after_max_attempts: bool,
    pub budget: Option<RetryBudgetConfig>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval_function: IntervalFunction::fixed(DEFAULT_WAIT_DURATION),
            error_classifier: Arc::new(ExceptionClassifier::new()),
            retry_on_result: None,
            fail_after_max_attempts: false,
            budget: None,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder {
            config: Self::default(),
            classifier: None,
            wait: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::NotPositive {
                field: "max_attempts",
            });
        }
        if let Some(budget) = &self.budget {
            ConfigError::check_positive("buffer_size", budget.buffer_size)?;
            if !(budget.retry_threshold > 0.0 && budget.retry_threshold <= 1.0) {
                return Err(ConfigError::OutOfRange {
                    field: "retry_threshold",
                    value: budget.retry_threshold,
                    min: 0.0,
                    max: 1.0,
                });
            }
        }
        Ok(())
    }
}

/// Fluent builder for [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
    classifier: Option<ExceptionClassifier>,
    wait: Option<Duration>,
}

impl RetryConfigBuilder {
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Constant wait between attempts
    pub fn wait_duration(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn interval_function(mut self, interval: IntervalFunction) -> Self {
        self.wait = None;
        self.config.interval_function = interval;
        self
    }

    /// Retry only errors of type `E` matching `predicate`
    pub fn retry_on_error<E, F>(mut self, predicate: F) -> Self
    where
        E: 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let classifier = self.classifier.take().unwrap_or_default();
        self.classifier = Some(classifier.record_if(predicate));
        self
    }

    /// Never retry errors of type `E` matching `predicate`
    pub fn ignore_error<E, F>(mut self, predicate: F) -> Self
    where
        E: 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let classifier = self.classifier.take().unwrap_or_default();
        self.classifier = Some(classifier.ignore_if(predicate));
        self
    }

    /// Replace the error predicates with a custom classifier
    pub fn error_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.classifier = None;
        self.config.error_classifier = classifier;
        self
    }

    /// Retry successful values of type `T` matching `predicate`
    pub fn retry_on_result<T, F>(mut self, predicate: F) -> Self
    where
        T: 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.config.retry_on_result = Some(ResultPredicate::new(predicate));
        self
    }

    pub fn fail_after_max_attempts(mut self, fail: bool) -> Self {
        self.config.fail_after_max_attempts = fail;
        self
    }

    pub fn retry_budget(mut self, buffer_size: usize, retry_threshold: f64) -> Self {
        self.config.budget = Some(RetryBudgetConfig {
            buffer_size,
            retry_threshold,
        });
        self
    }

    pub fn build(self) -> Result<RetryConfig, ConfigError> {
        let mut config = self.config;
        if let Some(wait) = self.wait {
            check_interval(wait)?;
            config.interval_function = IntervalFunction::fixed(wait);
        }
        if let Some(classifier) = self.classifier {
            config.error_classifier = Arc::new(classifier);
        }
        config.validate()?;
        Ok(config)
    }
}

/// What to do after one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait, then try again
    RetryAfter(Duration),
    /// Return the outcome to the caller
    Done,
    /// The error is not retryable
    NotRetryable,
    MaxAttemptsExceeded,
    BudgetExceeded,
}

/// Events published by [`Retry`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A failed attempt will be retried after `wait`
    Retry {
        name: String,
        attempt: u32,
        wait: Duration,
    },
    /// Succeeded after at least one retry
    Success { name: String, attempts: u32 },
    /// Gave up after `attempts`
    Error { name: String, attempts: u32 },
    IgnoredError { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryEventKind {
    Retry,
    Success,
    Error,
    IgnoredError,
}

impl Event for RetryEvent {
    type Kind = RetryEventKind;

    fn kind(&self) -> RetryEventKind {
        match self {
            RetryEvent::Retry { .. } => RetryEventKind::Retry,
            RetryEvent::Success { .. } => RetryEventKind::Success,
            RetryEvent::Error { .. } => RetryEventKind::Error,
            RetryEvent::IgnoredError { .. } => RetryEventKind::IgnoredError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryMetrics {
    pub successful_calls_without_retry: u64,
    pub successful_calls_with_retry: u64,
    pub failed_calls_without_retry: u64,
    pub failed_calls_with_retry: u64,
}

/// Fixed-size ring of bits; set bits mark decisions that allowed a retry
#[derive(Debug)]
struct RingBits {
    bits: Vec<bool>,
    next: usize,
    ones: usize,
}

impl RingBits {
    fn new(size: usize) -> Self {
        Self {
            bits: vec![false; size.max(1)],
            next: 0,
            ones: 0,
        }
    }

    fn push(&mut self, bit: bool) {
        let slot = &mut self.bits[self.next];
        if *slot {
            self.ones -= 1;
        }
        *slot = bit;
        if bit {
            self.ones += 1;
        }
        self.next = (self.next + 1) % self.bits.len();
    }
}

#[derive(Debug)]
struct RetryBudget {
    config: RetryBudgetConfig,
    ring: Mutex<RingBits>,
}

impl RetryBudget {
    fn new(config: RetryBudgetConfig) -> Self {
        Self {
            ring: Mutex::new(RingBits::new(config.buffer_size)),
            config,
        }
    }

    /// Spend one retry if the share of retries stays under the threshold
    fn try_spend(&self) -> bool {
        let mut ring = self.ring.lock();
        let share = (ring.ones + 1) as f64 / ring.bits.len() as f64;
        let allowed = share < self.config.retry_threshold;
        ring.push(allowed);
        allowed
    }

    fn mark_done(&self) {
        self.ring.lock().push(false);
    }
}

#[derive(Debug, Default)]
struct Counters {
    success_without_retry: AtomicU64,
    success_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

struct Inner {
    name: String,
    config: RetryConfig,
    budget: Option<RetryBudget>,
    counters: Counters,
    events: EventPublisher<RetryEvent>,
}

/// Named retry policy
///
/// # Examples
///
/// ```rust
/// use resilience_machines::retry::{Retry, RetryConfig};
/// use std::time::Duration;
///
/// let retry = Retry::new(
///     "fetch",
///     RetryConfig::builder()
///         .max_attempts(3)
///         .wait_duration(Duration::from_millis(1))
///         .build()
///         .unwrap(),
/// )
/// .unwrap();
///
/// let mut calls = 0;
/// let value = retry
///     .call(|| {
///         calls += 1;
///         if calls < 3 { Err("flaky") } else { Ok(calls) }
///     })
///     .unwrap();
/// assert_eq!(value, 3);
/// ```
#[derive(Clone)]
pub struct Retry {
    inner: Arc<Inner>,
}

impl Retry {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_valid(name.into(), config))
    }

    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::from_valid(name.into(), RetryConfig::default())
    }

    fn from_valid(name: String, config: RetryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                budget: config.budget.map(RetryBudget::new),
                config,
                counters: Counters::default(),
                events: EventPublisher::new(name.clone()),
                name,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventPublisher<RetryEvent> {
        &self.inner.events
    }

    /// Start tracking one protected call
    pub fn context(&self) -> RetryContext<'_> {
        RetryContext {
            retry: self,
            attempts: 0,
        }
    }

    pub fn metrics(&self) -> RetryMetrics {
        let counters = &self.inner.counters;
        RetryMetrics {
            successful_calls_without_retry: counters.success_without_retry.load(Ordering::Relaxed),
            successful_calls_with_retry: counters.success_with_retry.load(Ordering::Relaxed),
            failed_calls_without_retry: counters.failed_without_retry.load(Ordering::Relaxed),
            failed_calls_with_retry: counters.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    /// Run `f` until it succeeds, blocking the thread between attempts
    pub fn call<T, E, F>(&self, mut f: F) -> Result<T, CallError<E>>
    where
        T: 'static,
        E: 'static,
        F: FnMut() -> Result<T, E>,
    {
        let mut ctx = self.context();
        loop {
            match ctx.settle(f())? {
                Settled::Done(value) => return Ok(value),
                Settled::Wait(wait) => std::thread::sleep(wait),
            }
        }
    }

    /// Run the future produced by `f` until it succeeds, sleeping on tokio between attempts
    #[cfg(feature = "tokio")]
    pub async fn call_async<T, E, F, Fut>(&self, mut f: F) -> Result<T, CallError<E>>
    where
        T: 'static,
        E: 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut ctx = self.context();
        loop {
            match ctx.settle(f().await)? {
                Settled::Done(value) => return Ok(value),
                Settled::Wait(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish()
    }
}

enum Settled<T> {
    Done(T),
    Wait(Duration),
}

/// Attempt bookkeeping for one protected call
#[derive(Debug)]
pub struct RetryContext<'a> {
    retry: &'a Retry,
    attempts: u32,
}

impl RetryContext<'_> {
    /// Failed attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The attempt succeeded and its value is final
    pub fn on_success(&mut self) {
        let inner = &self.retry.inner;
        if let Some(budget) = &inner.budget {
            budget.mark_done();
        }
        if self.attempts > 0 {
            inner.counters.success_with_retry.fetch_add(1, Ordering::Relaxed);
            inner.events.publish(RetryEvent::Success {
                name: inner.name.clone(),
                attempts: self.attempts,
            });
        } else {
            inner
                .counters
                .success_without_retry
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Decide after a failed attempt
    pub fn on_error(&mut self, error: &dyn Any) -> RetryDecision {
        let inner = &self.retry.inner;
        let ctx = FailureContext {
            name: &inner.name,
            error,
            duration: Duration::ZERO,
        };
        if inner.config.error_classifier.classify(&ctx) != Classification::Record {
            inner
                .counters
                .failed_without_retry
                .fetch_add(1, Ordering::Relaxed);
            inner.events.publish(RetryEvent::IgnoredError {
                name: inner.name.clone(),
            });
            return RetryDecision::NotRetryable;
        }

        let decision = self.next_attempt();
        if !matches!(decision, RetryDecision::RetryAfter(_)) {
            self.give_up();
        }
        decision
    }

    /// Decide after an attempt returned `value`
    ///
    /// Returns `Done` when the value is final; `on_success` has then been
    /// recorded already.
    pub fn on_result(&mut self, value: &dyn Any) -> RetryDecision {
        let retry_on_result = &self.retry.inner.config.retry_on_result;
        if !retry_on_result.as_ref().is_some_and(|p| p.test(value)) {
            self.on_success();
            return RetryDecision::Done;
        }

        match self.next_attempt() {
            RetryDecision::MaxAttemptsExceeded if self.retry.inner.config.fail_after_max_attempts => {
                self.give_up();
                RetryDecision::MaxAttemptsExceeded
            }
            RetryDecision::RetryAfter(wait) => RetryDecision::RetryAfter(wait),
            _ => {
                self.on_success();
                RetryDecision::Done
            }
        }
    }

    fn next_attempt(&mut self) -> RetryDecision {
        let inner = &self.retry.inner;
        self.attempts = self.attempts.saturating_add(1);
        if self.attempts >= inner.config.max_attempts {
            if let Some(budget) = &inner.budget {
                budget.mark_done();
            }
            return RetryDecision::MaxAttemptsExceeded;
        }
        if let Some(budget) = &inner.budget
            && !budget.try_spend()
        {
            tracing::debug!(retry = %inner.name, attempts = self.attempts, "retry budget exceeded");
            return RetryDecision::BudgetExceeded;
        }

        let wait = inner.config.interval_function.apply(self.attempts);
        tracing::debug!(retry = %inner.name, attempt = self.attempts, ?wait, "retrying");
        inner.events.publish(RetryEvent::Retry {
            name: inner.name.clone(),
            attempt: self.attempts,
            wait,
        });
        RetryDecision::RetryAfter(wait)
    }

    fn give_up(&self) {
        let inner = &self.retry.inner;
        let counter = if self.attempts > 1 {
            &inner.counters.failed_with_retry
        } else {
            &inner.counters.failed_without_retry
        };
        counter.fetch_add(1, Ordering::Relaxed);
        inner.events.publish(RetryEvent::Error {
            name: inner.name.clone(),
            attempts: self.attempts,
        });
    }

    /// Turn one attempt's outcome into the next step of a call loop
    fn settle<T: 'static, E: 'static>(
        &mut self,
        outcome: Result<T, E>,
    ) -> Result<Settled<T>, CallError<E>> {
        match outcome {
            Ok(value) => match self.on_result(&value) {
                RetryDecision::RetryAfter(wait) => Ok(Settled::Wait(wait)),
                RetryDecision::MaxAttemptsExceeded => Err(CallError::MaxRetriesExceeded {
                    name: self.retry.name().to_string(),
                    attempts: self.attempts,
                    last: None,
                }),
                _ => Ok(Settled::Done(value)),
            },
            Err(error) => match self.on_error(&error) {
                RetryDecision::RetryAfter(wait) => Ok(Settled::Wait(wait)),
                RetryDecision::MaxAttemptsExceeded => Err(CallError::MaxRetriesExceeded {
                    name: self.retry.name().to_string(),
                    attempts: self.attempts,
                    last: Some(error),
                }),
                RetryDecision::BudgetExceeded => Err(CallError::RetryBudgetExceeded {
                    name: self.retry.name().to_string(),
                    attempts: self.attempts,
                    last: Some(error),
                }),
                RetryDecision::NotRetryable | RetryDecision::Done => Err(CallError::Execution(error)),
            },
        }
    }
}
