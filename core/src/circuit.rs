//! Circuit breaker implementation using state machines
//!
//! Legal transitions are enforced by the `Circuit` state machine. The
//! [`CircuitBreaker`] handle owns everything around it: the sliding window of
//! the current state, HALF_OPEN trial permits, the pending scheduled
//! transition, and event publishing.
//!
//! Each transition replaces the window, except entering OPEN, which keeps the
//! window that tripped it so its rates stay observable.

use crate::classifier::{Classification, FailureClassifier, FailureContext, ResultPredicate};
use crate::clock::{Clock, default_clock};
use crate::errors::{CallError, ConfigError, IllegalTransition, Rejection};
use crate::events::{Event, EventPublisher};
use crate::interval::IntervalFunction;
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::window::{Evaluation, Thresholds, WindowMetrics, WindowResult, WindowType};
use parking_lot::Mutex;
use state_machines::state_machine;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

pub const DEFAULT_FAILURE_RATE_THRESHOLD: f32 = 50.0;
pub const DEFAULT_SLOW_CALL_RATE_THRESHOLD: f32 = 100.0;
pub const DEFAULT_SLOW_CALL_DURATION_THRESHOLD: Duration = Duration::from_secs(60);
pub const DEFAULT_WAIT_DURATION_IN_OPEN_STATE: Duration = Duration::from_secs(60);
pub const DEFAULT_PERMITTED_CALLS_IN_HALF_OPEN_STATE: usize = 10;
pub const DEFAULT_MINIMUM_NUMBER_OF_CALLS: usize = 100;
pub const DEFAULT_SLIDING_WINDOW_SIZE: usize = 100;

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
    Disabled = 3,
    ForcedOpen = 4,
    MetricsOnly = 5,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
            CircuitState::Disabled => "DISABLED",
            CircuitState::ForcedOpen => "FORCED_OPEN",
            CircuitState::MetricsOnly => "METRICS_ONLY",
        }
    }

    /// States that admit every call without consulting the breaker
    fn admits_freely(self) -> bool {
        matches!(
            self,
            CircuitState::Closed | CircuitState::Disabled | CircuitState::MetricsOnly
        )
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            3 => CircuitState::Disabled,
            4 => CircuitState::ForcedOpen,
            5 => CircuitState::MetricsOnly,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure percentage in (0, 100] at which the circuit opens
    pub failure_rate_threshold: f32,

    /// Slow-call percentage in (0, 100] at which the circuit opens
    pub slow_call_rate_threshold: f32,

    /// Calls taking at least this long count as slow
    pub slow_call_duration_threshold: Duration,

    pub sliding_window_type: WindowType,

    /// Calls for a count window, seconds for a time window
    pub sliding_window_size: usize,

    /// Calls required before rates are evaluated (capped at the size of a count window)
    pub minimum_number_of_calls: usize,

    /// Trial calls admitted in HALF_OPEN, also the size of its window
    pub permitted_number_of_calls_in_half_open_state: usize,

    /// Wait in OPEN as a function of consecutive openings
    pub wait_interval_in_open_state: IntervalFunction,

    /// Jitter factor applied to the OPEN wait (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: wait * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,

    /// Schedule OPEN -> HALF_OPEN instead of waiting for the next permission request
    pub automatic_transition_from_open_to_half_open: bool,

    /// Longest stay in HALF_OPEN before reopening; zero waits for the trial calls
    pub max_wait_duration_in_half_open_state: Duration,

    pub failure_classifier: Arc<dyn FailureClassifier>,

    /// Successful results matching this predicate are recorded as failures
    pub record_result: Option<ResultPredicate>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: DEFAULT_FAILURE_RATE_THRESHOLD,
            slow_call_rate_threshold: DEFAULT_SLOW_CALL_RATE_THRESHOLD,
            slow_call_duration_threshold: DEFAULT_SLOW_CALL_DURATION_THRESHOLD,
            sliding_window_type: WindowType::CountBased,
            sliding_window_size: DEFAULT_SLIDING_WINDOW_SIZE,
            minimum_number_of_calls: DEFAULT_MINIMUM_NUMBER_OF_CALLS,
            permitted_number_of_calls_in_half_open_state:
                DEFAULT_PERMITTED_CALLS_IN_HALF_OPEN_STATE,
            wait_interval_in_open_state: IntervalFunction::fixed(
                DEFAULT_WAIT_DURATION_IN_OPEN_STATE,
            ),
            jitter_factor: 0.0,
            automatic_transition_from_open_to_half_open: false,
            max_wait_duration_in_half_open_state: Duration::ZERO,
            failure_classifier: crate::classifier::default_classifier(),
            record_result: None,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check_rate("failure_rate_threshold", self.failure_rate_threshold)?;
        ConfigError::check_rate("slow_call_rate_threshold", self.slow_call_rate_threshold)?;
        ConfigError::check_duration(
            "slow_call_duration_threshold",
            self.slow_call_duration_threshold,
        )?;
        ConfigError::check_positive("sliding_window_size", self.sliding_window_size)?;
        ConfigError::check_positive("minimum_number_of_calls", self.minimum_number_of_calls)?;
        ConfigError::check_positive(
            "permitted_number_of_calls_in_half_open_state",
            self.permitted_number_of_calls_in_half_open_state,
        )?;
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::OutOfRange {
                field: "jitter_factor",
                value: self.jitter_factor,
                min: 0.0,
                max: 1.0,
            });
        }
        Ok(())
    }

    fn thresholds(&self) -> Thresholds {
        Thresholds {
            failure_rate: self.failure_rate_threshold,
            slow_call_rate: self.slow_call_rate_threshold,
            slow_call_duration: self.slow_call_duration_threshold,
            minimum_calls: self.minimum_number_of_calls,
        }
    }
}

/// Context provided to fallback closures when a call is not permitted
#[derive(Debug, Clone)]
pub struct FallbackContext {
    /// Circuit name
    pub circuit_name: String,
    /// State that rejected the call
    pub state: CircuitState,
}

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub clock: Arc<dyn Clock>,
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self {
            name: String::new(),
            clock: default_clock(),
        }
    }
}

impl fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("clock", &self.clock)
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    /// Earliest time a permission request may move the circuit to HalfOpen
    pub retry_at: Duration,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub entered_at: Duration,
    pub permits_left: usize,
}

// Define the circuit breaker state machine with dynamic mode
state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,  // Enable dynamic mode for runtime state transitions

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
        Disabled,
        ForcedOpen,
        MetricsOnly,
    ],
    events {
        trip {
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [wait_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            transition: { from: HalfOpen, to: Closed }
        }
        open_manually {
            transition: { from: [Closed, HalfOpen, Disabled, ForcedOpen], to: Open }
        }
        half_open_manually {
            transition: { from: [Open, Disabled, ForcedOpen], to: HalfOpen }
        }
        close_manually {
            transition: { from: [Open, HalfOpen, Disabled, ForcedOpen, MetricsOnly], to: Closed }
        }
        force_open {
            transition: { from: [Closed, Open, HalfOpen, Disabled, MetricsOnly], to: ForcedOpen }
        }
        disable {
            transition: { from: [Closed, Open, HalfOpen, ForcedOpen, MetricsOnly], to: Disabled }
        }
        measure_only {
            transition: { from: [Closed, Open, HalfOpen, ForcedOpen, Disabled], to: MetricsOnly }
        }
    }
}

impl Circuit<Open> {
    /// Check if the wait in Open has elapsed
    fn wait_elapsed(&self, ctx: &CircuitContext) -> bool {
        self.state_data_open()
            .is_some_and(|data| ctx.clock.now() >= data.retry_at)
    }
}

/// Events published by a circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerEvent {
    Success { name: String, duration: Duration },
    Error { name: String, duration: Duration },
    IgnoredError { name: String, duration: Duration },
    NotPermitted { name: String },
    StateTransition {
        name: String,
        from: CircuitState,
        to: CircuitState,
    },
    Reset { name: String },
    FailureRateExceeded { name: String, failure_rate: f32 },
    SlowCallRateExceeded { name: String, slow_call_rate: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitBreakerEventKind {
    Success,
    Error,
    IgnoredError,
    NotPermitted,
    StateTransition,
    Reset,
    FailureRateExceeded,
    SlowCallRateExceeded,
}

impl Event for CircuitBreakerEvent {
    type Kind = CircuitBreakerEventKind;

    fn kind(&self) -> CircuitBreakerEventKind {
        match self {
            CircuitBreakerEvent::Success { .. } => CircuitBreakerEventKind::Success,
            CircuitBreakerEvent::Error { .. } => CircuitBreakerEventKind::Error,
            CircuitBreakerEvent::IgnoredError { .. } => CircuitBreakerEventKind::IgnoredError,
            CircuitBreakerEvent::NotPermitted { .. } => CircuitBreakerEventKind::NotPermitted,
            CircuitBreakerEvent::StateTransition { .. } => {
                CircuitBreakerEventKind::StateTransition
            }
            CircuitBreakerEvent::Reset { .. } => CircuitBreakerEventKind::Reset,
            CircuitBreakerEvent::FailureRateExceeded { .. } => {
                CircuitBreakerEventKind::FailureRateExceeded
            }
            CircuitBreakerEvent::SlowCallRateExceeded { .. } => {
                CircuitBreakerEventKind::SlowCallRateExceeded
            }
        }
    }
}

/// Point-in-time view of the current state's window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerMetrics {
    /// `NOT_ENOUGH_DATA` (-1) below the minimum number of calls
    pub failure_rate: f32,
    /// `NOT_ENOUGH_DATA` (-1) below the minimum number of calls
    pub slow_call_rate: f32,
    pub number_of_buffered_calls: u64,
    pub number_of_failed_calls: u64,
    pub number_of_successful_calls: u64,
    pub number_of_slow_calls: u64,
    pub number_of_slow_failed_calls: u64,
    pub number_of_slow_successful_calls: u64,
    /// Rejections since creation or the last reset
    pub number_of_not_permitted_calls: u64,
}

type PendingEvents = Vec<CircuitBreakerEvent>;

struct Core {
    machine: DynamicCircuit,
    state: CircuitState,
    metrics: WindowMetrics,
    /// Consecutive openings since the circuit last closed
    open_attempts: u32,
    /// Bumped on every transition; scheduled tasks carry the epoch they were armed in
    epoch: u64,
    pending: Option<ScheduledTask>,
}

struct Inner {
    context: CircuitContext,
    config: CircuitBreakerConfig,
    scheduler: Option<Arc<dyn Scheduler>>,
    core: Mutex<Core>,
    state: AtomicU8,
    not_permitted: AtomicU64,
    events: EventPublisher<CircuitBreakerEvent>,
}

/// Circuit breaker public API
///
/// Cloning is cheap and every clone shares the same state.
///
/// # Examples
///
/// ```rust
/// use resilience_machines::{CallError, CircuitBreaker, CircuitState};
///
/// let breaker = CircuitBreaker::builder("inventory")
///     .sliding_window_size(4)
///     .failure_rate_threshold(50.0)
///     .build()
///     .unwrap();
///
/// for _ in 0..2 {
///     let _ = breaker.call(|| Err::<(), _>("backend down"));
/// }
/// let _ = breaker.call(|| Ok::<_, &str>(()));
/// let _ = breaker.call(|| Ok::<_, &str>(()));
///
/// assert_eq!(breaker.state(), CircuitState::Open);
/// assert!(matches!(
///     breaker.call(|| Ok::<_, &str>(())),
///     Err(CallError::CallNotPermitted { .. })
/// ));
/// ```
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl CircuitBreaker {
    /// Create a circuit breaker with the real clock and no scheduler
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        Self::with_parts(name.into(), config, default_clock(), None)
    }

    /// Create a circuit breaker with default settings
    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::from_valid(
            name.into(),
            CircuitBreakerConfig::default(),
            default_clock(),
            None,
        )
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    pub(crate) fn with_parts(
        name: String,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let needs_timer = config.automatic_transition_from_open_to_half_open
            || !config.max_wait_duration_in_half_open_state.is_zero();
        let scheduler = match scheduler {
            None if needs_timer => {
                Some(Arc::new(crate::scheduler::ThreadScheduler::new()) as Arc<dyn Scheduler>)
            }
            other => other,
        };
        Ok(Self::from_valid(name, config, clock, scheduler))
    }

    fn from_valid(
        name: String,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        scheduler: Option<Arc<dyn Scheduler>>,
    ) -> Self {
        let context = CircuitContext {
            name: name.clone(),
            clock,
        };
        let metrics = window_for(&config, &context, CircuitState::Closed);
        let core = Core {
            machine: DynamicCircuit::new(context.clone()),
            state: CircuitState::Closed,
            metrics,
            open_attempts: 0,
            epoch: 0,
            pending: None,
        };

        Self {
            inner: Arc::new(Inner {
                context,
                config,
                scheduler,
                core: Mutex::new(core),
                state: AtomicU8::new(CircuitState::Closed as u8),
                not_permitted: AtomicU64::new(0),
                events: EventPublisher::new(name),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.context.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventPublisher<CircuitBreakerEvent> {
        &self.inner.events
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Ask for permission to run one call
    ///
    /// In OPEN, a request made after the wait has elapsed moves the circuit
    /// to HALF_OPEN and takes a trial permit. In HALF_OPEN, a request made
    /// after `max_wait_duration_in_half_open_state` trips the circuit back to
    /// OPEN. Every refusal is counted and published as `NotPermitted`.
    pub fn try_acquire_permission(&self) -> bool {
        if self.state().admits_freely() {
            return true;
        }

        let mut pending = PendingEvents::new();
        let permitted = {
            let mut core = self.inner.core.lock();
            self.inner.acquire_locked(&mut core, &mut pending)
        };
        if !permitted {
            self.inner.not_permitted.fetch_add(1, Ordering::Relaxed);
            pending.push(CircuitBreakerEvent::NotPermitted {
                name: self.name().to_string(),
            });
        }
        self.inner.publish(pending);
        permitted
    }

    /// Like `try_acquire_permission`, with the rejection as an error
    pub fn acquire_permission(&self) -> Result<(), Rejection> {
        if self.try_acquire_permission() {
            Ok(())
        } else {
            Err(Rejection::CallNotPermitted {
                name: self.name().to_string(),
                state: self.state(),
            })
        }
    }

    /// Return a permit that was acquired but never used
    ///
    /// Only HALF_OPEN permits are counted; elsewhere this is a no-op.
    pub fn release_permission(&self) {
        let mut core = self.inner.core.lock();
        if core.state == CircuitState::HalfOpen {
            let permitted = self.inner.config.permitted_number_of_calls_in_half_open_state;
            if let Some(data) = core.machine.half_open_data_mut() {
                data.permits_left = (data.permits_left + 1).min(permitted);
            }
        }
    }

    /// Record a successful call
    pub fn on_success(&self, duration: Duration) {
        self.inner.publish_one(CircuitBreakerEvent::Success {
            name: self.name().to_string(),
            duration,
        });
        self.inner.record(duration, false);
    }

    /// Record a failed call; the classifier decides how it counts
    pub fn on_error(&self, duration: Duration, error: &dyn Any) {
        let ctx = FailureContext {
            name: self.name(),
            error,
            duration,
        };
        match self.inner.config.failure_classifier.classify(&ctx) {
            Classification::Record => {
                self.inner.publish_one(CircuitBreakerEvent::Error {
                    name: self.name().to_string(),
                    duration,
                });
                self.inner.record(duration, true);
            }
            Classification::Ignore => {
                tracing::debug!(circuit = %self.name(), "error ignored by classifier");
                self.release_permission();
                self.inner.publish_one(CircuitBreakerEvent::IgnoredError {
                    name: self.name().to_string(),
                    duration,
                });
            }
            Classification::Success => self.on_success(duration),
        }
    }

    /// Record a successful return value, which may still count as a failure
    pub fn on_result(&self, duration: Duration, value: &dyn Any) {
        let failed = self
            .inner
            .config
            .record_result
            .as_ref()
            .is_some_and(|predicate| predicate.test(value));
        if failed {
            self.inner.publish_one(CircuitBreakerEvent::Error {
                name: self.name().to_string(),
                duration,
            });
            self.inner.record(duration, true);
        } else {
            self.on_success(duration);
        }
    }

    /// Execute a fallible operation with circuit breaker protection
    pub fn call<T, E, F>(&self, f: F) -> Result<T, CallError<E>>
    where
        T: 'static,
        E: 'static,
        F: FnOnce() -> Result<T, E>,
    {
        self.acquire_permission()?;
        let mut permit = Permit::new(self);

        let start = self.inner.context.clock.now();
        let result = f();
        let duration = self.inner.context.clock.now().saturating_sub(start);

        permit.disarm();
        self.record_outcome(duration, &result);
        result.map_err(CallError::Execution)
    }

    /// Like `call`, but runs `fallback` instead of failing when not permitted
    pub fn call_with_fallback<T, E, F, G>(&self, f: F, fallback: G) -> Result<T, CallError<E>>
    where
        T: 'static,
        E: 'static,
        F: FnOnce() -> Result<T, E>,
        G: FnOnce(&FallbackContext) -> Result<T, E>,
    {
        match self.call(f) {
            Err(CallError::CallNotPermitted { name, state }) => {
                let ctx = FallbackContext {
                    circuit_name: name,
                    state,
                };
                fallback(&ctx).map_err(CallError::Execution)
            }
            other => other,
        }
    }

    /// Execute a future with circuit breaker protection
    ///
    /// Dropping the returned future before it completes releases the permit
    /// without recording an outcome.
    pub async fn call_async<T, E, F, Fut>(&self, f: F) -> Result<T, CallError<E>>
    where
        T: 'static,
        E: 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.acquire_permission()?;
        let mut permit = Permit::new(self);

        let start = self.inner.context.clock.now();
        let result = f().await;
        let duration = self.inner.context.clock.now().saturating_sub(start);

        permit.disarm();
        self.record_outcome(duration, &result);
        result.map_err(CallError::Execution)
    }

    fn record_outcome<T: 'static, E: 'static>(&self, duration: Duration, result: &Result<T, E>) {
        match result {
            Ok(value) => self.on_result(duration, value),
            Err(error) => self.on_error(duration, error),
        }
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let evaluation = self.inner.core.lock().metrics.current();
        let snapshot = evaluation.snapshot;
        CircuitBreakerMetrics {
            failure_rate: evaluation.failure_rate,
            slow_call_rate: evaluation.slow_call_rate,
            number_of_buffered_calls: snapshot.total_calls(),
            number_of_failed_calls: snapshot.failed_calls(),
            number_of_successful_calls: snapshot.successful_calls(),
            number_of_slow_calls: snapshot.slow_calls(),
            number_of_slow_failed_calls: snapshot.slow_failed_calls(),
            number_of_slow_successful_calls: snapshot.slow_successful_calls(),
            number_of_not_permitted_calls: self.inner.not_permitted.load(Ordering::Relaxed),
        }
    }

    pub fn transition_to_closed_state(&self) -> Result<(), IllegalTransition> {
        self.inner.transition(CircuitState::Closed)
    }

    pub fn transition_to_open_state(&self) -> Result<(), IllegalTransition> {
        self.inner.transition(CircuitState::Open)
    }

    pub fn transition_to_half_open_state(&self) -> Result<(), IllegalTransition> {
        self.inner.transition(CircuitState::HalfOpen)
    }

    pub fn transition_to_disabled_state(&self) -> Result<(), IllegalTransition> {
        self.inner.transition(CircuitState::Disabled)
    }

    pub fn transition_to_forced_open_state(&self) -> Result<(), IllegalTransition> {
        self.inner.transition(CircuitState::ForcedOpen)
    }

    pub fn transition_to_metrics_only_state(&self) -> Result<(), IllegalTransition> {
        self.inner.transition(CircuitState::MetricsOnly)
    }

    /// Return to CLOSED with empty metrics, as if newly created
    pub fn reset(&self) {
        let inner = &self.inner;
        let mut pending = PendingEvents::new();
        {
            let mut core = inner.core.lock();
            let from = core.state;
            core.machine = DynamicCircuit::new(inner.context.clone());
            core.epoch = core.epoch.wrapping_add(1);
            core.pending = None;
            core.open_attempts = 0;
            core.metrics = window_for(&inner.config, &inner.context, CircuitState::Closed);
            core.state = CircuitState::Closed;
            inner
                .state
                .store(CircuitState::Closed as u8, Ordering::Release);
            inner.not_permitted.store(0, Ordering::Relaxed);

            if from != CircuitState::Closed {
                pending.push(CircuitBreakerEvent::StateTransition {
                    name: self.name().to_string(),
                    from,
                    to: CircuitState::Closed,
                });
            }
            pending.push(CircuitBreakerEvent::Reset {
                name: self.name().to_string(),
            });
        }
        tracing::info!(circuit = %self.name(), "circuit reset");
        inner.publish(pending);
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Inner {
    fn acquire_locked(self: &Arc<Self>, core: &mut Core, pending: &mut PendingEvents) -> bool {
        match core.state {
            CircuitState::Closed | CircuitState::Disabled | CircuitState::MetricsOnly => true,
            CircuitState::ForcedOpen => false,
            CircuitState::Open => {
                if core.machine.handle(CircuitEvent::AttemptReset).is_ok() {
                    self.enter(core, CircuitState::HalfOpen, pending);
                    take_half_open_permit(core)
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_expired(core) {
                    self.fire(core, CircuitEvent::Trip, CircuitState::Open, pending);
                    false
                } else {
                    take_half_open_permit(core)
                }
            }
        }
    }

    /// HalfOpen has outlived `max_wait_duration_in_half_open_state` without a verdict
    fn half_open_expired(&self, core: &mut Core) -> bool {
        let max_wait = self.config.max_wait_duration_in_half_open_state;
        if max_wait.is_zero() {
            return false;
        }
        let now = self.context.clock.now();
        core.machine
            .half_open_data_mut()
            .is_some_and(|data| now.saturating_sub(data.entered_at) >= max_wait)
    }

    fn record(self: &Arc<Self>, duration: Duration, failed: bool) {
        let mut pending = PendingEvents::new();
        {
            let mut core = self.core.lock();
            match core.state {
                CircuitState::Disabled | CircuitState::ForcedOpen => {}
                CircuitState::Open => {
                    // Late completions of calls admitted before the trip
                    core.metrics.record(duration, failed);
                }
                CircuitState::MetricsOnly => {
                    let evaluation = core.metrics.record(duration, failed);
                    self.push_exceeded(&core, &evaluation, &mut pending);
                }
                CircuitState::Closed => {
                    let evaluation = core.metrics.record(duration, failed);
                    if evaluation.result == WindowResult::AboveThresholds {
                        self.push_exceeded(&core, &evaluation, &mut pending);
                        self.fire(&mut core, CircuitEvent::Trip, CircuitState::Open, &mut pending);
                    }
                }
                CircuitState::HalfOpen => {
                    let evaluation = core.metrics.record(duration, failed);
                    match evaluation.result {
                        WindowResult::AboveThresholds => {
                            self.push_exceeded(&core, &evaluation, &mut pending);
                            self.fire(&mut core, CircuitEvent::Trip, CircuitState::Open, &mut pending);
                        }
                        WindowResult::BelowThresholds => {
                            self.fire(
                                &mut core,
                                CircuitEvent::Close,
                                CircuitState::Closed,
                                &mut pending,
                            );
                        }
                        WindowResult::BelowMinimumCallsThreshold => {}
                    }
                }
            }
        }
        self.publish(pending);
    }

    fn transition(self: &Arc<Self>, to: CircuitState) -> Result<(), IllegalTransition> {
        let mut pending = PendingEvents::new();
        {
            let mut core = self.core.lock();
            let from = core.state;
            // Same-state requests skip the machine and just start the state afresh
            if from != to {
                let event = match to {
                    CircuitState::Closed => CircuitEvent::CloseManually,
                    CircuitState::Open => CircuitEvent::OpenManually,
                    CircuitState::HalfOpen => CircuitEvent::HalfOpenManually,
                    CircuitState::Disabled => CircuitEvent::Disable,
                    CircuitState::ForcedOpen => CircuitEvent::ForceOpen,
                    CircuitState::MetricsOnly => CircuitEvent::MeasureOnly,
                };
                core.machine
                    .handle(event)
                    .map_err(|_| IllegalTransition {
                        name: self.context.name.clone(),
                        from,
                        to,
                    })?;
            }
            self.enter(&mut core, to, &mut pending);
        }
        self.publish(pending);
        Ok(())
    }

    /// Apply an automatic transition if the machine allows it
    fn fire(
        self: &Arc<Self>,
        core: &mut Core,
        event: CircuitEvent,
        to: CircuitState,
        pending: &mut PendingEvents,
    ) {
        if core.machine.handle(event).is_ok() {
            self.enter(core, to, pending);
        } else {
            tracing::debug!(circuit = %self.context.name, from = %core.state, %to, "transition refused");
        }
    }

    /// Bookkeeping for a state the machine has just entered
    fn enter(self: &Arc<Self>, core: &mut Core, to: CircuitState, pending: &mut PendingEvents) {
        let from = core.state;
        core.epoch = core.epoch.wrapping_add(1);
        core.pending = None;
        let now = self.context.clock.now();

        match to {
            CircuitState::Open => {
                core.open_attempts = core.open_attempts.saturating_add(1);
                let wait = self.wait_in_open_state(core.open_attempts);
                if let Some(data) = core.machine.open_data_mut() {
                    data.retry_at = now.saturating_add(wait);
                }
                if self.config.automatic_transition_from_open_to_half_open {
                    self.schedule(core, wait, CircuitState::HalfOpen);
                }
            }
            CircuitState::HalfOpen => {
                core.metrics = window_for(&self.config, &self.context, to);
                let permits = self.config.permitted_number_of_calls_in_half_open_state;
                if let Some(data) = core.machine.half_open_data_mut() {
                    data.entered_at = now;
                    data.permits_left = permits;
                }
                let max_wait = self.config.max_wait_duration_in_half_open_state;
                if !max_wait.is_zero() {
                    self.schedule(core, max_wait, CircuitState::Open);
                }
            }
            CircuitState::Closed => {
                core.open_attempts = 0;
                core.metrics = window_for(&self.config, &self.context, to);
            }
            CircuitState::Disabled | CircuitState::ForcedOpen | CircuitState::MetricsOnly => {
                core.metrics = window_for(&self.config, &self.context, to);
            }
        }

        core.state = to;
        self.state.store(to as u8, Ordering::Release);

        tracing::info!(circuit = %self.context.name, %from, %to, "circuit state transition");
        pending.push(CircuitBreakerEvent::StateTransition {
            name: self.context.name.clone(),
            from,
            to,
        });
    }

    fn wait_in_open_state(&self, attempt: u32) -> Duration {
        let base = self.config.wait_interval_in_open_state.apply(attempt);
        if self.config.jitter_factor <= 0.0 {
            return base;
        }

        // Apply jitter using chrono-machines
        let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let policy = chrono_machines::Policy {
            max_attempts: 1,
            base_delay_ms: base_ms,
            multiplier: 1.0,
            max_delay_ms: base_ms,
        };
        Duration::from_millis(policy.calculate_delay(1, self.config.jitter_factor) as u64)
    }

    fn schedule(self: &Arc<Self>, core: &mut Core, delay: Duration, target: CircuitState) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        let epoch = core.epoch;
        let weak: Weak<Inner> = Arc::downgrade(self);
        core.pending = Some(scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.fire_scheduled(epoch, target);
                }
            }),
        ));
    }

    fn fire_scheduled(self: &Arc<Self>, epoch: u64, target: CircuitState) {
        let mut pending = PendingEvents::new();
        {
            let mut core = self.core.lock();
            // Any transition since arming makes the task stale
            if core.epoch != epoch {
                return;
            }
            let event = match target {
                CircuitState::HalfOpen => CircuitEvent::HalfOpenManually,
                _ => CircuitEvent::Trip,
            };
            self.fire(&mut core, event, target, &mut pending);
        }
        self.publish(pending);
    }

    fn push_exceeded(&self, core: &Core, evaluation: &Evaluation, pending: &mut PendingEvents) {
        let thresholds = core.metrics.thresholds();
        if evaluation.failure_rate_exceeded(thresholds) {
            pending.push(CircuitBreakerEvent::FailureRateExceeded {
                name: self.context.name.clone(),
                failure_rate: evaluation.failure_rate,
            });
        }
        if evaluation.slow_call_rate_exceeded(thresholds) {
            pending.push(CircuitBreakerEvent::SlowCallRateExceeded {
                name: self.context.name.clone(),
                slow_call_rate: evaluation.slow_call_rate,
            });
        }
    }

    fn publish_one(&self, event: CircuitBreakerEvent) {
        self.events.publish(event);
    }

    /// Deliver events collected under the lock, after it is released
    fn publish(&self, pending: PendingEvents) {
        for event in pending {
            self.events.publish(event);
        }
    }
}

fn take_half_open_permit(core: &mut Core) -> bool {
    match core.machine.half_open_data_mut() {
        Some(data) if data.permits_left > 0 => {
            data.permits_left -= 1;
            true
        }
        _ => false,
    }
}

/// Window for a freshly entered state
fn window_for(
    config: &CircuitBreakerConfig,
    context: &CircuitContext,
    state: CircuitState,
) -> WindowMetrics {
    let thresholds = config.thresholds();
    let clock = Arc::clone(&context.clock);
    match state {
        CircuitState::HalfOpen => {
            let permitted = config.permitted_number_of_calls_in_half_open_state;
            WindowMetrics::new(
                WindowType::CountBased,
                permitted,
                Thresholds {
                    minimum_calls: permitted,
                    ..thresholds
                },
                clock,
            )
        }
        _ => WindowMetrics::new(
            config.sliding_window_type,
            config.sliding_window_size,
            thresholds,
            clock,
        ),
    }
}

/// Releases an unused permit if the call never completes
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker) -> Self {
        Self {
            breaker,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.release_permission();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::scheduler::ThreadScheduler;
    use crate::window::NOT_ENOUGH_DATA;
    use std::sync::Mutex as StdMutex;
    use std::thread;

    fn breaker(config: CircuitBreakerConfig, clock: &ManualClock) -> CircuitBreaker {
        CircuitBreaker::with_parts("test".to_string(), config, Arc::new(clock.clone()), None)
            .unwrap()
    }

    fn small_window(size: usize) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            sliding_window_size: size,
            minimum_number_of_calls: size,
            wait_interval_in_open_state: IntervalFunction::fixed(Duration::from_secs(1)),
            permitted_number_of_calls_in_half_open_state: 2,
            ..Default::default()
        }
    }

    fn record_transitions(breaker: &CircuitBreaker) -> Arc<StdMutex<Vec<(CircuitState, CircuitState)>>> {
        let transitions = Arc::new(StdMutex::new(Vec::new()));
        let transitions_clone = Arc::clone(&transitions);
        breaker
            .events()
            .subscribe_kind(CircuitBreakerEventKind::StateTransition, move |event| {
                if let CircuitBreakerEvent::StateTransition { from, to, .. } = event {
                    transitions_clone.lock().unwrap().push((*from, *to));
                }
            });
        transitions
    }

    #[test]
    fn test_circuit_breaker_creation() {
        let circuit = CircuitBreaker::of_defaults("test");

        assert_eq!(circuit.name(), "test");
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert!(circuit.try_acquire_permission());
        assert_eq!(circuit.metrics().failure_rate, NOT_ENOUGH_DATA);
    }

    #[test]
    fn test_state_machine_guards_attempt_reset() {
        let clock = ManualClock::new();
        let ctx = CircuitContext {
            name: "machine".to_string(),
            clock: Arc::new(clock.clone()),
        };
        let mut machine = DynamicCircuit::new(ctx);

        assert!(machine.handle(CircuitEvent::Trip).is_ok());
        assert_eq!(machine.current_state(), "Open");
        if let Some(data) = machine.open_data_mut() {
            data.retry_at = Duration::from_secs(5);
        }

        assert!(machine.handle(CircuitEvent::AttemptReset).is_err());
        clock.advance(Duration::from_secs(5));
        assert!(machine.handle(CircuitEvent::AttemptReset).is_ok());
        assert_eq!(machine.current_state(), "HalfOpen");

        // CLOSED -> HALF_OPEN has no edge
        let mut fresh = DynamicCircuit::new(CircuitContext::default());
        assert!(fresh.handle(CircuitEvent::HalfOpenManually).is_err());
        assert_eq!(fresh.current_state(), "Closed");
    }

    #[test]
    fn test_opens_at_failure_rate_threshold() {
        let clock = ManualClock::new();
        let circuit = breaker(small_window(5), &clock);

        for _ in 0..3 {
            circuit.on_error(Duration::ZERO, &"boom");
        }
        circuit.on_success(Duration::ZERO);
        assert_eq!(circuit.state(), CircuitState::Closed);
        circuit.on_success(Duration::ZERO);

        // 3 of 5 failed = 60% >= 50%
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(!circuit.try_acquire_permission());
        assert_eq!(circuit.metrics().number_of_not_permitted_calls, 1);
        assert_eq!(circuit.metrics().failure_rate, 60.0);
    }

    #[test]
    fn test_failure_rate_exactly_at_threshold_opens() {
        let clock = ManualClock::new();
        let circuit = breaker(small_window(4), &clock);

        circuit.on_error(Duration::ZERO, &"boom");
        circuit.on_error(Duration::ZERO, &"boom");
        circuit.on_success(Duration::ZERO);
        circuit.on_success(Duration::ZERO);

        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[test]
    fn test_below_minimum_calls_never_opens() {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig {
            sliding_window_size: 10,
            minimum_number_of_calls: 5,
            ..Default::default()
        };
        let circuit = breaker(config, &clock);

        for _ in 0..4 {
            circuit.on_error(Duration::ZERO, &"boom");
        }
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().failure_rate, NOT_ENOUGH_DATA);

        circuit.on_error(Duration::ZERO, &"boom");
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[test]
    fn test_open_to_half_open_after_wait() {
        let clock = ManualClock::new();
        let circuit = breaker(small_window(2), &clock);
        let transitions = record_transitions(&circuit);

        circuit.transition_to_open_state().unwrap();
        assert!(!circuit.try_acquire_permission());

        clock.advance(Duration::from_millis(1300));
        assert!(circuit.try_acquire_permission());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        assert_eq!(
            *transitions.lock().unwrap(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
            ]
        );
    }

    #[test]
    fn test_half_open_permits_are_limited() {
        let clock = ManualClock::new();
        let circuit = breaker(small_window(2), &clock);

        circuit.transition_to_half_open_state().unwrap_err();
        circuit.transition_to_open_state().unwrap();
        circuit.transition_to_half_open_state().unwrap();

        assert!(circuit.try_acquire_permission());
        assert!(circuit.try_acquire_permission());
        assert!(!circuit.try_acquire_permission());

        circuit.release_permission();
        assert!(circuit.try_acquire_permission());
    }

    #[test]
    fn test_half_open_closes_after_successful_trials() {
        let clock = ManualClock::new();
        let circuit = breaker(small_window(4), &clock);
        circuit.transition_to_open_state().unwrap();
        circuit.transition_to_half_open_state().unwrap();

        assert!(circuit.try_acquire_permission());
        circuit.on_success(Duration::ZERO);
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        assert!(circuit.try_acquire_permission());
        circuit.on_success(Duration::ZERO);
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().number_of_buffered_calls, 0);
    }

    #[test]
    fn test_half_open_reopens_with_growing_wait() {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig {
            wait_interval_in_open_state: IntervalFunction::exponential(
                Duration::from_secs(1),
                2.0,
            )
            .unwrap(),
            ..small_window(4)
        };
        let circuit = breaker(config, &clock);

        circuit.transition_to_open_state().unwrap();
        clock.advance(Duration::from_secs(1));
        assert!(circuit.try_acquire_permission());
        circuit.on_error(Duration::ZERO, &"still down");
        assert!(circuit.try_acquire_permission());
        circuit.on_error(Duration::ZERO, &"still down");
        assert_eq!(circuit.state(), CircuitState::Open);

        // Second consecutive opening waits twice as long
        clock.advance(Duration::from_secs(1));
        assert!(!circuit.try_acquire_permission());
        clock.advance(Duration::from_secs(1));
        assert!(circuit.try_acquire_permission());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_slow_calls_open_circuit() {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig {
            slow_call_rate_threshold: 50.0,
            slow_call_duration_threshold: Duration::from_millis(100),
            ..small_window(4)
        };
        let circuit = breaker(config, &clock);
        let exceeded = Arc::new(StdMutex::new(Vec::new()));
        let exceeded_clone = Arc::clone(&exceeded);
        circuit.events().subscribe_kind(
            CircuitBreakerEventKind::SlowCallRateExceeded,
            move |event| exceeded_clone.lock().unwrap().push(event.clone()),
        );

        circuit.on_success(Duration::from_millis(10));
        circuit.on_success(Duration::from_millis(10));
        circuit.on_success(Duration::from_millis(100));
        assert_eq!(circuit.state(), CircuitState::Closed);
        circuit.on_success(Duration::from_millis(250));

        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(circuit.metrics().number_of_slow_successful_calls, 2);
        assert_eq!(exceeded.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_ignored_errors_do_not_count() {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig {
            failure_classifier: Arc::new(
                crate::classifier::ExceptionClassifier::new()
                    .ignore_if(|e: &&'static str| e.starts_with("client")),
            ),
            ..small_window(2)
        };
        let circuit = breaker(config, &clock);
        let ignored = Arc::new(StdMutex::new(0));
        let ignored_clone = Arc::clone(&ignored);
        circuit
            .events()
            .subscribe_kind(CircuitBreakerEventKind::IgnoredError, move |_| {
                *ignored_clone.lock().unwrap() += 1;
            });

        for _ in 0..5 {
            let _ = circuit.call(|| Err::<(), _>("client error"));
        }

        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().number_of_buffered_calls, 0);
        assert_eq!(*ignored.lock().unwrap(), 5);
    }

    #[test]
    fn test_ignored_error_returns_half_open_permit() {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig {
            failure_classifier: Arc::new(
                crate::classifier::PredicateClassifier::new(|_| false),
            ),
            ..small_window(2)
        };
        let circuit = breaker(config, &clock);
        circuit.transition_to_open_state().unwrap();
        circuit.transition_to_half_open_state().unwrap();

        for _ in 0..4 {
            let _ = circuit.call(|| Err::<(), _>("ignored"));
        }
        assert!(circuit.try_acquire_permission());
        assert!(circuit.try_acquire_permission());
        assert!(!circuit.try_acquire_permission());
    }

    #[test]
    fn test_result_predicate_records_failures() {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig {
            record_result: Some(ResultPredicate::new(|status: &u16| *status >= 500)),
            ..small_window(2)
        };
        let circuit = breaker(config, &clock);

        assert_eq!(circuit.call(|| Ok::<u16, &str>(503)).unwrap(), 503);
        assert_eq!(circuit.call(|| Ok::<u16, &str>(500)).unwrap(), 500);

        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[test]
    fn test_call_rejects_when_open_and_runs_fallback() {
        let clock = ManualClock::new();
        let circuit = breaker(small_window(2), &clock);
        circuit.transition_to_forced_open_state().unwrap();

        let result = circuit.call(|| Ok::<_, &str>("live"));
        assert!(matches!(
            result,
            Err(CallError::CallNotPermitted {
                state: CircuitState::ForcedOpen,
                ..
            })
        ));

        let result = circuit.call_with_fallback(
            || Ok::<_, &str>("live"),
            |ctx| {
                assert_eq!(ctx.circuit_name, "test");
                Ok("cached")
            },
        );
        assert_eq!(result.unwrap(), "cached");
    }

    #[test]
    fn test_illegal_transitions_are_refused() {
        let clock = ManualClock::new();
        let circuit = breaker(small_window(2), &clock);

        let err = circuit.transition_to_half_open_state().unwrap_err();
        assert_eq!(err.from, CircuitState::Closed);
        assert_eq!(err.to, CircuitState::HalfOpen);

        circuit.transition_to_metrics_only_state().unwrap();
        assert!(circuit.transition_to_open_state().is_err());
        assert!(circuit.transition_to_half_open_state().is_err());
        assert_eq!(circuit.state(), CircuitState::MetricsOnly);

        circuit.transition_to_closed_state().unwrap();
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[test]
    fn test_same_state_transition_resets_metrics() {
        let clock = ManualClock::new();
        let circuit = breaker(small_window(5), &clock);
        circuit.on_error(Duration::ZERO, &"boom");
        assert_eq!(circuit.metrics().number_of_buffered_calls, 1);

        circuit.transition_to_closed_state().unwrap();
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().number_of_buffered_calls, 0);
    }

    #[test]
    fn test_disabled_admits_everything_and_records_nothing() {
        let clock = ManualClock::new();
        let circuit = breaker(small_window(2), &clock);
        circuit.transition_to_disabled_state().unwrap();

        for _ in 0..10 {
            let _ = circuit.call(|| Err::<(), _>("boom"));
        }

        assert_eq!(circuit.state(), CircuitState::Disabled);
        assert_eq!(circuit.metrics().number_of_buffered_calls, 0);
    }

    #[test]
    fn test_metrics_only_records_without_tripping() {
        let clock = ManualClock::new();
        let circuit = breaker(small_window(2), &clock);
        circuit.transition_to_metrics_only_state().unwrap();
        let exceeded = Arc::new(StdMutex::new(0));
        let exceeded_clone = Arc::clone(&exceeded);
        circuit
            .events()
            .subscribe_kind(CircuitBreakerEventKind::FailureRateExceeded, move |_| {
                *exceeded_clone.lock().unwrap() += 1;
            });

        for _ in 0..4 {
            let _ = circuit.call(|| Err::<(), _>("boom"));
        }

        assert_eq!(circuit.state(), CircuitState::MetricsOnly);
        assert_eq!(circuit.metrics().number_of_failed_calls, 2);
        assert!(*exceeded.lock().unwrap() >= 1);
    }

    #[test]
    fn test_automatic_transition_fires_on_scheduler() {
        let config = CircuitBreakerConfig {
            wait_interval_in_open_state: IntervalFunction::fixed(Duration::from_millis(50)),
            automatic_transition_from_open_to_half_open: true,
            ..small_window(2)
        };
        let circuit = CircuitBreaker::with_parts(
            "auto".to_string(),
            config,
            default_clock(),
            Some(Arc::new(ThreadScheduler::new())),
        )
        .unwrap();

        circuit.transition_to_open_state().unwrap();
        thread::sleep(Duration::from_millis(300));

        assert_eq!(circuit.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_scheduled_transition_is_cancelled_by_admin_transition() {
        let config = CircuitBreakerConfig {
            wait_interval_in_open_state: IntervalFunction::fixed(Duration::from_millis(50)),
            automatic_transition_from_open_to_half_open: true,
            ..small_window(2)
        };
        let circuit = CircuitBreaker::with_parts(
            "auto".to_string(),
            config,
            default_clock(),
            Some(Arc::new(ThreadScheduler::new())),
        )
        .unwrap();

        circuit.transition_to_open_state().unwrap();
        circuit.transition_to_forced_open_state().unwrap();
        thread::sleep(Duration::from_millis(300));

        assert_eq!(circuit.state(), CircuitState::ForcedOpen);
    }

    #[test]
    fn test_half_open_max_wait_reopens() {
        let circuit = CircuitBreaker::builder("stuck")
            .sliding_window(WindowType::CountBased, 2, 2)
            .max_wait_duration_in_half_open_state(Duration::from_millis(50))
            .build()
            .unwrap();

        circuit.transition_to_open_state().unwrap();
        circuit.transition_to_half_open_state().unwrap();
        thread::sleep(Duration::from_millis(300));

        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(!circuit.try_acquire_permission());
    }

    #[test]
    fn test_expired_half_open_trips_on_next_request() {
        let clock = ManualClock::new();
        let circuit = CircuitBreaker::builder("stuck")
            .sliding_window(WindowType::CountBased, 2, 2)
            .permitted_number_of_calls_in_half_open_state(2)
            .max_wait_duration_in_half_open_state(Duration::from_secs(10))
            .clock(Arc::new(clock.clone()))
            .build()
            .unwrap();

        circuit.transition_to_open_state().unwrap();
        circuit.transition_to_half_open_state().unwrap();
        assert!(circuit.try_acquire_permission());
        assert!(circuit.try_acquire_permission());
        assert!(!circuit.try_acquire_permission());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        clock.advance(Duration::from_secs(10));
        assert!(!circuit.try_acquire_permission());
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[test]
    fn test_reset_returns_to_closed() {
        let clock = ManualClock::new();
        let circuit = breaker(small_window(2), &clock);
        let resets = Arc::new(StdMutex::new(0));
        let resets_clone = Arc::clone(&resets);
        circuit
            .events()
            .subscribe_kind(CircuitBreakerEventKind::Reset, move |_| {
                *resets_clone.lock().unwrap() += 1;
            });

        circuit.transition_to_forced_open_state().unwrap();
        assert!(!circuit.try_acquire_permission());
        circuit.reset();

        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().number_of_not_permitted_calls, 0);
        assert!(circuit.try_acquire_permission());
        assert_eq!(*resets.lock().unwrap(), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_break_calls() {
        let circuit = CircuitBreaker::of_defaults("listener");
        circuit.events().subscribe(|_| panic!("listener bug"));

        assert_eq!(circuit.call(|| Ok::<_, &str>(7)).unwrap(), 7);
        assert_eq!(circuit.metrics().number_of_successful_calls, 1);
    }

    #[test]
    fn test_listener_may_call_back_into_breaker() {
        let clock = ManualClock::new();
        let circuit = breaker(small_window(2), &clock);
        let seen = Arc::new(StdMutex::new(Vec::new()));

        let handle = circuit.clone();
        let seen_clone = Arc::clone(&seen);
        circuit
            .events()
            .subscribe_kind(CircuitBreakerEventKind::StateTransition, move |_| {
                seen_clone.lock().unwrap().push(handle.state());
            });

        circuit.transition_to_open_state().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![CircuitState::Open]);
    }

    #[test]
    fn test_concurrent_recording() {
        let circuit = CircuitBreaker::new(
            "concurrent",
            CircuitBreakerConfig {
                sliding_window_size: 1000,
                minimum_number_of_calls: 1000,
                ..Default::default()
            },
        )
        .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let circuit = circuit.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let _ = circuit.call(|| Ok::<_, &str>(()));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(circuit.metrics().number_of_buffered_calls, 400);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = CircuitBreakerConfig {
            failure_rate_threshold: 0.0,
            ..Default::default()
        };
        assert!(CircuitBreaker::new("bad", config).is_err());

        let config = CircuitBreakerConfig {
            permitted_number_of_calls_in_half_open_state: 0,
            ..Default::default()
        };
        assert!(CircuitBreaker::new("bad", config).is_err());
    }

    #[tokio::test]
    async fn test_cancelled_async_call_releases_half_open_permit() {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig {
            permitted_number_of_calls_in_half_open_state: 1,
            ..small_window(2)
        };
        let circuit = breaker(config, &clock);
        circuit.transition_to_open_state().unwrap();
        circuit.transition_to_half_open_state().unwrap();

        let pending = circuit.call_async(|| std::future::pending::<Result<(), &str>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());

        let result = circuit.call_async(|| async { Ok::<_, &str>(()) }).await;
        assert!(result.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
    }
}
