//! Adaptive bulkhead: a concurrency limit that follows the health of the backend
//!
//! Admission goes through a resizable [`BulkheadSemaphore`]. Every recorded
//! call feeds a sliding window and the configured [`LimitPolicy`], whose
//! verdict is clamped to `[min_concurrent_calls, max_concurrent_calls]`.
//!
//! The `Adaptation` state machine tracks the growth phase. A decrease always
//! leaves SLOW_START for CONGESTION_AVOIDANCE; only an administrative call
//! goes back.

pub mod config;
pub mod policy;

use crate::bulkhead::{AcquireError, BulkheadSemaphore};
use crate::classifier::{Classification, FailureContext};
use crate::clock::{Clock, default_clock};
use crate::errors::{CallError, ConfigError, Rejection};
use crate::events::{Event, EventPublisher};
use crate::window::WindowMetrics;
use config::AdaptiveBulkheadConfig;
use parking_lot::Mutex;
use policy::{LimitPolicy, Observation, Verdict, policy_for};
use state_machines::state_machine;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

/// Growth phase of an adaptive bulkhead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AdaptiveBulkheadState {
    SlowStart = 0,
    CongestionAvoidance = 1,
}

impl AdaptiveBulkheadState {
    pub fn as_str(self) -> &'static str {
        match self {
            AdaptiveBulkheadState::SlowStart => "SLOW_START",
            AdaptiveBulkheadState::CongestionAvoidance => "CONGESTION_AVOIDANCE",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => AdaptiveBulkheadState::CongestionAvoidance,
            _ => AdaptiveBulkheadState::SlowStart,
        }
    }
}

impl fmt::Display for AdaptiveBulkheadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct AdaptationContext {
    pub name: String,
}

state_machine! {
    name: Adaptation,
    context: AdaptationContext,
    dynamic: true,

    initial: SlowStart,
    states: [SlowStart, CongestionAvoidance],
    events {
        congest {
            transition: { from: SlowStart, to: CongestionAvoidance }
        }
        recover {
            transition: { from: CongestionAvoidance, to: SlowStart }
        }
    }
}

/// Old and new limit of one adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitChange {
    pub old: usize,
    pub new: usize,
}

/// Events published by [`AdaptiveBulkhead`]
#[derive(Debug, Clone, PartialEq)]
pub enum AdaptiveBulkheadEvent {
    CallPermitted {
        name: String,
    },
    CallRejected {
        name: String,
    },
    /// `limit_change` is the adjustment this call caused, if any
    Success {
        name: String,
        duration: Duration,
        limit_change: Option<LimitChange>,
    },
    Error {
        name: String,
        duration: Duration,
        limit_change: Option<LimitChange>,
    },
    IgnoredError {
        name: String,
        duration: Duration,
    },
    LimitChanged {
        name: String,
        change: LimitChange,
    },
    LimitIncreased {
        name: String,
        change: LimitChange,
    },
    LimitDecreased {
        name: String,
        change: LimitChange,
    },
    StateTransition {
        name: String,
        from: AdaptiveBulkheadState,
        to: AdaptiveBulkheadState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptiveBulkheadEventKind {
    CallPermitted,
    CallRejected,
    Success,
    Error,
    IgnoredError,
    LimitChanged,
    LimitIncreased,
    LimitDecreased,
    StateTransition,
}

impl Event for AdaptiveBulkheadEvent {
    type Kind = AdaptiveBulkheadEventKind;

    fn kind(&self) -> AdaptiveBulkheadEventKind {
        use AdaptiveBulkheadEventKind as Kind;
        match self {
            AdaptiveBulkheadEvent::CallPermitted { .. } => Kind::CallPermitted,
            AdaptiveBulkheadEvent::CallRejected { .. } => Kind::CallRejected,
            AdaptiveBulkheadEvent::Success { .. } => Kind::Success,
            AdaptiveBulkheadEvent::Error { .. } => Kind::Error,
            AdaptiveBulkheadEvent::IgnoredError { .. } => Kind::IgnoredError,
            AdaptiveBulkheadEvent::LimitChanged { .. } => Kind::LimitChanged,
            AdaptiveBulkheadEvent::LimitIncreased { .. } => Kind::LimitIncreased,
            AdaptiveBulkheadEvent::LimitDecreased { .. } => Kind::LimitDecreased,
            AdaptiveBulkheadEvent::StateTransition { .. } => Kind::StateTransition,
        }
    }
}

/// Point-in-time view of an adaptive bulkhead
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptiveBulkheadMetrics {
    pub state: AdaptiveBulkheadState,
    pub max_allowed_concurrent_calls: usize,
    pub available_concurrent_calls: usize,
    /// `NOT_ENOUGH_DATA` (-1) below the minimum number of calls
    pub failure_rate: f32,
    /// `NOT_ENOUGH_DATA` (-1) below the minimum number of calls
    pub slow_call_rate: f32,
    pub number_of_buffered_calls: u64,
    pub number_of_failed_calls: u64,
    pub number_of_slow_calls: u64,
    pub average_duration: Duration,
    pub number_of_not_permitted_calls: u64,
}

type PendingEvents = Vec<AdaptiveBulkheadEvent>;

struct Core {
    machine: DynamicAdaptation,
    state: AdaptiveBulkheadState,
    metrics: WindowMetrics,
    policy: Box<dyn LimitPolicy>,
}

struct Inner {
    context: AdaptationContext,
    config: AdaptiveBulkheadConfig,
    clock: Arc<dyn Clock>,
    semaphore: Arc<BulkheadSemaphore>,
    core: Mutex<Core>,
    state: AtomicU8,
    not_permitted: AtomicU64,
    events: EventPublisher<AdaptiveBulkheadEvent>,
}

/// Bulkhead whose limit adapts to failure rate, slow-call rate or latency
///
/// Cloning is cheap and every clone shares the same state.
///
/// The limit is re-evaluated after every completed call once the window holds
/// `minimum_number_of_calls` outcomes. The window is not cleared by an
/// adjustment, so in `SlowStart` a run of healthy calls multiplies the limit
/// on each call until it reaches `max_concurrent_calls`.
///
/// # Examples
///
/// ```rust
/// use resilience_machines::adaptive::{AdaptiveBulkhead, AdaptiveBulkheadState};
/// use resilience_machines::adaptive::config::AdaptiveBulkheadConfig;
/// use std::time::Duration;
///
/// let config = AdaptiveBulkheadConfig::builder()
///     .min_concurrent_calls(2)
///     .max_concurrent_calls(20)
///     .initial_concurrent_calls(8)
///     .minimum_number_of_calls(2)
///     .build()
///     .unwrap();
/// let bulkhead = AdaptiveBulkhead::new("search", config).unwrap();
///
/// for _ in 0..2 {
///     assert!(bulkhead.try_acquire_permission());
///     bulkhead.on_success(Duration::from_millis(5));
/// }
///
/// assert_eq!(bulkhead.limit(), 16);
/// assert_eq!(bulkhead.state(), AdaptiveBulkheadState::SlowStart);
/// ```
#[derive(Clone)]
pub struct AdaptiveBulkhead {
    inner: Arc<Inner>,
}

impl AdaptiveBulkhead {
    pub fn new(name: impl Into<String>, config: AdaptiveBulkheadConfig) -> Result<Self, ConfigError> {
        Self::with_clock(name, config, default_clock())
    }

    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::from_valid(name.into(), AdaptiveBulkheadConfig::default(), default_clock())
    }

    /// Create with an explicit clock, e.g. a `ManualClock` in tests
    pub fn with_clock(
        name: impl Into<String>,
        config: AdaptiveBulkheadConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_valid(name.into(), config, clock))
    }

    fn from_valid(name: String, config: AdaptiveBulkheadConfig, clock: Arc<dyn Clock>) -> Self {
        let context = AdaptationContext { name: name.clone() };
        let core = Core {
            machine: DynamicAdaptation::new(context.clone()),
            state: AdaptiveBulkheadState::SlowStart,
            metrics: window_for(&config, &clock),
            policy: policy_for(&config),
        };

        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(BulkheadSemaphore::new(config.initial_limit())),
                context,
                config,
                clock,
                core: Mutex::new(core),
                state: AtomicU8::new(AdaptiveBulkheadState::SlowStart as u8),
                not_permitted: AtomicU64::new(0),
                events: EventPublisher::new(name),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.context.name
    }

    pub fn config(&self) -> &AdaptiveBulkheadConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &EventPublisher<AdaptiveBulkheadEvent> {
        &self.inner.events
    }

    pub fn state(&self) -> AdaptiveBulkheadState {
        AdaptiveBulkheadState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Current concurrency limit
    pub fn limit(&self) -> usize {
        self.inner.semaphore.limit()
    }

    /// Calls currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.inner.semaphore.acquired()
    }

    /// Non-blocking admission
    pub fn try_acquire_permission(&self) -> bool {
        let permitted = self.inner.semaphore.try_acquire_permit();
        self.inner.publish_admission(permitted);
        permitted
    }

    /// Admission waiting up to `max_wait_duration`
    pub fn acquire_permission(&self) -> Result<(), Rejection> {
        let result = self
            .inner
            .semaphore
            .acquire_permit(self.inner.config.max_wait_duration);
        self.inner.publish_admission(result.is_ok());
        result.map_err(|e| self.inner.rejection(e))
    }

    /// Return a permit without recording an outcome
    pub fn release_permission(&self) {
        self.inner.semaphore.release_permit();
    }

    /// Release the permit and record a successful call
    pub fn on_success(&self, duration: Duration) {
        let in_flight = self.release();
        self.inner.record(duration, false, in_flight);
    }

    /// Release the permit and record a failed call; the classifier decides how it counts
    pub fn on_error(&self, duration: Duration, error: &dyn Any) {
        let ctx = FailureContext {
            name: self.name(),
            error,
            duration,
        };
        match self.inner.config.failure_classifier.classify(&ctx) {
            Classification::Record => {
                let in_flight = self.release();
                self.inner.record(duration, true, in_flight);
            }
            Classification::Ignore => {
                tracing::debug!(bulkhead = %self.name(), "error ignored by classifier");
                self.release();
                self.inner.events.publish(AdaptiveBulkheadEvent::IgnoredError {
                    name: self.name().to_string(),
                    duration,
                });
            }
            Classification::Success => self.on_success(duration),
        }
    }

    /// Release the permit and record a return value, which may still count as a failure
    pub fn on_result(&self, duration: Duration, value: &dyn Any) {
        let failed = self
            .inner
            .config
            .record_result
            .as_ref()
            .is_some_and(|predicate| predicate.test(value));
        let in_flight = self.release();
        self.inner.record(duration, failed, in_flight);
    }

    /// Run `f` while holding a permit, waiting up to `max_wait_duration`
    pub fn call<T, E, F>(&self, f: F) -> Result<T, CallError<E>>
    where
        T: 'static,
        E: 'static,
        F: FnOnce() -> Result<T, E>,
    {
        self.acquire_permission()?;
        let mut permit = Permit::new(self);

        let start = self.inner.clock.now();
        let result = f();
        let duration = self.inner.clock.now().saturating_sub(start);

        permit.disarm();
        self.record_outcome(duration, &result);
        result.map_err(CallError::Execution)
    }

    /// Run a future while holding a permit
    ///
    /// Admission never blocks the executor. Dropping the returned future
    /// releases the permit exactly once and records nothing.
    pub async fn call_async<T, E, F, Fut>(&self, f: F) -> Result<T, CallError<E>>
    where
        T: 'static,
        E: 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire_permission() {
            return Err(self.inner.rejection(AcquireError::Full).into());
        }
        let mut permit = Permit::new(self);

        let start = self.inner.clock.now();
        let result = f().await;
        let duration = self.inner.clock.now().saturating_sub(start);

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

    pub fn metrics(&self) -> AdaptiveBulkheadMetrics {
        let evaluation = self.inner.core.lock().metrics.current();
        let snapshot = evaluation.snapshot;
        AdaptiveBulkheadMetrics {
            state: self.state(),
            max_allowed_concurrent_calls: self.inner.semaphore.limit(),
            available_concurrent_calls: self.inner.semaphore.available(),
            failure_rate: evaluation.failure_rate,
            slow_call_rate: evaluation.slow_call_rate,
            number_of_buffered_calls: snapshot.total_calls(),
            number_of_failed_calls: snapshot.failed_calls(),
            number_of_slow_calls: snapshot.slow_calls(),
            average_duration: snapshot.average_duration(),
            number_of_not_permitted_calls: self.inner.not_permitted.load(Ordering::Relaxed),
        }
    }

    /// Switch to additive growth; a no-op if already there
    pub fn transition_to_congestion_avoidance(&self) {
        self.inner
            .transition(AdaptationEvent::Congest, AdaptiveBulkheadState::CongestionAvoidance);
    }

    /// Switch back to multiplicative growth; a no-op if already there
    pub fn transition_to_slow_start(&self) {
        self.inner
            .transition(AdaptationEvent::Recover, AdaptiveBulkheadState::SlowStart);
    }

    /// Back to SLOW_START at the initial limit with empty metrics
    ///
    /// Permits held by running calls stay valid.
    pub fn reset(&self) {
        let inner = &self.inner;
        let mut pending = PendingEvents::new();
        {
            let mut core = inner.core.lock();
            let from = core.state;
            core.machine = DynamicAdaptation::new(inner.context.clone());
            core.metrics = window_for(&inner.config, &inner.clock);
            core.policy.reset();
            core.state = AdaptiveBulkheadState::SlowStart;
            inner
                .state
                .store(AdaptiveBulkheadState::SlowStart as u8, Ordering::Release);
            inner.not_permitted.store(0, Ordering::Relaxed);
            inner.change_limit(inner.config.initial_limit(), &mut pending);
            if from != AdaptiveBulkheadState::SlowStart {
                pending.push(AdaptiveBulkheadEvent::StateTransition {
                    name: inner.context.name.clone(),
                    from,
                    to: AdaptiveBulkheadState::SlowStart,
                });
            }
        }
        tracing::info!(bulkhead = %self.name(), "adaptive bulkhead reset");
        inner.publish(pending);
    }

    /// Release one permit, returning the in-flight count just before
    fn release(&self) -> usize {
        self.inner.semaphore.release_permit().unwrap_or(0)
    }
}

impl fmt::Debug for AdaptiveBulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveBulkhead")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("limit", &self.limit())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl Inner {
    fn record(&self, duration: Duration, failed: bool, in_flight: usize) {
        let mut pending = PendingEvents::new();
        let limit_change = {
            let mut core = self.core.lock();
            let evaluation = core.metrics.record(duration, failed);
            let observation = Observation {
                evaluation: &evaluation,
                duration,
                failed,
                in_flight,
                limit: self.semaphore.limit(),
                state: core.state,
                now: self.clock.now(),
            };
            let verdict = core.policy.next_limit(&observation);
            self.apply(&mut core, verdict, &mut pending)
        };

        let name = self.context.name.clone();
        self.events.publish(if failed {
            AdaptiveBulkheadEvent::Error {
                name,
                duration,
                limit_change,
            }
        } else {
            AdaptiveBulkheadEvent::Success {
                name,
                duration,
                limit_change,
            }
        });
        self.publish(pending);
    }

    fn apply(
        &self,
        core: &mut Core,
        verdict: Verdict,
        pending: &mut PendingEvents,
    ) -> Option<LimitChange> {
        match verdict {
            Verdict::Hold => None,
            Verdict::Increase(target) => self.change_limit(target, pending),
            Verdict::Decrease(target) => {
                let change = self.change_limit(target, pending);
                if core.state == AdaptiveBulkheadState::SlowStart
                    && core.machine.handle(AdaptationEvent::Congest).is_ok()
                {
                    self.enter(core, AdaptiveBulkheadState::CongestionAvoidance, pending);
                }
                change
            }
        }
    }

    /// Set the limit to `target` within bounds
    fn change_limit(&self, target: usize, pending: &mut PendingEvents) -> Option<LimitChange> {
        let new = self.config.clamp(target);
        let old = self.semaphore.limit();
        if new == old {
            return None;
        }
        self.semaphore.set_limit(new);

        let change = LimitChange { old, new };
        tracing::debug!(bulkhead = %self.context.name, old, new, "concurrency limit changed");
        let name = self.context.name.clone();
        pending.push(AdaptiveBulkheadEvent::LimitChanged {
            name: name.clone(),
            change,
        });
        pending.push(if new > old {
            AdaptiveBulkheadEvent::LimitIncreased { name, change }
        } else {
            AdaptiveBulkheadEvent::LimitDecreased { name, change }
        });
        Some(change)
    }

    fn transition(&self, event: AdaptationEvent, to: AdaptiveBulkheadState) {
        let mut pending = PendingEvents::new();
        {
            let mut core = self.core.lock();
            if core.state == to {
                return;
            }
            if core.machine.handle(event).is_ok() {
                self.enter(&mut core, to, &mut pending);
            }
        }
        self.publish(pending);
    }

    fn enter(&self, core: &mut Core, to: AdaptiveBulkheadState, pending: &mut PendingEvents) {
        let from = core.state;
        core.state = to;
        self.state.store(to as u8, Ordering::Release);
        if self.config.reset_metrics_on_transition {
            core.metrics.reset();
        }

        tracing::info!(bulkhead = %self.context.name, %from, %to, "adaptive bulkhead state transition");
        pending.push(AdaptiveBulkheadEvent::StateTransition {
            name: self.context.name.clone(),
            from,
            to,
        });
    }

    fn publish_admission(&self, permitted: bool) {
        let name = self.context.name.clone();
        if permitted {
            self.events
                .publish(AdaptiveBulkheadEvent::CallPermitted { name });
        } else {
            self.not_permitted.fetch_add(1, Ordering::Relaxed);
            self.events.publish(AdaptiveBulkheadEvent::CallRejected { name });
        }
    }

    fn rejection(&self, error: AcquireError) -> Rejection {
        match error {
            AcquireError::Full => Rejection::BulkheadFull {
                name: self.context.name.clone(),
                max_concurrent_calls: self.semaphore.limit(),
            },
            AcquireError::Interrupted => Rejection::AcquireInterrupted {
                name: self.context.name.clone(),
            },
        }
    }

    fn publish(&self, pending: PendingEvents) {
        for event in pending {
            self.events.publish(event);
        }
    }
}

fn window_for(config: &AdaptiveBulkheadConfig, clock: &Arc<dyn Clock>) -> WindowMetrics {
    WindowMetrics::new(
        config.sliding_window_type,
        config.sliding_window_size,
        config.thresholds(),
        Arc::clone(clock),
    )
}

/// Releases the permit if the call never completes
struct Permit<'a> {
    bulkhead: &'a AdaptiveBulkhead,
    armed: bool,
}

impl<'a> Permit<'a> {
    fn new(bulkhead: &'a AdaptiveBulkhead) -> Self {
        Self {
            bulkhead,
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
            self.bulkhead.release_permission();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::config::{AdaptationStrategy, AimdConfig, LatencyConfig};
    use super::*;
    use crate::classifier::ExceptionClassifier;
    use crate::clock::ManualClock;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    const SLOW: Duration = Duration::from_secs(10);
    const FAST: Duration = Duration::from_millis(5);

    fn scenario_config() -> AdaptiveBulkheadConfig {
        AdaptiveBulkheadConfig::builder()
            .initial_concurrent_calls(8)
            .min_concurrent_calls(2)
            .max_concurrent_calls(20)
            .minimum_number_of_calls(2)
            .increase_multiplier(2.0)
            .decrease_multiplier(0.5)
            .build()
            .unwrap()
    }

    fn record_events(
        bulkhead: &AdaptiveBulkhead,
    ) -> Arc<StdMutex<Vec<AdaptiveBulkheadEventKind>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        bulkhead.events().subscribe(move |event| {
            seen_clone.lock().unwrap().push(event.kind());
        });
        seen
    }

    #[test]
    fn test_state_machine_transitions() {
        let mut machine = DynamicAdaptation::new(AdaptationContext::default());

        assert_eq!(machine.current_state(), "SlowStart");
        assert!(machine.handle(AdaptationEvent::Recover).is_err());
        assert!(machine.handle(AdaptationEvent::Congest).is_ok());
        assert_eq!(machine.current_state(), "CongestionAvoidance");
        assert!(machine.handle(AdaptationEvent::Congest).is_err());
    }

    #[test]
    fn test_slow_errors_halve_the_limit_and_congest() {
        let bulkhead = AdaptiveBulkhead::new("scenario", scenario_config()).unwrap();
        let transitions = Arc::new(StdMutex::new(Vec::new()));
        let transitions_clone = Arc::clone(&transitions);
        bulkhead.events().subscribe_kind(
            AdaptiveBulkheadEventKind::StateTransition,
            move |event| {
                if let AdaptiveBulkheadEvent::StateTransition { from, to, .. } = event {
                    transitions_clone.lock().unwrap().push((*from, *to));
                }
            },
        );

        for _ in 0..2 {
            assert!(bulkhead.try_acquire_permission());
            bulkhead.on_error(SLOW, &"timeout");
        }
        assert_eq!(bulkhead.limit(), 4);
        assert_eq!(bulkhead.state(), AdaptiveBulkheadState::CongestionAvoidance);

        assert!(bulkhead.try_acquire_permission());
        bulkhead.on_error(SLOW, &"timeout");
        assert_eq!(bulkhead.limit(), 2);

        assert_eq!(
            *transitions.lock().unwrap(),
            vec![(
                AdaptiveBulkheadState::SlowStart,
                AdaptiveBulkheadState::CongestionAvoidance
            )]
        );
    }

    #[test]
    fn test_fast_successes_double_the_limit_in_slow_start() {
        let bulkhead = AdaptiveBulkhead::new("scenario", scenario_config()).unwrap();
        let seen = record_events(&bulkhead);

        for _ in 0..2 {
            assert!(bulkhead.try_acquire_permission());
            bulkhead.on_success(FAST);
        }

        assert_eq!(bulkhead.limit(), 16);
        assert_eq!(bulkhead.state(), AdaptiveBulkheadState::SlowStart);
        let seen = seen.lock().unwrap();
        assert!(!seen.contains(&AdaptiveBulkheadEventKind::StateTransition));
        assert_eq!(
            seen.iter()
                .filter(|k| **k == AdaptiveBulkheadEventKind::LimitIncreased)
                .count(),
            1
        );
    }

    #[test]
    fn test_each_healthy_call_grows_the_limit_once_window_is_full() {
        let bulkhead = AdaptiveBulkhead::new("scenario", scenario_config()).unwrap();

        let limits: Vec<usize> = (0..4)
            .map(|_| {
                bulkhead.on_success(FAST);
                bulkhead.limit()
            })
            .collect();

        assert_eq!(limits, vec![8, 16, 20, 20]);
        assert_eq!(bulkhead.state(), AdaptiveBulkheadState::SlowStart);
    }

    #[test]
    fn test_success_event_carries_limit_change() {
        let bulkhead = AdaptiveBulkhead::new("scenario", scenario_config()).unwrap();
        let changes = Arc::new(StdMutex::new(Vec::new()));
        let changes_clone = Arc::clone(&changes);
        bulkhead
            .events()
            .subscribe_kind(AdaptiveBulkheadEventKind::Success, move |event| {
                if let AdaptiveBulkheadEvent::Success { limit_change, .. } = event {
                    changes_clone.lock().unwrap().push(*limit_change);
                }
            });

        bulkhead.on_success(FAST);
        bulkhead.on_success(FAST);

        assert_eq!(
            *changes.lock().unwrap(),
            vec![None, Some(LimitChange { old: 8, new: 16 })]
        );
    }

    #[test]
    fn test_congestion_avoidance_grows_additively() {
        let bulkhead = AdaptiveBulkhead::new("scenario", scenario_config()).unwrap();
        bulkhead.transition_to_congestion_avoidance();

        bulkhead.on_success(FAST);
        bulkhead.on_success(FAST);
        assert_eq!(bulkhead.limit(), 9);
        bulkhead.on_success(FAST);
        assert_eq!(bulkhead.limit(), 10);
    }

    #[test]
    fn test_limit_stays_within_bounds() {
        let bulkhead = AdaptiveBulkhead::new("bounds", scenario_config()).unwrap();

        for round in 0..200 {
            if round % 7 < 4 {
                bulkhead.on_success(FAST);
            } else {
                bulkhead.on_error(SLOW, &"slow");
            }
            let limit = bulkhead.limit();
            assert!((2..=20).contains(&limit), "limit {limit} escaped bounds");
        }

        bulkhead.transition_to_slow_start();
        for _ in 0..200 {
            bulkhead.on_success(FAST);
            assert!(bulkhead.limit() <= 20);
        }
    }

    #[test]
    fn test_admission_respects_limit() {
        let config = AdaptiveBulkheadConfig::builder()
            .min_concurrent_calls(1)
            .initial_concurrent_calls(2)
            .build()
            .unwrap();
        let bulkhead = AdaptiveBulkhead::new("admission", config).unwrap();

        assert!(bulkhead.try_acquire_permission());
        assert!(bulkhead.try_acquire_permission());
        assert!(!bulkhead.try_acquire_permission());
        assert!(matches!(
            bulkhead.acquire_permission(),
            Err(Rejection::BulkheadFull {
                max_concurrent_calls: 2,
                ..
            })
        ));
        assert_eq!(bulkhead.metrics().number_of_not_permitted_calls, 2);

        bulkhead.release_permission();
        bulkhead.release_permission();
        bulkhead.release_permission();
        assert_eq!(bulkhead.metrics().available_concurrent_calls, 2);
    }

    #[test]
    fn test_rejection_does_not_feed_metrics() {
        let config = AdaptiveBulkheadConfig::builder()
            .min_concurrent_calls(1)
            .initial_concurrent_calls(1)
            .build()
            .unwrap();
        let bulkhead = AdaptiveBulkhead::new("rejected", config).unwrap();
        assert!(bulkhead.try_acquire_permission());

        let err = bulkhead.call(|| Ok::<_, &str>(())).unwrap_err();
        assert!(err.is_rejection());
        assert_eq!(bulkhead.metrics().number_of_buffered_calls, 0);
    }

    #[test]
    fn test_ignored_errors_release_without_recording() {
        let config = AdaptiveBulkheadConfig::builder()
            .failure_classifier(Arc::new(
                ExceptionClassifier::new().ignore_if(|e: &&'static str| *e == "not found"),
            ))
            .build()
            .unwrap();
        let bulkhead = AdaptiveBulkhead::new("ignored", config).unwrap();
        let seen = record_events(&bulkhead);

        let result = bulkhead.call(|| Err::<(), _>("not found"));
        assert!(matches!(result, Err(CallError::Execution("not found"))));
        assert_eq!(bulkhead.metrics().number_of_buffered_calls, 0);
        assert_eq!(bulkhead.in_flight(), 0);
        assert!(
            seen.lock()
                .unwrap()
                .contains(&AdaptiveBulkheadEventKind::IgnoredError)
        );
    }

    #[test]
    fn test_result_predicate_counts_as_failure() {
        let config = AdaptiveBulkheadConfig::builder()
            .initial_concurrent_calls(8)
            .max_concurrent_calls(20)
            .minimum_number_of_calls(2)
            .record_result(|status: &u16| *status >= 500)
            .build()
            .unwrap();
        let bulkhead = AdaptiveBulkhead::new("results", config).unwrap();

        let _ = bulkhead.call(|| Ok::<u16, &str>(503));
        let _ = bulkhead.call(|| Ok::<u16, &str>(503));

        assert_eq!(bulkhead.limit(), 4);
        assert_eq!(bulkhead.metrics().number_of_failed_calls, 2);
    }

    #[test]
    fn test_reset_metrics_on_transition() {
        let config = AdaptiveBulkheadConfig::builder()
            .initial_concurrent_calls(8)
            .max_concurrent_calls(20)
            .minimum_number_of_calls(2)
            .reset_metrics_on_transition(true)
            .build()
            .unwrap();
        let bulkhead = AdaptiveBulkhead::new("fresh", config).unwrap();

        bulkhead.on_error(SLOW, &"slow");
        bulkhead.on_error(SLOW, &"slow");
        assert_eq!(bulkhead.state(), AdaptiveBulkheadState::CongestionAvoidance);
        assert_eq!(bulkhead.metrics().number_of_buffered_calls, 0);

        // A fresh window needs the minimum again
        bulkhead.on_error(SLOW, &"slow");
        assert_eq!(bulkhead.limit(), 4);
    }

    #[test]
    fn test_reset_restores_initial_limit() {
        let bulkhead = AdaptiveBulkhead::new("reset", scenario_config()).unwrap();
        bulkhead.on_error(SLOW, &"slow");
        bulkhead.on_error(SLOW, &"slow");
        assert_eq!(bulkhead.limit(), 4);

        bulkhead.reset();

        assert_eq!(bulkhead.limit(), 8);
        assert_eq!(bulkhead.state(), AdaptiveBulkheadState::SlowStart);
        assert_eq!(bulkhead.metrics().number_of_buffered_calls, 0);
    }

    #[test]
    fn test_admin_transitions_are_idempotent() {
        let bulkhead = AdaptiveBulkhead::of_defaults("admin");
        let seen = record_events(&bulkhead);

        bulkhead.transition_to_slow_start();
        bulkhead.transition_to_congestion_avoidance();
        bulkhead.transition_to_congestion_avoidance();
        bulkhead.transition_to_slow_start();

        let transitions = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|k| **k == AdaptiveBulkheadEventKind::StateTransition)
            .count();
        assert_eq!(transitions, 2);
    }

    #[test]
    fn test_aimd_strategy() {
        let config = AdaptiveBulkheadConfig::builder()
            .initial_concurrent_calls(4)
            .max_concurrent_calls(10)
            .minimum_number_of_calls(1)
            .strategy(AdaptationStrategy::Aimd(AimdConfig {
                drop_multiplier: 0.5,
                increment_factor: 1.0,
            }))
            .build()
            .unwrap();
        let bulkhead = AdaptiveBulkhead::new("aimd", config).unwrap();

        // One call in flight out of four: no growth
        assert!(bulkhead.try_acquire_permission());
        bulkhead.on_success(FAST);
        assert_eq!(bulkhead.limit(), 4);

        // Saturated: +1
        for _ in 0..4 {
            assert!(bulkhead.try_acquire_permission());
        }
        bulkhead.on_success(FAST);
        assert_eq!(bulkhead.limit(), 5);
        for _ in 0..3 {
            bulkhead.release_permission();
        }

        // 2 failures out of 4 calls reaches 50%
        bulkhead.on_error(FAST, &"boom");
        bulkhead.on_error(FAST, &"boom");
        assert_eq!(bulkhead.limit(), 2);
        assert_eq!(bulkhead.state(), AdaptiveBulkheadState::CongestionAvoidance);
    }

    #[test]
    fn test_latency_strategy_with_manual_clock() {
        let clock = ManualClock::new();
        let latency = LatencyConfig::new(Duration::from_millis(100), Duration::from_millis(300), 50.0);
        let config = AdaptiveBulkheadConfig::builder()
            .max_concurrent_calls(20)
            .strategy(AdaptationStrategy::Percentile(latency, 90.0))
            .build()
            .unwrap();
        let bulkhead = AdaptiveBulkhead::with_clock("latency", config, Arc::new(clock.clone())).unwrap();
        // 50 calls/s at 100ms
        assert_eq!(bulkhead.limit(), 5);

        for _ in 0..15 {
            clock.advance(Duration::from_millis(20));
            bulkhead.on_success(Duration::from_millis(1));
        }
        assert_eq!(bulkhead.limit(), 6);

        for _ in 0..15 {
            clock.advance(Duration::from_millis(20));
            bulkhead.on_success(Duration::from_millis(900));
        }
        assert_eq!(bulkhead.limit(), 5);
        assert_eq!(bulkhead.state(), AdaptiveBulkheadState::CongestionAvoidance);
    }

    #[test]
    fn test_concurrent_calls_never_exceed_limit() {
        let config = AdaptiveBulkheadConfig::builder()
            .min_concurrent_calls(2)
            .max_concurrent_calls(6)
            .initial_concurrent_calls(4)
            .minimum_number_of_calls(5)
            .sliding_window(crate::window::WindowType::CountBased, 10)
            .build()
            .unwrap();
        let bulkhead = AdaptiveBulkhead::new("busy", config).unwrap();
        let over_admitted = Arc::new(AtomicBool::new(false));
        let mut handles = vec![];

        for worker in 0..8 {
            let bulkhead = bulkhead.clone();
            let over_admitted = Arc::clone(&over_admitted);
            handles.push(thread::spawn(move || {
                for i in 0..100 {
                    let _ = bulkhead.call(|| {
                        if bulkhead.in_flight() > 6 {
                            over_admitted.store(true, Ordering::SeqCst);
                        }
                        if (worker + i) % 3 == 0 { Err("boom") } else { Ok(()) }
                    });
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(!over_admitted.load(Ordering::SeqCst));
        assert_eq!(bulkhead.in_flight(), 0);
        assert!((2..=6).contains(&bulkhead.limit()));
    }

    #[tokio::test]
    async fn test_cancelled_future_releases_once() {
        let config = AdaptiveBulkheadConfig::builder()
            .min_concurrent_calls(1)
            .initial_concurrent_calls(1)
            .build()
            .unwrap();
        let bulkhead = AdaptiveBulkhead::new("async", config).unwrap();
        let started = Arc::new(AtomicBool::new(false));

        let task = {
            let bulkhead = bulkhead.clone();
            let started = Arc::clone(&started);
            tokio::spawn(async move {
                bulkhead
                    .call_async(|| async move {
                        started.store(true, Ordering::SeqCst);
                        std::future::pending::<Result<(), &str>>().await
                    })
                    .await
            })
        };

        while !started.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        assert_eq!(bulkhead.in_flight(), 1);
        assert!(matches!(
            bulkhead.call_async(|| async { Ok::<_, &str>(()) }).await,
            Err(CallError::BulkheadFull { .. })
        ));

        task.abort();
        let _ = task.await;
        assert_eq!(bulkhead.in_flight(), 0);
        assert_eq!(bulkhead.metrics().number_of_buffered_calls, 0);
        assert_eq!(bulkhead.call_async(|| async { Ok::<_, &str>(7) }).await.unwrap(), 7);
    }
}
