//! Builder API for ergonomic circuit breaker configuration

use crate::{
    circuit::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent, CircuitBreakerEventKind,
        CircuitState,
    },
    classifier::{FailureClassifier, ResultPredicate},
    clock::{Clock, default_clock},
    errors::ConfigError,
    interval::IntervalFunction,
    scheduler::Scheduler,
    window::WindowType,
};
use std::sync::Arc;
use std::time::Duration;

type StateCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Builder for creating circuit breakers with fluent API
///
/// Nothing is validated until [`build`](Self::build), which reports the first
/// invalid field.
pub struct CircuitBuilder {
    name: String,
    config: CircuitBreakerConfig,
    wait_in_open_state: Option<Result<IntervalFunction, ConfigError>>,
    clock: Option<Arc<dyn Clock>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    callbacks: Vec<(CircuitState, StateCallback)>,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig::default(),
            wait_in_open_state: None,
            clock: None,
            scheduler: None,
            callbacks: Vec::new(),
        }
    }

    /// Start from an existing configuration
    pub fn with_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Failure percentage in (0, 100] at which the circuit opens
    pub fn failure_rate_threshold(mut self, rate: f32) -> Self {
        self.config.failure_rate_threshold = rate;
        self
    }

    /// Slow-call percentage in (0, 100] at which the circuit opens
    pub fn slow_call_rate_threshold(mut self, rate: f32) -> Self {
        self.config.slow_call_rate_threshold = rate;
        self
    }

    /// Calls taking at least this long count as slow
    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    pub fn sliding_window_type(mut self, window_type: WindowType) -> Self {
        self.config.sliding_window_type = window_type;
        self
    }

    pub fn sliding_window_size(mut self, size: usize) -> Self {
        self.config.sliding_window_size = size;
        self
    }

    /// Shape and size in one call
    pub fn sliding_window(mut self, window_type: WindowType, size: usize, minimum_calls: usize) -> Self {
        self.config.sliding_window_type = window_type;
        self.config.sliding_window_size = size;
        self.config.minimum_number_of_calls = minimum_calls;
        self
    }

    /// Set minimum number of calls before rates are evaluated
    pub fn minimum_number_of_calls(mut self, calls: usize) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    pub fn permitted_number_of_calls_in_half_open_state(mut self, calls: usize) -> Self {
        self.config.permitted_number_of_calls_in_half_open_state = calls;
        self
    }

    /// Constant wait before OPEN admits trial calls
    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.wait_in_open_state = Some(IntervalFunction::of(wait));
        self
    }

    /// Wait as a function of consecutive openings, e.g. exponential backoff
    pub fn wait_interval_function_in_open_state(mut self, interval: IntervalFunction) -> Self {
        self.wait_in_open_state = Some(Ok(interval));
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: wait * (1 - jitter + rand * jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.config.jitter_factor = factor;
        self
    }

    /// Move OPEN to HALF_OPEN on a timer instead of on the next request
    ///
    /// Without an explicit [`scheduler`](Self::scheduler), a
    /// [`ThreadScheduler`](crate::ThreadScheduler) is used.
    pub fn automatic_transition_from_open_to_half_open(mut self, enabled: bool) -> Self {
        self.config.automatic_transition_from_open_to_half_open = enabled;
        self
    }

    pub fn max_wait_duration_in_half_open_state(mut self, wait: Duration) -> Self {
        self.config.max_wait_duration_in_half_open_state = wait;
        self
    }

    /// Set a failure classifier to decide which errors count as failures
    ///
    /// # Examples
    ///
    /// ```rust
    /// use resilience_machines::{CircuitBreaker, PredicateClassifier};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let circuit = CircuitBreaker::builder("api")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // Only count slow errors
    ///         ctx.duration > Duration::from_secs(1)
    ///     })))
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.config.failure_classifier = classifier;
        self
    }

    /// Record successful results of type `T` matching `predicate` as failures
    pub fn record_result<T, F>(mut self, predicate: F) -> Self
    where
        T: 'static,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.config.record_result = Some(ResultPredicate::new(predicate));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Scheduler for automatic and HALF_OPEN timeout transitions
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_enter(CircuitState::Open, f)
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_enter(CircuitState::Closed, f)
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_enter(CircuitState::HalfOpen, f)
    }

    /// Set callback for entering any given state
    pub fn on_enter<F>(mut self, state: CircuitState, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.push((state, Arc::new(f)));
        self
    }

    /// Validate and return the configuration alone
    pub fn build_config(self) -> Result<CircuitBreakerConfig, ConfigError> {
        finish_config(self.config, self.wait_in_open_state)
    }

    /// Build the circuit breaker
    pub fn build(self) -> Result<CircuitBreaker, ConfigError> {
        let CircuitBuilder {
            name,
            config,
            wait_in_open_state,
            clock,
            scheduler,
            callbacks,
        } = self;
        let config = finish_config(config, wait_in_open_state)?;
        let clock = clock.unwrap_or_else(default_clock);

        let circuit = CircuitBreaker::with_parts(name, config, clock, scheduler)?;
        for (state, callback) in callbacks {
            circuit.events().subscribe_kind(
                CircuitBreakerEventKind::StateTransition,
                move |event| {
                    if let CircuitBreakerEvent::StateTransition { name, to, .. } = event
                        && *to == state
                    {
                        callback(name.as_str());
                    }
                },
            );
        }
        Ok(circuit)
    }
}

fn finish_config(
    mut config: CircuitBreakerConfig,
    wait_in_open_state: Option<Result<IntervalFunction, ConfigError>>,
) -> Result<CircuitBreakerConfig, ConfigError> {
    if let Some(interval) = wait_in_open_state {
        config.wait_interval_in_open_state = interval?;
    }
    config.validate()?;
    Ok(config)
}
