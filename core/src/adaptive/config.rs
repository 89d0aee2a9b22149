//! Adaptive bulkhead configuration

use crate::classifier::{FailureClassifier, ResultPredicate, default_classifier};
use crate::errors::ConfigError;
use crate::window::{Thresholds, WindowType};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MIN_CONCURRENT_CALLS: usize = 2;
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 25;
pub const DEFAULT_INITIAL_CONCURRENT_CALLS: usize = DEFAULT_MIN_CONCURRENT_CALLS;
pub const DEFAULT_FAILURE_RATE_THRESHOLD: f32 = 50.0;
pub const DEFAULT_SLOW_CALL_RATE_THRESHOLD: f32 = 50.0;
pub const DEFAULT_SLOW_CALL_DURATION_THRESHOLD: Duration = Duration::from_secs(5);
pub const DEFAULT_SLIDING_WINDOW_SIZE: usize = 100;
pub const DEFAULT_MINIMUM_NUMBER_OF_CALLS: usize = 100;
pub const DEFAULT_INCREASE_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_DECREASE_MULTIPLIER: f64 = 0.5;
pub const DEFAULT_INCREASE_SUMMAND: usize = 1;

/// Fewest latency samples an adaptation window may hold
pub const MIN_SAMPLES_PER_ADAPTATION: f64 = 15.0;
/// Smallest ratio of reconfiguration window to adaptation window
pub const MIN_ADAPTATIONS_PER_RECONFIGURATION: u32 = 15;

/// Settings for the AIMD strategy
///
/// Bounds and rate thresholds come from the enclosing [`AdaptiveBulkheadConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AimdConfig {
    /// Factor in (0, 1) applied to the limit when a rate threshold is reached
    pub drop_multiplier: f64,
    /// The limit grows only while `in_flight * increment_factor >= limit`
    pub increment_factor: f64,
}

impl Default for AimdConfig {
    fn default() -> Self {
        Self {
            drop_multiplier: 0.85,
            increment_factor: 1.0,
        }
    }
}

impl AimdConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        check_fraction("drop_multiplier", self.drop_multiplier)?;
        if !self.increment_factor.is_finite() || self.increment_factor <= 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "increment_factor",
                value: self.increment_factor,
                min: f64::MIN_POSITIVE,
                max: f64::MAX,
            });
        }
        Ok(())
    }
}

/// Settings for the latency-driven strategies
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyConfig {
    pub desirable_latency: Duration,
    pub max_acceptable_latency: Duration,
    /// Expected calls per second
    pub desirable_average_throughput: f64,
    /// Factor in (0, 1) applied to the limit when latency is unacceptable
    pub concurrency_drop_multiplier: f64,
    /// Span of one latency estimate
    pub window_for_adaptation: Duration,
    /// Span after which the estimator starts over
    pub window_for_reconfiguration: Duration,
}

impl LatencyConfig {
    /// Smallest valid windows for the given throughput
    pub fn new(
        desirable_latency: Duration,
        max_acceptable_latency: Duration,
        desirable_average_throughput: f64,
    ) -> Self {
        let adaptation_ms = if desirable_average_throughput > 0.0 {
            (MIN_SAMPLES_PER_ADAPTATION * 1000.0 / desirable_average_throughput).ceil()
        } else {
            0.0
        };
        let window_for_adaptation = Duration::from_millis(adaptation_ms as u64);
        Self {
            desirable_latency,
            max_acceptable_latency,
            desirable_average_throughput,
            concurrency_drop_multiplier: 0.85,
            window_for_adaptation,
            window_for_reconfiguration: window_for_adaptation
                .saturating_mul(MIN_ADAPTATIONS_PER_RECONFIGURATION),
        }
    }

    pub fn with_concurrency_drop_multiplier(mut self, multiplier: f64) -> Self {
        self.concurrency_drop_multiplier = multiplier;
        self
    }

    pub fn with_windows(mut self, adaptation: Duration, reconfiguration: Duration) -> Self {
        self.window_for_adaptation = adaptation;
        self.window_for_reconfiguration = reconfiguration;
        self
    }

    /// Latency samples that make up one adaptation window
    pub fn samples_per_adaptation(&self) -> usize {
        let samples =
            (self.window_for_adaptation.as_secs_f64() * self.desirable_average_throughput).ceil();
        (samples as usize).max(1)
    }

    /// Limit that sustains the desired throughput at the desired latency
    pub fn initial_limit(&self) -> usize {
        let limit =
            (self.desirable_average_throughput * self.desirable_latency.as_secs_f64()).ceil();
        (limit as usize).max(1)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check_duration("desirable_latency", self.desirable_latency)?;
        ConfigError::check_duration("max_acceptable_latency", self.max_acceptable_latency)?;
        if !self.desirable_average_throughput.is_finite() || self.desirable_average_throughput <= 0.0
        {
            return Err(ConfigError::NotPositive {
                field: "desirable_average_throughput",
            });
        }
        if self.max_acceptable_latency < self.desirable_latency {
            return Err(ConfigError::invalid(
                "max_acceptable_latency",
                format!(
                    "{:?} is less than desirable_latency {:?}",
                    self.max_acceptable_latency, self.desirable_latency
                ),
            ));
        }
        check_fraction("concurrency_drop_multiplier", self.concurrency_drop_multiplier)?;

        let samples = self.window_for_adaptation.as_secs_f64() * self.desirable_average_throughput;
        if samples + 1e-9 < MIN_SAMPLES_PER_ADAPTATION {
            return Err(ConfigError::invalid(
                "window_for_adaptation",
                format!(
                    "too small: holds {samples:.1} measurements, at least {MIN_SAMPLES_PER_ADAPTATION} required"
                ),
            ));
        }
        let min_reconfiguration = self
            .window_for_adaptation
            .saturating_mul(MIN_ADAPTATIONS_PER_RECONFIGURATION);
        if self.window_for_reconfiguration < min_reconfiguration {
            return Err(ConfigError::invalid(
                "window_for_reconfiguration",
                format!(
                    "must be at least {MIN_ADAPTATIONS_PER_RECONFIGURATION} times window_for_adaptation ({min_reconfiguration:?})"
                ),
            ));
        }
        Ok(())
    }
}

/// Algorithm that computes the next limit
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum AdaptationStrategy {
    /// Multiplicative growth in SLOW_START, additive in CONGESTION_AVOIDANCE,
    /// multiplicative decrease on exceeded rate thresholds
    #[default]
    StateMachine,
    /// Additive increase while saturated, multiplicative decrease on exceeded thresholds
    Aimd(AimdConfig),
    /// Exponential moving average of latency
    MovingAverage(LatencyConfig),
    /// Latency percentile in (0, 100]
    Percentile(LatencyConfig, f64),
}

/// Adaptive bulkhead configuration
#[derive(Debug, Clone)]
pub struct AdaptiveBulkheadConfig {
    pub min_concurrent_calls: usize,
    pub max_concurrent_calls: usize,
    /// Ignored by the latency strategies, which derive their own
    pub initial_concurrent_calls: usize,
    /// Longest blocking wait for a permit; zero never blocks
    pub max_wait_duration: Duration,
    pub failure_rate_threshold: f32,
    pub slow_call_rate_threshold: f32,
    pub slow_call_duration_threshold: Duration,
    pub sliding_window_type: WindowType,
    pub sliding_window_size: usize,
    pub minimum_number_of_calls: usize,
    /// SLOW_START growth factor, greater than 1
    pub increase_multiplier: f64,
    /// Decrease factor in (0, 1)
    pub decrease_multiplier: f64,
    /// CONGESTION_AVOIDANCE growth step
    pub increase_summand: usize,
    /// Clear the window whenever the state changes
    pub reset_metrics_on_transition: bool,
    pub strategy: AdaptationStrategy,
    pub failure_classifier: Arc<dyn FailureClassifier>,
    pub record_result: Option<ResultPredicate>,
}

impl Default for AdaptiveBulkheadConfig {
    fn default() -> Self {
        Self {
            min_concurrent_calls: DEFAULT_MIN_CONCURRENT_CALLS,
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            initial_concurrent_calls: DEFAULT_INITIAL_CONCURRENT_CALLS,
            max_wait_duration: Duration::ZERO,
            failure_rate_threshold: DEFAULT_FAILURE_RATE_THRESHOLD,
            slow_call_rate_threshold: DEFAULT_SLOW_CALL_RATE_THRESHOLD,
            slow_call_duration_threshold: DEFAULT_SLOW_CALL_DURATION_THRESHOLD,
            sliding_window_type: WindowType::CountBased,
            sliding_window_size: DEFAULT_SLIDING_WINDOW_SIZE,
            minimum_number_of_calls: DEFAULT_MINIMUM_NUMBER_OF_CALLS,
            increase_multiplier: DEFAULT_INCREASE_MULTIPLIER,
            decrease_multiplier: DEFAULT_DECREASE_MULTIPLIER,
            increase_summand: DEFAULT_INCREASE_SUMMAND,
            reset_metrics_on_transition: false,
            strategy: AdaptationStrategy::StateMachine,
            failure_classifier: default_classifier(),
            record_result: None,
        }
    }
}

impl AdaptiveBulkheadConfig {
    pub fn builder() -> AdaptiveBulkheadConfigBuilder {
        AdaptiveBulkheadConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check_positive("min_concurrent_calls", self.min_concurrent_calls)?;
        if self.max_concurrent_calls < self.min_concurrent_calls {
            return Err(ConfigError::invalid(
                "max_concurrent_calls",
                format!(
                    "{} is less than min_concurrent_calls {}",
                    self.max_concurrent_calls, self.min_concurrent_calls
                ),
            ));
        }
        if !(self.min_concurrent_calls..=self.max_concurrent_calls)
            .contains(&self.initial_concurrent_calls)
        {
            return Err(ConfigError::invalid(
                "initial_concurrent_calls",
                format!(
                    "{} is outside [{}, {}]",
                    self.initial_concurrent_calls,
                    self.min_concurrent_calls,
                    self.max_concurrent_calls
                ),
            ));
        }
        ConfigError::check_rate("failure_rate_threshold", self.failure_rate_threshold)?;
        ConfigError::check_rate("slow_call_rate_threshold", self.slow_call_rate_threshold)?;
        ConfigError::check_duration(
            "slow_call_duration_threshold",
            self.slow_call_duration_threshold,
        )?;
        ConfigError::check_positive("sliding_window_size", self.sliding_window_size)?;
        ConfigError::check_positive("minimum_number_of_calls", self.minimum_number_of_calls)?;
        if !self.increase_multiplier.is_finite() || self.increase_multiplier <= 1.0 {
            return Err(ConfigError::OutOfRange {
                field: "increase_multiplier",
                value: self.increase_multiplier,
                min: 1.0,
                max: f64::MAX,
            });
        }
        check_fraction("decrease_multiplier", self.decrease_multiplier)?;
        ConfigError::check_positive("increase_summand", self.increase_summand)?;

        match &self.strategy {
            AdaptationStrategy::StateMachine => Ok(()),
            AdaptationStrategy::Aimd(aimd) => aimd.validate(),
            AdaptationStrategy::MovingAverage(latency) => latency.validate(),
            AdaptationStrategy::Percentile(latency, percentile) => {
                if !(*percentile > 0.0 && *percentile <= 100.0) {
                    return Err(ConfigError::OutOfRange {
                        field: "percentile",
                        value: *percentile,
                        min: 0.0,
                        max: 100.0,
                    });
                }
                latency.validate()
            }
        }
    }

    /// Starting limit for the configured strategy, within bounds
    pub fn initial_limit(&self) -> usize {
        let limit = match &self.strategy {
            AdaptationStrategy::MovingAverage(latency)
            | AdaptationStrategy::Percentile(latency, _) => latency.initial_limit(),
            _ => self.initial_concurrent_calls,
        };
        self.clamp(limit)
    }

    pub(crate) fn clamp(&self, limit: usize) -> usize {
        limit.clamp(self.min_concurrent_calls, self.max_concurrent_calls)
    }

    pub(crate) fn thresholds(&self) -> Thresholds {
        Thresholds {
            failure_rate: self.failure_rate_threshold,
            slow_call_rate: self.slow_call_rate_threshold,
            slow_call_duration: self.slow_call_duration_threshold,
            minimum_calls: self.minimum_number_of_calls,
        }
    }
}

/// Fluent builder; every check runs in [`build`](Self::build)
#[derive(Debug, Clone)]
pub struct AdaptiveBulkheadConfigBuilder {
    config: AdaptiveBulkheadConfig,
}

impl AdaptiveBulkheadConfigBuilder {
    pub fn min_concurrent_calls(mut self, calls: usize) -> Self {
        self.config.min_concurrent_calls = calls;
        self
    }

    pub fn max_concurrent_calls(mut self, calls: usize) -> Self {
        self.config.max_concurrent_calls = calls;
        self
    }

    pub fn initial_concurrent_calls(mut self, calls: usize) -> Self {
        self.config.initial_concurrent_calls = calls;
        self
    }

    pub fn max_wait_duration(mut self, wait: Duration) -> Self {
        self.config.max_wait_duration = wait;
        self
    }

    pub fn failure_rate_threshold(mut self, rate: f32) -> Self {
        self.config.failure_rate_threshold = rate;
        self
    }

    pub fn slow_call_rate_threshold(mut self, rate: f32) -> Self {
        self.config.slow_call_rate_threshold = rate;
        self
    }

    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    pub fn sliding_window(mut self, window_type: WindowType, size: usize) -> Self {
        self.config.sliding_window_type = window_type;
        self.config.sliding_window_size = size;
        self
    }

    pub fn minimum_number_of_calls(mut self, calls: usize) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    pub fn increase_multiplier(mut self, multiplier: f64) -> Self {
        self.config.increase_multiplier = multiplier;
        self
    }

    pub fn decrease_multiplier(mut self, multiplier: f64) -> Self {
        self.config.decrease_multiplier = multiplier;
        self
    }

    pub fn increase_summand(mut self, summand: usize) -> Self {
        self.config.increase_summand = summand;
        self
    }

    pub fn reset_metrics_on_transition(mut self, reset: bool) -> Self {
        self.config.reset_metrics_on_transition = reset;
        self
    }

    pub fn strategy(mut self, strategy: AdaptationStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

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

    pub fn build(self) -> Result<AdaptiveBulkheadConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn check_fraction(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min: 0.0,
            max: 1.0,
        })
    }
}
