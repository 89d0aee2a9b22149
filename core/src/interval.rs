//! Backoff interval functions
//!
//! An [`IntervalFunction`] maps a 1-based attempt number to the time to wait
//! before that attempt is retried (or before an OPEN circuit lets trial calls through again).

use crate::errors::ConfigError;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;

type IntervalFn = dyn Fn(u32) -> Duration + Send + Sync;

/// Attempt number to wait duration
#[derive(Clone)]
pub struct IntervalFunction {
    f: Arc<IntervalFn>,
    kind: &'static str,
}

impl IntervalFunction {
    /// Same wait for every attempt
    pub fn of(interval: Duration) -> Result<Self, ConfigError> {
        check_interval(interval)?;
        Ok(Self::new("constant", move |_| interval))
    }

    /// `initial * multiplier^(attempt - 1)`
    pub fn exponential(initial: Duration, multiplier: f64) -> Result<Self, ConfigError> {
        Self::exponential_with_max(initial, multiplier, Duration::MAX)
    }

    /// Exponential backoff capped at `max`
    pub fn exponential_with_max(
        initial: Duration,
        multiplier: f64,
        max: Duration,
    ) -> Result<Self, ConfigError> {
        check_interval(initial)?;
        check_multiplier(multiplier)?;
        check_max(initial, max)?;
        Ok(Self::new("exponential", move |attempt| {
            exponential_delay(initial, multiplier, attempt).min(max)
        }))
    }

    /// `interval` spread uniformly over `interval * (1 ± randomization_factor)`
    pub fn randomized(interval: Duration, randomization_factor: f64) -> Result<Self, ConfigError> {
        check_interval(interval)?;
        check_randomization_factor(randomization_factor)?;
        Ok(Self::new("randomized", move |_| {
            randomize(interval, randomization_factor)
        }))
    }

    /// Exponential backoff, randomized per attempt, capped at `max`
    pub fn exponential_randomized(
        initial: Duration,
        multiplier: f64,
        randomization_factor: f64,
        max: Duration,
    ) -> Result<Self, ConfigError> {
        check_interval(initial)?;
        check_multiplier(multiplier)?;
        check_randomization_factor(randomization_factor)?;
        check_max(initial, max)?;
        Ok(Self::new("exponential_randomized", move |attempt| {
            let base = exponential_delay(initial, multiplier, attempt).min(max);
            randomize(base, randomization_factor).min(max)
        }))
    }

    /// Constant interval without validation, for built-in defaults
    pub(crate) fn fixed(interval: Duration) -> Self {
        Self::new("constant", move |_| interval)
    }

    /// Arbitrary function of the attempt number
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self::new("custom", f)
    }

    /// Wait before `attempt` (1-based; 0 is treated as 1)
    pub fn apply(&self, attempt: u32) -> Duration {
        (self.f)(attempt.max(1))
    }

    fn new<F>(kind: &'static str, f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self {
            f: Arc::new(f),
            kind,
        }
    }
}

impl Default for IntervalFunction {
    fn default() -> Self {
        Self::fixed(DEFAULT_INITIAL_INTERVAL)
    }
}

impl fmt::Debug for IntervalFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalFunction")
            .field("kind", &self.kind)
            .finish()
    }
}

fn exponential_delay(initial: Duration, multiplier: f64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = initial.as_secs_f64() * multiplier.powi(exponent);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

fn randomize(interval: Duration, factor: f64) -> Duration {
    if factor == 0.0 {
        return interval;
    }
    let base = interval.as_secs_f64();
    let delta = base * factor;
    let secs = rand::rng().random_range((base - delta)..=(base + delta));
    Duration::try_from_secs_f64(secs).unwrap_or(interval)
}

pub(crate) fn check_interval(interval: Duration) -> Result<(), ConfigError> {
    if interval < Duration::from_millis(1) {
        return Err(ConfigError::invalid(
            "interval",
            format!("must be at least 1ms, got {interval:?}"),
        ));
    }
    Ok(())
}

fn check_multiplier(multiplier: f64) -> Result<(), ConfigError> {
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(ConfigError::OutOfRange {
            field: "multiplier",
            value: multiplier,
            min: 1.0,
            max: f64::MAX,
        });
    }
    Ok(())
}

fn check_randomization_factor(factor: f64) -> Result<(), ConfigError> {
    if !(0.0..1.0).contains(&factor) {
        return Err(ConfigError::OutOfRange {
            field: "randomization_factor",
            value: factor,
            min: 0.0,
            max: 1.0,
        });
    }
    Ok(())
}

fn check_max(initial: Duration, max: Duration) -> Result<(), ConfigError> {
    if max < initial {
        return Err(ConfigError::invalid(
            "max_interval",
            format!("{max:?} is shorter than the initial interval {initial:?}"),
        ));
    }
    Ok(())
}
