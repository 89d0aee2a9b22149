//! Error types for protected calls and configuration

use crate::circuit::CircuitState;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a protected call
///
/// Every variant except `Execution` is raised by the primitive itself and
/// never reaches the metrics of the component that raised it.
#[derive(Debug, Error)]
pub enum CallError<E = Box<dyn std::error::Error + Send + Sync>> {
    /// Circuit is OPEN or FORCED_OPEN, or HALF_OPEN with no trial permits left
    #[error("CircuitBreaker '{name}' is {state} and does not permit further calls")]
    CallNotPermitted { name: String, state: CircuitState },

    /// Bulkhead is at its concurrency limit
    #[error("Bulkhead '{name}' is full and does not permit further calls (limit: {max_concurrent_calls})")]
    BulkheadFull {
        name: String,
        max_concurrent_calls: usize,
    },

    /// A bounded wait for a bulkhead permit was interrupted
    #[error("Waiting for a permit on bulkhead '{name}' was interrupted")]
    AcquireInterrupted { name: String },

    /// Rate limiter had no permission within its timeout
    #[error("RateLimiter '{name}' does not permit further calls")]
    RequestNotPermitted { name: String },

    /// Retry ran out of attempts; `last` is the final error, if the last attempt failed
    #[error("Retry '{name}' has exhausted all attempts ({attempts})")]
    MaxRetriesExceeded {
        name: String,
        attempts: u32,
        #[source]
        last: Option<E>,
    },

    /// Retry budget refused another attempt
    #[error("Retry '{name}' stopped after {attempts} attempt(s): retry budget exceeded")]
    RetryBudgetExceeded {
        name: String,
        attempts: u32,
        #[source]
        last: Option<E>,
    },

    /// Time limiter gave up waiting
    #[error("TimeLimiter '{name}' recorded a timeout after {after:?}")]
    Timeout { name: String, after: Duration },

    /// The wrapped operation failed
    #[error("Protected call failed: {0}")]
    Execution(#[source] E),
}

impl<E> CallError<E> {
    /// True for rejections raised before the protected operation ran
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CallError::CallNotPermitted { .. }
                | CallError::BulkheadFull { .. }
                | CallError::AcquireInterrupted { .. }
                | CallError::RequestNotPermitted { .. }
        )
    }

    /// The downstream error, if the operation itself failed
    pub fn into_execution(self) -> Option<E> {
        match self {
            CallError::Execution(e) => Some(e),
            CallError::MaxRetriesExceeded { last, .. }
            | CallError::RetryBudgetExceeded { last, .. } => last,
            _ => None,
        }
    }
}

/// Admission refused before the protected operation ran
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("CircuitBreaker '{name}' is {state} and does not permit further calls")]
    CallNotPermitted { name: String, state: CircuitState },

    #[error("Bulkhead '{name}' is full and does not permit further calls (limit: {max_concurrent_calls})")]
    BulkheadFull {
        name: String,
        max_concurrent_calls: usize,
    },

    #[error("Waiting for a permit on bulkhead '{name}' was interrupted")]
    AcquireInterrupted { name: String },

    #[error("RateLimiter '{name}' does not permit further calls")]
    RequestNotPermitted { name: String },
}

impl<E> From<Rejection> for CallError<E> {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::CallNotPermitted { name, state } => CallError::CallNotPermitted { name, state },
            Rejection::BulkheadFull {
                name,
                max_concurrent_calls,
            } => CallError::BulkheadFull {
                name,
                max_concurrent_calls,
            },
            Rejection::AcquireInterrupted { name } => CallError::AcquireInterrupted { name },
            Rejection::RequestNotPermitted { name } => CallError::RequestNotPermitted { name },
        }
    }
}

/// Configuration rejected at build time
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{field} is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }

    /// Rates are percentages in (0, 100]
    pub(crate) fn check_rate(field: &'static str, value: f32) -> Result<(), Self> {
        if value > 0.0 && value <= 100.0 {
            Ok(())
        } else {
            Err(ConfigError::OutOfRange {
                field,
                value: f64::from(value),
                min: 0.0,
                max: 100.0,
            })
        }
    }

    pub(crate) fn check_positive(field: &'static str, value: usize) -> Result<(), Self> {
        if value > 0 {
            Ok(())
        } else {
            Err(ConfigError::NotPositive { field })
        }
    }

    pub(crate) fn check_duration(field: &'static str, value: Duration) -> Result<(), Self> {
        if value.is_zero() {
            Err(ConfigError::NotPositive { field })
        } else {
            Ok(())
        }
    }
}

/// An administrative circuit transition outside the legal edges
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("CircuitBreaker '{name}' cannot transition from {from} to {to}")]
pub struct IllegalTransition {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
}
