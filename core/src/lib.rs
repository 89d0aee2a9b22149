//! ResilienceMachines - fault tolerance primitives for calls to remote backends
//!
//! This crate provides:
//! - A circuit breaker driven by count- or time-based sliding-window metrics
//!   (Closed → Open → HalfOpen, plus Disabled, ForcedOpen and MetricsOnly)
//! - Fixed and adaptive bulkheads; the adaptive one grows and shrinks its
//!   concurrency limit from observed failure and slow-call rates
//! - Retry with backoff intervals and an optional retry budget
//! - A rate limiter and an async time limiter
//! - Per-component event publishers and name-keyed registries
//!
//! # Example
//!
//! ```rust
//! use resilience_machines::{CallError, CircuitBreaker, CircuitState, WindowType};
//! use std::time::Duration;
//!
//! let circuit = CircuitBreaker::builder("inventory")
//!     .sliding_window(WindowType::CountBased, 10, 4)
//!     .failure_rate_threshold(50.0)
//!     .wait_duration_in_open_state(Duration::from_secs(30))
//!     .on_open(|name| println!("Circuit {name} opened!"))
//!     .build()
//!     .unwrap();
//!
//! for _ in 0..4 {
//!     let _ = circuit.call(|| Err::<(), _>("connection refused"));
//! }
//! assert_eq!(circuit.state(), CircuitState::Open);
//!
//! // Rejected without running the closure
//! assert!(matches!(
//!     circuit.call(|| Ok::<_, &str>("stock level")),
//!     Err(CallError::CallNotPermitted { .. })
//! ));
//! ```

pub mod adaptive;
pub mod builder;
pub mod bulkhead;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod errors;
pub mod events;
pub mod interval;
pub mod ratelimiter;
pub mod registry;
pub mod retry;
pub mod scheduler;
#[cfg(feature = "tokio")]
pub mod timelimiter;
pub mod window;

pub use adaptive::config::{
    AdaptationStrategy, AdaptiveBulkheadConfig, AdaptiveBulkheadConfigBuilder, AimdConfig,
    LatencyConfig,
};
pub use adaptive::{
    AdaptiveBulkhead, AdaptiveBulkheadEvent, AdaptiveBulkheadEventKind, AdaptiveBulkheadMetrics,
    AdaptiveBulkheadState, LimitChange,
};
pub use builder::CircuitBuilder;
pub use bulkhead::{
    Bulkhead, BulkheadConfig, BulkheadEvent, BulkheadEventKind, BulkheadGuard, BulkheadMetrics,
    BulkheadSemaphore,
};
pub use circuit::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerEvent, CircuitBreakerEventKind,
    CircuitBreakerMetrics, CircuitState, FallbackContext,
};
pub use classifier::{
    Classification, DefaultClassifier, ExceptionClassifier, FailureClassifier, FailureContext,
    PredicateClassifier, ResultPredicate,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use errors::{CallError, ConfigError, IllegalTransition, Rejection};
pub use events::{Event, EventPublisher, SubscriptionId};
pub use interval::IntervalFunction;
pub use ratelimiter::{RateLimiter, RateLimiterConfig, RateLimiterEvent, RateLimiterMetrics};
pub use registry::{
    AdaptiveBulkheadRegistry, BulkheadRegistry, CircuitBreakerRegistry, RateLimiterRegistry,
    Registry, RetryRegistry,
};
pub use retry::{Retry, RetryConfig, RetryContext, RetryEvent, RetryMetrics};
#[cfg(feature = "tokio")]
pub use scheduler::TokioScheduler;
pub use scheduler::{ScheduledTask, Scheduler, ThreadScheduler};
#[cfg(feature = "tokio")]
pub use timelimiter::{TimeLimiter, TimeLimiterConfig, TimeLimiterEvent};
pub use window::{Outcome, Snapshot, WindowType};
