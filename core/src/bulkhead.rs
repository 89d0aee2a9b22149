//! Bulkhead implementation for concurrency limiting
//!
//! This module provides:
//! - `BulkheadSemaphore`: an atomic permit counter with an adjustable limit,
//!   bounded blocking acquisition and interruptible waiters
//! - `Bulkhead`: a named, configured bulkhead with events and metrics

use crate::errors::{CallError, ConfigError, Rejection};
use crate::events::{Event, EventPublisher};
use parking_lot::{Condvar, Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Why a permit could not be acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// No permit became available in time
    Full,
    /// The wait was interrupted by `interrupt_waiters`
    Interrupted,
}

/// A semaphore-based bulkhead for limiting concurrent operations
///
/// The limit can change while permits are held. Lowering it below the
/// number of acquired permits only blocks new acquisitions; nothing already
/// admitted is revoked.
#[derive(Debug)]
pub struct BulkheadSemaphore {
    /// Maximum number of concurrent permits
    limit: AtomicUsize,
    /// Current number of acquired permits
    acquired: AtomicUsize,
    /// Threads parked in `acquire`
    waiters: AtomicUsize,
    /// Bumped by `interrupt_waiters`
    interrupts: AtomicU64,
    lock: Mutex<()>,
    released: Condvar,
}

impl BulkheadSemaphore {
    /// Create a new bulkhead semaphore with the given concurrency limit
    ///
    /// # Panics
    ///
    /// Panics if `limit` is 0.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "Bulkhead limit must be greater than 0");
        Self {
            limit: AtomicUsize::new(limit),
            acquired: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
            interrupts: AtomicU64::new(0),
            lock: Mutex::new(()),
            released: Condvar::new(),
        }
    }

    /// Try to acquire a permit without blocking
    ///
    /// Returns `Some(BulkheadGuard)` if a permit was acquired, or `None` if
    /// the bulkhead is at capacity.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BulkheadGuard> {
        self.try_acquire_permit().then(|| BulkheadGuard {
            semaphore: Arc::clone(self),
        })
    }

    /// Acquire a permit, waiting up to `max_wait` for one to free up
    pub fn acquire(self: &Arc<Self>, max_wait: Duration) -> Result<BulkheadGuard, AcquireError> {
        self.acquire_permit(max_wait).map(|()| BulkheadGuard {
            semaphore: Arc::clone(self),
        })
    }

    /// Guard-less variant of `try_acquire`; pair with `release_permit`
    pub fn try_acquire_permit(&self) -> bool {
        let mut current = self.acquired.load(Ordering::SeqCst);

        loop {
            // Check if we're at capacity
            if current >= self.limit.load(Ordering::SeqCst) {
                return false;
            }

            match self.acquired.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                // Another thread modified the counter, try again
                Err(actual) => current = actual,
            }
        }
    }

    /// Guard-less variant of `acquire`; pair with `release_permit`
    pub fn acquire_permit(&self, max_wait: Duration) -> Result<(), AcquireError> {
        if self.try_acquire_permit() {
            return Ok(());
        }
        if max_wait.is_zero() {
            return Err(AcquireError::Full);
        }

        let deadline = Instant::now() + max_wait;
        let epoch = self.interrupts.load(Ordering::SeqCst);
        let mut guard = self.lock.lock();
        self.waiters.fetch_add(1, Ordering::SeqCst);

        let outcome = loop {
            if self.try_acquire_permit() {
                break Ok(());
            }
            if self.interrupts.load(Ordering::SeqCst) != epoch {
                break Err(AcquireError::Interrupted);
            }
            if self.released.wait_until(&mut guard, deadline).timed_out() {
                break if self.try_acquire_permit() {
                    Ok(())
                } else {
                    Err(AcquireError::Full)
                };
            }
        };

        self.waiters.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    /// Return a permit; releasing more permits than were acquired is a no-op
    ///
    /// Returns the number of permits held just before this release, or
    /// `None` if none were held.
    pub fn release_permit(&self) -> Option<usize> {
        let held = self
            .acquired
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok();

        if held.is_some() && self.waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.released.notify_one();
        }
        held
    }

    /// Change the concurrency limit
    ///
    /// # Panics
    ///
    /// Panics if `limit` is 0.
    pub fn set_limit(&self, limit: usize) {
        assert!(limit > 0, "Bulkhead limit must be greater than 0");
        let previous = self.limit.swap(limit, Ordering::SeqCst);
        if limit > previous && self.waiters.load(Ordering::SeqCst) > 0 {
            let _guard = self.lock.lock();
            self.released.notify_all();
        }
    }

    /// Wake every waiting `acquire` call with `AcquireError::Interrupted`
    pub fn interrupt_waiters(&self) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        let _guard = self.lock.lock();
        self.released.notify_all();
    }

    /// Get the current number of acquired permits
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Get the maximum number of permits (bulkhead limit)
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    /// Get the number of available permits
    pub fn available(&self) -> usize {
        self.limit().saturating_sub(self.acquired())
    }
}

/// Guard that releases a bulkhead permit when dropped
///
/// This ensures that permits are always released, even if the guarded
/// operation panics or its future is dropped mid-flight.
#[derive(Debug)]
pub struct BulkheadGuard {
    semaphore: Arc<BulkheadSemaphore>,
}

impl Drop for BulkheadGuard {
    fn drop(&mut self) {
        self.semaphore.release_permit();
    }
}

/// Bulkhead configuration
#[derive(Debug, Clone, PartialEq)]
pub struct BulkheadConfig {
    pub max_concurrent_calls: usize,
    /// Zero means never block
    pub max_wait_duration: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 25,
            max_wait_duration: Duration::ZERO,
        }
    }
}

impl BulkheadConfig {
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check_positive("max_concurrent_calls", self.max_concurrent_calls)
    }
}

/// Fluent builder for [`BulkheadConfig`]
#[derive(Debug, Clone)]
pub struct BulkheadConfigBuilder {
    config: BulkheadConfig,
}

impl BulkheadConfigBuilder {
    pub fn max_concurrent_calls(mut self, calls: usize) -> Self {
        self.config.max_concurrent_calls = calls;
        self
    }

    pub fn max_wait_duration(mut self, wait: Duration) -> Self {
        self.config.max_wait_duration = wait;
        self
    }

    pub fn build(self) -> Result<BulkheadConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Events published by [`Bulkhead`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkheadEvent {
    CallPermitted { name: String },
    CallRejected { name: String },
    CallFinished { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkheadEventKind {
    CallPermitted,
    CallRejected,
    CallFinished,
}

impl Event for BulkheadEvent {
    type Kind = BulkheadEventKind;

    fn kind(&self) -> BulkheadEventKind {
        match self {
            BulkheadEvent::CallPermitted { .. } => BulkheadEventKind::CallPermitted,
            BulkheadEvent::CallRejected { .. } => BulkheadEventKind::CallRejected,
            BulkheadEvent::CallFinished { .. } => BulkheadEventKind::CallFinished,
        }
    }
}

/// Point-in-time bulkhead metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadMetrics {
    pub available_concurrent_calls: usize,
    pub max_allowed_concurrent_calls: usize,
}

/// A named bulkhead with a fixed (but reconfigurable) limit
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    config: RwLock<BulkheadConfig>,
    semaphore: Arc<BulkheadSemaphore>,
    events: EventPublisher<BulkheadEvent>,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_valid(name.into(), config))
    }

    pub fn of_defaults(name: impl Into<String>) -> Self {
        Self::from_valid(name.into(), BulkheadConfig::default())
    }

    fn from_valid(name: String, config: BulkheadConfig) -> Self {
        Self {
            semaphore: Arc::new(BulkheadSemaphore::new(config.max_concurrent_calls)),
            config: RwLock::new(config),
            events: EventPublisher::new(name.clone()),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> BulkheadConfig {
        self.config.read().clone()
    }

    pub fn events(&self) -> &EventPublisher<BulkheadEvent> {
        &self.events
    }

    /// Swap in a new limit and wait duration; held permits stay valid
    pub fn change_config(&self, config: BulkheadConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.semaphore.set_limit(config.max_concurrent_calls);
        *self.config.write() = config;
        Ok(())
    }

    /// Non-blocking admission
    pub fn try_acquire_permission(&self) -> bool {
        let permitted = self.semaphore.try_acquire_permit();
        self.publish_admission(permitted);
        permitted
    }

    /// Admission waiting up to `max_wait_duration`
    pub fn acquire_permission(&self) -> Result<(), Rejection> {
        let max_wait = self.config.read().max_wait_duration;
        let result = self.semaphore.acquire_permit(max_wait);
        self.publish_admission(result.is_ok());
        result.map_err(|e| self.rejection(e))
    }

    /// Return a permission that was acquired but not used
    pub fn release_permission(&self) {
        self.semaphore.release_permit();
    }

    /// Return the permission of a call that ran to completion
    pub fn on_complete(&self) {
        self.semaphore.release_permit();
        self.events.publish(BulkheadEvent::CallFinished {
            name: self.name.clone(),
        });
    }

    /// Make every thread waiting in `acquire_permission` give up
    pub fn interrupt_waiters(&self) {
        self.semaphore.interrupt_waiters();
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            available_concurrent_calls: self.semaphore.available(),
            max_allowed_concurrent_calls: self.semaphore.limit(),
        }
    }

    /// Run `f` while holding a permit
    pub fn call<T, E, F>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        let max_wait = self.config.read().max_wait_duration;
        let guard = self.semaphore.acquire(max_wait);
        self.publish_admission(guard.is_ok());
        let _guard = guard.map_err(|e| self.rejection(e))?;

        let result = f().map_err(CallError::Execution);
        self.events.publish(BulkheadEvent::CallFinished {
            name: self.name.clone(),
        });
        result
    }

    /// Run a future while holding a permit
    ///
    /// Admission never blocks the executor: the permit is taken with a
    /// non-blocking attempt. Dropping the returned future releases the permit.
    pub async fn call_async<T, E, F, Fut>(&self, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let guard = self.semaphore.try_acquire();
        self.publish_admission(guard.is_some());
        let _guard = guard.ok_or_else(|| self.rejection(AcquireError::Full))?;

        let result = f().await.map_err(CallError::Execution);
        self.events.publish(BulkheadEvent::CallFinished {
            name: self.name.clone(),
        });
        result
    }

    fn publish_admission(&self, permitted: bool) {
        let name = self.name.clone();
        self.events.publish(if permitted {
            BulkheadEvent::CallPermitted { name }
        } else {
            BulkheadEvent::CallRejected { name }
        });
    }

    fn rejection(&self, error: AcquireError) -> Rejection {
        match error {
            AcquireError::Full => Rejection::BulkheadFull {
                name: self.name.clone(),
                max_concurrent_calls: self.semaphore.limit(),
            },
            AcquireError::Interrupted => Rejection::AcquireInterrupted {
                name: self.name.clone(),
            },
        }
    }
}
