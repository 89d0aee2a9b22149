//! Sliding-window call metrics
//!
//! This module provides the two window shapes used by the circuit breaker and
//! the adaptive bulkhead:
//! - `CountWindow`: the last N calls, one slot per call
//! - `TimeWindow`: the last N seconds, one bucket per second, rotated lazily
//!   by whichever thread records or reads next
//!
//! Both keep running totals that are decremented as slots are evicted, so a
//! snapshot never has to walk the ring.

use crate::clock::Clock;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Rate reported while fewer than the minimum number of calls are buffered
pub const NOT_ENOUGH_DATA: f32 = -1.0;

/// Classified outcome of one completed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
    SlowSuccess,
    SlowError,
}

impl Outcome {
    /// Classify a call; a call is slow once it reaches `slow_threshold`
    pub fn classify(failed: bool, duration: Duration, slow_threshold: Duration) -> Self {
        match (failed, duration >= slow_threshold) {
            (false, false) => Outcome::Success,
            (true, false) => Outcome::Error,
            (false, true) => Outcome::SlowSuccess,
            (true, true) => Outcome::SlowError,
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, Outcome::Error | Outcome::SlowError)
    }

    pub fn is_slow(self) -> bool {
        matches!(self, Outcome::SlowSuccess | Outcome::SlowError)
    }
}

/// Window shape selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WindowType {
    /// Size is a number of calls
    #[default]
    CountBased,
    /// Size is a number of seconds
    TimeBased,
}

/// Aggregated counters for a set of calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Totals {
    calls: u64,
    failed: u64,
    slow: u64,
    slow_failed: u64,
    duration_nanos: u128,
}

impl Totals {
    fn add(&mut self, outcome: Outcome, nanos: u128) {
        self.calls += 1;
        self.duration_nanos += nanos;
        if outcome.is_error() {
            self.failed += 1;
        }
        if outcome.is_slow() {
            self.slow += 1;
        }
        if outcome == Outcome::SlowError {
            self.slow_failed += 1;
        }
    }

    fn subtract(&mut self, other: &Totals) {
        self.calls = self.calls.saturating_sub(other.calls);
        self.failed = self.failed.saturating_sub(other.failed);
        self.slow = self.slow.saturating_sub(other.slow);
        self.slow_failed = self.slow_failed.saturating_sub(other.slow_failed);
        self.duration_nanos = self.duration_nanos.saturating_sub(other.duration_nanos);
    }

    fn merge(&mut self, other: &Totals) {
        self.calls += other.calls;
        self.failed += other.failed;
        self.slow += other.slow;
        self.slow_failed += other.slow_failed;
        self.duration_nanos += other.duration_nanos;
    }
}

/// Point-in-time view of a window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    totals: Totals,
}

impl Snapshot {
    pub fn total_calls(&self) -> u64 {
        self.totals.calls
    }

    pub fn failed_calls(&self) -> u64 {
        self.totals.failed
    }

    pub fn successful_calls(&self) -> u64 {
        self.totals.calls - self.totals.failed
    }

    pub fn slow_calls(&self) -> u64 {
        self.totals.slow
    }

    pub fn slow_failed_calls(&self) -> u64 {
        self.totals.slow_failed
    }

    pub fn slow_successful_calls(&self) -> u64 {
        self.totals.slow - self.totals.slow_failed
    }

    pub fn total_duration(&self) -> Duration {
        nanos_to_duration(self.totals.duration_nanos)
    }

    /// Mean call duration, zero for an empty window
    pub fn average_duration(&self) -> Duration {
        if self.totals.calls == 0 {
            return Duration::ZERO;
        }
        nanos_to_duration(self.totals.duration_nanos / u128::from(self.totals.calls))
    }

    /// Failed calls as a percentage of all buffered calls
    pub fn failure_rate(&self) -> f32 {
        percentage(self.totals.failed, self.totals.calls)
    }

    /// Slow calls as a percentage of all buffered calls
    pub fn slow_call_rate(&self) -> f32 {
        percentage(self.totals.slow, self.totals.calls)
    }
}

fn percentage(part: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        (part as f64 * 100.0 / total as f64) as f32
    }
}

fn nanos_to_duration(nanos: u128) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    let secs = u64::try_from(nanos / NANOS_PER_SEC).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % NANOS_PER_SEC) as u32)
}

/// A fixed-capacity rolling record of call outcomes
pub trait SlidingWindow: Send + fmt::Debug {
    /// Record one call and return the updated snapshot
    fn record(&mut self, duration: Duration, outcome: Outcome, now: Duration) -> Snapshot;

    /// Current totals, after evicting anything that aged out by `now`
    fn snapshot(&mut self, now: Duration) -> Snapshot;

    /// Drop every buffered call
    fn reset(&mut self);

    /// Window size in calls or seconds
    fn size(&self) -> usize;
}

/// Window over the last `size` calls
#[derive(Debug)]
pub struct CountWindow {
    slots: Vec<Option<(Outcome, u128)>>,
    head: usize,
    totals: Totals,
}

impl CountWindow {
    /// # Panics
    ///
    /// Panics if `size` is 0; configs reject that before a window is built.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "Window size must be greater than 0");
        Self {
            slots: vec![None; size],
            head: 0,
            totals: Totals::default(),
        }
    }
}

impl SlidingWindow for CountWindow {
    fn record(&mut self, duration: Duration, outcome: Outcome, _now: Duration) -> Snapshot {
        let nanos = duration.as_nanos();

        // Evict the oldest call before reusing its slot
        if let Some((old, old_nanos)) = self.slots[self.head].take() {
            let mut evicted = Totals::default();
            evicted.add(old, old_nanos);
            self.totals.subtract(&evicted);
        }

        self.slots[self.head] = Some((outcome, nanos));
        self.totals.add(outcome, nanos);
        self.head = (self.head + 1) % self.slots.len();

        Snapshot {
            totals: self.totals,
        }
    }

    fn snapshot(&mut self, _now: Duration) -> Snapshot {
        Snapshot {
            totals: self.totals,
        }
    }

    fn reset(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.head = 0;
        self.totals = Totals::default();
    }

    fn size(&self) -> usize {
        self.slots.len()
    }
}

/// Window over the last `size` seconds
#[derive(Debug)]
pub struct TimeWindow {
    buckets: Vec<Totals>,
    head_second: u64,
    totals: Totals,
}

impl TimeWindow {
    /// # Panics
    ///
    /// Panics if `size_secs` is 0; configs reject that before a window is built.
    pub fn new(size_secs: usize, now: Duration) -> Self {
        assert!(size_secs > 0, "Window size must be greater than 0");
        Self {
            buckets: vec![Totals::default(); size_secs],
            head_second: now.as_secs(),
            totals: Totals::default(),
        }
    }

    /// Clear every bucket whose second fell out of the window since the last call
    fn rotate(&mut self, now: Duration) {
        let now_second = now.as_secs();
        if now_second <= self.head_second {
            return;
        }

        let len = self.buckets.len() as u64;
        let steps = (now_second - self.head_second).min(len);
        for second in (now_second - steps + 1)..=now_second {
            let idx = (second % len) as usize;
            let stale = std::mem::take(&mut self.buckets[idx]);
            self.totals.subtract(&stale);
        }
        self.head_second = now_second;
    }
}

impl SlidingWindow for TimeWindow {
    fn record(&mut self, duration: Duration, outcome: Outcome, now: Duration) -> Snapshot {
        self.rotate(now);

        let nanos = duration.as_nanos();
        let idx = (self.head_second % self.buckets.len() as u64) as usize;
        let mut call = Totals::default();
        call.add(outcome, nanos);
        self.buckets[idx].merge(&call);
        self.totals.merge(&call);

        Snapshot {
            totals: self.totals,
        }
    }

    fn snapshot(&mut self, now: Duration) -> Snapshot {
        self.rotate(now);
        Snapshot {
            totals: self.totals,
        }
    }

    fn reset(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = Totals::default());
        self.totals = Totals::default();
    }

    fn size(&self) -> usize {
        self.buckets.len()
    }
}

/// Classification of a window against its thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowResult {
    BelowMinimumCallsThreshold,
    BelowThresholds,
    AboveThresholds,
}

/// Thresholds a window is judged against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Percentage in (0, 100]
    pub failure_rate: f32,
    /// Percentage in (0, 100]
    pub slow_call_rate: f32,
    pub slow_call_duration: Duration,
    pub minimum_calls: usize,
}

/// Result of recording a call or evaluating a window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub result: WindowResult,
    /// `NOT_ENOUGH_DATA` below the minimum number of calls
    pub failure_rate: f32,
    /// `NOT_ENOUGH_DATA` below the minimum number of calls
    pub slow_call_rate: f32,
    pub snapshot: Snapshot,
}

impl Evaluation {
    pub fn failure_rate_exceeded(&self, thresholds: &Thresholds) -> bool {
        self.failure_rate >= thresholds.failure_rate
    }

    pub fn slow_call_rate_exceeded(&self, thresholds: &Thresholds) -> bool {
        self.slow_call_rate >= thresholds.slow_call_rate
    }
}

/// Thread-safe sliding window judged against thresholds
pub struct WindowMetrics {
    window: Mutex<Box<dyn SlidingWindow>>,
    window_type: WindowType,
    thresholds: Thresholds,
    clock: Arc<dyn Clock>,
}

impl WindowMetrics {
    /// Build a window of `size` calls or seconds
    pub fn new(
        window_type: WindowType,
        size: usize,
        thresholds: Thresholds,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let window: Box<dyn SlidingWindow> = match window_type {
            WindowType::CountBased => Box::new(CountWindow::new(size)),
            WindowType::TimeBased => Box::new(TimeWindow::new(size, clock.now())),
        };

        // A count window can never hold more calls than its size
        let thresholds = match window_type {
            WindowType::CountBased => Thresholds {
                minimum_calls: thresholds.minimum_calls.min(size),
                ..thresholds
            },
            WindowType::TimeBased => thresholds,
        };

        Self {
            window: Mutex::new(window),
            window_type,
            thresholds,
            clock,
        }
    }

    /// Record a call that completed without a recorded failure
    pub fn on_success(&self, duration: Duration) -> Evaluation {
        self.record(duration, false)
    }

    /// Record a call that failed
    pub fn on_error(&self, duration: Duration) -> Evaluation {
        self.record(duration, true)
    }

    /// Record a call, classifying it as slow against the configured threshold
    pub fn record(&self, duration: Duration, failed: bool) -> Evaluation {
        let outcome = Outcome::classify(failed, duration, self.thresholds.slow_call_duration);
        let snapshot = self.window.lock().record(duration, outcome, self.clock.now());
        self.evaluate(snapshot)
    }

    /// Evaluate the window as it stands now
    pub fn current(&self) -> Evaluation {
        let snapshot = self.window.lock().snapshot(self.clock.now());
        self.evaluate(snapshot)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.window.lock().snapshot(self.clock.now())
    }

    pub fn reset(&self) {
        self.window.lock().reset();
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn window_type(&self) -> WindowType {
        self.window_type
    }

    pub fn size(&self) -> usize {
        self.window.lock().size()
    }

    fn evaluate(&self, snapshot: Snapshot) -> Evaluation {
        if snapshot.total_calls() < self.thresholds.minimum_calls as u64 {
            return Evaluation {
                result: WindowResult::BelowMinimumCallsThreshold,
                failure_rate: NOT_ENOUGH_DATA,
                slow_call_rate: NOT_ENOUGH_DATA,
                snapshot,
            };
        }

        let failure_rate = snapshot.failure_rate();
        let slow_call_rate = snapshot.slow_call_rate();
        let result = if failure_rate >= self.thresholds.failure_rate
            || slow_call_rate >= self.thresholds.slow_call_rate
        {
            WindowResult::AboveThresholds
        } else {
            WindowResult::BelowThresholds
        };

        Evaluation {
            result,
            failure_rate,
            slow_call_rate,
            snapshot,
        }
    }
}

impl fmt::Debug for WindowMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowMetrics")
            .field("window_type", &self.window_type)
            .field("thresholds", &self.thresholds)
            .finish()
    }
}
