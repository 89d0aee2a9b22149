//! Limit policies: how a recorded call turns into the next concurrency limit
//!
//! Every policy sees the same [`Observation`] and returns a [`Verdict`]. The
//! bulkhead clamps the verdict to its bounds and owns the state changes, so a
//! policy never touches the semaphore directly.

use super::AdaptiveBulkheadState;
use super::config::{AdaptationStrategy, AdaptiveBulkheadConfig, AimdConfig, LatencyConfig};
use crate::window::{Evaluation, WindowResult};
use std::fmt;
use std::time::Duration;

/// Everything a policy may look at after one recorded call
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    /// Window evaluation including this call
    pub evaluation: &'a Evaluation,
    pub duration: Duration,
    pub failed: bool,
    /// Calls in flight when this one completed, itself included
    pub in_flight: usize,
    pub limit: usize,
    pub state: AdaptiveBulkheadState,
    pub now: Duration,
}

/// Requested limit, before clamping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Increase(usize),
    Decrease(usize),
    Hold,
}

/// Computes the next limit from one observation
pub trait LimitPolicy: Send + fmt::Debug {
    fn next_limit(&mut self, observation: &Observation<'_>) -> Verdict;

    /// Discard accumulated state
    fn reset(&mut self) {}
}

/// Build the policy selected by `config.strategy`
pub fn policy_for(config: &AdaptiveBulkheadConfig) -> Box<dyn LimitPolicy> {
    match &config.strategy {
        AdaptationStrategy::StateMachine => Box::new(StateMachinePolicy {
            increase_multiplier: config.increase_multiplier,
            decrease_multiplier: config.decrease_multiplier,
            increase_summand: config.increase_summand,
        }),
        AdaptationStrategy::Aimd(aimd) => Box::new(AimdPolicy::new(*aimd)),
        AdaptationStrategy::MovingAverage(latency) => {
            Box::new(LatencyPolicy::new(*latency, Estimator::moving_average(latency)))
        }
        AdaptationStrategy::Percentile(latency, percentile) => Box::new(LatencyPolicy::new(
            *latency,
            Estimator::Percentile(*percentile),
        )),
    }
}

/// Multiplicative growth in SLOW_START, additive in CONGESTION_AVOIDANCE
#[derive(Debug, Clone)]
pub struct StateMachinePolicy {
    pub increase_multiplier: f64,
    pub decrease_multiplier: f64,
    pub increase_summand: usize,
}

impl LimitPolicy for StateMachinePolicy {
    fn next_limit(&mut self, observation: &Observation<'_>) -> Verdict {
        let limit = observation.limit;
        match observation.evaluation.result {
            WindowResult::BelowMinimumCallsThreshold => Verdict::Hold,
            WindowResult::AboveThresholds => {
                Verdict::Decrease(scale(limit, self.decrease_multiplier))
            }
            WindowResult::BelowThresholds => match observation.state {
                AdaptiveBulkheadState::SlowStart => {
                    Verdict::Increase(scale(limit, self.increase_multiplier))
                }
                AdaptiveBulkheadState::CongestionAvoidance => {
                    Verdict::Increase(limit.saturating_add(self.increase_summand))
                }
            },
        }
    }
}

/// Additive increase while saturated, multiplicative decrease on exceeded thresholds
#[derive(Debug, Clone)]
pub struct AimdPolicy {
    config: AimdConfig,
}

impl AimdPolicy {
    pub fn new(config: AimdConfig) -> Self {
        Self { config }
    }
}

impl LimitPolicy for AimdPolicy {
    fn next_limit(&mut self, observation: &Observation<'_>) -> Verdict {
        let limit = observation.limit;
        match observation.evaluation.result {
            WindowResult::BelowMinimumCallsThreshold => Verdict::Hold,
            WindowResult::AboveThresholds => {
                let dropped = (limit as f64 * self.config.drop_multiplier).floor() as usize;
                Verdict::Decrease(dropped.max(1))
            }
            WindowResult::BelowThresholds => {
                // Only grow when the current limit is actually in use
                if observation.in_flight as f64 * self.config.increment_factor >= limit as f64 {
                    Verdict::Increase(limit.saturating_add(1))
                } else {
                    Verdict::Hold
                }
            }
        }
    }
}

/// Latency estimate over one adaptation window
#[derive(Debug, Clone)]
pub enum Estimator {
    /// Exponential moving average of the per-window mean
    MovingAverage { alpha: f64, average: Option<f64> },
    /// Nearest-rank percentile in (0, 100]
    Percentile(f64),
}

impl Estimator {
    /// Smoothing spans the adaptation windows of one reconfiguration window
    pub fn moving_average(config: &LatencyConfig) -> Self {
        let adaptation = config.window_for_adaptation.as_secs_f64();
        let windows = if adaptation > 0.0 {
            (config.window_for_reconfiguration.as_secs_f64() / adaptation).max(1.0)
        } else {
            1.0
        };
        Estimator::MovingAverage {
            alpha: 2.0 / (windows + 1.0),
            average: None,
        }
    }

    /// Estimate in seconds; `samples` must not be empty
    fn estimate(&mut self, samples: &mut [Duration]) -> f64 {
        match self {
            Estimator::MovingAverage { alpha, average } => {
                let mean = samples.iter().map(Duration::as_secs_f64).sum::<f64>()
                    / samples.len() as f64;
                let next = match average {
                    Some(previous) => *alpha * mean + (1.0 - *alpha) * *previous,
                    None => mean,
                };
                *average = Some(next);
                next
            }
            Estimator::Percentile(percentile) => {
                samples.sort_unstable();
                let rank = (*percentile / 100.0 * samples.len() as f64).ceil() as usize;
                let index = rank.clamp(1, samples.len()) - 1;
                samples[index].as_secs_f64()
            }
        }
    }

    fn reset(&mut self) {
        if let Estimator::MovingAverage { average, .. } = self {
            *average = None;
        }
    }
}

/// Keeps latency between the desirable and the maximum acceptable value
#[derive(Debug, Clone)]
pub struct LatencyPolicy {
    config: LatencyConfig,
    estimator: Estimator,
    samples: Vec<Duration>,
    samples_per_adaptation: usize,
    reconfigured_at: Option<Duration>,
}

impl LatencyPolicy {
    pub fn new(config: LatencyConfig, estimator: Estimator) -> Self {
        let samples_per_adaptation = config.samples_per_adaptation();
        Self {
            config,
            estimator,
            samples: Vec::with_capacity(samples_per_adaptation),
            samples_per_adaptation,
            reconfigured_at: None,
        }
    }
}

impl LimitPolicy for LatencyPolicy {
    fn next_limit(&mut self, observation: &Observation<'_>) -> Verdict {
        let now = observation.now;
        match self.reconfigured_at {
            Some(at) if now.saturating_sub(at) < self.config.window_for_reconfiguration => {}
            Some(_) => {
                tracing::debug!("latency estimator reconfigured");
                self.estimator.reset();
                self.samples.clear();
                self.reconfigured_at = Some(now);
            }
            None => self.reconfigured_at = Some(now),
        }

        self.samples.push(observation.duration);
        if self.samples.len() < self.samples_per_adaptation {
            return Verdict::Hold;
        }

        let estimate = self.estimator.estimate(&mut self.samples);
        self.samples.clear();

        let limit = observation.limit;
        if estimate > self.config.max_acceptable_latency.as_secs_f64() {
            let dropped = (limit as f64 * self.config.concurrency_drop_multiplier).floor() as usize;
            Verdict::Decrease(dropped.max(1))
        } else if estimate <= self.config.desirable_latency.as_secs_f64() {
            Verdict::Increase(limit.saturating_add(1))
        } else {
            Verdict::Hold
        }
    }

    fn reset(&mut self) {
        self.estimator.reset();
        self.samples.clear();
        self.reconfigured_at = None;
    }
}

/// `ceil(limit * multiplier)`
fn scale(limit: usize, multiplier: f64) -> usize {
    let scaled = (limit as f64 * multiplier).ceil();
    if scaled >= usize::MAX as f64 {
        usize::MAX
    } else {
        scaled as usize
    }
}
