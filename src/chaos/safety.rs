//! The safety monitor: samples cluster-wide error rate, latency, and
//! throughput at a fixed interval and compares each against the thresholds
//! an experiment declares, reporting the first breach so the runner can
//! abort. Pure and synchronous — whoever owns the clock drives it.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One sampling window's aggregate request metrics, supplied by whatever
/// owns the live request counters (`node::NodeHandle` in production, a
/// synthetic feed in tests).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Sample {
    /// Fraction of requests that failed in this window, `[0, 1]`.
    pub error_rate: f64,
    /// Mean request latency in this window, milliseconds.
    pub mean_latency_ms: f64,
    /// Requests completed in this window.
    pub throughput: f64,
}

/// Thresholds an experiment must not breach, relative to the baseline
/// sampled immediately before the experiment started.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SafetyThresholds {
    /// Absolute error rate ceiling, independent of baseline.
    pub max_error_rate: f64,
    /// Maximum tolerated ratio of experiment latency to baseline latency.
    pub max_latency_increase: f64,
    /// Maximum tolerated ratio of throughput drop from baseline.
    pub max_throughput_drop: f64,
}

/// Why a safety check failed, carried into the abort event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Violation {
    /// Error rate rose above `max_error_rate`.
    ErrorRate { observed: f64, limit: f64 },
    /// Latency rose by more than `max_latency_increase` relative to baseline.
    LatencyIncrease { ratio: f64, limit: f64 },
    /// Throughput dropped by more than `max_throughput_drop` relative to
    /// baseline.
    ThroughputDrop { ratio: f64, limit: f64 },
    /// The operator aborted the experiment directly, before any threshold
    /// was reached.
    Cancelled,
}

/// Tracks a rolling window of samples against a baseline and thresholds,
/// and reports the first violation it sees.
pub struct SafetyMonitor {
    baseline: Sample,
    thresholds: SafetyThresholds,
    window: VecDeque<Sample>,
    window_capacity: usize,
}

impl SafetyMonitor {
    /// Start monitoring with `baseline` captured just before the experiment
    /// began, keeping the last `window_capacity` samples.
    pub fn new(baseline: Sample, thresholds: SafetyThresholds, window_capacity: usize) -> Self {
        Self {
            baseline,
            thresholds,
            window: VecDeque::with_capacity(window_capacity),
            window_capacity,
        }
    }

    /// Record a new sample and check it against the thresholds. Returns the
    /// first violation found, if any.
    pub fn observe(&mut self, sample: Sample) -> Option<Violation> {
        if self.window.len() == self.window_capacity {
            self.window.pop_front();
        }
        self.window.push_back(sample);

        if sample.error_rate > self.thresholds.max_error_rate {
            return Some(Violation::ErrorRate {
                observed: sample.error_rate,
                limit: self.thresholds.max_error_rate,
            });
        }

        if self.baseline.mean_latency_ms > 0.0 {
            let ratio = sample.mean_latency_ms / self.baseline.mean_latency_ms;
            if ratio > self.thresholds.max_latency_increase {
                return Some(Violation::LatencyIncrease {
                    ratio,
                    limit: self.thresholds.max_latency_increase,
                });
            }
        }

        if self.baseline.throughput > 0.0 {
            let drop = 1.0 - (sample.throughput / self.baseline.throughput);
            if drop > self.thresholds.max_throughput_drop {
                return Some(Violation::ThroughputDrop {
                    ratio: drop,
                    limit: self.thresholds.max_throughput_drop,
                });
            }
        }

        None
    }
}
