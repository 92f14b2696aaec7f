pub mod compensate;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::{RuleConfig, StabilizerConfig};
use crate::metric::Metric;

pub use compensate::{AuxTemperature, Compensator, CpuThermal};

/// One raw read. `value` is `None` when the read failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub metric: Metric,
    pub value: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

impl RawSample {
    pub fn new(metric: Metric, value: Option<f64>, captured_at: DateTime<Utc>) -> Self {
        Self {
            metric,
            value,
            captured_at,
        }
    }
}

/// Why a metric produced no value this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissingReason {
    /// Every raw sample was absent, NaN or infinite.
    NoValidSamples,
    /// The median fell outside the configured plausible range.
    OutOfRange,
    /// The median moved further than the allowed step from the previous value.
    SpikeRejected,
}

impl MissingReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoValidSamples => "no_valid_samples",
            Self::OutOfRange => "out_of_range",
            Self::SpikeRejected => "spike_rejected",
        }
    }
}

impl fmt::Display for MissingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of stabilizing one metric for one cycle. An accepted value is
/// always finite.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StabilizedReading {
    Accepted(f64),
    Missing(MissingReason),
}

impl StabilizedReading {
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Accepted(v) => Some(v),
            Self::Missing(_) => None,
        }
    }

    pub fn is_missing(self) -> bool {
        matches!(self, Self::Missing(_))
    }
}

/// Last value accepted for a metric and when it was accepted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PreviousValue {
    pub value: f64,
    pub at: DateTime<Utc>,
}

/// Median of the finite values in `values`. Even counts average the two
/// middle elements. Returns `None` when nothing finite remains.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.is_empty() {
        return None;
    }

    finite.sort_by(f64::total_cmp);

    let mid = finite.len() / 2;
    if finite.len() % 2 == 1 {
        Some(finite[mid])
    } else {
        Some((finite[mid - 1] + finite[mid]) / 2.0)
    }
}

/// Turns repeated raw reads into one trusted value per metric.
///
/// Owns the per-metric [`PreviousValue`] store used by the rate-of-change
/// clamp. The store lives as long as the stabilizer and is never persisted.
pub struct Stabilizer {
    rules: BTreeMap<Metric, RuleConfig>,
    step_window: Duration,
    previous: HashMap<Metric, PreviousValue>,
    compensator: Option<Compensator>,
}

impl Stabilizer {
    pub fn new(cfg: &StabilizerConfig) -> Self {
        Self {
            rules: cfg.rules.clone(),
            step_window: cfg.step_window,
            previous: HashMap::new(),
            compensator: None,
        }
    }

    /// Attach a heat-soak compensator for the temperature channel.
    pub fn with_compensator(mut self, compensator: Compensator) -> Self {
        self.compensator = Some(compensator);
        self
    }

    /// Seed the previous-value store.
    pub fn with_previous(mut self, previous: HashMap<Metric, PreviousValue>) -> Self {
        self.previous = previous;
        self
    }

    pub fn previous(&self, metric: Metric) -> Option<PreviousValue> {
        self.previous.get(&metric).copied()
    }

    /// Largest accepted change for `metric` after `elapsed`, if the metric
    /// is clamped at all.
    pub fn max_step(&self, metric: Metric, elapsed: chrono::Duration) -> Option<f64> {
        let step = self.rules.get(&metric)?.max_step?;
        let window = self.step_window.as_secs_f64();

        let elapsed_secs = elapsed.num_milliseconds() as f64 / 1000.0;
        let elapsed_secs = if elapsed_secs > 0.0 {
            elapsed_secs
        } else {
            // Wall clock stepped backwards; assume one nominal window.
            window
        };

        Some(step * elapsed_secs / window)
    }

    /// Reduce `samples` to one reading for `metric` at time `now`.
    pub fn stabilize(
        &mut self,
        metric: Metric,
        samples: &[RawSample],
        now: DateTime<Utc>,
    ) -> StabilizedReading {
        let values: Vec<f64> = samples
            .iter()
            .filter(|s| s.metric == metric)
            .filter_map(|s| s.value)
            .collect();

        let Some(mut candidate) = median(&values) else {
            debug!(metric = %metric, "no valid samples");
            return StabilizedReading::Missing(MissingReason::NoValidSamples);
        };

        if metric == Metric::Temperature {
            if let Some(compensator) = self.compensator.as_mut() {
                candidate = compensator.correct(candidate);
            }
        }

        if !candidate.is_finite() {
            debug!(metric = %metric, value = candidate, "non-finite candidate discarded");
            return StabilizedReading::Missing(MissingReason::NoValidSamples);
        }

        let rule = self.rules.get(&metric).copied().unwrap_or_default();

        let below = rule.min.is_some_and(|min| candidate < min);
        let above = rule.max.is_some_and(|max| candidate > max);
        if below || above {
            debug!(metric = %metric, value = candidate, "value outside plausible range");
            return StabilizedReading::Missing(MissingReason::OutOfRange);
        }

        if let Some(prev) = self.previous.get(&metric) {
            if let Some(allowed) = self.max_step(metric, now - prev.at) {
                let delta = (candidate - prev.value).abs();
                if delta > allowed {
                    debug!(
                        metric = %metric,
                        value = candidate,
                        previous = prev.value,
                        delta,
                        allowed,
                        "spike rejected",
                    );
                    return StabilizedReading::Missing(MissingReason::SpikeRejected);
                }
            }
        }

        self.previous.insert(
            metric,
            PreviousValue {
                value: candidate,
                at: now,
            },
        );

        StabilizedReading::Accepted(candidate)
    }
}
