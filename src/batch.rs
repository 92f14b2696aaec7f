use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::metric::{round_for, Metric};
use crate::stabilize::StabilizedReading;

/// Stabilized readings from one cycle, ready to write.
///
/// Never empty and never holds a non-finite value. Fields are keyed by
/// metric so iteration order is stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub timestamp: DateTime<Utc>,
    pub host_tag: String,
    pub fields: BTreeMap<Metric, f64>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Assemble one batch from a cycle's readings.
///
/// Missing metrics are omitted. Returns `None` when every metric is
/// missing; such a cycle is neither delivered nor spooled.
pub fn assemble(
    cycle_time: DateTime<Utc>,
    host_tag: &str,
    readings: &BTreeMap<Metric, StabilizedReading>,
) -> Option<Batch> {
    let fields: BTreeMap<Metric, f64> = readings
        .iter()
        .filter_map(|(metric, reading)| {
            reading
                .value()
                .filter(|v| v.is_finite())
                .map(|v| (*metric, round_for(*metric, v)))
        })
        .collect();

    if fields.is_empty() {
        info!(
            metrics = readings.len(),
            "all metrics missing this cycle, nothing to write"
        );
        return None;
    }

    Some(Batch {
        timestamp: cycle_time,
        host_tag: host_tag.to_string(),
        fields,
    })
}
