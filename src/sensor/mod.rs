use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::config::{SamplingConfig, SensorConfig};
use crate::metric::Metric;
use crate::stabilize::RawSample;

/// A single sensor channel.
pub trait Sensor: Send + Sync {
    /// Metric this channel produces.
    fn metric(&self) -> Metric;

    /// Take one raw reading.
    fn read(&mut self) -> Result<f64>;
}

/// Sensor channel backed by a sysfs attribute holding one number,
/// such as an IIO `in_temp_input` or `in_illuminance_input` file.
pub struct SysfsSensor {
    metric: Metric,
    path: PathBuf,
    scale: f64,
    offset: f64,
}

impl SysfsSensor {
    pub fn new(metric: Metric, path: impl Into<PathBuf>, scale: f64, offset: f64) -> Self {
        Self {
            metric,
            path: path.into(),
            scale,
            offset,
        }
    }

    pub fn from_config(cfg: &SensorConfig) -> Self {
        Self::new(cfg.metric, cfg.path.clone(), cfg.scale, cfg.offset)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sensor for SysfsSensor {
    fn metric(&self) -> Metric {
        self.metric
    }

    fn read(&mut self) -> Result<f64> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;

        let value: f64 = raw
            .trim()
            .parse()
            .with_context(|| format!("parsing {:?} from {}", raw.trim(), self.path.display()))?;

        Ok(value * self.scale + self.offset)
    }
}

/// Drives repeated reads of every configured sensor.
///
/// A read that errors or panics becomes a sample with no value; it never
/// aborts the cycle.
pub struct Sampler {
    sensors: Vec<Box<dyn Sensor>>,
    reads_per_metric: usize,
    read_gap: Duration,
}

impl Sampler {
    pub fn new(sensors: Vec<Box<dyn Sensor>>, cfg: &SamplingConfig) -> Self {
        Self {
            sensors,
            reads_per_metric: cfg.reads_per_metric.max(1),
            read_gap: cfg.read_gap,
        }
    }

    /// Build a sampler over sysfs channels.
    pub fn from_config(sensors: &[SensorConfig], cfg: &SamplingConfig) -> Self {
        let sensors = sensors
            .iter()
            .map(|s| Box::new(SysfsSensor::from_config(s)) as Box<dyn Sensor>)
            .collect();
        Self::new(sensors, cfg)
    }

    /// Distinct metrics produced by the configured sensors.
    pub fn metrics(&self) -> BTreeSet<Metric> {
        self.sensors.iter().map(|s| s.metric()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Read each sensor `reads_per_metric` times, pausing `read_gap`
    /// between consecutive reads of the same sensor.
    pub async fn sample(&mut self) -> Vec<RawSample> {
        let mut out = Vec::with_capacity(self.sensors.len() * self.reads_per_metric);

        for sensor in &mut self.sensors {
            let metric = sensor.metric();

            for i in 0..self.reads_per_metric {
                if i > 0 && !self.read_gap.is_zero() {
                    tokio::time::sleep(self.read_gap).await;
                }

                let value = read_guarded(sensor.as_mut());
                out.push(RawSample::new(metric, value, Utc::now()));
            }
        }

        out
    }
}

fn read_guarded(sensor: &mut dyn Sensor) -> Option<f64> {
    let metric = sensor.metric();

    match catch_unwind(AssertUnwindSafe(|| sensor.read())) {
        Ok(Ok(v)) => Some(v),
        Ok(Err(e)) => {
            debug!(metric = %metric, error = %e, "sensor read failed");
            None
        }
        Err(_) => {
            warn!(metric = %metric, "sensor read panicked");
            None
        }
    }
}
