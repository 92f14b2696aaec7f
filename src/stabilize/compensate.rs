use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::CompensationConfig;

/// Source of a nearby heat-producing temperature, in degrees Celsius.
pub trait AuxTemperature: Send + Sync {
    fn read_celsius(&mut self) -> Result<f64>;
}

/// Host CPU temperature from a thermal zone (millidegrees).
pub struct CpuThermal {
    path: PathBuf,
}

impl CpuThermal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuxTemperature for CpuThermal {
    fn read_celsius(&mut self) -> Result<f64> {
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;

        let milli: i64 = raw
            .trim()
            .parse()
            .with_context(|| format!("parsing thermal value {:?}", raw.trim()))?;

        Ok(milli as f64 / 1000.0)
    }
}

/// Soft heat-soak correction for an ambient temperature reading.
///
/// Keeps a moving average of the auxiliary temperature and subtracts
/// `(aux_avg - raw) / factor` from the raw value.
pub struct Compensator {
    source: Box<dyn AuxTemperature>,
    history: VecDeque<f64>,
    capacity: usize,
    factor: f64,
}

impl Compensator {
    pub fn new(source: Box<dyn AuxTemperature>, capacity: usize, factor: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            source,
            history: VecDeque::with_capacity(capacity),
            capacity,
            factor,
        }
    }

    /// Build the CPU thermal compensator described by `cfg`, or `None`
    /// when compensation is disabled.
    pub fn from_config(cfg: &CompensationConfig) -> Option<Self> {
        if !cfg.enabled {
            return None;
        }

        Some(Self::new(
            Box::new(CpuThermal::new(cfg.source.clone())),
            cfg.history,
            cfg.factor,
        ))
    }

    /// Moving average of the auxiliary readings seen so far.
    pub fn average(&self) -> Option<f64> {
        if self.history.is_empty() {
            return None;
        }
        Some(self.history.iter().sum::<f64>() / self.history.len() as f64)
    }

    /// Correct `raw`. A failed or non-finite auxiliary read leaves it unchanged.
    pub fn correct(&mut self, raw: f64) -> f64 {
        match self.source.read_celsius() {
            Ok(aux) if aux.is_finite() => {
                if self.history.len() == self.capacity {
                    self.history.pop_front();
                }
                self.history.push_back(aux);
            }
            Ok(aux) => {
                debug!(value = aux, "ignoring non-finite auxiliary temperature");
                return raw;
            }
            Err(e) => {
                debug!(error = %e, "auxiliary temperature unavailable, skipping compensation");
                return raw;
            }
        }

        match self.average() {
            Some(avg) => raw - (avg - raw) / self.factor,
            None => raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    struct Scripted(Vec<Result<f64>>);

    impl AuxTemperature for Scripted {
        fn read_celsius(&mut self) -> Result<f64> {
            if self.0.is_empty() {
                anyhow::bail!("exhausted");
            }
            self.0.remove(0)
        }
    }

    #[test]
    fn test_correction_subtracts_fraction_of_excess() {
        let mut c = Compensator::new(Box::new(Scripted(vec![Ok(30.0)])), 60, 5.0);
        assert_eq!(c.correct(20.0), 18.0);
    }

    #[test]
    fn test_history_is_bounded_moving_average() {
        let reads = vec![Ok(10.0), Ok(20.0), Ok(30.0)];
        let mut c = Compensator::new(Box::new(Scripted(reads)), 2, 5.0);
        c.correct(20.0);
        c.correct(20.0);
        c.correct(20.0);
        assert_eq!(c.average(), Some(25.0));
    }

    #[test]
    fn test_failed_aux_read_passes_raw_through() {
        let mut c = Compensator::new(Box::new(Scripted(vec![])), 60, 5.0);
        assert_eq!(c.correct(21.3), 21.3);
        assert_eq!(c.average(), None);
    }

    #[test]
    fn test_cpu_thermal_reads_millidegrees() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "48312").unwrap();

        let mut cpu = CpuThermal::new(file.path());
        assert_eq!(cpu.read_celsius().unwrap(), 48.312);
    }

    #[test]
    fn test_disabled_config_builds_nothing() {
        let cfg = CompensationConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(Compensator::from_config(&cfg).is_none());
    }
}
