use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Total number of metric kinds.
pub const METRIC_CARDINALITY: usize = 11;

/// Environmental quantity produced by one sensor channel.
///
/// The serialized name is also the InfluxDB field key, so it must stay
/// stable across releases (spool files written by an older build are
/// replayed by a newer one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Metric {
    #[serde(rename = "temperature")]
    Temperature,
    #[serde(rename = "humidity")]
    Humidity,
    #[serde(rename = "pressure")]
    Pressure,
    #[serde(rename = "pm1")]
    Pm1,
    #[serde(rename = "pm2_5")]
    Pm2_5,
    #[serde(rename = "pm10")]
    Pm10,
    #[serde(rename = "oxidising")]
    Oxidising,
    #[serde(rename = "reducing")]
    Reducing,
    #[serde(rename = "nh3")]
    Nh3,
    #[serde(rename = "lux")]
    Lux,
    #[serde(rename = "noise_dba")]
    NoiseDba,
}

impl Metric {
    /// Every metric, in field order.
    pub const ALL: [Metric; METRIC_CARDINALITY] = [
        Metric::Temperature,
        Metric::Humidity,
        Metric::Pressure,
        Metric::Pm1,
        Metric::Pm2_5,
        Metric::Pm10,
        Metric::Oxidising,
        Metric::Reducing,
        Metric::Nh3,
        Metric::Lux,
        Metric::NoiseDba,
    ];

    /// Field key used in the written point and in config files.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Pressure => "pressure",
            Self::Pm1 => "pm1",
            Self::Pm2_5 => "pm2_5",
            Self::Pm10 => "pm10",
            Self::Oxidising => "oxidising",
            Self::Reducing => "reducing",
            Self::Nh3 => "nh3",
            Self::Lux => "lux",
            Self::NoiseDba => "noise_dba",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_str() == name)
    }

    /// Decimal places kept when the value is written. `None` means unrounded.
    pub const fn precision(self) -> Option<u32> {
        match self {
            Self::Temperature | Self::Humidity | Self::Pressure => Some(2),
            Self::NoiseDba => Some(1),
            _ => None,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown metric name.
#[derive(Debug, thiserror::Error)]
#[error("unknown metric {0:?}")]
pub struct UnknownMetric(pub String);

impl FromStr for Metric {
    type Err = UnknownMetric;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| UnknownMetric(s.to_string()))
    }
}

/// Round `value` to the metric's configured precision.
pub fn round_for(metric: Metric, value: f64) -> f64 {
    match metric.precision() {
        Some(places) => {
            let scale = 10f64.powi(places as i32);
            (value * scale).round() / scale
        }
        None => value,
    }
}
