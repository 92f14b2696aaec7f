use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::metric::Metric;

/// Top-level configuration for the logger.
///
/// Built once at startup: YAML file (optional), then environment overrides,
/// then [`Config::validate`]. Nothing reads the environment after that.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Tag value identifying this host in written points.
    #[serde(default = "default_host_tag")]
    pub host_tag: String,

    /// Sampling cycle period. Default: 60s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Time-series database target.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Retry behaviour for writes.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Durable spool for undelivered batches.
    #[serde(default)]
    pub spool: SpoolConfig,

    /// Raw read sampling knobs.
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Sensor channels to read each cycle.
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,

    /// Range and rate-of-change rules.
    #[serde(default)]
    pub stabilizer: StabilizerConfig,

    /// Heat-soak compensation for the temperature channel.
    #[serde(default)]
    pub compensation: CompensationConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// InfluxDB write API flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbApi {
    /// InfluxDB 1.x `/write` with optional basic auth.
    #[default]
    V1,
    /// InfluxDB 2.x `/api/v2/write` with a token.
    V2,
}

impl FromStr for DbApi {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(Self::V1),
            "v2" | "2" => Ok(Self::V2),
            other => bail!("unknown database api {other:?} (expected v1 or v2)"),
        }
    }
}

/// Time-series database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Hostname or IP of the database. Required.
    #[serde(default)]
    pub host: String,

    /// HTTP port. Default: 8086.
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Use HTTPS instead of HTTP.
    #[serde(default)]
    pub tls: bool,

    /// Write API flavour. Default: v1.
    #[serde(default)]
    pub api: DbApi,

    /// `user:password` for v1, token for v2. Empty means no auth.
    #[serde(default)]
    pub credentials: String,

    /// Database (v1) or bucket (v2) name. Default: "sensors".
    #[serde(default = "default_database_or_bucket")]
    pub database_or_bucket: String,

    /// Organisation, required for v2.
    #[serde(default)]
    pub org: String,

    /// Measurement name of the written point. Default: "environment".
    #[serde(default = "default_measurement")]
    pub measurement: String,

    /// Upper bound for one write attempt. Default: 5s.
    #[serde(default = "default_connection_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Backoff shape between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    #[default]
    Constant,
    Exponential,
}

/// Write retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Total write attempts per batch. Default: 3.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the second attempt. Default: 2s.
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Constant or exponential backoff. Default: constant.
    #[serde(default)]
    pub backoff: BackoffKind,

    /// Cap for exponential backoff. Default: 30s.
    #[serde(default = "default_max_retry_delay", with = "humantime_serde")]
    pub max_retry_delay: Duration,

    /// Part of each cycle kept free for sampling when sending. Default: 5s.
    #[serde(default = "default_send_margin", with = "humantime_serde")]
    pub send_margin: Duration,
}

/// Spool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SpoolConfig {
    /// JSON Lines file. `None` keeps the spool in memory only.
    #[serde(default = "default_spool_path")]
    pub path: Option<PathBuf>,

    /// Hard capacity; the oldest entry is evicted beyond it. Default: 1000.
    #[serde(default = "default_max_failed_entries")]
    pub max_entries: usize,
}

/// Raw read sampling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplingConfig {
    /// Reads per metric per cycle fed to the median filter. Default: 5.
    #[serde(default = "default_reads_per_metric")]
    pub reads_per_metric: usize,

    /// Pause between consecutive reads of one sensor. Default: 50ms.
    #[serde(default = "default_read_gap", with = "humantime_serde")]
    pub read_gap: Duration,
}

/// One sysfs-backed sensor channel.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    pub metric: Metric,

    /// Attribute file holding one number (e.g. an IIO `in_*_input`).
    pub path: PathBuf,

    /// Multiplier applied to the raw number. Default: 1.0.
    #[serde(default = "default_scale")]
    pub scale: f64,

    /// Added after scaling. Default: 0.0.
    #[serde(default)]
    pub offset: f64,
}

/// Range and spike rule for one metric. Unset bounds are not enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct RuleConfig {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Largest accepted change per `step_window`.
    #[serde(default)]
    pub max_step: Option<f64>,
}

/// Stabilizer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StabilizerConfig {
    /// Time span `max_step` is expressed over. Default: 60s.
    #[serde(default = "default_step_window", with = "humantime_serde")]
    pub step_window: Duration,

    /// Per-metric rules. A configured map replaces the defaults entirely.
    #[serde(default = "default_rules")]
    pub rules: BTreeMap<Metric, RuleConfig>,
}

/// Temperature compensation configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CompensationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Auxiliary temperature source in millidegrees Celsius.
    #[serde(default = "default_compensation_source")]
    pub source: PathBuf,

    /// Divisor applied to the auxiliary excess. Default: 5.0.
    #[serde(default = "default_compensation_factor")]
    pub factor: f64,

    /// Auxiliary readings averaged. Default: 60.
    #[serde(default = "default_compensation_history")]
    pub history: usize,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    /// Listen address (e.g. ":9090"). Empty disables the server.
    #[serde(default)]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host_tag() -> String {
    "raspberry-pi".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_db_port() -> u16 {
    8086
}

fn default_database_or_bucket() -> String {
    "sensors".to_string()
}

fn default_measurement() -> String {
    "environment".to_string()
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_retry_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_send_margin() -> Duration {
    Duration::from_secs(5)
}

fn default_spool_path() -> Option<PathBuf> {
    Some(PathBuf::from("/var/lib/enviro-logger/spool.jsonl"))
}

fn default_max_failed_entries() -> usize {
    1000
}

fn default_reads_per_metric() -> usize {
    5
}

fn default_read_gap() -> Duration {
    Duration::from_millis(50)
}

fn default_scale() -> f64 {
    1.0
}

fn default_step_window() -> Duration {
    Duration::from_secs(60)
}

fn default_rules() -> BTreeMap<Metric, RuleConfig> {
    let rule = |min, max, max_step| RuleConfig {
        min: Some(min),
        max: Some(max),
        max_step: Some(max_step),
    };

    BTreeMap::from([
        (Metric::Temperature, rule(-20.0, 60.0, 0.5)),
        (Metric::Humidity, rule(0.0, 100.0, 3.0)),
        (Metric::Pressure, rule(800.0, 1100.0, 1.0)),
        (Metric::Lux, rule(0.0, 200_000.0, 100_000.0)),
    ])
}

fn default_true() -> bool {
    true
}

fn default_compensation_source() -> PathBuf {
    PathBuf::from("/sys/class/thermal/thermal_zone0/temp")
}

fn default_compensation_factor() -> f64 {
    5.0
}

fn default_compensation_history() -> usize {
    60
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            host_tag: default_host_tag(),
            interval: default_interval(),
            database: DatabaseConfig::default(),
            delivery: DeliveryConfig::default(),
            spool: SpoolConfig::default(),
            sampling: SamplingConfig::default(),
            sensors: Vec::new(),
            stabilizer: StabilizerConfig::default(),
            compensation: CompensationConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_db_port(),
            tls: false,
            api: DbApi::default(),
            credentials: String::new(),
            database_or_bucket: default_database_or_bucket(),
            org: String::new(),
            measurement: default_measurement(),
            timeout: default_connection_timeout(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            backoff: BackoffKind::default(),
            max_retry_delay: default_max_retry_delay(),
            send_margin: default_send_margin(),
        }
    }
}

impl Default for SpoolConfig {
    fn default() -> Self {
        Self {
            path: default_spool_path(),
            max_entries: default_max_failed_entries(),
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            reads_per_metric: default_reads_per_metric(),
            read_gap: default_read_gap(),
        }
    }
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            step_window: default_step_window(),
            rules: default_rules(),
        }
    }
}

impl Default for CompensationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            source: default_compensation_source(),
            factor: default_compensation_factor(),
            history: default_compensation_history(),
        }
    }
}

// --- Loading, environment overrides and validation ---

impl Config {
    /// Load configuration from an optional YAML file plus the process
    /// environment, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;

        Ok(cfg)
    }

    /// Parse a YAML file without validating it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Apply environment overrides. `lookup` returns the raw value of a key.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DB_HOST") {
            self.database.host = v;
        }
        if let Some(v) = lookup("DB_PORT") {
            self.database.port = parse_env("DB_PORT", &v)?;
        }
        if let Some(v) = lookup("DB_API") {
            self.database.api = parse_env("DB_API", &v)?;
        }
        if let Some(v) = lookup("DB_CREDENTIALS") {
            self.database.credentials = v;
        }
        if let Some(v) = lookup("DB_DATABASE_OR_BUCKET") {
            self.database.database_or_bucket = v;
        }
        if let Some(v) = lookup("DB_ORG") {
            self.database.org = v;
        }
        if let Some(v) = lookup("DB_MEASUREMENT") {
            self.database.measurement = v;
        }
        if let Some(v) = lookup("CONNECTION_TIMEOUT_SEC") {
            self.database.timeout = parse_secs("CONNECTION_TIMEOUT_SEC", &v)?;
        }
        if let Some(v) = lookup("HOST_TAG") {
            self.host_tag = v;
        }
        if let Some(v) = lookup("INTERVAL_SEC") {
            self.interval = parse_secs("INTERVAL_SEC", &v)?;
        }
        if let Some(v) = lookup("MAX_RETRIES") {
            self.delivery.max_retries = parse_env("MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("RETRY_DELAY_SEC") {
            self.delivery.retry_delay = parse_secs("RETRY_DELAY_SEC", &v)?;
        }
        if let Some(v) = lookup("MAX_FAILED_ENTRIES") {
            self.spool.max_entries = parse_env("MAX_FAILED_ENTRIES", &v)?;
        }
        if let Some(v) = lookup("SPOOL_FILE_PATH") {
            self.spool.path = if v.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(v))
            };
        }
        if let Some(v) = lookup("HEALTH_ADDR") {
            self.health.addr = v;
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.log_level = v;
        }

        Ok(())
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.database.host.trim().is_empty() {
            bail!("database.host (DB_HOST) is required");
        }

        if self.database.port == 0 {
            bail!("database.port (DB_PORT) must be positive");
        }

        if self.database.database_or_bucket.is_empty() {
            bail!("database.database_or_bucket (DB_DATABASE_OR_BUCKET) must not be empty");
        }

        if self.database.measurement.is_empty() {
            bail!("database.measurement must not be empty");
        }

        if self.database.api == DbApi::V2 && self.database.org.is_empty() {
            bail!("database.org (DB_ORG) is required for the v2 api");
        }

        if self.database.timeout.is_zero() {
            bail!("database.timeout (CONNECTION_TIMEOUT_SEC) must be positive");
        }

        if self.host_tag.is_empty() {
            bail!("host_tag (HOST_TAG) must not be empty");
        }

        if self.interval.is_zero() {
            bail!("interval (INTERVAL_SEC) must be positive");
        }

        if self.delivery.max_retries == 0 {
            bail!("delivery.max_retries (MAX_RETRIES) must be at least 1");
        }

        if self.delivery.retry_delay.is_zero() {
            bail!("delivery.retry_delay (RETRY_DELAY_SEC) must be positive");
        }

        if self.delivery.backoff == BackoffKind::Exponential
            && self.delivery.max_retry_delay < self.delivery.retry_delay
        {
            bail!(
                "delivery.max_retry_delay {:?} must not be below retry_delay {:?}",
                self.delivery.max_retry_delay,
                self.delivery.retry_delay,
            );
        }

        if self.spool.max_entries == 0 {
            bail!("spool.max_entries (MAX_FAILED_ENTRIES) must be positive");
        }

        if self.sampling.reads_per_metric == 0 {
            bail!("sampling.reads_per_metric must be positive");
        }

        if self.stabilizer.step_window.is_zero() {
            bail!("stabilizer.step_window must be positive");
        }

        for (metric, rule) in &self.stabilizer.rules {
            if let (Some(min), Some(max)) = (rule.min, rule.max) {
                if min > max {
                    bail!("stabilizer rule for {metric}: min {min} exceeds max {max}");
                }
            }
            if let Some(step) = rule.max_step {
                if !step.is_finite() || step <= 0.0 {
                    bail!("stabilizer rule for {metric}: max_step must be positive");
                }
            }
        }

        for sensor in &self.sensors {
            if !sensor.scale.is_finite() || !sensor.offset.is_finite() {
                bail!(
                    "sensor {} ({}): scale and offset must be finite",
                    sensor.metric,
                    sensor.path.display(),
                );
            }
        }

        if self.compensation.enabled {
            if !self.compensation.factor.is_finite() || self.compensation.factor <= 0.0 {
                bail!("compensation.factor must be positive");
            }
            if self.compensation.history == 0 {
                bail!("compensation.history must be positive");
            }
        }

        Ok(())
    }
}

fn parse_env<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| anyhow::anyhow!("invalid value {raw:?} for {key}: {e}"))
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration> {
    parse_env::<u64>(key, raw).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn valid_config() -> Config {
        Config {
            database: DatabaseConfig {
                host: "influx.local".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.host_tag, "raspberry-pi");
        assert_eq!(cfg.interval, Duration::from_secs(60));
        assert_eq!(cfg.database.port, 8086);
        assert_eq!(cfg.database.api, DbApi::V1);
        assert_eq!(cfg.database.database_or_bucket, "sensors");
        assert_eq!(cfg.database.timeout, Duration::from_secs(5));
        assert_eq!(cfg.delivery.max_retries, 3);
        assert_eq!(cfg.delivery.retry_delay, Duration::from_secs(2));
        assert_eq!(cfg.delivery.backoff, BackoffKind::Constant);
        assert_eq!(cfg.spool.max_entries, 1000);
        assert_eq!(cfg.sampling.reads_per_metric, 5);
        assert!(cfg.health.addr.is_empty());
    }

    #[test]
    fn test_default_rules_cover_climate_channels() {
        let rules = default_rules();
        assert_eq!(rules[&Metric::Temperature].max_step, Some(0.5));
        assert_eq!(rules[&Metric::Humidity].max, Some(100.0));
        assert_eq!(rules[&Metric::Pressure].min, Some(800.0));
        assert!(!rules.contains_key(&Metric::Pm2_5));
    }

    #[test]
    fn test_validation_missing_db_host() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("DB_HOST"));
    }

    #[test]
    fn test_validation_accepts_defaults_with_host() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validation_zero_retries() {
        let mut cfg = valid_config();
        cfg.delivery.max_retries = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("MAX_RETRIES"));

        cfg.delivery.max_retries = 1;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_zero_capacity() {
        let mut cfg = valid_config();
        cfg.spool.max_entries = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("MAX_FAILED_ENTRIES"));
    }

    #[test]
    fn test_validation_v2_requires_org() {
        let mut cfg = valid_config();
        cfg.database.api = DbApi::V2;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("DB_ORG"));

        cfg.database.org = "home".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_inverted_range_rejected() {
        let mut cfg = valid_config();
        cfg.stabilizer.rules.insert(
            Metric::Lux,
            RuleConfig {
                min: Some(10.0),
                max: Some(1.0),
                max_step: None,
            },
        );
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("lux"));
    }

    #[test]
    fn test_env_overrides_apply() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[
            ("DB_HOST", "10.0.0.5"),
            ("DB_PORT", "9999"),
            ("INTERVAL_SEC", "30"),
            ("MAX_RETRIES", "5"),
            ("RETRY_DELAY_SEC", "1"),
            ("CONNECTION_TIMEOUT_SEC", "3"),
            ("MAX_FAILED_ENTRIES", "10"),
            ("HOST_TAG", "attic"),
            ("DB_API", "v2"),
        ]))
        .unwrap();

        assert_eq!(cfg.database.host, "10.0.0.5");
        assert_eq!(cfg.database.port, 9999);
        assert_eq!(cfg.interval, Duration::from_secs(30));
        assert_eq!(cfg.delivery.max_retries, 5);
        assert_eq!(cfg.delivery.retry_delay, Duration::from_secs(1));
        assert_eq!(cfg.database.timeout, Duration::from_secs(3));
        assert_eq!(cfg.spool.max_entries, 10);
        assert_eq!(cfg.host_tag, "attic");
        assert_eq!(cfg.database.api, DbApi::V2);
    }

    #[test]
    fn test_env_malformed_number_is_error() {
        let mut cfg = Config::default();
        let err = cfg
            .apply_env(env(&[("INTERVAL_SEC", "sixty")]))
            .unwrap_err();
        assert!(err.to_string().contains("INTERVAL_SEC"));
    }

    #[test]
    fn test_env_empty_spool_path_selects_memory() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[("SPOOL_FILE_PATH", "")])).unwrap();
        assert!(cfg.spool.path.is_none());
    }

    #[test]
    fn test_yaml_then_env_precedence() {
        let yaml = r#"
host_tag: garage
interval: 2m
database:
  host: from-file
  api: v1
sensors:
  - metric: temperature
    path: /sys/bus/iio/devices/iio:device0/in_temp_input
    scale: 0.001
stabilizer:
  step_window: 30s
  rules:
    humidity:
      min: 0
      max: 100
"#;
        let mut cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.interval, Duration::from_secs(120));
        assert_eq!(cfg.sensors.len(), 1);
        assert_eq!(cfg.sensors[0].metric, Metric::Temperature);
        assert_eq!(cfg.stabilizer.step_window, Duration::from_secs(30));
        assert_eq!(cfg.stabilizer.rules.len(), 1);
        assert_eq!(cfg.stabilizer.rules[&Metric::Humidity].max_step, None);

        cfg.apply_env(env(&[("DB_HOST", "from-env")])).unwrap();
        assert_eq!(cfg.database.host, "from-env");
        assert_eq!(cfg.host_tag, "garage");
        assert!(cfg.validate().is_ok());
    }
}
