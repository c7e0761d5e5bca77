//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/door.toml
//!
//! `DOOR_*` environment variables are applied on top of the file.

use crate::domain::types::Distance;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Unique site identifier, used as the Prometheus `site` label
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: "door".to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorsConfig {
    /// Serial devices, outside beam first
    pub devices: [String; 2],
    pub baud: u32,
    pub read_timeout_ms: u64,
    pub reopen_interval_ms: u64,
    pub baseline_samples: usize,
    pub baseline_interval_ms: u64,
    /// Pinned baselines; skips calibration when present
    pub baseline_mm: Option<[u32; 2]>,
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            devices: ["/dev/ttyUSB0".to_string(), "/dev/ttyUSB1".to_string()],
            baud: 9600,
            read_timeout_ms: 50,
            reopen_interval_ms: 2000,
            baseline_samples: 10,
            baseline_interval_ms: 50,
            baseline_mm: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub tolerance_mm: u32,
    pub timeout_secs: f64,
    pub dwell_threshold_secs: f64,
    pub dwell_repeat_secs: f64,
    pub poll_interval_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            tolerance_mm: 100,
            timeout_secs: 3.0,
            dwell_threshold_secs: 1.0,
            dwell_repeat_secs: 2.0,
            poll_interval_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding count.json and snapshots.jsonl
    pub dir: String,
    pub reset_on_start: bool,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub max_pending: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: "data".to_string(),
            reset_on_start: true,
            retry_base_ms: 100,
            retry_max_ms: 30_000,
            max_pending: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SnapshotsConfig {
    pub enabled: bool,
    /// First local hour (inclusive) in which snapshots are written
    pub open_hour: u32,
    /// Last local hour (inclusive) in which snapshots are written
    pub close_hour: u32,
    pub retention_days: u32,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self { enabled: true, open_hour: 7, close_hour: 21, retention_days: 5 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 60, prometheus_port: default_prometheus_port() }
    }
}

fn default_prometheus_port() -> u16 {
    9100
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub sensors: SensorsConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub snapshots: SnapshotsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Thresholds and timings for the crossing state machine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionParams {
    /// Margin below baseline that must be crossed to count as blocked
    pub tolerance: Distance,
    /// How long a lone Set may wait for the partner beam
    pub timeout: Duration,
    pub dwell_threshold: Duration,
    pub dwell_repeat: Duration,
    pub poll_interval: Duration,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            tolerance: Distance(100),
            timeout: Duration::from_secs(3),
            dwell_threshold: Duration::from_secs(1),
            dwell_repeat: Duration::from_secs(2),
            poll_interval: Duration::from_millis(10),
        }
    }
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    sensor_devices: [String; 2],
    sensor_baud: u32,
    sensor_read_timeout_ms: u64,
    sensor_reopen_interval_ms: u64,
    baseline_samples: usize,
    baseline_interval_ms: u64,
    baseline_mm: Option<[u32; 2]>,
    tolerance_mm: u32,
    timeout_secs: f64,
    dwell_threshold_secs: f64,
    dwell_repeat_secs: f64,
    poll_interval_ms: u64,
    store_dir: String,
    reset_on_start: bool,
    retry_base_ms: u64,
    retry_max_ms: u64,
    max_pending: usize,
    snapshots_enabled: bool,
    open_hour: u32,
    close_hour: u32,
    retention_days: u32,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        let TomlConfig { site, sensors, detection, store, snapshots, metrics } = toml_config;
        let (open_hour, close_hour) = snapshot_hours(&snapshots);
        Self {
            site_id: site.id,
            sensor_devices: sensors.devices,
            sensor_baud: sensors.baud,
            sensor_read_timeout_ms: sensors.read_timeout_ms,
            sensor_reopen_interval_ms: sensors.reopen_interval_ms,
            baseline_samples: sensors.baseline_samples.max(1),
            baseline_interval_ms: sensors.baseline_interval_ms,
            baseline_mm: sensors.baseline_mm,
            tolerance_mm: detection.tolerance_mm,
            timeout_secs: detection.timeout_secs,
            dwell_threshold_secs: detection.dwell_threshold_secs,
            dwell_repeat_secs: detection.dwell_repeat_secs,
            poll_interval_ms: detection.poll_interval_ms,
            store_dir: store.dir,
            reset_on_start: store.reset_on_start,
            retry_base_ms: store.retry_base_ms,
            retry_max_ms: store.retry_max_ms,
            max_pending: store.max_pending.max(1),
            snapshots_enabled: snapshots.enabled,
            open_hour,
            close_hour,
            retention_days: snapshots.retention_days,
            metrics_interval_secs: metrics.interval_secs.max(1),
            prometheus_port: metrics.prometheus_port,
            config_file: config_file.to_string(),
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/door.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, &path.display().to_string()))
    }

    /// Load configuration from an explicit path, falling back to defaults,
    /// then apply environment overrides
    pub fn load_from_path(path: &str) -> Self {
        let config = match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        };
        config.with_env_overrides(|key| env::var(key).ok())
    }

    /// Apply `DOOR_*` overrides from a variable lookup
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(site) = lookup("DOOR_SITE_ID") {
            self.site_id = site;
        }
        if let Some(dir) = lookup("DOOR_STORE_DIR") {
            self.store_dir = dir;
        }
        if let Some(v) = parse_override::<u32>(&lookup, "DOOR_TOLERANCE_MM") {
            self.tolerance_mm = v;
        }
        if let Some(v) = parse_override::<f64>(&lookup, "DOOR_TIMEOUT_SECONDS") {
            self.timeout_secs = v;
        }
        if let Some(v) = parse_override::<u64>(&lookup, "DOOR_POLL_INTERVAL_MS") {
            self.poll_interval_ms = v;
        }
        self
    }

    /// Detection thresholds as durations
    pub fn detection(&self) -> DetectionParams {
        DetectionParams {
            tolerance: Distance(self.tolerance_mm),
            timeout: secs(self.timeout_secs),
            dwell_threshold: secs(self.dwell_threshold_secs),
            dwell_repeat: secs(self.dwell_repeat_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn sensor_devices(&self) -> &[String; 2] {
        &self.sensor_devices
    }

    pub fn sensor_baud(&self) -> u32 {
        self.sensor_baud
    }

    pub fn sensor_read_timeout(&self) -> Duration {
        Duration::from_millis(self.sensor_read_timeout_ms)
    }

    pub fn sensor_reopen_interval(&self) -> Duration {
        Duration::from_millis(self.sensor_reopen_interval_ms)
    }

    pub fn baseline_samples(&self) -> usize {
        self.baseline_samples
    }

    pub fn baseline_interval(&self) -> Duration {
        Duration::from_millis(self.baseline_interval_ms)
    }

    pub fn baseline_mm(&self) -> Option<[u32; 2]> {
        self.baseline_mm
    }

    pub fn tolerance_mm(&self) -> u32 {
        self.tolerance_mm
    }

    pub fn timeout_secs(&self) -> f64 {
        self.timeout_secs
    }

    pub fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_ms
    }

    pub fn store_dir(&self) -> &str {
        &self.store_dir
    }

    pub fn reset_on_start(&self) -> bool {
        self.reset_on_start
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn snapshots_enabled(&self) -> bool {
        self.snapshots_enabled
    }

    pub fn open_hours(&self) -> (u32, u32) {
        (self.open_hour, self.close_hour)
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

fn parse_override<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key = %key, value = %raw, "config_env_override_ignored");
            None
        }
    }
}

/// Open-hours window, falling back to the defaults when it could never match
fn snapshot_hours(snapshots: &SnapshotsConfig) -> (u32, u32) {
    let (open, close) = (snapshots.open_hour, snapshots.close_hour);
    if open <= close && close <= 23 {
        return (open, close);
    }

    let fallback = SnapshotsConfig::default();
    warn!(
        open_hour = open,
        close_hour = close,
        using_open_hour = fallback.open_hour,
        using_close_hour = fallback.close_hour,
        "config_snapshot_hours_invalid"
    );
    (fallback.open_hour, fallback.close_hour)
}

/// Seconds from config; negative or NaN values collapse to zero
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.site_id(), "door");
        assert_eq!(config.tolerance_mm(), 100);
        assert_eq!(config.timeout_secs(), 3.0);
        assert_eq!(config.poll_interval_ms(), 10);
        assert_eq!(config.baseline_samples(), 10);
        assert_eq!(config.open_hours(), (7, 21));
        assert_eq!(config.retention_days(), 5);
        assert!(config.reset_on_start());
        assert!(config.baseline_mm().is_none());
    }

    #[test]
    fn test_default_detection_params() {
        let params = Config::default().detection();
        assert_eq!(params, DetectionParams::default());
        assert_eq!(params.dwell_threshold, Duration::from_secs(1));
        assert_eq!(params.dwell_repeat, Duration::from_secs(2));
    }

    #[test]
    fn test_snapshot_hours_kept_when_valid() {
        let snapshots = SnapshotsConfig { open_hour: 0, close_hour: 23, ..Default::default() };
        assert_eq!(snapshot_hours(&snapshots), (0, 23));

        let snapshots = SnapshotsConfig { open_hour: 12, close_hour: 12, ..Default::default() };
        assert_eq!(snapshot_hours(&snapshots), (12, 12));
    }

    #[test]
    fn test_inverted_snapshot_hours_fall_back_to_defaults() {
        let toml_config: TomlConfig =
            toml::from_str("[snapshots]\nopen_hour = 22\nclose_hour = 6\n").unwrap();
        let config = Config::from_toml(toml_config, "test");
        assert_eq!(config.open_hours(), (7, 21));

        let snapshots = SnapshotsConfig { open_hour: 8, close_hour: 24, ..Default::default() };
        assert_eq!(snapshot_hours(&snapshots), (7, 21));
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> =
            vec!["door-counter".to_string(), "--config".to_string(), "config/gym.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/gym.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["door-counter".to_string(), "--config=config/lab.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/lab.toml");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DOOR_SITE_ID", "gym"),
            ("DOOR_STORE_DIR", "/var/lib/door"),
            ("DOOR_TOLERANCE_MM", "150"),
            ("DOOR_TIMEOUT_SECONDS", "2.5"),
        ]);
        let config = Config::default().with_env_overrides(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.site_id(), "gym");
        assert_eq!(config.store_dir(), "/var/lib/door");
        assert_eq!(config.detection().tolerance, Distance(150));
        assert_eq!(config.detection().timeout, Duration::from_millis(2500));
        assert_eq!(config.poll_interval_ms(), 10);
    }

    #[test]
    fn test_env_override_unparseable_ignored() {
        let config = Config::default().with_env_overrides(|k| {
            (k == "DOOR_TOLERANCE_MM").then(|| "lots".to_string())
        });
        assert_eq!(config.tolerance_mm(), 100);
    }

    #[test]
    fn test_negative_seconds_clamp_to_zero() {
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(0.25), Duration::from_millis(250));
    }
}
