//! Configuration module for parcel.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for parcel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub delivery: DeliveryConfig,
    pub retry: RetryConfig,
    pub caching: CachingConfig,
    pub logging: LoggingConfig,
}

/// Payload storage settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Durable directory; payloads are always written here.
    pub files_dir: PathBuf,
    /// Evictable directory, read as a fallback when a file is not in `files_dir`.
    pub cache_dir: PathBuf,
    /// Upper bound on bytes used by each payload store before eviction starts.
    pub max_payload_storage_bytes: u64,
    /// Seconds between storage usage reports.
    pub telemetry_interval_secs: u64,
}

/// Delivery endpoint and HTTP settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Base URL; payloads are POSTed to `{endpoint}/v2/logs` and `{endpoint}/v2/spans`.
    pub endpoint: String,
    /// Sent as `X-App-Id` when set.
    pub app_id: Option<String>,
    /// Sent as `X-Device-Id` when set.
    pub device_id: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Deliveries allowed in flight at once. They are started in priority order.
    pub max_concurrent_deliveries: usize,
    /// Keep payloads that can never be delivered under `dropped/` instead of deleting them.
    pub retain_dropped_payloads: bool,
}

/// Backoff applied to transient delivery failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_secs: u64,
    pub multiplier: f64,
    pub max_delay_secs: u64,
    /// Failed attempts after which a payload is dropped.
    pub max_attempts: u32,
}

/// Periodic session snapshot settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachingConfig {
    pub enabled: bool,
    /// Milliseconds between snapshots of the in-progress session.
    pub interval_ms: u64,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/parcel/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("parcel")
            .join("config.yaml")
    }
}

impl StorageConfig {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs)
    }
}

impl DeliveryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }
}

impl CachingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Default per-store storage cap (10 MiB).
pub const DEFAULT_MAX_PAYLOAD_STORAGE_BYTES: u64 = 10 * 1024 * 1024;

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            files_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("parcel"),
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("~/.cache"))
                .join("parcel"),
            max_payload_storage_bytes: DEFAULT_MAX_PAYLOAD_STORAGE_BYTES,
            telemetry_interval_secs: 60,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:4318".to_string(),
            app_id: None,
            device_id: None,
            connect_timeout_secs: 10,
            request_timeout_secs: 60,
            max_concurrent_deliveries: 1,
            retain_dropped_payloads: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 60,
            multiplier: 2.0,
            max_delay_secs: 3600,
            max_attempts: 10,
        }
    }
}

impl Default for CachingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 2000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"retry.max_attempts"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut push = |field: &str, message: String| {
            errors.push(ValidationError {
                field: field.into(),
                message,
            })
        };

        // --- storage ---
        if self.storage.files_dir.as_os_str().is_empty() {
            push("storage.files_dir", "must not be empty".into());
        }
        if self.storage.cache_dir.as_os_str().is_empty() {
            push("storage.cache_dir", "must not be empty".into());
        }
        if self.storage.max_payload_storage_bytes == 0 {
            push("storage.max_payload_storage_bytes", "must be greater than 0".into());
        }
        if self.storage.telemetry_interval_secs == 0 {
            push("storage.telemetry_interval_secs", "must be greater than 0".into());
        }

        // --- delivery ---
        let endpoint = self.delivery.endpoint.trim();
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            push(
                "delivery.endpoint",
                format!("must be an http(s) URL, got '{}'", self.delivery.endpoint),
            );
        }
        if self.delivery.app_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            push("delivery.app_id", "must not be blank when set".into());
        }
        if self.delivery.device_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            push("delivery.device_id", "must not be blank when set".into());
        }
        if self.delivery.connect_timeout_secs == 0 {
            push("delivery.connect_timeout_secs", "must be greater than 0".into());
        }
        if self.delivery.request_timeout_secs == 0 {
            push("delivery.request_timeout_secs", "must be greater than 0".into());
        }
        if self.delivery.max_concurrent_deliveries == 0 {
            push("delivery.max_concurrent_deliveries", "must be greater than 0".into());
        }

        // --- retry ---
        if self.retry.initial_delay_secs == 0 {
            push("retry.initial_delay_secs", "must be greater than 0".into());
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            push(
                "retry.multiplier",
                format!("must be a finite number >= 1.0, got {}", self.retry.multiplier),
            );
        }
        if self.retry.max_delay_secs < self.retry.initial_delay_secs {
            push(
                "retry.max_delay_secs",
                format!(
                    "must be >= retry.initial_delay_secs ({})",
                    self.retry.initial_delay_secs
                ),
            );
        }
        if self.retry.max_attempts == 0 {
            push("retry.max_attempts", "must be greater than 0".into());
        }

        // --- caching ---
        if self.caching.enabled && self.caching.interval_ms == 0 {
            push("caching.interval_ms", "must be greater than 0 when caching is enabled".into());
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            push(
                "logging.level",
                format!(
                    "invalid level '{}', expected one of: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            );
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for [`Config`], starting from defaults.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder pre-populated with default values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- storage ---

    pub fn storage_files_dir(mut self, dir: PathBuf) -> Self {
        self.config.storage.files_dir = dir;
        self
    }

    pub fn storage_cache_dir(mut self, dir: PathBuf) -> Self {
        self.config.storage.cache_dir = dir;
        self
    }

    pub fn storage_max_payload_storage_bytes(mut self, bytes: u64) -> Self {
        self.config.storage.max_payload_storage_bytes = bytes;
        self
    }

    pub fn storage_telemetry_interval_secs(mut self, seconds: u64) -> Self {
        self.config.storage.telemetry_interval_secs = seconds;
        self
    }

    // --- delivery ---

    pub fn delivery_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.delivery.endpoint = endpoint.into();
        self
    }

    pub fn delivery_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.config.delivery.app_id = Some(app_id.into());
        self
    }

    pub fn delivery_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.config.delivery.device_id = Some(device_id.into());
        self
    }

    pub fn delivery_request_timeout_secs(mut self, seconds: u64) -> Self {
        self.config.delivery.request_timeout_secs = seconds;
        self
    }

    pub fn delivery_max_concurrent_deliveries(mut self, n: usize) -> Self {
        self.config.delivery.max_concurrent_deliveries = n;
        self
    }

    pub fn delivery_retain_dropped_payloads(mut self, retain: bool) -> Self {
        self.config.delivery.retain_dropped_payloads = retain;
        self
    }

    // --- retry ---

    pub fn retry_initial_delay_secs(mut self, seconds: u64) -> Self {
        self.config.retry.initial_delay_secs = seconds;
        self
    }

    pub fn retry_multiplier(mut self, multiplier: f64) -> Self {
        self.config.retry.multiplier = multiplier;
        self
    }

    pub fn retry_max_delay_secs(mut self, seconds: u64) -> Self {
        self.config.retry.max_delay_secs = seconds;
        self
    }

    pub fn retry_max_attempts(mut self, n: u32) -> Self {
        self.config.retry.max_attempts = n;
        self
    }

    // --- caching ---

    pub fn caching_enabled(mut self, enabled: bool) -> Self {
        self.config.caching.enabled = enabled;
        self
    }

    pub fn caching_interval_ms(mut self, ms: u64) -> Self {
        self.config.caching.interval_ms = ms;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    // -- Defaults --

    #[test]
    fn default_config_has_sensible_values() {
        let cfg = Config::default();
        assert_eq!(cfg.storage.max_payload_storage_bytes, 10 * 1024 * 1024);
        assert!(cfg.storage.files_dir.ends_with("parcel"));
        assert_eq!(cfg.delivery.max_concurrent_deliveries, 1);
        assert!(cfg.delivery.retain_dropped_payloads);
        assert!(cfg.delivery.app_id.is_none());
        assert_eq!(cfg.retry.initial_delay(), Duration::from_secs(60));
        assert_eq!(cfg.retry.multiplier, 2.0);
        assert_eq!(cfg.retry.max_delay(), Duration::from_secs(3600));
        assert_eq!(cfg.retry.max_attempts, 10);
        assert!(cfg.caching.enabled);
        assert_eq!(cfg.caching.interval(), Duration::from_millis(2000));
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn default_config_passes_validation() {
        let errors = Config::default().validate();
        assert!(errors.is_empty(), "unexpected validation errors: {errors:?}");
    }

    // -- Loading --

    #[test]
    fn load_from_yaml_file() {
        let yaml = r#"
storage:
  files_dir: /tmp/parcel-files
  cache_dir: /tmp/parcel-cache
  max_payload_storage_bytes: 4096
  telemetry_interval_secs: 5
delivery:
  endpoint: https://collector.test
  app_id: abcde
  device_id: dev-1
  connect_timeout_secs: 3
  request_timeout_secs: 9
  max_concurrent_deliveries: 2
  retain_dropped_payloads: false
retry:
  initial_delay_secs: 1
  multiplier: 3.0
  max_delay_secs: 30
  max_attempts: 4
caching:
  enabled: false
  interval_ms: 500
logging:
  level: debug
"#;
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(yaml.as_bytes()).unwrap();
        tmp.flush().unwrap();

        let cfg = Config::load(tmp.path()).expect("load config");
        assert_eq!(cfg.storage.files_dir, PathBuf::from("/tmp/parcel-files"));
        assert_eq!(cfg.storage.max_payload_storage_bytes, 4096);
        assert_eq!(cfg.delivery.endpoint, "https://collector.test");
        assert_eq!(cfg.delivery.app_id.as_deref(), Some("abcde"));
        assert_eq!(cfg.delivery.max_concurrent_deliveries, 2);
        assert!(!cfg.delivery.retain_dropped_payloads);
        assert_eq!(cfg.retry.multiplier, 3.0);
        assert_eq!(cfg.retry.max_attempts, 4);
        assert!(!cfg.caching.enabled);
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: Config = serde_yaml::from_str("retry:\n  max_attempts: 3\n").unwrap();
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.initial_delay_secs, 60);
        assert_eq!(cfg.caching.interval_ms, 2000);
    }

    #[test]
    fn load_missing_file_is_error() {
        assert!(Config::load(Path::new("/nonexistent/parcel.yaml")).is_err());
    }

    #[test]
    fn load_or_default_falls_back() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/parcel.yaml"));
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn default_path_ends_with_config_yaml() {
        let path = Config::default_path();
        assert!(path.ends_with("parcel/config.yaml"));
    }

    // -- Validation --

    #[test]
    fn validate_reports_every_error() {
        let cfg = ConfigBuilder::new()
            .storage_max_payload_storage_bytes(0)
            .delivery_endpoint("ftp://nope")
            .delivery_max_concurrent_deliveries(0)
            .retry_multiplier(0.5)
            .retry_max_attempts(0)
            .logging_level("loud")
            .build();

        let fields: Vec<String> = cfg.validate().into_iter().map(|e| e.field).collect();
        for expected in [
            "storage.max_payload_storage_bytes",
            "delivery.endpoint",
            "delivery.max_concurrent_deliveries",
            "retry.multiplier",
            "retry.max_attempts",
            "logging.level",
        ] {
            assert!(fields.iter().any(|f| f == expected), "missing {expected} in {fields:?}");
        }
    }

    #[test]
    fn validate_max_delay_below_initial() {
        let errors = ConfigBuilder::new()
            .retry_initial_delay_secs(100)
            .retry_max_delay_secs(10)
            .build()
            .validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "retry.max_delay_secs");
    }

    #[test]
    fn blank_app_id_is_rejected() {
        let result = ConfigBuilder::new().delivery_app_id("  ").build_validated();
        let errors = result.unwrap_err();
        assert_eq!(errors[0].field, "delivery.app_id");
    }

    #[test]
    fn caching_interval_only_checked_when_enabled() {
        let disabled = ConfigBuilder::new()
            .caching_enabled(false)
            .caching_interval_ms(0)
            .build();
        assert!(disabled.validate().is_empty());

        let enabled = ConfigBuilder::new().caching_interval_ms(0).build();
        assert_eq!(enabled.validate()[0].field, "caching.interval_ms");
    }

    #[test]
    fn validation_error_display() {
        let err = ValidationError {
            field: "retry.max_attempts".into(),
            message: "must be greater than 0".into(),
        };
        assert_eq!(err.to_string(), "retry.max_attempts: must be greater than 0");
    }

    // -- Builder --

    #[test]
    fn builder_sets_fields() {
        let cfg = ConfigBuilder::new()
            .storage_files_dir(PathBuf::from("/data"))
            .storage_cache_dir(PathBuf::from("/cache"))
            .delivery_endpoint("https://x.test")
            .delivery_device_id("device")
            .delivery_retain_dropped_payloads(false)
            .retry_initial_delay_secs(5)
            .build_validated()
            .expect("valid config");
        assert_eq!(cfg.storage.files_dir, PathBuf::from("/data"));
        assert_eq!(cfg.storage.cache_dir, PathBuf::from("/cache"));
        assert_eq!(cfg.delivery.device_id.as_deref(), Some("device"));
        assert!(!cfg.delivery.retain_dropped_payloads);
        assert_eq!(cfg.retry.initial_delay_secs, 5);
    }

    #[test]
    fn config_serializes_back_to_yaml() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, cfg);
    }
}
