//! Configuration management for Turnstile.
//!
//! All settings are read once at startup and are immutable afterwards.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Prefix for environment variable overrides (`TURNSTILE__QUOTAS__PROJECT_ID=...`).
const ENV_PREFIX: &str = "TURNSTILE";

/// Upper bound on quota authority retries per refresh.
const MAX_AUTHORITY_RETRIES: u32 = 1;

/// Main configuration for the Turnstile engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Concurrency gate and token bucket settings
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Adaptive congestion limiter settings
    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    /// Per-route quota settings
    #[serde(default)]
    pub quotas: QuotaConfig,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How token bucket keys are derived from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyBy {
    /// One bucket shared by every caller
    Global,
    /// One bucket per caller address
    Address,
    /// One bucket per resolved caller identity, falling back to address
    Caller,
}

/// Static admission settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Maximum simultaneous in-flight requests (0 disables the gate)
    #[serde(default = "default_inflight_max")]
    pub inflight_max: i64,

    /// Sustained token bucket rate per key (0 disables the bucket stage)
    #[serde(default = "default_rate_rps")]
    pub rate_rps: f64,

    /// Token bucket capacity per key
    #[serde(default = "default_rate_burst")]
    pub rate_burst: u32,

    /// Bucket key policy
    #[serde(default = "default_key_by")]
    pub key_by: KeyBy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            inflight_max: default_inflight_max(),
            rate_rps: default_rate_rps(),
            rate_burst: default_rate_burst(),
            key_by: default_key_by(),
        }
    }
}

fn default_inflight_max() -> i64 {
    400
}

fn default_rate_rps() -> f64 {
    150.0
}

fn default_rate_burst() -> u32 {
    300
}

fn default_key_by() -> KeyBy {
    KeyBy::Address
}

/// Adaptive congestion limiter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Whether the adaptive stage runs at all
    #[serde(default = "default_adaptive_enabled")]
    pub enabled: bool,

    /// Rolling window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Number of buckets the window is split into
    #[serde(default = "default_buckets")]
    pub buckets: usize,

    /// Utilization threshold in per-mille (800 = 80%)
    #[serde(default = "default_threshold")]
    pub threshold: u64,

    /// Effective CPU quota used to normalize utilization samples
    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: f64,

    /// Utilization sampling period in milliseconds
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

impl AdaptiveConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Settings with the adaptive stage switched off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: default_adaptive_enabled(),
            window_ms: default_window_ms(),
            buckets: default_buckets(),
            threshold: default_threshold(),
            cpu_quota: default_cpu_quota(),
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

fn default_adaptive_enabled() -> bool {
    true
}

fn default_window_ms() -> u64 {
    10_000
}

fn default_buckets() -> usize {
    100
}

fn default_threshold() -> u64 {
    800
}

fn default_cpu_quota() -> f64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as f64)
        .unwrap_or(1.0)
}

fn default_sample_interval_ms() -> u64 {
    500
}

/// Route matching mode for quota lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// Only an exact route match applies a quota
    Strict,
    /// The longest configured prefix applies; an exact match always wins
    Prefix,
}

/// Where the per-route quota stage runs relative to the admission pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaOrder {
    Before,
    After,
}

/// Per-route quota settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Whether per-route quotas are enforced
    #[serde(default = "default_quotas_enabled")]
    pub enabled: bool,

    /// Base URL of the quota authority
    #[serde(default = "default_authority_url")]
    pub authority_url: String,

    /// Project whose quotas are requested (required when enabled)
    #[serde(default)]
    pub project_id: String,

    /// Refresh period in seconds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Bucket capacity as a multiple of the quota
    #[serde(default = "default_burst_factor")]
    pub burst_factor: f64,

    /// Route matching mode
    #[serde(default = "default_match_mode")]
    pub match_mode: MatchMode,

    /// Timeout for a single authority request in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Extra attempts after a failed authority request
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Position of the quota stage
    #[serde(default = "default_quota_order")]
    pub order: QuotaOrder,
}

impl QuotaConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: default_quotas_enabled(),
            authority_url: default_authority_url(),
            project_id: String::new(),
            refresh_interval_secs: default_refresh_interval(),
            burst_factor: default_burst_factor(),
            match_mode: default_match_mode(),
            request_timeout_ms: default_request_timeout_ms(),
            retries: default_retries(),
            order: default_quota_order(),
        }
    }
}

fn default_quotas_enabled() -> bool {
    false
}

fn default_authority_url() -> String {
    "http://127.0.0.1:10000".to_string()
}

fn default_refresh_interval() -> u64 {
    24 * 60 * 60
}

fn default_burst_factor() -> f64 {
    2.0
}

fn default_match_mode() -> MatchMode {
    MatchMode::Strict
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_retries() -> u32 {
    1
}

fn default_quota_order() -> QuotaOrder {
    QuotaOrder::After
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Logging settings. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl TurnstileConfig {
    /// Load configuration from an optional file, layered with
    /// `TURNSTILE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let cfg: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let cfg: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse config: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let adaptive = &self.adaptive;
        if adaptive.enabled {
            if adaptive.buckets == 0 {
                return Err(TurnstileError::Config("adaptive.buckets must be at least 1".into()));
            }
            if adaptive.window_ms < adaptive.buckets as u64 {
                return Err(TurnstileError::Config(format!(
                    "adaptive.window_ms ({}) must be at least one millisecond per bucket ({})",
                    adaptive.window_ms, adaptive.buckets
                )));
            }
            if adaptive.threshold > 1000 {
                return Err(TurnstileError::Config(
                    "adaptive.threshold is per-mille and cannot exceed 1000".into(),
                ));
            }
            if adaptive.sample_interval_ms == 0 {
                return Err(TurnstileError::Config(
                    "adaptive.sample_interval_ms must be positive".into(),
                ));
            }
        }

        let quotas = &self.quotas;
        if quotas.enabled {
            if quotas.project_id.trim().is_empty() {
                return Err(TurnstileError::Config(
                    "quotas.project_id is required when quotas are enabled".into(),
                ));
            }
            if quotas.authority_url.trim().is_empty() {
                return Err(TurnstileError::Config("quotas.authority_url is required".into()));
            }
            if quotas.refresh_interval_secs == 0 {
                return Err(TurnstileError::Config(
                    "quotas.refresh_interval_secs must be positive".into(),
                ));
            }
            if !(quotas.burst_factor > 0.0) {
                return Err(TurnstileError::Config("quotas.burst_factor must be positive".into()));
            }
        }
        // also used by `turnstile refresh` with quotas disabled
        if quotas.request_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "quotas.request_timeout_ms must be positive".into(),
            ));
        }
        if quotas.retries > MAX_AUTHORITY_RETRIES {
            return Err(TurnstileError::Config(format!(
                "quotas.retries ({}) cannot exceed {}",
                quotas.retries, MAX_AUTHORITY_RETRIES
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TurnstileConfig::default();
        assert_eq!(cfg.admission.inflight_max, 400);
        assert_eq!(cfg.admission.rate_burst, 300);
        assert_eq!(cfg.admission.key_by, KeyBy::Address);
        assert!(cfg.adaptive.enabled);
        assert_eq!(cfg.adaptive.window(), Duration::from_secs(10));
        assert_eq!(cfg.quotas.refresh_interval(), Duration::from_secs(86400));
        assert_eq!(cfg.quotas.match_mode, MatchMode::Strict);
        assert_eq!(cfg.quotas.order, QuotaOrder::After);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
admission:
  inflight_max: 2
  rate_rps: 5.5
  key_by: caller
adaptive:
  enabled: false
quotas:
  enabled: true
  project_id: billing
  match_mode: prefix
  burst_factor: 1.0
logging:
  format: json
"#;
        let cfg = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(cfg.admission.inflight_max, 2);
        assert_eq!(cfg.admission.rate_rps, 5.5);
        assert_eq!(cfg.admission.rate_burst, 300);
        assert_eq!(cfg.admission.key_by, KeyBy::Caller);
        assert!(!cfg.adaptive.enabled);
        assert_eq!(cfg.quotas.project_id, "billing");
        assert_eq!(cfg.quotas.match_mode, MatchMode::Prefix);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_missing_project_fails_fast() {
        let yaml = r#"
quotas:
  enabled: true
"#;
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
        assert!(err.to_string().contains("project_id"));
    }

    #[test]
    fn test_invalid_adaptive_settings() {
        let mut cfg = TurnstileConfig::default();
        cfg.adaptive.buckets = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = TurnstileConfig::default();
        cfg.adaptive.threshold = 1200;
        assert!(cfg.validate().is_err());

        let mut cfg = TurnstileConfig::default();
        cfg.adaptive.enabled = false;
        cfg.adaptive.buckets = 0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_invalid_burst_factor() {
        let mut cfg = TurnstileConfig::default();
        cfg.quotas.enabled = true;
        cfg.quotas.project_id = "p".into();
        cfg.quotas.burst_factor = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_authority_request_limits() {
        let mut cfg = TurnstileConfig::default();
        cfg.quotas.retries = 2;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("quotas.retries"));

        let mut cfg = TurnstileConfig::default();
        cfg.quotas.retries = 0;
        assert!(cfg.validate().is_ok());

        let mut cfg = TurnstileConfig::default();
        cfg.quotas.request_timeout_ms = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("request_timeout_ms"));
    }
}
