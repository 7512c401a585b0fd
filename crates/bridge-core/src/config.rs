//! Application settings for the rabbit-amazon bridge
//!
//! Uses the `config` crate for layered configuration: defaults, an optional
//! settings file, an optional extra settings file and finally environment
//! variables prefixed with `BRIDGE__`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Root settings for the bridge process
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Where the bridge definition files live
    #[serde(default)]
    pub bridge: BridgeFilesConfig,

    /// Broker A consumer settings
    #[serde(default)]
    pub rabbit: RabbitConfig,

    /// Reverse direction polling
    #[serde(default)]
    pub poller: PollerConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ============================================================================
// Bridge Files
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeFilesConfig {
    /// Comma separated list of bridge definition files
    #[serde(default)]
    pub config_location: String,
}

impl BridgeFilesConfig {
    /// Individual paths, blanks removed
    pub fn paths(&self) -> Vec<String> {
        self.config_location
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    }
}

// ============================================================================
// Rabbit Configuration
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RabbitConfig {
    /// Retry interceptor wrapped around every forward listener
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub listener: ListenerConfig,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// When false every failure is dead-lettered straight away
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum attempts, first delivery included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff delay
    #[serde(with = "humantime_serde", default = "default_initial_interval")]
    pub initial_interval: Duration,

    /// Backoff multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum backoff delay
    #[serde(with = "humantime_serde", default = "default_max_interval")]
    pub max_interval: Duration,
}

fn default_true() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_max_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            initial_interval: default_initial_interval(),
            multiplier: default_multiplier(),
            max_interval: default_max_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Deliveries processed in parallel per listener
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    1
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

// ============================================================================
// Poller Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    /// Long-poll wait per receive
    #[serde(with = "humantime_serde", default = "default_wait_time")]
    pub wait_time: Duration,

    /// Batch size per receive
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Pause between the end of one run and the start of the next
    #[serde(with = "humantime_serde", default = "default_fixed_delay")]
    pub fixed_delay: Duration,

    /// When set, converted payloads are stamped with an idempotency key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

fn default_wait_time() -> Duration {
    Duration::from_secs(20)
}

fn default_max_messages() -> usize {
    10
}

fn default_fixed_delay() -> Duration {
    Duration::from_millis(20)
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            wait_time: default_wait_time(),
            max_messages: default_max_messages(),
            fixed_delay: default_fixed_delay(),
            idempotency_key: None,
        }
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl BridgeSettings {
    /// Load settings from files and environment.
    ///
    /// The extra file is optional: a missing extra file is ignored.
    pub fn load(path: Option<&str>, extra: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        if let Some(extra) = extra {
            builder = builder.add_source(config::File::from(Path::new(extra)).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("BRIDGE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = BridgeSettings::load(None, None).unwrap();
        assert!(settings.rabbit.retry.enabled);
        assert_eq!(settings.rabbit.retry.max_attempts, 3);
        assert_eq!(settings.rabbit.retry.initial_interval, Duration::from_secs(1));
        assert_eq!(settings.rabbit.listener.concurrency, 1);
        assert_eq!(settings.poller.wait_time, Duration::from_secs(20));
        assert_eq!(settings.poller.max_messages, 10);
        assert_eq!(settings.poller.fixed_delay, Duration::from_millis(20));
        assert_eq!(settings.poller.idempotency_key, None);
    }

    #[test]
    fn test_extra_file_overrides_base() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("bridge.toml");
        let extra = dir.path().join("extra.toml");

        let mut f = std::fs::File::create(&base).unwrap();
        writeln!(f, "[bridge]\nconfig_location = \"a.json, b.json\"").unwrap();
        writeln!(f, "[poller]\nfixed_delay = \"50ms\"").unwrap();

        let mut f = std::fs::File::create(&extra).unwrap();
        writeln!(f, "[poller]\nfixed_delay = \"5ms\"\nidempotency_key = \"on\"").unwrap();

        let settings =
            BridgeSettings::load(base.to_str(), extra.to_str()).unwrap();
        assert_eq!(settings.bridge.paths(), vec!["a.json", "b.json"]);
        assert_eq!(settings.poller.fixed_delay, Duration::from_millis(5));
        assert_eq!(settings.poller.idempotency_key.as_deref(), Some("on"));
    }

    #[test]
    fn test_missing_extra_file_is_ignored() {
        let settings = BridgeSettings::load(None, Some("/nonexistent/extra.toml")).unwrap();
        assert_eq!(settings.rabbit.listener.concurrency, 1);
    }
}
