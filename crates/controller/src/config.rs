//! Controller configuration loaded from a mounted YAML file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Default location of the mounted configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main controller configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

/// Worker pool and reconcile-cycle tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileConfig {
    /// Number of concurrent reconcile workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Overall deadline for fetch, evaluate, act and persist
    #[serde(default = "default_cycle_deadline")]
    pub cycle_deadline_seconds: u64,

    /// Full-cycle re-runs after a lost status write
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,

    /// Requeue delay when the executor reports the target busy
    #[serde(default = "default_busy_requeue")]
    pub busy_requeue_seconds: u64,

    #[serde(default = "default_error_backoff_base")]
    pub error_backoff_base_seconds: u64,

    #[serde(default = "default_error_backoff_max")]
    pub error_backoff_max_seconds: u64,

    /// Period of the full list-and-reseed sweep
    #[serde(default = "default_resync")]
    pub resync_seconds: u64,
}

fn default_workers() -> usize {
    4
}

fn default_cycle_deadline() -> u64 {
    120
}

fn default_conflict_retries() -> u32 {
    3
}

fn default_busy_requeue() -> u64 {
    5
}

fn default_error_backoff_base() -> u64 {
    5
}

fn default_error_backoff_max() -> u64 {
    300
}

fn default_resync() -> u64 {
    300
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            cycle_deadline_seconds: default_cycle_deadline(),
            conflict_retries: default_conflict_retries(),
            busy_requeue_seconds: default_busy_requeue(),
            error_backoff_base_seconds: default_error_backoff_base(),
            error_backoff_max_seconds: default_error_backoff_max(),
            resync_seconds: default_resync(),
        }
    }
}

impl ReconcileConfig {
    pub fn cycle_deadline(&self) -> Duration {
        Duration::from_secs(self.cycle_deadline_seconds)
    }

    pub fn busy_requeue(&self) -> Duration {
        Duration::from_secs(self.busy_requeue_seconds)
    }

    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }
}

/// Retry budget for rollback and remediation actions
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_seconds: u64,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_millis: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_millis: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_attempt_timeout() -> u64 {
    30
}

fn default_backoff_base() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    10_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            attempt_timeout_seconds: default_attempt_timeout(),
            backoff_base_millis: default_backoff_base(),
            max_backoff_millis: default_max_backoff(),
        }
    }
}

impl ExecutorConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_seconds)
    }
}

/// Metric source settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    /// Prometheus base URL; metrics are reported missing when unset
    #[serde(default)]
    pub prometheus_url: Option<String>,

    #[serde(default = "default_metrics_timeout")]
    pub timeout_seconds: u64,

    /// PromQL templates keyed by metric name. `{namespace}` and `{name}`
    /// are replaced with the target's namespace and name.
    #[serde(default)]
    pub queries: BTreeMap<String, String>,
}

fn default_metrics_timeout() -> u64 {
    10
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus_url: None,
            timeout_seconds: default_metrics_timeout(),
            queries: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from mounted `ConfigMap` file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
            path: config_path.to_string(),
            source,
        })?;

        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.reconcile;
        if r.workers == 0 {
            return Err(ConfigError::Invalid(
                "reconcile.workers must be at least 1".to_string(),
            ));
        }
        if r.cycle_deadline_seconds == 0 {
            return Err(ConfigError::Invalid(
                "reconcile.cycleDeadlineSeconds must be positive".to_string(),
            ));
        }
        if r.error_backoff_base_seconds == 0
            || r.error_backoff_max_seconds < r.error_backoff_base_seconds
        {
            return Err(ConfigError::Invalid(
                "reconcile.errorBackoffMaxSeconds must be >= errorBackoffBaseSeconds > 0"
                    .to_string(),
            ));
        }

        let e = &self.executor;
        if e.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "executor.maxAttempts must be at least 1".to_string(),
            ));
        }
        if e.attempt_timeout_seconds >= r.cycle_deadline_seconds {
            return Err(ConfigError::Invalid(format!(
                "executor.attemptTimeoutSeconds ({}) must be below reconcile.cycleDeadlineSeconds ({})",
                e.attempt_timeout_seconds, r.cycle_deadline_seconds
            )));
        }
        if e.max_backoff_millis < e.backoff_base_millis {
            return Err(ConfigError::Invalid(
                "executor.maxBackoffMillis must be >= backoffBaseMillis".to_string(),
            ));
        }

        if let Some(url) = &self.metrics.prometheus_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "metrics.prometheusUrl must be an http(s) URL, got '{url}'"
                )));
            }
        }

        Ok(())
    }
}
