//! Operator configuration, read from a YAML file
use crate::{provisioning::DigitalOcean, reconciler::Readiness};
use cluster_runtime::{controller, watcher, RetryPolicy};
use serde::Deserialize;
use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

/// Failures loading an [`OperatorConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be opened
    #[error("failed to read config file {path:?}: {source}")]
    ReadFile {
        /// Path of the file
        path: PathBuf,
        /// The io error
        #[source]
        source: std::io::Error,
    },

    /// The file is not a valid config document
    #[error("failed to parse config: {0}")]
    ParseYaml(#[source] serde_yaml::Error),

    /// A value is out of range
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Log output format
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Backoff of failed reconcile passes
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Upper bound for any retry delay
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5,
            max_delay_ms: 1_000_000,
        }
    }
}

/// Bounds of the readiness poll after a create
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReadinessConfig {
    /// Seconds between two status checks
    pub poll_interval_secs: u64,
    /// Seconds a single pass keeps polling
    pub timeout_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            timeout_secs: 600,
        }
    }
}

/// Where the provisioning API lives
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Base url of the API
    pub api_url: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_url: DigitalOcean::DEFAULT_API_URL.to_string(),
        }
    }
}

/// Top level configuration document
///
/// Every field is optional; an empty document yields the defaults.
///
/// ```yaml
/// namespace: clusters
/// workers: 4
/// resyncPeriodSecs: 30
/// retry:
///   baseDelayMs: 5
///   maxDelayMs: 1000000
/// readiness:
///   pollIntervalSecs: 10
///   timeoutSecs: 600
/// provider:
///   apiUrl: https://api.digitalocean.com
/// logFormat: json
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Only watch this namespace, all namespaces if unset
    pub namespace: Option<String>,
    /// Only watch objects matching this label selector
    pub label_selector: Option<String>,
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Capacity of the channel between the watch and the queue
    pub channel_capacity: usize,
    /// Seconds between two full resyncs, 0 disables them
    pub resync_period_secs: u64,
    /// Backoff of failed passes
    pub retry: RetryConfig,
    /// Readiness poll bounds
    pub readiness: ReadinessConfig,
    /// Provisioning API endpoint
    pub provider: ProviderConfig,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            label_selector: None,
            workers: 4,
            channel_capacity: 100,
            resync_period_secs: 30,
            retry: RetryConfig::default(),
            readiness: ReadinessConfig::default(),
            provider: ProviderConfig::default(),
            log_format: LogFormat::default(),
        }
    }
}

impl OperatorConfig {
    /// Reads and validates the config file at `path`
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(&path).map_err(|source| ConfigError::ReadFile {
            path: path.as_ref().into(),
            source,
        })?;
        let config: Self = serde_yaml::from_reader(file).map_err(ConfigError::ParseYaml)?;
        config.validate()
    }

    /// Parses and validates a config document
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml).map_err(ConfigError::ParseYaml)?;
        config.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channelCapacity must be at least 1"));
        }
        if self.retry.base_delay_ms == 0 || self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.baseDelayMs must be positive and not above retry.maxDelayMs",
            ));
        }
        if self.readiness.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("readiness.pollIntervalSecs must be at least 1"));
        }
        if self.provider.api_url.trim().is_empty() {
            return Err(ConfigError::Invalid("provider.apiUrl must not be empty"));
        }
        Ok(self)
    }

    /// Tuning of the controller
    pub fn controller_config(&self) -> controller::Config {
        let mut watcher = watcher::Config::default();
        if let Some(selector) = &self.label_selector {
            watcher = watcher.labels(selector);
        }
        controller::Config {
            workers: self.workers,
            channel_capacity: self.channel_capacity,
            resync_period: (self.resync_period_secs > 0).then(|| Duration::from_secs(self.resync_period_secs)),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
            },
            watcher,
        }
    }

    /// Readiness poll bounds of a reconcile pass
    pub fn readiness(&self) -> Readiness {
        Readiness {
            poll_interval: Duration::from_secs(self.readiness.poll_interval_secs),
            timeout: Duration::from_secs(self.readiness.timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = OperatorConfig::from_yaml("{}").unwrap();
        assert_eq!(config, OperatorConfig::default());

        let ctrl = config.controller_config();
        assert_eq!(ctrl.workers, 4);
        assert_eq!(ctrl.channel_capacity, 100);
        assert_eq!(ctrl.resync_period, Some(Duration::from_secs(30)));
        assert_eq!(ctrl.retry.base_delay, Duration::from_millis(5));
        assert_eq!(ctrl.retry.max_delay, Duration::from_secs(1000));
        assert_eq!(config.readiness(), Readiness::default());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = OperatorConfig::from_yaml(
            r#"
namespace: clusters
labelSelector: team=platform
resyncPeriodSecs: 0
retry:
  maxDelayMs: 60000
readiness:
  timeoutSecs: 120
logFormat: json
"#,
        )
        .unwrap();
        assert_eq!(config.namespace.as_deref(), Some("clusters"));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.retry.base_delay_ms, 5);
        assert_eq!(config.provider.api_url, DigitalOcean::DEFAULT_API_URL);

        let ctrl = config.controller_config();
        assert_eq!(ctrl.resync_period, None);
        assert_eq!(ctrl.retry.max_delay, Duration::from_secs(60));
        assert_eq!(ctrl.watcher.label_selector.as_deref(), Some("team=platform"));
        assert_eq!(config.readiness().timeout, Duration::from_secs(120));
        assert_eq!(config.readiness().poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn rejects_out_of_range_values() {
        for yaml in [
            "workers: 0",
            "channelCapacity: 0",
            "retry: { baseDelayMs: 0 }",
            "retry: { baseDelayMs: 10, maxDelayMs: 5 }",
            "readiness: { pollIntervalSecs: 0 }",
            "provider: { apiUrl: '' }",
        ] {
            assert!(
                matches!(OperatorConfig::from_yaml(yaml), Err(ConfigError::Invalid(_))),
                "{yaml}"
            );
        }
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert!(matches!(
            OperatorConfig::from_yaml("logFormat: xml"),
            Err(ConfigError::ParseYaml(_))
        ));
    }

    #[test]
    fn reads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workers: 2\nprovider:\n  apiUrl: http://localhost:8080").unwrap();
        let config = OperatorConfig::from_path(file.path()).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.provider.api_url, "http://localhost:8080");
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = OperatorConfig::from_path("/nonexistent/operator.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
        assert!(err.to_string().contains("/nonexistent/operator.yaml"));
    }
}
