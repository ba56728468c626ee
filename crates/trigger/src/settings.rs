//! Daemon settings file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use ktrigger_core::{ConnectionConfig, RawConnectionConfig, TriggerError};
use ktrigger_queue::KafkaOptions;

use crate::consumer_loop::{LoopOptions, DEFAULT_MAX_BATCH};
use crate::jobs::{JobCatalog, JobDefinition};
use crate::manager::ManagerOptions;

fn default_broker() -> String {
    "kafka".to_string()
}

/// Top-level settings file.
///
/// ```toml
/// broker = "kafka"
///
/// [connection]
/// enabled = true
/// brokers = "kafka-1:9092,kafka-2:9092"
/// topic = "builds"
///
/// [kafka]
/// security_protocol = "SASL_SSL"
///
/// [runtime]
/// stop_timeout_ms = 300000
///
/// [dispatch]
/// webhook_url = "http://ci.internal/hooks/build"
///
/// [[jobs]]
/// project = "app1"
/// token = "s3cret"
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSettings {
    /// Broker backend: "kafka" or "memory".
    #[serde(default = "default_broker")]
    pub broker: String,
    #[serde(default)]
    pub connection: RawConnectionConfig,
    /// SASL settings for the Kafka backend.
    #[serde(default)]
    pub kafka: KafkaOptions,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            broker: default_broker(),
            connection: RawConnectionConfig::default(),
            kafka: KafkaOptions::default(),
            runtime: RuntimeSettings::default(),
            dispatch: DispatchSettings::default(),
            jobs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub poll_timeout_ms: u64,
    pub max_batch: usize,
    pub stop_timeout_ms: u64,
    /// Interval for the periodic status log; 0 disables it.
    pub status_interval_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
            max_batch: DEFAULT_MAX_BATCH,
            stop_timeout_ms: 300_000,
            status_interval_secs: 60,
        }
    }
}

impl RuntimeSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_interval_secs > 0).then(|| Duration::from_secs(self.status_interval_secs))
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            loop_options: LoopOptions {
                poll_timeout: Duration::from_millis(self.poll_timeout_ms.max(1)),
                max_batch: self.max_batch.max(1),
            },
            stop_timeout: self.stop_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSettings {
    /// POST dispatches here; when unset they are only logged.
    pub webhook_url: Option<String>,
    pub timeout_ms: u64,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_ms: 10_000,
        }
    }
}

impl DispatchSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl DaemonSettings {
    /// Parse settings and apply `KTRIGGER_*` environment overrides to the
    /// connection section.
    pub fn from_toml(toml_str: &str) -> Result<Self, TriggerError> {
        let mut settings: Self = toml::from_str(toml_str)?;
        settings.connection.apply_env_overrides();
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TriggerError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Settings from environment variables only.
    pub fn from_env() -> Self {
        Self {
            connection: RawConnectionConfig::from_env(),
            ..Self::default()
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::from_raw(self.connection.clone())
    }

    pub fn job_catalog(&self) -> JobCatalog {
        JobCatalog::new(self.jobs.clone())
    }
}
