//! Broker client traits and types.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use ktrigger_core::config::{ConnectionConfig, Credentials};

use crate::error::QueueError;
use crate::kafka::{KafkaConnector, KafkaOptions};
use crate::memory::MemoryConnector;

/// A raw record received from the broker.
#[derive(Debug, Clone)]
pub struct BrokerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Raw key bytes, if the producer set one.
    pub key: Option<Vec<u8>>,
    /// Raw value bytes (a JSON document for well-behaved producers).
    pub payload: Option<Vec<u8>>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl BrokerRecord {
    /// Record with a JSON value and no key, as a test producer would send it.
    pub fn json(topic: impl Into<String>, offset: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset,
            key: None,
            payload: Some(payload.into()),
            timestamp: Some(Utc::now()),
        }
    }
}

/// Everything a connector needs to open a subscribed client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerSettings {
    pub brokers: Vec<String>,
    pub topic: String,
    /// Resolved group: configured or derived.
    pub group_id: String,
    #[serde(skip)]
    pub credentials: Option<Credentials>,
    /// Where a new group starts reading. Always `"latest"` for triggers.
    pub offset_reset: String,
    /// Upper bound on records returned by one poll.
    pub max_batch: usize,
}

impl ConsumerSettings {
    /// Resolve settings from a connection config. Derives the group id when
    /// none is configured, so call this once per consumer start.
    pub fn from_config(config: &ConnectionConfig, max_batch: usize) -> Self {
        Self {
            brokers: config.brokers.clone(),
            topic: config.topic.clone(),
            group_id: config.resolve_group_id(),
            credentials: config.credentials.clone(),
            offset_reset: "latest".to_string(),
            max_batch: max_batch.max(1),
        }
    }

    pub fn brokers_csv(&self) -> String {
        self.brokers.join(",")
    }
}

/// A connected, subscribed broker client.
///
/// `poll` and `close` may be called from different tasks: closing wakes a
/// pending poll, which then returns [`QueueError::Closed`].
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Wait up to `timeout` for records. Returns an empty vec on timeout.
    async fn poll(&self, timeout: Duration) -> Result<Vec<BrokerRecord>, QueueError>;

    /// Release the connection. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Opens broker clients. Injected into the consumer loop so the backend can
/// be swapped (Kafka in production, in-memory in tests).
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect and subscribe according to `settings`.
    async fn connect(&self, settings: &ConsumerSettings) -> Result<Arc<dyn BrokerClient>, QueueError>;

    /// Backend name for logging (e.g. "kafka", "memory").
    fn provider(&self) -> &str;
}

/// Build a connector by backend name.
///
/// "kafka" always resolves; without the `kafka` Cargo feature its connections
/// fail with an error naming the feature. `kafka` is ignored by other backends.
pub fn build_connector(kind: &str, kafka: &KafkaOptions) -> Result<Arc<dyn BrokerConnector>, QueueError> {
    match kind {
        "kafka" => Ok(Arc::new(KafkaConnector::from_options(kafka))),
        "memory" => Ok(Arc::new(MemoryConnector::new(Default::default()))),
        other => Err(QueueError::Config(format!(
            "unknown broker backend '{other}' (supported: kafka, memory)"
        ))),
    }
}
