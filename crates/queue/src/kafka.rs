//! Kafka backend (requires the `kafka` feature).
//!
//! When the feature is enabled, uses `rdkafka`'s `StreamConsumer` with
//! auto-commit and `auto.offset.reset=latest`. When disabled, the connector
//! still exists but every connect fails with a message naming the feature.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::consumer::{BrokerClient, BrokerConnector, ConsumerSettings};
use crate::error::QueueError;

/// SASL mechanism used when credentials are configured.
pub const DEFAULT_SASL_MECHANISM: &str = "SCRAM-SHA-512";

/// Security protocol used when credentials are configured.
pub const DEFAULT_SECURITY_PROTOCOL: &str = "SASL_PLAINTEXT";

/// SASL settings applied when the connection carries credentials.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KafkaOptions {
    pub sasl_mechanism: String,
    pub security_protocol: String,
}

impl Default for KafkaOptions {
    fn default() -> Self {
        Self {
            sasl_mechanism: DEFAULT_SASL_MECHANISM.to_string(),
            security_protocol: DEFAULT_SECURITY_PROTOCOL.to_string(),
        }
    }
}

/// Connector producing Kafka consumers.
#[derive(Debug, Clone)]
pub struct KafkaConnector {
    sasl_mechanism: String,
    security_protocol: String,
}

impl Default for KafkaConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl KafkaConnector {
    pub fn new() -> Self {
        Self::from_options(&KafkaOptions::default())
    }

    pub fn from_options(options: &KafkaOptions) -> Self {
        Self {
            sasl_mechanism: options.sasl_mechanism.clone(),
            security_protocol: options.security_protocol.clone(),
        }
    }

    /// librdkafka properties for `settings`. Secrets are included, so never
    /// log the result.
    pub fn client_properties(&self, settings: &ConsumerSettings) -> Vec<(&'static str, String)> {
        let mut props = vec![
            ("bootstrap.servers", settings.brokers_csv()),
            ("group.id", settings.group_id.clone()),
            ("auto.offset.reset", settings.offset_reset.clone()),
            ("enable.auto.commit", "true".to_string()),
            ("enable.partition.eof", "false".to_string()),
        ];
        if let Some(creds) = &settings.credentials {
            props.push(("security.protocol", self.security_protocol.clone()));
            props.push(("sasl.mechanism", self.sasl_mechanism.clone()));
            props.push(("sasl.username", creds.username.clone()));
            props.push(("sasl.password", creds.secret.expose().to_string()));
        }
        props
    }
}

#[cfg(not(feature = "kafka"))]
#[async_trait]
impl BrokerConnector for KafkaConnector {
    async fn connect(&self, _settings: &ConsumerSettings) -> Result<Arc<dyn BrokerClient>, QueueError> {
        Err(QueueError::Provider(
            "Kafka broker backend requires the 'kafka' Cargo feature".into(),
        ))
    }

    fn provider(&self) -> &str {
        "kafka"
    }
}

#[cfg(feature = "kafka")]
#[async_trait]
impl BrokerConnector for KafkaConnector {
    async fn connect(&self, settings: &ConsumerSettings) -> Result<Arc<dyn BrokerClient>, QueueError> {
        let client = client::KafkaClient::connect(self, settings)?;
        Ok(Arc::new(client))
    }

    fn provider(&self) -> &str {
        "kafka"
    }
}

#[cfg(feature = "kafka")]
mod client {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use rdkafka::config::ClientConfig;
    use rdkafka::consumer::{Consumer, StreamConsumer};
    use rdkafka::message::{BorrowedMessage, Message};
    use tokio::sync::Notify;
    use tracing::{debug, info};

    use super::KafkaConnector;
    use crate::consumer::{BrokerClient, BrokerRecord, ConsumerSettings};
    use crate::error::QueueError;

    pub(super) struct KafkaClient {
        consumer: StreamConsumer,
        max_batch: usize,
        closed: AtomicBool,
        wake: Notify,
    }

    impl KafkaClient {
        pub(super) fn connect(
            connector: &KafkaConnector,
            settings: &ConsumerSettings,
        ) -> Result<Self, QueueError> {
            let mut config = ClientConfig::new();
            for (key, value) in connector.client_properties(settings) {
                config.set(key, value);
            }

            let consumer: StreamConsumer = config
                .create()
                .map_err(|e| QueueError::Connection(format!("failed to create Kafka consumer: {e}")))?;

            consumer
                .subscribe(&[settings.topic.as_str()])
                .map_err(|e| QueueError::Connection(format!("failed to subscribe to '{}': {e}", settings.topic)))?;

            info!(
                brokers = %settings.brokers_csv(),
                topic = %settings.topic,
                group_id = %settings.group_id,
                sasl = settings.credentials.is_some(),
                "Kafka consumer subscribed"
            );

            Ok(Self {
                consumer,
                max_batch: settings.max_batch,
                closed: AtomicBool::new(false),
                wake: Notify::new(),
            })
        }

        fn to_record(msg: &BorrowedMessage<'_>) -> BrokerRecord {
            BrokerRecord {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(<[u8]>::to_vec),
                payload: msg.payload().map(<[u8]>::to_vec),
                timestamp: msg
                    .timestamp()
                    .to_millis()
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            }
        }
    }

    #[async_trait]
    impl BrokerClient for KafkaClient {
        async fn poll(&self, timeout: Duration) -> Result<Vec<BrokerRecord>, QueueError> {
            let woken = self.wake.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();
            if self.closed.load(Ordering::SeqCst) {
                return Err(QueueError::Closed);
            }

            let first = tokio::select! {
                _ = &mut woken => return Err(QueueError::Closed),
                received = tokio::time::timeout(timeout, self.consumer.recv()) => received,
            };

            let mut batch = match first {
                Err(_) => return Ok(Vec::new()),
                Ok(Err(e)) => return Err(QueueError::Connection(format!("Kafka poll failed: {e}"))),
                Ok(Ok(msg)) => vec![Self::to_record(&msg)],
            };

            // Drain whatever is already buffered without waiting again.
            while batch.len() < self.max_batch {
                match tokio::time::timeout(Duration::ZERO, self.consumer.recv()).await {
                    Ok(Ok(msg)) => batch.push(Self::to_record(&msg)),
                    Ok(Err(e)) => return Err(QueueError::Connection(format!("Kafka poll failed: {e}"))),
                    Err(_) => break,
                }
            }
            debug!(count = batch.len(), "received Kafka records");
            Ok(batch)
        }

        fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.consumer.unsubscribe();
                self.wake.notify_waiters();
                info!("Kafka consumer closed");
            }
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }
}
