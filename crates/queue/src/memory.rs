//! In-process broker backend.
//!
//! Topics fan out to every subscribed client. Clients subscribe at the
//! latest offset: only records published after `connect` are delivered.
//! Connections can be broken on demand to exercise failure paths. A client
//! leaves its topic when closed, and only the most recent connects are kept
//! in the history.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use crate::consumer::{BrokerClient, BrokerConnector, BrokerRecord, ConsumerSettings};
use crate::error::QueueError;

/// Connects remembered by [`MemoryBroker::connections`].
const CONNECTION_HISTORY: usize = 256;

#[derive(Default)]
struct ClientState {
    closed: AtomicBool,
    broken: Mutex<Option<String>>,
    wake: Notify,
}

impl ClientState {
    fn broken_reason(&self) -> Option<String> {
        self.broken.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        match self.broken_reason() {
            Some(reason) => Err(QueueError::Connection(reason)),
            None => Ok(()),
        }
    }
}

struct ClientLink {
    tx: mpsc::UnboundedSender<BrokerRecord>,
    state: Arc<ClientState>,
}

#[derive(Default)]
struct TopicLog {
    next_offset: i64,
    links: Vec<ClientLink>,
}

#[derive(Default)]
struct BrokerInner {
    topics: Mutex<HashMap<String, TopicLog>>,
    connections: Mutex<Vec<ConsumerSettings>>,
    fail_next_connect: Mutex<Option<String>>,
}

/// Shared handle to an in-process broker. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a value to `topic`, returning its offset.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> i64 {
        let payload = payload.into();
        let mut topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let log = topics.entry(topic.to_string()).or_default();
        let offset = log.next_offset;
        log.next_offset += 1;

        let record = BrokerRecord::json(topic, offset, payload);
        log.links.retain(|link| {
            if link.state.closed.load(Ordering::SeqCst) {
                return false;
            }
            link.tx.send(record.clone()).is_ok()
        });
        debug!(topic, offset, subscribers = log.links.len(), "memory broker published");
        offset
    }

    /// Number of open clients subscribed to `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let mut topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
        topics.get_mut(topic).map_or(0, |log| {
            log.links.retain(|l| !l.state.closed.load(Ordering::SeqCst));
            log.links.iter().filter(|l| l.state.broken_reason().is_none()).count()
        })
    }

    /// Drop links of closed clients from `topic`.
    fn prune(&self, topic: &str) {
        let mut topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(log) = topics.get_mut(topic) {
            log.links.retain(|l| !l.state.closed.load(Ordering::SeqCst));
        }
    }

    /// Settings of recent successful connects, oldest first.
    pub fn connections(&self) -> Vec<ConsumerSettings> {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make the next `connect` fail with a connection error.
    pub fn fail_next_connect(&self, reason: impl Into<String>) {
        *self
            .inner
            .fail_next_connect
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    /// Drop every live connection: pending and future polls fail.
    pub fn break_connections(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
        for log in topics.values_mut() {
            for link in log.links.drain(..) {
                *link.state.broken.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason.clone());
                link.state.wake.notify_waiters();
            }
        }
    }

    fn subscribe(&self, settings: &ConsumerSettings) -> Result<MemoryClient, QueueError> {
        if let Some(reason) = self
            .inner
            .fail_next_connect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            return Err(QueueError::Connection(reason));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(ClientState::default());
        {
            let mut topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
            topics
                .entry(settings.topic.clone())
                .or_default()
                .links
                .push(ClientLink {
                    tx,
                    state: state.clone(),
                });
        }
        {
            let mut connections = self.inner.connections.lock().unwrap_or_else(PoisonError::into_inner);
            if connections.len() >= CONNECTION_HISTORY {
                connections.remove(0);
            }
            connections.push(settings.clone());
        }

        Ok(MemoryClient {
            rx: tokio::sync::Mutex::new(rx),
            state,
            max_batch: settings.max_batch,
            broker: self.clone(),
            topic: settings.topic.clone(),
        })
    }
}

/// Client handed out by [`MemoryConnector`].
pub struct MemoryClient {
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<BrokerRecord>>,
    state: Arc<ClientState>,
    max_batch: usize,
    broker: MemoryBroker,
    topic: String,
}

#[async_trait]
impl BrokerClient for MemoryClient {
    async fn poll(&self, timeout: Duration) -> Result<Vec<BrokerRecord>, QueueError> {
        // Register for wake-ups before checking flags so a concurrent close
        // cannot slip between the check and the wait.
        let woken = self.state.wake.notified();
        tokio::pin!(woken);
        woken.as_mut().enable();
        self.state.check()?;

        let mut rx = self.rx.lock().await;
        let first = tokio::select! {
            _ = &mut woken => {
                self.state.check()?;
                return Ok(Vec::new());
            }
            received = tokio::time::timeout(timeout, rx.recv()) => received,
        };

        let mut batch = match first {
            Err(_) => return Ok(Vec::new()),
            Ok(None) => {
                self.state.check()?;
                return Err(QueueError::Connection("memory broker dropped the subscription".into()));
            }
            Ok(Some(record)) => vec![record],
        };
        while batch.len() < self.max_batch {
            match rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.wake.notify_waiters();
        self.broker.prune(&self.topic);
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

/// Connector over a shared [`MemoryBroker`].
#[derive(Clone, Default)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self, settings: &ConsumerSettings) -> Result<Arc<dyn BrokerClient>, QueueError> {
        let client = self.broker.subscribe(settings)?;
        debug!(topic = %settings.topic, group_id = %settings.group_id, "memory client subscribed");
        Ok(Arc::new(client))
    }

    fn provider(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(topic: &str) -> ConsumerSettings {
        ConsumerSettings {
            brokers: vec!["memory".into()],
            topic: topic.into(),
            group_id: "g".into(),
            credentials: None,
            offset_reset: "latest".into(),
            max_batch: 10,
        }
    }

    const POLL: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn subscribe_starts_at_latest() {
        let broker = MemoryBroker::new();
        broker.publish("builds", "backlog");

        let connector = MemoryConnector::new(broker.clone());
        let client = connector.connect(&settings("builds")).await.unwrap();
        assert!(client.poll(POLL).await.unwrap().is_empty());

        broker.publish("builds", "fresh");
        let batch = client.poll(POLL).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload.as_deref(), Some(&b"fresh"[..]));
        assert_eq!(batch[0].offset, 1);
    }

    #[tokio::test]
    async fn poll_batches_in_order_up_to_max() {
        let broker = MemoryBroker::new();
        let mut s = settings("builds");
        s.max_batch = 2;
        let client = MemoryConnector::new(broker.clone()).connect(&s).await.unwrap();

        for i in 0..3 {
            broker.publish("builds", format!("m{i}"));
        }
        let first = client.poll(POLL).await.unwrap();
        let second = client.poll(POLL).await.unwrap();
        let offsets: Vec<i64> = first.iter().chain(second.iter()).map(|r| r.offset).collect();
        assert_eq!(first.len(), 2);
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn close_interrupts_pending_poll() {
        let broker = MemoryBroker::new();
        let client = MemoryConnector::new(broker.clone())
            .connect(&settings("builds"))
            .await
            .unwrap();

        let poller = client.clone();
        let handle = tokio::spawn(async move { poller.poll(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("poll should wake on close")
            .unwrap();
        assert!(matches!(result, Err(QueueError::Closed)));
        assert!(client.is_closed());
        assert_eq!(broker.subscriber_count("builds"), 0);
    }

    #[tokio::test]
    async fn broken_connection_fails_poll() {
        let broker = MemoryBroker::new();
        let client = MemoryConnector::new(broker.clone())
            .connect(&settings("builds"))
            .await
            .unwrap();
        broker.break_connections("broker went away");

        let err = client.poll(POLL).await.unwrap_err();
        assert!(matches!(err, QueueError::Connection(ref r) if r == "broker went away"));
    }

    #[tokio::test]
    async fn close_removes_link_and_history_is_capped() {
        let broker = MemoryBroker::new();
        let connector = MemoryConnector::new(broker.clone());

        for _ in 0..CONNECTION_HISTORY + 10 {
            let client = connector.connect(&settings("builds")).await.unwrap();
            client.close();
        }

        let topics = broker.inner.topics.lock().unwrap();
        assert!(topics["builds"].links.is_empty());
        drop(topics);
        assert_eq!(broker.connections().len(), CONNECTION_HISTORY);
    }

    #[tokio::test]
    async fn fail_next_connect_only_once() {
        let broker = MemoryBroker::new();
        let connector = MemoryConnector::new(broker.clone());
        broker.fail_next_connect("unreachable");

        assert!(connector.connect(&settings("builds")).await.is_err());
        assert!(connector.connect(&settings("builds")).await.is_ok());
        assert_eq!(broker.connections().len(), 1);
    }
}
