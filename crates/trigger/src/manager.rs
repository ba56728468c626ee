//! Connection lifecycle: owns zero-or-one consumer loop and reacts to
//! configuration changes.
//!
//! `apply_config` and `shutdown_and_wait` are serialised by one async mutex.
//! Status queries read a separate view and never wait behind a slow stop.
//! Each shutdown bumps an epoch; an `apply_config` that began under an older
//! epoch never starts a loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ktrigger_core::{ConnectionConfig, TriggerError};
use ktrigger_queue::BrokerConnector;

use crate::consumer_loop::{ConsumerLoop, LoopMonitor, LoopOptions, LoopReleaser, LoopState, LoopStats};
use crate::dispatcher::Dispatcher;
use crate::registry::SubscriberRegistry;

/// Default bound on waiting for a consumer to stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub loop_options: LoopOptions,
    /// Bound on a stop during `apply_config` before the loop is force-released.
    pub stop_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            loop_options: LoopOptions::default(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

/// What `apply_config` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Disabled: the running loop was stopped.
    Stopped,
    /// Disabled and nothing was running.
    Idle,
    /// Same config as the running loop.
    Unchanged,
    /// Credentials changed; recorded without reconnecting.
    UpdatedInPlace,
    /// Broker, topic or group changed: old loop stopped, new one started.
    Restarted,
    Started,
}

/// Serializable snapshot of the manager's connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: LoopState,
    pub loop_id: Option<Uuid>,
    pub brokers: Vec<String>,
    pub topic: Option<String>,
    pub group_id: Option<String>,
    pub last_error: Option<String>,
    pub stats: Option<LoopStats>,
}

struct Slot {
    config: ConnectionConfig,
    current: Option<ConsumerLoop>,
}

#[derive(Default)]
struct View {
    monitor: Option<LoopMonitor>,
    releaser: Option<LoopReleaser>,
    /// Error of the most recently retired loop.
    last_error: Option<String>,
}

pub struct ConnectionManager {
    connector: Arc<dyn BrokerConnector>,
    registry: SubscriberRegistry,
    dispatcher: Arc<dyn Dispatcher>,
    options: ManagerOptions,
    slot: tokio::sync::Mutex<Slot>,
    view: Mutex<View>,
    shutdown_epoch: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        registry: SubscriberRegistry,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self::with_options(connector, registry, dispatcher, ManagerOptions::default())
    }

    pub fn with_options(
        connector: Arc<dyn BrokerConnector>,
        registry: SubscriberRegistry,
        dispatcher: Arc<dyn Dispatcher>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            connector,
            registry,
            dispatcher,
            options,
            slot: tokio::sync::Mutex::new(Slot {
                config: ConnectionConfig::disabled(),
                current: None,
            }),
            view: Mutex::new(View::default()),
            shutdown_epoch: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    /// The most recently applied configuration.
    pub async fn current_config(&self) -> ConnectionConfig {
        self.slot.lock().await.config.clone()
    }

    /// Reconcile the running consumer with `config`.
    ///
    /// A loop that exited on its own is reaped first, so re-applying after a
    /// connection failure starts a fresh loop. An enabled but incomplete
    /// config stops whatever is running and returns `Config`. A call that
    /// overlaps `shutdown_and_wait` stops the old loop but starts nothing.
    pub async fn apply_config(&self, config: ConnectionConfig) -> Result<ApplyOutcome, TriggerError> {
        let epoch = self.shutdown_epoch.load(Ordering::SeqCst);
        let mut guard = self.slot.lock().await;
        let slot = &mut *guard;
        self.reap_finished(slot).await;

        if !config.enabled {
            slot.config = config;
            return Ok(match slot.current.take() {
                Some(current) => {
                    info!(loop_id = %current.id(), "consumer disabled, stopping");
                    self.stop_bounded(current).await;
                    ApplyOutcome::Stopped
                }
                None => ApplyOutcome::Idle,
            });
        }

        if let Err(e) = config.validate() {
            warn!(error = %e, "rejecting incomplete connection config");
            if let Some(current) = slot.current.take() {
                self.stop_bounded(current).await;
            }
            slot.config = config;
            return Err(e);
        }

        let outcome = match slot.current.as_mut() {
            Some(current) if *current.config() == config => {
                debug!(loop_id = %current.id(), "connection config unchanged");
                return Ok(ApplyOutcome::Unchanged);
            }
            Some(current) if !current.config().requires_restart(&config) => {
                current.update_in_place(config.clone());
                slot.config = config;
                return Ok(ApplyOutcome::UpdatedInPlace);
            }
            Some(_) => ApplyOutcome::Restarted,
            None => ApplyOutcome::Started,
        };

        if let Some(old) = slot.current.take() {
            info!(loop_id = %old.id(), "connection endpoint changed, restarting consumer");
            self.stop_bounded(old).await;
        }

        if self.shutdown_epoch.load(Ordering::SeqCst) != epoch {
            info!("shutdown requested during config change, not starting a consumer");
            slot.config = config;
            return Ok(match outcome {
                ApplyOutcome::Restarted => ApplyOutcome::Stopped,
                _ => ApplyOutcome::Idle,
            });
        }

        config.log_summary();
        let started = ConsumerLoop::start(
            config.clone(),
            self.connector.clone(),
            self.registry.clone(),
            self.dispatcher.clone(),
            &self.options.loop_options,
        )?;
        self.publish(&started);
        slot.current = Some(started);
        slot.config = config;
        Ok(outcome)
    }

    /// Stop the consumer and wait at most `timeout` for it to finish.
    ///
    /// The stop runs on its own task and reports through a oneshot. On
    /// timeout the loop is force-released (task aborted, client closed) and
    /// `ShutdownTimeout` is returned; a late completion is dropped. The slot
    /// stays locked until then, so no config change starts a loop meanwhile.
    pub async fn shutdown_and_wait(&self, timeout: Duration) -> Result<(), TriggerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        self.shutdown_epoch.fetch_add(1, Ordering::SeqCst);

        let mut slot = match tokio::time::timeout_at(deadline, self.slot.lock()).await {
            Ok(slot) => slot,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "shutdown timed out waiting for a config change to finish");
                self.force_release_view();
                return Err(TriggerError::ShutdownTimeout(timeout));
            }
        };

        let Some(current) = slot.current.take() else {
            debug!("shutdown requested with no active consumer");
            return Ok(());
        };

        let id = current.id();
        let releaser = current.releaser();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let _ = done_tx.send(current.stop().await);
        });

        match tokio::time::timeout_at(deadline, done_rx).await {
            Ok(Ok(result)) => {
                self.retire(result.err());
                info!(loop_id = %id, "consumer shut down");
                Ok(())
            }
            Ok(Err(_)) => {
                // Stop task ended without reporting.
                releaser.force_release();
                self.retire(None);
                Ok(())
            }
            Err(_) => {
                warn!(loop_id = %id, timeout_ms = timeout.as_millis() as u64, "consumer did not stop in time, force-releasing");
                releaser.force_release();
                self.retire(None);
                Err(TriggerError::ShutdownTimeout(timeout))
            }
        }
    }

    /// Signal the consumer to stop without waiting.
    pub fn request_stop(&self) {
        if let Some(monitor) = &self.view().monitor {
            info!(loop_id = %monitor.id(), "consumer stop requested");
            monitor.request_stop();
        }
    }

    /// True iff a consumer is connected and polling.
    pub fn is_active(&self) -> bool {
        self.view().monitor.as_ref().is_some_and(LoopMonitor::is_running)
    }

    pub fn loop_id(&self) -> Option<Uuid> {
        self.view().monitor.as_ref().map(LoopMonitor::id)
    }

    pub fn status(&self) -> ConnectionStatus {
        let view = self.view();
        match &view.monitor {
            Some(monitor) => {
                let settings = monitor.settings();
                ConnectionStatus {
                    state: monitor.state(),
                    loop_id: Some(monitor.id()),
                    brokers: settings.brokers.clone(),
                    topic: Some(settings.topic.clone()),
                    group_id: Some(settings.group_id.clone()),
                    last_error: monitor.last_error().or_else(|| view.last_error.clone()),
                    stats: Some(monitor.stats()),
                }
            }
            None => ConnectionStatus {
                state: LoopState::Stopped,
                loop_id: None,
                brokers: Vec::new(),
                topic: None,
                group_id: None,
                last_error: view.last_error.clone(),
                stats: None,
            },
        }
    }

    // ── internals ─────────────────────────────────────────────

    fn view(&self) -> std::sync::MutexGuard<'_, View> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, started: &ConsumerLoop) {
        *self.view() = View {
            monitor: Some(started.monitor()),
            releaser: Some(started.releaser()),
            last_error: None,
        };
    }

    fn retire(&self, error: Option<TriggerError>) {
        let mut view = self.view();
        let last_error = error
            .map(|e| e.to_string())
            .or_else(|| view.monitor.as_ref().and_then(LoopMonitor::last_error));
        *view = View {
            monitor: None,
            releaser: None,
            last_error,
        };
    }

    fn force_release_view(&self) {
        if let Some(releaser) = &self.view().releaser {
            releaser.force_release();
        }
    }

    async fn reap_finished(&self, slot: &mut Slot) {
        if !slot.current.as_ref().is_some_and(ConsumerLoop::is_finished) {
            return;
        }
        if let Some(dead) = slot.current.take() {
            let id = dead.id();
            let result = dead.stop().await;
            if let Err(e) = &result {
                info!(loop_id = %id, error = %e, "reaped failed consumer loop");
            }
            self.retire(result.err());
        }
    }

    async fn stop_bounded(&self, current: ConsumerLoop) {
        let id = current.id();
        let releaser = current.releaser();
        let timeout = self.options.stop_timeout;

        let error = match tokio::time::timeout(timeout, current.stop()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                debug!(loop_id = %id, error = %e, "stopped consumer loop had already failed");
                Some(e)
            }
            Err(_) => {
                warn!(loop_id = %id, timeout_ms = timeout.as_millis() as u64, "consumer did not stop in time, force-releasing");
                releaser.force_release();
                None
            }
        };
        self.retire(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{ChannelDispatcher, DispatchRequest};
    use ktrigger_core::config::{BrokerList, Credentials, RawConnectionConfig, Secret};
    use ktrigger_queue::{MemoryBroker, MemoryConnector};
    use tokio::sync::mpsc::UnboundedReceiver;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(topic: &str) -> ConnectionConfig {
        ConnectionConfig::from_raw(RawConnectionConfig {
            enabled: true,
            brokers: BrokerList::Csv("memory:9092".into()),
            topic: topic.into(),
            ..Default::default()
        })
    }

    fn manager(broker: &MemoryBroker) -> (ConnectionManager, UnboundedReceiver<DispatchRequest>) {
        let (dispatcher, rx) = ChannelDispatcher::new();
        let options = ManagerOptions {
            loop_options: LoopOptions {
                poll_timeout: Duration::from_millis(20),
                max_batch: 50,
            },
            stop_timeout: Duration::from_secs(5),
        };
        let manager = ConnectionManager::with_options(
            Arc::new(MemoryConnector::new(broker.clone())),
            SubscriberRegistry::new(),
            Arc::new(dispatcher),
            options,
        );
        (manager, rx)
    }

    async fn wait_active(manager: &ConnectionManager) {
        tokio::time::timeout(WAIT, async {
            while !manager.is_active() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("consumer never became active");
    }

    #[tokio::test]
    async fn disabled_without_loop_is_idle() {
        let (manager, _rx) = manager(&MemoryBroker::new());
        let outcome = manager.apply_config(ConnectionConfig::disabled()).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Idle);
        assert!(!manager.is_active());
        assert_eq!(manager.status().state, LoopState::Stopped);
    }

    #[tokio::test]
    async fn enable_starts_and_reapply_is_unchanged() {
        let broker = MemoryBroker::new();
        let (manager, _rx) = manager(&broker);

        assert_eq!(manager.apply_config(config("builds")).await.unwrap(), ApplyOutcome::Started);
        wait_active(&manager).await;
        let id = manager.loop_id();

        assert_eq!(manager.apply_config(config("builds")).await.unwrap(), ApplyOutcome::Unchanged);
        assert_eq!(manager.loop_id(), id);
        assert_eq!(broker.connections().len(), 1);

        manager.shutdown_and_wait(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn credential_change_updates_in_place() {
        let broker = MemoryBroker::new();
        let (manager, _rx) = manager(&broker);
        manager.apply_config(config("builds")).await.unwrap();
        wait_active(&manager).await;
        let id = manager.loop_id();

        let mut with_creds = config("builds");
        with_creds.credentials = Some(Credentials {
            username: "ci".into(),
            secret: Secret::new("pw"),
        });
        assert_eq!(
            manager.apply_config(with_creds.clone()).await.unwrap(),
            ApplyOutcome::UpdatedInPlace
        );
        assert_eq!(manager.loop_id(), id);
        assert_eq!(manager.current_config().await, with_creds);
        assert_eq!(broker.connections().len(), 1);

        manager.shutdown_and_wait(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn topic_change_restarts() {
        let broker = MemoryBroker::new();
        let (manager, _rx) = manager(&broker);
        manager.apply_config(config("builds")).await.unwrap();
        wait_active(&manager).await;
        let first = manager.loop_id();

        assert_eq!(manager.apply_config(config("deploys")).await.unwrap(), ApplyOutcome::Restarted);
        wait_active(&manager).await;
        assert_ne!(manager.loop_id(), first);
        assert_eq!(broker.subscriber_count("builds"), 0);
        assert_eq!(broker.subscriber_count("deploys"), 1);
        assert_eq!(manager.status().topic.as_deref(), Some("deploys"));

        manager.shutdown_and_wait(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_enabled_config_stops_running_loop() {
        let broker = MemoryBroker::new();
        let (manager, _rx) = manager(&broker);
        manager.apply_config(config("builds")).await.unwrap();
        wait_active(&manager).await;

        let err = manager.apply_config(config("")).await.unwrap_err();
        assert!(matches!(err, TriggerError::Config(_)));
        assert!(!manager.is_active());
        assert_eq!(broker.subscriber_count("builds"), 0);
    }

    #[tokio::test]
    async fn failed_loop_is_reaped_and_restarted() {
        let broker = MemoryBroker::new();
        let (manager, _rx) = manager(&broker);
        manager.apply_config(config("builds")).await.unwrap();
        wait_active(&manager).await;

        broker.break_connections("broker went away");
        tokio::time::timeout(WAIT, async {
            while manager.status().state != LoopState::Stopped {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!manager.is_active());
        assert!(manager.status().last_error.unwrap().contains("broker went away"));

        assert_eq!(manager.apply_config(config("builds")).await.unwrap(), ApplyOutcome::Started);
        wait_active(&manager).await;
        assert_eq!(broker.connections().len(), 2);

        manager.shutdown_and_wait(WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn request_stop_is_non_blocking() {
        let broker = MemoryBroker::new();
        let (manager, _rx) = manager(&broker);
        manager.apply_config(config("builds")).await.unwrap();
        wait_active(&manager).await;

        manager.request_stop();
        assert!(!manager.is_active());
        manager.shutdown_and_wait(WAIT).await.unwrap();
        assert_eq!(broker.subscriber_count("builds"), 0);
    }

    #[tokio::test]
    async fn shutdown_without_loop_is_ok() {
        let (manager, _rx) = manager(&MemoryBroker::new());
        assert!(manager.shutdown_and_wait(Duration::from_millis(10)).await.is_ok());
    }

    #[test]
    fn outcome_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ApplyOutcome::UpdatedInPlace).unwrap(),
            "\"updated_in_place\""
        );
    }
}
