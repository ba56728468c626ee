//! Consumer loop: one broker client polled on its own tokio task.
//!
//! State machine: `Stopped -> Starting -> Running -> Stopping -> Stopped`.
//! The task connects through the injected [`BrokerConnector`], polls with a
//! short timeout raced against the stop signal, decodes and matches each
//! record in delivery order, and hands matches to the [`Dispatcher`].
//!
//! A broker error during poll is fatal: the loop closes its client, records
//! the error and exits. Restarting is the manager's decision.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ktrigger_core::{ConnectionConfig, TriggerError};
use ktrigger_queue::{decode_record, BrokerClient, BrokerConnector, BrokerRecord, ConsumerSettings, QueueError};

use crate::dispatcher::Dispatcher;
use crate::matcher::match_message;
use crate::registry::SubscriberRegistry;

/// Default poll timeout; short so a stop is observed promptly.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Default upper bound on records handled per poll.
pub const DEFAULT_MAX_BATCH: usize = 500;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LoopState::Starting,
            2 => LoopState::Running,
            3 => LoopState::Stopping,
            _ => LoopState::Stopped,
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Stopped => "stopped",
            LoopState::Starting => "starting",
            LoopState::Running => "running",
            LoopState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub poll_timeout: Duration,
    pub max_batch: usize,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            max_batch: DEFAULT_MAX_BATCH,
        }
    }
}

/// Counters for one loop's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub received: u64,
    pub decode_failures: u64,
    pub dispatched: u64,
    pub dispatch_failures: u64,
}

#[derive(Default)]
struct LoopCounters {
    received: AtomicU64,
    decode_failures: AtomicU64,
    dispatched: AtomicU64,
    dispatch_failures: AtomicU64,
}

struct LoopShared {
    state: AtomicU8,
    stop_tx: watch::Sender<bool>,
    client: Mutex<Option<Arc<dyn BrokerClient>>>,
    last_error: Mutex<Option<String>>,
    counters: LoopCounters,
}

impl LoopShared {
    fn new(stop_tx: watch::Sender<bool>) -> Self {
        Self {
            state: AtomicU8::new(LoopState::Starting as u8),
            stop_tx,
            client: Mutex::new(None),
            last_error: Mutex::new(None),
            counters: LoopCounters::default(),
        }
    }

    fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: LoopState, to: LoopState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn request_stop(&self) {
        if !self.transition(LoopState::Running, LoopState::Stopping) {
            self.transition(LoopState::Starting, LoopState::Stopping);
        }
        let _ = self.stop_tx.send(true);
    }

    fn install_client(&self, client: Arc<dyn BrokerClient>) {
        *self.client.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);
    }

    fn record_error(&self, err: &TriggerError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
    }

    /// Close the client (if still held) and mark the loop stopped.
    fn release(&self) {
        let client = self.client.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(client) = client {
            client.close();
        }
        self.state.store(LoopState::Stopped as u8, Ordering::SeqCst);
    }

    fn stats(&self) -> LoopStats {
        let c = &self.counters;
        LoopStats {
            received: c.received.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            dispatch_failures: c.dispatch_failures.load(Ordering::Relaxed),
        }
    }
}

/// Closes the client and marks the loop stopped however the task ends:
/// normal exit, error, panic or abort.
struct ReleaseOnExit(Arc<LoopShared>);

impl Drop for ReleaseOnExit {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Cloneable read-only view of a loop, for status reporting.
#[derive(Clone)]
pub struct LoopMonitor {
    id: Uuid,
    settings: Arc<ConsumerSettings>,
    shared: Arc<LoopShared>,
}

impl LoopMonitor {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// The error that ended the loop, if it ended on one.
    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn stats(&self) -> LoopStats {
        self.shared.stats()
    }

    /// Signal the loop to stop without waiting for it.
    pub fn request_stop(&self) {
        self.shared.request_stop();
    }
}

/// Releases a loop's resources without owning it. Used when a graceful stop
/// does not complete in time.
#[derive(Clone)]
pub struct LoopReleaser {
    shared: Arc<LoopShared>,
    abort: AbortHandle,
}

impl LoopReleaser {
    /// Abort the task, close the broker client and mark the loop stopped.
    pub fn force_release(&self) {
        self.abort.abort();
        self.shared.release();
    }
}

/// A running consumer. At most one per manager.
pub struct ConsumerLoop {
    config: ConnectionConfig,
    monitor: LoopMonitor,
    task: JoinHandle<Result<(), TriggerError>>,
}

impl ConsumerLoop {
    /// Validate `config` and spawn the consumer task.
    ///
    /// Must be called from within a tokio runtime. Connection happens on the
    /// task; the loop reports `Starting` until the client is subscribed.
    pub fn start(
        config: ConnectionConfig,
        connector: Arc<dyn BrokerConnector>,
        registry: SubscriberRegistry,
        dispatcher: Arc<dyn Dispatcher>,
        options: &LoopOptions,
    ) -> Result<Self, TriggerError> {
        config.validate()?;

        let settings = Arc::new(ConsumerSettings::from_config(&config, options.max_batch));
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(LoopShared::new(stop_tx));
        let id = Uuid::new_v4();

        info!(
            loop_id = %id,
            provider = connector.provider(),
            brokers = %settings.brokers_csv(),
            topic = %settings.topic,
            group_id = %settings.group_id,
            "starting consumer loop"
        );

        let worker = Worker {
            id,
            settings: settings.clone(),
            connector,
            registry,
            dispatcher,
            poll_timeout: options.poll_timeout,
            shared: shared.clone(),
        };
        let task = tokio::spawn(worker.run(stop_rx));

        Ok(Self {
            config,
            monitor: LoopMonitor { id, settings, shared },
            task,
        })
    }

    pub fn id(&self) -> Uuid {
        self.monitor.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> LoopState {
        self.monitor.state()
    }

    pub fn monitor(&self) -> LoopMonitor {
        self.monitor.clone()
    }

    /// Whether the loop has exited on its own, been released, or finished.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished() || self.state() == LoopState::Stopped
    }

    /// Record a change that needs no reconnect (credentials only). The new
    /// credentials take effect the next time a loop starts from this config.
    pub fn update_in_place(&mut self, config: ConnectionConfig) {
        debug_assert!(!self.config.requires_restart(&config));
        info!(loop_id = %self.id(), "connection credentials updated; applied on next connect");
        self.config = config;
    }

    pub fn signal_stop(&self) {
        self.monitor.request_stop();
    }

    pub fn releaser(&self) -> LoopReleaser {
        LoopReleaser {
            shared: self.monitor.shared.clone(),
            abort: self.task.abort_handle(),
        }
    }

    /// Signal the loop and wait until its task has exited and the broker
    /// client is closed. Returns the task's own result, so a connection
    /// failure that ended the loop surfaces here.
    ///
    /// No timeout: bound the wait from the caller.
    pub async fn stop(self) -> Result<(), TriggerError> {
        let id = self.id();
        self.signal_stop();
        let result = match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(TriggerError::Internal(format!("consumer task panicked: {e}"))),
        };
        self.monitor.shared.release();
        info!(loop_id = %id, "consumer loop stopped");
        result
    }
}

struct Worker {
    id: Uuid,
    settings: Arc<ConsumerSettings>,
    connector: Arc<dyn BrokerConnector>,
    registry: SubscriberRegistry,
    dispatcher: Arc<dyn Dispatcher>,
    poll_timeout: Duration,
    shared: Arc<LoopShared>,
}

/// Resolves once a stop has been requested (or the sender is gone).
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

impl Worker {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) -> Result<(), TriggerError> {
        let _release = ReleaseOnExit(self.shared.clone());

        let connected = tokio::select! {
            biased;
            _ = stop_requested(&mut stop_rx) => {
                info!(loop_id = %self.id, "stop requested before connect completed");
                return Ok(());
            }
            connected = self.connector.connect(&self.settings) => connected,
        };

        let client = match connected {
            Ok(client) => client,
            Err(e) => {
                let err = TriggerError::from(e);
                warn!(loop_id = %self.id, topic = %self.settings.topic, error = %err, "consumer failed to connect");
                self.shared.record_error(&err);
                return Err(err);
            }
        };
        self.shared.install_client(client.clone());

        if !self.shared.transition(LoopState::Starting, LoopState::Running) {
            info!(loop_id = %self.id, "stop requested while connecting");
            return Ok(());
        }
        info!(loop_id = %self.id, topic = %self.settings.topic, "consumer running");

        let outcome = loop {
            let polled = tokio::select! {
                _ = stop_requested(&mut stop_rx) => break Ok(()),
                polled = client.poll(self.poll_timeout) => polled,
            };

            match polled {
                Ok(records) => {
                    for record in &records {
                        self.handle_record(record).await;
                    }
                }
                Err(QueueError::Closed) => {
                    info!(loop_id = %self.id, "broker client closed, leaving poll loop");
                    break Ok(());
                }
                Err(e) => {
                    let err = TriggerError::from(e);
                    warn!(loop_id = %self.id, topic = %self.settings.topic, error = %err, "broker poll failed, stopping consumer");
                    self.shared.record_error(&err);
                    break Err(err);
                }
            }
        };

        self.shared.transition(LoopState::Running, LoopState::Stopping);
        outcome
    }

    async fn handle_record(&self, record: &BrokerRecord) {
        let counters = &self.shared.counters;
        counters.received.fetch_add(1, Ordering::Relaxed);

        let message = match decode_record(record) {
            Ok(message) => message,
            Err(e) => {
                counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "skipping undecodable build message"
                );
                return;
            }
        };

        let snapshot = self.registry.snapshot();
        let requests = match_message(&message, &snapshot, &record.topic);
        debug!(
            project = %message.project,
            key = ?message.key,
            offset = record.offset,
            matches = requests.len(),
            "build message matched"
        );

        for request in requests {
            let project = request.project.clone();
            match self.dispatcher.dispatch(request).await {
                Ok(()) => {
                    counters.dispatched.fetch_add(1, Ordering::Relaxed);
                    info!(project = %project, offset = record.offset, "build dispatched");
                }
                Err(e) => {
                    counters.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(project = %project, error = %e, "dispatch failed, message dropped for this subscriber");
                }
            }
        }
    }
}
