//! End-to-end tests: in-memory broker -> manager -> matcher -> dispatcher.
//!
//! Each test publishes JSON build messages to a `MemoryBroker` topic and
//! observes what reaches a `ChannelDispatcher`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use ktrigger::{
    ApplyOutcome, BuildParameter, ChannelDispatcher, ConnectionConfig, ConnectionManager, DispatchRequest,
    LoopOptions, ManagerOptions, Subscriber, SubscriberRegistry,
};
use ktrigger_core::config::{BrokerList, RawConnectionConfig};
use ktrigger_core::ParameterDefinition;
use ktrigger_queue::{MemoryBroker, MemoryConnector};

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    broker: MemoryBroker,
    registry: SubscriberRegistry,
    manager: ConnectionManager,
    dispatched: UnboundedReceiver<DispatchRequest>,
}

impl Harness {
    fn new() -> Self {
        let broker = MemoryBroker::new();
        let registry = SubscriberRegistry::new();
        let (dispatcher, dispatched) = ChannelDispatcher::new();
        let manager = ConnectionManager::with_options(
            Arc::new(MemoryConnector::new(broker.clone())),
            registry.clone(),
            Arc::new(dispatcher),
            ManagerOptions {
                loop_options: LoopOptions {
                    poll_timeout: Duration::from_millis(20),
                    max_batch: 100,
                },
                stop_timeout: TIMEOUT,
            },
        );
        Self {
            broker,
            registry,
            manager,
            dispatched,
        }
    }

    async fn start(&self, config: ConnectionConfig) {
        assert_eq!(self.manager.apply_config(config).await.unwrap(), ApplyOutcome::Started);
        wait_active(&self.manager).await;
    }

    async fn next_dispatch(&mut self) -> DispatchRequest {
        timeout(TIMEOUT, self.dispatched.recv())
            .await
            .expect("no dispatch arrived")
            .expect("dispatch channel closed")
    }
}

fn enabled(brokers: &str, topic: &str) -> ConnectionConfig {
    ConnectionConfig::from_raw(RawConnectionConfig {
        enabled: true,
        brokers: BrokerList::Csv(brokers.into()),
        topic: topic.into(),
        ..Default::default()
    })
}

fn message(project: &str, token: &str, branch: &str) -> String {
    format!(r#"{{"project":"{project}","token":"{token}","parameter":[{{"name":"BRANCH","value":"{branch}"}}]}}"#)
}

fn app(project: &str, token: Option<&str>) -> Subscriber {
    Subscriber::new(project, token, vec![ParameterDefinition::new("BRANCH", "develop")])
}

async fn wait_active(manager: &ConnectionManager) {
    timeout(TIMEOUT, async {
        while !manager.is_active() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("consumer never became active");
}

#[tokio::test]
async fn derived_group_and_split_brokers() {
    let h = Harness::new();
    h.start(enabled("b1:9092,b2:9092", "builds")).await;

    let connections = h.broker.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].brokers, vec!["b1:9092", "b2:9092"]);
    assert_eq!(connections[0].topic, "builds");
    assert!(connections[0].group_id.contains("builds"));
    assert_eq!(connections[0].offset_reset, "latest");

    let status = h.manager.status();
    assert_eq!(status.group_id.as_deref(), Some(connections[0].group_id.as_str()));

    h.manager.shutdown_and_wait(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn matching_message_dispatches_overrides() {
    let mut h = Harness::new();
    h.registry.add(app("app1", Some("T1")));
    h.start(enabled("b1:9092", "builds")).await;

    h.broker.publish("builds", message("app1", "T1", "main"));

    let req = h.next_dispatch().await;
    assert_eq!(req.project, "app1");
    assert_eq!(req.parameters, vec![BuildParameter::new("BRANCH", "main")]);
    assert_eq!(req.cause, "Triggered by remote build message from Kafka topic: builds");

    h.manager.shutdown_and_wait(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn wrong_token_and_tokenless_are_never_dispatched() {
    let mut h = Harness::new();
    h.registry.add(app("app1", Some("T2")));
    h.registry.add(app("app2", None));
    h.registry.add(app("control", Some("C")));
    h.start(enabled("b1:9092", "builds")).await;

    h.broker.publish("builds", message("app1", "T1", "main"));
    h.broker.publish("builds", message("app2", "", "main"));
    h.broker.publish("builds", message("control", "C", "main"));

    // Records are handled in order, so the control dispatch arriving first
    // means the earlier two produced nothing.
    assert_eq!(h.next_dispatch().await.project, "control");
    assert!(h.dispatched.try_recv().is_err());

    h.manager.shutdown_and_wait(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn registry_changes_apply_to_running_consumer() {
    let mut h = Harness::new();
    h.registry.add(app("control", Some("C")));
    h.start(enabled("b1:9092", "builds")).await;

    h.registry.add(app("app1", Some("T1")));
    h.broker.publish("builds", message("app1", "T1", "main"));
    assert_eq!(h.next_dispatch().await.project, "app1");

    h.registry.remove("app1");
    h.broker.publish("builds", message("app1", "T1", "main"));
    h.broker.publish("builds", message("control", "C", "main"));
    assert_eq!(h.next_dispatch().await.project, "control");

    h.manager.shutdown_and_wait(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn malformed_message_does_not_stop_consumer() {
    let mut h = Harness::new();
    h.registry.add(app("app1", Some("T1")));
    h.start(enabled("b1:9092", "builds")).await;

    h.broker.publish("builds", "{\"project\": ");
    h.broker.publish("builds", message("app1", "T1", "main"));

    assert_eq!(h.next_dispatch().await.project, "app1");
    assert!(h.manager.is_active());
    assert_eq!(h.manager.status().stats.unwrap().decode_failures, 1);

    h.manager.shutdown_and_wait(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn disabling_stops_consumer_before_returning() {
    let h = Harness::new();
    h.start(enabled("b1:9092", "builds")).await;
    assert_eq!(h.broker.subscriber_count("builds"), 1);

    let mut disabled = enabled("b1:9092", "builds");
    disabled.enabled = false;
    let outcome = h.manager.apply_config(disabled).await.unwrap();

    assert_eq!(outcome, ApplyOutcome::Stopped);
    assert!(!h.manager.is_active());
    assert!(h.manager.loop_id().is_none());
    assert_eq!(h.broker.subscriber_count("builds"), 0);
}

#[tokio::test]
async fn reapplying_same_config_keeps_the_loop() {
    let h = Harness::new();
    h.start(enabled("b1:9092", "builds")).await;
    let id = h.manager.loop_id();

    for _ in 0..3 {
        let outcome = h.manager.apply_config(enabled("b1:9092", "builds")).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged);
    }
    assert_eq!(h.manager.loop_id(), id);
    assert_eq!(h.broker.connections().len(), 1);

    h.manager.shutdown_and_wait(TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn reapply_after_connection_loss_reconnects() {
    let mut h = Harness::new();
    h.registry.add(app("app1", Some("T1")));
    h.start(enabled("b1:9092", "builds")).await;

    h.broker.break_connections("leader not available");
    timeout(TIMEOUT, async {
        while h.manager.status().state != ktrigger::LoopState::Stopped {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(!h.manager.is_active());
    assert!(h.manager.status().last_error.unwrap().contains("leader not available"));

    h.start(enabled("b1:9092", "builds")).await;
    h.broker.publish("builds", message("app1", "T1", "main"));
    assert_eq!(h.next_dispatch().await.project, "app1");

    h.manager.shutdown_and_wait(TIMEOUT).await.unwrap();
}
