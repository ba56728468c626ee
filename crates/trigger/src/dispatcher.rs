//! Dispatch boundary: hands matched build requests to the host scheduler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use ktrigger_core::TriggerError;

/// A parameter override passed to the host with a dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildParameter {
    pub name: String,
    pub value: String,
}

impl BuildParameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One build the host should schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub project: String,
    /// Human-readable cause shown by the host.
    pub cause: String,
    /// Overrides for parameters the message supplied; everything else is
    /// left to the host's defaults.
    pub parameters: Vec<BuildParameter>,
}

/// Cause description attached to builds triggered from `topic`.
pub fn cause_for_topic(topic: &str) -> String {
    format!("Triggered by remote build message from Kafka topic: {topic}")
}

/// Host scheduler callback.
///
/// Fire-and-forget from the consumer's point of view: errors are logged and
/// never retried. The host owns job-not-found and race handling.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), TriggerError>;
}

/// Blanket implementation so `Arc<dyn Dispatcher>` can be used directly.
#[async_trait]
impl<T: Dispatcher + ?Sized> Dispatcher for Arc<T> {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), TriggerError> {
        (**self).dispatch(request).await
    }
}

/// Logs every dispatch; useful for dry runs.
#[derive(Debug, Default, Clone)]
pub struct LogDispatcher;

#[async_trait]
impl Dispatcher for LogDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), TriggerError> {
        info!(
            project = %request.project,
            cause = %request.cause,
            parameters = ?request.parameters,
            "build dispatched"
        );
        Ok(())
    }
}

/// Forwards dispatches into a tokio channel for an in-process host.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<DispatchRequest>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DispatchRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), TriggerError> {
        self.tx
            .send(request)
            .map_err(|e| TriggerError::Dispatch(format!("host receiver dropped: {}", e.0.project)))
    }
}

/// POSTs each dispatch as JSON to a host endpoint.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    url: String,
}

impl WebhookDispatcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TriggerError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TriggerError::Config(format!("failed to build webhook client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Dispatcher for WebhookDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> Result<(), TriggerError> {
        debug!(url = %self.url, project = %request.project, "posting dispatch webhook");
        let resp = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| TriggerError::Dispatch(format!("webhook request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TriggerError::Dispatch(format!(
                "webhook for '{}' returned {status}",
                request.project
            )));
        }
        Ok(())
    }
}
