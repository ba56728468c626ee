//! Broker-layer error types.

use ktrigger_core::TriggerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("message decode error: {0}")]
    Decode(String),

    /// The client was closed, either by `stop` or out-of-band.
    #[error("broker client closed")]
    Closed,

    #[error("config error: {0}")]
    Config(String),

    #[error("provider error: {0}")]
    Provider(String),
}

impl From<QueueError> for TriggerError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Decode(msg) => TriggerError::Decode(msg),
            QueueError::Config(msg) => TriggerError::Config(msg),
            QueueError::Closed => TriggerError::Connection("broker client closed".into()),
            QueueError::Connection(msg) | QueueError::Provider(msg) => TriggerError::Connection(msg),
        }
    }
}
