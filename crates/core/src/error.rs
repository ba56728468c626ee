use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TriggerError {
    /// Invalid or incomplete connection configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Broker unreachable or connection dropped mid-poll.
    #[error("connection error: {0}")]
    Connection(String),

    /// A single message could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    /// The host's scheduling call failed.
    #[error("dispatch error: {0}")]
    Dispatch(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, TriggerError>;
