pub mod config;
pub mod error;
pub mod subscriber;

pub use config::{ConnectionConfig, Credentials, RawConnectionConfig, Secret};
pub use error::*;
pub use subscriber::{ParameterDefinition, Subscriber};
