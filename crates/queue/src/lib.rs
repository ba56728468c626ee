pub mod consumer;
pub mod error;
pub mod kafka;
pub mod memory;
pub mod parser;

pub use consumer::{build_connector, BrokerClient, BrokerConnector, BrokerRecord, ConsumerSettings};
pub use error::QueueError;
pub use kafka::{KafkaConnector, KafkaOptions};
pub use memory::{MemoryBroker, MemoryConnector};
pub use parser::{decode_record, BuildMessage, MessageParameter};
