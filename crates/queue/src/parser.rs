//! Decode broker record payloads into [`BuildMessage`]s.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::consumer::BrokerRecord;
use crate::error::QueueError;

/// One `{name, value}` entry of a build message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MessageParameter {
    pub name: String,
    #[serde(default, deserialize_with = "scalar_as_string")]
    pub value: String,
}

/// A build-trigger request as published by producers.
///
/// Wire format: `{"project": "...", "token": "...", "parameter": [{"name": "...", "value": "..."}]}`.
/// Unknown fields are ignored; a missing or null `parameter` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BuildMessage {
    pub project: String,
    #[serde(default)]
    pub token: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub parameter: Vec<MessageParameter>,
    /// The record key, decoded as JSON. Carried for logging only.
    #[serde(skip)]
    pub key: Option<Value>,
}

impl BuildMessage {
    pub fn parameters(&self) -> &[MessageParameter] {
        &self.parameter
    }
}

/// Producers are not strict about parameter value types: render numbers and
/// booleans as text, null as empty.
fn scalar_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<MessageParameter>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<MessageParameter>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Decode a record's key as JSON. An absent key is `None`.
fn decode_key(record: &BrokerRecord) -> Result<Option<Value>, QueueError> {
    record
        .key
        .as_deref()
        .map(serde_json::from_slice)
        .transpose()
        .map_err(|e| {
            QueueError::Decode(format!(
                "invalid record key at {}/{}@{}: {}",
                record.topic, record.partition, record.offset, e
            ))
        })
}

/// Decode a single record as a [`BuildMessage`]. Key and value are both JSON;
/// either failing to parse rejects the record.
pub fn decode_record(record: &BrokerRecord) -> Result<BuildMessage, QueueError> {
    let key = decode_key(record)?;
    let payload = record.payload.as_deref().ok_or_else(|| {
        QueueError::Decode(format!(
            "record {}/{}@{} has no value",
            record.topic, record.partition, record.offset
        ))
    })?;

    let mut message: BuildMessage = serde_json::from_slice(payload).map_err(|e| {
        QueueError::Decode(format!(
            "invalid build message at {}/{}@{}: {}",
            record.topic, record.partition, record.offset, e
        ))
    })?;
    message.key = key;
    Ok(message)
}
