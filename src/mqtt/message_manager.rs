use super::{RawMessage, MAX_PAYLOAD};
use crate::persistence::MaskedConfig;
use chrono::{DateTime, Local};
use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Payload on {topic} is not valid JSON: {source}")]
    Parse {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Payload of {0} bytes exceeds the {MAX_PAYLOAD} byte limit")]
    TooLarge(usize),

    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A parsed inbound message, consumed by the dispatcher right away.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundCommand {
    pub topic: String,
    pub payload: Value,
    pub received_at: DateTime<Local>,
}

impl InboundCommand {
    pub fn parse(raw: &RawMessage) -> Result<Self, MessageError> {
        let payload =
            serde_json::from_slice(&raw.payload).map_err(|source| MessageError::Parse {
                topic: raw.topic.clone(),
                source,
            })?;

        Ok(Self {
            topic: raw.topic.clone(),
            payload,
            received_at: Local::now(),
        })
    }

    /// The `d` object commands carry their arguments in.
    pub fn d(&self) -> Option<&Map<String, Value>> {
        self.payload.get("d").and_then(Value::as_object)
    }
}

impl fmt::Display for InboundCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} - {}: {}",
            self.received_at.format("%H:%M:%S%.3f"),
            self.topic,
            self.payload
        )
    }
}

/// `{"d":{"metadata":{..},"supports":{"deviceActions":true}}}`, published on `manage`.
pub fn metadata_announcement(meta: &Map<String, Value>) -> Value {
    json!({
        "d": {
            "metadata": meta,
            "supports": { "deviceActions": true }
        }
    })
}

/// Echo of a `d` object on the info topic.
pub fn info_echo(d: &Value) -> Value {
    json!({ "info": d })
}

pub fn upgrade_starting() -> Value {
    json!({ "info": { "upgrade": "Device will be upgraded." } })
}

pub fn ota_status(status: &str) -> Value {
    json!({ "OTA": { "status": status } })
}

pub fn config_snapshot(config: MaskedConfig) -> Value {
    json!({ "config": config.into_value() })
}

/// Telemetry document `{"d":{..}}`.
pub fn telemetry(d: Map<String, Value>) -> Value {
    json!({ "d": d })
}

/// Serializes `value`, refusing anything over [`MAX_PAYLOAD`].
pub fn encode(value: &Value) -> Result<Vec<u8>, MessageError> {
    let bytes = serde_json::to_vec(value)?;
    if bytes.len() > MAX_PAYLOAD {
        return Err(MessageError::TooLarge(bytes.len()));
    }
    Ok(bytes)
}
