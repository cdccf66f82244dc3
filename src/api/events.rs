use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Pushed when a chat message is persisted; payload is a `Message`.
pub const NEW_MESSAGE: &str = "new_message";
/// Pushed when a conversation's summary (last message, ordering) changes.
pub const CONVERSATION_UPDATED: &str = "conversation_updated";

const NAME_KEYS: [&str; 2] = ["event", "type"];
const PAYLOAD_KEYS: [&str; 2] = ["payload", "data"];

/// A decoded server push, normalized so both producer conventions
/// (`{"event", "payload"}` and `{"type", "data"}`) look the same.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub name: String,
    pub payload: Value,
}

impl InboundEvent {
    pub fn decode(raw: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(raw)? {
            Value::Object(frame) => Self::from_frame(frame),
            _ => Err(Error::MissingEventName),
        }
    }

    fn from_frame(mut frame: Map<String, Value>) -> Result<Self> {
        let name = NAME_KEYS
            .iter()
            .find_map(|key| frame.get(*key).and_then(Value::as_str).filter(|name| !name.is_empty()))
            .ok_or(Error::MissingEventName)?
            .to_string();

        let payload = match PAYLOAD_KEYS.iter().find(|key| frame.contains_key(**key)) {
            Some(key) => frame.remove(*key).unwrap_or(Value::Null),
            None => Value::Object(frame),
        };

        Ok(Self { name, payload })
    }
}
