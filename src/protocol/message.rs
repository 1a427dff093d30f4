//! The message envelope shared by every transport

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Sender id reserved for the authoritative Game Engine
pub const GAME_ENGINE: &str = "gameEngine";

/// One unit of communication with the Game Engine or a peer.
///
/// Serializes to `{event, dst, src, seat, payload, isAdmin}`. Missing optional
/// keys take their defaults: `src = null`, `seat = 0`, `payload = {}`,
/// `isAdmin = false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Verb, e.g. `config` or an input id
    pub event: String,
    /// Logical recipient
    pub dst: String,
    /// Sender id, `gameEngine` for the server itself
    #[serde(default)]
    pub src: Option<String>,
    /// Robot seat the message concerns
    #[serde(default)]
    pub seat: u32,
    /// Event-specific body, always an object or an array
    #[serde(default = "empty_payload", deserialize_with = "payload_body")]
    pub payload: Value,
    /// Privilege asserted by the sender
    #[serde(default)]
    pub is_admin: bool,
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

fn payload_body<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
    let value = Value::deserialize(deserializer)?;
    if value.is_object() || value.is_array() {
        Ok(value)
    } else {
        Err(D::Error::custom("payload must be an object or an array"))
    }
}

impl Message {
    /// Create a message with default source, seat and an empty payload
    pub fn new(event: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            dst: dst.into(),
            src: None,
            seat: 0,
            payload: empty_payload(),
            is_admin: false,
        }
    }

    /// Create a message addressed to the Game Engine
    pub fn to_game_engine(event: impl Into<String>) -> Self {
        Self::new(event, GAME_ENGINE)
    }

    pub fn with_src(mut self, src: impl Into<String>) -> Self {
        self.src = Some(src.into());
        self
    }

    pub fn with_seat(mut self, seat: u32) -> Self {
        self.seat = seat;
        self
    }

    pub fn with_admin(mut self, is_admin: bool) -> Self {
        self.is_admin = is_admin;
        self
    }

    /// Attach a payload, rejecting anything that is not an object or an array
    pub fn with_payload<T: Serialize>(mut self, payload: T) -> Result<Self, MessageError> {
        let value = serde_json::to_value(payload).map_err(MessageError::Encode)?;
        if !(value.is_object() || value.is_array()) {
            return Err(MessageError::InvalidPayload);
        }
        self.payload = value;
        Ok(self)
    }

    /// Validate and build a message from an already parsed JSON value
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let message: Message = serde_json::from_value(value).map_err(MessageError::Malformed)?;
        message.validate()
    }

    /// Validate and build a message from JSON text
    pub fn from_json(text: &str) -> Result<Self, MessageError> {
        let message: Message = serde_json::from_str(text).map_err(MessageError::Malformed)?;
        message.validate()
    }

    pub fn to_value(&self) -> Result<Value, MessageError> {
        serde_json::to_value(self).map_err(MessageError::Encode)
    }

    fn validate(self) -> Result<Self, MessageError> {
        if self.event.is_empty() {
            return Err(MessageError::EmptyField("event"));
        }
        if self.dst.is_empty() {
            return Err(MessageError::EmptyField("dst"));
        }
        Ok(self)
    }

    /// True when the authoritative server authored this message
    pub fn is_from_game_engine(&self) -> bool {
        self.src.as_deref() == Some(GAME_ENGINE)
    }

    /// Decode the payload into a typed body
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        serde_json::from_value(self.payload.clone()).map_err(MessageError::Malformed)
    }

    /// Build the reply to this message carrying `body`.
    ///
    /// Scalar bodies are wrapped as `{"result": body}` so the reply stays a
    /// valid envelope.
    pub fn reply(&self, from: &str, body: Value) -> Message {
        let payload = if body.is_object() || body.is_array() {
            body
        } else {
            serde_json::json!({ "result": body })
        };
        Message {
            event: self.event.clone(),
            dst: self.src.clone().unwrap_or_else(|| GAME_ENGINE.to_string()),
            src: Some(from.to_string()),
            seat: self.seat,
            payload,
            is_admin: false,
        }
    }
}

/// Envelope validation errors. A message that fails here is dropped, never
/// delivered.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("required field '{0}' is empty")]
    EmptyField(&'static str),

    #[error("payload must be an object or an array")]
    InvalidPayload,

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed frame: {0}")]
    Frame(String),
}
