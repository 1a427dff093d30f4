//! Transport framing around [`Message`]
//!
//! Remote (WebSocket text) frames are one of:
//! - a bare message object
//! - `{"ackId": n, "message": {...}}`, a message that expects an acknowledgement
//! - `{"ackId": n, "response": ...}`, the acknowledgement itself
//!
//! Local channel frames are `[u32 LE length][JSON {id, response, payload}]`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::message::{Message, MessageError};

/// Upper bound on a single local frame body
pub const MAX_LOCAL_FRAME_LEN: usize = 1024 * 1024;

/// One WebSocket text frame exchanged with the Game Engine
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteFrame {
    Message(Message),
    Request { ack_id: u64, message: Message },
    Ack { ack_id: u64, response: Value },
}

impl RemoteFrame {
    pub fn decode(text: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(text).map_err(MessageError::Malformed)?;

        if value.get("ackId").is_none() {
            return Message::from_value(value).map(Self::Message);
        }
        let ack_id = value["ackId"]
            .as_u64()
            .ok_or_else(|| MessageError::Frame("ackId must be an unsigned integer".into()))?;

        if let Some(message) = value.get("message") {
            let message = Message::from_value(message.clone())?;
            return Ok(Self::Request { ack_id, message });
        }
        if let Some(response) = value.get("response") {
            return Ok(Self::Ack {
                ack_id,
                response: response.clone(),
            });
        }
        Err(MessageError::Frame(
            "ack frame carries neither message nor response".into(),
        ))
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        let value = match self {
            Self::Message(message) => message.to_value()?,
            Self::Request { ack_id, message } => {
                json!({ "ackId": ack_id, "message": message.to_value()? })
            }
            Self::Ack { ack_id, response } => json!({ "ackId": ack_id, "response": response }),
        };
        serde_json::to_string(&value).map_err(MessageError::Encode)
    }
}

/// Request/response envelope used on the local channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalFrame {
    pub id: u32,
    pub response: bool,
    pub payload: Message,
}

/// Wire shape of a local frame before its message is validated
#[derive(Deserialize)]
struct RawLocalFrame {
    id: u32,
    #[serde(default)]
    response: bool,
    payload: Value,
}

impl LocalFrame {
    /// Encode with the length prefix
    pub fn encode(&self) -> Result<Bytes, MessageError> {
        let body = serde_json::to_vec(self).map_err(MessageError::Encode)?;
        if body.len() > MAX_LOCAL_FRAME_LEN {
            return Err(MessageError::Frame(format!(
                "frame of {} bytes exceeds limit",
                body.len()
            )));
        }
        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    /// Decode a frame body (length prefix already stripped)
    pub fn decode(body: &[u8]) -> Result<Self, MessageError> {
        let raw: RawLocalFrame = serde_json::from_slice(body).map_err(MessageError::Malformed)?;
        Ok(Self {
            id: raw.id,
            response: raw.response,
            payload: Message::from_value(raw.payload)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::GAME_ENGINE;

    #[test]
    fn bare_message_frame() {
        let frame = RemoteFrame::decode(r#"{"event":"ping","dst":"robot"}"#).unwrap();
        assert!(matches!(frame, RemoteFrame::Message(m) if m.event == "ping"));
    }

    #[test]
    fn request_and_ack_frames() {
        let text = r#"{"ackId":7,"message":{"event":"config","dst":"robot","src":"gameEngine"}}"#;
        match RemoteFrame::decode(text).unwrap() {
            RemoteFrame::Request { ack_id, message } => {
                assert_eq!(ack_id, 7);
                assert_eq!(message.src.as_deref(), Some(GAME_ENGINE));
            }
            other => panic!("unexpected frame {other:?}"),
        }

        let ack = RemoteFrame::decode(r#"{"ackId":3,"response":{"ok":true}}"#).unwrap();
        assert_eq!(
            ack,
            RemoteFrame::Ack {
                ack_id: 3,
                response: json!({"ok": true})
            }
        );
    }

    #[test]
    fn ack_frame_without_body_is_rejected() {
        assert!(RemoteFrame::decode(r#"{"ackId":1}"#).is_err());
        assert!(RemoteFrame::decode(r#"{"ackId":"x","response":1}"#).is_err());
    }

    #[test]
    fn request_with_malformed_message_is_rejected() {
        let err = RemoteFrame::decode(r#"{"ackId":1,"message":{"dst":"robot"}}"#).unwrap_err();
        assert!(matches!(err, MessageError::Malformed(_)));
    }

    #[test]
    fn local_frame_carries_length_prefix() {
        let frame = LocalFrame {
            id: u32::MAX,
            response: true,
            payload: Message::new("ping", "ui"),
        };
        let bytes = frame.encode().unwrap();
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - 4);
        assert_eq!(LocalFrame::decode(&bytes[4..]).unwrap(), frame);
    }

    #[test]
    fn local_frame_payload_is_validated_like_remote_messages() {
        let empty_dst = br#"{"id":1,"payload":{"event":"ping","dst":""}}"#;
        assert!(matches!(
            LocalFrame::decode(empty_dst),
            Err(MessageError::EmptyField("dst"))
        ));

        let scalar_payload = br#"{"id":2,"payload":{"event":"ping","dst":"robot","payload":5}}"#;
        assert!(LocalFrame::decode(scalar_payload).is_err());

        let minimal = br#"{"id":3,"payload":{"event":"ping","dst":"robot"}}"#;
        let frame = LocalFrame::decode(minimal).unwrap();
        assert!(!frame.response);
        assert_eq!(frame.payload.seat, 0);
    }
}
