//! Message delivery: the remote Game Engine session and the optional local channel

pub mod backoff;
pub mod local;
pub mod remote;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{Message, MessageError};

pub use backoff::{connect_with_retry, Backoff, ConnectFailure};
pub use local::{LocalChannel, LocalHandle};
pub use remote::{RemoteConfig, RemoteSession, SessionHandle};

/// Which transport a message arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Remote,
    Local,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote => f.write_str("remote"),
            Self::Local => f.write_str("local"),
        }
    }
}

/// One-shot reply path back to whoever sent a request
pub struct Responder {
    reply: Box<dyn FnOnce(Value) -> bool + Send>,
}

impl Responder {
    pub fn new(reply: impl FnOnce(Value) -> bool + Send + 'static) -> Self {
        Self {
            reply: Box::new(reply),
        }
    }

    /// Send the response; false when the connection it came from is gone
    pub fn respond(self, response: Value) -> bool {
        (self.reply)(response)
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Responder")
    }
}

/// A validated message plus where it came from
#[derive(Debug)]
pub struct Inbound {
    pub message: Message,
    pub origin: Origin,
    /// Present when the sender expects an acknowledgement
    pub reply: Option<Responder>,
}

impl Inbound {
    pub fn new(message: Message, origin: Origin) -> Self {
        Self {
            message,
            origin,
            reply: None,
        }
    }

    pub fn with_reply(mut self, reply: Responder) -> Self {
        self.reply = Some(reply);
        self
    }
}

/// Everything the transports report to the lifecycle
#[derive(Debug)]
pub enum TransportEvent {
    Message(Inbound),
    Connected(Origin),
    Disconnected(Origin),
    /// The Game Engine rejected our credentials; fatal
    AuthFailed(AuthError),
}

/// Outbound path used by the lifecycle and game context
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Best-effort send; false when nothing is connected
    fn send(&self, message: Message) -> bool;

    /// Send and wait for the other side's acknowledgement
    async fn send_and_await_ack(&self, message: Message) -> Result<Value, TransportError>;

    fn is_connected(&self) -> bool;

    /// Stop all transports
    fn close(&self);
}

/// Transport-level errors, retried or reported but never fatal
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("timed out waiting for acknowledgement")]
    AckTimeout,

    #[error("connection closed before acknowledgement")]
    AckDropped,

    #[error("invalid handshake header: {0}")]
    InvalidHeader(String),

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Message(#[from] MessageError),
}

/// The Game Engine refused the handshake credentials
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid credentials: {reason}")]
pub struct AuthError {
    pub reason: String,
}

/// Remote session with the local channel as fallback
pub struct Transports {
    remote: SessionHandle,
    local: Option<LocalHandle>,
    cancel: CancellationToken,
}

impl Transports {
    pub fn new(remote: SessionHandle, local: Option<LocalHandle>, cancel: CancellationToken) -> Self {
        Self {
            remote,
            local,
            cancel,
        }
    }

    fn connected_local(&self) -> Option<&LocalHandle> {
        self.local.as_ref().filter(|local| local.is_connected())
    }
}

#[async_trait]
impl MessageSink for Transports {
    fn send(&self, message: Message) -> bool {
        if self.remote.is_connected() {
            return self.remote.send(message);
        }
        match self.connected_local() {
            Some(local) => local.send(message),
            None => {
                debug!(event = %message.event, "No transport connected, dropping outbound message");
                false
            }
        }
    }

    async fn send_and_await_ack(&self, message: Message) -> Result<Value, TransportError> {
        if self.remote.is_connected() {
            return self.remote.send_and_await_ack(message).await;
        }
        match self.connected_local() {
            Some(local) => local.request(message).await.map(|reply| reply.payload),
            None => Err(TransportError::NotConnected),
        }
    }

    fn is_connected(&self) -> bool {
        self.remote.is_connected() || self.connected_local().is_some()
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}
