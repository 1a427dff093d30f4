//! Remote Game Engine session over WebSocket with automatic reconnect

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::protocol::{Message, RemoteFrame};

use super::backoff::{connect_with_retry, Backoff, ConnectFailure};
use super::{AuthError, Inbound, Origin, Responder, TransportError, TransportEvent};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handshake marker the Game Engine uses for rejected credentials
const INVALID_CREDENTIALS: &str = "invalid credentials";

/// Connection parameters for the remote session
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub client_id: String,
    pub robot_id: String,
    pub token: String,
    pub protocol_version: u32,
    pub connect_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub ack_timeout: Duration,
}

impl From<&Config> for RemoteConfig {
    fn from(config: &Config) -> Self {
        Self {
            url: config.ge_url.clone(),
            client_id: config.client_id.clone(),
            robot_id: config.robot_id.clone(),
            token: config.token.clone(),
            protocol_version: config.protocol_version,
            connect_timeout: config.connect_timeout,
            backoff_min: config.backoff_min,
            backoff_max: config.backoff_max,
            ack_timeout: config.ack_timeout,
        }
    }
}

/// State shared between the session loop and its handles
struct SessionShared {
    /// Writer for the live connection, `None` while disconnected
    writer: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    pending_acks: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
    next_ack_id: AtomicU64,
    ack_timeout: Duration,
}

impl SessionShared {
    fn resolve_ack(&self, ack_id: u64, response: Value) {
        match self.pending_acks.lock().remove(&ack_id) {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(ack_id, "Acknowledgement for unknown or expired request"),
        }
    }

    /// Dropping the senders wakes every waiter with `AckDropped`
    fn fail_pending(&self) {
        let dropped = std::mem::take(&mut *self.pending_acks.lock());
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Dropping pending acknowledgements");
        }
    }
}

/// Cheap cloneable handle for sending through the session
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    pub fn is_connected(&self) -> bool {
        self.shared.writer.lock().is_some()
    }

    /// Best-effort send; false while disconnected
    pub fn send(&self, message: Message) -> bool {
        let event = message.event.clone();
        let text = match RemoteFrame::Message(message).encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(event = %event, error = %e, "Failed to encode outbound message");
                return false;
            }
        };
        self.send_text(&event, text)
    }

    fn send_text(&self, event: &str, text: String) -> bool {
        let writer = self.shared.writer.lock();
        match writer.as_ref() {
            Some(tx) => tx.send(WsMessage::Text(text)).is_ok(),
            None => {
                debug!(event = %event, "Not connected to GE, dropping outbound message");
                false
            }
        }
    }

    /// Send a request and wait for the Game Engine's acknowledgement
    pub async fn send_and_await_ack(&self, message: Message) -> Result<Value, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let ack_id = self.shared.next_ack_id.fetch_add(1, Ordering::Relaxed);
        let event = message.event.clone();
        let text = RemoteFrame::Request { ack_id, message }.encode()?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending_acks.lock().insert(ack_id, tx);

        if !self.send_text(&event, text) {
            self.shared.pending_acks.lock().remove(&ack_id);
            return Err(TransportError::NotConnected);
        }

        match tokio::time::timeout(self.shared.ack_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(TransportError::AckDropped),
            Err(_) => {
                self.shared.pending_acks.lock().remove(&ack_id);
                warn!(event = %event, ack_id, "Acknowledgement timed out");
                Err(TransportError::AckTimeout)
            }
        }
    }
}

/// Owns the one logical connection to the Game Engine
pub struct RemoteSession {
    config: RemoteConfig,
    shared: Arc<SessionShared>,
}

impl RemoteSession {
    pub fn new(config: RemoteConfig) -> Self {
        let shared = Arc::new(SessionShared {
            writer: Mutex::new(None),
            pending_acks: Mutex::new(HashMap::new()),
            next_ack_id: AtomicU64::new(1),
            ack_timeout: config.ack_timeout,
        });
        Self { config, shared }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: self.shared.clone(),
        }
    }

    /// Connect, serve, reconnect. Returns only on cancellation or when the
    /// Game Engine rejects our credentials.
    pub async fn run(self, events: mpsc::UnboundedSender<TransportEvent>, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.backoff_min, self.config.backoff_max);

        loop {
            info!(url = %self.config.url, robot_id = %self.config.robot_id, "Connecting to GE");

            let attempt = connect_with_retry(
                &mut backoff,
                self.config.connect_timeout,
                &cancel,
                || dial(&self.config),
            )
            .await;

            let stream = match attempt {
                None => break,
                Some(Err(e)) => {
                    error!(error = %e, "GE rejected credentials, not retrying");
                    let _ = events.send(TransportEvent::AuthFailed(e));
                    break;
                }
                Some(Ok(stream)) => stream,
            };

            info!(client_id = %self.config.client_id, "Connected to GE");
            self.serve(stream, &events, &cancel).await;

            if cancel.is_cancelled() {
                break;
            }
            warn!("GE connection lost, reconnecting");
        }

        info!("GE session stopped");
    }

    async fn serve(
        &self,
        stream: WsStream,
        events: &mpsc::UnboundedSender<TransportEvent>,
        cancel: &CancellationToken,
    ) {
        let (mut sink, mut reader) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        *self.shared.writer.lock() = Some(tx.clone());
        let _ = events.send(TransportEvent::Connected(Origin::Remote));

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    debug!(error = %e, "GE send failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = reader.next() => next,
            };

            match next {
                Some(Ok(WsMessage::Text(text))) => self.handle_text(&text, &tx, events),
                Some(Ok(WsMessage::Binary(_))) => {
                    warn!("Received binary frame from GE, ignoring");
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(frame = ?frame, "GE closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "GE connection error");
                    break;
                }
                None => break,
            }
        }

        self.shared.writer.lock().take();
        self.shared.fail_pending();
        drop(tx);
        if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
            debug!("GE writer did not finish in time");
        }

        let _ = events.send(TransportEvent::Disconnected(Origin::Remote));
    }

    fn handle_text(
        &self,
        text: &str,
        tx: &mpsc::UnboundedSender<WsMessage>,
        events: &mpsc::UnboundedSender<TransportEvent>,
    ) {
        let frame = match RemoteFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed message from GE");
                return;
            }
        };

        let inbound = match frame {
            RemoteFrame::Ack { ack_id, response } => {
                self.shared.resolve_ack(ack_id, response);
                return;
            }
            RemoteFrame::Message(message) => Inbound::new(message, Origin::Remote),
            RemoteFrame::Request { ack_id, message } => {
                let tx = tx.clone();
                let shared = self.shared.clone();
                let responder = Responder::new(move |response| {
                    let live = shared
                        .writer
                        .lock()
                        .as_ref()
                        .is_some_and(|current| current.same_channel(&tx));
                    if !live {
                        warn!(
                            ack_id,
                            "Connection that sent the request is gone, dropping acknowledgement"
                        );
                        return false;
                    }
                    match (RemoteFrame::Ack { ack_id, response }).encode() {
                        Ok(text) => tx.send(WsMessage::Text(text)).is_ok(),
                        Err(e) => {
                            warn!(ack_id, error = %e, "Failed to encode acknowledgement");
                            false
                        }
                    }
                });
                Inbound::new(message, Origin::Remote).with_reply(responder)
            }
        };

        let _ = events.send(TransportEvent::Message(inbound));
    }
}

/// One connection attempt with the identification headers
async fn dial(config: &RemoteConfig) -> Result<WsStream, ConnectFailure> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(TransportError::from)?;

    let headers = request.headers_mut();
    headers.insert("x-client-id", header_value(&config.client_id)?);
    headers.insert("x-robot-id", header_value(&config.robot_id)?);
    headers.insert(
        "x-protocol-version",
        header_value(&config.protocol_version.to_string())?,
    );
    headers.insert("authorization", header_value(&format!("Bearer {}", config.token))?);

    match connect_async(request).await {
        Ok((stream, _response)) => Ok(stream),
        Err(WsError::Http(response)) => {
            let body = response
                .body()
                .as_deref()
                .map(String::from_utf8_lossy)
                .unwrap_or_default()
                .to_string();
            if is_invalid_credentials(response.status(), &body) {
                Err(AuthError {
                    reason: format!("handshake rejected with {}", response.status()),
                }
                .into())
            } else {
                Err(TransportError::WebSocket(WsError::Http(response)).into())
            }
        }
        Err(e) => Err(TransportError::from(e).into()),
    }
}

fn header_value(value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value).map_err(|e| TransportError::InvalidHeader(e.to_string()))
}

fn is_invalid_credentials(status: StatusCode, body: &str) -> bool {
    status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || body.to_ascii_lowercase().contains(INVALID_CREDENTIALS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> RemoteSession {
        RemoteSession::new(RemoteConfig::from(&Config::new(
            "ws://127.0.0.1:1",
            "token",
            "robot",
        )))
    }

    #[test]
    fn credentials_indicator_detection() {
        assert!(is_invalid_credentials(StatusCode::UNAUTHORIZED, ""));
        assert!(is_invalid_credentials(StatusCode::FORBIDDEN, ""));
        assert!(is_invalid_credentials(
            StatusCode::BAD_REQUEST,
            "Invalid Credentials for robot"
        ));
        assert!(!is_invalid_credentials(StatusCode::SERVICE_UNAVAILABLE, "try later"));
    }

    #[tokio::test]
    async fn sends_fail_fast_when_disconnected() {
        let handle = session().handle();
        assert!(!handle.is_connected());
        assert!(!handle.send(Message::to_game_engine("scoreUpdate")));
        let err = handle
            .send_and_await_ack(Message::to_game_engine("robotInputs"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn request_frames_carry_a_responder() {
        let session = session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        *session.shared.writer.lock() = Some(tx.clone());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        session.handle_text(
            r#"{"ackId":9,"message":{"event":"config","dst":"robot","src":"gameEngine"}}"#,
            &tx,
            &events_tx,
        );

        let Some(TransportEvent::Message(inbound)) = events_rx.recv().await else {
            panic!("expected a message event");
        };
        assert_eq!(inbound.message.event, "config");
        assert!(inbound.reply.unwrap().respond(serde_json::json!({"ready": true})));

        let Some(WsMessage::Text(text)) = rx.recv().await else {
            panic!("expected an ack frame");
        };
        assert!(matches!(
            RemoteFrame::decode(&text).unwrap(),
            RemoteFrame::Ack { ack_id: 9, .. }
        ));
    }

    #[tokio::test]
    async fn malformed_text_is_dropped() {
        let session = session();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        session.handle_text(r#"{"dst":"robot"}"#, &tx, &events_tx);
        drop(events_tx);
        assert!(events_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn ack_resolves_pending_request() {
        let session = session();
        let handle = session.handle();
        let (tx, mut rx) = mpsc::unbounded_channel();
        *session.shared.writer.lock() = Some(tx.clone());
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move {
                handle
                    .send_and_await_ack(Message::to_game_engine("robotInputs"))
                    .await
            }
        });

        let Some(WsMessage::Text(text)) = rx.recv().await else {
            panic!("expected a request frame");
        };
        let RemoteFrame::Request { ack_id, .. } = RemoteFrame::decode(&text).unwrap() else {
            panic!("expected a request frame");
        };
        session.handle_text(
            &format!(r#"{{"ackId":{ack_id},"response":{{"ok":true}}}}"#),
            &tx,
            &events_tx,
        );

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response["ok"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn acknowledgement_after_reconnect_is_not_sent_to_the_old_socket() {
        let session = session();
        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        *session.shared.writer.lock() = Some(old_tx.clone());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        session.handle_text(
            r#"{"ackId":4,"message":{"event":"gameStarted","dst":"robot","src":"gameEngine"}}"#,
            &old_tx,
            &events_tx,
        );
        let Some(TransportEvent::Message(inbound)) = events_rx.recv().await else {
            panic!("expected a message event");
        };

        let (new_tx, mut new_rx) = mpsc::unbounded_channel::<WsMessage>();
        *session.shared.writer.lock() = Some(new_tx);

        assert!(!inbound.reply.unwrap().respond(serde_json::json!({"ready": true})));
        assert!(old_rx.try_recv().is_err());
        assert!(new_rx.try_recv().is_err());
    }

    fn local_config(addr: std::net::SocketAddr) -> RemoteConfig {
        let mut config =
            RemoteConfig::from(&Config::new(format!("ws://{addr}"), "secret", "robot-7"));
        config.backoff_min = Duration::from_millis(10);
        config.backoff_max = Duration::from_millis(50);
        config.connect_timeout = Duration::from_secs(2);
        config
    }

    #[tokio::test]
    async fn reconnects_after_the_engine_drops_the_connection() {
        use tokio::net::TcpListener;
        use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::<[String; 4]>::new()));

        let server = tokio::spawn({
            let seen = seen.clone();
            async move {
                for _ in 0..2 {
                    let (stream, _) = listener.accept().await.unwrap();
                    let seen = seen.clone();
                    let ws = tokio_tungstenite::accept_hdr_async(
                        stream,
                        move |request: &Request, response: Response| {
                            let header = |name: &str| {
                                request
                                    .headers()
                                    .get(name)
                                    .and_then(|v| v.to_str().ok())
                                    .unwrap_or_default()
                                    .to_string()
                            };
                            seen.lock().push([
                                header("x-robot-id"),
                                header("x-client-id"),
                                header("x-protocol-version"),
                                header("authorization"),
                            ]);
                            Ok(response)
                        },
                    )
                    .await
                    .unwrap();
                    drop(ws);
                }
            }
        });

        let config = local_config(addr);
        let client_id = config.client_id.clone();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(RemoteSession::new(config).run(events_tx, cancel.clone()));

        let mut connects = 0;
        let mut disconnects = 0;
        while connects < 2 {
            match tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
                .await
                .unwrap()
            {
                Some(TransportEvent::Connected(Origin::Remote)) => connects += 1,
                Some(TransportEvent::Disconnected(Origin::Remote)) => disconnects += 1,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(disconnects >= 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        server.await.unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[0],
            [
                "robot-7".to_string(),
                client_id,
                "1".to_string(),
                "Bearer secret".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn rejected_credentials_stop_the_session_without_retry() {
        use std::sync::atomic::AtomicU32;
        use tokio::net::TcpListener;
        use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
        use tokio_tungstenite::tungstenite::http;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let server = tokio::spawn({
            let attempts = attempts.clone();
            async move {
                loop {
                    let (stream, _) = listener.accept().await.unwrap();
                    attempts.fetch_add(1, Ordering::SeqCst);
                    let _ = tokio_tungstenite::accept_hdr_async(
                        stream,
                        |_request: &Request, _response: Response| -> Result<Response, ErrorResponse> {
                            Err(http::Response::builder()
                                .status(StatusCode::UNAUTHORIZED)
                                .body(Some("invalid credentials".to_string()))
                                .unwrap())
                        },
                    )
                    .await;
                }
            }
        });

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session = RemoteSession::new(local_config(addr));
        let task = tokio::spawn(session.run(events_tx, CancellationToken::new()));

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(events_rx.recv().await, Some(TransportEvent::AuthFailed(_))));
        assert!(events_rx.recv().await.is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        server.abort();
    }
}
