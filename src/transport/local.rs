//! Optional local side channel over a Unix domain socket

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::frame::MAX_LOCAL_FRAME_LEN;
use crate::protocol::{LocalFrame, Message};

use super::{Inbound, Origin, Responder, TransportError, TransportEvent};

/// Sender id used on replies written to the local channel
const LOCAL_SRC: &str = "robot";

struct LocalShared {
    writer: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Message>>>,
    next_id: AtomicU32,
}

impl LocalShared {
    /// Request ids increment and wrap at `u32::MAX`
    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn write(&self, frame: &LocalFrame) -> Result<(), TransportError> {
        let bytes = frame.encode()?;
        let writer = self.writer.lock();
        let tx = writer.as_ref().ok_or(TransportError::NotConnected)?;
        tx.send(bytes).map_err(|_| TransportError::NotConnected)
    }
}

/// Cloneable handle for the local channel
#[derive(Clone)]
pub struct LocalHandle {
    shared: Arc<LocalShared>,
    request_timeout: Duration,
}

impl LocalHandle {
    pub fn is_connected(&self) -> bool {
        self.shared.writer.lock().is_some()
    }

    /// Fire-and-forget send; false while disconnected
    pub fn send(&self, message: Message) -> bool {
        let frame = LocalFrame {
            id: self.shared.next_id(),
            response: false,
            payload: message,
        };
        match self.shared.write(&frame) {
            Ok(()) => true,
            Err(e) => {
                debug!(event = %frame.payload.event, error = %e, "Local send failed");
                false
            }
        }
    }

    /// Send a request and wait for the frame answering its id
    pub async fn request(&self, message: Message) -> Result<Message, TransportError> {
        let id = self.shared.next_id();
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, tx);

        let frame = LocalFrame {
            id,
            response: false,
            payload: message,
        };
        if let Err(e) = self.shared.write(&frame) {
            self.shared.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::AckDropped),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(TransportError::AckTimeout)
            }
        }
    }
}

/// Connect loop for the local endpoint
pub struct LocalChannel {
    path: PathBuf,
    retry: Duration,
    shared: Arc<LocalShared>,
    request_timeout: Duration,
}

impl LocalChannel {
    pub fn new(path: impl AsRef<Path>, retry: Duration, request_timeout: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            retry,
            shared: Arc::new(LocalShared {
                writer: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU32::new(0),
            }),
            request_timeout,
        }
    }

    pub fn handle(&self) -> LocalHandle {
        LocalHandle {
            shared: self.shared.clone(),
            request_timeout: self.request_timeout,
        }
    }

    /// Connect, serve until EOF or error, retry after `retry`. Returns only on
    /// cancellation.
    pub async fn run(self, events: mpsc::UnboundedSender<TransportEvent>, cancel: CancellationToken) {
        loop {
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                connected = UnixStream::connect(&self.path) => connected,
            };

            match connected {
                Ok(stream) => {
                    info!(path = %self.path.display(), "Local channel connected");
                    self.serve(stream, &events, &cancel).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                    info!(path = %self.path.display(), "Local channel disconnected");
                }
                Err(e) => {
                    debug!(path = %self.path.display(), error = %e, "Local channel unavailable");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.retry) => {}
                    }
                }
            }
        }
    }

    async fn serve(
        &self,
        stream: UnixStream,
        events: &mpsc::UnboundedSender<TransportEvent>,
        cancel: &CancellationToken,
    ) {
        let (mut reader, mut writer_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        *self.shared.writer.lock() = Some(tx);
        let _ = events.send(TransportEvent::Connected(Origin::Local));

        let writer = tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = writer_half.write_all(&bytes).await {
                    debug!(error = %e, "Local write failed");
                    break;
                }
            }
            let _ = writer_half.shutdown().await;
        });

        loop {
            let body = tokio::select! {
                _ = cancel.cancelled() => break,
                body = read_frame(&mut reader) => body,
            };

            match body {
                Ok(Some(body)) => self.handle_frame(&body, events),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Local channel read failed");
                    break;
                }
            }
        }

        self.shared.writer.lock().take();
        self.shared.pending.lock().clear();
        let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
        let _ = events.send(TransportEvent::Disconnected(Origin::Local));
    }

    fn handle_frame(&self, body: &[u8], events: &mpsc::UnboundedSender<TransportEvent>) {
        let frame = match LocalFrame::decode(body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed local frame");
                return;
            }
        };

        if frame.response {
            match self.shared.pending.lock().remove(&frame.id) {
                Some(tx) => {
                    let _ = tx.send(frame.payload);
                }
                None => debug!(id = frame.id, "Local response for unknown request"),
            }
            return;
        }

        let id = frame.id;
        let request = frame.payload.clone();
        let shared = self.shared.clone();
        let responder = Responder::new(move |response| {
            let reply = LocalFrame {
                id,
                response: true,
                payload: request.reply(LOCAL_SRC, response),
            };
            shared.write(&reply).is_ok()
        });

        let inbound = Inbound::new(frame.payload, Origin::Local).with_reply(responder);
        let _ = events.send(TransportEvent::Message(inbound));
    }
}

/// Read one length-prefixed frame body; `None` when the peer closed cleanly
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>, TransportError> {
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_LOCAL_FRAME_LEN {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::UnixListener;

    fn socket_path() -> PathBuf {
        std::env::temp_dir().join(format!("ge-local-{}.sock", uuid::Uuid::new_v4()))
    }

    #[test]
    fn ids_wrap_instead_of_overflowing() {
        let channel = LocalChannel::new(socket_path(), Duration::from_secs(5), Duration::from_secs(1));
        channel.shared.next_id.store(u32::MAX, Ordering::Relaxed);
        assert_eq!(channel.shared.next_id(), u32::MAX);
        assert_eq!(channel.shared.next_id(), 0);
    }

    #[tokio::test]
    async fn read_frame_reports_clean_close() {
        let (mut client, server) = tokio::io::duplex(64);
        drop(server);
        assert!(read_frame(&mut client).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delivers_frames_and_writes_replies() {
        let path = socket_path();
        let listener = UnixListener::bind(&path).unwrap();
        let channel = LocalChannel::new(&path, Duration::from_millis(50), Duration::from_secs(1));
        let handle = channel.handle();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(channel.run(events_tx, cancel.clone()));

        let (mut peer, _) = listener.accept().await.unwrap();
        assert!(matches!(
            events_rx.recv().await,
            Some(TransportEvent::Connected(Origin::Local))
        ));
        assert!(handle.is_connected());

        let request = LocalFrame {
            id: 41,
            response: false,
            payload: Message::new("lights", "robot").with_src("ui"),
        };
        peer.write_all(&request.encode().unwrap()).await.unwrap();

        let Some(TransportEvent::Message(inbound)) = events_rx.recv().await else {
            panic!("expected a message");
        };
        assert_eq!(inbound.origin, Origin::Local);
        assert!(inbound.reply.unwrap().respond(json!({"ok": true})));

        let body = read_frame(&mut peer).await.unwrap().unwrap();
        let reply = LocalFrame::decode(&body).unwrap();
        assert_eq!(reply.id, 41);
        assert!(reply.response);
        assert_eq!(reply.payload.dst, "ui");
        assert_eq!(reply.payload.payload, json!({"ok": true}));

        drop(peer);
        assert!(matches!(
            events_rx.recv().await,
            Some(TransportEvent::Disconnected(Origin::Local))
        ));

        cancel.cancel();
        task.await.unwrap();
        let _ = std::fs::remove_file(&path);
    }
}
