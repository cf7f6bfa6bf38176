//! Socket transport (C3): a thin wrapper over a bidirectional text socket.
//!
//! `SocketTransport` is the seam the connection and channel modules depend
//! on instead of a concrete WebSocket type, so either can stay
//! transport-agnostic. Tests substitute a fake in-process implementation
//! instead of opening a real socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::SinkExt;
use futures::stream::StreamExt;
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tokio_tungstenite::tungstenite::Message as WsMessage;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("socket is not connected")]
    NotConnected,
    #[error("failed to establish websocket connection: {0}")]
    Connect(String),
    #[error("failed to send frame: {0}")]
    Send(String),
    #[error(transparent)]
    Lagged(#[from] broadcast::error::RecvError),
}

/// Events a transport publishes to every [`SocketTransport::subscribe`]r.
/// Frames are handed over as raw text; decoding into [`crate::protocol`]
/// types is the connection/channel layer's job.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    Frame(String),
    Close {
        code: u16,
        reason: String,
        was_clean: bool,
    },
    Error(String),
    /// A server-initiated ping frame was observed at the protocol level.
    /// Optional: implementations that cannot observe these simply never
    /// emit this variant, and heartbeat tracking still works without it.
    ServerPing,
}

#[async_trait]
pub trait SocketTransport: Send + Sync {
    /// Opens a new socket at `url`, closing and discarding any prior one.
    async fn connect(&self, url: &str) -> Result<(), TransportError>;

    /// Closes the socket if it is open or opening; a no-op otherwise.
    async fn disconnect(&self);

    /// `true` iff a socket exists and is in the OPEN state.
    fn is_connected(&self) -> bool;

    /// Sends one text frame. Fails with [`TransportError::NotConnected`]
    /// unless the socket is OPEN.
    async fn send(&self, frame: &str) -> Result<(), TransportError>;

    /// Subscribes to this transport's event stream. Each call yields an
    /// independent receiver so the connection module and every channel can
    /// attach their own listener.
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
}

type WsWrite = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

struct ActiveSocket {
    write: Mutex<WsWrite>,
    reader_task: tokio::task::JoinHandle<()>,
}

/// Production [`SocketTransport`] over `tokio-tungstenite`. A single
/// background task owns the read half and forwards frames to every
/// subscriber via a `broadcast` channel.
pub struct WebSocketTransport {
    active: Mutex<Option<ActiveSocket>>,
    connected: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            active: Mutex::new(None),
            connected: AtomicBool::new(false),
            events,
        }
    }
}

#[async_trait]
impl SocketTransport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        self.disconnect().await;

        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (write, mut read) = stream.split();

        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Open);

        let events = self.events.clone();
        let connected_flag = Arc::new(AtomicBool::new(true));
        let reader_flag = connected_flag.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => {
                        let _ = events.send(TransportEvent::Frame(text.to_string()));
                    },
                    Ok(WsMessage::Ping(_)) => {
                        let _ = events.send(TransportEvent::ServerPing);
                    },
                    Ok(WsMessage::Close(frame)) => {
                        reader_flag.store(false, Ordering::SeqCst);
                        let (code, reason) = frame
                            .map(|f| (f.code.into(), f.reason.to_string()))
                            .unwrap_or((1000, String::new()));
                        let _ = events.send(TransportEvent::Close {
                            code,
                            reason,
                            was_clean: true,
                        });
                        break;
                    },
                    Ok(_) => {},
                    Err(err) => {
                        let _ = events.send(TransportEvent::Error(err.to_string()));
                    },
                }
            }
            reader_flag.store(false, Ordering::SeqCst);
        });

        *self.active.lock().await = Some(ActiveSocket {
            write: Mutex::new(write),
            reader_task,
        });

        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(active) = self.active.lock().await.take() {
            active.reader_task.abort();
            let mut write = active.write.lock().await;
            let _ = write.close().await;
            drop(write);
            self.connected.store(false, Ordering::SeqCst);
            let _ = self.events.send(TransportEvent::Close {
                code: 1000,
                reason: String::new(),
                was_clean: true,
            });
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, frame: &str) -> Result<(), TransportError> {
        let guard = self.active.lock().await;
        let active = guard.as_ref().ok_or(TransportError::NotConnected)?;
        let mut write = active.write.lock().await;
        write
            .send(WsMessage::text(frame.to_owned()))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}


#[cfg(test)]
mod tests {
    use super::fake::FakeTransport;
    use super::*;

    #[tokio::test]
    async fn fake_transport_rejects_send_before_connect() {
        let transport = FakeTransport::new();
        let err = transport.send("hello").await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }

    #[tokio::test]
    async fn fake_transport_records_sent_frames_once_connected() {
        let transport = FakeTransport::new();
        transport.connect("ws://example").await.unwrap();
        transport.send("hello").await.unwrap();
        assert_eq!(transport.last_sent().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn subscribers_observe_pushed_frames() {
        let transport = FakeTransport::new();
        let mut rx = transport.subscribe();
        transport.connect("ws://example").await.unwrap();
        transport.push_frame("{\"action\":9}");

        let open = rx.recv().await.unwrap();
        assert!(matches!(open, TransportEvent::Open));
        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, TransportEvent::Frame(text) if text == "{\"action\":9}"));
    }
}
