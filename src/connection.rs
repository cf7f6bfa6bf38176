//! Connection (C4): owns the socket lifecycle — authenticate, open, track
//! server pings, reconnect with backoff, and fan resubscribe out to the
//! channel registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use strum::EnumDiscriminants;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, oneshot};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, AuthEvent, AuthModule};
use crate::config::ConnectionOptions;
use crate::event_bus::EventBus;
use crate::protocol::{self, InboundFrame, PingFrame};
use crate::registry::ChannelRegistry;
use crate::transport::{SocketTransport, TransportError, TransportEvent, WebSocketTransport};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),
    #[error("timed out waiting for the server to acknowledge the connection")]
    ConnectTimeout,
    #[error("timed out waiting for a pong")]
    PingTimeout,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection reset")]
    ConnectionReset,
    #[error("exhausted reconnect attempts")]
    MaxReconnectAttemptsExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    Failed,
}

#[derive(Debug, Clone, EnumDiscriminants)]
#[strum_discriminants(name(ConnectionEventKind))]
#[strum_discriminants(derive(Hash))]
pub enum ConnectionEvent {
    StateChanged { from: ConnectionState, to: ConnectionState },
    Connected { connection_id: String },
    Disconnected { code: u16, reason: String },
    Reconnecting { attempt: u32, delay_ms: u64 },
    Failed { error: String, context: &'static str },
    Pong { rtt: Duration },
}

impl crate::event_bus::Event for ConnectionEvent {
    type Kind = ConnectionEventKind;

    fn kind(&self) -> Self::Kind {
        self.into()
    }
}

/// What a pending ping's future resolves to: a measured round trip, or the
/// reason the connection gave up waiting for the pong.
enum PingOutcome {
    Resolved(Duration),
    Closed,
    Reset,
}

struct PendingPing {
    sent_at: Instant,
    responder: oneshot::Sender<PingOutcome>,
}

struct ConnectionInner {
    state: ConnectionState,
    connection_id: Option<String>,
    pending_pings: HashMap<u64, PendingPing>,
}

/// Drives one logical connection. A single background task owns the
/// transport's event stream and reacts to every inbound frame; public
/// methods only touch state behind the shared mutex and issue outbound
/// frames, the same split the auth module uses between its retry loop and
/// its state.
pub struct Connection {
    options: ConnectionOptions,
    auth: Arc<AuthModule>,
    channels: Arc<ChannelRegistry>,
    transport: Arc<dyn SocketTransport>,
    inner: Mutex<ConnectionInner>,
    reconnect_attempts: AtomicU32,
    next_ping_id: AtomicU64,
    abort: Mutex<CancellationToken>,
    /// The task currently reading the transport's event stream on this
    /// connection's behalf. Replaced (and the old one aborted) on every
    /// `connect()` so reconnects never leave a stale listener double-handling
    /// frames alongside the new one.
    frame_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    /// Notified every time a server ping is observed; the heartbeat watcher
    /// task waits on this and treats a timeout as a dead socket.
    heartbeat_notify: Notify,
    /// Lazily spawned on the first observed `ServerPing`, so connections
    /// whose transport never surfaces one never pay for an idle watcher.
    heartbeat_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    is_intentional_close: std::sync::atomic::AtomicBool,
    is_resetting: std::sync::atomic::AtomicBool,
    weak_self: Weak<Connection>,
    pub events: EventBus<ConnectionEvent>,
}

impl Connection {
    pub fn new(options: ConnectionOptions, auth: Arc<AuthModule>, channels: Arc<ChannelRegistry>) -> Arc<Self> {
        Self::with_transport(options, auth, channels, Arc::new(WebSocketTransport::new()))
    }

    /// Same as [`Connection::new`] but with the transport injected, so tests
    /// can drive the connection's state machine over an in-process
    /// [`crate::transport::fake::FakeTransport`] instead of a real socket.
    pub fn with_transport(
        options: ConnectionOptions,
        auth: Arc<AuthModule>,
        channels: Arc<ChannelRegistry>,
        transport: Arc<dyn SocketTransport>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            options,
            auth,
            channels,
            transport,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Closed,
                connection_id: None,
                pending_pings: HashMap::new(),
            }),
            reconnect_attempts: AtomicU32::new(0),
            next_ping_id: AtomicU64::new(1),
            abort: Mutex::new(CancellationToken::new()),
            frame_task: Mutex::new(None),
            heartbeat_notify: Notify::new(),
            heartbeat_task: Mutex::new(None),
            is_intentional_close: std::sync::atomic::AtomicBool::new(false),
            is_resetting: std::sync::atomic::AtomicBool::new(false),
            weak_self: weak_self.clone(),
            events: EventBus::new(),
        })
    }

    pub fn transport_handle(&self) -> Arc<dyn SocketTransport> {
        self.transport.clone()
    }

    pub fn auto_connect(&self) -> bool {
        self.options.auto_connect
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    async fn set_state(&self, next: ConnectionState) {
        let mut inner = self.inner.lock().await;
        if inner.state == next {
            return;
        }
        let prev = inner.state;
        inner.state = next;
        drop(inner);
        self.events.emit(ConnectionEvent::StateChanged { from: prev, to: next });
    }

    fn build_url(&self) -> String {
        let scheme = if self.options.is_secure { "wss" } else { "ws" };
        match self.options.ws_port {
            Some(port) => format!("{scheme}://{}:{port}/v1", self.options.ws_host),
            None => format!("{scheme}://{}/v1", self.options.ws_host),
        }
    }

    /// Subscribes to the auth module's event bus and wires the standard
    /// reactions: an expired token triggers a reconnect (to re-present
    /// fresh credentials in the handshake), a hard auth failure gives up.
    pub async fn wire_auth_reactions(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let mut events = {
            // EventBus::on is filed per event kind; route every kind of
            // interest through one channel so the async reaction can run
            // outside the synchronous callback.
            use crate::auth::AuthEventKind;
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            for kind in [
                AuthEventKind::TokenUpdated,
                AuthEventKind::TokenExpired,
                AuthEventKind::TokenError,
                AuthEventKind::AuthError,
            ] {
                let tx = tx.clone();
                self.auth.events.on(kind, move |event: &AuthEvent| {
                    let _ = tx.send(event.clone());
                });
            }
            rx
        };
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    AuthEvent::TokenExpired => {
                        info!(target: "pulse::connection", "auth token expired, reconnecting");
                        let _ = this.reconnect().await;
                    },
                    AuthEvent::TokenError { message } | AuthEvent::AuthError { message } => {
                        warn!(target: "pulse::connection", error = %message, "auth failed, giving up");
                        this.set_state(ConnectionState::Failed).await;
                        this.events.emit(ConnectionEvent::Failed {
                            error: message,
                            context: "authentication",
                        });
                        this.disconnect().await;
                    },
                    AuthEvent::TokenUpdated { .. } => {},
                }
            }
        });
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        if self.is_resetting.load(Ordering::SeqCst) {
            return Ok(());
        }

        {
            let state = self.inner.lock().await.state;
            if state == ConnectionState::Connected || state == ConnectionState::Connecting {
                return Err(ConnectionError::AlreadyConnected);
            }
        }

        self.is_intentional_close.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Connecting).await;

        if self.auth.options().auto_authenticate {
            self.auth.authenticate().await?;
        }

        let url = self.auth.get_authenticate_url(&self.build_url()).await?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.install_frame_handler(ack_tx).await;

        self.transport.connect(&url).await?;

        match tokio::time::timeout(Duration::from_millis(self.options.connect_timeout_ms), ack_rx).await {
            Ok(Ok(connection_id)) => {
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.inner.lock().await.connection_id = Some(connection_id.clone());
                self.set_state(ConnectionState::Connected).await;
                self.events.emit(ConnectionEvent::Connected { connection_id });
                if self.options.auto_resubscribe {
                    self.channels.resubscribe_all_channels().await;
                }
                Ok(())
            },
            Ok(Err(_)) => Err(ConnectionError::Transport(TransportError::NotConnected)),
            Err(_) => {
                self.set_state(ConnectionState::Failed).await;
                Err(ConnectionError::ConnectTimeout)
            },
        }
    }

    /// Spawns the single task that owns the transport's event stream for
    /// this socket's lifetime. `ack_tx` fires once with the server's
    /// `connection_id` on the first CONNECTED frame.
    async fn install_frame_handler(&self, ack_tx: oneshot::Sender<String>) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let mut inbound = self.transport.subscribe();
        let mut ack_tx = Some(ack_tx);
        let handle = tokio::spawn(async move {
            loop {
                let event = match inbound.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                match event {
                    TransportEvent::Frame(text) => {
                        this.handle_inbound_frame(&text, &mut ack_tx).await;
                    },
                    TransportEvent::Close { code, reason, .. } => {
                        this.handle_close(code, reason).await;
                        break;
                    },
                    TransportEvent::Error(message) => {
                        warn!(target: "pulse::connection", %message, "transport error");
                        if this.options.auto_resubscribe {
                            this.channels.pending_subscribe_all_channels().await;
                        }
                        this.events.emit(ConnectionEvent::Failed {
                            error: message,
                            context: "websocket",
                        });
                    },
                    TransportEvent::ServerPing => {
                        this.note_server_ping().await;
                    },
                    TransportEvent::Open => {},
                }
            }
        });

        if let Some(previous) = self.frame_task.lock().await.replace(handle) {
            previous.abort();
        }
    }

    async fn handle_inbound_frame(&self, raw: &str, ack_tx: &mut Option<oneshot::Sender<String>>) {
        let frame = match InboundFrame::parse(raw) {
            Ok(frame) => frame,
            Err(err) => {
                debug!(target: "pulse::connection", %err, "dropping malformed frame");
                self.events.emit(ConnectionEvent::Failed {
                    error: err.to_string(),
                    context: "message_processing",
                });
                return;
            },
        };

        match frame {
            InboundFrame::Connected(connected) => {
                if let Some(tx) = ack_tx.take() {
                    let _ = tx.send(connected.connection_id);
                }
            },
            InboundFrame::Disconnected(_) => {
                self.handle_close(1000, "server requested disconnect".to_owned()).await;
            },
            InboundFrame::Pong(pong) => {
                self.resolve_pong(pong.timestamp).await;
            },
            InboundFrame::Error(error) => {
                warn!(target: "pulse::connection", message = %error.error.message, "server error frame");
            },
            InboundFrame::Subscribed(_) | InboundFrame::Unsubscribed(_) | InboundFrame::Message(_) => {
                // Channel-scoped frames are also observed by each `Channel`'s
                // own subscriber; the connection only cares about the
                // handshake/heartbeat frames above.
            },
        }
    }

    async fn resolve_pong(&self, ping_id: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(pending) = inner.pending_pings.remove(&ping_id) {
            let rtt = pending.sent_at.elapsed();
            drop(inner);
            let _ = pending.responder.send(PingOutcome::Resolved(rtt));
            self.events.emit(ConnectionEvent::Pong { rtt });
        }
    }

    /// Rejects every pending ping with `outcome` and clears the map — used
    /// by `disconnect()` and `reset()`, which give pending pings a precise
    /// reason rather than letting them time out.
    async fn reject_pending_pings(&self, outcome: impl Fn() -> PingOutcome) {
        let mut inner = self.inner.lock().await;
        for (_, pending) in inner.pending_pings.drain() {
            let _ = pending.responder.send(outcome());
        }
    }

    /// Records a server-initiated ping. The first one lazily spawns the
    /// heartbeat watcher; every one after that just wakes it so its timeout
    /// window slides forward.
    async fn note_server_ping(&self) {
        let mut task = self.heartbeat_task.lock().await;
        if task.is_none() {
            let Some(this) = self.weak_self.upgrade() else {
                return;
            };
            *task = Some(tokio::spawn(async move {
                this.run_heartbeat_watcher().await;
            }));
        } else {
            self.heartbeat_notify.notify_one();
        }
    }

    /// Waits for `heartbeat_timeout_ms` between server pings; if none
    /// arrives in time, the socket is presumed dead. Disconnects the raw
    /// transport directly (not [`Connection::disconnect`]) so the existing
    /// `handle_close` reaction treats this like any other unexpected close
    /// and reconnects if configured to.
    async fn run_heartbeat_watcher(&self) {
        loop {
            let timeout = Duration::from_millis(self.options.heartbeat_timeout_ms());
            if tokio::time::timeout(timeout, self.heartbeat_notify.notified()).await.is_err() {
                warn!(target: "pulse::connection", "no server ping within heartbeat timeout, treating socket as dead");
                self.transport.disconnect().await;
                return;
            }
        }
    }

    /// Sends an application-level ping and resolves once the matching pong
    /// arrives, or errors out after `ping_timeout_ms`.
    pub async fn ping(&self) -> Result<Duration, ConnectionError> {
        if !self.transport.is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let ping_id = self.next_ping_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            inner.pending_pings.insert(ping_id, PendingPing {
                sent_at: Instant::now(),
                responder: tx,
            });
        }

        let frame = PingFrame::new(ping_id);
        let json = serde_json::to_string(&frame).expect("ping frame always serializes");
        self.transport.send(&json).await?;

        match tokio::time::timeout(Duration::from_millis(self.options.app_ping_timeout_ms()), rx).await {
            Ok(Ok(PingOutcome::Resolved(rtt))) => Ok(rtt),
            Ok(Ok(PingOutcome::Closed)) => Err(ConnectionError::ConnectionClosed),
            Ok(Ok(PingOutcome::Reset)) => Err(ConnectionError::ConnectionReset),
            Ok(Err(_)) | Err(_) => {
                self.inner.lock().await.pending_pings.remove(&ping_id);
                Err(ConnectionError::PingTimeout)
            },
        }
    }

    async fn handle_close(&self, code: u16, reason: String) {
        let was_connected = {
            let mut inner = self.inner.lock().await;
            let was = inner.state == ConnectionState::Connected;
            inner.connection_id = None;
            was
        };
        self.reject_pending_pings(|| PingOutcome::Closed).await;
        if let Some(task) = self.heartbeat_task.lock().await.take() {
            task.abort();
        }

        if was_connected {
            self.events.emit(ConnectionEvent::Disconnected { code, reason });
        }

        if self.options.auto_resubscribe {
            self.channels.pending_subscribe_all_channels().await;
        }

        let intentional = self.is_intentional_close.swap(false, Ordering::SeqCst);
        let should_reconnect = !intentional && self.options.auto_reconnect && !self.abort.lock().await.is_cancelled();
        if should_reconnect {
            self.set_state(ConnectionState::Reconnecting).await;
            self.spawn_reconnect_loop();
        } else {
            self.set_state(ConnectionState::Closed).await;
        }
    }

    fn spawn_reconnect_loop(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let _ = this.reconnect().await;
        });
    }

    /// Runs the exponential-backoff reconnect loop: `delay = min(initial *
    /// multiplier^attempt, max)`, capped at `max_reconnect_attempts`.
    async fn reconnect(&self) -> Result<(), ConnectionError> {
        loop {
            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.options.max_reconnect_attempts {
                self.set_state(ConnectionState::Failed).await;
                self.events.emit(ConnectionEvent::Failed {
                    error: ConnectionError::MaxReconnectAttemptsExceeded.to_string(),
                    context: "reconnection",
                });
                return Err(ConnectionError::MaxReconnectAttemptsExceeded);
            }

            let delay_ms = ((self.options.initial_reconnect_delay_ms as f64)
                * self.options.reconnect_backoff_multiplier.powi(attempt as i32 - 1))
            .min(self.options.max_reconnect_delay_ms as f64) as u64;

            self.events.emit(ConnectionEvent::Reconnecting { attempt, delay_ms });
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;

            if self.abort.lock().await.is_cancelled() {
                return Ok(());
            }

            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(target: "pulse::connection", %err, attempt, "reconnect attempt failed");
                    continue;
                },
            }
        }
    }

    pub async fn disconnect(&self) {
        self.is_intentional_close.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnecting).await;
        self.reject_pending_pings(|| PingOutcome::Closed).await;
        self.transport.disconnect().await;
        self.set_state(ConnectionState::Closed).await;
    }

    pub async fn reset(&self) {
        self.is_resetting.store(true, Ordering::SeqCst);
        self.is_intentional_close.store(true, Ordering::SeqCst);
        let old_abort = {
            let mut abort = self.abort.lock().await;
            let old = abort.clone();
            *abort = CancellationToken::new();
            old
        };
        old_abort.cancel();

        self.reject_pending_pings(|| PingOutcome::Reset).await;
        self.transport.disconnect().await;
        if let Some(task) = self.frame_task.lock().await.take() {
            task.abort();
        }
        if let Some(task) = self.heartbeat_task.lock().await.take() {
            task.abort();
        }
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        {
            let mut inner = self.inner.lock().await;
            inner.state = ConnectionState::Closed;
            inner.connection_id = None;
        }
        self.events.remove_all_listeners(None);
        self.is_intentional_close.store(false, Ordering::SeqCst);
        self.is_resetting.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthOptions;
    use crate::transport::fake::FakeTransport;

    fn connection_options() -> ConnectionOptions {
        ConnectionOptions {
            ws_host: "example.test".to_owned(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn build_url_uses_ws_scheme_when_not_secure() {
        let auth = AuthModule::new(AuthOptions::default());
        let channels = Arc::new(ChannelRegistry::new());
        let connection = Connection::new(connection_options(), auth, channels);
        assert_eq!(connection.build_url(), "ws://example.test/v1");
    }

    #[tokio::test]
    async fn build_url_uses_wss_and_port_when_configured() {
        let auth = AuthModule::new(AuthOptions::default());
        let channels = Arc::new(ChannelRegistry::new());
        let mut options = connection_options();
        options.is_secure = true;
        options.ws_port = Some(8443);
        let connection = Connection::new(options, auth, channels);
        assert_eq!(connection.build_url(), "wss://example.test:8443/v1");
    }

    #[tokio::test]
    async fn reconnect_backoff_respects_max_delay() {
        let auth = AuthModule::new(AuthOptions::default());
        let channels = Arc::new(ChannelRegistry::new());
        let mut options = connection_options();
        options.initial_reconnect_delay_ms = 1000;
        options.reconnect_backoff_multiplier = 2.0;
        options.max_reconnect_delay_ms = 3000;
        let connection = Connection::new(options, auth, channels);

        let delay_for = |attempt: u32| {
            ((connection.options.initial_reconnect_delay_ms as f64)
                * connection.options.reconnect_backoff_multiplier.powi(attempt as i32 - 1))
            .min(connection.options.max_reconnect_delay_ms as f64) as u64
        };
        assert_eq!(delay_for(1), 1000);
        assert_eq!(delay_for(2), 2000);
        assert_eq!(delay_for(3), 3000);
        assert_eq!(delay_for(4), 3000);
    }

    #[tokio::test]
    async fn disconnect_transitions_to_closed() {
        let auth = AuthModule::new(AuthOptions::default());
        let channels = Arc::new(ChannelRegistry::new());
        let connection = Connection::new(connection_options(), auth, channels);
        connection.disconnect().await;
        assert_eq!(connection.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn connect_is_a_no_op_while_resetting() {
        let auth = AuthModule::new(AuthOptions::default());
        let channels = Arc::new(ChannelRegistry::new());
        let connection = Connection::new(connection_options(), auth, channels);
        connection.is_resetting.store(true, Ordering::SeqCst);

        connection.connect().await.unwrap();
        assert_eq!(connection.state().await, ConnectionState::Closed);
    }

    fn api_key_auth() -> Arc<AuthModule> {
        AuthModule::new(AuthOptions {
            api_key: Some("id:sec".to_owned()),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn connect_resolves_once_connected_frame_arrives() {
        let channels = Arc::new(ChannelRegistry::new());
        let transport = Arc::new(FakeTransport::new());
        let connection = Connection::with_transport(connection_options(), api_key_auth(), channels, transport.clone());

        let connecting = connection.clone();
        let connect = tokio::spawn(async move { connecting.connect().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.push_frame(
            r#"{"action":1,"connection_id":"conn-1","connection_details":{"alias":null,"client_id":null,"server_id":null}}"#,
        );

        connect.await.unwrap().unwrap();
        assert_eq!(connection.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn ping_resolves_with_rtt_once_pong_arrives() {
        let channels = Arc::new(ChannelRegistry::new());
        let transport = Arc::new(FakeTransport::new());
        let connection = Connection::with_transport(connection_options(), api_key_auth(), channels, transport.clone());

        let connecting = connection.clone();
        let connect = tokio::spawn(async move { connecting.connect().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.push_frame(
            r#"{"action":1,"connection_id":"conn-1","connection_details":{"alias":null,"client_id":null,"server_id":null}}"#,
        );
        connect.await.unwrap().unwrap();

        let pinging = connection.clone();
        let ping = tokio::spawn(async move { pinging.ping().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let sent = transport.last_sent().expect("ping frame was sent");
        let sent: serde_json::Value = serde_json::from_str(&sent).unwrap();
        let timestamp = sent["timestamp"].as_u64().expect("ping frame carries a timestamp");
        transport.push_frame(format!(r#"{{"action":13,"timestamp":{timestamp}}}"#));

        ping.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn disconnect_rejects_a_pending_ping_as_connection_closed() {
        let channels = Arc::new(ChannelRegistry::new());
        let transport = Arc::new(FakeTransport::new());
        let connection = Connection::with_transport(connection_options(), api_key_auth(), channels, transport.clone());

        let connecting = connection.clone();
        let connect = tokio::spawn(async move { connecting.connect().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.push_frame(
            r#"{"action":1,"connection_id":"conn-1","connection_details":{"alias":null,"client_id":null,"server_id":null}}"#,
        );
        connect.await.unwrap().unwrap();

        let pinging = connection.clone();
        let ping = tokio::spawn(async move { pinging.ping().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        connection.disconnect().await;
        let err = ping.await.unwrap().unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectionClosed));
    }

    #[tokio::test]
    async fn transport_error_marks_channels_pending_and_emits_failed_with_websocket_context() {
        let channels = Arc::new(ChannelRegistry::new());
        let transport = Arc::new(FakeTransport::new());
        let connection = Connection::with_transport(connection_options(), api_key_auth(), channels, transport.clone());

        let connecting = connection.clone();
        let connect = tokio::spawn(async move { connecting.connect().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.push_frame(
            r#"{"action":1,"connection_id":"conn-1","connection_details":{"alias":null,"client_id":null,"server_id":null}}"#,
        );
        connect.await.unwrap().unwrap();

        let failures = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = failures.clone();
        connection.events.on(ConnectionEventKind::Failed, move |event| {
            if let ConnectionEvent::Failed { error, context } = event {
                recorded.lock().unwrap().push((error.clone(), *context));
            }
        });

        transport.push_error("boom");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let recorded = failures.lock().unwrap();
        assert_eq!(recorded.as_slice(), [("boom".to_owned(), "websocket")]);
    }

    #[tokio::test]
    async fn malformed_frame_emits_failed_with_message_processing_context() {
        let channels = Arc::new(ChannelRegistry::new());
        let transport = Arc::new(FakeTransport::new());
        let connection = Connection::with_transport(connection_options(), api_key_auth(), channels, transport.clone());

        let connecting = connection.clone();
        let connect = tokio::spawn(async move { connecting.connect().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.push_frame(
            r#"{"action":1,"connection_id":"conn-1","connection_details":{"alias":null,"client_id":null,"server_id":null}}"#,
        );
        connect.await.unwrap().unwrap();

        let failures = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = failures.clone();
        connection.events.on(ConnectionEventKind::Failed, move |event| {
            if let ConnectionEvent::Failed { error: _, context } = event {
                recorded.lock().unwrap().push(*context);
            }
        });

        transport.push_frame("not json");
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(failures.lock().unwrap().as_slice(), ["message_processing"]);
    }

    #[tokio::test]
    async fn heartbeat_timeout_disconnects_after_a_missed_server_ping() {
        let channels = Arc::new(ChannelRegistry::new());
        let transport = Arc::new(FakeTransport::new());
        let mut options = connection_options();
        options.auto_reconnect = false;
        options.ping_timeout_ms = Some(30);
        let connection = Connection::with_transport(options, api_key_auth(), channels, transport.clone());

        let connecting = connection.clone();
        let connect = tokio::spawn(async move { connecting.connect().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.push_frame(
            r#"{"action":1,"connection_id":"conn-1","connection_details":{"alias":null,"client_id":null,"server_id":null}}"#,
        );
        connect.await.unwrap().unwrap();

        transport.push_server_ping();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(!transport.is_connected());
        assert_eq!(connection.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn unexpected_close_without_auto_reconnect_settles_at_closed() {
        let channels = Arc::new(ChannelRegistry::new());
        let transport = Arc::new(FakeTransport::new());
        let mut options = connection_options();
        options.auto_reconnect = false;
        let connection = Connection::with_transport(options, api_key_auth(), channels, transport.clone());

        let connecting = connection.clone();
        let connect = tokio::spawn(async move { connecting.connect().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        transport.push_frame(
            r#"{"action":1,"connection_id":"conn-1","connection_details":{"alias":null,"client_id":null,"server_id":null}}"#,
        );
        connect.await.unwrap().unwrap();

        transport.push_close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connection.state().await, ConnectionState::Closed);
    }
}
