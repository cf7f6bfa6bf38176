//! Channel (part of C5): per-channel subscribe/unsubscribe state machine,
//! message routing, pause/buffer, and the operation queue that serializes
//! handshakes.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;
use strum::EnumDiscriminants;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::event_bus::EventBus;
use crate::protocol::{self, InboundFrame, PublishFrame, SubscribeFrame, UnsubscribeFrame};
use crate::transport::{SocketTransport, TransportEvent};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("failed to send frame: {0}")]
    Send(#[from] crate::transport::TransportError),
    #[error("server reported an error: {0}")]
    ServerError(String),
    #[error(transparent)]
    Parse(#[from] crate::protocol::ProtocolError),
}

/// A fully expanded consumer-facing message (one `IncomingDataMessage` with
/// N batched entries becomes N of these).
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub timestamp: i64,
    pub channel: String,
    pub event: Option<String>,
    pub data: Value,
    pub alias: Option<String>,
}

pub type MessageCallback = dyn Fn(&Message) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub event: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub event: Option<String>,
    pub alias: Option<String>,
}

#[derive(Clone, EnumDiscriminants)]
#[strum_discriminants(name(ChannelEventKind))]
#[strum_discriminants(derive(Hash))]
pub enum ChannelEvent {
    Subscribing,
    Subscribed { subscription_id: Option<String> },
    Unsubscribing,
    Unsubscribed { subscription_id: Option<String> },
    Paused { buffering: bool },
    Resumed { buffered_messages_delivered: usize },
    Failed { error: String, action: &'static str },
}

impl std::fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelEvent::Subscribing => write!(f, "Subscribing"),
            ChannelEvent::Subscribed { subscription_id } => {
                write!(f, "Subscribed {{ subscription_id: {subscription_id:?} }}")
            },
            ChannelEvent::Unsubscribing => write!(f, "Unsubscribing"),
            ChannelEvent::Unsubscribed { subscription_id } => {
                write!(f, "Unsubscribed {{ subscription_id: {subscription_id:?} }}")
            },
            ChannelEvent::Paused { buffering } => write!(f, "Paused {{ buffering: {buffering} }}"),
            ChannelEvent::Resumed {
                buffered_messages_delivered,
            } => write!(f, "Resumed {{ delivered: {buffered_messages_delivered} }}"),
            ChannelEvent::Failed { error, action } => write!(f, "Failed {{ error: {error}, action: {action} }}"),
        }
    }
}

impl crate::event_bus::Event for ChannelEvent {
    type Kind = ChannelEventKind;

    fn kind(&self) -> Self::Kind {
        self.into()
    }
}

struct Registered {
    id: CallbackId,
    callback: Arc<MessageCallback>,
}

enum PendingOp {
    Subscribe {
        event: Option<String>,
        callback: Option<Arc<MessageCallback>>,
        id: CallbackId,
    },
    Unsubscribe {
        event: Option<String>,
        id: Option<CallbackId>,
    },
}

struct ChannelState {
    subscribed: bool,
    pending_subscribe: bool,
    pending_unsubscribe: bool,
    subscription_id: Option<String>,
    catch_all: Option<Registered>,
    event_callbacks: HashMap<String, Vec<Registered>>,
    paused: bool,
    buffer_while_paused: bool,
    buffered: VecDeque<Message>,
    operation_queue: VecDeque<PendingOp>,
    message_handler_installed: bool,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            subscribed: false,
            pending_subscribe: false,
            pending_unsubscribe: false,
            subscription_id: None,
            catch_all: None,
            event_callbacks: HashMap::new(),
            paused: false,
            buffer_while_paused: true,
            buffered: VecDeque::new(),
            operation_queue: VecDeque::new(),
            message_handler_installed: false,
        }
    }

    fn has_callback(&self) -> bool {
        self.catch_all.is_some() || !self.event_callbacks.is_empty()
    }
}

/// A named topic: `Channel`s are owned by a [`crate::registry::ChannelRegistry`]
/// and share the connection's transport.
pub struct Channel {
    name: String,
    transport: Arc<dyn SocketTransport>,
    state: Mutex<ChannelState>,
    next_callback_id: AtomicU64,
    weak_self: Weak<Channel>,
    pub events: EventBus<ChannelEvent>,
}

impl Channel {
    pub fn new(name: impl Into<String>, transport: Arc<dyn SocketTransport>) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            name: name.into(),
            transport,
            state: Mutex::new(ChannelState::new()),
            next_callback_id: AtomicU64::new(1),
            weak_self: weak_self.clone(),
            events: EventBus::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn next_id(&self) -> CallbackId {
        CallbackId(self.next_callback_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn install_message_handler(&self, state: &mut ChannelState) {
        if state.message_handler_installed {
            return;
        }
        state.message_handler_installed = true;

        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        let mut inbound = self.transport.subscribe();
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(TransportEvent::Frame(text)) => this.handle_inbound_frame(&text).await,
                    Ok(_) => {},
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        });
    }

    async fn handle_inbound_frame(&self, raw: &str) {
        let frame = match InboundFrame::parse(raw) {
            Ok(frame) => frame,
            Err(err) => {
                self.events.emit(ChannelEvent::Failed {
                    error: err.to_string(),
                    action: "message_parsing",
                });
                return;
            },
        };

        match frame {
            InboundFrame::Subscribed(f) if f.channel == self.name => {
                let mut state = self.state.lock().await;
                state.subscribed = true;
                state.pending_subscribe = false;
                state.subscription_id = f.subscription_id.clone();
                drop(state);
                self.events.emit(ChannelEvent::Subscribed {
                    subscription_id: f.subscription_id,
                });
                self.drain_operation_queue().await;
            },
            InboundFrame::Unsubscribed(f) if f.channel == self.name => {
                let mut state = self.state.lock().await;
                state.subscribed = false;
                state.pending_subscribe = false;
                state.pending_unsubscribe = false;
                state.catch_all = None;
                state.event_callbacks.clear();
                drop(state);
                self.events.emit(ChannelEvent::Unsubscribed {
                    subscription_id: f.subscription_id,
                });
                self.drain_operation_queue().await;
            },
            InboundFrame::Message(f) if f.channel == self.name => {
                self.dispatch_incoming(f).await;
            },
            InboundFrame::Error(f) if f.channel.as_deref() == Some(self.name.as_str()) => {
                self.events.emit(ChannelEvent::Failed {
                    error: f.error.message,
                    action: "channel_operation",
                });
            },
            _ => {},
        }
    }

    async fn dispatch_incoming(&self, frame: protocol::IncomingDataMessage) {
        let mut state = self.state.lock().await;
        if !state.subscribed {
            return;
        }

        let batched = frame.messages.len() > 1;
        let messages: Vec<Message> = frame
            .messages
            .into_iter()
            .enumerate()
            .map(|(index, data_message)| Message {
                id: if batched {
                    format!("{}-{index}", frame.id)
                } else {
                    frame.id.clone()
                },
                timestamp: frame.timestamp,
                channel: frame.channel.clone(),
                event: data_message.event,
                data: data_message.data,
                alias: data_message.alias,
            })
            .collect();

        if state.paused {
            if state.buffer_while_paused {
                state.buffered.extend(messages);
            }
            return;
        }

        Self::dispatch_to_callbacks(&state, &messages);
    }

    fn dispatch_to_callbacks(state: &ChannelState, messages: &[Message]) {
        if !state.event_callbacks.is_empty() {
            for message in messages {
                let Some(event) = &message.event else {
                    continue;
                };
                if let Some(callbacks) = state.event_callbacks.get(event) {
                    for registered in callbacks {
                        (registered.callback)(message);
                    }
                }
            }
        } else if let Some(catch_all) = &state.catch_all {
            for message in messages {
                (catch_all.callback)(message);
            }
        }
    }

    /// Registers `callback` for the channel. `opts.event` filters delivery
    /// to messages whose `event` field matches; `None` installs a catch-all.
    pub async fn subscribe(
        &self,
        callback: impl Fn(&Message) + Send + Sync + 'static,
        opts: Option<SubscribeOptions>,
    ) -> Result<CallbackId, ChannelError> {
        let callback: Arc<MessageCallback> = Arc::new(callback);
        let event = opts.and_then(|o| o.event);
        let id = self.next_id();

        let mut state = self.state.lock().await;

        if !self.transport.is_connected() {
            state.pending_subscribe = true;
            return Err(ChannelError::NotConnected);
        }

        if let Some(event_name) = event {
            if state.pending_unsubscribe {
                state.operation_queue.push_back(PendingOp::Subscribe {
                    event: Some(event_name),
                    callback: Some(callback),
                    id,
                });
                return Ok(id);
            }
            if state.subscribed || state.pending_subscribe {
                state
                    .event_callbacks
                    .entry(event_name)
                    .or_default()
                    .push(Registered { id, callback });
                return Ok(id);
            }

            state.event_callbacks.entry(event_name).or_default().push(Registered { id, callback });
            self.send_subscribe(&mut state).await?;
            return Ok(id);
        }

        if state.pending_unsubscribe || state.pending_subscribe {
            state.operation_queue.push_back(PendingOp::Subscribe {
                event: None,
                callback: Some(callback),
                id,
            });
            return Ok(id);
        }

        if state.subscribed {
            state.catch_all = Some(Registered { id, callback });
            state.event_callbacks.clear();
            return Ok(id);
        }

        self.install_message_handler(&mut state).await;
        state.catch_all = Some(Registered {
            id,
            callback: callback.clone(),
        });
        state.event_callbacks.clear();
        self.send_subscribe(&mut state).await?;
        Ok(id)
    }

    async fn send_subscribe(&self, state: &mut ChannelState) -> Result<(), ChannelError> {
        self.install_message_handler(state).await;
        state.pending_subscribe = true;
        self.events.emit(ChannelEvent::Subscribing);
        let frame = SubscribeFrame::new(self.name.clone());
        let json = serde_json::to_string(&frame).expect("subscribe frame always serializes");
        self.transport.send(&json).await?;
        Ok(())
    }

    async fn send_unsubscribe(&self, state: &mut ChannelState) -> Result<(), ChannelError> {
        state.pending_unsubscribe = true;
        self.events.emit(ChannelEvent::Unsubscribing);
        let frame = UnsubscribeFrame::new(self.name.clone());
        let json = serde_json::to_string(&frame).expect("unsubscribe frame always serializes");
        self.transport.send(&json).await?;
        Ok(())
    }

    /// Removes `id` (or, for catch-all, the whole subscription) and issues a
    /// wire unsubscribe once no callbacks remain for the relevant scope.
    pub async fn unsubscribe(&self, id: Option<CallbackId>, opts: Option<SubscribeOptions>) -> Result<(), ChannelError> {
        let event = opts.and_then(|o| o.event);
        let mut state = self.state.lock().await;

        if let Some(event_name) = event {
            if state.subscribed && !state.pending_unsubscribe {
                if let Some(id) = id {
                    if let Some(list) = state.event_callbacks.get_mut(&event_name) {
                        list.retain(|registered| registered.id != id);
                        if list.is_empty() {
                            state.event_callbacks.remove(&event_name);
                        }
                    }
                } else {
                    state.event_callbacks.remove(&event_name);
                }

                if state.event_callbacks.is_empty() && state.catch_all.is_none() {
                    return self.send_unsubscribe(&mut state).await;
                }
                return Ok(());
            }

            state.operation_queue.push_back(PendingOp::Unsubscribe {
                event: Some(event_name),
                id,
            });
            return Ok(());
        }

        if !state.subscribed {
            return Ok(());
        }

        if !self.transport.is_connected() {
            state.subscribed = false;
            self.events.emit(ChannelEvent::Unsubscribed { subscription_id: None });
            return Ok(());
        }

        self.send_unsubscribe(&mut state).await
    }

    /// Drains at most one queued operation — executing it may set a pending
    /// flag again, which blocks further draining until the next handshake
    /// confirmation arrives.
    async fn drain_operation_queue(&self) {
        loop {
            let mut state = self.state.lock().await;
            if state.pending_subscribe || state.pending_unsubscribe {
                return;
            }
            let Some(op) = state.operation_queue.pop_front() else {
                return;
            };

            match op {
                PendingOp::Subscribe { event, callback, id } => {
                    if let Some(event_name) = event {
                        if let Some(callback) = callback {
                            state.event_callbacks.entry(event_name).or_default().push(Registered { id, callback });
                        }
                        if !state.subscribed && !state.pending_subscribe {
                            let _ = self.send_subscribe(&mut state).await;
                            return;
                        }
                    } else {
                        if let Some(callback) = callback {
                            state.catch_all = Some(Registered { id, callback });
                            state.event_callbacks.clear();
                        }
                        if !state.subscribed {
                            let _ = self.send_subscribe(&mut state).await;
                            return;
                        }
                    }
                },
                PendingOp::Unsubscribe { event, id } => {
                    if let Some(event_name) = event {
                        if let Some(id) = id {
                            if let Some(list) = state.event_callbacks.get_mut(&event_name) {
                                list.retain(|registered| registered.id != id);
                            }
                        } else {
                            state.event_callbacks.remove(&event_name);
                        }
                    } else {
                        state.catch_all = None;
                        state.event_callbacks.clear();
                        if state.subscribed {
                            let _ = self.send_unsubscribe(&mut state).await;
                            return;
                        }
                    }
                },
            }
        }
    }

    pub async fn publish(&self, data: Value, opts: Option<PublishOptions>) -> Result<(), ChannelError> {
        if !self.transport.is_connected() {
            self.events.emit(ChannelEvent::Failed {
                error: ChannelError::NotConnected.to_string(),
                action: "publish",
            });
            return Err(ChannelError::NotConnected);
        }

        let opts = opts.unwrap_or_default();
        let frame = PublishFrame::new(self.name.clone(), vec![protocol::DataMessage {
            data,
            event: opts.event,
            alias: opts.alias,
        }]);
        let json = serde_json::to_string(&frame).expect("publish frame always serializes");

        if let Err(err) = self.transport.send(&json).await {
            self.events.emit(ChannelEvent::Failed {
                error: err.to_string(),
                action: "publish",
            });
            return Err(err.into());
        }
        Ok(())
    }

    /// Re-issues SUBSCRIBE for every retained callback after a reconnect.
    /// A no-op if nothing is registered (nothing to retain across sessions).
    pub async fn resubscribe(&self) -> Result<(), ChannelError> {
        let mut state = self.state.lock().await;
        if !state.has_callback() {
            return Ok(());
        }
        state.pending_subscribe = false;
        state.pending_unsubscribe = false;
        state.subscribed = false;
        self.send_subscribe(&mut state).await
    }

    pub fn has_callback(&self) -> bool {
        // Synchronous best-effort read used by the registry at release time;
        // the registry always holds its own lock serializing callers.
        self.state.try_lock().map(|state| state.has_callback()).unwrap_or(true)
    }

    pub async fn pause(&self, buffer_messages: bool) {
        let mut state = self.state.lock().await;
        if state.paused {
            return;
        }
        state.paused = true;
        state.buffer_while_paused = buffer_messages;
        drop(state);
        self.events.emit(ChannelEvent::Paused { buffering: buffer_messages });
    }

    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        if !state.paused {
            return;
        }
        state.paused = false;
        let buffered: Vec<Message> = state.buffered.drain(..).collect();
        Self::dispatch_to_callbacks(&state, &buffered);
        let delivered = buffered.len();
        drop(state);
        self.events.emit(ChannelEvent::Resumed {
            buffered_messages_delivered: delivered,
        });
    }

    pub async fn clear_buffered_messages(&self) {
        self.state.lock().await.buffered.clear();
    }

    /// Sets `pending_subscribe` on every channel so the next reconnect
    /// triggers a fresh SUBSCRIBE round-trip (called by the registry on
    /// socket close).
    pub async fn mark_pending_subscribe(&self) {
        self.state.lock().await.pending_subscribe = true;
    }

    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        let was_subscribed = state.subscribed;
        *state = ChannelState::new();
        drop(state);

        if was_subscribed && self.transport.is_connected() {
            let frame = UnsubscribeFrame::new(self.name.clone());
            if let Ok(json) = serde_json::to_string(&frame) {
                let _ = self.transport.send(&json).await;
            }
        }
        self.events.remove_all_listeners(None);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use super::*;
    use crate::transport::fake::FakeTransport;

    fn counting_callback(counter: Arc<AtomicUsize>) -> impl Fn(&Message) + Send + Sync + 'static {
        move |_msg| {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    #[tokio::test]
    async fn subscribe_before_connect_returns_not_connected() {
        let transport = Arc::new(FakeTransport::new());
        let channel = Channel::new("news", transport);
        let err = channel.subscribe(|_| {}, None).await.unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected));
    }

    #[tokio::test]
    async fn subscribe_sends_wire_frame_once_connected() {
        let transport = Arc::new(FakeTransport::new());
        transport.connect("ws://x").await.unwrap();
        let channel = Channel::new("news", transport.clone());

        channel.subscribe(|_| {}, None).await.unwrap();
        let sent = transport.last_sent().expect("a frame was sent");
        assert!(sent.contains("\"action\":4"));
        assert!(sent.contains("\"channel\":\"news\""));
    }

    #[tokio::test]
    async fn subscribed_frame_flips_subscribed_flag_and_drains_queue() {
        let transport = Arc::new(FakeTransport::new());
        transport.connect("ws://x").await.unwrap();
        let channel = Channel::new("news", transport.clone());
        let count = Arc::new(AtomicUsize::new(0));

        channel.subscribe(counting_callback(count.clone()), None).await.unwrap();
        transport.push_frame(r#"{"action":5,"channel":"news","subscription_id":"sub-1"}"#);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        transport.push_frame(
            r#"{"action":9,"id":"m1","timestamp":1,"channel":"news","messages":[{"data":1}]}"#,
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn event_filtered_callback_only_sees_matching_event() {
        let transport = Arc::new(FakeTransport::new());
        transport.connect("ws://x").await.unwrap();
        let channel = Channel::new("news", transport.clone());
        let matching = Arc::new(AtomicUsize::new(0));
        let other = Arc::new(AtomicUsize::new(0));

        channel
            .subscribe(counting_callback(matching.clone()), Some(SubscribeOptions {
                event: Some("e".to_owned()),
            }))
            .await
            .unwrap();
        channel
            .subscribe(counting_callback(other.clone()), Some(SubscribeOptions {
                event: Some("other".to_owned()),
            }))
            .await
            .unwrap();

        transport.push_frame(r#"{"action":5,"channel":"news","subscription_id":"sub-1"}"#);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        transport.push_frame(
            r#"{"action":9,"id":"m1","timestamp":1,"channel":"news","messages":[{"data":1,"event":"e"}]}"#,
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(matching.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(other.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_without_connection_fails() {
        let transport = Arc::new(FakeTransport::new());
        let channel = Channel::new("news", transport);
        let err = channel.publish(Value::from(1), None).await.unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected));
    }

    #[tokio::test]
    async fn pause_buffers_and_resume_delivers_fifo() {
        let transport = Arc::new(FakeTransport::new());
        transport.connect("ws://x").await.unwrap();
        let channel = Channel::new("news", transport.clone());
        let count = Arc::new(AtomicUsize::new(0));

        channel.subscribe(counting_callback(count.clone()), None).await.unwrap();
        transport.push_frame(r#"{"action":5,"channel":"news","subscription_id":"sub-1"}"#);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        channel.pause(true).await;
        transport.push_frame(
            r#"{"action":9,"id":"m1","timestamp":1,"channel":"news","messages":[{"data":1},{"data":2}]}"#,
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);

        channel.resume().await;
        assert_eq!(count.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_frame_emits_failed_with_message_parsing_action() {
        let transport = Arc::new(FakeTransport::new());
        transport.connect("ws://x").await.unwrap();
        let channel = Channel::new("news", transport.clone());
        channel.subscribe(|_| {}, None).await.unwrap();

        let failures = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorded = failures.clone();
        channel.events.on(ChannelEventKind::Failed, move |event| {
            if let ChannelEvent::Failed { error: _, action } = event {
                recorded.lock().unwrap().push(*action);
            }
        });

        transport.push_frame("not json");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(failures.lock().unwrap().as_slice(), ["message_parsing"]);
    }

    #[tokio::test]
    async fn has_callback_reflects_registration_state() {
        let transport = Arc::new(FakeTransport::new());
        transport.connect("ws://x").await.unwrap();
        let channel = Channel::new("news", transport);
        assert!(!channel.has_callback());
        channel.subscribe(|_| {}, None).await.unwrap();
        assert!(channel.has_callback());
    }
}
