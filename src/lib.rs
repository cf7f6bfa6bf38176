//! Client-side core of the Pulse real-time publish/subscribe SDK.
//!
//! A consumer constructs a [`PulseClient`], which wires together an
//! [`auth::AuthModule`], a [`connection::Connection`], and a
//! [`registry::ChannelRegistry`]: auth obtains a token, connection opens an
//! authenticated socket, and the registry resubscribes channels that still
//! have callbacks whenever the socket reopens.

pub mod auth;
pub mod channel;
pub mod config;
pub mod credential;
pub mod error;
pub mod event_bus;
pub mod jwt;
pub mod protocol;
pub mod registry;
pub mod signing;
pub mod transport;

mod connection;

pub use auth::{AuthError, AuthEvent, AuthModule};
pub use channel::{Channel, ChannelError, ChannelEvent, Message};
pub use config::ClientOptions;
pub use connection::{Connection, ConnectionError, ConnectionEvent, ConnectionState};
pub use credential::Credential;
pub use error::Error;
pub use event_bus::{EventBus, ListenerId};
pub use registry::ChannelRegistry;
pub use transport::{SocketTransport, WebSocketTransport};

use std::sync::Arc;

/// The consumer-facing facade: owns one auth module, one connection, and one
/// channel registry, and wires the standard reactions between them (token
/// expiry reconnects, socket open triggers auto-resubscribe).
pub struct PulseClient {
    auth: Arc<AuthModule>,
    connection: Arc<Connection>,
    channels: Arc<ChannelRegistry>,
}

impl PulseClient {
    /// Builds the component graph from merged options but does not connect.
    /// Call [`PulseClient::connect`] explicitly, or rely on
    /// `options.connection.auto_connect`.
    pub async fn new(options: ClientOptions) -> Self {
        let auth = AuthModule::new(options.auth);
        let channels = Arc::new(ChannelRegistry::new());
        let connection = Connection::new(options.connection, auth.clone(), channels.clone());
        connection.wire_auth_reactions().await;

        let client = Self {
            auth,
            connection,
            channels,
        };

        if client.connection.auto_connect() {
            client.connection.connect().await.ok();
        }

        client
    }

    pub fn auth(&self) -> &Arc<AuthModule> {
        &self.auth
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.channels
    }

    /// Gets or creates the named channel, incrementing its reference count.
    pub async fn channel(&self, name: &str) -> Arc<Channel> {
        self.channels.get(name, self.connection.transport_handle()).await
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.connection.connect().await
    }

    pub async fn reset(&self) {
        self.connection.reset().await;
        self.auth.reset().await;
        self.channels.reset().await;
    }
}
