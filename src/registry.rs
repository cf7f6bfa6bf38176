//! Channel registry (C5): create-or-reuse channels by name, ref-count them,
//! and fan out resubscribe/reset across the whole set on reconnect.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;

use crate::channel::Channel;
use crate::transport::SocketTransport;

struct Entry {
    channel: Arc<Channel>,
    ref_count: usize,
}

/// Owns every live [`Channel`] for a connection. Channels are looked up by
/// name; the same channel instance is shared by every caller that asks for
/// it, mirroring how a single connection multiplexes many subscribers over
/// one socket.
pub struct ChannelRegistry {
    channels: Mutex<HashMap<String, Entry>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the channel named `name`, creating it against `transport` if
    /// this is the first caller, and incrementing its reference count.
    pub async fn get(&self, name: &str, transport: Arc<dyn SocketTransport>) -> Arc<Channel> {
        let mut channels = self.channels.lock().await;
        if let Some(entry) = channels.get_mut(name) {
            entry.ref_count += 1;
            return entry.channel.clone();
        }

        let channel = Channel::new(name, transport);
        channels.insert(name.to_owned(), Entry {
            channel: channel.clone(),
            ref_count: 1,
        });
        channel
    }

    /// Decrements `name`'s reference count. Once it reaches zero the channel
    /// is dropped from the registry unless it still carries a live callback
    /// (e.g. a catch-all registered directly rather than through `get`), in
    /// which case it is kept around at zero refs instead of torn down.
    pub async fn release(&self, name: &str) {
        let mut channels = self.channels.lock().await;
        let Some(entry) = channels.get_mut(name) else {
            return;
        };
        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return;
        }
        if entry.channel.has_callback() {
            return;
        }
        let channel = entry.channel.clone();
        channels.remove(name);
        drop(channels);
        channel.reset().await;
    }

    /// Unconditionally removes and resets `name`, regardless of ref count.
    pub async fn remove(&self, name: &str) {
        let removed = self.channels.lock().await.remove(name);
        if let Some(entry) = removed {
            entry.channel.reset().await;
        }
    }

    pub async fn get_existing(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels.lock().await.get(name).map(|entry| entry.channel.clone())
    }

    /// Marks every channel as needing a fresh SUBSCRIBE once the socket is
    /// back (called right after the connection observes a close).
    pub async fn pending_subscribe_all_channels(&self) {
        let channels: Vec<Arc<Channel>> = self.channels.lock().await.values().map(|entry| entry.channel.clone()).collect();
        for channel in channels {
            channel.mark_pending_subscribe().await;
        }
    }

    /// Resubscribes every channel with a live callback after a reconnect.
    /// A single channel's failure is logged and does not stop the rest —
    /// the caller already transitioned to `connected` and should not roll
    /// that back because one topic's handshake failed.
    pub async fn resubscribe_all_channels(&self) {
        let channels: Vec<Arc<Channel>> = self.channels.lock().await.values().map(|entry| entry.channel.clone()).collect();
        for channel in channels {
            if let Err(err) = channel.resubscribe().await {
                warn!(target: "pulse::channel", channel = channel.name(), error = %err, "resubscribe failed");
            }
        }
    }

    /// Tears down and clears every channel, used when the connection itself
    /// is reset.
    pub async fn reset(&self) {
        let channels: Vec<Arc<Channel>> = self.channels.lock().await.drain().map(|(_, entry)| entry.channel).collect();
        for channel in channels {
            channel.reset().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;

    #[tokio::test]
    async fn get_creates_and_reuses_the_same_channel() {
        let registry = ChannelRegistry::new();
        let transport = Arc::new(FakeTransport::new());
        let a = registry.get("news", transport.clone()).await;
        let b = registry.get("news", transport.clone()).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn release_drops_channel_without_callbacks() {
        let registry = ChannelRegistry::new();
        let transport = Arc::new(FakeTransport::new());
        registry.get("news", transport).await;
        registry.release("news").await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn release_keeps_channel_with_live_callback() {
        let registry = ChannelRegistry::new();
        let transport = Arc::new(FakeTransport::new());
        transport.connect("ws://x").await.unwrap();
        let channel = registry.get("news", transport).await;
        channel.subscribe(|_| {}, None).await.unwrap();

        registry.release("news").await;
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn remove_tears_down_regardless_of_ref_count() {
        let registry = ChannelRegistry::new();
        let transport = Arc::new(FakeTransport::new());
        registry.get("news", transport.clone()).await;
        registry.get("news", transport).await;
        registry.remove("news").await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn reset_clears_every_channel() {
        let registry = ChannelRegistry::new();
        let transport = Arc::new(FakeTransport::new());
        registry.get("a", transport.clone()).await;
        registry.get("b", transport).await;
        registry.reset().await;
        assert!(registry.is_empty().await);
    }
}
