//! Per-channel broadcast registry for in-process consumers.
//!
//! The bridge delivers into here; anything inside the process that
//! wants a channel's events subscribes. Slow subscribers lag and skip
//! (tokio broadcast semantics) rather than blocking the bridge.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{ChannelKey, StreamEnvelope};

/// Broadcast capacity per channel.
const CHANNEL_CAPACITY: usize = 1024;

/// Registry of live channels inside this process.
#[derive(Default)]
pub struct Fanout {
    channels: RwLock<HashMap<ChannelKey, broadcast::Sender<Arc<StreamEnvelope>>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a channel, creating it on first use.
    ///
    /// The receiver sees every envelope delivered from subscription
    /// onward; history replay is the reader's job, not the fan-out's.
    pub async fn subscribe(&self, channel: &ChannelKey) -> broadcast::Receiver<Arc<StreamEnvelope>> {
        let mut channels = self.channels.write().await;
        channels
            .entry(*channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Deliver an envelope to current subscribers.
    ///
    /// Returns how many subscribers received it. A channel whose last
    /// subscriber is gone gets dropped from the registry.
    pub async fn deliver(&self, channel: &ChannelKey, envelope: StreamEnvelope) -> usize {
        let sender = self.channels.read().await.get(channel).cloned();

        let Some(sender) = sender else {
            return 0;
        };

        match sender.send(Arc::new(envelope)) {
            Ok(count) => count,
            Err(_) => {
                // No receivers left. Re-check under the write lock: a
                // new subscriber may have arrived since the send.
                let mut channels = self.channels.write().await;
                if let Some(current) = channels.get(channel) {
                    if current.receiver_count() == 0 {
                        channels.remove(channel);
                        debug!(channel = %channel, "Dropped idle channel from fan-out");
                    }
                }
                0
            }
        }
    }

    /// Number of subscribers currently on a channel.
    pub async fn subscriber_count(&self, channel: &ChannelKey) -> usize {
        self.channels
            .read()
            .await
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of channels currently registered.
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}
