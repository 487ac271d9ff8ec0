//! Cursor reads over a live channel.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::warn;

use super::{entry_fields, ChannelKey, EntryId, Result, StreamEnvelope};

/// Entries from one blocking read window.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelBatch {
    pub envelopes: Vec<StreamEnvelope>,
    /// Last raw entry id seen on the wire, even when that entry failed
    /// to decode. Advancing to it keeps a poison entry from being read
    /// forever. `None` means the window timed out empty.
    pub next_cursor: Option<EntryId>,
}

/// Read access to a channel from an arbitrary cursor.
///
/// An empty batch is a timeout, not an end of stream; the channel ends
/// only at a terminal event.
#[async_trait]
pub trait ChannelReader: Send + Sync {
    /// Return entries strictly after `cursor`, blocking up to `block`
    /// when the channel is quiet.
    async fn read_from(
        &self,
        channel: &ChannelKey,
        cursor: &EntryId,
        block: Duration,
        count: u32,
    ) -> Result<ChannelBatch>;
}

/// Redis implementation over XREAD BLOCK.
///
/// Every caller gets an independent cursor; nothing here is shared or
/// acknowledged, which is what lets one channel serve any number of
/// concurrent resumable readers.
pub struct RedisChannelReader {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisChannelReader {
    pub fn new(conn: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
        }
    }
}

#[async_trait]
impl ChannelReader for RedisChannelReader {
    async fn read_from(
        &self,
        channel: &ChannelKey,
        cursor: &EntryId,
        block: Duration,
        count: u32,
    ) -> Result<ChannelBatch> {
        let key = channel.stream_key(&self.key_prefix);
        let options = StreamReadOptions::default()
            .block(block.as_millis() as usize)
            .count(count as usize);

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[&key], &[cursor.as_str()], &options)
            .await?;

        let mut batch = ChannelBatch::default();
        for stream in reply.keys {
            for entry in stream.ids {
                match StreamEnvelope::decode(&entry.id, &entry_fields(&entry)) {
                    Ok(envelope) => batch.envelopes.push(envelope),
                    Err(e) => {
                        warn!(key = %key, id = %entry.id, error = %e, "Skipping malformed stream entry");
                    }
                }
                batch.next_cursor = Some(EntryId(entry.id.clone()));
            }
        }

        Ok(batch)
    }
}
