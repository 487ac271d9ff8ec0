//! Channel producer over XADD.
//!
//! Retention is capped per channel with `MAXLEN ~`, so the stream is a
//! bounded replay buffer, not durable history. The durable record is
//! the session log; a consumer that falls off the retention window
//! resyncs from there.

use redis::aio::ConnectionManager;
use redis::streams::StreamMaxlen;
use redis::AsyncCommands;
use tracing::debug;

use super::{ChannelKey, EntryId, Result, StreamEvent, FIELD_DATA, FIELD_EVENT, FIELD_SEQ, FIELD_TS};
use crate::config::{RedisConfig, StreamConfig};

/// Appends events to channel streams.
pub struct StreamWriter {
    conn: ConnectionManager,
    key_prefix: String,
    maxlen: u64,
    ttl_after_terminal_secs: u64,
}

impl StreamWriter {
    pub fn new(conn: ConnectionManager, redis: &RedisConfig, stream: &StreamConfig) -> Self {
        Self {
            conn,
            key_prefix: redis.key_prefix.clone(),
            maxlen: stream.maxlen,
            ttl_after_terminal_secs: stream.ttl_after_terminal_secs,
        }
    }

    /// Append one event and return its assigned entry id.
    ///
    /// `seq` is the log sequence hint for events that mirror a log
    /// entry; pure stream events (heartbeats, lifecycle) pass `None`.
    /// A terminal event arms the channel's expiry so abandoned keys do
    /// not accumulate.
    #[tracing::instrument(name = "stream.publish", skip_all, fields(channel = %channel, kind = event.kind()))]
    pub async fn publish(
        &self,
        channel: &ChannelKey,
        event: &StreamEvent,
        seq: Option<i64>,
    ) -> Result<EntryId> {
        let key = channel.stream_key(&self.key_prefix);
        let (kind, data) = event.wire_parts();
        let ts = chrono::Utc::now().timestamp_millis();

        let mut items: Vec<(&str, String)> = vec![(FIELD_EVENT, kind.to_string())];
        if let Some(data) = data {
            items.push((FIELD_DATA, data));
        }
        if let Some(seq) = seq {
            items.push((FIELD_SEQ, seq.to_string()));
        }
        items.push((FIELD_TS, ts.to_string()));

        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd_maxlen(&key, StreamMaxlen::Approx(self.maxlen as usize), "*", &items)
            .await?;

        if event.is_terminal() && self.ttl_after_terminal_secs > 0 {
            let _: () = conn.expire(&key, self.ttl_after_terminal_secs as i64).await?;
            debug!(
                key = %key,
                ttl_secs = self.ttl_after_terminal_secs,
                "Channel terminal, expiry armed"
            );
        }

        debug!(
            key = %key,
            id = %id,
            kind = kind,
            seq = ?seq,
            "Appended stream event"
        );

        Ok(EntryId(id))
    }
}
