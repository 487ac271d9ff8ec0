//! Live event streaming over Redis Streams.
//!
//! This module contains:
//! - `StreamEvent`: the closed event union carried on channels
//! - `ChannelKey` / `EntryId`: channel addressing and resume cursors
//! - `writer`: XADD producer with capped retention
//! - `reader`: cursor reads for resumable consumers
//! - `bridge`: consumer-group poller feeding the local fan-out
//! - `fanout`: per-channel broadcast registry

use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

pub mod bridge;
pub mod fanout;
pub mod mock;
pub mod reader;
pub mod writer;

pub use bridge::{spawn_bridge, BridgeHandle, GroupSource, RedisGroupSource, StreamBridge};
pub use fanout::Fanout;
pub use reader::{ChannelBatch, ChannelReader, RedisChannelReader};
pub use writer::StreamWriter;

/// Wire field holding the event kind.
pub const FIELD_EVENT: &str = "event";
/// Wire field holding the event body as compact JSON.
pub const FIELD_DATA: &str = "data";
/// Wire field holding the producer's log sequence hint.
pub const FIELD_SEQ: &str = "seq";
/// Wire field holding the producer wall clock, epoch milliseconds.
pub const FIELD_TS: &str = "ts";

/// Result type for stream operations.
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors that can occur on the live channel.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Malformed stream entry {id}: {reason}")]
    Malformed { id: String, reason: String },

    #[error("Redis error: {0}")]
    Backend(#[from] redis::RedisError),
}

/// Open a managed Redis connection; reconnects happen internally.
pub async fn connect(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url)?;
    let conn = ConnectionManager::new(client).await?;

    info!(url = %url, "Connected to Redis");

    Ok(conn)
}

// ============================================================================
// Events
// ============================================================================

/// A retrieval attribution attached to a generated answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Job lifecycle phases announced on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Queued,
    Started,
    Canceled,
}

/// Events carried on a live channel.
///
/// The union is closed: an entry with an unknown kind fails decoding
/// instead of passing through, so every consumer handles every variant.
/// `Done` and `Error` are terminal; nothing meaningful follows them on
/// a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// One increment of generated text.
    Token { index: u64, text: String },
    /// Retrieval attributions for the answer under construction.
    Sources { documents: Vec<SourceRef> },
    /// Token accounting, usually right before `Done`.
    Usage {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
    },
    /// Terminal: generation finished.
    Done { finish_reason: String },
    /// Terminal: generation failed.
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
    /// Liveness signal; carries no payload.
    Heartbeat,
    /// Job lifecycle transition.
    Lifecycle { phase: LifecyclePhase },
}

impl StreamEvent {
    /// Wire name of this event's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Token { .. } => "token",
            StreamEvent::Sources { .. } => "sources",
            StreamEvent::Usage { .. } => "usage",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Heartbeat => "heartbeat",
            StreamEvent::Lifecycle { .. } => "lifecycle",
        }
    }

    /// Whether this event ends its channel.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }

    /// Split into the `event` and `data` wire fields. Variants without
    /// a payload carry no data field.
    pub fn wire_parts(&self) -> (&'static str, Option<String>) {
        let data = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(mut map)) => {
                map.remove(FIELD_DATA).map(|body| body.to_string())
            }
            _ => None,
        };
        (self.kind(), data)
    }

    /// Decode from the `event` and `data` wire fields.
    pub fn decode(id: &str, kind: &str, data: Option<&str>) -> Result<Self> {
        let body = match data {
            Some(raw) if !raw.is_empty() => {
                Some(
                    serde_json::from_str::<serde_json::Value>(raw).map_err(|e| {
                        StreamError::Malformed {
                            id: id.to_string(),
                            reason: format!("bad data json: {}", e),
                        }
                    })?,
                )
            }
            _ => None,
        };

        let mut wrapped = serde_json::Map::new();
        wrapped.insert(
            FIELD_EVENT.to_string(),
            serde_json::Value::String(kind.to_string()),
        );
        if let Some(body) = body {
            wrapped.insert(FIELD_DATA.to_string(), body);
        }

        serde_json::from_value(serde_json::Value::Object(wrapped)).map_err(|e| {
            StreamError::Malformed {
                id: id.to_string(),
                reason: format!("unknown or invalid event: {}", e),
            }
        })
    }
}

// ============================================================================
// Addressing
// ============================================================================

/// Addresses one job's live channel, scoped to its owner.
///
/// The owner is part of the key, so a caller holding the wrong user id
/// reads an empty stream rather than someone else's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub job_id: Uuid,
    pub user_id: Uuid,
}

impl ChannelKey {
    pub fn new(job_id: Uuid, user_id: Uuid) -> Self {
        Self { job_id, user_id }
    }

    /// Redis key of this channel's stream.
    pub fn stream_key(&self, prefix: &str) -> String {
        format!("{}:{}:{}:events", prefix, self.job_id, self.user_id)
    }
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.job_id, self.user_id)
    }
}

/// A stream entry id (`millis-seq`), used as a resume cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryId(pub String);

impl EntryId {
    /// Cursor positioned before the first entry of a channel.
    pub fn start() -> Self {
        Self("0-0".to_string())
    }

    /// Parse a client-supplied cursor. Anything that is not the
    /// `millis-seq` form is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let (millis, seq) = raw.split_once('-')?;
        if millis.is_empty() || seq.is_empty() {
            return None;
        }
        if !millis.bytes().all(|b| b.is_ascii_digit()) || !seq.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Envelopes
// ============================================================================

/// A decoded channel entry: the event plus its stream position.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEnvelope {
    /// Entry id; doubles as the SSE frame id and resume cursor.
    pub id: EntryId,
    pub event: StreamEvent,
    /// Producer's log sequence hint, when the event maps to a log entry.
    pub seq: Option<i64>,
    /// Producer wall clock, epoch milliseconds.
    pub ts: Option<i64>,
}

impl StreamEnvelope {
    /// Decode an entry from its raw wire fields. Unknown fields are
    /// ignored so producers can add fields without breaking readers.
    pub fn decode(id: &str, fields: &[(String, String)]) -> Result<Self> {
        let mut kind = None;
        let mut data = None;
        let mut seq = None;
        let mut ts = None;

        for (name, value) in fields {
            match name.as_str() {
                FIELD_EVENT => kind = Some(value.as_str()),
                FIELD_DATA => data = Some(value.as_str()),
                FIELD_SEQ => seq = value.parse().ok(),
                FIELD_TS => ts = value.parse().ok(),
                _ => {}
            }
        }

        let kind = kind.ok_or_else(|| StreamError::Malformed {
            id: id.to_string(),
            reason: "missing event field".to_string(),
        })?;
        let event = StreamEvent::decode(id, kind, data)?;

        Ok(Self {
            id: EntryId(id.to_string()),
            event,
            seq,
            ts,
        })
    }
}

/// Flatten a raw Redis entry map into field pairs for decoding.
pub(crate) fn entry_fields(entry: &redis::streams::StreamId) -> Vec<(String, String)> {
    entry
        .map
        .iter()
        .map(|(name, value)| {
            let value: String = redis::from_redis_value(value).unwrap_or_default();
            (name.clone(), value)
        })
        .collect()
}
