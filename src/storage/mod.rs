//! Durable storage: the per-session ordered log and the transactional outbox.
//!
//! The log is append-only and strictly ordered per session; the outbox stages
//! integration events in the same transaction as the log write so a broker
//! publication can never be observed without its durable cause (and vice
//! versa, never lost once the transaction commits).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::PostgresConfig;
use crate::retry::RetryPolicy;

pub mod mock;
pub mod postgres;
pub mod schema;

pub use postgres::{PostgresLogStore, PostgresOutboxStore};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Outbox record not found: {0}")]
    RecordNotFound(i64),

    #[error("Invalid {kind} value: {value}")]
    InvalidValue { kind: &'static str, value: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

// ============================================================================
// Log types
// ============================================================================

/// Author of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryRole {
    User,
    Assistant,
    System,
}

impl EntryRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(StorageError::InvalidValue {
                kind: "role",
                value: other.to_string(),
            }),
        }
    }
}

/// Completion state of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Done,
    Error,
}

impl EntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            other => Err(StorageError::InvalidValue {
                kind: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// A session header row; the row-level lock target for appends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// An immutable, sequenced log entry.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub session_id: Uuid,
    /// 1-based, strictly increasing per session, gapless.
    pub sequence: i64,
    pub role: EntryRole,
    pub payload: serde_json::Value,
    pub status: EntryStatus,
    pub created_at: DateTime<Utc>,
}

/// Input for an append; id, sequence, and timestamp are store-assigned.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub session_id: Uuid,
    pub role: EntryRole,
    pub payload: serde_json::Value,
    pub status: EntryStatus,
}

/// Keyset pagination window over a session's log.
///
/// `before_sequence` is exclusive; the newest `limit` entries strictly below
/// it come back in ascending sequence order. Absent cursor reads from the end.
#[derive(Debug, Clone, Copy)]
pub struct LogPage {
    pub limit: u32,
    pub before_sequence: Option<i64>,
}

impl Default for LogPage {
    fn default() -> Self {
        Self {
            limit: 50,
            before_sequence: None,
        }
    }
}

// ============================================================================
// Outbox types
// ============================================================================

/// Outbox record lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Publishing,
    Published,
    /// Terminal: the payload can never publish (validation failure).
    Failed,
    /// Terminal: the retry ceiling was exhausted.
    DeadLettered,
    Canceled,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Publishing => "publishing",
            Self::Published => "published",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "publishing" => Ok(Self::Publishing),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            "dead_lettered" => Ok(Self::DeadLettered),
            "canceled" => Ok(Self::Canceled),
            other => Err(StorageError::InvalidValue {
                kind: "outbox status",
                value: other.to_string(),
            }),
        }
    }
}

/// Input for an outbox enqueue.
#[derive(Debug, Clone)]
pub struct OutboxMessage {
    pub topic: String,
    pub key: String,
    pub payload: serde_json::Value,
    /// Collapses duplicate enqueues when present.
    pub idempotency_key: Option<String>,
    /// Propagated into broker headers; generated at enqueue when absent.
    pub correlation_id: Option<String>,
}

impl OutboxMessage {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
            idempotency_key: None,
            correlation_id: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// A staged integration event.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    /// Monotonic surrogate key; FIFO ordering within a topic.
    pub id: i64,
    pub topic: String,
    pub key: String,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub correlation_id: String,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Traits
// ============================================================================

/// Interface for the durable per-session log.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Create a session header owned by `owner_id`.
    async fn create_session(&self, owner_id: Uuid) -> Result<Session>;

    /// Append one entry; the store assigns `max(sequence) + 1` under the
    /// session's row lock. Appending to an unknown session is an error.
    async fn append(&self, entry: NewLogEntry) -> Result<LogEntry>;

    /// Append an entry and enqueue an outbox message in one transaction;
    /// both become visible together or not at all.
    async fn append_with_outbox(
        &self,
        entry: NewLogEntry,
        message: OutboxMessage,
    ) -> Result<(LogEntry, i64)>;

    /// Keyset-paginated read; see [`LogPage`]. An unknown session reads as
    /// empty.
    async fn list(&self, session_id: Uuid, page: LogPage) -> Result<Vec<LogEntry>>;

    /// Delete a session; its entries go with it (cascade). Returns whether a
    /// session was deleted.
    async fn purge_session(&self, id: Uuid) -> Result<bool>;
}

/// Publisher/operator interface for the outbox.
///
/// Enqueueing is deliberately absent here: it only happens inside a caller's
/// transaction, via [`LogStore::append_with_outbox`] or
/// [`postgres::enqueue_in`].
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically claim up to `limit` due pending records (oldest first),
    /// flipping them `pending -> publishing`. Racing claimants get disjoint
    /// sets.
    async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<OutboxRecord>>;

    /// `publishing -> published`.
    async fn mark_published(&self, id: i64) -> Result<()>;

    /// `publishing -> pending` with an incremented retry count and a due
    /// time in the future.
    async fn retry_later(&self, id: i64, error: &str, next_attempt_at: DateTime<Utc>)
        -> Result<()>;

    /// `publishing -> failed`; for payloads that can never publish.
    async fn mark_failed(&self, id: i64, error: &str) -> Result<()>;

    /// `publishing -> dead_lettered`; retry ceiling exhausted.
    async fn mark_dead_lettered(&self, id: i64, error: &str) -> Result<()>;

    /// Return records stuck in `publishing` since before `older_than` to
    /// `pending` (crash recovery). Returns how many rows moved.
    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Operator surface: `failed` and `dead_lettered` records, most-retried
    /// first.
    async fn dead_letters(&self, limit: u32) -> Result<Vec<OutboxRecord>>;

    /// Manual replay of a `failed`/`dead_lettered` record; resets the retry
    /// count. Returns whether a record moved.
    async fn requeue(&self, id: i64) -> Result<bool>;

    /// Cancel a still-pending record. Returns whether a record moved.
    async fn cancel(&self, id: i64) -> Result<bool>;
}

/// Initialize Postgres-backed stores, creating tables as needed.
pub async fn init_storage(
    config: &PostgresConfig,
    retry: RetryPolicy,
) -> Result<(Arc<dyn LogStore>, Arc<dyn OutboxStore>)> {
    info!(
        max_connections = config.max_connections,
        "Storage: postgres"
    );

    let pool = postgres::connect(config).await?;

    let log_store = Arc::new(PostgresLogStore::new(pool.clone()).with_retry(retry));
    log_store.init().await?;

    let outbox_store = Arc::new(PostgresOutboxStore::new(pool));
    outbox_store.init().await?;

    Ok((log_store, outbox_store))
}
