//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building.

use sea_query::Iden;

/// Sessions table schema (the append lock target).
#[derive(Iden)]
pub enum Sessions {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "owner_id"]
    OwnerId,
    #[iden = "created_at"]
    CreatedAt,
}

/// Log entries table schema.
#[derive(Iden)]
pub enum LogEntries {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "session_id"]
    SessionId,
    #[iden = "sequence"]
    Sequence,
    #[iden = "role"]
    Role,
    #[iden = "payload"]
    Payload,
    #[iden = "status"]
    Status,
    #[iden = "created_at"]
    CreatedAt,
}

/// Outbox table schema.
#[derive(Iden)]
pub enum Outbox {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "topic"]
    Topic,
    #[iden = "key"]
    Key,
    #[iden = "payload"]
    Payload,
    #[iden = "idempotency_key"]
    IdempotencyKey,
    #[iden = "correlation_id"]
    CorrelationId,
    #[iden = "status"]
    Status,
    #[iden = "retry_count"]
    RetryCount,
    #[iden = "next_attempt_at"]
    NextAttemptAt,
    #[iden = "last_attempt_at"]
    LastAttemptAt,
    #[iden = "last_error"]
    LastError,
    #[iden = "published_at"]
    PublishedAt,
    #[iden = "created_at"]
    CreatedAt,
}

/// SQL for creating the sessions table.
pub const CREATE_SESSIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id UUID PRIMARY KEY,
    owner_id UUID NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// SQL for creating the log entries table.
pub const CREATE_LOG_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS log_entries (
    id UUID PRIMARY KEY,
    session_id UUID NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    sequence BIGINT NOT NULL,
    role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
    payload JSONB NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('done', 'error')),
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (session_id, sequence)
);
"#;

/// SQL for creating the outbox table.
///
/// Retry policy ceilings must stay at or below the schema bound on
/// `retry_count`.
pub const CREATE_OUTBOX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox (
    id BIGSERIAL PRIMARY KEY,
    topic TEXT NOT NULL,
    key TEXT NOT NULL,
    payload JSONB NOT NULL,
    idempotency_key TEXT,
    correlation_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'publishing', 'published', 'failed', 'dead_lettered', 'canceled')),
    retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count BETWEEN 0 AND 100),
    next_attempt_at TIMESTAMPTZ,
    last_attempt_at TIMESTAMPTZ,
    last_error TEXT,
    published_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_outbox_idempotency_key
    ON outbox(idempotency_key) WHERE idempotency_key IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_outbox_due
    ON outbox(status, next_attempt_at, id) WHERE status IN ('pending', 'publishing');
"#;
