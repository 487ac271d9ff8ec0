//! PostgreSQL LogStore implementation.
//!
//! Appends take a row-level lock on the session header (`SELECT ... FOR
//! UPDATE`), compute `max(sequence) + 1` under that lock, and insert, all in
//! one transaction. That makes the sequence gapless and collision-free without
//! a dedicated counter table.

use async_trait::async_trait;
use backon::BackoffBuilder;
use chrono::{DateTime, Utc};
use sea_query::{Expr, LockType, Order, PostgresQueryBuilder, Query};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::warn;
use uuid::Uuid;

use super::{enqueue_in, is_serialization_failure};
use crate::retry::RetryPolicy;
use crate::storage::schema::{self, LogEntries, Sessions};
use crate::storage::{
    EntryRole, EntryStatus, LogEntry, LogPage, LogStore, NewLogEntry, OutboxMessage, Result,
    Session, StorageError,
};

/// PostgreSQL implementation of [`LogStore`].
pub struct PostgresLogStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresLogStore {
    /// Create a new PostgreSQL log store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the conflict-retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Create tables if they do not exist.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(schema::CREATE_SESSIONS_TABLE)
            .execute(&self.pool)
            .await?;
        sqlx::raw_sql(schema::CREATE_LOG_ENTRIES_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Lock the session header, assign the next sequence, insert. Commits
    /// nothing; the caller owns the transaction.
    async fn append_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        entry: &NewLogEntry,
    ) -> Result<LogEntry> {
        // Serialize appends per session on the header row.
        let lock = Query::select()
            .column(Sessions::Id)
            .from(Sessions::Table)
            .and_where(Expr::col(Sessions::Id).eq(entry.session_id))
            .lock(LockType::Update)
            .to_string(PostgresQueryBuilder);

        let locked = sqlx::query(&lock).fetch_optional(&mut **tx).await?;
        if locked.is_none() {
            return Err(StorageError::SessionNotFound(entry.session_id));
        }

        let max_query = Query::select()
            .expr(Expr::col(LogEntries::Sequence).max())
            .from(LogEntries::Table)
            .and_where(Expr::col(LogEntries::SessionId).eq(entry.session_id))
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&max_query).fetch_one(&mut **tx).await?;
        let max_sequence: Option<i64> = row.get(0);
        let sequence = max_sequence.unwrap_or(0) + 1;

        let id = Uuid::new_v4();
        let insert = Query::insert()
            .into_table(LogEntries::Table)
            .columns([
                LogEntries::Id,
                LogEntries::SessionId,
                LogEntries::Sequence,
                LogEntries::Role,
                LogEntries::Payload,
                LogEntries::Status,
            ])
            .values_panic([
                id.into(),
                entry.session_id.into(),
                sequence.into(),
                entry.role.as_str().into(),
                entry.payload.clone().into(),
                entry.status.as_str().into(),
            ])
            .returning(Query::returning().column(LogEntries::CreatedAt))
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&insert).fetch_one(&mut **tx).await?;
        let created_at: DateTime<Utc> = row.get(0);

        Ok(LogEntry {
            id,
            session_id: entry.session_id,
            sequence,
            role: entry.role,
            payload: entry.payload.clone(),
            status: entry.status,
            created_at,
        })
    }

    /// Whether the attempt should sleep and rerun, per the retry policy.
    async fn conflict_pause(
        &self,
        backoff: &mut impl Iterator<Item = std::time::Duration>,
        session_id: Uuid,
        error: &sqlx::Error,
    ) -> bool {
        match backoff.next() {
            Some(delay) => {
                warn!(
                    session = %session_id,
                    delay_ms = %delay.as_millis(),
                    error = %error,
                    "Append conflicted, retrying transaction"
                );
                tokio::time::sleep(delay).await;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl LogStore for PostgresLogStore {
    async fn create_session(&self, owner_id: Uuid) -> Result<Session> {
        let id = Uuid::new_v4();
        let insert = Query::insert()
            .into_table(Sessions::Table)
            .columns([Sessions::Id, Sessions::OwnerId])
            .values_panic([id.into(), owner_id.into()])
            .returning(Query::returning().column(Sessions::CreatedAt))
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&insert).fetch_one(&self.pool).await?;
        let created_at: DateTime<Utc> = row.get(0);

        Ok(Session {
            id,
            owner_id,
            created_at,
        })
    }

    async fn append(&self, entry: NewLogEntry) -> Result<LogEntry> {
        let mut backoff = self.retry.backoff().build();

        loop {
            let attempt = async {
                let mut tx = self.pool.begin().await?;
                let log_entry = Self::append_in_tx(&mut tx, &entry).await?;
                tx.commit().await?;
                Ok(log_entry)
            }
            .await;

            match attempt {
                Err(StorageError::Database(e)) if is_serialization_failure(&e) => {
                    if !self.conflict_pause(&mut backoff, entry.session_id, &e).await {
                        return Err(StorageError::Database(e));
                    }
                }
                other => return other,
            }
        }
    }

    async fn append_with_outbox(
        &self,
        entry: NewLogEntry,
        message: OutboxMessage,
    ) -> Result<(LogEntry, i64)> {
        let mut backoff = self.retry.backoff().build();

        loop {
            let attempt = async {
                let mut tx = self.pool.begin().await?;
                let log_entry = Self::append_in_tx(&mut tx, &entry).await?;
                let record_id = enqueue_in(&mut tx, &message).await?;
                tx.commit().await?;
                Ok((log_entry, record_id))
            }
            .await;

            match attempt {
                Err(StorageError::Database(e)) if is_serialization_failure(&e) => {
                    if !self.conflict_pause(&mut backoff, entry.session_id, &e).await {
                        return Err(StorageError::Database(e));
                    }
                }
                other => return other,
            }
        }
    }

    async fn list(&self, session_id: Uuid, page: LogPage) -> Result<Vec<LogEntry>> {
        // Statement builders hold `Rc`s; drop before awaiting to keep the
        // future `Send`.
        let query = {
            let mut select = Query::select();
            select
                .columns([
                    LogEntries::Id,
                    LogEntries::SessionId,
                    LogEntries::Sequence,
                    LogEntries::Role,
                    LogEntries::Payload,
                    LogEntries::Status,
                    LogEntries::CreatedAt,
                ])
                .from(LogEntries::Table)
                .and_where(Expr::col(LogEntries::SessionId).eq(session_id));

            if let Some(before) = page.before_sequence {
                select.and_where(Expr::col(LogEntries::Sequence).lt(before));
            }

            // Newest page, flipped ascending below.
            select
                .order_by(LogEntries::Sequence, Order::Desc)
                .limit(page.limit as u64)
                .to_string(PostgresQueryBuilder)
        };

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(entry_from_row(&row)?);
        }
        entries.reverse();

        Ok(entries)
    }

    async fn purge_session(&self, id: Uuid) -> Result<bool> {
        let delete = Query::delete()
            .from_table(Sessions::Table)
            .and_where(Expr::col(Sessions::Id).eq(id))
            .to_string(PostgresQueryBuilder);

        let result = sqlx::query(&delete).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<LogEntry> {
    let role: String = row.get("role");
    let status: String = row.get("status");

    Ok(LogEntry {
        id: row.get("id"),
        session_id: row.get("session_id"),
        sequence: row.get("sequence"),
        role: EntryRole::parse(&role)?,
        payload: row.get("payload"),
        status: EntryStatus::parse(&status)?,
        created_at: row.get("created_at"),
    })
}
