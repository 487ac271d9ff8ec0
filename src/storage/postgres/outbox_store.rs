//! PostgreSQL outbox implementation.
//!
//! Claims are atomic: `claim_due` flips `pending -> publishing` through an
//! `UPDATE ... WHERE id IN (SELECT ... FOR UPDATE SKIP LOCKED)` so racing
//! publisher instances always take disjoint rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{
    Asterisk, Cond, Expr, LockBehavior, LockType, Order, PostgresQueryBuilder, Query,
};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::storage::schema::{self, Outbox};
use crate::storage::{OutboxMessage, OutboxRecord, OutboxStatus, OutboxStore, Result};

/// Most recent failure messages are clipped to this length before storage.
const LAST_ERROR_MAX_LEN: usize = 512;

// Enqueue runs against the caller's transaction and must stay a plain
// parameterized statement: the partial unique index on idempotency_key needs
// an inference clause with a predicate, which the query builder cannot
// express.
const ENQUEUE_SQL: &str = r#"
INSERT INTO outbox (topic, key, payload, idempotency_key, correlation_id)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (idempotency_key) WHERE idempotency_key IS NOT NULL DO NOTHING
RETURNING id
"#;

const SELECT_BY_IDEMPOTENCY_SQL: &str = r#"
SELECT id FROM outbox WHERE idempotency_key = $1
"#;

/// Stage an integration event inside the caller's transaction.
///
/// The record becomes visible to the publisher only when that transaction
/// commits, and is discarded with it on rollback. Duplicate idempotency keys
/// collapse onto the existing record, whose id is returned.
pub async fn enqueue_in(conn: &mut PgConnection, message: &OutboxMessage) -> Result<i64> {
    let correlation_id = message
        .correlation_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    match message.idempotency_key.as_deref() {
        None => {
            let row = sqlx::query(ENQUEUE_SQL)
                .bind(&message.topic)
                .bind(&message.key)
                .bind(&message.payload)
                .bind(Option::<&str>::None)
                .bind(&correlation_id)
                .fetch_one(&mut *conn)
                .await?;
            Ok(row.get(0))
        }
        Some(idempotency_key) => {
            let inserted = sqlx::query(ENQUEUE_SQL)
                .bind(&message.topic)
                .bind(&message.key)
                .bind(&message.payload)
                .bind(idempotency_key)
                .bind(&correlation_id)
                .fetch_optional(&mut *conn)
                .await?;

            match inserted {
                Some(row) => Ok(row.get(0)),
                None => {
                    // Collapsed; hand back the existing record's id.
                    let row = sqlx::query(SELECT_BY_IDEMPOTENCY_SQL)
                        .bind(idempotency_key)
                        .fetch_one(&mut *conn)
                        .await?;
                    Ok(row.get(0))
                }
            }
        }
    }
}

/// PostgreSQL implementation of [`OutboxStore`].
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create a new PostgreSQL outbox store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the outbox table and indexes if they do not exist.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(schema::CREATE_OUTBOX_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Apply a status transition guarded on the current status.
    async fn transition(
        &self,
        id: i64,
        from: &[OutboxStatus],
        apply: impl FnOnce(&mut sea_query::UpdateStatement),
    ) -> Result<bool> {
        // Statement builders hold `Rc`s; drop before awaiting to keep the
        // future `Send`.
        let query = {
            let mut update = Query::update();
            update.table(Outbox::Table).cond_where(
                Cond::all()
                    .add(Expr::col(Outbox::Id).eq(id))
                    .add(Expr::col(Outbox::Status).is_in(from.iter().map(|s| s.as_str()))),
            );
            apply(&mut update);
            update.to_string(PostgresQueryBuilder)
        };

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<OutboxRecord>> {
        let due = Query::select()
            .column(Outbox::Id)
            .from(Outbox::Table)
            .cond_where(
                Cond::all()
                    .add(Expr::col(Outbox::Status).eq(OutboxStatus::Pending.as_str()))
                    .add(
                        Cond::any()
                            .add(Expr::col(Outbox::NextAttemptAt).is_null())
                            .add(Expr::col(Outbox::NextAttemptAt).lte(now)),
                    ),
            )
            .order_by(Outbox::Id, Order::Asc)
            .limit(limit as u64)
            .lock_with_behavior(LockType::Update, LockBehavior::SkipLocked)
            .to_owned();

        let claim = Query::update()
            .table(Outbox::Table)
            .value(Outbox::Status, OutboxStatus::Publishing.as_str())
            .value(Outbox::LastAttemptAt, now)
            .and_where(Expr::col(Outbox::Id).in_subquery(due))
            .returning_all()
            .to_string(PostgresQueryBuilder);

        let rows = sqlx::query(&claim).fetch_all(&self.pool).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(record_from_row(&row)?);
        }
        // RETURNING order is unspecified; restore claim order.
        records.sort_by_key(|record| record.id);

        Ok(records)
    }

    async fn mark_published(&self, id: i64) -> Result<()> {
        let moved = self
            .transition(id, &[OutboxStatus::Publishing], |update| {
                update
                    .value(Outbox::Status, OutboxStatus::Published.as_str())
                    .value(Outbox::PublishedAt, Utc::now());
            })
            .await?;

        if !moved {
            warn!(record = id, "Publish ack for a record no longer publishing");
        }
        Ok(())
    }

    async fn retry_later(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        let error = clip_error(error);
        let moved = self
            .transition(id, &[OutboxStatus::Publishing], |update| {
                update
                    .value(Outbox::Status, OutboxStatus::Pending.as_str())
                    .value(Outbox::RetryCount, Expr::col(Outbox::RetryCount).add(1))
                    .value(Outbox::NextAttemptAt, next_attempt_at)
                    .value(Outbox::LastError, error.as_str());
            })
            .await?;

        if !moved {
            warn!(record = id, "Retry scheduling for a record no longer publishing");
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        let error = clip_error(error);
        self.transition(id, &[OutboxStatus::Publishing], |update| {
            update
                .value(Outbox::Status, OutboxStatus::Failed.as_str())
                .value(Outbox::RetryCount, Expr::col(Outbox::RetryCount).add(1))
                .value(Outbox::LastError, error.as_str());
        })
        .await?;
        Ok(())
    }

    async fn mark_dead_lettered(&self, id: i64, error: &str) -> Result<()> {
        let error = clip_error(error);
        self.transition(id, &[OutboxStatus::Publishing], |update| {
            update
                .value(Outbox::Status, OutboxStatus::DeadLettered.as_str())
                .value(Outbox::RetryCount, Expr::col(Outbox::RetryCount).add(1))
                .value(Outbox::LastError, error.as_str());
        })
        .await?;
        Ok(())
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let query = Query::update()
            .table(Outbox::Table)
            .value(Outbox::Status, OutboxStatus::Pending.as_str())
            .value(Outbox::NextAttemptAt, Option::<DateTime<Utc>>::None)
            .and_where(Expr::col(Outbox::Status).eq(OutboxStatus::Publishing.as_str()))
            .and_where(Expr::col(Outbox::LastAttemptAt).lt(older_than))
            .to_string(PostgresQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn dead_letters(&self, limit: u32) -> Result<Vec<OutboxRecord>> {
        let query = Query::select()
            .column(Asterisk)
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::Status).is_in([
                OutboxStatus::Failed.as_str(),
                OutboxStatus::DeadLettered.as_str(),
            ]))
            .order_by(Outbox::RetryCount, Order::Desc)
            .order_by(Outbox::Id, Order::Asc)
            .limit(limit as u64)
            .to_string(PostgresQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(record_from_row(&row)?);
        }
        Ok(records)
    }

    async fn requeue(&self, id: i64) -> Result<bool> {
        self.transition(
            id,
            &[OutboxStatus::Failed, OutboxStatus::DeadLettered],
            |update| {
                update
                    .value(Outbox::Status, OutboxStatus::Pending.as_str())
                    .value(Outbox::RetryCount, 0)
                    .value(Outbox::NextAttemptAt, Option::<DateTime<Utc>>::None)
                    .value(Outbox::LastError, Option::<String>::None);
            },
        )
        .await
    }

    async fn cancel(&self, id: i64) -> Result<bool> {
        self.transition(id, &[OutboxStatus::Pending], |update| {
            update.value(Outbox::Status, OutboxStatus::Canceled.as_str());
        })
        .await
    }
}

fn clip_error(error: &str) -> String {
    error.chars().take(LAST_ERROR_MAX_LEN).collect()
}

fn record_from_row(row: &PgRow) -> Result<OutboxRecord> {
    let status: String = row.get("status");

    Ok(OutboxRecord {
        id: row.get("id"),
        topic: row.get("topic"),
        key: row.get("key"),
        payload: row.get("payload"),
        idempotency_key: row.get("idempotency_key"),
        correlation_id: row.get("correlation_id"),
        status: OutboxStatus::parse(&status)?,
        retry_count: row.get("retry_count"),
        next_attempt_at: row.get("next_attempt_at"),
        last_attempt_at: row.get("last_attempt_at"),
        last_error: row.get("last_error"),
        published_at: row.get("published_at"),
        created_at: row.get("created_at"),
    })
}
