//! Mock store implementations for testing.
//!
//! `MockOutboxStore` mirrors the real claim semantics (status guards, due
//! gating, id ordering) so publisher behavior can be tested without a
//! database. `MockLogStore` owns a `MockOutboxStore` twin so
//! `append_with_outbox` keeps its both-or-neither shape.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::storage::{
    EntryRole, EntryStatus, LogEntry, LogPage, LogStore, NewLogEntry, OutboxMessage, OutboxRecord,
    OutboxStatus, OutboxStore, Result, Session, StorageError,
};

/// Mock log store that keeps entries in memory.
pub struct MockLogStore {
    sessions: RwLock<HashMap<Uuid, Session>>,
    entries: RwLock<HashMap<Uuid, Vec<LogEntry>>>,
    fail_on_append: RwLock<bool>,
    outbox: Arc<MockOutboxStore>,
}

impl Default for MockLogStore {
    fn default() -> Self {
        Self {
            sessions: RwLock::default(),
            entries: RwLock::default(),
            fail_on_append: RwLock::default(),
            outbox: Arc::new(MockOutboxStore::new()),
        }
    }
}

impl MockLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The outbox twin that `append_with_outbox` enqueues into.
    pub fn outbox(&self) -> Arc<MockOutboxStore> {
        Arc::clone(&self.outbox)
    }

    pub async fn set_fail_on_append(&self, fail: bool) {
        *self.fail_on_append.write().await = fail;
    }

    async fn append_locked(&self, entry: &NewLogEntry) -> Result<LogEntry> {
        if *self.fail_on_append.read().await {
            return Err(StorageError::SessionNotFound(entry.session_id));
        }
        if !self.sessions.read().await.contains_key(&entry.session_id) {
            return Err(StorageError::SessionNotFound(entry.session_id));
        }

        let mut entries = self.entries.write().await;
        let session_entries = entries.entry(entry.session_id).or_default();
        let sequence = session_entries.len() as i64 + 1;

        let log_entry = LogEntry {
            id: Uuid::new_v4(),
            session_id: entry.session_id,
            sequence,
            role: entry.role,
            payload: entry.payload.clone(),
            status: entry.status,
            created_at: Utc::now(),
        };
        session_entries.push(log_entry.clone());

        Ok(log_entry)
    }
}

#[async_trait]
impl LogStore for MockLogStore {
    async fn create_session(&self, owner_id: Uuid) -> Result<Session> {
        let session = Session {
            id: Uuid::new_v4(),
            owner_id,
            created_at: Utc::now(),
        };
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        Ok(session)
    }

    async fn append(&self, entry: NewLogEntry) -> Result<LogEntry> {
        self.append_locked(&entry).await
    }

    async fn append_with_outbox(
        &self,
        entry: NewLogEntry,
        message: OutboxMessage,
    ) -> Result<(LogEntry, i64)> {
        let log_entry = self.append_locked(&entry).await?;
        let record_id = self.outbox.push(message).await;
        Ok((log_entry, record_id))
    }

    async fn list(&self, session_id: Uuid, page: LogPage) -> Result<Vec<LogEntry>> {
        let entries = self.entries.read().await;
        let session_entries = match entries.get(&session_id) {
            Some(entries) => entries,
            None => return Ok(Vec::new()),
        };

        let below: Vec<LogEntry> = session_entries
            .iter()
            .filter(|e| match page.before_sequence {
                Some(before) => e.sequence < before,
                None => true,
            })
            .cloned()
            .collect();

        let skip = below.len().saturating_sub(page.limit as usize);
        Ok(below.into_iter().skip(skip).collect())
    }

    async fn purge_session(&self, id: Uuid) -> Result<bool> {
        let removed = self.sessions.write().await.remove(&id).is_some();
        self.entries.write().await.remove(&id);
        Ok(removed)
    }
}

#[derive(Default)]
struct MockOutboxState {
    records: Vec<OutboxRecord>,
    next_id: i64,
}

/// Mock outbox store with real claim/transition semantics.
#[derive(Default)]
pub struct MockOutboxStore {
    state: RwLock<MockOutboxState>,
    fail_on_claim: RwLock<bool>,
}

impl MockOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_claim(&self, fail: bool) {
        *self.fail_on_claim.write().await = fail;
    }

    /// Enqueue directly, outside any transaction; test seeding only.
    /// Duplicate idempotency keys collapse like the real store.
    pub async fn push(&self, message: OutboxMessage) -> i64 {
        let mut state = self.state.write().await;

        if let Some(key) = message.idempotency_key.as_deref() {
            if let Some(existing) = state
                .records
                .iter()
                .find(|r| r.idempotency_key.as_deref() == Some(key))
            {
                return existing.id;
            }
        }

        state.next_id += 1;
        let id = state.next_id;
        state.records.push(OutboxRecord {
            id,
            topic: message.topic,
            key: message.key,
            payload: message.payload,
            idempotency_key: message.idempotency_key,
            correlation_id: message
                .correlation_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            status: OutboxStatus::Pending,
            retry_count: 0,
            next_attempt_at: None,
            last_attempt_at: None,
            last_error: None,
            published_at: None,
            created_at: Utc::now(),
        });
        id
    }

    pub async fn record(&self, id: i64) -> Option<OutboxRecord> {
        self.state
            .read()
            .await
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    pub async fn records(&self) -> Vec<OutboxRecord> {
        self.state.read().await.records.clone()
    }

    async fn update<F>(&self, id: i64, from: &[OutboxStatus], apply: F) -> bool
    where
        F: FnOnce(&mut OutboxRecord),
    {
        let mut state = self.state.write().await;
        match state
            .records
            .iter_mut()
            .find(|r| r.id == id && from.contains(&r.status))
        {
            Some(record) => {
                apply(record);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl OutboxStore for MockOutboxStore {
    async fn claim_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<OutboxRecord>> {
        if *self.fail_on_claim.read().await {
            return Err(StorageError::RecordNotFound(0));
        }

        let mut state = self.state.write().await;
        let mut claimed = Vec::new();

        for record in state.records.iter_mut() {
            if claimed.len() >= limit as usize {
                break;
            }
            let due = record.next_attempt_at.map(|at| at <= now).unwrap_or(true);
            if record.status == OutboxStatus::Pending && due {
                record.status = OutboxStatus::Publishing;
                record.last_attempt_at = Some(now);
                claimed.push(record.clone());
            }
        }

        Ok(claimed)
    }

    async fn mark_published(&self, id: i64) -> Result<()> {
        self.update(id, &[OutboxStatus::Publishing], |record| {
            record.status = OutboxStatus::Published;
            record.published_at = Some(Utc::now());
        })
        .await;
        Ok(())
    }

    async fn retry_later(
        &self,
        id: i64,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        self.update(id, &[OutboxStatus::Publishing], |record| {
            record.status = OutboxStatus::Pending;
            record.retry_count += 1;
            record.next_attempt_at = Some(next_attempt_at);
            record.last_error = Some(error.to_string());
        })
        .await;
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> Result<()> {
        self.update(id, &[OutboxStatus::Publishing], |record| {
            record.status = OutboxStatus::Failed;
            record.retry_count += 1;
            record.last_error = Some(error.to_string());
        })
        .await;
        Ok(())
    }

    async fn mark_dead_lettered(&self, id: i64, error: &str) -> Result<()> {
        self.update(id, &[OutboxStatus::Publishing], |record| {
            record.status = OutboxStatus::DeadLettered;
            record.retry_count += 1;
            record.last_error = Some(error.to_string());
        })
        .await;
        Ok(())
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut moved = 0;

        for record in state.records.iter_mut() {
            let stale = record.last_attempt_at.map(|at| at < older_than).unwrap_or(false);
            if record.status == OutboxStatus::Publishing && stale {
                record.status = OutboxStatus::Pending;
                record.next_attempt_at = None;
                moved += 1;
            }
        }

        Ok(moved)
    }

    async fn dead_letters(&self, limit: u32) -> Result<Vec<OutboxRecord>> {
        let state = self.state.read().await;
        let mut parked: Vec<OutboxRecord> = state
            .records
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    OutboxStatus::Failed | OutboxStatus::DeadLettered
                )
            })
            .cloned()
            .collect();

        parked.sort_by(|a, b| b.retry_count.cmp(&a.retry_count).then(a.id.cmp(&b.id)));
        parked.truncate(limit as usize);
        Ok(parked)
    }

    async fn requeue(&self, id: i64) -> Result<bool> {
        Ok(self
            .update(
                id,
                &[OutboxStatus::Failed, OutboxStatus::DeadLettered],
                |record| {
                    record.status = OutboxStatus::Pending;
                    record.retry_count = 0;
                    record.next_attempt_at = None;
                    record.last_error = None;
                },
            )
            .await)
    }

    async fn cancel(&self, id: i64) -> Result<bool> {
        Ok(self
            .update(id, &[OutboxStatus::Pending], |record| {
                record.status = OutboxStatus::Canceled;
            })
            .await)
    }
}
