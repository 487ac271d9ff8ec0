//! Mock stream implementations for testing.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::bridge::{ClaimedEntry, GroupSource};
use super::reader::{ChannelBatch, ChannelReader};
use super::{ChannelKey, EntryId, Result, StreamEnvelope, StreamError};

/// Shortest simulated blocking wait when a mock has nothing queued.
/// Keeps tests that poll in a loop from spinning.
const IDLE_WAIT: Duration = Duration::from_millis(10);

fn backend_error(message: &'static str) -> StreamError {
    StreamError::Backend(redis::RedisError::from((redis::ErrorKind::IoError, message)))
}

/// Mock channel reader scripted with read windows.
///
/// Each `read_from` pops one scripted window; an exhausted script
/// simulates quiet blocking reads. Cursors passed by the caller are
/// recorded for assertions.
#[derive(Default)]
pub struct MockChannelReader {
    windows: Mutex<VecDeque<Vec<StreamEnvelope>>>,
    cursors: Mutex<Vec<String>>,
    fail_next: RwLock<bool>,
}

impl MockChannelReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one window of envelopes for a future read.
    pub async fn push_window(&self, envelopes: Vec<StreamEnvelope>) {
        self.windows.lock().await.push_back(envelopes);
    }

    /// Fail the next read with a backend error.
    pub async fn set_fail_next(&self, fail: bool) {
        *self.fail_next.write().await = fail;
    }

    /// Cursors observed across all reads, in order.
    pub async fn seen_cursors(&self) -> Vec<String> {
        self.cursors.lock().await.clone()
    }
}

#[async_trait]
impl ChannelReader for MockChannelReader {
    async fn read_from(
        &self,
        _channel: &ChannelKey,
        cursor: &EntryId,
        block: Duration,
        _count: u32,
    ) -> Result<ChannelBatch> {
        self.cursors.lock().await.push(cursor.as_str().to_string());

        if *self.fail_next.read().await {
            *self.fail_next.write().await = false;
            return Err(backend_error("injected read failure"));
        }

        let window = self.windows.lock().await.pop_front();
        match window {
            Some(envelopes) if !envelopes.is_empty() => {
                let next_cursor = envelopes.last().map(|e| e.id.clone());
                Ok(ChannelBatch {
                    envelopes,
                    next_cursor,
                })
            }
            _ => {
                tokio::time::sleep(block.min(IDLE_WAIT)).await;
                Ok(ChannelBatch::default())
            }
        }
    }
}

/// Mock consumer-group source scripted with claim batches.
#[derive(Default)]
pub struct MockGroupSource {
    batches: Mutex<VecDeque<Vec<ClaimedEntry>>>,
    acked: Mutex<Vec<String>>,
    group_ensured: RwLock<bool>,
    fail_claims: RwLock<u32>,
}

impl MockGroupSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one batch of entries for a future claim.
    pub async fn push_batch(&self, entries: Vec<ClaimedEntry>) {
        self.batches.lock().await.push_back(entries);
    }

    /// Fail the next `count` claims with a backend error.
    pub async fn set_fail_claims(&self, count: u32) {
        *self.fail_claims.write().await = count;
    }

    /// Ids acknowledged so far, in order.
    pub async fn acked(&self) -> Vec<String> {
        self.acked.lock().await.clone()
    }

    /// Whether `ensure_group` has been called.
    pub async fn group_ensured(&self) -> bool {
        *self.group_ensured.read().await
    }
}

#[async_trait]
impl GroupSource for MockGroupSource {
    async fn ensure_group(&self, _channel: &ChannelKey) -> Result<()> {
        *self.group_ensured.write().await = true;
        Ok(())
    }

    async fn claim(
        &self,
        _channel: &ChannelKey,
        block: Duration,
        _count: u32,
    ) -> Result<Vec<ClaimedEntry>> {
        {
            let mut remaining = self.fail_claims.write().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(backend_error("injected claim failure"));
            }
        }

        match self.batches.lock().await.pop_front() {
            Some(entries) => Ok(entries),
            None => {
                tokio::time::sleep(block.min(IDLE_WAIT)).await;
                Ok(Vec::new())
            }
        }
    }

    async fn ack(&self, _channel: &ChannelKey, ids: &[String]) -> Result<()> {
        self.acked.lock().await.extend(ids.iter().cloned());
        Ok(())
    }
}
