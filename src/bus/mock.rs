//! Mock broker implementation for testing.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Broker, BusError, Result, TopicMessage};

/// Mock broker for testing.
///
/// Failure switches cover the publisher's three outcomes: success,
/// transient failure (`set_fail_times`), and permanent rejection
/// (`set_reject`).
#[derive(Default)]
pub struct MockBroker {
    published: RwLock<Vec<TopicMessage>>,
    fail_remaining: RwLock<u32>,
    reject: RwLock<bool>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` publishes with a retryable error.
    pub async fn set_fail_times(&self, count: u32) {
        *self.fail_remaining.write().await = count;
    }

    /// Reject every publish with a non-retryable error.
    pub async fn set_reject(&self, reject: bool) {
        *self.reject.write().await = reject;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<TopicMessage> {
        std::mem::take(&mut *self.published.write().await)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn publish(&self, message: &TopicMessage) -> Result<()> {
        if *self.reject.read().await {
            return Err(BusError::Rejected("Mock rejection".to_string()));
        }

        {
            let mut remaining = self.fail_remaining.write().await;
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BusError::Connection("Mock publish failure".to_string()));
            }
        }

        self.published.write().await.push(message.clone());
        Ok(())
    }
}
