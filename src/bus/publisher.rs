//! Outbox publisher loop.
//!
//! Claims due outbox rows, publishes them to the broker, and records
//! each outcome. The claim flips rows to `publishing` before the broker
//! attempt, so a crash between publish and `mark_published` re-delivers
//! the row after the stale-claim sweep. Delivery is at-least-once;
//! consumers dedupe on record id or idempotency key.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{Broker, BusError, TopicMessage};
use crate::config::PublisherConfig;
use crate::retry::RetryPolicy;
use crate::storage::{OutboxRecord, OutboxStore};

/// Drains the outbox into a broker.
pub struct OutboxPublisher {
    outbox: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    config: PublisherConfig,
    retry: RetryPolicy,
}

impl OutboxPublisher {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        config: PublisherConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            outbox,
            broker,
            config,
            retry,
        }
    }

    /// Claim one batch of due rows and publish them in id order.
    ///
    /// Returns the number of rows claimed. Broker failures are recorded
    /// per row and do not abort the batch; a storage failure does, and
    /// leaves the rest of the claim for the stale sweep.
    pub async fn drain_once(&self) -> crate::storage::Result<usize> {
        let batch = self
            .outbox
            .claim_due(Utc::now(), self.config.batch_size)
            .await?;

        for record in &batch {
            self.publish_one(record).await?;
        }

        Ok(batch.len())
    }

    async fn publish_one(&self, record: &OutboxRecord) -> crate::storage::Result<()> {
        let message = TopicMessage::from(record);
        let attempt_timeout = Duration::from_millis(self.config.attempt_timeout_ms);

        let outcome = match tokio::time::timeout(attempt_timeout, self.broker.publish(&message))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(attempt_timeout)),
        };

        match outcome {
            Ok(()) => {
                self.outbox.mark_published(record.id).await?;
                debug!(id = record.id, topic = %record.topic, "Outbox record published");
            }
            Err(e) if !e.retryable() => {
                self.outbox.mark_failed(record.id, &e.to_string()).await?;
                error!(id = record.id, error = %e, "Outbox record rejected by broker");
            }
            Err(e) => {
                // The attempt that just failed counts on top of the
                // row's recorded retries.
                let attempts = record.retry_count as u32 + 1;
                if self.retry.exhausted(attempts) {
                    self.outbox
                        .mark_dead_lettered(record.id, &e.to_string())
                        .await?;
                    error!(
                        id = record.id,
                        attempts = attempts,
                        error = %e,
                        "Outbox record dead-lettered"
                    );
                } else {
                    let delay = self.retry.delay_for(record.retry_count as u32);
                    let next = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
                    self.outbox
                        .retry_later(record.id, &e.to_string(), next)
                        .await?;
                    warn!(
                        id = record.id,
                        attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Outbox publish failed, retry scheduled"
                    );
                }
            }
        }

        Ok(())
    }

    /// Return rows stuck in `publishing` to `pending`.
    ///
    /// Catches claims orphaned by a crashed publisher. The cutoff is
    /// generous enough that a live attempt never gets pulled back.
    async fn reclaim(&self) {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.reclaim_after_secs as i64);
        match self.outbox.reclaim_stale(cutoff).await {
            Ok(0) => {}
            Ok(reclaimed) => warn!(count = reclaimed, "Reclaimed stale publishing claims"),
            Err(e) => error!(error = %e, "Stale claim sweep failed"),
        }
    }

    /// Run until `stop` flips to true.
    ///
    /// Drains continuously while rows are due and waits out the poll
    /// interval when the outbox is empty. The stale sweep runs on its
    /// own cadence inside the same loop.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let reclaim_interval = Duration::from_secs(self.config.reclaim_interval_secs);
        let mut last_reclaim = tokio::time::Instant::now();

        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval_ms,
            "Outbox publisher started"
        );

        loop {
            if last_reclaim.elapsed() >= reclaim_interval {
                self.reclaim().await;
                last_reclaim = tokio::time::Instant::now();
            }

            let drained = match self.drain_once().await {
                Ok(count) => count,
                Err(e) => {
                    error!(error = %e, "Outbox drain failed");
                    0
                }
            };

            // An empty poll (or a storage error) waits out the
            // interval; a non-empty one repolls immediately.
            let idle = if drained == 0 {
                poll_interval
            } else {
                Duration::ZERO
            };

            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!("Outbox publisher stopped");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle to a running publisher task.
pub struct PublisherHandle {
    cancel: watch::Sender<bool>,
}

impl PublisherHandle {
    /// Signal the publisher to stop after its current batch.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Spawn the publisher loop as a background task.
///
/// Returns a handle that can be used to stop the task.
pub fn spawn_publisher(publisher: OutboxPublisher) -> PublisherHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);

    tokio::spawn(async move {
        publisher.run(cancel_rx).await;
    });

    PublisherHandle { cancel: cancel_tx }
}
