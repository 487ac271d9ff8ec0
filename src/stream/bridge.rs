//! Consumer-group bridge from channel streams to the local fan-out.
//!
//! One bridge polls one channel through a consumer group, so a group
//! of stream-service replicas shares the polling work and an entry is
//! claimed by exactly one of them. Acknowledgment happens after the
//! envelope reaches the fan-out; a crash in between re-delivers the
//! claim, so in-process consumers see at-least-once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{entry_fields, ChannelKey, Result, StreamEnvelope};
use crate::config::StreamConfig;
use crate::retry::RetryPolicy;
use crate::stream::Fanout;

/// One entry claimed through a consumer group, not yet acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

/// Consumer-group access to a channel stream.
#[async_trait]
pub trait GroupSource: Send + Sync {
    /// Create the group if missing. Idempotent.
    async fn ensure_group(&self, channel: &ChannelKey) -> Result<()>;

    /// Claim up to `count` undelivered entries, blocking up to `block`
    /// when none are ready.
    async fn claim(
        &self,
        channel: &ChannelKey,
        block: Duration,
        count: u32,
    ) -> Result<Vec<ClaimedEntry>>;

    /// Acknowledge processed entries.
    async fn ack(&self, channel: &ChannelKey, ids: &[String]) -> Result<()>;
}

/// Redis implementation over XREADGROUP/XACK.
pub struct RedisGroupSource {
    conn: ConnectionManager,
    key_prefix: String,
    group: String,
    consumer: String,
}

impl RedisGroupSource {
    pub fn new(conn: ConnectionManager, key_prefix: impl Into<String>, config: &StreamConfig) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
            group: config.group.clone(),
            consumer: config.consumer.clone(),
        }
    }
}

#[async_trait]
impl GroupSource for RedisGroupSource {
    async fn ensure_group(&self, channel: &ChannelKey) -> Result<()> {
        let key = channel.stream_key(&self.key_prefix);
        let mut conn = self.conn.clone();

        // Group starts at 0 so entries appended before the group
        // existed still get delivered once.
        let created: std::result::Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&key, &self.group, "0")
            .await;

        match created {
            Ok(()) => {
                debug!(key = %key, group = %self.group, "Consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn claim(
        &self,
        channel: &ChannelKey,
        block: Duration,
        count: u32,
    ) -> Result<Vec<ClaimedEntry>> {
        let key = channel.stream_key(&self.key_prefix);
        let options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .block(block.as_millis() as usize)
            .count(count as usize);

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn.xread_options(&[&key], &[">"], &options).await?;

        let mut claimed = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                claimed.push(ClaimedEntry {
                    fields: entry_fields(&entry),
                    id: entry.id,
                });
            }
        }

        Ok(claimed)
    }

    async fn ack(&self, channel: &ChannelKey, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let key = channel.stream_key(&self.key_prefix);
        let mut conn = self.conn.clone();
        let _: u64 = conn.xack(&key, &self.group, ids).await?;

        Ok(())
    }
}

// ============================================================================
// Bridge loop
// ============================================================================

/// Pumps one channel's claimed entries into the local fan-out.
pub struct StreamBridge {
    source: Arc<dyn GroupSource>,
    fanout: Arc<Fanout>,
    channel: ChannelKey,
    block: Duration,
    batch_size: u32,
    retry: RetryPolicy,
}

impl StreamBridge {
    pub fn new(
        source: Arc<dyn GroupSource>,
        fanout: Arc<Fanout>,
        channel: ChannelKey,
        config: &StreamConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            source,
            fanout,
            channel,
            block: Duration::from_millis(config.block_ms),
            batch_size: config.batch_size,
            retry,
        }
    }

    /// One claim/deliver/ack cycle. Returns how many envelopes reached
    /// the fan-out.
    ///
    /// Entries that fail decoding are acknowledged anyway and skipped,
    /// so one poison entry cannot wedge the group on redelivery.
    pub async fn pump_once(&self) -> Result<usize> {
        let entries = self
            .source
            .claim(&self.channel, self.block, self.batch_size)
            .await?;

        if entries.is_empty() {
            return Ok(0);
        }

        let mut acked = Vec::with_capacity(entries.len());
        let mut delivered = 0;

        for entry in &entries {
            match StreamEnvelope::decode(&entry.id, &entry.fields) {
                Ok(envelope) => {
                    self.fanout.deliver(&self.channel, envelope).await;
                    delivered += 1;
                }
                Err(e) => {
                    warn!(
                        channel = %self.channel,
                        id = %entry.id,
                        error = %e,
                        "Skipping malformed stream entry"
                    );
                }
            }
            acked.push(entry.id.clone());
        }

        self.source.ack(&self.channel, &acked).await?;

        debug!(
            channel = %self.channel,
            claimed = entries.len(),
            delivered = delivered,
            "Bridged stream entries"
        );

        Ok(delivered)
    }

    /// Sleep out a backoff delay unless shutdown arrives first.
    /// Returns false when the loop should stop.
    async fn pause(&self, delay: Duration, stop: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = stop.changed() => !*stop.borrow(),
        }
    }

    /// Run until `stop` flips to true.
    ///
    /// Backend failures back off and retry forever; the group keeps the
    /// unacknowledged claim, so nothing is lost across the gap.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        info!(channel = %self.channel, "Stream bridge started");

        let mut delays = self.retry.reconnect().build();
        let mut group_ready = false;

        loop {
            if !group_ready {
                match self.source.ensure_group(&self.channel).await {
                    Ok(()) => {
                        group_ready = true;
                        delays = self.retry.reconnect().build();
                    }
                    Err(e) => {
                        let delay = delays.next().unwrap_or(self.retry.max_delay);
                        error!(
                            channel = %self.channel,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "Consumer group setup failed, backing off"
                        );
                        if !self.pause(delay, &mut stop).await {
                            break;
                        }
                        continue;
                    }
                }
            }

            tokio::select! {
                result = self.pump_once() => {
                    match result {
                        Ok(_) => {
                            delays = self.retry.reconnect().build();
                        }
                        Err(e) => {
                            let delay = delays.next().unwrap_or(self.retry.max_delay);
                            error!(
                                channel = %self.channel,
                                error = %e,
                                delay_ms = delay.as_millis() as u64,
                                "Stream bridge cycle failed, backing off"
                            );
                            if !self.pause(delay, &mut stop).await {
                                break;
                            }
                        }
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }

        info!(channel = %self.channel, "Stream bridge stopped");
    }
}

/// Handle to a running bridge task.
pub struct BridgeHandle {
    cancel: watch::Sender<bool>,
}

impl BridgeHandle {
    /// Signal the bridge to stop after its current cycle.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }
}

/// Spawn a bridge loop as a background task.
pub fn spawn_bridge(bridge: StreamBridge) -> BridgeHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);

    tokio::spawn(async move {
        bridge.run(cancel_rx).await;
    });

    BridgeHandle { cancel: cancel_tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    use crate::stream::mock::MockGroupSource;

    fn entry(id: &str, kind: &str, data: &str) -> ClaimedEntry {
        let mut fields = vec![("event".to_string(), kind.to_string())];
        if !data.is_empty() {
            fields.push(("data".to_string(), data.to_string()));
        }
        ClaimedEntry {
            id: id.to_string(),
            fields,
        }
    }

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: false,
        }
    }

    fn make_bridge(
        source: Arc<MockGroupSource>,
        fanout: Arc<Fanout>,
        channel: ChannelKey,
    ) -> StreamBridge {
        StreamBridge::new(
            source,
            fanout,
            channel,
            &StreamConfig::default(),
            quick_policy(),
        )
    }

    #[tokio::test]
    async fn test_pump_delivers_and_acks() {
        let channel = ChannelKey::new(Uuid::new_v4(), Uuid::new_v4());
        let source = Arc::new(MockGroupSource::new());
        let fanout = Arc::new(Fanout::new());
        let mut rx = fanout.subscribe(&channel).await;

        source
            .push_batch(vec![
                entry("1-0", "token", r#"{"index":0,"text":"a"}"#),
                entry("1-1", "token", r#"{"index":1,"text":"b"}"#),
            ])
            .await;

        let bridge = make_bridge(Arc::clone(&source), Arc::clone(&fanout), channel);
        assert_eq!(bridge.pump_once().await.unwrap(), 2);

        assert_eq!(rx.recv().await.unwrap().id.as_str(), "1-0");
        assert_eq!(rx.recv().await.unwrap().id.as_str(), "1-1");
        assert_eq!(
            source.acked().await,
            vec!["1-0".to_string(), "1-1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_poison_entry_acked_and_skipped() {
        let channel = ChannelKey::new(Uuid::new_v4(), Uuid::new_v4());
        let source = Arc::new(MockGroupSource::new());
        let fanout = Arc::new(Fanout::new());
        let mut rx = fanout.subscribe(&channel).await;

        source
            .push_batch(vec![
                entry("1-0", "token", r#"{"index":0,"text":"a"}"#),
                entry("1-1", "telemetry", "{}"),
                entry("1-2", "done", r#"{"finish_reason":"stop"}"#),
            ])
            .await;

        let bridge = make_bridge(Arc::clone(&source), Arc::clone(&fanout), channel);
        assert_eq!(bridge.pump_once().await.unwrap(), 2);

        // The poison entry is acknowledged with the rest.
        assert_eq!(source.acked().await.len(), 3);
        assert_eq!(rx.recv().await.unwrap().id.as_str(), "1-0");
        assert_eq!(rx.recv().await.unwrap().id.as_str(), "1-2");
    }

    #[tokio::test]
    async fn test_empty_claim_is_quiet() {
        let channel = ChannelKey::new(Uuid::new_v4(), Uuid::new_v4());
        let source = Arc::new(MockGroupSource::new());
        let fanout = Arc::new(Fanout::new());

        let bridge = make_bridge(Arc::clone(&source), fanout, channel);
        assert_eq!(bridge.pump_once().await.unwrap(), 0);
        assert!(source.acked().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_creates_group_and_recovers_from_claim_failure() {
        let channel = ChannelKey::new(Uuid::new_v4(), Uuid::new_v4());
        let source = Arc::new(MockGroupSource::new());
        let fanout = Arc::new(Fanout::new());
        let mut rx = fanout.subscribe(&channel).await;

        source.set_fail_claims(1).await;
        source
            .push_batch(vec![entry("1-0", "heartbeat", "")])
            .await;

        let bridge = make_bridge(Arc::clone(&source), Arc::clone(&fanout), channel);
        let handle = spawn_bridge(bridge);

        // One failed claim, a short backoff, then delivery.
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.id.as_str(), "1-0");
        assert!(source.group_ensured().await);

        handle.stop();
    }
}
