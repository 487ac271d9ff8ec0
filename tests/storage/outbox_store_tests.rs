//! OutboxStore interface tests.
//!
//! These tests verify the contract of the OutboxStore trait. Records are
//! staged through LogStore::append_with_outbox, so each suite run needs the
//! log store and the outbox store backed by the same database.

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use courier::storage::{LogStore, OutboxMessage, OutboxStatus, OutboxStore};

use super::log_store_tests::make_entry;

/// Stage one pending outbox record and return its id.
pub async fn seed_record<L: LogStore>(log: &L) -> i64 {
    let session = log
        .create_session(Uuid::new_v4())
        .await
        .expect("create_session should succeed");

    let message = OutboxMessage::new(
        "chat.events",
        session.id.to_string(),
        json!({ "kind": "entry_appended", "session_id": session.id }),
    );
    let (_, record_id) = log
        .append_with_outbox(make_entry(session.id, "seed"), message)
        .await
        .expect("append_with_outbox should succeed");

    record_id
}

// =============================================================================
// OutboxStore::claim_due tests
// =============================================================================

pub async fn test_claim_flips_pending_to_publishing<L: LogStore, O: OutboxStore>(
    log: &L,
    outbox: &O,
) {
    let id = seed_record(log).await;

    let claimed = outbox
        .claim_due(Utc::now(), 100)
        .await
        .expect("claim_due should succeed");
    let record = claimed
        .iter()
        .find(|r| r.id == id)
        .expect("freshly staged record should be claimable");
    assert_eq!(record.status, OutboxStatus::Publishing);
    assert!(
        record.last_attempt_at.is_some(),
        "claiming should stamp the attempt time"
    );

    // A second claim must not hand the same record out again.
    let again = outbox
        .claim_due(Utc::now(), 100)
        .await
        .expect("claim_due should succeed");
    assert!(
        again.iter().all(|r| r.id != id),
        "a claimed record should not be claimable twice"
    );
}

pub async fn test_retry_later_defers_redelivery<L: LogStore, O: OutboxStore>(log: &L, outbox: &O) {
    let id = seed_record(log).await;

    let claimed = outbox
        .claim_due(Utc::now(), 100)
        .await
        .expect("claim_due should succeed");
    assert!(claimed.iter().any(|r| r.id == id));

    outbox
        .retry_later(id, "broker unavailable", Utc::now() + Duration::minutes(5))
        .await
        .expect("retry_later should succeed");

    // Not due yet.
    let now = outbox
        .claim_due(Utc::now(), 100)
        .await
        .expect("claim_due should succeed");
    assert!(
        now.iter().all(|r| r.id != id),
        "a deferred record should not be claimable before its schedule"
    );

    // Due once the clock passes the schedule.
    let later = outbox
        .claim_due(Utc::now() + Duration::minutes(10), 100)
        .await
        .expect("claim_due should succeed");
    let record = later
        .iter()
        .find(|r| r.id == id)
        .expect("a deferred record should be claimable after its schedule");
    assert_eq!(record.retry_count, 1);
    assert_eq!(record.last_error.as_deref(), Some("broker unavailable"));
}

// =============================================================================
// Terminal transition tests
// =============================================================================

pub async fn test_published_records_leave_the_queue<L: LogStore, O: OutboxStore>(
    log: &L,
    outbox: &O,
) {
    let id = seed_record(log).await;

    let claimed = outbox
        .claim_due(Utc::now(), 100)
        .await
        .expect("claim_due should succeed");
    assert!(claimed.iter().any(|r| r.id == id));

    outbox
        .mark_published(id)
        .await
        .expect("mark_published should succeed");

    let later = outbox
        .claim_due(Utc::now() + Duration::hours(1), 100)
        .await
        .expect("claim_due should succeed");
    assert!(
        later.iter().all(|r| r.id != id),
        "a published record should never be claimed again"
    );

    let dead = outbox
        .dead_letters(100)
        .await
        .expect("dead_letters should succeed");
    assert!(
        dead.iter().all(|r| r.id != id),
        "a published record is not a dead letter"
    );
}

pub async fn test_failed_records_surface_in_dead_letters<L: LogStore, O: OutboxStore>(
    log: &L,
    outbox: &O,
) {
    // Two failures with different retry pressure, to pin the queue order.
    let heavy = seed_record(log).await;
    let light = seed_record(log).await;

    let claimed = outbox
        .claim_due(Utc::now(), 100)
        .await
        .expect("claim_due should succeed");
    assert!(claimed.iter().any(|r| r.id == heavy));
    assert!(claimed.iter().any(|r| r.id == light));

    // heavy takes one deferral before its terminal failure.
    outbox
        .retry_later(heavy, "broker unavailable", Utc::now())
        .await
        .expect("retry_later should succeed");
    let reclaimed = outbox
        .claim_due(Utc::now() + Duration::seconds(1), 100)
        .await
        .expect("claim_due should succeed");
    assert!(reclaimed.iter().any(|r| r.id == heavy));

    outbox
        .mark_failed(heavy, "payload rejected by broker")
        .await
        .expect("mark_failed should succeed");
    outbox
        .mark_failed(light, "payload rejected by broker")
        .await
        .expect("mark_failed should succeed");

    let dead = outbox
        .dead_letters(100)
        .await
        .expect("dead_letters should succeed");
    let heavy_pos = dead
        .iter()
        .position(|r| r.id == heavy)
        .expect("failed record should surface as a dead letter");
    let light_pos = dead
        .iter()
        .position(|r| r.id == light)
        .expect("failed record should surface as a dead letter");

    let record = &dead[heavy_pos];
    assert_eq!(record.status, OutboxStatus::Failed);
    assert_eq!(record.retry_count, 2);
    assert_eq!(
        record.last_error.as_deref(),
        Some("payload rejected by broker")
    );
    assert!(
        heavy_pos < light_pos,
        "higher retry pressure should sort first in the dead-letter queue"
    );

    // Terminal records never come back through claim.
    let later = outbox
        .claim_due(Utc::now() + Duration::hours(1), 100)
        .await
        .expect("claim_due should succeed");
    assert!(later.iter().all(|r| r.id != heavy && r.id != light));
}

pub async fn test_dead_letter_requeue_cycle<L: LogStore, O: OutboxStore>(log: &L, outbox: &O) {
    let id = seed_record(log).await;

    let claimed = outbox
        .claim_due(Utc::now(), 100)
        .await
        .expect("claim_due should succeed");
    assert!(claimed.iter().any(|r| r.id == id));

    outbox
        .mark_dead_lettered(id, "retry ceiling exhausted")
        .await
        .expect("mark_dead_lettered should succeed");

    let dead = outbox
        .dead_letters(100)
        .await
        .expect("dead_letters should succeed");
    let record = dead
        .iter()
        .find(|r| r.id == id)
        .expect("dead-lettered record should surface");
    assert_eq!(record.status, OutboxStatus::DeadLettered);
    assert_eq!(record.last_error.as_deref(), Some("retry ceiling exhausted"));

    let requeued = outbox.requeue(id).await.expect("requeue should succeed");
    assert!(requeued, "requeue of a dead letter should report true");

    let claimed = outbox
        .claim_due(Utc::now(), 100)
        .await
        .expect("claim_due should succeed");
    let record = claimed
        .iter()
        .find(|r| r.id == id)
        .expect("requeued record should be claimable");
    assert_eq!(record.retry_count, 0, "requeue should reset the retry budget");
    assert!(
        record.last_error.is_none(),
        "requeue should clear the recorded failure"
    );

    // Requeue only applies to terminal records.
    let again = outbox.requeue(id).await.expect("requeue should succeed");
    assert!(!again, "requeue of a publishing record should report false");
}

pub async fn test_cancel_only_pending<L: LogStore, O: OutboxStore>(log: &L, outbox: &O) {
    let id = seed_record(log).await;

    let canceled = outbox.cancel(id).await.expect("cancel should succeed");
    assert!(canceled, "cancel of a pending record should report true");

    let claimed = outbox
        .claim_due(Utc::now(), 100)
        .await
        .expect("claim_due should succeed");
    assert!(
        claimed.iter().all(|r| r.id != id),
        "a canceled record should never be claimed"
    );

    let again = outbox.cancel(id).await.expect("cancel should succeed");
    assert!(!again, "cancel past the first transition should report false");

    // In-flight records are out of reach.
    let in_flight = seed_record(log).await;
    let claimed = outbox
        .claim_due(Utc::now(), 100)
        .await
        .expect("claim_due should succeed");
    assert!(claimed.iter().any(|r| r.id == in_flight));
    let canceled = outbox
        .cancel(in_flight)
        .await
        .expect("cancel should succeed");
    assert!(!canceled, "cancel of a publishing record should report false");
}

// =============================================================================
// Stale claim recovery tests
// =============================================================================

pub async fn test_reclaim_returns_stale_claims<L: LogStore, O: OutboxStore>(log: &L, outbox: &O) {
    let id = seed_record(log).await;

    let claimed = outbox
        .claim_due(Utc::now(), 100)
        .await
        .expect("claim_due should succeed");
    assert!(claimed.iter().any(|r| r.id == id));

    // Everything claimed so far is stale from one second in the future.
    let swept = outbox
        .reclaim_stale(Utc::now() + Duration::seconds(1))
        .await
        .expect("reclaim_stale should succeed");
    assert!(swept >= 1, "at least the claim above should be swept");

    let claimed = outbox
        .claim_due(Utc::now(), 100)
        .await
        .expect("claim_due should succeed");
    let record = claimed
        .iter()
        .find(|r| r.id == id)
        .expect("a swept record should be claimable again");
    assert_eq!(record.status, OutboxStatus::Publishing);
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all OutboxStore interface tests against a log/outbox store pair
/// backed by the same database.
#[macro_export]
macro_rules! run_outbox_store_tests {
    ($log:expr, $outbox:expr) => {
        use $crate::storage::outbox_store_tests::*;

        // claim tests
        test_claim_flips_pending_to_publishing($log, $outbox).await;
        println!("  test_claim_flips_pending_to_publishing: PASSED");

        test_retry_later_defers_redelivery($log, $outbox).await;
        println!("  test_retry_later_defers_redelivery: PASSED");

        // terminal transition tests
        test_published_records_leave_the_queue($log, $outbox).await;
        println!("  test_published_records_leave_the_queue: PASSED");

        test_failed_records_surface_in_dead_letters($log, $outbox).await;
        println!("  test_failed_records_surface_in_dead_letters: PASSED");

        test_dead_letter_requeue_cycle($log, $outbox).await;
        println!("  test_dead_letter_requeue_cycle: PASSED");

        test_cancel_only_pending($log, $outbox).await;
        println!("  test_cancel_only_pending: PASSED");

        // stale claim recovery
        test_reclaim_returns_stale_claims($log, $outbox).await;
        println!("  test_reclaim_returns_stale_claims: PASSED");
    };
}
