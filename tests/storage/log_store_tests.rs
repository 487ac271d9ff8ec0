//! LogStore interface tests.
//!
//! These tests verify the contract of the LogStore trait.
//! Each storage implementation should run these tests.

use serde_json::json;
use uuid::Uuid;

use courier::storage::{
    EntryRole, EntryStatus, LogEntry, LogPage, LogStore, NewLogEntry, OutboxMessage, StorageError,
};

/// Create a test entry for the given session.
pub fn make_entry(session_id: Uuid, text: &str) -> NewLogEntry {
    NewLogEntry {
        session_id,
        role: EntryRole::Assistant,
        payload: json!({ "text": text }),
        status: EntryStatus::Done,
    }
}

fn seqs(entries: &[LogEntry]) -> Vec<i64> {
    entries.iter().map(|e| e.sequence).collect()
}

// =============================================================================
// LogStore::append tests
// =============================================================================

pub async fn test_append_assigns_gapless_sequences<S: LogStore>(store: &S) {
    let session = store
        .create_session(Uuid::new_v4())
        .await
        .expect("create_session should succeed");

    for expected in 1..=3i64 {
        let entry = store
            .append(make_entry(session.id, &format!("message {}", expected)))
            .await
            .expect("append should succeed");
        assert_eq!(entry.sequence, expected, "sequences should count up from 1");
        assert_eq!(entry.session_id, session.id);
    }
}

pub async fn test_append_unknown_session_fails<S: LogStore>(store: &S) {
    let missing = Uuid::new_v4();
    let result = store.append(make_entry(missing, "orphan")).await;

    match result {
        Err(StorageError::SessionNotFound(id)) => assert_eq!(id, missing),
        other => panic!("expected SessionNotFound, got {:?}", other),
    }
}

pub async fn test_concurrent_appends_stay_gapless<S: LogStore>(store: &S) {
    let session = store
        .create_session(Uuid::new_v4())
        .await
        .expect("create_session should succeed");

    let appends =
        (0..16).map(|i| store.append(make_entry(session.id, &format!("message {}", i))));
    let results = futures::future::join_all(appends).await;

    let mut sequences: Vec<i64> = results
        .into_iter()
        .map(|r| r.expect("append should succeed").sequence)
        .collect();
    sequences.sort_unstable();

    let expected: Vec<i64> = (1..=16).collect();
    assert_eq!(
        sequences, expected,
        "concurrent appends must neither skip nor duplicate a sequence"
    );
}

// =============================================================================
// LogStore::list tests
// =============================================================================

pub async fn test_list_pages_newest_first_with_keyset<S: LogStore>(store: &S) {
    let session = store
        .create_session(Uuid::new_v4())
        .await
        .expect("create_session should succeed");

    for i in 1..=5 {
        store
            .append(make_entry(session.id, &format!("message {}", i)))
            .await
            .expect("append should succeed");
    }

    // No cursor: the newest page, ascending within the page.
    let tail = store
        .list(
            session.id,
            LogPage {
                limit: 2,
                before_sequence: None,
            },
        )
        .await
        .expect("list should succeed");
    assert_eq!(seqs(&tail), vec![4, 5]);

    // Walk backwards with the keyset cursor.
    let middle = store
        .list(
            session.id,
            LogPage {
                limit: 2,
                before_sequence: Some(4),
            },
        )
        .await
        .expect("list should succeed");
    assert_eq!(seqs(&middle), vec![2, 3]);

    let oldest = store
        .list(
            session.id,
            LogPage {
                limit: 2,
                before_sequence: Some(2),
            },
        )
        .await
        .expect("list should succeed");
    assert_eq!(seqs(&oldest), vec![1]);

    let done = store
        .list(
            session.id,
            LogPage {
                limit: 2,
                before_sequence: Some(1),
            },
        )
        .await
        .expect("list should succeed");
    assert!(done.is_empty(), "paging past the start should read empty");
}

pub async fn test_list_unknown_session_is_empty<S: LogStore>(store: &S) {
    let entries = store
        .list(Uuid::new_v4(), LogPage::default())
        .await
        .expect("list should succeed");
    assert!(
        entries.is_empty(),
        "an unknown session reads as empty, not as an error"
    );
}

// =============================================================================
// LogStore::append_with_outbox tests
// =============================================================================

pub async fn test_append_with_outbox_returns_both_ids<S: LogStore>(store: &S) {
    let session = store
        .create_session(Uuid::new_v4())
        .await
        .expect("create_session should succeed");

    let message = OutboxMessage::new(
        "chat.events",
        session.id.to_string(),
        json!({ "kind": "entry_appended" }),
    );
    let (entry, record_id) = store
        .append_with_outbox(make_entry(session.id, "hello"), message)
        .await
        .expect("append_with_outbox should succeed");

    assert_eq!(entry.sequence, 1);
    assert!(record_id > 0, "outbox record id should be assigned");
}

pub async fn test_append_with_outbox_collapses_idempotency_key<S: LogStore>(store: &S) {
    let session = store
        .create_session(Uuid::new_v4())
        .await
        .expect("create_session should succeed");
    let key = format!("dedupe-{}", Uuid::new_v4());

    let message = OutboxMessage::new(
        "chat.events",
        session.id.to_string(),
        json!({ "kind": "entry_appended" }),
    )
    .with_idempotency_key(key.clone());
    let (_, first) = store
        .append_with_outbox(make_entry(session.id, "first"), message.clone())
        .await
        .expect("append_with_outbox should succeed");

    let (_, second) = store
        .append_with_outbox(make_entry(session.id, "second"), message)
        .await
        .expect("append_with_outbox should succeed");

    assert_eq!(
        first, second,
        "duplicate idempotency keys should collapse onto one outbox record"
    );
}

// =============================================================================
// LogStore::purge_session tests
// =============================================================================

pub async fn test_purge_session_cascades<S: LogStore>(store: &S) {
    let session = store
        .create_session(Uuid::new_v4())
        .await
        .expect("create_session should succeed");
    store
        .append(make_entry(session.id, "doomed"))
        .await
        .expect("append should succeed");

    let purged = store
        .purge_session(session.id)
        .await
        .expect("purge should succeed");
    assert!(purged, "purging an existing session should report true");

    let entries = store
        .list(session.id, LogPage::default())
        .await
        .expect("list should succeed");
    assert!(entries.is_empty(), "entries should go with their session");

    let again = store
        .purge_session(session.id)
        .await
        .expect("purge should succeed");
    assert!(!again, "a second purge should report false");
}

// =============================================================================
// Test runner macro
// =============================================================================

/// Run all LogStore interface tests against a store implementation.
#[macro_export]
macro_rules! run_log_store_tests {
    ($store:expr) => {
        use $crate::storage::log_store_tests::*;

        // append tests
        test_append_assigns_gapless_sequences($store).await;
        println!("  test_append_assigns_gapless_sequences: PASSED");

        test_append_unknown_session_fails($store).await;
        println!("  test_append_unknown_session_fails: PASSED");

        test_concurrent_appends_stay_gapless($store).await;
        println!("  test_concurrent_appends_stay_gapless: PASSED");

        // list tests
        test_list_pages_newest_first_with_keyset($store).await;
        println!("  test_list_pages_newest_first_with_keyset: PASSED");

        test_list_unknown_session_is_empty($store).await;
        println!("  test_list_unknown_session_is_empty: PASSED");

        // append_with_outbox tests
        test_append_with_outbox_returns_both_ids($store).await;
        println!("  test_append_with_outbox_returns_both_ids: PASSED");

        test_append_with_outbox_collapses_idempotency_key($store).await;
        println!("  test_append_with_outbox_collapses_idempotency_key: PASSED");

        // purge tests
        test_purge_session_cascades($store).await;
        println!("  test_purge_session_cascades: PASSED");
    };
}
