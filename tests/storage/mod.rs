//! Shared storage integration tests.
//!
//! Tests the LogStore and OutboxStore interfaces against all implementations.
//! Each implementation module imports these test functions and runs them.

pub mod log_store_tests;
pub mod outbox_store_tests;
