//! Courier - Ordered Event Outbox and Stream Bridge
//!
//! Reliable event delivery for streaming chat platforms: a strictly
//! ordered per-session log with a transactional outbox on PostgreSQL,
//! an at-least-once broker publisher, a Redis Streams live channel with
//! a consumer-group bridge, and a resumable SSE surface.

pub mod bus;
pub mod config;
pub mod retry;
pub mod sse;
pub mod storage;
pub mod stream;
