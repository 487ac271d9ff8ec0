//! Resumable server-sent-event sessions.
//!
//! One axum route serves a live channel as `text/event-stream`. Each
//! connection gets its own reader task that follows the channel from the
//! client's `Last-Event-ID` cursor, so a reconnect replays exactly the
//! entries the client has not seen. Every data frame carries its entry
//! id as the SSE frame id; quiet read windows surface as heartbeat
//! frames.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::routing::get;
use axum::Router;
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SseConfig;
use crate::stream::{ChannelKey, ChannelReader, EntryId, StreamEnvelope, StreamEvent};

/// Header carrying the caller identity, injected by the gateway.
pub const USER_HEADER: &str = "x-user-id";

/// Header carrying the client's resume cursor.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

// ============================================================================
// Routing
// ============================================================================

/// Shared state for the stream routes.
#[derive(Clone)]
pub struct AppState {
    pub reader: Arc<dyn ChannelReader>,
    pub config: SseConfig,
}

/// Build the HTTP surface: the channel stream route plus a liveness probe.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/channels/{job_id}/events", get(stream_channel))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serve one job's channel as an SSE response.
///
/// The channel key is derived from the path and the caller identity, so
/// a caller holding the wrong user id reads an empty channel instead of
/// receiving an error.
async fn stream_channel(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    principal: Principal,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let channel = ChannelKey::new(job_id, principal.0);
    let cursor = resume_cursor(&headers);

    info!(channel = %channel, cursor = %cursor, "Stream session opened");

    Sse::new(open_stream(
        state.reader.clone(),
        channel,
        cursor,
        state.config.clone(),
    ))
}

// ============================================================================
// Principal
// ============================================================================

/// Caller identity for channel scoping.
///
/// Stand-in for the platform auth boundary: the gateway in front of this
/// service authenticates the caller and forwards the subject id in
/// `x-user-id`. Requests without a usable subject are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal(pub Uuid);

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, &'static str);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or((StatusCode::UNAUTHORIZED, "Missing x-user-id header"))?;

        let user_id = Uuid::parse_str(raw)
            .map_err(|_| (StatusCode::UNAUTHORIZED, "Malformed x-user-id header"))?;

        Ok(Self(user_id))
    }
}

/// Resolve the client's resume cursor from the request headers.
///
/// A malformed cursor reads from the start of the channel instead of
/// failing the request.
fn resume_cursor(headers: &HeaderMap) -> EntryId {
    match headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        None => EntryId::start(),
        Some(raw) => match EntryId::parse(raw) {
            Some(cursor) => cursor,
            None => {
                warn!(header = %raw, "Ignoring malformed Last-Event-ID");
                EntryId::start()
            }
        },
    }
}

// ============================================================================
// Session
// ============================================================================

/// One frame bound for the client.
///
/// Synthetic frames (heartbeats, session errors) carry no id so they
/// never disturb the client's resume cursor.
#[derive(Debug, Clone, PartialEq)]
struct SseFrame {
    id: Option<EntryId>,
    event: StreamEvent,
}

impl SseFrame {
    fn entry(envelope: StreamEnvelope) -> Self {
        Self {
            id: Some(envelope.id),
            event: envelope.event,
        }
    }

    fn synthetic(event: StreamEvent) -> Self {
        Self { id: None, event }
    }

    /// Render as a wire frame. Variants without a payload get an empty
    /// JSON object so every frame has a data line.
    fn render(&self) -> Event {
        let (kind, data) = self.event.wire_parts();
        let mut frame = Event::default()
            .event(kind)
            .data(data.unwrap_or_else(|| "{}".to_string()));
        if let Some(id) = &self.id {
            frame = frame.id(id.as_str());
        }
        frame
    }
}

/// Open a resumable event stream for one channel.
///
/// Spawns the per-connection reader task and returns the frame stream
/// for the response body. The stream ends after a terminal event, after
/// the session deadline, or when the client goes away; all three paths
/// end the same task, so a race between them tears down once.
pub fn open_stream(
    reader: Arc<dyn ChannelReader>,
    channel: ChannelKey,
    resume_from: EntryId,
    config: SseConfig,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    tokio::spawn(async move {
        run_session(reader, channel, resume_from, config, tx).await;
    });

    ReceiverStream::new(rx).map(|frame: SseFrame| Ok::<_, Infallible>(frame.render()))
}

/// Per-connection read loop: follow the channel cursor, forward frames,
/// stop on terminal events, client disconnect, or the session deadline.
async fn run_session(
    reader: Arc<dyn ChannelReader>,
    channel: ChannelKey,
    mut cursor: EntryId,
    config: SseConfig,
    tx: mpsc::Sender<SseFrame>,
) {
    let block = Duration::from_millis(config.read_block_ms);
    let deadline = (config.hard_timeout_secs > 0)
        .then(|| Instant::now() + Duration::from_secs(config.hard_timeout_secs));

    loop {
        // Cap the read window at whatever remains of the session deadline.
        let window = match deadline {
            Some(at) => {
                let left = at.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    let frame = SseFrame::synthetic(StreamEvent::Error {
                        code: "TIMEOUT".to_string(),
                        message: "Session deadline reached, reconnect to resume".to_string(),
                        retryable: true,
                    });
                    let _ = tx.send(frame).await;
                    info!(channel = %channel, "Stream session hit its deadline");
                    return;
                }
                block.min(left)
            }
            None => block,
        };

        let batch = tokio::select! {
            _ = tx.closed() => {
                debug!(channel = %channel, "Client disconnected");
                return;
            }
            result = reader.read_from(&channel, &cursor, window, config.batch_size) => match result {
                Ok(batch) => batch,
                Err(e) => {
                    error!(channel = %channel, error = %e, "Channel read failed");
                    let frame = SseFrame::synthetic(StreamEvent::Error {
                        code: "STREAM_READ".to_string(),
                        message: "Live channel read failed, reconnect to resume".to_string(),
                        retryable: true,
                    });
                    let _ = tx.send(frame).await;
                    return;
                }
            },
        };

        if let Some(next) = batch.next_cursor {
            cursor = next;
        }

        if batch.envelopes.is_empty() {
            // Heartbeats are droppable, they carry no cursor.
            if let Err(mpsc::error::TrySendError::Closed(_)) =
                tx.try_send(SseFrame::synthetic(StreamEvent::Heartbeat))
            {
                debug!(channel = %channel, "Client disconnected");
                return;
            }
            continue;
        }

        for envelope in batch.envelopes {
            let terminal = envelope.event.is_terminal();
            let kind = envelope.event.kind();
            let frame = SseFrame::entry(envelope);

            if terminal {
                // Terminal frames are never shed; wait for queue room.
                if tx.send(frame).await.is_err() {
                    debug!(channel = %channel, "Client disconnected during send");
                } else {
                    info!(channel = %channel, kind = kind, "Stream session complete");
                }
                return;
            }

            if matches!(frame.event, StreamEvent::Token { .. }) {
                // Tokens are shed when the client lags; the frame ids let
                // a reconnect pick up where the client really is.
                match tx.try_send(frame) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(channel = %channel, "Shedding token frame on backed-up session");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(channel = %channel, "Client disconnected");
                        return;
                    }
                }
            } else if tx.send(frame).await.is_err() {
                debug!(channel = %channel, "Client disconnected during send");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::mock::MockChannelReader;
    use tokio::task::JoinHandle;

    fn test_config() -> SseConfig {
        SseConfig {
            read_block_ms: 20,
            batch_size: 16,
            hard_timeout_secs: 0,
            queue_capacity: 32,
        }
    }

    fn channel() -> ChannelKey {
        ChannelKey::new(Uuid::new_v4(), Uuid::new_v4())
    }

    fn envelope(id: &str, event: StreamEvent) -> StreamEnvelope {
        StreamEnvelope {
            id: EntryId(id.to_string()),
            event,
            seq: None,
            ts: None,
        }
    }

    fn token(index: u64) -> StreamEvent {
        StreamEvent::Token {
            index,
            text: format!("t{}", index),
        }
    }

    fn done() -> StreamEvent {
        StreamEvent::Done {
            finish_reason: "stop".to_string(),
        }
    }

    fn spawn_session(
        reader: Arc<MockChannelReader>,
        config: SseConfig,
        cursor: EntryId,
    ) -> (mpsc::Receiver<SseFrame>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let handle = tokio::spawn(run_session(reader, channel(), cursor, config, tx));
        (rx, handle)
    }

    // ==== Resume cursor ====

    #[test]
    fn test_resume_cursor_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_EVENT_ID_HEADER, "1700000000000-4".parse().unwrap());

        assert_eq!(
            resume_cursor(&headers),
            EntryId("1700000000000-4".to_string())
        );
    }

    #[test]
    fn test_resume_cursor_defaults_to_start() {
        assert_eq!(resume_cursor(&HeaderMap::new()), EntryId::start());
    }

    #[test]
    fn test_resume_cursor_ignores_malformed_header() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_EVENT_ID_HEADER, "not-a-cursor".parse().unwrap());

        assert_eq!(resume_cursor(&headers), EntryId::start());
    }

    // ==== Principal ====

    #[tokio::test]
    async fn test_principal_from_header() {
        let user = "7f2c3a44-13de-4a2b-9c1d-6a5d1df1d001";
        let (mut parts, _) = axum::http::Request::builder()
            .header(USER_HEADER, user)
            .body(())
            .unwrap()
            .into_parts();

        let principal = Principal::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(principal.0, Uuid::parse_str(user).unwrap());
    }

    #[tokio::test]
    async fn test_principal_rejects_missing_or_malformed_header() {
        let (mut parts, _) = axum::http::Request::builder()
            .body(())
            .unwrap()
            .into_parts();
        let missing = Principal::from_request_parts(&mut parts, &()).await;
        assert_eq!(missing.unwrap_err().0, StatusCode::UNAUTHORIZED);

        let (mut parts, _) = axum::http::Request::builder()
            .header(USER_HEADER, "not-a-uuid")
            .body(())
            .unwrap()
            .into_parts();
        let malformed = Principal::from_request_parts(&mut parts, &()).await;
        assert_eq!(malformed.unwrap_err().0, StatusCode::UNAUTHORIZED);
    }

    // ==== Session loop ====

    #[tokio::test]
    async fn test_quiet_window_emits_heartbeat() {
        let reader = Arc::new(MockChannelReader::new());
        let (mut rx, _handle) = spawn_session(reader, test_config(), EntryId::start());

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, StreamEvent::Heartbeat);
        assert_eq!(frame.id, None);
    }

    #[tokio::test]
    async fn test_delivers_entries_then_terminal_closes() {
        let reader = Arc::new(MockChannelReader::new());
        reader
            .push_window(vec![
                envelope("5-0", token(0)),
                envelope("5-1", token(1)),
                envelope("6-0", done()),
            ])
            .await;

        let (mut rx, _handle) = spawn_session(reader, test_config(), EntryId::start());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.id, Some(EntryId("5-0".to_string())));
        assert_eq!(first.event, token(0));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.id, Some(EntryId("5-1".to_string())));

        let last = rx.recv().await.unwrap();
        assert_eq!(last.event, done());

        // Terminal event ends the stream.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_resume_cursor_reaches_reader() {
        let reader = Arc::new(MockChannelReader::new());
        reader.push_window(vec![envelope("1800-0", done())]).await;

        let resume = EntryId("1700-3".to_string());
        let (mut rx, _handle) = spawn_session(reader.clone(), test_config(), resume);

        while rx.recv().await.is_some() {}
        assert_eq!(reader.seen_cursors().await[0], "1700-3");
    }

    #[tokio::test]
    async fn test_cursor_advances_between_windows() {
        let reader = Arc::new(MockChannelReader::new());
        reader.push_window(vec![envelope("5-0", token(0))]).await;
        reader
            .push_window(vec![envelope("6-0", token(1)), envelope("7-0", done())])
            .await;

        let (mut rx, _handle) = spawn_session(reader.clone(), test_config(), EntryId::start());

        while rx.recv().await.is_some() {}
        let cursors = reader.seen_cursors().await;
        assert_eq!(&cursors[..2], &["0-0".to_string(), "5-0".to_string()]);
    }

    #[tokio::test]
    async fn test_slow_client_sheds_tokens_but_not_terminal() {
        let reader = Arc::new(MockChannelReader::new());
        reader
            .push_window(vec![
                envelope("1-0", token(0)),
                envelope("1-1", token(1)),
                envelope("1-2", token(2)),
                envelope("1-3", token(3)),
            ])
            .await;
        reader.push_window(vec![envelope("2-0", done())]).await;

        let config = SseConfig {
            queue_capacity: 2,
            ..test_config()
        };
        let (mut rx, _handle) = spawn_session(reader, config, EntryId::start());

        // Let the session fill the queue and hit the shed path before
        // draining anything.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].event, token(0));
        assert_eq!(frames[1].event, token(1));
        assert_eq!(frames[2].event, done());
    }

    #[tokio::test]
    async fn test_read_failure_emits_retryable_error_frame() {
        let reader = Arc::new(MockChannelReader::new());
        reader.set_fail_next(true).await;

        let (mut rx, _handle) = spawn_session(reader, test_config(), EntryId::start());

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.id, None);
        match frame.event {
            StreamEvent::Error {
                code, retryable, ..
            } => {
                assert_eq!(code, "STREAM_READ");
                assert!(retryable);
            }
            other => panic!("expected error frame, got {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_deadline_ends_session_with_timeout_frame() {
        let config = SseConfig {
            hard_timeout_secs: 1,
            ..test_config()
        };
        let reader = Arc::new(MockChannelReader::new());
        let (mut rx, _handle) = spawn_session(reader, config, EntryId::start());

        let mut last = None;
        while let Some(frame) = rx.recv().await {
            last = Some(frame);
        }

        match last.unwrap().event {
            StreamEvent::Error {
                code, retryable, ..
            } => {
                assert_eq!(code, "TIMEOUT");
                assert!(retryable);
            }
            other => panic!("expected timeout frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_client_disconnect_stops_session() {
        let reader = Arc::new(MockChannelReader::new());
        let (rx, handle) = spawn_session(reader, test_config(), EntryId::start());

        drop(rx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
