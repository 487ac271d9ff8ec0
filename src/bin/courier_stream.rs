//! courier-stream: Live stream service
//!
//! Serves job channels to clients as resumable SSE streams and bridges
//! configured channels from Redis Streams into the local fan-out via a
//! consumer group. Reconnecting clients resume exactly from their
//! `Last-Event-ID`.
//!
//! ## Architecture
//! ```text
//! [Redis Streams] -> [courier-stream] <- [GET /channels/{job_id}/events]
//!        |                  |                        |
//!        v                  v                        v
//!   (XREADGROUP)        [fan-out]              [SSE session]
//! ```
//!
//! ## Configuration
//! - COURIER_CONFIG: Path to config file (default: config.yaml)
//! - COURIER_REDIS_URL: Redis connection string
//! - COURIER_SERVER_HOST: HTTP bind host (default: 0.0.0.0)
//! - COURIER_SERVER_PORT: HTTP bind port (default: 8080)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier::config::Config;
use courier::retry::RetryPolicy;
use courier::sse::{router, AppState};
use courier::stream::{
    self, spawn_bridge, ChannelKey, Fanout, RedisChannelReader, RedisGroupSource, StreamBridge,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("COURIER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting courier-stream service");

    // Connect to Redis with retry
    let conn = {
        let max_retries = 30;
        let mut delay = Duration::from_millis(100);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match stream::connect(&config.redis.url).await {
                Ok(conn) => break conn,
                Err(e) if attempt < max_retries => {
                    warn!(
                        "Failed to connect to Redis (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt, max_retries, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(5));
                }
                Err(e) => {
                    error!(
                        "Failed to connect to Redis after {} attempts: {}",
                        max_retries, e
                    );
                    return Err(e.into());
                }
            }
        }
    };

    let retry = RetryPolicy::from(&config.retry);

    // Bridge configured channels into the local fan-out
    let fanout = Arc::new(Fanout::new());
    let mut bridge_handles = Vec::new();
    for bridge in &config.stream.bridges {
        let channel = ChannelKey::new(bridge.job_id, bridge.user_id);
        let source = Arc::new(RedisGroupSource::new(
            conn.clone(),
            config.redis.key_prefix.clone(),
            &config.stream,
        ));
        let bridge = StreamBridge::new(source, fanout.clone(), channel, &config.stream, retry);
        bridge_handles.push(spawn_bridge(bridge));
    }
    if !bridge_handles.is_empty() {
        info!(
            "Bridging {} channel(s) into the local fan-out",
            bridge_handles.len()
        );
    }

    let state = AppState {
        reader: Arc::new(RedisChannelReader::new(
            conn,
            config.redis.key_prefix.clone(),
        )),
        config: config.sse.clone(),
    };

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Stream service listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    for handle in bridge_handles {
        handle.stop();
    }

    Ok(())
}
