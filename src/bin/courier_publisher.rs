//! courier-publisher: Outbox publisher service
//!
//! Drains the transactional outbox into the broker. Claims due pending
//! records in batches, publishes them with at-least-once semantics, and
//! schedules failed attempts with exponential backoff. A periodic sweep
//! returns claims abandoned by crashed instances to the queue.
//!
//! ## Architecture
//! ```text
//! [Postgres outbox] -> [courier-publisher] -> [Kafka]
//!        ^                     |
//!        |                     v
//!    (claim/mark)       (retry schedule)
//! ```
//!
//! ## Configuration
//! - COURIER_CONFIG: Path to config file (default: config.yaml)
//! - COURIER_POSTGRES_URL: Postgres connection string
//! - COURIER_BROKER_TYPE: Broker backend (noop, kafka)
//! - COURIER_KAFKA_BROKERS: Kafka bootstrap servers

use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use courier::bus::{init_broker, spawn_publisher, OutboxPublisher};
use courier::config::Config;
use courier::retry::RetryPolicy;
use courier::storage::init_storage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
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

    info!("Starting courier-publisher service");

    let retry = RetryPolicy::from(&config.retry);

    // Connect to Postgres with retry
    let (_log_store, outbox_store) = {
        let max_retries = 30;
        let mut delay = Duration::from_millis(100);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match init_storage(&config.postgres, retry).await {
                Ok(stores) => break stores,
                Err(e) if attempt < max_retries => {
                    warn!(
                        "Failed to connect to Postgres (attempt {}/{}): {}. Retrying in {:?}...",
                        attempt, max_retries, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(5));
                }
                Err(e) => {
                    error!(
                        "Failed to connect to Postgres after {} attempts: {}",
                        max_retries, e
                    );
                    return Err(e.into());
                }
            }
        }
    };

    let broker = init_broker(&config.broker).await?;

    let publisher = OutboxPublisher::new(outbox_store, broker, config.publisher.clone(), retry);
    let handle = spawn_publisher(publisher);

    info!("Outbox publisher running, press Ctrl+C to exit");

    tokio::signal::ctrl_c().await?;

    handle.stop();

    Ok(())
}
