//! PostgreSQL implementations of the log and outbox stores.

mod log_store;
mod outbox_store;

pub use log_store::PostgresLogStore;
pub use outbox_store::{enqueue_in, PostgresOutboxStore};

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::PostgresConfig;
use crate::storage::Result;

/// Connect a pool with the configured size.
pub async fn connect(config: &PostgresConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await?;
    Ok(pool)
}

/// Serialization failures and deadlocks abort one transaction of a
/// conflicting pair; the whole transaction is safe to rerun.
pub(crate) fn is_serialization_failure(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("40001") | Some("40P01"))
        }
        _ => false,
    }
}
