use crate::config::DatabaseSettings;
use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// Connection pool for the pipeline store. Sized small: each worker is
/// single-threaded inside its tick and coordination happens via
/// row-level locks, not via connection fan-out.
pub async fn connect(settings: &DatabaseSettings) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&settings.url())
        .await
        .with_context(|| {
            format!(
                "failed to connect to postgres at {}:{}",
                settings.host, settings.port
            )
        })
}
