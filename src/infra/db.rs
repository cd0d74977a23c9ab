use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::info;

/// Webhook traffic is bursty but each request touches few rows; a small
/// pool shared with the reconciliation worker is plenty.
pub async fn init_db(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Postgres connection failed (check DATABASE_URL): {e}"))?;

    info!("Connected to database");
    Ok(pool)
}
