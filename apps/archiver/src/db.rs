use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

/// Creates the PostgreSQL connection pool.
///
/// The pool is deliberately small: concurrent org tasks cooperate by blocking
/// on acquisition rather than fanning out connections. Every connection is
/// forced to UTC so timestamp arithmetic in queries matches the archive
/// window math done in Rust.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    info!("connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET TIME ZONE 'UTC'").await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    info!("PostgreSQL connection pool established");
    Ok(pool)
}
