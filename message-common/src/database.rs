use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::retry::RetryPolicy;
use crate::store::quote_identifier;
use crate::topics::TopicRouter;

/// Connect a pool to `database_url`, retrying with backoff while the database is unreachable.
pub async fn connect_with_retry(
    database_url: &str,
    max_connections: u32,
    retry_policy: &RetryPolicy,
) -> Result<PgPool, sqlx::Error> {
    let pool = retry_policy
        .retry(
            "connecting to postgres",
            |_: &sqlx::Error| true,
            || {
                PgPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(database_url)
            },
        )
        .await?;

    info!(max_connections, "connected to postgres");
    Ok(pool)
}

/// Create the relation of every routed topic if it does not exist yet.
///
/// Meant to run once at startup, before the ingestion path or any consumer touches the store.
pub async fn provision(pool: &PgPool, router: &TopicRouter) -> Result<(), sqlx::Error> {
    for route in router.routes() {
        let table = quote_identifier(&route.relation);
        let index = quote_identifier(&format!("{}_content_uniq", route.relation));

        sqlx::query(&format!(
            r#"
CREATE TABLE IF NOT EXISTS {table} (
    id BIGSERIAL PRIMARY KEY,
    content TEXT NOT NULL,
    processed BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
            "#
        ))
        .execute(pool)
        .await?;

        sqlx::query(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {index} ON {table} (md5(content))"
        ))
        .execute(pool)
        .await?;

        info!(relation = %route.relation, "provisioned relation");
    }

    Ok(())
}
