use std::str::FromStr;
use std::time::Duration;

use mender_core::config::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

pub type DbPool = sqlx::SqlitePool;

pub async fn connect(database_url: &str) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(database_url, 5, 30).await
}

pub async fn connect_config(config: &DatabaseConfig) -> Result<DbPool, sqlx::Error> {
    connect_with_settings(&config.url, config.max_connections, config.timeout_secs).await
}

/// Opens a pool, creating the database file when it does not exist yet.
///
/// `sqlite::memory:` gives every connection its own database, so callers
/// sharing state through an in-memory pool must pass `max_connections = 1`.
pub async fn connect_with_settings(
    database_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<DbPool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON").execute(&mut *conn).await?;
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await
}

#[cfg(test)]
mod tests {
    use mender_core::config::DatabaseConfig;
    use sqlx::Row;

    use super::{connect_config, connect_with_settings};

    #[tokio::test]
    async fn memory_pool_enables_foreign_keys() {
        let pool = connect_with_settings("sqlite::memory:", 1, 5).await.expect("connect");

        let enabled = sqlx::query("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await
            .expect("pragma")
            .get::<i64, _>(0);

        assert_eq!(enabled, 1);
    }

    #[tokio::test]
    async fn connect_config_uses_the_configured_url() {
        let config = DatabaseConfig {
            url: "sqlite::memory:".to_owned(),
            max_connections: 1,
            timeout_secs: 5,
        };

        let pool = connect_config(&config).await.expect("connect");
        let one = sqlx::query("SELECT 1 AS one")
            .fetch_one(&pool)
            .await
            .expect("select")
            .get::<i64, _>("one");

        assert_eq!(one, 1);
    }
}
