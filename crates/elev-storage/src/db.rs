use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

/// Opens the cache database, creating the file if needed.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url {database_url}"))?;
    connect_with(options).await
}

pub async fn connect_path(path: &Path) -> Result<SqlitePool> {
    connect_with(SqliteConnectOptions::new().filename(path)).await
}

async fn connect_with(options: SqliteConnectOptions) -> Result<SqlitePool> {
    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
    }

    let options = options
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    // Transactions here read before they write; a single connection keeps
    // them from failing on a stale snapshot when workers run concurrently.
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("connecting to cache database")
}

/// Read-only pool for downstream readers. In WAL mode these connections see the
/// last committed state and never wait on the writer.
pub async fn connect_reader(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url {database_url}"))?
        .read_only(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await
        .context("connecting read pool to cache database")
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("running cache migrations")
}

/// Connect and migrate in one step.
pub async fn open(database_url: &str) -> Result<SqlitePool> {
    let pool = connect(database_url).await?;
    migrate(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_create_the_cache_tables() {
        let dir = tempfile::tempdir().unwrap();
        let pool = connect_path(&dir.path().join("nested/cache.db")).await.unwrap();
        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        for expected in [
            "artifacts",
            "directories",
            "elevations",
            "error_log",
            "glass_specs",
            "phases",
            "projects",
            "sync_marks",
            "sync_policies",
            "sync_runs",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}: {tables:?}");
        }
    }

    #[tokio::test]
    async fn reader_pool_sees_commits_and_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("cache.db").display());
        let writer = open(&url).await.unwrap();
        let reader = connect_reader(&url, 2).await.unwrap();

        sqlx::query("INSERT INTO directories (external_id, name, created_at, updated_at)
             VALUES ('D1', 'North', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')")
            .execute(&writer)
            .await
            .unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM directories")
            .fetch_one(&reader)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let write = sqlx::query("DELETE FROM directories").execute(&reader).await;
        assert!(write.is_err());
    }
}
