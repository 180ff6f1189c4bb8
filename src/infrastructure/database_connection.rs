// Local SQLite store for update history and code exclusions

use anyhow::{Context, Result};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

pub struct DatabaseConnection {
    pool: SqlitePool,
}

fn file_path(database_url: &str) -> Option<&str> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))
        .unwrap_or(database_url);
    let path = path.split('?').next().unwrap_or(path);
    (!path.is_empty() && !path.contains(":memory:")).then_some(path)
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> Result<Self> {
        let in_memory = file_path(database_url).is_none();

        if let Some(parent) = file_path(database_url).and_then(|p| Path::new(p).parent()) {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create database directory {parent:?}"))?;
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {database_url}"))?
            .create_if_missing(true);

        // every pooled connection to :memory: would be a separate database
        let mut pool_options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            // closing the only connection would drop the database
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database {database_url}"))?;

        debug!("Opened history database {}", database_url);
        Ok(Self { pool })
    }

    /// Fresh in-memory database with the schema applied.
    pub async fn in_memory() -> Result<Self> {
        let db = Self::new("sqlite::memory:").await?;
        db.migrate().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        let create_batches_sql = r"
            CREATE TABLE IF NOT EXISTS update_batches (
                batch_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                old_code TEXT,
                new_code TEXT,
                store_id INTEGER,
                partial BOOLEAN NOT NULL DEFAULT 0,
                total_updated INTEGER NOT NULL DEFAULT 0,
                batch_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
        ";

        let create_exclusions_sql = r"
            CREATE TABLE IF NOT EXISTS exclusions (
                store_id INTEGER NOT NULL,
                code TEXT NOT NULL,
                reason TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (store_id, code)
            )
        ";

        let create_indexes_sql = r"
            CREATE INDEX IF NOT EXISTS idx_batches_created_at ON update_batches (created_at);
            CREATE INDEX IF NOT EXISTS idx_batches_old_code ON update_batches (old_code);
        ";

        sqlx::query(create_batches_sql).execute(&self.pool).await?;
        sqlx::query(create_exclusions_sql).execute(&self.pool).await?;
        sqlx::query(create_indexes_sql).execute(&self.pool).await?;

        info!("History database schema ready");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_path_strips_scheme() {
        assert_eq!(file_path("sqlite:///tmp/a.db"), Some("/tmp/a.db"));
        assert_eq!(file_path("sqlite:data/a.db?mode=rwc"), Some("data/a.db"));
        assert_eq!(file_path("sqlite::memory:"), None);
    }

    #[tokio::test]
    async fn creates_missing_file_and_directory() -> Result<()> {
        let temp_dir = tempdir()?;
        let db_path = temp_dir.path().join("nested").join("history.db");
        let database_url = format!("sqlite:{}", db_path.display());

        let db = DatabaseConnection::new(&database_url).await?;
        db.migrate().await?;

        assert!(db_path.exists());
        assert!(!db.pool().is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn migration_is_repeatable() -> Result<()> {
        let db = DatabaseConnection::in_memory().await?;
        db.migrate().await?;

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await?;
        let names: Vec<_> = tables.into_iter().map(|(n,)| n).collect();
        assert_eq!(names, vec!["exclusions", "update_batches"]);
        Ok(())
    }
}
