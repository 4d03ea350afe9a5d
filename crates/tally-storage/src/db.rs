use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::error::StoreError;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://tally.db";

/// Handle on the relational store holding users, tickets, and time entries.
#[derive(Debug, Clone)]
pub struct TimeDb {
    pool: SqlitePool,
}

impl TimeDb {
    /// Open the store and bring its schema up to date.
    ///
    /// The pool holds a single connection: ingestion is one writer applying one
    /// batch at a time, and an in-memory store lives only as long as its
    /// connection.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let connectivity = |source| StoreError::Connectivity {
            url: database_url.to_string(),
            source,
        };
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(connectivity)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(connectivity)?;

        let db = Self { pool };
        db.migrate().await?;
        info!(database_url, "store connected");
        Ok(db)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn migrations_create_tables_and_indexes() {
        let db = TimeDb::connect("sqlite::memory:").await.unwrap();
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type IN ('table', 'index') AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx%' ORDER BY name",
        )
        .fetch_all(db.pool())
        .await
        .unwrap();
        for expected in [
            "idx_tickets_source",
            "idx_tickets_title",
            "idx_time_entries_source",
            "idx_time_entries_ticket",
            "idx_time_entries_user",
            "idx_users_email",
            "tickets",
            "time_entries",
            "users",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}: {names:?}");
        }
    }

    #[tokio::test]
    async fn reconnecting_to_a_file_store_is_idempotent() {
        let dir = tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("tally.db").display());
        let first = TimeDb::connect(&url).await.unwrap();
        first.close().await;
        let second = TimeDb::connect(&url).await.unwrap();
        second.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn unopenable_store_is_a_connectivity_error() {
        let dir = tempdir().unwrap();
        let url = format!(
            "sqlite://{}",
            dir.path().join("missing").join("tally.db").display()
        );
        let err = TimeDb::connect(&url).await.unwrap_err();
        assert!(matches!(err, StoreError::Connectivity { .. }), "got {err}");
    }
}
