//! The shared state store: tables for users, groups, user sessions, and
//! group states, with CRUD, heartbeats, and change feeds. Backed by SQLite
//! via `sqlx`, in the same shape as a `Database` module: connection pool,
//! embedded migrations, a dedicated error taxonomy.

mod changefeed;
pub mod models;

mod groups;
mod users;

use crate::error::CoreError;
use changefeed::ChangeFeedHub;
use models::{Group, GroupState};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Transient-failure retry budget for `Store::connect`: retry with a short
/// backoff before giving up.
const CONNECT_RETRIES: u32 = 3;
const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    state_feeds: std::sync::Arc<ChangeFeedHub<GroupState>>,
    meta_feeds: std::sync::Arc<ChangeFeedHub<Group>>,
}

impl Store {
    /// Connect (or create) the backing SQLite database and run migrations.
    /// Retries transient connection failures with a short backoff before
    /// surfacing `StorageUnavailable`.
    pub async fn connect(path: &str) -> Result<Self, CoreError> {
        let mut attempt = 0;
        loop {
            match Self::try_connect(path).await {
                Ok(store) => return Ok(store),
                Err(e) if attempt < CONNECT_RETRIES => {
                    attempt += 1;
                    warn!(attempt, error = %e, "store connect failed, retrying");
                    tokio::time::sleep(CONNECT_BACKOFF * attempt).await;
                }
                Err(e) => {
                    return Err(CoreError::StorageUnavailable(e.to_string()));
                }
            }
        }
    }

    async fn try_connect(path: &str) -> Result<Self, sqlx::Error> {
        let pool = if path == ":memory:" {
            let options = SqliteConnectOptions::new()
                .filename("file::memory:")
                .shared_cache(true)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(5))
                .connect_with(options)
                .await?
        } else {
            if let Some(parent) = Path::new(path).parent()
                && !parent.as_os_str().is_empty()
            {
                let _ = std::fs::create_dir_all(parent);
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true);
            SqlitePoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(5))
                .connect_with(options)
                .await?
        };

        Self::run_migration_statements(&pool, include_str!("../../migrations/001_init.sql"))
            .await;

        info!(path = %path, "store connected");

        Ok(Self {
            pool,
            state_feeds: std::sync::Arc::new(ChangeFeedHub::default()),
            meta_feeds: std::sync::Arc::new(ChangeFeedHub::default()),
        })
    }

    /// Run each `;`-separated statement in a migration file individually;
    /// sqlx's SQLite driver does not execute multi-statement bodies in one
    /// `query()` call.
    async fn run_migration_statements(pool: &SqlitePool, migration: &str) {
        for statement in migration.split(';') {
            let stmt = statement.trim();
            if stmt.is_empty() || stmt.lines().all(|l| l.trim().is_empty() || l.trim_start().starts_with("--")) {
                continue;
            }
            if let Err(e) = sqlx::query(stmt).execute(pool).await {
                let msg = e.to_string();
                if !msg.contains("already exists") {
                    warn!(sql = %stmt, error = %msg, "migration statement failed");
                }
            }
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn map_sqlx_err(e: sqlx::Error) -> CoreError {
    CoreError::StorageUnavailable(e.to_string())
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}
