// src/db.rs
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::error::Result;
use crate::utils::constants::{
    BACKOFF_BASE, BUSY_TIMEOUT, DEFAULT_TIMEOUT_MS, KEY_BACKOFF_BASE, KEY_MAX_RETRIES, MAX_RETRIES,
};

/// Open a pool against `database_url` and make sure the schema exists.
///
/// The parent directory of a file-backed database is created on demand.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let filename = options.get_filename();
    if let Some(parent) = filename.parent() {
        if !parent.as_os_str().is_empty() && filename.as_os_str() != ":memory:" {
            std::fs::create_dir_all(parent)?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    debug!(database_url, max_connections, "job store ready");
    Ok(pool)
}

/// A private in-memory database. Pinned to one connection that never
/// expires, since every SQLite memory connection is its own database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Create tables and seed config defaults. Safe to run on every startup.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    let jobs = format!(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id           TEXT PRIMARY KEY,
            command      TEXT NOT NULL,
            state        TEXT NOT NULL,
            attempts     INTEGER NOT NULL DEFAULT 0,
            max_retries  INTEGER NOT NULL DEFAULT {MAX_RETRIES},
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL,
            scheduled_at INTEGER NULL,
            priority     INTEGER NOT NULL DEFAULT 0,
            timeout      INTEGER NOT NULL DEFAULT {DEFAULT_TIMEOUT_MS},
            worker_id    TEXT NULL,
            last_error   TEXT NULL
        )
        "#
    );
    sqlx::query(&jobs).execute(pool).await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(state, priority)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dlq (
            id          TEXT PRIMARY KEY,
            command     TEXT NOT NULL,
            attempts    INTEGER NOT NULL,
            max_retries INTEGER NOT NULL,
            last_error  TEXT NULL,
            created_at  TEXT NOT NULL,
            failed_at   TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS config (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for (key, value) in [
        (KEY_MAX_RETRIES, MAX_RETRIES.to_string()),
        (KEY_BACKOFF_BASE, BACKOFF_BASE.to_string()),
    ] {
        sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)")
            .bind(key)
            .bind(value)
            .execute(pool)
            .await?;
    }

    Ok(())
}
