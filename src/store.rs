// src/store.rs
//! SQLite persistence for jobs, the dead-letter queue and operator config.
//!
//! Every mutating transaction starts with a write statement, so SQLite takes
//! the write lock up front and the busy timeout serializes competing
//! workers instead of failing them.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::db;
use crate::error::{QueueError, Result};
use crate::job::{DlqEntry, Job, JobState, NewJob};
use crate::utils::constants::{KEY_BACKOFF_BASE, KEY_MAX_RETRIES};
use crate::utils::pagination::Pagination;

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, created_at, updated_at, \
                           scheduled_at, priority, timeout, worker_id, last_error";

/// Handle to the durable store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

/// Job counts per state plus the DLQ size.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateCounts {
    pub jobs: BTreeMap<String, i64>,
    pub dlq_count: i64,
}

impl StateCounts {
    pub fn get(&self, state: JobState) -> i64 {
        self.jobs.get(state.as_str()).copied().unwrap_or(0)
    }
}

/// A worker currently holding at least one `processing` job.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveWorker {
    pub worker_id: String,
    pub jobs: i64,
    pub since: String,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(database_url: &str, max_connections: u32) -> Result<Self> {
        Ok(Self::new(db::connect(database_url, max_connections).await?))
    }

    pub async fn in_memory() -> Result<Self> {
        Ok(Self::new(db::connect_in_memory().await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---------------------------------------------------------------
    // admission
    // ---------------------------------------------------------------

    /// Insert a fresh `pending` row. An existing row with the same id is
    /// overwritten; avoiding collisions is the caller's business.
    pub async fn insert_job(&self, job: &NewJob) -> Result<()> {
        let created_at = format_ts(job.created_at);
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, command, state, attempts, max_retries, created_at, updated_at,
                scheduled_at, priority, timeout, worker_id, last_error
            )
            VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?4, ?5, ?6, ?7, NULL, NULL)
            ON CONFLICT(id) DO UPDATE SET
                command      = excluded.command,
                state        = 'pending',
                attempts     = 0,
                max_retries  = excluded.max_retries,
                created_at   = excluded.created_at,
                updated_at   = excluded.updated_at,
                scheduled_at = excluded.scheduled_at,
                priority     = excluded.priority,
                timeout      = excluded.timeout,
                worker_id    = NULL,
                last_error   = NULL
            "#,
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(i64::from(job.max_retries))
        .bind(&created_at)
        .bind(job.scheduled_at.map(|at| at.timestamp_millis()))
        .bind(job.priority)
        .bind(clamp_i64(job.timeout_ms))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---------------------------------------------------------------
    // claim and transitions
    // ---------------------------------------------------------------

    /// Atomically pick the next eligible job and hand it to `worker_id`.
    ///
    /// Order: priority desc, scheduled rows before unscheduled ones, earlier
    /// `scheduled_at`, then earlier `created_at`.
    pub async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'processing', worker_id = ?1, updated_at = ?2
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'pending'
                  AND (scheduled_at IS NULL OR scheduled_at <= ?3)
                ORDER BY priority DESC,
                         (scheduled_at IS NULL) ASC,
                         scheduled_at ASC,
                         created_at ASC
                LIMIT 1
            )
            AND state = 'pending'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(format_ts(now))
            .bind(now.timestamp_millis())
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;
        row.map(|row| job_from_row(&row)).transpose()
    }

    /// `processing -> completed`, only while `worker_id` still owns the row.
    pub async fn mark_completed(
        &self,
        job_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed', updated_at = ?1
            WHERE id = ?2 AND state = 'processing' AND worker_id = ?3
            "#,
        )
        .bind(format_ts(now))
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        ensure_owned(result.rows_affected(), job_id, worker_id)
    }

    /// Record a failed attempt that still has retries left.
    ///
    /// With `hold` the row stays `processing` under `worker_id` so nobody
    /// else picks it up while its owner drains; otherwise it goes back to
    /// `pending` with no owner.
    pub async fn schedule_retry(
        &self,
        job_id: &str,
        worker_id: &str,
        attempts: u32,
        run_at: DateTime<Utc>,
        last_error: &str,
        hold: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (state, owner) = if hold {
            (JobState::Processing, Some(worker_id))
        } else {
            (JobState::Pending, None)
        };

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?1, attempts = ?2, scheduled_at = ?3, updated_at = ?4,
                last_error = ?5, worker_id = ?6
            WHERE id = ?7 AND state = 'processing' AND worker_id = ?8
            "#,
        )
        .bind(state.as_str())
        .bind(i64::from(attempts))
        .bind(run_at.timestamp_millis())
        .bind(format_ts(now))
        .bind(last_error)
        .bind(owner)
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        ensure_owned(result.rows_affected(), job_id, worker_id)
    }

    /// Mark the job `dead` and copy it into the DLQ in one transaction.
    pub async fn move_to_dlq(
        &self,
        job_id: &str,
        worker_id: &str,
        attempts: u32,
        last_error: &str,
        now: DateTime<Utc>,
    ) -> Result<DlqEntry> {
        let mut tx = self.pool.begin().await?;
        let failed_at = format_ts(now);

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'dead', attempts = ?1, last_error = ?2, updated_at = ?3
            WHERE id = ?4 AND state = 'processing' AND worker_id = ?5
            RETURNING id, command, attempts, max_retries, last_error, created_at
            "#,
        )
        .bind(i64::from(attempts))
        .bind(last_error)
        .bind(&failed_at)
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(stale(job_id, worker_id));
        };

        let entry = DlqEntry {
            id: row.try_get("id")?,
            command: row.try_get("command")?,
            attempts: get_u32(&row, "attempts")?,
            max_retries: get_u32(&row, "max_retries")?,
            last_error: row.try_get("last_error")?,
            created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
            failed_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO dlq (id, command, attempts, max_retries, last_error, created_at, failed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                command     = excluded.command,
                attempts    = excluded.attempts,
                max_retries = excluded.max_retries,
                last_error  = excluded.last_error,
                created_at  = excluded.created_at,
                failed_at   = excluded.failed_at
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.command)
        .bind(i64::from(entry.attempts))
        .bind(i64::from(entry.max_retries))
        .bind(&entry.last_error)
        .bind(format_ts(entry.created_at))
        .bind(&failed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(entry)
    }

    /// Put every `processing` job back to `pending`, unowned and
    /// immediately eligible. Returns the number of rows reset.
    pub async fn reset_processing(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', worker_id = NULL, scheduled_at = NULL, updated_at = ?1
            WHERE state = 'processing'
            "#,
        )
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await?;

        let reset = result.rows_affected();
        if reset > 0 {
            info!(reset, "reset processing jobs to pending");
        }
        Ok(reset)
    }

    /// Operator recovery for jobs stranded in `processing` by a crash.
    ///
    /// Only rows untouched since `older_than` are reset, so live work of a
    /// running pool is left alone as long as the threshold exceeds its
    /// longest command.
    pub async fn requeue_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', worker_id = NULL, scheduled_at = NULL, updated_at = ?1
            WHERE state = 'processing' AND updated_at < ?2
            "#,
        )
        .bind(format_ts(Utc::now()))
        .bind(format_ts(older_than))
        .execute(&self.pool)
        .await?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            warn!(requeued, cutoff = %older_than, "requeued stale processing jobs");
        }
        Ok(requeued)
    }

    // ---------------------------------------------------------------
    // dead-letter queue
    // ---------------------------------------------------------------

    /// Remove a DLQ entry and reinstate the job as a fresh `pending` row
    /// with zero attempts. The original `created_at` is kept.
    pub async fn retry_dead_letter(&self, id: &str) -> Result<Job> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            DELETE FROM dlq WHERE id = ?1
            RETURNING id, command, attempts, max_retries, last_error, created_at, failed_at
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(QueueError::NotFound(format!("dlq entry '{id}'")));
        };
        let entry = dlq_from_row(&row)?;
        let now = Utc::now();

        let sql = format!(
            r#"
            INSERT INTO jobs (
                id, command, state, attempts, max_retries, created_at, updated_at,
                scheduled_at, worker_id, last_error
            )
            VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?5, ?6, NULL, NULL)
            ON CONFLICT(id) DO UPDATE SET
                command      = excluded.command,
                state        = 'pending',
                attempts     = 0,
                max_retries  = excluded.max_retries,
                created_at   = excluded.created_at,
                updated_at   = excluded.updated_at,
                scheduled_at = excluded.scheduled_at,
                worker_id    = NULL,
                last_error   = NULL
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&entry.id)
            .bind(&entry.command)
            .bind(i64::from(entry.max_retries))
            .bind(format_ts(entry.created_at))
            .bind(format_ts(now))
            .bind(now.timestamp_millis())
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(job_id = %entry.id, "dlq entry requeued");
        job_from_row(&row)
    }

    pub async fn get_dead_letter(&self, id: &str) -> Result<Option<DlqEntry>> {
        let row = sqlx::query(
            "SELECT id, command, attempts, max_retries, last_error, created_at, failed_at \
             FROM dlq WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| dlq_from_row(&row)).transpose()
    }

    pub async fn list_dead_letters(&self, page: &Pagination) -> Result<Vec<DlqEntry>> {
        let rows = sqlx::query(
            "SELECT id, command, attempts, max_retries, last_error, created_at, failed_at \
             FROM dlq ORDER BY failed_at DESC LIMIT ?1 OFFSET ?2",
        )
        .bind(clamp_i64(page.limit as u64))
        .bind(clamp_i64(page.offset() as u64))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(dlq_from_row).collect()
    }

    // ---------------------------------------------------------------
    // reads
    // ---------------------------------------------------------------

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| job_from_row(&row)).transpose()
    }

    /// Newest first, optionally filtered by state.
    pub async fn list_jobs(&self, state: Option<JobState>, page: &Pagination) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE (?1 IS NULL OR state = ?1) \
             ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
        );
        let rows = sqlx::query(&sql)
            .bind(state.map(|s| s.as_str()))
            .bind(clamp_i64(page.limit as u64))
            .bind(clamp_i64(page.offset() as u64))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(job_from_row).collect()
    }

    pub async fn count_jobs(&self, state: Option<JobState>) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM jobs WHERE (?1 IS NULL OR state = ?1)",
        )
        .bind(state.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    pub async fn count_dead_letters(&self) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM dlq")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_by_state(&self) -> Result<StateCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS count FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = BTreeMap::new();
        for row in rows {
            jobs.insert(row.try_get::<String, _>("state")?, row.try_get::<i64, _>("count")?);
        }

        Ok(StateCounts {
            jobs,
            dlq_count: self.count_dead_letters().await?,
        })
    }

    pub async fn active_workers(&self) -> Result<Vec<ActiveWorker>> {
        let rows = sqlx::query(
            r#"
            SELECT worker_id, COUNT(*) AS jobs, MIN(updated_at) AS since
            FROM jobs
            WHERE state = 'processing' AND worker_id IS NOT NULL
            GROUP BY worker_id
            ORDER BY worker_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ActiveWorker {
                    worker_id: row.try_get("worker_id")?,
                    jobs: row.try_get("jobs")?,
                    since: row.try_get("since")?,
                })
            })
            .collect()
    }

    // ---------------------------------------------------------------
    // config table
    // ---------------------------------------------------------------

    pub async fn get_config(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    /// Store an operator setting. Known keys are validated first.
    pub async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        validate_config(key, value)?;

        sqlx::query(
            "INSERT INTO config (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn validate_config(key: &str, value: &str) -> Result<()> {
    let valid = match key {
        KEY_MAX_RETRIES => value.trim().parse::<u32>().is_ok(),
        KEY_BACKOFF_BASE => value
            .trim()
            .parse::<f64>()
            .map(|b| b.is_finite() && b >= 0.0)
            .unwrap_or(false),
        _ => true,
    };

    if valid {
        Ok(())
    } else {
        Err(QueueError::InvalidConfig {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

fn ensure_owned(rows_affected: u64, job_id: &str, worker_id: &str) -> Result<()> {
    if rows_affected == 0 {
        Err(stale(job_id, worker_id))
    } else {
        Ok(())
    }
}

fn stale(job_id: &str, worker_id: &str) -> QueueError {
    QueueError::StaleOwnership {
        job_id: job_id.to_string(),
        worker_id: worker_id.to_string(),
    }
}

/// Fixed-width UTC timestamps, so text order matches time order.
pub(crate) fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueueError::Corrupt(format!("invalid timestamp '{raw}': {e}")))
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn get_u32(row: &SqliteRow, column: &str) -> Result<u32> {
    let raw: i64 = row.try_get(column)?;
    u32::try_from(raw).map_err(|_| QueueError::Corrupt(format!("{column} out of range: {raw}")))
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let state: String = row.try_get("state")?;
    let scheduled_at = match row.try_get::<Option<i64>, _>("scheduled_at")? {
        Some(ms) => Some(
            DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| QueueError::Corrupt(format!("invalid scheduled_at {ms}")))?,
        ),
        None => None,
    };
    let timeout: i64 = row.try_get("timeout")?;

    Ok(Job {
        id: row.try_get("id")?,
        command: row.try_get("command")?,
        state: state
            .parse()
            .map_err(|_| QueueError::Corrupt(format!("unknown state '{state}'")))?,
        attempts: get_u32(row, "attempts")?,
        max_retries: get_u32(row, "max_retries")?,
        priority: row.try_get("priority")?,
        scheduled_at,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
        timeout_ms: u64::try_from(timeout).unwrap_or(0),
        worker_id: row.try_get("worker_id")?,
        last_error: row.try_get("last_error")?,
    })
}

fn dlq_from_row(row: &SqliteRow) -> Result<DlqEntry> {
    Ok(DlqEntry {
        id: row.try_get("id")?,
        command: row.try_get("command")?,
        attempts: get_u32(row, "attempts")?,
        max_retries: get_u32(row, "max_retries")?,
        last_error: row.try_get("last_error")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        failed_at: parse_ts(&row.try_get::<String, _>("failed_at")?)?,
    })
}
