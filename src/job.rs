// src/job.rs
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Lifecycle of a job row.
///
/// `pending -> processing -> completed | pending (retry) | dead`. A graceful
/// shutdown may also write a failed job back as `processing` so that the
/// same worker keeps it until the retry resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "dead" => Ok(JobState::Dead),
            other => Err(QueueError::Validation(format!("unknown job state '{other}'"))),
        }
    }
}

/// A job as stored in the `jobs` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub priority: i64,
    /// `None` only after an immediate shutdown reset; such rows are eligible
    /// right away.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Advisory execution budget in milliseconds. Not enforced.
    pub timeout_ms: u64,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
}

impl Job {
    /// Whether the claim protocol may pick this row at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.scheduled_at.map_or(true, |at| at <= now)
    }
}

/// Everything needed to insert a fresh `pending` row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: String,
    pub command: String,
    pub max_retries: u32,
    pub priority: i64,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Terminal record of a job that ran out of retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DlqEntry {
    pub id: String,
    pub command: String,
    pub attempts: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}
