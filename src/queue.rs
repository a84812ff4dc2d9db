// src/queue.rs
use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::RetrySettings;
use crate::error::{QueueError, Result};
use crate::job::NewJob;
use crate::store::JobStore;
use crate::utils::constants::{DEFAULT_PRIORITY, DEFAULT_TIMEOUT_MS};

/// A job description as submitted by a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub scheduled_at: Option<ScheduleAt>,
    /// Seconds from admission. Exclusive with `scheduled_at`.
    #[serde(default)]
    pub delay: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Milliseconds. Stored, not enforced.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl JobRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: Some(command.into()),
            ..Default::default()
        }
    }
}

/// Absolute schedule: epoch milliseconds or an RFC 3339 timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleAt {
    Millis(i64),
    Text(String),
}

impl ScheduleAt {
    fn resolve(&self) -> Result<DateTime<Utc>> {
        match self {
            ScheduleAt::Millis(ms) => DateTime::from_timestamp_millis(*ms).ok_or_else(|| {
                QueueError::Validation(format!("scheduled_at out of range: {ms}"))
            }),
            ScheduleAt::Text(raw) => DateTime::parse_from_rfc3339(raw.trim())
                .map(|at| at.with_timezone(&Utc))
                .map_err(|e| QueueError::Validation(format!("bad scheduled_at '{raw}': {e}"))),
        }
    }
}

/// The effective identifiers of an admitted job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnqueuedJob {
    pub id: String,
    pub command: String,
    pub max_retries: u32,
    pub priority: i64,
}

/// Validate `request`, fill in defaults and insert one `pending` row.
pub async fn enqueue(store: &JobStore, request: JobRequest) -> Result<EnqueuedJob> {
    let command = match request.command.as_deref().map(str::trim) {
        Some(command) if !command.is_empty() => command.to_string(),
        _ => return Err(QueueError::Validation("job must have a command".into())),
    };

    let now = Utc::now();
    let scheduled_at = match (&request.scheduled_at, request.delay) {
        (Some(_), Some(_)) => {
            return Err(QueueError::Validation(
                "use either scheduled_at or delay, not both".into(),
            ))
        }
        (Some(at), None) => at.resolve()?,
        (None, Some(secs)) => i64::try_from(secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or_else(|| QueueError::Validation(format!("delay too large: {secs}")))?,
        (None, None) => now,
    };

    let id = match request.id.map(|id| id.trim().to_string()) {
        Some(id) if !id.is_empty() => id,
        _ => nanoid!(),
    };
    let max_retries = match request.max_retries {
        Some(n) => n,
        None => RetrySettings::load(store).await?.max_retries,
    };
    let priority = request.priority.unwrap_or(DEFAULT_PRIORITY);

    store
        .insert_job(&NewJob {
            id: id.clone(),
            command: command.clone(),
            max_retries,
            priority,
            scheduled_at: Some(scheduled_at),
            timeout_ms: request.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            created_at: now,
        })
        .await?;

    info!(job_id = %id, priority, max_retries, %scheduled_at, "job enqueued");
    Ok(EnqueuedJob {
        id,
        command,
        max_retries,
        priority,
    })
}

/// Parse a JSON object into a [`JobRequest`] without admitting it.
pub fn parse_request(raw: &str) -> Result<JobRequest> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| QueueError::Validation(format!("invalid JSON: {e}")))?;
    if !value.is_object() {
        return Err(QueueError::Validation("job must be a JSON object".into()));
    }
    serde_json::from_value(value).map_err(|e| QueueError::Validation(e.to_string()))
}

/// Admit a job from raw JSON text.
pub async fn enqueue_json(store: &JobStore, raw: &str) -> Result<EnqueuedJob> {
    enqueue(store, parse_request(raw)?).await
}

/// Admit a job that becomes eligible `delay_secs` from now.
pub async fn enqueue_in(
    store: &JobStore,
    mut request: JobRequest,
    delay_secs: u64,
) -> Result<EnqueuedJob> {
    request.scheduled_at = None;
    request.delay = Some(delay_secs);
    enqueue(store, request).await
}
