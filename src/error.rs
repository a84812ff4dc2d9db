// src/error.rs

/// Errors surfaced by queue operations.
///
/// Command failures are not represented here: a job whose command exits
/// non-zero is recorded by the engine as a retry or a dead-letter and never
/// bubbles up as an error.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Malformed or incomplete job description. Nothing was persisted.
    #[error("invalid job: {0}")]
    Validation(String),

    /// Transaction or connectivity failure in the SQLite store.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// The job is no longer `processing` under this worker, so the
    /// transition was not applied.
    #[error("job {job_id} is no longer owned by {worker_id}")]
    StaleOwnership { job_id: String, worker_id: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid value for config key '{key}': {value}")]
    InvalidConfig { key: String, value: String },

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
