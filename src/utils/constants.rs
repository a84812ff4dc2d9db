use std::time::Duration;

pub const MAX_RETRIES: u32 = 3;
pub const BACKOFF_BASE: f64 = 2.0;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PRIORITY: i64 = 0;

pub const DEFAULT_PAGE: usize = 1;
pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 500;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/queue.db";
pub const DEFAULT_CONCURRENCY: usize = 1;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const POLL_INTERVAL: Duration = Duration::from_millis(300);
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Stored `last_error` text is cut to this many bytes.
pub const MAX_ERROR_LEN: usize = 4096;

pub const KEY_MAX_RETRIES: &str = "max_retries";
pub const KEY_BACKOFF_BASE: &str = "backoff_base";
