// src/config.rs
use std::time::Duration;

use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{QueueError, Result};
use crate::executor::ShellRunner;
use crate::runner::WorkerPool;
use crate::store::JobStore;
use crate::utils::constants::{
    BACKOFF_BASE, DEFAULT_CONCURRENCY, DEFAULT_DATABASE_URL, DEFAULT_MAX_CONNECTIONS,
    KEY_BACKOFF_BASE, KEY_MAX_RETRIES, MAX_RETRIES, POLL_INTERVAL,
};

/// Process-level settings for running a queue.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub database_url: String,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub max_connections: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval: POLL_INTERVAL,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl QueueConfig {
    pub fn new(database_url: impl Into<String>, concurrency: usize) -> Self {
        Self {
            database_url: database_url.into(),
            concurrency,
            ..Default::default()
        }
    }

    /// Read `QUEUECTL_*` environment variables over the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("QUEUECTL_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(n) = env_number::<usize>("QUEUECTL_CONCURRENCY")? {
            config.concurrency = n;
        }
        if let Some(ms) = env_number::<u64>("QUEUECTL_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = env_number::<u32>("QUEUECTL_MAX_CONNECTIONS")? {
            config.max_connections = n;
        }

        Ok(config)
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Open the store this config points at.
    pub async fn open_store(&self) -> Result<JobStore> {
        JobStore::open(&self.database_url, self.max_connections).await
    }

    /// Open the store and start a worker pool running shell commands.
    pub async fn initialize(&self) -> Result<WorkerPool> {
        let store = self.open_store().await?;
        let pool = WorkerPool::new(Engine::new(store, ShellRunner), self.concurrency)
            .with_poll_interval(self.poll_interval);

        pool.start();
        info!(
            concurrency = self.concurrency,
            database_url = %self.database_url,
            "worker pool started"
        );
        Ok(pool)
    }
}

fn env_number<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| QueueError::InvalidConfig {
                key: name.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

/// Retry policy values read from the `config` table.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub backoff_base: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            backoff_base: BACKOFF_BASE,
        }
    }
}

impl RetrySettings {
    /// Unparsable stored values fall back to the defaults with a warning.
    pub async fn load(store: &JobStore) -> Result<Self> {
        let max_retries = match store.get_config(KEY_MAX_RETRIES).await? {
            Some(raw) => raw.trim().parse::<u32>().unwrap_or_else(|_| {
                warn!(value = %raw, "ignoring invalid max_retries");
                MAX_RETRIES
            }),
            None => MAX_RETRIES,
        };

        let backoff_base = match store.get_config(KEY_BACKOFF_BASE).await? {
            Some(raw) => match raw.trim().parse::<f64>() {
                Ok(base) if base.is_finite() && base >= 0.0 => base,
                _ => {
                    warn!(value = %raw, "ignoring invalid backoff_base");
                    BACKOFF_BASE
                }
            },
            None => BACKOFF_BASE,
        };

        Ok(Self {
            max_retries,
            backoff_base,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_settings_follow_config_table() {
        let store = JobStore::in_memory().await.unwrap();
        assert_eq!(RetrySettings::load(&store).await.unwrap(), RetrySettings::default());

        store.set_config("max_retries", "7").await.unwrap();
        store.set_config("backoff_base", "1.5").await.unwrap();
        let settings = RetrySettings::load(&store).await.unwrap();
        assert_eq!(settings.max_retries, 7);
        assert_eq!(settings.backoff_base, 1.5);
    }

    #[tokio::test]
    async fn bad_stored_values_fall_back() {
        let store = JobStore::in_memory().await.unwrap();
        sqlx::query("UPDATE config SET value = 'lots' WHERE key = 'max_retries'")
            .execute(store.pool())
            .await
            .unwrap();

        let settings = RetrySettings::load(&store).await.unwrap();
        assert_eq!(settings.max_retries, MAX_RETRIES);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = QueueConfig::new("sqlite::memory:", 4).with_poll_interval(Duration::from_millis(50));
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.poll_interval, Duration::from_millis(50));
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
    }
}
