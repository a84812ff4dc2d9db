// src/lib.rs
//! A single-node background job queue for shell commands, backed by SQLite.

pub mod config;
pub mod dashboard;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod job;
pub mod queue;
pub mod routes;
pub mod runner;
pub mod services;
pub mod store;
pub mod utils;

pub use config::{QueueConfig, RetrySettings};
pub use engine::{backoff_delay, Engine, Outcome, Phase, PoolState, WorkerContext};
pub use error::{QueueError, Result};
pub use executor::{CommandRunner, Execution, ExecutionOutcome, ShellRunner};
pub use job::{DlqEntry, Job, JobState, NewJob};
pub use queue::{enqueue, enqueue_in, enqueue_json, parse_request, EnqueuedJob, JobRequest, ScheduleAt};
pub use runner::WorkerPool;
pub use store::{ActiveWorker, JobStore, StateCounts};
