// src/engine.rs
//! Claim, execute and transition a single job.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::RetrySettings;
use crate::error::{QueueError, Result};
use crate::executor::{CommandRunner, ExecutionOutcome};
use crate::job::{Job, JobState};
use crate::store::JobStore;
use crate::utils::constants::MAX_BACKOFF;

/// Shutdown state broadcast by a pool to its workers. Only ever escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PoolState {
    Running,
    /// Graceful stop: take no new work, finish what is owned.
    Draining,
    /// Immediate stop: kill in-flight commands and leave.
    Aborting,
}

/// What the worker calling into the engine is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Claiming,
    /// Re-running a retry this worker kept ownership of while draining.
    CompletingRetry,
}

/// Per-call context handed to the engine by a worker loop.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    worker_id: String,
    shutdown: watch::Receiver<PoolState>,
    phase: Phase,
}

impl WorkerContext {
    pub fn new(worker_id: impl Into<String>, shutdown: watch::Receiver<PoolState>) -> Self {
        Self {
            worker_id: worker_id.into(),
            shutdown,
            phase: Phase::Claiming,
        }
    }

    /// A context with no pool behind it, e.g. for one-shot processing.
    pub fn detached(worker_id: impl Into<String>) -> Self {
        let (_tx, rx) = watch::channel(PoolState::Running);
        Self::new(worker_id, rx)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn pool_state(&self) -> PoolState {
        *self.shutdown.borrow()
    }

    /// Failed attempts keep their owner only during a graceful drain.
    pub fn holds_retries(&self) -> bool {
        self.pool_state() == PoolState::Draining
    }

    pub fn is_aborting(&self) -> bool {
        self.pool_state() == PoolState::Aborting
    }

    /// Resolves once the pool switches to `Aborting`. Never resolves for a
    /// detached context.
    pub async fn aborted(&self) {
        let mut rx = self.shutdown.clone();
        let aborted = rx
            .wait_for(|state| *state == PoolState::Aborting)
            .await
            .map(|_| ());
        if aborted.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Resolves on the next shutdown state change.
    pub async fn state_changed(&self) {
        let mut rx = self.shutdown.clone();
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// What happened to a job the engine worked on.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed {
        job_id: String,
    },
    Retrying {
        job_id: String,
        attempts: u32,
        run_at: DateTime<Utc>,
        /// Still `processing` under this worker.
        held: bool,
    },
    Dead {
        job_id: String,
        attempts: u32,
    },
    /// Killed by an immediate shutdown. No transition was written.
    Aborted {
        job_id: String,
    },
}

impl Outcome {
    pub fn job_id(&self) -> &str {
        match self {
            Outcome::Completed { job_id }
            | Outcome::Retrying { job_id, .. }
            | Outcome::Dead { job_id, .. }
            | Outcome::Aborted { job_id } => job_id,
        }
    }
}

/// `base ^ attempts` seconds, capped at [`MAX_BACKOFF`].
pub fn backoff_delay(base: f64, attempts: u32) -> Duration {
    let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
    let secs = base.powi(exponent);
    if !secs.is_finite() || secs < 0.0 {
        return MAX_BACKOFF;
    }
    Duration::try_from_secs_f64(secs)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

pub struct Engine<R: CommandRunner> {
    store: JobStore,
    runner: R,
}

impl<R: CommandRunner> Engine<R> {
    pub fn new(store: JobStore, runner: R) -> Self {
        Self { store, runner }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Claim the next eligible job and run it. `None` when nothing is due;
    /// the caller should back off before asking again.
    pub async fn process_one(&self, ctx: &WorkerContext) -> Result<Option<Outcome>> {
        let Some(job) = self.store.claim_next(ctx.worker_id(), Utc::now()).await? else {
            return Ok(None);
        };

        info!(
            worker_id = ctx.worker_id(),
            job_id = %job.id,
            attempts = job.attempts,
            "processing job"
        );
        self.execute(ctx, job).await.map(Some)
    }

    /// Re-run a retry this worker still owns.
    pub async fn process_held(&self, ctx: &WorkerContext, job_id: &str) -> Result<Outcome> {
        if ctx.phase() != Phase::CompletingRetry {
            return Err(QueueError::Validation(format!(
                "{} is not completing a retry",
                ctx.worker_id()
            )));
        }

        let job = self
            .store
            .get_job(job_id)
            .await?
            .filter(|job| {
                job.state == JobState::Processing
                    && job.worker_id.as_deref() == Some(ctx.worker_id())
            })
            .ok_or_else(|| QueueError::StaleOwnership {
                job_id: job_id.to_string(),
                worker_id: ctx.worker_id().to_string(),
            })?;

        info!(
            worker_id = ctx.worker_id(),
            job_id = %job.id,
            attempts = job.attempts,
            "re-running held retry"
        );
        self.execute(ctx, job).await
    }

    async fn execute(&self, ctx: &WorkerContext, job: Job) -> Result<Outcome> {
        if ctx.is_aborting() {
            return Ok(Outcome::Aborted { job_id: job.id });
        }

        let mut execution = match self.runner.spawn(&job.command) {
            Ok(execution) => execution,
            Err(e) => {
                let outcome = ExecutionOutcome::failure(format!("failed to start command: {e}"));
                return self.apply_failure(ctx, &job, &outcome).await;
            }
        };

        let finished = tokio::select! {
            outcome = execution.wait() => Some(outcome),
            _ = ctx.aborted() => None,
        };

        match finished {
            Some(outcome) if outcome.ok => {
                self.store
                    .mark_completed(&job.id, ctx.worker_id(), Utc::now())
                    .await?;
                info!(worker_id = ctx.worker_id(), job_id = %job.id, "job completed");
                Ok(Outcome::Completed { job_id: job.id })
            }
            Some(outcome) => self.apply_failure(ctx, &job, &outcome).await,
            None => {
                execution.kill().await;
                warn!(worker_id = ctx.worker_id(), job_id = %job.id, "command killed by shutdown");
                Ok(Outcome::Aborted { job_id: job.id })
            }
        }
    }

    async fn apply_failure(
        &self,
        ctx: &WorkerContext,
        job: &Job,
        outcome: &ExecutionOutcome,
    ) -> Result<Outcome> {
        let attempts = job.attempts.saturating_add(1);
        let last_error = outcome.error_text();
        let now = Utc::now();

        if attempts > job.max_retries {
            self.store
                .move_to_dlq(&job.id, ctx.worker_id(), attempts, &last_error, now)
                .await?;
            warn!(
                worker_id = ctx.worker_id(),
                job_id = %job.id,
                attempts,
                error = %last_error,
                "job moved to dlq"
            );
            return Ok(Outcome::Dead {
                job_id: job.id.clone(),
                attempts,
            });
        }

        let settings = RetrySettings::load(&self.store).await?;
        let delay = backoff_delay(settings.backoff_base, attempts);
        let run_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        let held = ctx.holds_retries();

        self.store
            .schedule_retry(&job.id, ctx.worker_id(), attempts, run_at, &last_error, held, now)
            .await?;
        debug!(error = %last_error, "attempt failed");
        info!(
            worker_id = ctx.worker_id(),
            job_id = %job.id,
            attempts,
            delay_ms = delay.as_millis() as u64,
            held,
            "job scheduled for retry"
        );

        Ok(Outcome::Retrying {
            job_id: job.id.clone(),
            attempts,
            run_at,
            held,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::executor::ShellRunner;
    use crate::job::NewJob;

    async fn engine() -> Engine<ShellRunner> {
        Engine::new(JobStore::in_memory().await.unwrap(), ShellRunner)
    }

    async fn add(engine: &Engine<ShellRunner>, id: &str, command: &str, max_retries: u32) {
        engine
            .store()
            .insert_job(&NewJob {
                id: id.to_string(),
                command: command.to_string(),
                max_retries,
                priority: 0,
                scheduled_at: Some(Utc::now()),
                timeout_ms: 30_000,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[test]
    fn backoff_grows_exponentially() {
        for attempts in 1..=6 {
            assert_eq!(
                backoff_delay(2.0, attempts),
                Duration::from_secs(2u64.pow(attempts))
            );
        }
        assert_eq!(backoff_delay(0.0, 3), Duration::ZERO);
        assert_eq!(backoff_delay(10.0, 40), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn nothing_due_returns_none() {
        let engine = engine().await;
        let ctx = WorkerContext::detached("w");
        assert_eq!(engine.process_one(&ctx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn success_completes_job() {
        let engine = engine().await;
        add(&engine, "ok", "true", 3).await;
        let ctx = WorkerContext::detached("w");

        let outcome = engine.process_one(&ctx).await.unwrap().unwrap();
        assert_eq!(outcome, Outcome::Completed { job_id: "ok".into() });

        let job = engine.store().get_job("ok").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn failure_schedules_backoff_retry() {
        let engine = engine().await;
        add(&engine, "flaky", "echo nope >&2; exit 1", 3).await;
        let ctx = WorkerContext::detached("w");

        let before = Utc::now();
        let outcome = engine.process_one(&ctx).await.unwrap().unwrap();
        let Outcome::Retrying { attempts, run_at, held, .. } = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        assert_eq!(attempts, 1);
        assert!(!held);

        let expected = before + chrono::Duration::seconds(2);
        assert!((run_at - expected).num_milliseconds().abs() < 1_000);

        let job = engine.store().get_job("flaky").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.worker_id, None);
        assert_eq!(job.last_error.as_deref(), Some("nope"));
        let stored = job.scheduled_at.unwrap();
        assert!((stored - run_at).num_milliseconds().abs() <= 1);

        // not eligible until the backoff passes
        assert_eq!(engine.process_one(&ctx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn exhausted_retries_land_in_dlq() {
        let engine = engine().await;
        engine.store().set_config("backoff_base", "0").await.unwrap();
        add(&engine, "doomed", "exit 1", 2).await;
        let ctx = WorkerContext::detached("w");

        let mut outcomes = Vec::new();
        while let Some(outcome) = engine.process_one(&ctx).await.unwrap() {
            outcomes.push(outcome);
        }

        assert_eq!(outcomes.len(), 3);
        assert_eq!(
            outcomes.last(),
            Some(&Outcome::Dead { job_id: "doomed".into(), attempts: 3 })
        );

        let job = engine.store().get_job("doomed").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        let entry = engine.store().get_dead_letter("doomed").await.unwrap().unwrap();
        assert_eq!(entry.attempts, 3);
        assert_eq!(entry.max_retries, 2);
        assert_eq!(entry.created_at, job.created_at);
        assert!(entry.last_error.is_some());
    }

    #[tokio::test]
    async fn dlq_retry_replays_the_same_failure_path() {
        let engine = engine().await;
        engine.store().set_config("backoff_base", "0").await.unwrap();
        add(&engine, "doomed", "exit 1", 1).await;
        let ctx = WorkerContext::detached("w");

        while engine.process_one(&ctx).await.unwrap().is_some() {}
        let first = engine.store().get_dead_letter("doomed").await.unwrap().unwrap();

        let revived = engine.store().retry_dead_letter("doomed").await.unwrap();
        assert_eq!(revived.attempts, 0);
        assert_eq!(engine.store().count_dead_letters().await.unwrap(), 0);

        while engine.process_one(&ctx).await.unwrap().is_some() {}
        let second = engine.store().get_dead_letter("doomed").await.unwrap().unwrap();
        assert_eq!(second.attempts, first.attempts);
        assert_eq!(second.max_retries, first.max_retries);
    }

    #[tokio::test]
    async fn draining_pool_keeps_ownership_of_retries() {
        let engine = engine().await;
        add(&engine, "flaky", "exit 1", 3).await;
        let (tx, rx) = watch::channel(PoolState::Draining);
        let mut ctx = WorkerContext::new("w", rx);

        let outcome = engine.process_one(&ctx).await.unwrap().unwrap();
        assert!(matches!(outcome, Outcome::Retrying { held: true, .. }));

        let job = engine.store().get_job("flaky").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.worker_id.as_deref(), Some("w"));

        // held retries can only be resumed while completing a retry
        assert!(engine.process_held(&ctx, "flaky").await.is_err());

        ctx.set_phase(Phase::CompletingRetry);
        engine.store().set_config("backoff_base", "0").await.unwrap();
        let outcome = engine.process_held(&ctx, "flaky").await.unwrap();
        assert!(matches!(outcome, Outcome::Retrying { attempts: 2, held: true, .. }));

        // another worker cannot resume it
        let mut other = WorkerContext::new("other", tx.subscribe());
        other.set_phase(Phase::CompletingRetry);
        assert!(matches!(
            engine.process_held(&other, "flaky").await,
            Err(QueueError::StaleOwnership { .. })
        ));
    }

    #[tokio::test]
    async fn aborting_context_kills_the_command() {
        let engine = engine().await;
        add(&engine, "slow", "sleep 30", 3).await;
        let (tx, rx) = watch::channel(PoolState::Running);
        let ctx = WorkerContext::new("w", rx);

        let kill = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx.send(PoolState::Aborting).unwrap();
        };
        let (outcome, ()) = tokio::join!(engine.process_one(&ctx), kill);

        assert_eq!(
            outcome.unwrap(),
            Some(Outcome::Aborted { job_id: "slow".into() })
        );
        // left for the pool's reset; the engine writes nothing
        let job = engine.store().get_job("slow").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.attempts, 0);
    }
}
