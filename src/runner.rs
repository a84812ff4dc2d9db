// src/runner.rs
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use nanoid::nanoid;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, Outcome, Phase, PoolState, WorkerContext};
use crate::error::{QueueError, Result};
use crate::executor::{CommandRunner, ShellRunner};
use crate::utils::constants::POLL_INTERVAL;

/// A fixed number of worker loops sharing one engine.
pub struct WorkerPool<R: CommandRunner = ShellRunner> {
    engine: Arc<Engine<R>>,
    count: usize,
    poll_interval: Duration,
    state: watch::Sender<PoolState>,
    workers: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl<R: CommandRunner> WorkerPool<R> {
    pub fn new(engine: Engine<R>, count: usize) -> Self {
        let (state, _) = watch::channel(PoolState::Running);
        Self {
            engine: Arc::new(engine),
            count: count.max(1),
            poll_interval: POLL_INTERVAL,
            state,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn engine(&self) -> &Engine<R> {
        &self.engine
    }

    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.lock_workers().iter().map(|(id, _)| id.clone()).collect()
    }

    /// Spawn the worker loops. Calling it on a started or stopped pool is a
    /// no-op.
    pub fn start(&self) {
        let mut workers = self.lock_workers();
        if !workers.is_empty() || self.state() != PoolState::Running {
            warn!("worker pool already started");
            return;
        }

        let tag = nanoid!(8);
        for i in 0..self.count {
            let worker_id = format!("worker-{tag}-{i}");
            let ctx = WorkerContext::new(worker_id.clone(), self.state.subscribe());
            let handle = tokio::spawn(worker_loop(
                Arc::clone(&self.engine),
                ctx,
                self.poll_interval,
            ));
            workers.push((worker_id, handle));
        }
        info!(count = self.count, "workers spawned");
    }

    /// Stop the pool and wait for every worker loop to exit.
    ///
    /// Graceful: no new claims; owned jobs, including their retries, run to
    /// a terminal state. Immediate: running commands are killed and every
    /// `processing` row goes back to `pending`. An immediate stop may be
    /// issued while a graceful one is still waiting.
    pub async fn stop(&self, graceful: bool) -> Result<()> {
        let target = if graceful {
            PoolState::Draining
        } else {
            PoolState::Aborting
        };
        self.state.send_if_modified(|state| {
            if target > *state {
                *state = target;
                true
            } else {
                false
            }
        });
        info!(graceful, "stopping worker pool");

        if !graceful {
            self.engine.store().reset_processing().await?;
        }

        let workers = std::mem::take(&mut *self.lock_workers());
        let joined = join_all(
            workers
                .into_iter()
                .map(|(id, handle)| async move { (id, handle.await) }),
        )
        .await;
        for (worker_id, result) in joined {
            if let Err(e) = result {
                error!(%worker_id, error = %e, "worker task failed");
            }
        }

        // claims or transitions that raced the first reset
        if self.state() == PoolState::Aborting {
            self.engine.store().reset_processing().await?;
        }

        info!("worker pool stopped");
        Ok(())
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, Vec<(String, JoinHandle<()>)>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn worker_loop<R: CommandRunner>(
    engine: Arc<Engine<R>>,
    mut ctx: WorkerContext,
    poll_interval: Duration,
) {
    info!(worker_id = ctx.worker_id(), "worker started");

    while ctx.pool_state() == PoolState::Running {
        match engine.process_one(&ctx).await {
            Ok(Some(Outcome::Retrying {
                job_id,
                run_at,
                held: true,
                ..
            })) => finish_held_retry(&engine, &mut ctx, job_id, run_at).await,
            Ok(Some(Outcome::Aborted { .. })) => break,
            Ok(Some(_)) => {}
            Ok(None) => idle(&ctx, poll_interval).await,
            Err(QueueError::StaleOwnership { job_id, .. }) => {
                warn!(worker_id = ctx.worker_id(), %job_id, "job was reset while running");
            }
            Err(e) => {
                error!(worker_id = ctx.worker_id(), error = %e, "worker iteration failed");
                idle(&ctx, poll_interval).await;
            }
        }
    }

    info!(worker_id = ctx.worker_id(), "worker stopped");
}

async fn idle(ctx: &WorkerContext, poll_interval: Duration) {
    tokio::select! {
        _ = sleep(poll_interval) => {}
        _ = ctx.state_changed() => {}
    }
}

/// Keep re-running a job this worker still owns until it completes, dies
/// or the pool aborts.
async fn finish_held_retry<R: CommandRunner>(
    engine: &Engine<R>,
    ctx: &mut WorkerContext,
    job_id: String,
    mut run_at: DateTime<Utc>,
) {
    ctx.set_phase(Phase::CompletingRetry);

    loop {
        let wait = (run_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(worker_id = ctx.worker_id(), %job_id, wait_ms = wait.as_millis() as u64, "waiting on held retry");

        tokio::select! {
            _ = sleep(wait) => {}
            _ = ctx.aborted() => break,
        }

        match engine.process_held(ctx, &job_id).await {
            Ok(Outcome::Retrying {
                run_at: next,
                held: true,
                ..
            }) => run_at = next,
            Ok(_) => break,
            Err(e) => {
                warn!(worker_id = ctx.worker_id(), %job_id, error = %e, "held retry abandoned");
                break;
            }
        }
    }

    ctx.set_phase(Phase::Claiming);
}
