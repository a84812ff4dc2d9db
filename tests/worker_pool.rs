use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tempfile::TempDir;

use queuectl::{
    enqueue, CommandRunner, Engine, Execution, ExecutionOutcome, JobRequest, JobState, JobStore,
    ShellRunner, WorkerPool,
};

async fn file_store(dir: &TempDir) -> JobStore {
    let url = format!("sqlite://{}", dir.path().join("queue.db").display());
    JobStore::open(&url, 4).await.unwrap()
}

async fn add(store: &JobStore, id: &str, command: &str, max_retries: u32) {
    let mut request = JobRequest::new(command);
    request.id = Some(id.to_string());
    request.max_retries = Some(max_retries);
    enqueue(store, request).await.unwrap();
}

async fn wait_until<F, Fut>(timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not met within {timeout:?}");
}

/// Records every execution and flags any command that runs twice at once.
#[derive(Clone, Default)]
struct RecordingRunner {
    running: Arc<Mutex<HashSet<String>>>,
    runs: Arc<Mutex<Vec<String>>>,
    overlaps: Arc<AtomicUsize>,
}

struct RecordedExecution {
    command: String,
    running: Arc<Mutex<HashSet<String>>>,
}

impl CommandRunner for RecordingRunner {
    fn spawn(&self, command: &str) -> io::Result<Box<dyn Execution>> {
        if !self.running.lock().unwrap().insert(command.to_string()) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.runs.lock().unwrap().push(command.to_string());
        Ok(Box::new(RecordedExecution {
            command: command.to_string(),
            running: Arc::clone(&self.running),
        }))
    }
}

#[async_trait]
impl Execution for RecordedExecution {
    async fn wait(&mut self) -> ExecutionOutcome {
        tokio::time::sleep(Duration::from_millis(15)).await;
        self.running.lock().unwrap().remove(&self.command);
        ExecutionOutcome::success()
    }

    async fn kill(&mut self) {
        self.running.lock().unwrap().remove(&self.command);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn each_job_runs_once_across_competing_pools() {
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir).await;
    for i in 0..40 {
        add(&store, &format!("job-{i}"), &format!("job-{i}"), 3).await;
    }

    // two pools on separate connection pools, as two processes would be
    let runner = RecordingRunner::default();
    let mut pools = Vec::new();
    for _ in 0..2 {
        let engine = Engine::new(file_store(&dir).await, runner.clone());
        pools.push(WorkerPool::new(engine, 3).with_poll_interval(Duration::from_millis(10)));
    }
    for pool in &pools {
        pool.start();
    }

    wait_until(Duration::from_secs(30), || {
        let store = store.clone();
        async move { store.count_jobs(Some(JobState::Completed)).await.unwrap() == 40 }
    })
    .await;

    for pool in &pools {
        pool.stop(true).await.unwrap();
    }

    assert_eq!(runner.overlaps.load(Ordering::SeqCst), 0);
    let runs = runner.runs.lock().unwrap();
    assert_eq!(runs.len(), 40);
    let distinct: HashSet<_> = runs.iter().collect();
    assert_eq!(distinct.len(), 40);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_stop_drives_owned_jobs_to_terminal_states() {
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir).await;
    store.set_config("backoff_base", "1").await.unwrap();
    add(&store, "flaky", "sleep 1; exit 1", 1).await;
    add(&store, "fine", "sleep 1", 1).await;

    let pool = WorkerPool::new(Engine::new(store.clone(), ShellRunner), 2)
        .with_poll_interval(Duration::from_millis(10));
    pool.start();

    wait_until(Duration::from_secs(10), || {
        let store = store.clone();
        async move { store.count_jobs(Some(JobState::Processing)).await.unwrap() == 2 }
    })
    .await;
    pool.stop(true).await.unwrap();

    let flaky = store.get_job("flaky").await.unwrap().unwrap();
    assert_eq!(flaky.state, JobState::Dead);
    assert_eq!(flaky.attempts, 2);
    assert!(store.get_dead_letter("flaky").await.unwrap().is_some());

    let fine = store.get_job("fine").await.unwrap().unwrap();
    assert_eq!(fine.state, JobState::Completed);
    assert_eq!(store.count_jobs(Some(JobState::Processing)).await.unwrap(), 0);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn immediate_stop_leaves_no_job_processing() {
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir).await;
    for i in 0..5 {
        add(&store, &format!("slow-{i}"), "sleep 30", 3).await;
    }

    let pool = WorkerPool::new(Engine::new(store.clone(), ShellRunner), 3)
        .with_poll_interval(Duration::from_millis(10));
    pool.start();

    wait_until(Duration::from_secs(10), || {
        let store = store.clone();
        async move { store.count_jobs(Some(JobState::Processing)).await.unwrap() == 3 }
    })
    .await;

    let started = Instant::now();
    pool.stop(false).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(store.count_jobs(Some(JobState::Processing)).await.unwrap(), 0);
    for i in 0..5 {
        let job = store.get_job(&format!("slow-{i}")).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.worker_id, None);
        assert_eq!(job.attempts, 0);
        assert!(job.is_eligible(Utc::now()));
    }
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retried_dead_letter_dies_the_same_way() {
    let dir = TempDir::new().unwrap();
    let store = file_store(&dir).await;
    store.set_config("backoff_base", "0").await.unwrap();
    add(&store, "doomed", "echo broken >&2; exit 2", 2).await;

    let pool = WorkerPool::new(Engine::new(store.clone(), ShellRunner), 1)
        .with_poll_interval(Duration::from_millis(10));
    pool.start();

    let dead = |store: JobStore| async move {
        store.get_dead_letter("doomed").await.unwrap().is_some()
    };
    wait_until(Duration::from_secs(10), || dead(store.clone())).await;
    let first = store.get_dead_letter("doomed").await.unwrap().unwrap();
    assert_eq!(first.attempts, 3);
    assert_eq!(first.last_error.as_deref(), Some("broken"));

    store.retry_dead_letter("doomed").await.unwrap();
    wait_until(Duration::from_secs(10), || dead(store.clone())).await;
    pool.stop(true).await.unwrap();

    let second = store.get_dead_letter("doomed").await.unwrap().unwrap();
    assert_eq!(second.attempts, first.attempts);
    assert_eq!(second.max_retries, first.max_retries);
    assert_eq!(second.command, first.command);
    assert_eq!(second.last_error, first.last_error);
    assert_eq!(second.created_at, first.created_at);
    assert_eq!(
        store.get_job("doomed").await.unwrap().unwrap().state,
        JobState::Dead
    );
}
