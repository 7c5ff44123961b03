//! Orchestrator Integration Tests
//!
//! Retry, panic and expiry behavior of the durable queues, and delivery
//! across a store reopen.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use storyloom::core::{JobDefaults, JobError, JobHandler, JobStore, Orchestrator, OrchestratorConfig};
use storyloom::domain::{Job, JobState, QueueName};
use storyloom::store::Store;

fn orchestrator(store: Store, retry_limit: u32) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        JobStore::new(
            store,
            JobDefaults {
                retry_limit,
                retry_delay: Duration::ZERO,
            },
        ),
        OrchestratorConfig {
            poll_interval: Duration::from_millis(10),
            cron_tick: Duration::from_millis(20),
            ..Default::default()
        },
    ))
}

/// Fails the first `failures` attempts, panicking when `panic` is set
struct Flaky {
    attempts: AtomicUsize,
    failures: usize,
    panic: bool,
}

impl Flaky {
    fn new(failures: usize, panic: bool) -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
            failures,
            panic,
        })
    }
}

#[async_trait]
impl JobHandler for Flaky {
    async fn handle(&self, _job: &Job) -> Result<(), JobError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            if self.panic {
                panic!("attempt {} exploded", attempt);
            }
            return Err(JobError::transient(format!("attempt {} failed", attempt)));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_retries_until_limit_then_fails() {
    let orch = orchestrator(Store::open_in_memory().unwrap(), 2);
    let handler = Flaky::new(usize::MAX, false);
    orch.work(QueueName::FetchContent, 1, handler.clone());

    let id = orch
        .send(QueueName::FetchContent, &json!({"rawItemIds": ["x"]}))
        .unwrap();

    for _ in 0..3 {
        assert_eq!(orch.run_once(QueueName::FetchContent).await.unwrap(), 1);
    }
    // Spent: nothing left to claim
    assert_eq!(orch.run_once(QueueName::FetchContent).await.unwrap(), 0);
    assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);

    let job = orch.jobs().get(&id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.output.unwrap()["error"], "attempt 2 failed");
}

#[tokio::test]
async fn test_panicking_handler_is_retried() {
    let orch = orchestrator(Store::open_in_memory().unwrap(), 3);
    let handler = Flaky::new(1, true);
    orch.work(QueueName::AnalyzeLlm, 1, handler.clone());

    let id = orch
        .send(QueueName::AnalyzeLlm, &json!({"storyId": "s"}))
        .unwrap();

    orch.run_once(QueueName::AnalyzeLlm).await.unwrap();
    assert_eq!(orch.jobs().get(&id).unwrap().unwrap().state, JobState::Retry);

    orch.run_once(QueueName::AnalyzeLlm).await.unwrap();
    let job = orch.jobs().get(&id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.retry_count, 1);
}

#[tokio::test]
async fn test_expired_active_job_is_reclaimed() {
    let orch = orchestrator(Store::open_in_memory().unwrap(), 1);
    let id = orch
        .send(QueueName::FetchContent, &json!({"rawItemIds": ["x"]}))
        .unwrap();

    // A worker claimed it and died
    let claimed = orch.jobs().fetch(QueueName::FetchContent, 1, Utc::now()).unwrap();
    assert_eq!(claimed.len(), 1);

    let later = Utc::now() + chrono::Duration::hours(1);
    orch.maintain(later).unwrap();
    let job = orch.jobs().get(&id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Retry);
    assert_eq!(job.retry_count, 1);

    // Second expiry exhausts the limit
    orch.jobs().fetch(QueueName::FetchContent, 1, later).unwrap();
    orch.maintain(later + chrono::Duration::hours(1)).unwrap();
    assert_eq!(orch.jobs().get(&id).unwrap().unwrap().state, JobState::Failed);
}

/// Succeeds after `delay`
struct Slow {
    delay: Duration,
    runs: AtomicUsize,
}

#[async_trait]
impl JobHandler for Slow {
    async fn handle(&self, _job: &Job) -> Result<(), JobError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_running_job_outlives_expire_in() {
    let store = Store::open_in_memory().unwrap();
    let orch = Arc::new(Orchestrator::new(
        JobStore::new(
            store,
            JobDefaults {
                retry_limit: 1,
                retry_delay: Duration::ZERO,
            },
        ),
        OrchestratorConfig {
            expire_in: Duration::from_millis(50),
            ..Default::default()
        },
    ));
    let handler = Arc::new(Slow {
        delay: Duration::from_millis(300),
        runs: AtomicUsize::new(0),
    });
    orch.work(QueueName::FetchYoutubeContent, 1, handler.clone());

    let id = orch
        .send(QueueName::FetchYoutubeContent, &json!({"rawItemIds": ["x"]}))
        .unwrap();

    let worker = {
        let orch = Arc::clone(&orch);
        tokio::spawn(async move { orch.run_once(QueueName::FetchYoutubeContent).await })
    };

    // Well past expire_in while the handler is still sleeping
    tokio::time::sleep(Duration::from_millis(150)).await;
    orch.maintain(Utc::now()).unwrap();
    assert_eq!(orch.jobs().get(&id).unwrap().unwrap().state, JobState::Active);

    assert_eq!(worker.await.unwrap().unwrap(), 1);
    let job = orch.jobs().get(&id).unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_jobs_survive_store_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");

    let id = {
        let orch = orchestrator(Store::open(&path).unwrap(), 3);
        orch.send(QueueName::IngestPull, &json!({"source": "rss"}))
            .unwrap()
    };

    let orch = orchestrator(Store::open(&path).unwrap(), 3);
    let handler = Flaky::new(0, false);
    orch.work(QueueName::IngestPull, 1, handler.clone());

    assert_eq!(orch.run_once(QueueName::IngestPull).await.unwrap(), 1);
    assert_eq!(orch.jobs().get(&id).unwrap().unwrap().state, JobState::Completed);
}

#[tokio::test]
async fn test_started_loops_fire_schedules_and_stop() {
    let orch = orchestrator(Store::open_in_memory().unwrap(), 1);
    let handler = Flaky::new(0, false);
    orch.work(QueueName::Heartbeat, 1, handler.clone());

    // Every second, so at least one slot passes during the test
    orch.schedule(QueueName::Heartbeat, "* * * * * *", &json!({"ping": "ok"}), None)
        .unwrap();

    let cancel = CancellationToken::new();
    let handles = orch.start(cancel.clone());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while handler.attempts.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(handler.attempts.load(Ordering::SeqCst) >= 1);

    cancel.cancel();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
