//! Bounded-concurrency admission queue for transcription.
//!
//! Transcription is CPU-bound, so at most `concurrency` jobs run at once.
//! Pending jobs are dispatched highest priority first and FIFO within a
//! priority class. A failed attempt goes to `Retrying` and comes back to
//! `Pending` after a capped exponential backoff; once `max_retries` is spent
//! the job is `Failed` for good.
//!
//! Working files are released through [`JobCleanup`] exactly once, when the
//! job reaches a terminal state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::RetryPolicy;

use super::transcriber::{TranscribeOptions, Transcriber, Transcript};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Why an attempt failed
#[derive(Debug, Clone, Error)]
pub enum TranscriptionError {
    #[error("Transcription timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transcription failed: {0}")]
    Failed(String),
}

/// Dispatch priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Lower rank dispatches first
    fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" | "normal" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => anyhow::bail!("Unknown priority: {}", s),
        }
    }
}

/// Lifecycle of a transcription job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    /// Last attempt failed; waiting out the backoff
    Retrying,
    Completed,
    /// Terminal failure
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A queued transcription
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionJob {
    pub id: String,
    pub video_id: String,
    pub audio_path: PathBuf,
    pub options: TranscribeOptions,
    pub priority: Priority,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: Option<Transcript>,
    pub error: Option<String>,
    #[serde(skip)]
    seq: u64,
    #[serde(skip)]
    cleaned: bool,
}

impl TranscriptionJob {
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Snapshot of queue occupancy
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
    /// Mean processing time of terminal jobs, in milliseconds
    pub average_processing_ms: u64,
    pub total_processing_ms: u64,
}

/// Releases the working files of a finished job
#[async_trait]
pub trait JobCleanup: Send + Sync {
    async fn cleanup(&self, job: &TranscriptionJob);
}

/// Removes downloaded audio under `work_dir`.
///
/// Audio that lives in its own directory below `work_dir` takes the whole
/// directory with it; anything else only loses the file.
pub struct RemoveWorkingFiles {
    work_dir: PathBuf,
}

impl RemoveWorkingFiles {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    fn owned_dir<'a>(&self, audio: &'a Path) -> Option<&'a Path> {
        let parent = audio.parent()?;
        (parent != self.work_dir && parent.starts_with(&self.work_dir)).then_some(parent)
    }
}

#[async_trait]
impl JobCleanup for RemoveWorkingFiles {
    async fn cleanup(&self, job: &TranscriptionJob) {
        let result = match self.owned_dir(&job.audio_path) {
            Some(dir) => tokio::fs::remove_dir_all(dir).await,
            None => tokio::fs::remove_file(&job.audio_path).await,
        };
        match result {
            Ok(()) => debug!(job_id = %job.id, "Working files removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id = %job.id, error = %e, "Failed to remove working files"),
        }
    }
}

/// Queue tuning
#[derive(Debug, Clone)]
pub struct TranscriptionQueueConfig {
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Minimum time an attempt may run
    pub timeout_floor: Duration,
    /// Extra time allowed per MB of audio
    pub timeout_per_mb: Duration,
    pub janitor_interval: Duration,
    /// Terminal jobs older than this are evicted
    pub max_job_age: chrono::Duration,
}

impl Default for TranscriptionQueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retry: RetryPolicy::default(),
            timeout_floor: Duration::from_secs(300),
            timeout_per_mb: Duration::from_secs(60),
            janitor_interval: Duration::from_secs(300),
            max_job_age: chrono::Duration::hours(1),
        }
    }
}

impl TranscriptionQueueConfig {
    /// Attempt timeout for an audio file of `size_bytes`
    pub fn timeout_for(&self, size_bytes: u64) -> Duration {
        let proportional = self.timeout_per_mb.mul_f64(size_bytes as f64 / BYTES_PER_MB);
        proportional.max(self.timeout_floor)
    }
}

#[derive(Default)]
struct State {
    jobs: HashMap<String, TranscriptionJob>,
    processing: usize,
    next_seq: u64,
}

/// The admission queue
pub struct TranscriptionQueue {
    state: Mutex<State>,
    /// Wakes the dispatcher: new job, freed slot, or a retry coming due
    wakeup: Notify,
    /// Wakes `wait_for_job` callers on terminal transitions
    finished: Notify,
    transcriber: Arc<dyn Transcriber>,
    cleanup: Option<Arc<dyn JobCleanup>>,
    config: TranscriptionQueueConfig,
    shutdown: CancellationToken,
}

impl TranscriptionQueue {
    pub fn new(transcriber: Arc<dyn Transcriber>, config: TranscriptionQueueConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            wakeup: Notify::new(),
            finished: Notify::new(),
            transcriber,
            cleanup: None,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_cleanup(mut self, cleanup: Arc<dyn JobCleanup>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    /// Stop when `token` is cancelled instead of only on `shutdown()`
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn config(&self) -> &TranscriptionQueueConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a transcription. Never blocks; returns the job id.
    pub fn add_job(
        &self,
        video_id: impl Into<String>,
        audio_path: impl Into<PathBuf>,
        options: TranscribeOptions,
        priority: Priority,
        max_retries: Option<u32>,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let video_id = video_id.into();

        {
            let mut state = self.state();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.jobs.insert(
                id.clone(),
                TranscriptionJob {
                    id: id.clone(),
                    video_id: video_id.clone(),
                    audio_path: audio_path.into(),
                    options,
                    priority,
                    status: JobStatus::Pending,
                    created_at: Utc::now(),
                    started_at: None,
                    completed_at: None,
                    retry_count: 0,
                    max_retries: max_retries.unwrap_or(self.config.retry.max_retries),
                    result: None,
                    error: None,
                    seq,
                    cleaned: false,
                },
            );
        }

        info!(job_id = %id, video_id = %video_id, ?priority, "Transcription queued");
        self.wakeup.notify_one();
        id
    }

    pub fn get_job(&self, id: &str) -> Option<TranscriptionJob> {
        self.state().jobs.get(id).cloned()
    }

    /// Newest job for `video_id` that is still in flight or has completed.
    ///
    /// Failed jobs are not returned so that a redelivery queues a fresh one.
    pub fn find_reusable(&self, video_id: &str) -> Option<String> {
        self.state()
            .jobs
            .values()
            .filter(|j| j.video_id == video_id && j.status != JobStatus::Failed)
            .max_by_key(|j| j.seq)
            .map(|j| j.id.clone())
    }

    /// Wait until the job is terminal. `None` on timeout or unknown id.
    pub async fn wait_for_job(&self, id: &str, timeout: Duration) -> Option<TranscriptionJob> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.get_job(id) {
                None => return None,
                Some(job) if job.status.is_terminal() => return Some(job),
                Some(_) => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    pub fn get_stats(&self) -> QueueStats {
        let state = self.state();
        let mut stats = QueueStats::default();
        let mut terminal = 0u64;

        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Retrying => stats.retrying += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
            if job.status.is_terminal() {
                if let Some(elapsed) = job.processing_time() {
                    stats.total_processing_ms += elapsed.num_milliseconds().max(0) as u64;
                    terminal += 1;
                }
            }
        }

        if terminal > 0 {
            stats.average_processing_ms = stats.total_processing_ms / terminal;
        }
        stats
    }

    /// Spawn the dispatcher and janitor loops
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let dispatcher = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.dispatch_loop().await })
        };
        let janitor = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.janitor_loop().await })
        };
        info!(concurrency = self.config.concurrency, "Transcription queue started");
        vec![dispatcher, janitor]
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn dispatch_loop(self: Arc<Self>) {
        loop {
            self.dispatch();
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wakeup.notified() => {}
            }
        }
        debug!("Transcription dispatcher stopped");
    }

    /// Fill free slots with the best pending jobs
    fn dispatch(self: &Arc<Self>) {
        let mut started = Vec::new();
        {
            let mut state = self.state();
            while state.processing < self.config.concurrency.max(1) {
                let next = state
                    .jobs
                    .values()
                    .filter(|j| j.status == JobStatus::Pending)
                    .min_by_key(|j| (j.priority.rank(), j.created_at, j.seq))
                    .map(|j| j.id.clone());

                let Some(id) = next else { break };
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.status = JobStatus::Processing;
                    job.started_at = Some(Utc::now());
                    started.push(job.clone());
                }
                state.processing += 1;
            }
        }

        for job in started {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run_attempt(job).await });
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, video_id = %job.video_id, attempt = job.retry_count + 1))]
    async fn run_attempt(self: Arc<Self>, job: TranscriptionJob) {
        let size = tokio::fs::metadata(&job.audio_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let limit = self.config.timeout_for(size);

        // Own task so a panicking transcriber still reaches finish_attempt
        let transcriber = Arc::clone(&self.transcriber);
        let audio = job.audio_path.clone();
        let options = job.options.clone();
        let attempt = tokio::spawn(async move {
            tokio::time::timeout(limit, transcriber.transcribe(&audio, &options)).await
        });

        let outcome = match attempt.await {
            Ok(Ok(Ok(transcript))) => Ok(transcript),
            Ok(Ok(Err(e))) => Err(TranscriptionError::Failed(format!("{:#}", e))),
            // Dropping the future kills the child process
            Ok(Err(_)) => Err(TranscriptionError::Timeout(limit)),
            Err(join) => Err(TranscriptionError::Failed(format!("transcriber panicked: {}", join))),
        };

        self.finish_attempt(&job.id, outcome).await;
    }

    async fn finish_attempt(self: &Arc<Self>, id: &str, outcome: Result<Transcript, TranscriptionError>) {
        let mut retry_after = None;
        let mut to_clean = None;

        {
            let mut state = self.state();
            let Some(job) = state.jobs.get_mut(id) else {
                return;
            };

            match &outcome {
                Ok(_) => to_clean = Some(job.clone()),
                Err(e) => {
                    job.error = Some(e.to_string());
                    if job.retry_count < job.max_retries {
                        job.retry_count += 1;
                        job.status = JobStatus::Retrying;
                        let delay = self.config.retry.delay_for_retry(job.retry_count);
                        warn!(
                            job_id = %id,
                            retry = job.retry_count,
                            max_retries = job.max_retries,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Transcription attempt failed, retrying"
                        );
                        retry_after = Some(delay);
                    } else {
                        to_clean = Some(job.clone());
                    }
                }
            }

            if retry_after.is_some() {
                state.processing = state.processing.saturating_sub(1);
            }
        }

        if let Some(delay) = retry_after {
            self.schedule_retry(id.to_string(), delay);
            self.wakeup.notify_one();
            return;
        }

        // Terminal: release files before the job becomes observable as finished
        if let Some(job) = to_clean {
            self.release(&job).await;
        }

        {
            let mut state = self.state();
            state.processing = state.processing.saturating_sub(1);
            if let Some(job) = state.jobs.get_mut(id) {
                job.completed_at = Some(Utc::now());
                match outcome {
                    Ok(transcript) => {
                        info!(job_id = %id, duration = transcript.duration, "Transcription completed");
                        job.status = JobStatus::Completed;
                        job.result = Some(transcript);
                        job.error = None;
                    }
                    Err(e) => {
                        error!(job_id = %id, retries = job.retry_count, error = %e, "Transcription failed");
                        job.status = JobStatus::Failed;
                    }
                }
            }
        }

        self.finished.notify_waiters();
        self.wakeup.notify_one();
    }

    async fn release(&self, job: &TranscriptionJob) {
        let first = {
            let mut state = self.state();
            match state.jobs.get_mut(&job.id) {
                Some(stored) if !stored.cleaned => {
                    stored.cleaned = true;
                    true
                }
                _ => false,
            }
        };

        if first {
            if let Some(cleanup) = &self.cleanup {
                cleanup.cleanup(job).await;
            }
        }
    }

    /// Move a retrying job back to pending once its backoff elapses
    fn schedule_retry(self: &Arc<Self>, id: String, delay: Duration) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let requeued = {
                        let mut state = this.state();
                        match state.jobs.get_mut(&id) {
                            Some(job) if job.status == JobStatus::Retrying => {
                                job.status = JobStatus::Pending;
                                true
                            }
                            _ => false,
                        }
                    };
                    if requeued {
                        this.wakeup.notify_one();
                    }
                }
                _ = this.shutdown.cancelled() => {}
            }
        });
    }

    /// Drop terminal jobs that finished before `now - max_job_age`
    pub fn evict_finished(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.max_job_age;
        let mut state = self.state();
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.is_some_and(|done| done < cutoff))
        });
        before - state.jobs.len()
    }

    async fn janitor_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.janitor_interval);
        // First tick fires immediately
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let evicted = self.evict_finished(Utc::now());
                    if evicted > 0 {
                        debug!(evicted, "Evicted finished transcription jobs");
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Records call order and concurrency; sleeps `delay` per call
    struct FakeTranscriber {
        delay: Duration,
        fail: bool,
        calls: Mutex<Vec<String>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FakeTranscriber {
        fn new(delay: Duration, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delay,
                fail,
                calls: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Transcriber for FakeTranscriber {
        async fn transcribe(&self, audio_path: &Path, _options: &TranscribeOptions) -> anyhow::Result<Transcript> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .push(audio_path.display().to_string());

            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                anyhow::bail!("decoder error");
            }
            Ok(Transcript {
                text: "hello".to_string(),
                segments: Vec::new(),
                language: "en".to_string(),
                duration: 1.0,
            })
        }
    }

    /// Panics on the first call, answers afterwards
    struct PanicsOnce {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transcriber for PanicsOnce {
        async fn transcribe(&self, _audio_path: &Path, _options: &TranscribeOptions) -> anyhow::Result<Transcript> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("whisper crashed");
            }
            Ok(Transcript {
                text: "recovered".to_string(),
                segments: Vec::new(),
                language: "en".to_string(),
                duration: 1.0,
            })
        }
    }

    struct CountingCleanup(AtomicUsize);

    #[async_trait]
    impl JobCleanup for CountingCleanup {
        async fn cleanup(&self, _job: &TranscriptionJob) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(concurrency: usize, max_retries: u32) -> TranscriptionQueueConfig {
        TranscriptionQueueConfig {
            concurrency,
            retry: RetryPolicy::new(max_retries, Duration::from_millis(10), Duration::from_millis(40)),
            timeout_floor: Duration::from_secs(5),
            timeout_per_mb: Duration::ZERO,
            ..Default::default()
        }
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_timeout_scales_with_size() {
        let config = TranscriptionQueueConfig::default();
        assert_eq!(config.timeout_for(0), Duration::from_secs(300));
        assert_eq!(config.timeout_for(3 * 1024 * 1024), Duration::from_secs(300));
        assert_eq!(config.timeout_for(10 * 1024 * 1024), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_priority_then_fifo_dispatch() {
        let transcriber = FakeTranscriber::new(Duration::from_millis(5), false);
        let queue = Arc::new(TranscriptionQueue::new(transcriber.clone(), config(1, 0)));

        let ids = vec![
            queue.add_job("v1", "low-1", TranscribeOptions::default(), Priority::Low, None),
            queue.add_job("v2", "medium-1", TranscribeOptions::default(), Priority::Medium, None),
            queue.add_job("v3", "high-1", TranscribeOptions::default(), Priority::High, None),
            queue.add_job("v4", "high-2", TranscribeOptions::default(), Priority::High, None),
            queue.add_job("v5", "low-2", TranscribeOptions::default(), Priority::Low, None),
        ];
        let handles = queue.start();

        for id in &ids {
            let job = queue.wait_for_job(id, WAIT).await.unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }

        let calls = transcriber.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["high-1", "high-2", "medium-1", "low-1", "low-2"]);

        queue.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let transcriber = FakeTranscriber::new(Duration::from_millis(30), false);
        let queue = Arc::new(TranscriptionQueue::new(transcriber.clone(), config(2, 0)));

        let ids: Vec<_> = (0..6)
            .map(|i| {
                queue.add_job(
                    format!("v{}", i),
                    format!("audio-{}", i),
                    TranscribeOptions::default(),
                    Priority::Medium,
                    None,
                )
            })
            .collect();
        queue.start();

        for id in &ids {
            assert!(queue.wait_for_job(id, WAIT).await.is_some());
        }

        assert_eq!(transcriber.peak.load(Ordering::SeqCst), 2);
        let stats = queue.get_stats();
        assert_eq!(stats.completed, 6);
        assert_eq!(stats.processing, 0);
        assert!(stats.total_processing_ms >= stats.average_processing_ms);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_retries_then_fails_with_single_cleanup() {
        let transcriber = FakeTranscriber::new(Duration::from_millis(1), true);
        let cleanup = Arc::new(CountingCleanup(AtomicUsize::new(0)));
        let queue = Arc::new(
            TranscriptionQueue::new(transcriber.clone(), config(1, 2)).with_cleanup(cleanup.clone()),
        );
        queue.start();

        let id = queue.add_job("v1", "audio", TranscribeOptions::default(), Priority::High, None);
        let job = queue.wait_for_job(&id, WAIT).await.unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
        assert!(job.error.unwrap().contains("decoder error"));
        assert_eq!(transcriber.calls.lock().unwrap().len(), 3);
        assert_eq!(cleanup.0.load(Ordering::SeqCst), 1);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_panicking_transcriber_releases_slot() {
        let transcriber = Arc::new(PanicsOnce {
            calls: AtomicUsize::new(0),
        });
        let cleanup = Arc::new(CountingCleanup(AtomicUsize::new(0)));
        let queue = Arc::new(
            TranscriptionQueue::new(transcriber.clone(), config(1, 0)).with_cleanup(cleanup.clone()),
        );
        let handles = queue.start();

        let a = queue.add_job("va", "audio-a", TranscribeOptions::default(), Priority::High, None);
        let b = queue.add_job("vb", "audio-b", TranscribeOptions::default(), Priority::Low, None);

        let first = queue.wait_for_job(&a, WAIT).await.unwrap();
        assert_eq!(first.status, JobStatus::Failed);
        assert!(first.error.unwrap().contains("panicked"));

        // The slot came back, so the next job still runs
        let second = queue.wait_for_job(&b, WAIT).await.unwrap();
        assert_eq!(second.status, JobStatus::Completed);

        assert_eq!(cleanup.0.load(Ordering::SeqCst), 2);
        let stats = queue.get_stats();
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.pending, 0);

        queue.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_find_reusable_skips_failed_jobs() {
        let transcriber = FakeTranscriber::new(Duration::from_millis(1), true);
        let queue = Arc::new(TranscriptionQueue::new(transcriber, config(1, 0)));
        assert!(queue.find_reusable("v1").is_none());

        let id = queue.add_job("v1", "audio", TranscribeOptions::default(), Priority::Medium, None);
        assert_eq!(queue.find_reusable("v1"), Some(id.clone()));
        assert!(queue.find_reusable("v2").is_none());

        queue.start();
        let job = queue.wait_for_job(&id, WAIT).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(queue.find_reusable("v1").is_none());
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_success_cleans_up_once() {
        let transcriber = FakeTranscriber::new(Duration::from_millis(1), false);
        let cleanup = Arc::new(CountingCleanup(AtomicUsize::new(0)));
        let queue = Arc::new(
            TranscriptionQueue::new(transcriber, config(1, 2)).with_cleanup(cleanup.clone()),
        );
        queue.start();

        let id = queue.add_job("v1", "audio", TranscribeOptions::default(), Priority::Low, Some(0));
        let job = queue.wait_for_job(&id, WAIT).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap().text, "hello");
        assert_eq!(cleanup.0.load(Ordering::SeqCst), 1);
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_wait_for_unknown_or_slow_job() {
        let transcriber = FakeTranscriber::new(Duration::from_secs(10), false);
        let queue = Arc::new(TranscriptionQueue::new(transcriber, config(1, 0)));
        queue.start();

        assert!(queue.wait_for_job("missing", WAIT).await.is_none());

        let id = queue.add_job("v1", "audio", TranscribeOptions::default(), Priority::Medium, None);
        assert!(queue
            .wait_for_job(&id, Duration::from_millis(50))
            .await
            .is_none());
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_janitor_evicts_old_terminal_jobs() {
        let transcriber = FakeTranscriber::new(Duration::from_millis(1), false);
        let queue = Arc::new(TranscriptionQueue::new(transcriber, config(1, 0)));
        queue.start();

        let id = queue.add_job("v1", "audio", TranscribeOptions::default(), Priority::Medium, None);
        queue.wait_for_job(&id, WAIT).await.unwrap();

        assert_eq!(queue.evict_finished(Utc::now()), 0);
        assert_eq!(queue.evict_finished(Utc::now() + chrono::Duration::hours(2)), 1);
        assert!(queue.get_job(&id).is_none());
        queue.shutdown();
    }

    #[tokio::test]
    async fn test_remove_working_files() {
        let temp = TempDir::new().unwrap();
        let job_dir = temp.path().join("job-1");
        tokio::fs::create_dir_all(&job_dir).await.unwrap();
        let audio = job_dir.join("audio.m4a");
        tokio::fs::write(&audio, b"fake audio").await.unwrap();
        let loose = temp.path().join("loose.m4a");
        tokio::fs::write(&loose, b"fake audio").await.unwrap();

        let transcriber = FakeTranscriber::new(Duration::from_millis(1), false);
        let queue = TranscriptionQueue::new(transcriber, config(1, 0));
        let cleanup = RemoveWorkingFiles::new(temp.path());

        let nested = queue.add_job("v1", &audio, TranscribeOptions::default(), Priority::Medium, None);
        let flat = queue.add_job("v2", &loose, TranscribeOptions::default(), Priority::Medium, None);
        cleanup.cleanup(&queue.get_job(&nested).unwrap()).await;
        cleanup.cleanup(&queue.get_job(&flat).unwrap()).await;

        assert!(!job_dir.exists());
        assert!(!loose.exists());
        assert!(temp.path().exists());
    }
}
