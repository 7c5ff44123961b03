//! Multi-queue orchestrator.
//!
//! Owns the worker loop of every named queue, the cron loop that turns
//! schedules into jobs, and the maintenance loop that reclaims expired jobs
//! and archives finished ones. Each queue is served by one worker that
//! claims up to `batch_size` jobs at a time and runs them one after the
//! other. Queues progress independently of each other.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{Job, JobState, NewRawItem, QueueName, Schedule};

use super::cron::{CronError, CronTrigger};
use super::handler::{JobError, JobHandler};
use super::job_store::{JobStore, JobStoreError};

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    JobStore(#[from] JobStoreError),

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No handler registered for queue {0}")]
    NoHandler(QueueName),
}

/// Loop timings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Default timezone for schedules registered without one
    pub timezone: String,
    /// How long an idle worker sleeps before polling again
    pub poll_interval: Duration,
    /// How often schedules are evaluated
    pub cron_tick: Duration,
    /// Active jobs whose lease is older than this are reclaimed. Running
    /// handlers renew the lease every third of this.
    pub expire_in: Duration,
    /// Finished jobs older than this are deleted
    pub archive_after: chrono::Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            poll_interval: Duration::from_millis(2000),
            cron_tick: Duration::from_secs(30),
            expire_in: Duration::from_secs(900),
            archive_after: chrono::Duration::days(7),
        }
    }
}

/// Producer handle: writes jobs and wakes the matching worker.
///
/// Cheap to clone; handlers keep one to enqueue follow-up work.
#[derive(Clone)]
pub struct Dispatcher {
    jobs: JobStore,
    wakers: Arc<HashMap<QueueName, Arc<Notify>>>,
}

impl Dispatcher {
    fn new(jobs: JobStore) -> Self {
        let wakers = QueueName::ALL
            .into_iter()
            .map(|q| (q, Arc::new(Notify::new())))
            .collect();
        Self {
            jobs,
            wakers: Arc::new(wakers),
        }
    }

    /// Enqueue a one-off job. Never waits on consumers.
    pub fn send<T: Serialize>(&self, queue: QueueName, payload: &T) -> Result<String, OrchestratorError> {
        let payload = serde_json::to_value(payload)?;
        let id = self.jobs.send(queue, &payload)?;
        self.wake(queue);
        Ok(id)
    }

    /// Store a new raw item and enqueue its fetch job atomically.
    ///
    /// `payload_for` receives the new raw item id. Returns
    /// `(raw_item_id, job_id)`, or `None` when the item was already seen.
    pub fn send_for_new_item<T: Serialize>(
        &self,
        item: &NewRawItem,
        queue: QueueName,
        payload_for: impl FnOnce(&str) -> T,
    ) -> Result<Option<(String, String)>, OrchestratorError> {
        let sent = self
            .jobs
            .insert_raw_item_with_job(item, queue, |id| serde_json::to_value(payload_for(id)))?;
        if sent.is_some() {
            self.wake(queue);
        }
        Ok(sent)
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    fn wake(&self, queue: QueueName) {
        if let Some(waker) = self.wakers.get(&queue) {
            waker.notify_one();
        }
    }

    fn waker(&self, queue: QueueName) -> Arc<Notify> {
        self.wakers
            .get(&queue)
            .cloned()
            .unwrap_or_else(|| Arc::new(Notify::new()))
    }
}

#[derive(Clone)]
struct Registration {
    batch_size: usize,
    handler: Arc<dyn JobHandler>,
}

/// The orchestrator
pub struct Orchestrator {
    dispatcher: Dispatcher,
    config: OrchestratorConfig,
    workers: RwLock<HashMap<QueueName, Registration>>,
}

impl Orchestrator {
    pub fn new(jobs: JobStore, config: OrchestratorConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(jobs),
            config,
            workers: RwLock::new(HashMap::new()),
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    pub fn jobs(&self) -> &JobStore {
        &self.dispatcher.jobs
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Register (or replace) a recurring trigger for `queue`.
    ///
    /// Pull payloads are keyed per source family, everything else per queue.
    pub fn schedule(
        &self,
        queue: QueueName,
        cron_expr: &str,
        payload: &serde_json::Value,
        timezone: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let timezone = timezone.unwrap_or(self.config.timezone.as_str());
        // Reject bad expressions before they reach the store
        CronTrigger::parse(cron_expr, timezone)?;
        let name = Schedule::name_for(queue, payload);
        self.jobs().upsert_schedule(&name, queue, cron_expr, timezone, payload)?;
        info!(schedule = %name, cron = cron_expr, timezone, "Schedule registered");
        Ok(())
    }

    pub fn send<T: Serialize>(&self, queue: QueueName, payload: &T) -> Result<String, OrchestratorError> {
        self.dispatcher.send(queue, payload)
    }

    /// Register the handler serving `queue`
    pub fn work(&self, queue: QueueName, batch_size: usize, handler: Arc<dyn JobHandler>) {
        let mut workers = self
            .workers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        workers.insert(
            queue,
            Registration {
                batch_size: batch_size.max(1),
                handler,
            },
        );
        debug!(queue = %queue, batch_size, "Worker registered");
    }

    pub fn complete(&self, queue: QueueName, job_id: &str) -> Result<(), OrchestratorError> {
        self.jobs().complete(job_id, None)?;
        debug!(queue = %queue, job_id, "Job completed");
        Ok(())
    }

    /// Route a failed attempt to the matching store transition
    pub fn fail(&self, queue: QueueName, job_id: &str, err: &JobError) -> Result<(), OrchestratorError> {
        match err {
            JobError::Transient(msg) => match self.jobs().fail(job_id, msg, Utc::now())? {
                JobState::Failed => {
                    error!(queue = %queue, job_id, error = %msg, "Job failed, retries exhausted")
                }
                _ => warn!(queue = %queue, job_id, error = %msg, "Job failed, will retry"),
            },
            JobError::QuotaExhausted { reset_at, message } => {
                self.jobs().fail_until(job_id, message, *reset_at)?;
                warn!(queue = %queue, job_id, reset_at = %reset_at, "Job deferred until quota reset");
            }
            JobError::Invalid(msg) => {
                self.jobs().fail_permanently(job_id, msg)?;
                error!(queue = %queue, job_id, error = %msg, "Job rejected");
            }
        }
        Ok(())
    }

    fn registration(&self, queue: QueueName) -> Option<Registration> {
        self.workers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&queue)
            .cloned()
    }

    /// Claim one batch of `queue` and run it. Returns the number of jobs claimed.
    pub async fn run_once(&self, queue: QueueName) -> Result<usize, OrchestratorError> {
        let registration = self
            .registration(queue)
            .ok_or(OrchestratorError::NoHandler(queue))?;

        let batch = self
            .jobs()
            .fetch(queue, registration.batch_size, Utc::now())?;
        let claimed = batch.len();

        for job in batch {
            self.process(&registration, job).await;
        }

        Ok(claimed)
    }

    /// Run one job in its own task so a panic only fails that job
    #[instrument(skip(self, registration, job), fields(queue = %job.queue, job_id = %job.id))]
    async fn process(&self, registration: &Registration, job: Job) {
        let handler = registration.handler.clone();
        let queue = job.queue;
        let job_id = job.id.clone();

        let mut task = tokio::spawn(async move { handler.handle(&job).await });

        // Renew the lease while the handler runs so maintenance only
        // reclaims jobs whose worker is gone
        let mut lease = tokio::time::interval(self.lease_interval());
        lease.tick().await;
        let outcome = loop {
            tokio::select! {
                outcome = &mut task => break outcome,
                _ = lease.tick() => {
                    if let Err(e) = self.jobs().keepalive(&job_id, Utc::now()) {
                        warn!(queue = %queue, job_id = %job_id, error = %e, "Failed to renew job lease");
                    }
                }
            }
        };

        let result = match outcome {
            Ok(Ok(())) => self.complete(queue, &job_id),
            Ok(Err(e)) => self.fail(queue, &job_id, &e),
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    "handler panicked"
                } else {
                    "handler cancelled"
                };
                error!(queue = %queue, job_id = %job_id, "{}", reason);
                self.fail(queue, &job_id, &JobError::transient(reason))
            }
        };

        if let Err(e) = result {
            error!(queue = %queue, job_id = %job_id, error = %e, "Failed to record job outcome");
        }
    }

    fn lease_interval(&self) -> Duration {
        (self.config.expire_in / 3).max(Duration::from_millis(10))
    }

    /// Enqueue a job for every schedule due at `now`
    pub fn tick_schedules(&self, now: chrono::DateTime<Utc>) -> Result<Vec<QueueName>, OrchestratorError> {
        let mut fired = Vec::new();

        for schedule in self.jobs().schedules()? {
            let trigger = match CronTrigger::parse(&schedule.cron, &schedule.timezone) {
                Ok(t) => t,
                Err(e) => {
                    warn!(schedule = %schedule.name, error = %e, "Skipping invalid schedule");
                    continue;
                }
            };

            if !trigger.is_due(schedule.last_fired_at, schedule.created_at, now) {
                continue;
            }

            match self.dispatcher.send(schedule.queue, &schedule.payload) {
                Ok(job_id) => {
                    self.jobs().mark_schedule_fired(&schedule.name, now)?;
                    debug!(queue = %schedule.queue, job_id = %job_id, "Schedule fired");
                    fired.push(schedule.queue);
                }
                Err(e) => warn!(queue = %schedule.queue, error = %e, "Failed to enqueue scheduled job"),
            }
        }

        Ok(fired)
    }

    /// Reclaim expired jobs and archive old finished ones
    pub fn maintain(&self, now: chrono::DateTime<Utc>) -> Result<(), OrchestratorError> {
        let expired = self.jobs().expire_active(now, self.config.expire_in)?;
        if expired > 0 {
            warn!(expired, "Reclaimed jobs stuck in active state");
        }

        let archived = self.jobs().archive_finished(now - self.config.archive_after)?;
        if archived > 0 {
            debug!(archived, "Archived finished jobs");
        }
        Ok(())
    }

    /// Spawn every loop. All of them stop when `cancel` fires.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let queues: Vec<QueueName> = {
            let workers = self
                .workers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut queues: Vec<_> = workers.keys().copied().collect();
            queues.sort();
            queues
        };

        let mut handles = Vec::with_capacity(queues.len() + 2);
        for queue in queues {
            let this = Arc::clone(self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move { this.worker_loop(queue, cancel).await }));
        }

        let this = Arc::clone(self);
        let token = cancel.clone();
        handles.push(tokio::spawn(async move { this.cron_loop(token).await }));

        let this = Arc::clone(self);
        handles.push(tokio::spawn(async move { this.maintenance_loop(cancel).await }));

        info!(loops = handles.len(), "Orchestrator started");
        handles
    }

    async fn worker_loop(&self, queue: QueueName, cancel: CancellationToken) {
        let waker = self.dispatcher.waker(queue);
        info!(queue = %queue, "Worker started");

        while !cancel.is_cancelled() {
            match self.run_once(queue).await {
                // A full batch may mean more is waiting
                Ok(n) if n > 0 => continue,
                Ok(_) => {}
                Err(e) => error!(queue = %queue, error = %e, "Worker batch failed"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = waker.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(queue = %queue, "Worker stopped");
    }

    async fn cron_loop(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.cron_tick);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.tick_schedules(Utc::now()) {
                        error!(error = %e, "Error evaluating schedules");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        info!("Cron loop stopped");
    }

    async fn maintenance_loop(&self, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.maintain(Utc::now()) {
                        error!(error = %e, "Queue maintenance failed");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}
