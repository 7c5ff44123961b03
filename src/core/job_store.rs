//! Durable multi-queue job store.
//!
//! Jobs live in the `jobs` table next to the entities they refer to, so the
//! queue is the single source of truth for at-least-once delivery. A job
//! moves `created -> active -> completed`; a failed attempt moves it to
//! `retry` with a later `start_after` until `retry_limit` is spent, after
//! which it lands in `failed`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::domain::{Job, JobState, NewRawItem, QueueName, Schedule};
use crate::store::{
    from_millis, insert_raw_item, new_id, opt_from_millis, to_millis, Store, StoreError,
};

const JOB_COLUMNS: &str = "id, queue, payload, state, retry_count, retry_limit, start_after, created_at, started_at, completed_at, output";

/// Errors from the durable queue
#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {id} is {state}, not active")]
    NotActive { id: String, state: String },
}

/// Retry defaults applied to newly sent jobs
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub retry_limit: u32,
    pub retry_delay: Duration,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_delay: Duration::from_secs(30),
        }
    }
}

fn parse_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(std::io::Error::other(msg)))
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let queue: String = row.get(1)?;
    let payload: String = row.get(2)?;
    let state: String = row.get(3)?;
    let output: Option<String> = row.get(10)?;

    Ok(Job {
        id: row.get(0)?,
        queue: queue
            .parse::<QueueName>()
            .map_err(|e| parse_error(1, e.to_string()))?,
        payload: serde_json::from_str(&payload).map_err(|e| parse_error(2, e.to_string()))?,
        state: state
            .parse::<JobState>()
            .map_err(|e| parse_error(3, e.to_string()))?,
        retry_count: row.get(4)?,
        retry_limit: row.get(5)?,
        start_after: from_millis(row.get(6)?),
        created_at: from_millis(row.get(7)?),
        started_at: opt_from_millis(row.get(8)?),
        completed_at: opt_from_millis(row.get(9)?),
        output: output
            .map(|o| serde_json::from_str(&o))
            .transpose()
            .map_err(|e| parse_error(10, e.to_string()))?,
    })
}

fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<Schedule> {
    let queue: String = row.get(1)?;
    let payload: String = row.get(4)?;

    Ok(Schedule {
        name: row.get(0)?,
        queue: queue
            .parse::<QueueName>()
            .map_err(|e| parse_error(1, e.to_string()))?,
        cron: row.get(2)?,
        timezone: row.get(3)?,
        payload: serde_json::from_str(&payload).map_err(|e| parse_error(4, e.to_string()))?,
        last_fired_at: opt_from_millis(row.get(5)?),
        created_at: from_millis(row.get(6)?),
    })
}

/// Backoff for the next attempt: `retry_delay * 2^retry_count`
fn backoff_ms(retry_delay_ms: i64, retry_count: u32) -> i64 {
    retry_delay_ms.saturating_mul(1_i64 << retry_count.min(20))
}

/// Handle to the durable queue
#[derive(Clone)]
pub struct JobStore {
    store: Store,
    defaults: JobDefaults,
}

impl JobStore {
    pub fn new(store: Store, defaults: JobDefaults) -> Self {
        Self { store, defaults }
    }

    pub fn defaults(&self) -> &JobDefaults {
        &self.defaults
    }

    /// Enqueue a job that is ready immediately
    pub fn send(&self, queue: QueueName, payload: &serde_json::Value) -> Result<String, JobStoreError> {
        self.send_after(queue, payload, Utc::now())
    }

    /// Enqueue a job that becomes ready at `start_after`
    pub fn send_after(
        &self,
        queue: QueueName,
        payload: &serde_json::Value,
        start_after: DateTime<Utc>,
    ) -> Result<String, JobStoreError> {
        let conn = self.store.conn()?;
        self.insert_job(&conn, queue, payload, start_after)
    }

    fn insert_job(
        &self,
        conn: &Connection,
        queue: QueueName,
        payload: &serde_json::Value,
        start_after: DateTime<Utc>,
    ) -> Result<String, JobStoreError> {
        let id = new_id();
        conn.execute(
            "INSERT INTO jobs (id, queue, payload, state, retry_count, retry_limit, retry_delay_ms, start_after, created_at)
             VALUES (?1, ?2, ?3, 'created', 0, ?4, ?5, ?6, ?7)",
            params![
                id,
                queue.as_str(),
                serde_json::to_string(payload)?,
                self.defaults.retry_limit,
                self.defaults.retry_delay.as_millis() as i64,
                to_millis(start_after),
                to_millis(Utc::now())
            ],
        )?;
        debug!(queue = %queue, job_id = %id, "Job sent");
        Ok(id)
    }

    /// Store a new raw item together with the job that fetches it.
    ///
    /// Both rows commit or neither does, so a stored item always has a job.
    /// Returns `(raw_item_id, job_id)`, or `None` without sending anything
    /// when the item was already seen.
    pub fn insert_raw_item_with_job<F>(
        &self,
        item: &NewRawItem,
        queue: QueueName,
        payload_for: F,
    ) -> Result<Option<(String, String)>, JobStoreError>
    where
        F: FnOnce(&str) -> Result<serde_json::Value, serde_json::Error>,
    {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;

        let Some(raw_item_id) = insert_raw_item(&tx, item)? else {
            return Ok(None);
        };
        let payload = payload_for(&raw_item_id)?;
        let job_id = self.insert_job(&tx, queue, &payload, Utc::now())?;

        tx.commit()?;
        Ok(Some((raw_item_id, job_id)))
    }

    /// Claim up to `batch` ready jobs, oldest first
    pub fn fetch(
        &self,
        queue: QueueName,
        batch: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        if batch == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;

        let ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs
                 WHERE queue = ?1 AND state IN ('created', 'retry') AND start_after <= ?2
                 ORDER BY created_at, rowid
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![queue.as_str(), to_millis(now), batch as i64], |row| {
                    row.get(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut jobs = Vec::with_capacity(ids.len());
        for id in &ids {
            tx.execute(
                "UPDATE jobs SET state = 'active', started_at = ?2, keepalive_at = ?2 WHERE id = ?1",
                params![id, to_millis(now)],
            )?;
            let job = tx.query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                row_to_job,
            )?;
            jobs.push(job);
        }

        tx.commit()?;
        Ok(jobs)
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        let conn = self.store.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Explain why a state transition matched no row
    fn transition_error(&self, conn: &rusqlite::Connection, id: &str) -> JobStoreError {
        let state: Result<Option<String>, rusqlite::Error> = conn
            .query_row("SELECT state FROM jobs WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional();
        match state {
            Ok(Some(state)) => JobStoreError::NotActive {
                id: id.to_string(),
                state,
            },
            Ok(None) => JobStoreError::NotFound(id.to_string()),
            Err(e) => JobStoreError::Sqlite(e),
        }
    }

    /// Renew the lease of an active job. Returns false once the job has
    /// left `active`, e.g. because it was reclaimed.
    pub fn keepalive(&self, id: &str, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE jobs SET keepalive_at = ?2 WHERE id = ?1 AND state = 'active'",
            params![id, to_millis(now)],
        )?;
        Ok(changed > 0)
    }

    /// Mark an active job completed
    pub fn complete(&self, id: &str, output: Option<&serde_json::Value>) -> Result<(), JobStoreError> {
        let conn = self.store.conn()?;
        let output = output.map(serde_json::to_string).transpose()?;
        let changed = conn.execute(
            "UPDATE jobs SET state = 'completed', completed_at = ?2, output = ?3
             WHERE id = ?1 AND state = 'active'",
            params![id, to_millis(Utc::now()), output],
        )?;
        if changed == 0 {
            return Err(self.transition_error(&conn, id));
        }
        Ok(())
    }

    /// Record a failed attempt. Returns the resulting state: `Retry` while
    /// attempts remain, `Failed` once `retry_limit` is spent.
    pub fn fail(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<JobState, JobStoreError> {
        let conn = self.store.conn()?;
        let row: Option<(u32, u32, i64, String)> = conn
            .query_row(
                "SELECT retry_count, retry_limit, retry_delay_ms, state FROM jobs WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let (retry_count, retry_limit, retry_delay_ms, state) =
            row.ok_or_else(|| JobStoreError::NotFound(id.to_string()))?;
        if state != JobState::Active.as_str() {
            return Err(JobStoreError::NotActive {
                id: id.to_string(),
                state,
            });
        }

        let output = serde_json::to_string(&json!({ "error": error }))?;

        if retry_count < retry_limit {
            let start_after = to_millis(now) + backoff_ms(retry_delay_ms, retry_count);
            conn.execute(
                "UPDATE jobs SET state = 'retry', retry_count = retry_count + 1,
                     start_after = ?2, started_at = NULL, keepalive_at = NULL, output = ?3
                 WHERE id = ?1",
                params![id, start_after, output],
            )?;
            Ok(JobState::Retry)
        } else {
            conn.execute(
                "UPDATE jobs SET state = 'failed', completed_at = ?2, output = ?3 WHERE id = ?1",
                params![id, to_millis(now), output],
            )?;
            Ok(JobState::Failed)
        }
    }

    /// Count the attempt and defer the job until `until`.
    ///
    /// Deferrals are not bounded by `retry_limit`; they wait on an external
    /// reset that always arrives.
    pub fn fail_until(&self, id: &str, error: &str, until: DateTime<Utc>) -> Result<(), JobStoreError> {
        let conn = self.store.conn()?;
        let output = serde_json::to_string(&json!({ "error": error, "deferredUntil": until }))?;
        let changed = conn.execute(
            "UPDATE jobs SET state = 'retry', retry_count = retry_count + 1,
                 start_after = ?2, started_at = NULL, keepalive_at = NULL, output = ?3
             WHERE id = ?1 AND state = 'active'",
            params![id, to_millis(until), output],
        )?;
        if changed == 0 {
            return Err(self.transition_error(&conn, id));
        }
        Ok(())
    }

    /// Fail without retry
    pub fn fail_permanently(&self, id: &str, error: &str) -> Result<(), JobStoreError> {
        let conn = self.store.conn()?;
        let output = serde_json::to_string(&json!({ "error": error }))?;
        let changed = conn.execute(
            "UPDATE jobs SET state = 'failed', completed_at = ?2, output = ?3
             WHERE id = ?1 AND state = 'active'",
            params![id, to_millis(Utc::now()), output],
        )?;
        if changed == 0 {
            return Err(self.transition_error(&conn, id));
        }
        Ok(())
    }

    /// Reclaim `active` jobs whose lease was last renewed more than
    /// `expire_in` ago.
    ///
    /// Each reclaimed job counts as a failed attempt. Returns how many rows
    /// were moved back to `retry` or on to `failed`.
    pub fn expire_active(&self, now: DateTime<Utc>, expire_in: Duration) -> Result<usize, JobStoreError> {
        let conn = self.store.conn()?;
        let cutoff = to_millis(now) - expire_in.as_millis() as i64;
        let output = serde_json::to_string(&json!({ "error": "expired while active" }))?;

        let retried = conn.execute(
            "UPDATE jobs SET state = 'retry', retry_count = retry_count + 1,
                 start_after = ?2, started_at = NULL, keepalive_at = NULL, output = ?3
             WHERE state = 'active' AND keepalive_at < ?1 AND retry_count < retry_limit",
            params![cutoff, to_millis(now), output],
        )?;
        let failed = conn.execute(
            "UPDATE jobs SET state = 'failed', completed_at = ?2, output = ?3
             WHERE state = 'active' AND keepalive_at < ?1",
            params![cutoff, to_millis(now), output],
        )?;
        Ok(retried + failed)
    }

    /// Delete finished jobs older than `before`
    pub fn archive_finished(&self, before: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let conn = self.store.conn()?;
        let removed = conn.execute(
            "DELETE FROM jobs WHERE state IN ('completed', 'failed') AND completed_at < ?1",
            params![to_millis(before)],
        )?;
        Ok(removed)
    }

    /// Register or replace the recurring trigger called `name`
    pub fn upsert_schedule(
        &self,
        name: &str,
        queue: QueueName,
        cron: &str,
        timezone: &str,
        payload: &serde_json::Value,
    ) -> Result<(), JobStoreError> {
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT INTO schedules (name, queue, cron, timezone, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (name) DO UPDATE SET
                queue = excluded.queue,
                cron = excluded.cron,
                timezone = excluded.timezone,
                payload = excluded.payload",
            params![
                name,
                queue.as_str(),
                cron,
                timezone,
                serde_json::to_string(payload)?,
                to_millis(Utc::now())
            ],
        )?;
        Ok(())
    }

    pub fn schedules(&self) -> Result<Vec<Schedule>, JobStoreError> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, queue, cron, timezone, payload, last_fired_at, created_at
             FROM schedules ORDER BY name",
        )?;
        let schedules = stmt
            .query_map([], row_to_schedule)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(schedules)
    }

    pub fn mark_schedule_fired(&self, name: &str, at: DateTime<Utc>) -> Result<(), JobStoreError> {
        let conn = self.store.conn()?;
        conn.execute(
            "UPDATE schedules SET last_fired_at = ?2 WHERE name = ?1",
            params![name, to_millis(at)],
        )?;
        Ok(())
    }

    /// Job counts keyed by queue, then state
    pub fn counts_by_queue_state(&self) -> Result<BTreeMap<String, BTreeMap<String, u64>>, JobStoreError> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare("SELECT queue, state, COUNT(*) FROM jobs GROUP BY queue, state")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? as u64,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for (queue, state, count) in rows {
            counts.entry(queue).or_default().insert(state, count);
        }
        Ok(counts)
    }
}
