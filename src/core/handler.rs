//! Work handler contract for queue workers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::Job;
use crate::store::StoreError;

use super::job_store::JobStoreError;

/// Outcome taxonomy of a failed job attempt
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// Network hiccups, provider 5xx, store contention: retried with backoff
    #[error("{0}")]
    Transient(String),

    /// The provider's daily quota is spent; retry after the reset
    #[error("Quota exhausted until {reset_at}: {message}")]
    QuotaExhausted {
        reset_at: DateTime<Utc>,
        message: String,
    },

    /// Malformed payload or unsupported input; never retried
    #[error("Invalid job: {0}")]
    Invalid(String),
}

impl JobError {
    pub fn transient(msg: impl std::fmt::Display) -> Self {
        Self::Transient(msg.to_string())
    }

    pub fn invalid(msg: impl std::fmt::Display) -> Self {
        Self::Invalid(msg.to_string())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(e: anyhow::Error) -> Self {
        Self::Transient(format!("{:#}", e))
    }
}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        Self::Transient(e.to_string())
    }
}

impl From<JobStoreError> for JobError {
    fn from(e: JobStoreError) -> Self {
        Self::Transient(e.to_string())
    }
}

/// Payloads that do not deserialize are a contract violation
impl From<serde_json::Error> for JobError {
    fn from(e: serde_json::Error) -> Self {
        Self::Invalid(format!("bad payload: {}", e))
    }
}

/// Handles one job of a named queue
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<(), JobError>;
}
