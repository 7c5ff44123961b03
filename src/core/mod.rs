//! Core orchestration logic.
//!
//! This module contains:
//! - JobStore: durable SQLite job queue and schedules
//! - Orchestrator: per-queue workers, cron and maintenance loops
//! - QuotaTracker: admission gate for quota-limited APIs
//! - Services: wiring of the whole pipeline

pub mod cron;
pub mod handler;
pub mod job_store;
pub mod orchestrator;
pub mod quota;
pub mod retry;
pub mod services;

// Re-export commonly used types
pub use cron::{CronError, CronTrigger};
pub use handler::{JobError, JobHandler};
pub use job_store::{JobDefaults, JobStore, JobStoreError};
pub use orchestrator::{Dispatcher, Orchestrator, OrchestratorConfig, OrchestratorError};
pub use quota::{QuotaConfig, QuotaError, QuotaTracker};
pub use retry::RetryPolicy;
pub use services::Services;
