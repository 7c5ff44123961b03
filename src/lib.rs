//! storyloom - scheduled content ingestion orchestrator
//!
//! Pulls articles, podcasts and videos from external providers on a
//! schedule, deduplicates them into stories and feeds them through a
//! fetch → transcribe → analyze pipeline.
//!
//! # Architecture
//!
//! Everything runs as jobs on named durable queues:
//! - `system:heartbeat` proves the loop is alive
//! - `ingest:pull` runs an ingestion coordinator (RSS or YouTube)
//! - `ingest:fetch-content` / `ingest:fetch-youtube-content` extract content
//!   and attach it to a story by content hash
//! - `analyze:llm` hands new stories to an analyzer
//!
//! YouTube calls pass a quota gate first; transcriptions go through a
//! bounded-concurrency queue with retry and backoff.
//!
//! # Modules
//!
//! - `adapters`: External collaborators (feeds, extractor, YouTube API, yt-dlp, analyzer)
//! - `core`: Orchestration (durable queues, cron, quota, retry, service wiring)
//! - `domain`: Data structures (Source, RawItem, Story, Job, payloads)
//! - `ingest`: Coordinators, dedup, queue handlers, transcription queue
//! - `store`: SQLite persistence
//! - `server`: Operational HTTP surface
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run scheduler, workers and the ops server
//! storyloom serve
//!
//! # Register a feed and pull it now
//! storyloom sources add rss https://example.com/feed.xml
//! storyloom pull rss --now
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;
pub mod server;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, QuotaTracker, Services};
pub use domain::{QueueName, RawItem, Source, SourceFamily, SourceKind, Story};
pub use ingest::{TranscriptionQueue, TranscriptionQueueConfig};
pub use store::Store;
