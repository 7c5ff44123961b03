//! Domain types for storyloom.
//!
//! This module contains the core data structures:
//! - Sources: operator-registered provider endpoints
//! - Items: raw items, extracted content and canonical stories
//! - Jobs: durable queue rows and payload contracts

pub mod items;
pub mod jobs;
pub mod quota;
pub mod source;

// Re-export commonly used types
pub use items::{Content, ItemKind, NewRawItem, RawItem, RawItemStatus, Story};
pub use jobs::{
    AnalyzePayload, FetchContentPayload, FetchYoutubePayload, HeartbeatPayload, Job, JobState,
    PullPayload, QueueName, Schedule,
};
pub use quota::{QuotaStatus, UsageEntry};
pub use source::{Source, SourceFamily, SourceKind};
