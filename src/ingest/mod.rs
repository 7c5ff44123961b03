//! Content ingestion pipeline.
//!
//! ```text
//! ingest:pull ──► RssCoordinator / YoutubeCoordinator ──► raw items
//!                                                            │
//!          ingest:fetch-content ◄────────────────────────────┤
//!          ingest:fetch-youtube-content ◄────────────────────┘
//!                 │                       │
//!                 │          download ──► TranscriptionQueue
//!                 ▼                       ▼
//!            StoryDeduper (content hash) ──► analyze:llm
//! ```

pub mod canonical;
pub mod dedup;
pub mod handlers;
pub mod queue;
pub mod rss;
pub mod transcriber;
pub mod youtube;

use serde::Serialize;

// Re-export key types
pub use canonical::{canonicalize_url, classify_url, UrlKind};
pub use dedup::{content_hash, normalize_text, StoryDeduper};
pub use handlers::{
    AnalyzeHandler, FetchContentHandler, FetchYoutubeHandler, HeartbeatHandler, PullHandler,
};
pub use queue::{
    JobStatus, Priority, QueueStats, RemoveWorkingFiles, TranscriptionError, TranscriptionJob,
    TranscriptionQueue, TranscriptionQueueConfig,
};
pub use rss::RssCoordinator;
pub use transcriber::{TranscribeOptions, Transcriber, Transcript, WhisperTranscriber};
pub use youtube::{YoutubeCoordinator, YoutubeSettings};

/// Outcome of one coordinator run across all active sources
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PullSummary {
    pub sources: usize,
    pub failed_sources: usize,
    /// Listing entries seen
    pub discovered: usize,
    /// Entries that were not already stored
    pub new_items: usize,
    pub jobs_sent: usize,
}

impl PullSummary {
    pub(crate) fn absorb(&mut self, source: SourcePull) {
        self.discovered += source.discovered;
        self.new_items += source.new_items;
        self.jobs_sent += source.jobs_sent;
    }
}

/// Per-source counters
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct SourcePull {
    pub discovered: usize,
    pub new_items: usize,
    pub jobs_sent: usize,
}
