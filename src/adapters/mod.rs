//! Adapter interfaces for external systems.
//!
//! Coordinators and fetch handlers only see these traits; the HTTP and
//! subprocess implementations live in the submodules and are wired up in
//! `core::services`.

pub mod analyzer;
pub mod downloader;
pub mod extractor;
pub mod feed;
pub mod youtube;

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Content, Story};

pub use analyzer::{LogOnlyAnalyzer, WebhookAnalyzer};
pub use downloader::YtDlpDownloader;
pub use extractor::HttpExtractor;
pub use feed::{parse_feed, HttpFeedFetcher};
pub use youtube::{uploads_playlist_id, YoutubeDataClient};

/// One entry of an RSS/Atom listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    /// guid (RSS) or id (Atom), falling back to the link
    pub external_id: String,
    pub url: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    /// Podcast audio, when the item carries an enclosure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclosure_url: Option<String>,
}

/// Fetches and parses feeds
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<FeedEntry>>;
}

/// Text pulled out of a page
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedContent {
    pub text: String,
    pub lang: Option<String>,
    /// Better title than the listing had, if the page has one
    pub title: Option<String>,
}

/// Turns a URL into readable text
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, url: &str) -> Result<ExtractedContent>;
}

/// Listing entry returned by the YouTube Data API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSummary {
    pub video_id: String,
    pub title: String,
    pub channel_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// ISO 8601 duration from `videos.list`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

/// A search against YouTube
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchQuery {
    pub query: String,
    pub order: Option<String>,
    pub duration: Option<String>,
    pub published_after: Option<DateTime<Utc>>,
    pub max_results: u32,
}

/// API result with the quota it actually cost
#[derive(Debug, Clone)]
pub struct ApiPage<T> {
    pub items: Vec<T>,
    pub units: u32,
}

/// Quota-costed YouTube Data API calls
#[async_trait]
pub trait YoutubeApi: Send + Sync {
    /// Newest uploads of a playlist, at most `max`
    async fn playlist_items(&self, playlist_id: &str, max: u32) -> Result<ApiPage<VideoSummary>>;

    async fn search(&self, query: &SearchQuery) -> Result<ApiPage<VideoSummary>>;

    async fn video_details(&self, ids: &[String]) -> Result<ApiPage<VideoSummary>>;
}

/// Fetches the audio track of a video
#[async_trait]
pub trait AudioDownloader: Send + Sync {
    /// Download into `dest_dir` and return the audio file path
    async fn download(&self, video_id: &str, dest_dir: &Path) -> Result<PathBuf>;
}

/// Analyses a story once it exists
#[async_trait]
pub trait StoryAnalyzer: Send + Sync {
    async fn analyze(&self, story: &Story, content: &Content) -> Result<serde_json::Value>;
}
