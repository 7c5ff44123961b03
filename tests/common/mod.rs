//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use storyloom::adapters::{
    ApiPage, AudioDownloader, ContentExtractor, ExtractedContent, FeedEntry, FeedFetcher,
    SearchQuery, StoryAnalyzer, VideoSummary, YoutubeApi,
};
use storyloom::config::ResolvedConfig;
use storyloom::core::services::Collaborators;
use storyloom::domain::{Content, Story};
use storyloom::ingest::{TranscribeOptions, Transcriber, Transcript};

/// Config rooted at `dir` with defaults everywhere else
pub fn test_config(dir: &Path) -> ResolvedConfig {
    let mut cfg = ResolvedConfig {
        home: dir.to_path_buf(),
        database: dir.join("storyloom.db"),
        work_dir: dir.join("work"),
        config_file: None,
        scheduler: Default::default(),
        quota: Default::default(),
        youtube: Default::default(),
        transcription: Default::default(),
        server: Default::default(),
        analyzer: Default::default(),
    };
    cfg.scheduler.bootstrap = false;
    cfg
}

/// Feeds served from a map; unknown URLs fail like a dead host
#[derive(Default)]
pub struct StaticFeeds(pub HashMap<String, Vec<FeedEntry>>);

#[async_trait]
impl FeedFetcher for StaticFeeds {
    async fn fetch(&self, url: &str) -> Result<Vec<FeedEntry>> {
        self.0
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("connection refused: {}", url))
    }
}

pub fn entry(external_id: &str, url: &str, title: &str) -> FeedEntry {
    FeedEntry {
        external_id: external_id.to_string(),
        url: url.to_string(),
        title: title.to_string(),
        published_at: None,
        enclosure_url: None,
    }
}

/// Pages keyed by canonical URL
#[derive(Default)]
pub struct StaticPages(pub HashMap<String, String>);

#[async_trait]
impl ContentExtractor for StaticPages {
    async fn extract(&self, url: &str) -> Result<ExtractedContent> {
        let key = storyloom::ingest::canonicalize_url(url)?;
        let text = self
            .0
            .get(&key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("404 for {}", url))?;
        Ok(ExtractedContent {
            text,
            lang: Some("en".to_string()),
            title: None,
        })
    }
}

/// Records every call; listings come from `videos`
#[derive(Default)]
pub struct RecordingYoutube {
    pub videos: Vec<VideoSummary>,
    pub calls: Mutex<Vec<String>>,
}

impl RecordingYoutube {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl YoutubeApi for RecordingYoutube {
    async fn playlist_items(&self, playlist_id: &str, _max: u32) -> Result<ApiPage<VideoSummary>> {
        self.calls.lock().unwrap().push(format!("playlistItems:{}", playlist_id));
        Ok(ApiPage {
            items: self.videos.clone(),
            units: 1,
        })
    }

    async fn search(&self, query: &SearchQuery) -> Result<ApiPage<VideoSummary>> {
        self.calls.lock().unwrap().push(format!("search:{}", query.query));
        Ok(ApiPage {
            items: self.videos.clone(),
            units: 100,
        })
    }

    async fn video_details(&self, ids: &[String]) -> Result<ApiPage<VideoSummary>> {
        self.calls.lock().unwrap().push(format!("videos:{}", ids.len()));
        Ok(ApiPage {
            items: Vec::new(),
            units: 1,
        })
    }
}

/// Writes a small file named after the video
pub struct FakeDownloader;

#[async_trait]
impl AudioDownloader for FakeDownloader {
    async fn download(&self, video_id: &str, dest_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join(format!("{}.mp3", video_id));
        tokio::fs::write(&path, b"not really audio").await?;
        Ok(path)
    }
}

/// Returns a fixed transcript
pub struct EchoTranscriber(pub String);

#[async_trait]
impl Transcriber for EchoTranscriber {
    async fn transcribe(&self, _audio: &Path, _options: &TranscribeOptions) -> Result<Transcript> {
        Ok(Transcript {
            text: self.0.clone(),
            segments: Vec::new(),
            language: "en".to_string(),
            duration: 1.0,
        })
    }
}

/// Counts analyses
#[derive(Default)]
pub struct CountingAnalyzer(pub AtomicUsize);

#[async_trait]
impl StoryAnalyzer for CountingAnalyzer {
    async fn analyze(&self, _story: &Story, content: &Content) -> Result<serde_json::Value> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "chars": content.text.len() }))
    }
}

pub fn collaborators(
    feeds: StaticFeeds,
    pages: StaticPages,
    youtube: Option<Arc<RecordingYoutube>>,
) -> Collaborators {
    Collaborators {
        feeds: Arc::new(feeds),
        extractor: Arc::new(pages),
        youtube: youtube.map(|y| y as Arc<dyn YoutubeApi>),
        downloader: Arc::new(FakeDownloader),
        transcriber: Arc::new(EchoTranscriber("a transcribed talk".to_string())),
        analyzer: Arc::new(CountingAnalyzer::default()),
    }
}
