//! Work handlers for the named queues.

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::adapters::{AudioDownloader, ContentExtractor, ExtractedContent, StoryAnalyzer};
use crate::core::{JobError, JobHandler};
use crate::domain::{
    AnalyzePayload, FetchContentPayload, FetchYoutubePayload, HeartbeatPayload, ItemKind, Job,
    PullPayload, RawItem, RawItemStatus, SourceFamily,
};
use crate::store::Store;

use super::dedup::StoryDeduper;
use super::queue::{JobStatus, Priority, TranscriptionQueue};
use super::rss::RssCoordinator;
use super::transcriber::TranscribeOptions;
use super::youtube::YoutubeCoordinator;

/// `system:heartbeat`: proves the queue loop is alive
#[derive(Default)]
pub struct HeartbeatHandler {
    last_beat_ms: AtomicI64,
}

impl HeartbeatHandler {
    pub fn last_beat(&self) -> Option<DateTime<Utc>> {
        match self.last_beat_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }
}

#[async_trait]
impl JobHandler for HeartbeatHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload: HeartbeatPayload = job.payload()?;
        self.last_beat_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
        debug!(ping = %payload.ping, "Heartbeat");
        Ok(())
    }
}

/// `ingest:pull`: runs the coordinator of one source family
pub struct PullHandler {
    rss: Arc<RssCoordinator>,
    youtube: Option<Arc<YoutubeCoordinator>>,
}

impl PullHandler {
    pub fn new(rss: Arc<RssCoordinator>, youtube: Option<Arc<YoutubeCoordinator>>) -> Self {
        Self { rss, youtube }
    }
}

#[async_trait]
impl JobHandler for PullHandler {
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload: PullPayload = job.payload()?;
        match payload.source {
            SourceFamily::Rss => {
                self.rss.pull().await?;
            }
            SourceFamily::Youtube => {
                let youtube = self
                    .youtube
                    .as_ref()
                    .ok_or_else(|| JobError::invalid("YouTube ingestion is not configured"))?;
                youtube.pull().await?;
            }
        }
        Ok(())
    }
}

/// Load the items of a payload, dropping unknown ids and finished items
fn pending_items(store: &Store, ids: &[String]) -> Result<Vec<RawItem>, JobError> {
    if ids.is_empty() {
        return Err(JobError::invalid("rawItemIds is empty"));
    }

    let mut items = Vec::with_capacity(ids.len());
    for id in ids {
        match store.get_raw_item(id)? {
            None => warn!(raw_item_id = %id, "Raw item no longer exists"),
            Some(item) if matches!(item.status, RawItemStatus::Fetched | RawItemStatus::Skipped) => {
                debug!(raw_item_id = %id, status = item.status.as_str(), "Already handled, skipping")
            }
            Some(item) => items.push(item),
        }
    }
    Ok(items)
}

/// `ingest:fetch-content`: extract text and attach it to a story
pub struct FetchContentHandler {
    store: Store,
    extractor: Arc<dyn ContentExtractor>,
    deduper: StoryDeduper,
}

impl FetchContentHandler {
    pub fn new(store: Store, extractor: Arc<dyn ContentExtractor>, deduper: StoryDeduper) -> Self {
        Self {
            store,
            extractor,
            deduper,
        }
    }

    async fn fetch_one(&self, item: &RawItem) -> Result<(), JobError> {
        if item.kind == ItemKind::Audio && item.metadata["enclosureOnly"] == true {
            return Err(JobError::invalid("audio enclosure without an episode page"));
        }

        let extracted = self.extractor.extract(&item.url).await?;
        let outcome = self.deduper.ingest(item, &extracted)?;
        self.store
            .mark_raw_item(&item.id, RawItemStatus::Fetched, None)?;
        debug!(raw_item_id = %item.id, story_id = outcome.story_id(), "Content fetched");
        Ok(())
    }
}

#[async_trait]
impl JobHandler for FetchContentHandler {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload: FetchContentPayload = job.payload()?;
        let items = pending_items(&self.store, &payload.raw_item_ids)?;

        let mut retry = Vec::new();
        for item in &items {
            match self.fetch_one(item).await {
                Ok(()) => {}
                Err(JobError::Invalid(reason)) => {
                    warn!(raw_item_id = %item.id, url = %item.url, reason = %reason, "Item skipped");
                    self.store
                        .mark_raw_item(&item.id, RawItemStatus::Skipped, Some(&reason))?;
                }
                Err(e) => {
                    let reason = e.to_string();
                    warn!(raw_item_id = %item.id, url = %item.url, error = %reason, "Fetch failed");
                    self.store
                        .mark_raw_item(&item.id, RawItemStatus::Failed, Some(&reason))?;
                    retry.push(reason);
                }
            }
        }

        // Redelivery skips what already went through
        if retry.is_empty() {
            Ok(())
        } else {
            Err(JobError::Transient(format!(
                "{} of {} items failed: {}",
                retry.len(),
                items.len(),
                retry.join("; ")
            )))
        }
    }
}

/// `ingest:fetch-youtube-content`: download, transcribe, dedup
pub struct FetchYoutubeHandler {
    store: Store,
    downloader: Arc<dyn AudioDownloader>,
    transcription: Arc<TranscriptionQueue>,
    deduper: StoryDeduper,
    work_dir: PathBuf,
    wait_timeout: Duration,
}

impl FetchYoutubeHandler {
    pub fn new(
        store: Store,
        downloader: Arc<dyn AudioDownloader>,
        transcription: Arc<TranscriptionQueue>,
        deduper: StoryDeduper,
        work_dir: impl Into<PathBuf>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            store,
            downloader,
            transcription,
            deduper,
            work_dir: work_dir.into(),
            wait_timeout,
        }
    }

    /// Fetch audio into one directory per attempt; the transcription cleanup removes it
    async fn download(&self, video_id: &str, attempt: u32, items: &[RawItem]) -> Result<PathBuf, JobError> {
        let dest = self.work_dir.join(format!("{}-{}", video_id, attempt));
        match self.downloader.download(video_id, &dest).await {
            Ok(path) => Ok(path),
            Err(e) => {
                let reason = format!("download failed: {:#}", e);
                self.mark_all(items, RawItemStatus::Failed, &reason)?;
                // Nothing was queued, so nothing else will remove it
                if let Err(e) = tokio::fs::remove_dir_all(&dest).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(dir = %dest.display(), error = %e, "Failed to remove download directory");
                    }
                }
                Err(JobError::Transient(reason))
            }
        }
    }

    fn mark_all(&self, items: &[RawItem], status: RawItemStatus, reason: &str) -> Result<(), JobError> {
        for item in items {
            self.store.mark_raw_item(&item.id, status, Some(reason))?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for FetchYoutubeHandler {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload: FetchYoutubePayload = job.payload()?;
        if payload.video_id.trim().is_empty() {
            return Err(JobError::invalid("videoId is empty"));
        }

        let items = pending_items(&self.store, &payload.raw_item_ids)?;
        if items.is_empty() {
            return Ok(());
        }

        // A redelivered job picks up the transcription it already queued
        let transcription_id = match self.transcription.find_reusable(&payload.video_id) {
            Some(id) => {
                info!(video_id = %payload.video_id, transcription_id = %id, "Reusing queued transcription");
                id
            }
            None => {
                let audio = self.download(&payload.video_id, job.retry_count, &items).await?;
                self.transcription.add_job(
                    &payload.video_id,
                    audio,
                    TranscribeOptions::default(),
                    Priority::Medium,
                    None,
                )
            }
        };

        let Some(finished) = self
            .transcription
            .wait_for_job(&transcription_id, self.wait_timeout)
            .await
        else {
            return Err(JobError::transient(format!(
                "transcription {} did not finish within {:?}",
                transcription_id, self.wait_timeout
            )));
        };

        let transcript = match (finished.status, finished.result) {
            (JobStatus::Completed, Some(transcript)) => transcript,
            _ => {
                let reason = finished
                    .error
                    .unwrap_or_else(|| "transcription failed".to_string());
                self.mark_all(&items, RawItemStatus::Failed, &reason)?;
                return Err(JobError::Transient(reason));
            }
        };

        let extracted = ExtractedContent {
            text: transcript.text,
            lang: Some(transcript.language).filter(|l| !l.is_empty()),
            title: None,
        };

        for item in &items {
            match self.deduper.ingest(item, &extracted) {
                Ok(outcome) => {
                    self.store.mark_raw_item(&item.id, RawItemStatus::Fetched, None)?;
                    info!(video_id = %payload.video_id, story_id = outcome.story_id(), "Video transcribed");
                }
                Err(JobError::Invalid(reason)) => {
                    self.store
                        .mark_raw_item(&item.id, RawItemStatus::Skipped, Some(&reason))?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// `analyze:llm`: hand a new story to the analyzer
pub struct AnalyzeHandler {
    store: Store,
    analyzer: Arc<dyn StoryAnalyzer>,
}

impl AnalyzeHandler {
    pub fn new(store: Store, analyzer: Arc<dyn StoryAnalyzer>) -> Self {
        Self { store, analyzer }
    }
}

#[async_trait]
impl JobHandler for AnalyzeHandler {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn handle(&self, job: &Job) -> Result<(), JobError> {
        let payload: AnalyzePayload = job.payload()?;
        let story = self
            .store
            .get_story(&payload.story_id)?
            .ok_or_else(|| JobError::invalid(format!("unknown story {}", payload.story_id)))?;

        if story.analysis.is_some() {
            debug!(story_id = %story.id, "Already analyzed");
            return Ok(());
        }

        let content = self
            .store
            .get_content(&story.content_id)?
            .ok_or_else(|| JobError::invalid(format!("story {} has no content", story.id)))?;

        let analysis = self.analyzer.analyze(&story, &content).await?;
        self.store.set_story_analysis(&story.id, &analysis)?;
        info!(story_id = %story.id, "Story analyzed");
        Ok(())
    }
}
