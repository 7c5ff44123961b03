//! YouTube ingestion.
//!
//! Every Data API call is wrapped in reserve-then-consume: the estimated
//! cost is checked against the quota tracker before the call, and the
//! realized cost is recorded (and persisted) only after it succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::adapters::youtube::{estimate_list_cost, SEARCH_COST};
use crate::adapters::{uploads_playlist_id, SearchQuery, VideoSummary, YoutubeApi};
use crate::core::{Dispatcher, QuotaTracker};
use crate::domain::{
    FetchYoutubePayload, ItemKind, NewRawItem, QueueName, Source, SourceFamily, SourceKind,
};
use crate::store::{Store, StoreError};

use super::{PullSummary, SourcePull};

/// Per-run limits
#[derive(Debug, Clone)]
pub struct YoutubeSettings {
    /// Channel uploads older than this are ignored
    pub lookback_days: i64,
    /// Upper bound on videos requested per source per run
    pub max_per_run: u32,
    pub search_order: String,
    pub search_duration: String,
}

impl Default for YoutubeSettings {
    fn default() -> Self {
        Self {
            lookback_days: 7,
            max_per_run: 25,
            search_order: "date".to_string(),
            search_duration: "any".to_string(),
        }
    }
}

/// Pulls channel uploads and keyword searches
pub struct YoutubeCoordinator {
    store: Store,
    api: Arc<dyn YoutubeApi>,
    quota: Arc<QuotaTracker>,
    dispatcher: Dispatcher,
    settings: YoutubeSettings,
}

impl YoutubeCoordinator {
    pub fn new(
        store: Store,
        api: Arc<dyn YoutubeApi>,
        quota: Arc<QuotaTracker>,
        dispatcher: Dispatcher,
        settings: YoutubeSettings,
    ) -> Self {
        Self {
            store,
            api,
            quota,
            dispatcher,
            settings,
        }
    }

    pub fn quota(&self) -> &Arc<QuotaTracker> {
        &self.quota
    }

    /// Pull all active sources. A failing or refused source is logged and skipped.
    #[instrument(skip(self))]
    pub async fn pull(&self) -> Result<PullSummary, StoreError> {
        let sources = self.store.list_active_sources(SourceFamily::Youtube)?;
        let mut summary = PullSummary {
            sources: sources.len(),
            ..Default::default()
        };

        for source in &sources {
            let result = match &source.kind {
                SourceKind::YoutubeChannel {
                    channel_id,
                    uploads_playlist_id,
                } => {
                    self.pull_channel(source, channel_id, uploads_playlist_id.as_deref())
                        .await
                }
                SourceKind::YoutubeSearch {
                    query,
                    order,
                    duration,
                    published_after,
                } => {
                    self.pull_search(source, query, order.as_deref(), duration.as_deref(), *published_after)
                        .await
                }
                SourceKind::Rss | SourceKind::Podcast | SourceKind::Manual => {
                    Err(anyhow::anyhow!("{} is not a YouTube source", source.kind.as_str()))
                }
            };

            match result {
                Ok(counts) => summary.absorb(counts),
                Err(e) => {
                    summary.failed_sources += 1;
                    warn!(source_id = %source.id, kind = source.kind.as_str(), error = %format!("{:#}", e), "YouTube pull failed");
                }
            }
        }

        let status = self.quota.check_quota_status();
        if let Err(e) = self.store.save_quota_snapshot(self.quota.provider(), &status) {
            warn!(error = %e, "Failed to save quota snapshot");
        }

        info!(
            sources = summary.sources,
            failed = summary.failed_sources,
            new_items = summary.new_items,
            quota_used = status.used,
            quota_remaining = status.remaining,
            "YouTube pull finished"
        );
        Ok(summary)
    }

    async fn pull_channel(
        &self,
        source: &Source,
        channel_id: &str,
        playlist_id: Option<&str>,
    ) -> Result<SourcePull> {
        let playlist_id = match playlist_id {
            Some(id) => id.to_string(),
            None => {
                let derived = uploads_playlist_id(channel_id)
                    .with_context(|| format!("Cannot derive uploads playlist from {}", channel_id))?;
                self.store.update_source_kind(
                    &source.id,
                    &SourceKind::YoutubeChannel {
                        channel_id: channel_id.to_string(),
                        uploads_playlist_id: Some(derived.clone()),
                    },
                )?;
                derived
            }
        };

        let max = self.settings.max_per_run;
        self.quota
            .try_reserve("playlistItems.list", estimate_list_cost(max))?;
        let page = self.api.playlist_items(&playlist_id, max).await?;
        self.spend("playlistItems.list", page.units, json!({ "sourceId": source.id }));

        let cutoff = Utc::now() - Duration::days(self.settings.lookback_days);
        let videos: Vec<VideoSummary> = page
            .items
            .into_iter()
            .filter(|v| v.published_at.map_or(true, |at| at >= cutoff))
            .collect();

        let videos = self.with_details(source, videos).await?;
        let counts = self.insert_videos(source, videos)?;
        self.store.touch_source_checked(&source.id, Utc::now())?;
        Ok(counts)
    }

    async fn pull_search(
        &self,
        source: &Source,
        query: &str,
        order: Option<&str>,
        duration: Option<&str>,
        published_after: Option<DateTime<Utc>>,
    ) -> Result<SourcePull> {
        let started = Utc::now();
        let search = SearchQuery {
            query: query.to_string(),
            order: Some(order.unwrap_or(self.settings.search_order.as_str()).to_string()),
            duration: Some(duration.unwrap_or(self.settings.search_duration.as_str()).to_string()),
            published_after: Some(
                published_after.unwrap_or(started - Duration::days(self.settings.lookback_days)),
            ),
            max_results: self.settings.max_per_run,
        };

        self.quota.try_reserve("search.list", SEARCH_COST)?;
        let page = self.api.search(&search).await?;
        self.spend("search.list", page.units, json!({ "sourceId": source.id, "query": query }));

        let counts = self.insert_videos(source, page.items)?;

        // Advance the cursor only once the run went through
        self.store.update_source_kind(
            &source.id,
            &SourceKind::YoutubeSearch {
                query: query.to_string(),
                order: order.map(str::to_string),
                duration: duration.map(str::to_string),
                published_after: Some(started),
            },
        )?;
        self.store.touch_source_checked(&source.id, started)?;
        Ok(counts)
    }

    /// Enrich unseen videos with `videos.list` details. A refused or failed
    /// lookup leaves the listing data as is.
    async fn with_details(&self, source: &Source, videos: Vec<VideoSummary>) -> Result<Vec<VideoSummary>> {
        let mut unseen = Vec::new();
        for video in &videos {
            if self.store.find_raw_item(&source.id, &video.video_id)?.is_none() {
                unseen.push(video.video_id.clone());
            }
        }
        if unseen.is_empty() {
            return Ok(videos);
        }

        let estimate = estimate_list_cost(unseen.len() as u32);
        if let Err(e) = self.quota.try_reserve("videos.list", estimate) {
            debug!(source_id = %source.id, reset_at = %e.reset_at(), error = %e, "Skipping video details");
            return Ok(videos);
        }

        let details = match self.api.video_details(&unseen).await {
            Ok(page) => {
                self.spend("videos.list", page.units, json!({ "sourceId": source.id }));
                page.items
            }
            Err(e) => {
                warn!(source_id = %source.id, error = %format!("{:#}", e), "Video details lookup failed");
                return Ok(videos);
            }
        };

        let mut by_id: HashMap<String, VideoSummary> =
            details.into_iter().map(|v| (v.video_id.clone(), v)).collect();
        Ok(videos
            .into_iter()
            .map(|v| match by_id.remove(&v.video_id) {
                Some(detail) => VideoSummary {
                    duration: detail.duration,
                    published_at: v.published_at.or(detail.published_at),
                    ..v
                },
                None => v,
            })
            .collect())
    }

    fn insert_videos(&self, source: &Source, videos: Vec<VideoSummary>) -> Result<SourcePull> {
        let mut counts = SourcePull {
            discovered: videos.len(),
            ..Default::default()
        };

        for video in videos {
            let url = format!("https://www.youtube.com/watch?v={}", video.video_id);
            let item = NewRawItem::new(&source.id, &video.video_id, url, &video.title, ItemKind::Video)
                .with_metadata(json!({
                    "channelId": video.channel_id,
                    "duration": video.duration,
                }))
                .with_published_at(video.published_at);

            let sent = self
                .dispatcher
                .send_for_new_item(&item, QueueName::FetchYoutubeContent, |raw_item_id| {
                    FetchYoutubePayload {
                        raw_item_ids: vec![raw_item_id.to_string()],
                        video_id: video.video_id,
                        source_kind: source.kind.as_str().to_string(),
                    }
                })
                .context("Failed to store video and enqueue fetch job")?;
            if sent.is_none() {
                continue;
            }
            counts.new_items += 1;
            counts.jobs_sent += 1;
        }

        Ok(counts)
    }

    /// Record realized cost in memory and in the store
    fn spend(&self, operation: &str, units: u32, metadata: serde_json::Value) {
        let entry = self.quota.consume_quota(operation, units, Some(metadata));
        if let Err(e) = self.store.record_quota_usage(self.quota.provider(), &entry) {
            warn!(operation, error = %e, "Failed to persist quota usage");
        }
    }
}
