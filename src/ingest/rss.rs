//! RSS and podcast ingestion.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{FeedEntry, FeedFetcher};
use crate::core::Dispatcher;
use crate::domain::{FetchContentPayload, ItemKind, NewRawItem, QueueName, Source, SourceFamily, SourceKind};
use crate::store::{Store, StoreError};

use super::canonical::canonicalize_url;
use super::{PullSummary, SourcePull};

/// Pulls every active RSS/podcast source and queues new items for fetching
pub struct RssCoordinator {
    store: Store,
    fetcher: Arc<dyn FeedFetcher>,
    dispatcher: Dispatcher,
}

impl RssCoordinator {
    pub fn new(store: Store, fetcher: Arc<dyn FeedFetcher>, dispatcher: Dispatcher) -> Self {
        Self {
            store,
            fetcher,
            dispatcher,
        }
    }

    /// Pull all active sources. A failing source is logged and skipped.
    #[instrument(skip(self))]
    pub async fn pull(&self) -> Result<PullSummary, StoreError> {
        let sources = self.store.list_active_sources(SourceFamily::Rss)?;
        let mut summary = PullSummary {
            sources: sources.len(),
            ..Default::default()
        };

        for source in &sources {
            match self.pull_source(source).await {
                Ok(counts) => summary.absorb(counts),
                Err(e) => {
                    summary.failed_sources += 1;
                    warn!(source_id = %source.id, url = %source.url, error = %format!("{:#}", e), "Feed pull failed");
                }
            }
        }

        info!(
            sources = summary.sources,
            failed = summary.failed_sources,
            new_items = summary.new_items,
            "RSS pull finished"
        );
        Ok(summary)
    }

    async fn pull_source(&self, source: &Source) -> Result<SourcePull> {
        let entries = self.fetcher.fetch(&source.url).await?;
        let mut counts = SourcePull {
            discovered: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            let item = raw_item_from_entry(source, entry);
            let sent = self
                .dispatcher
                .send_for_new_item(&item, QueueName::FetchContent, |raw_item_id| {
                    FetchContentPayload {
                        raw_item_ids: vec![raw_item_id.to_string()],
                    }
                })
                .context("Failed to store item and enqueue fetch job")?;
            if sent.is_none() {
                debug!(source_id = %source.id, external_id = %item.external_id, "Already seen");
                continue;
            }
            counts.new_items += 1;
            counts.jobs_sent += 1;
        }

        self.store.touch_source_checked(&source.id, Utc::now())?;
        debug!(source_id = %source.id, discovered = counts.discovered, new_items = counts.new_items, "Source pulled");
        Ok(counts)
    }
}

fn raw_item_from_entry(source: &Source, entry: FeedEntry) -> NewRawItem {
    let kind = match (&source.kind, &entry.enclosure_url) {
        (SourceKind::Podcast, Some(_)) => ItemKind::Audio,
        _ => ItemKind::Article,
    };
    let metadata = match &entry.enclosure_url {
        Some(enclosure) => json!({
            "enclosureUrl": enclosure,
            "enclosureOnly": *enclosure == entry.url,
        }),
        None => json!({}),
    };
    let url = canonicalize_url(&entry.url).unwrap_or(entry.url);

    NewRawItem::new(&source.id, entry.external_id, url, entry.title, kind)
        .with_metadata(metadata)
        .with_published_at(entry.published_at)
}
