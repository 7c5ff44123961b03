//! Content hashing and story creation.
//!
//! Two raw items whose extracted text is equal after whitespace
//! normalization share one story, whichever source they came from.

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::adapters::ExtractedContent;
use crate::core::{Dispatcher, JobError};
use crate::domain::{AnalyzePayload, QueueName, RawItem};
use crate::store::{DedupOutcome, NewContent, Store, StoryDraft};

use super::canonical::canonicalize_url;

/// Collapse every whitespace run to a single space and trim
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Hex SHA-256 of the normalized text
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    hex::encode(hasher.finalize())
}

/// Coarse grouping key for related stories: publish day plus the leading
/// significant words of the title.
pub fn cluster_key(title: &str, published_at: Option<chrono::DateTime<chrono::Utc>>) -> String {
    let words: Vec<String> = title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2)
        .map(|w| w.to_lowercase())
        .take(6)
        .collect();

    let day = published_at
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "undated".to_string());

    format!("{}:{}", day, words.join("-"))
}

/// Creates or attaches stories and queues analysis for new ones
#[derive(Clone)]
pub struct StoryDeduper {
    store: Store,
    dispatcher: Dispatcher,
}

impl StoryDeduper {
    pub fn new(store: Store, dispatcher: Dispatcher) -> Self {
        Self { store, dispatcher }
    }

    /// Whether a story with this content hash already exists
    pub fn find_story_id_by_content_hash(&self, hash: &str) -> Result<Option<String>, JobError> {
        Ok(self.store.find_story_id_by_content_hash(hash)?)
    }

    /// Store the content of `item` and link it to a story.
    ///
    /// Empty text is rejected as invalid input for that item.
    pub fn ingest(&self, item: &RawItem, extracted: &ExtractedContent) -> Result<DedupOutcome, JobError> {
        let text = normalize_text(&extracted.text);
        if text.is_empty() {
            return Err(JobError::invalid(format!("no text extracted from {}", item.url)));
        }

        let hash = content_hash(&text);
        let title = extracted
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| item.title.clone());
        let canonical_url = canonicalize_url(&item.url).unwrap_or_else(|_| item.url.clone());

        let outcome = self.store.attach_content(
            &NewContent {
                raw_item_id: item.id.clone(),
                text,
                content_hash: hash.clone(),
                lang: extracted.lang.clone(),
            },
            &StoryDraft {
                canonical_url,
                cluster_key: cluster_key(&title, item.published_at),
                title,
                published_at: item.published_at,
            },
        )?;

        match &outcome {
            DedupOutcome::NewStory { story_id, .. } => {
                self.dispatcher
                    .send(
                        QueueName::AnalyzeLlm,
                        &AnalyzePayload {
                            story_id: story_id.clone(),
                        },
                    )
                    .map_err(JobError::transient)?;
                info!(story_id = %story_id, raw_item_id = %item.id, "Story created");
            }
            DedupOutcome::Attached { story_id, .. } => {
                debug!(story_id = %story_id, raw_item_id = %item.id, hash = %hash, "Content attached to existing story");
            }
        }

        Ok(outcome)
    }
}
