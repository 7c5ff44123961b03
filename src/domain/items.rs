//! Raw items, extracted content and stories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of material a raw item points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Article,
    Video,
    Audio,
    Paper,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Article => "article",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Paper => "paper",
        }
    }
}

impl std::str::FromStr for ItemKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "article" => Ok(Self::Article),
            "video" => Ok(Self::Video),
            "audio" => Ok(Self::Audio),
            "paper" => Ok(Self::Paper),
            _ => anyhow::bail!("Unknown item kind: {}", s),
        }
    }
}

/// Processing status of a raw item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawItemStatus {
    /// Discovered, waiting for a fetch worker
    Pending,
    /// Content extracted and attached to a story
    Fetched,
    /// Last fetch attempt failed
    Failed,
    /// Unsupported or malformed, never retried
    Skipped,
}

impl RawItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetched => "fetched",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for RawItemStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "fetched" => Ok(Self::Fetched),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => anyhow::bail!("Unknown raw item status: {}", s),
        }
    }
}

/// A provider-discovered candidate, keyed by (source_id, external_id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawItem {
    pub id: String,
    pub source_id: String,
    pub external_id: String,
    pub url: String,
    pub title: String,
    pub kind: ItemKind,
    pub metadata: serde_json::Value,
    pub status: RawItemStatus,
    pub attempts: u32,
    pub published_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
}

/// Input for the idempotent raw-item upsert
#[derive(Debug, Clone)]
pub struct NewRawItem {
    pub source_id: String,
    pub external_id: String,
    pub url: String,
    pub title: String,
    pub kind: ItemKind,
    pub metadata: serde_json::Value,
    pub published_at: Option<DateTime<Utc>>,
}

impl NewRawItem {
    pub fn new(
        source_id: impl Into<String>,
        external_id: impl Into<String>,
        url: impl Into<String>,
        title: impl Into<String>,
        kind: ItemKind,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            external_id: external_id.into(),
            url: url.into(),
            title: title.into(),
            kind,
            metadata: serde_json::Value::Null,
            published_at: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_published_at(mut self, published_at: Option<DateTime<Utc>>) -> Self {
        self.published_at = published_at;
        self
    }
}

/// Extracted text or transcript for one raw item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub id: String,
    pub raw_item_id: String,
    pub text: String,
    /// Hex SHA-256 of the normalized text
    pub content_hash: String,
    pub lang: Option<String>,
    pub extracted_at: DateTime<Utc>,
}

/// Canonical record, one per distinct content hash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub content_id: String,
    pub content_hash: String,
    pub canonical_url: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub cluster_key: String,
    pub analysis: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
