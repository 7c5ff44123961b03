//! Ingestion sources.
//!
//! A source is an operator-registered provider endpoint. Its kind is a closed
//! enum carrying the per-kind metadata (channel ids, search facets, cursors),
//! so coordinators match on it exhaustively instead of comparing strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider family used by `ingest:pull` jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFamily {
    /// RSS/Atom feeds and podcast feeds
    Rss,
    /// YouTube channels and searches (quota-costed)
    Youtube,
}

impl SourceFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rss => "rss",
            Self::Youtube => "youtube",
        }
    }

    /// All families that get a bootstrap pull on startup
    pub fn all() -> [SourceFamily; 2] {
        [Self::Rss, Self::Youtube]
    }
}

impl std::fmt::Display for SourceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceFamily {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "rss" | "feed" => Ok(Self::Rss),
            "youtube" | "yt" => Ok(Self::Youtube),
            _ => anyhow::bail!("Unknown source family: {}", s),
        }
    }
}

/// Kind of source with its kind-specific state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    /// RSS or Atom feed
    Rss,

    /// Podcast feed (iTunes-flavoured RSS)
    Podcast,

    /// Uploads of a single YouTube channel
    YoutubeChannel {
        channel_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uploads_playlist_id: Option<String>,
    },

    /// Keyword search against YouTube
    YoutubeSearch {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<String>,
        /// Cursor: only videos published after this instant are requested
        #[serde(default, skip_serializing_if = "Option::is_none")]
        published_after: Option<DateTime<Utc>>,
    },

    /// Owner of one-off URLs submitted by operators
    Manual,
}

impl SourceKind {
    /// Stable column value for the `kind` field
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rss => "rss",
            Self::Podcast => "podcast",
            Self::YoutubeChannel { .. } => "youtube_channel",
            Self::YoutubeSearch { .. } => "youtube_search",
            Self::Manual => "manual",
        }
    }

    /// Family this kind is pulled by, if any
    pub fn family(&self) -> Option<SourceFamily> {
        match self {
            Self::Rss | Self::Podcast => Some(SourceFamily::Rss),
            Self::YoutubeChannel { .. } | Self::YoutubeSearch { .. } => Some(SourceFamily::Youtube),
            Self::Manual => None,
        }
    }
}

/// A registered ingestion source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,

    /// Operator-facing label
    pub name: String,

    pub kind: SourceKind,

    /// Feed URL, channel URL or search landing URL
    pub url: String,

    /// Paused sources are skipped by coordinators
    pub active: bool,

    pub last_checked: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Source {
    /// Create a new active source with a fresh id
    pub fn new(name: impl Into<String>, kind: SourceKind, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            kind,
            url: url.into(),
            active: true,
            last_checked: None,
            created_at: Utc::now(),
        }
    }
}
