//! Durable queue names, job rows and payload contracts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::source::SourceFamily;

/// Named queues served by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QueueName {
    #[serde(rename = "system:heartbeat")]
    Heartbeat,
    #[serde(rename = "ingest:pull")]
    IngestPull,
    #[serde(rename = "ingest:fetch-content")]
    FetchContent,
    #[serde(rename = "ingest:fetch-youtube-content")]
    FetchYoutubeContent,
    #[serde(rename = "analyze:llm")]
    AnalyzeLlm,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        Self::Heartbeat,
        Self::IngestPull,
        Self::FetchContent,
        Self::FetchYoutubeContent,
        Self::AnalyzeLlm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heartbeat => "system:heartbeat",
            Self::IngestPull => "ingest:pull",
            Self::FetchContent => "ingest:fetch-content",
            Self::FetchYoutubeContent => "ingest:fetch-youtube-content",
            Self::AnalyzeLlm => "analyze:llm",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown queue: {}", s))
    }
}

/// Lifecycle of a durable job row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker
    Created,
    /// Failed, waiting for `start_after` before redelivery
    Retry,
    /// Handed to a worker
    Active,
    Completed,
    /// Terminal failure
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Retry => "retry",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "retry" => Ok(Self::Retry),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => anyhow::bail!("Unknown job state: {}", s),
        }
    }
}

/// A job row as handed to workers
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub queue: QueueName,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub retry_count: u32,
    pub retry_limit: u32,
    pub start_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
}

impl Job {
    /// Deserialize the payload into its typed contract
    pub fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// A recurring trigger registered with `schedule()`
#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    /// Unique key, see [`Schedule::name_for`]
    pub name: String,
    pub queue: QueueName,
    pub cron: String,
    pub timezone: String,
    pub payload: serde_json::Value,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Schedule {
    /// Schedule key for `queue`: the queue name, suffixed with the payload's
    /// `source` so each pull family keeps its own trigger.
    pub fn name_for(queue: QueueName, payload: &serde_json::Value) -> String {
        match payload.get("source").and_then(|s| s.as_str()) {
            Some(source) => format!("{}/{}", queue, source),
            None => queue.as_str().to_string(),
        }
    }
}

// ============================================================================
// Payload contracts
// ============================================================================

/// `system:heartbeat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub ping: String,
}

impl Default for HeartbeatPayload {
    fn default() -> Self {
        Self {
            ping: "ok".to_string(),
        }
    }
}

/// `ingest:pull`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullPayload {
    pub source: SourceFamily,
}

/// `ingest:fetch-content`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchContentPayload {
    pub raw_item_ids: Vec<String>,
}

/// `ingest:fetch-youtube-content`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchYoutubePayload {
    pub raw_item_ids: Vec<String>,
    pub video_id: String,
    pub source_kind: String,
}

/// `analyze:llm`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzePayload {
    pub story_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names_roundtrip() {
        for queue in QueueName::ALL {
            assert_eq!(queue.as_str().parse::<QueueName>().unwrap(), queue);
            let json = serde_json::to_value(queue).unwrap();
            assert_eq!(json, queue.as_str());
        }
        assert!("ingest:unknown".parse::<QueueName>().is_err());
    }

    #[test]
    fn test_payload_wire_names() {
        let payload = FetchYoutubePayload {
            raw_item_ids: vec!["r1".to_string()],
            video_id: "dQw4w9WgXcQ".to_string(),
            source_kind: "youtube_channel".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["rawItemIds"][0], "r1");
        assert_eq!(json["videoId"], "dQw4w9WgXcQ");
        assert_eq!(json["sourceKind"], "youtube_channel");

        let pull: PullPayload = serde_json::from_str(r#"{"source":"youtube"}"#).unwrap();
        assert_eq!(pull.source, SourceFamily::Youtube);

        let analyze = serde_json::to_value(AnalyzePayload {
            story_id: "s1".to_string(),
        })
        .unwrap();
        assert_eq!(analyze["storyId"], "s1");

        assert_eq!(
            serde_json::to_value(HeartbeatPayload::default()).unwrap(),
            serde_json::json!({"ping": "ok"})
        );
    }
}
