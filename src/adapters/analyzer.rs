//! Story analysis backends.
//!
//! Endpoint: POST <analysis webhook>
//! Auth: Bearer token (optional)

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::domain::{Content, Story};

use super::StoryAnalyzer;

/// Payload posted for each new story
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest<'a> {
    pub story_id: &'a str,
    pub title: &'a str,
    pub url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<&'a str>,
    pub text: &'a str,
}

/// Posts stories to an external analysis service and stores its JSON reply
pub struct WebhookAnalyzer {
    endpoint: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl WebhookAnalyzer {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            endpoint: endpoint.into(),
            token,
            client,
        })
    }
}

#[async_trait]
impl StoryAnalyzer for WebhookAnalyzer {
    async fn analyze(&self, story: &Story, content: &Content) -> Result<serde_json::Value> {
        let payload = AnalysisRequest {
            story_id: &story.id,
            title: &story.title,
            url: &story.canonical_url,
            lang: content.lang.as_deref(),
            text: &content.text,
        };

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .context("Failed to send story to analysis webhook")?;

        let status = response.status();
        if status.as_u16() == 202 || status.as_u16() == 204 {
            // Accepted for async processing; nothing to store yet
            return Ok(serde_json::json!({ "status": "accepted" }));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Analysis webhook error ({}): {}", status, text);
        }

        response
            .json()
            .await
            .context("Failed to parse analysis response")
    }
}

/// Records that a story is ready and returns basic statistics.
///
/// Used when no analysis endpoint is configured.
pub struct LogOnlyAnalyzer;

#[async_trait]
impl StoryAnalyzer for LogOnlyAnalyzer {
    async fn analyze(&self, story: &Story, content: &Content) -> Result<serde_json::Value> {
        let words = content.text.split_whitespace().count();
        info!(story_id = %story.id, title = %story.title, words, "Story ready for analysis");
        Ok(serde_json::json!({
            "analyzer": "log-only",
            "words": words,
            "lang": content.lang,
        }))
    }
}
