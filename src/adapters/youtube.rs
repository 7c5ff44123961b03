//! YouTube Data API v3 client.
//!
//! Quota costs follow the published unit table: `playlistItems.list` and
//! `videos.list` cost 1 unit per request (up to 50 results each),
//! `search.list` costs 100 units per request.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use tracing::debug;

use super::{ApiPage, SearchQuery, VideoSummary, YoutubeApi};

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// Results per request the API allows
pub const PAGE_SIZE: u32 = 50;
pub const LIST_COST: u32 = 1;
pub const SEARCH_COST: u32 = 100;

/// Estimated cost of listing `n` videos
pub fn estimate_list_cost(n: u32) -> u32 {
    n.max(1).div_ceil(PAGE_SIZE) * LIST_COST
}

/// Uploads playlist of a channel: `UC…` becomes `UU…`
pub fn uploads_playlist_id(channel_id: &str) -> Option<String> {
    channel_id
        .strip_prefix("UC")
        .filter(|rest| !rest.is_empty())
        .map(|rest| format!("UU{}", rest))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    #[serde(default)]
    title: String,
    channel_id: Option<String>,
    published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    #[serde(default)]
    snippet: Snippet,
    content_details: PlaylistContentDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistContentDetails {
    video_id: String,
    video_published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResult {
    id: SearchId,
    #[serde(default)]
    snippet: Snippet,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchId {
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Video {
    id: String,
    #[serde(default)]
    snippet: Snippet,
    content_details: Option<VideoContentDetails>,
}

#[derive(Debug, Deserialize)]
struct VideoContentDetails {
    duration: Option<String>,
}

/// HTTP client for the Data API
pub struct YoutubeDataClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl YoutubeDataClient {
    pub fn new(api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        resource: &str,
        params: &[(&str, String)],
    ) -> Result<ListResponse<T>> {
        let url = format!("{}/{}", self.base_url, resource);
        let response = self
            .client
            .get(&url)
            .query(params)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .with_context(|| format!("Failed to call {}", resource))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("YouTube {} error ({}): {}", resource, status, text);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", resource))
    }
}

#[async_trait]
impl YoutubeApi for YoutubeDataClient {
    async fn playlist_items(&self, playlist_id: &str, max: u32) -> Result<ApiPage<VideoSummary>> {
        let mut items = Vec::new();
        let mut units = 0;
        let mut page_token: Option<String> = None;

        while (items.len() as u32) < max {
            let mut params = vec![
                ("part", "snippet,contentDetails".to_string()),
                ("playlistId", playlist_id.to_string()),
                ("maxResults", PAGE_SIZE.min(max).to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }

            let page: ListResponse<PlaylistItem> = self.get("playlistItems", &params).await?;
            units += LIST_COST;

            items.extend(page.items.into_iter().map(|item| VideoSummary {
                video_id: item.content_details.video_id,
                title: item.snippet.title,
                channel_id: item.snippet.channel_id,
                published_at: item
                    .content_details
                    .video_published_at
                    .or(item.snippet.published_at),
                duration: None,
            }));

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        items.truncate(max as usize);
        debug!(playlist_id, count = items.len(), units, "Listed playlist items");
        Ok(ApiPage { items, units })
    }

    async fn search(&self, query: &SearchQuery) -> Result<ApiPage<VideoSummary>> {
        let mut params = vec![
            ("part", "snippet".to_string()),
            ("type", "video".to_string()),
            ("q", query.query.clone()),
            ("maxResults", query.max_results.clamp(1, PAGE_SIZE).to_string()),
            ("order", query.order.clone().unwrap_or_else(|| "date".to_string())),
        ];
        if let Some(duration) = &query.duration {
            params.push(("videoDuration", duration.clone()));
        }
        if let Some(after) = query.published_after {
            params.push((
                "publishedAfter",
                after.to_rfc3339_opts(SecondsFormat::Secs, true),
            ));
        }

        let page: ListResponse<SearchResult> = self.get("search", &params).await?;
        let items = page
            .items
            .into_iter()
            .filter_map(|r| {
                Some(VideoSummary {
                    video_id: r.id.video_id?,
                    title: r.snippet.title,
                    channel_id: r.snippet.channel_id,
                    published_at: r.snippet.published_at,
                    duration: None,
                })
            })
            .collect();

        Ok(ApiPage {
            items,
            units: SEARCH_COST,
        })
    }

    async fn video_details(&self, ids: &[String]) -> Result<ApiPage<VideoSummary>> {
        let mut items = Vec::with_capacity(ids.len());
        let mut units = 0;

        for chunk in ids.chunks(PAGE_SIZE as usize) {
            let params = vec![
                ("part", "snippet,contentDetails".to_string()),
                ("id", chunk.join(",")),
            ];
            let page: ListResponse<Video> = self.get("videos", &params).await?;
            units += LIST_COST;

            items.extend(page.items.into_iter().map(|v| VideoSummary {
                video_id: v.id,
                title: v.snippet.title,
                channel_id: v.snippet.channel_id,
                published_at: v.snippet.published_at,
                duration: v.content_details.and_then(|d| d.duration),
            }));
        }

        Ok(ApiPage { items, units })
    }
}
