//! RSS and Atom listing fetcher.
//!
//! Only the listing shape is read: identifier, link, title, publish date
//! and a podcast enclosure. Item bodies are left to the content extractor.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::de::from_str;
use serde::Deserialize;

use super::{FeedEntry, FeedFetcher};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Text>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    enclosure: Option<Enclosure>,
}

#[derive(Debug, Deserialize)]
struct Enclosure {
    #[serde(rename = "@url")]
    url: Option<String>,
}

/// Element whose text we want regardless of its attributes
#[derive(Debug, Deserialize)]
struct Text {
    #[serde(rename = "$text")]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    id: Option<String>,
    title: Option<Text>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    updated: Option<String>,
    published: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

fn clean(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_rfc2822(s)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn from_rss(rss: Rss) -> Vec<FeedEntry> {
    rss.channel
        .items
        .into_iter()
        .filter_map(|item| {
            let enclosure_url = clean(item.enclosure.and_then(|e| e.url));
            let link = clean(item.link).or_else(|| enclosure_url.clone())?;
            let external_id = clean(item.guid.and_then(|g| g.value)).unwrap_or_else(|| link.clone());
            Some(FeedEntry {
                external_id,
                title: clean(item.title).unwrap_or_else(|| link.clone()),
                url: link,
                published_at: item.pub_date.as_deref().and_then(parse_date),
                enclosure_url,
            })
        })
        .collect()
}

fn from_atom(feed: AtomFeed) -> Vec<FeedEntry> {
    feed.entries
        .into_iter()
        .filter_map(|entry| {
            let mut alternate = None;
            let mut enclosure = None;
            for link in entry.links {
                match link.rel.as_deref() {
                    None | Some("alternate") => alternate = alternate.or(clean(link.href)),
                    Some("enclosure") => enclosure = enclosure.or(clean(link.href)),
                    _ => {}
                }
            }

            let url = alternate.or_else(|| enclosure.clone())?;
            let external_id = clean(entry.id).unwrap_or_else(|| url.clone());
            let date = entry.published.or(entry.updated);
            Some(FeedEntry {
                external_id,
                title: clean(entry.title.and_then(|t| t.value)).unwrap_or_else(|| url.clone()),
                url,
                published_at: date.as_deref().and_then(parse_date),
                enclosure_url: enclosure,
            })
        })
        .collect()
}

/// Name of the document element, skipping the prolog
fn root_element(xml: &str) -> Option<&str> {
    let mut rest = xml;
    loop {
        let start = rest.find('<')?;
        rest = &rest[start + 1..];
        if rest.starts_with('?') || rest.starts_with('!') {
            continue;
        }
        let end = rest
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(rest.len());
        return Some(&rest[..end]);
    }
}

/// Parse an RSS 2.0 or Atom document. Entries without any link are dropped.
pub fn parse_feed(xml: &str) -> Result<Vec<FeedEntry>> {
    match root_element(xml) {
        Some("rss") => {
            let rss: Rss = from_str(xml).context("parsing rss xml")?;
            Ok(from_rss(rss))
        }
        Some("feed") => {
            let atom: AtomFeed = from_str(xml).context("parsing atom xml")?;
            Ok(from_atom(atom))
        }
        Some(other) => anyhow::bail!("Unsupported feed root element <{}>", other),
        None => anyhow::bail!("Feed body is not XML"),
    }
}

/// Fetches feeds over HTTP
pub struct HttpFeedFetcher {
    client: reqwest::Client,
}

impl HttpFeedFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("storyloom/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedFetcher for HttpFeedFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<FeedEntry>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch feed {}", url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Feed {} returned {}", url, status);
        }

        let body = response.text().await.context("Failed to read feed body")?;
        parse_feed(&body)
    }
}
