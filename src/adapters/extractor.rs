//! Page-to-text extraction.
//!
//! Deliberately naive: drops scripts, styles and markup, decodes entities
//! and keeps the visible text. Good enough for hashing and analysis input.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;

use super::{ContentExtractor, ExtractedContent};

fn re_invisible() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style|noscript|template|svg)\b.*?</(script|style|noscript|template|svg)>|<!--.*?-->")
            .expect("static regex")
    })
}

fn re_block() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)</?(p|div|br|li|h[1-6]|section|article|tr|blockquote)\b[^>]*>").expect("static regex")
    })
}

fn re_tags() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("static regex"))
}

fn re_title() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("static regex"))
}

fn re_lang() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)<html[^>]*\blang\s*=\s*["']?([a-zA-Z]{2,3})"#).expect("static regex"))
}

/// Extract title, language and visible text from an HTML document
pub fn html_to_content(html: &str) -> ExtractedContent {
    let title = re_title()
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| collapse(&html_escape::decode_html_entities(m.as_str())))
        .filter(|t| !t.is_empty());

    let lang = re_lang()
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase());

    // The <title> would otherwise be counted as body text
    let body = re_title().replace_all(html, " ");
    let body = re_invisible().replace_all(&body, " ");
    let body = re_block().replace_all(&body, "\n");
    let body = re_tags().replace_all(&body, " ");
    let text = html_escape::decode_html_entities(&body);

    let text = text
        .lines()
        .map(collapse)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    ExtractedContent { text, lang, title }
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Fetches pages over HTTP
pub struct HttpExtractor {
    client: reqwest::Client,
}

impl HttpExtractor {
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
impl ContentExtractor for HttpExtractor {
    async fn extract(&self, url: &str) -> Result<ExtractedContent> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("{} returned {}", url, status);
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("html"))
            .unwrap_or(true);

        let body = response.text().await.context("Failed to read page body")?;
        if is_html {
            Ok(html_to_content(&body))
        } else {
            Ok(ExtractedContent {
                text: body.trim().to_string(),
                lang: None,
                title: None,
            })
        }
    }
}
