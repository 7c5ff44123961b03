//! URL canonicalization and classification.
//!
//! Canonical URLs are what stories and submitted links are compared by, so
//! the same article reached through a tracking link and a clean link ends up
//! with the same string.

use url::Url;

/// Query parameters that only carry campaign tracking
const TRACKING_PARAMS: &[&str] = &["fbclid", "gclid", "mc_cid", "mc_eid", "ref"];

/// What a submitted URL points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlKind {
    /// A YouTube video with its id
    Video { video_id: String },
    Article,
}

fn is_tracking(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

/// Canonical form of `raw`.
///
/// Lowercases scheme and host, drops the fragment, tracking parameters and
/// a trailing slash, and sorts what remains of the query.
pub fn canonicalize_url(raw: &str) -> Result<String, url::ParseError> {
    let mut url = Url::parse(raw.trim())?;
    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking(&k.to_lowercase()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    // `Url` already lowercases scheme and host
    Ok(url.to_string())
}

fn valid_video_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Extract the YouTube video id from watch, short-link, shorts and live URLs
pub fn youtube_video_id(url: &Url) -> Option<String> {
    let host = url.host_str()?.trim_start_matches("www.").trim_start_matches("m.");
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());

    let id = match host {
        "youtu.be" => segments.next().map(str::to_string),
        "youtube.com" | "music.youtube.com" => match segments.next() {
            Some("watch") => url
                .query_pairs()
                .find(|(k, _)| k == "v")
                .map(|(_, v)| v.into_owned()),
            Some("shorts") | Some("live") => segments.next().map(str::to_string),
            _ => None,
        },
        _ => None,
    }?;

    valid_video_id(&id).then_some(id)
}

/// Video or article
pub fn classify_url(raw: &str) -> Result<UrlKind, url::ParseError> {
    let url = Url::parse(raw.trim())?;
    Ok(match youtube_video_id(&url) {
        Some(video_id) => UrlKind::Video { video_id },
        None => UrlKind::Article,
    })
}
