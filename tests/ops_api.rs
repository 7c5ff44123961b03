// tests/ops_api.rs
//
// HTTP-level tests for the ops Router without opening sockets, driven
// through tower::ServiceExt::oneshot.

mod common;

use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt as _;

use common::{collaborators, test_config, StaticFeeds, StaticPages};
use storyloom::core::services::Services;
use storyloom::domain::{Source, SourceKind};
use storyloom::server;
use storyloom::store::{Store, MANUAL_SOURCE_ID};

const BODY_LIMIT: usize = 1024 * 1024;

struct Harness {
    _dir: TempDir,
    store: Store,
    app: Router,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Store::open_in_memory().unwrap();
    let services = Services::build(
        &test_config(dir.path()),
        store.clone(),
        collaborators(StaticFeeds::default(), StaticPages::default(), None),
    )
    .unwrap();
    Harness {
        _dir: dir,
        store,
        app: server::router(Arc::new(services)),
    }
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header("content-type", "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };

    let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    let value = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let h = harness();
    let (status, body) = call(&h.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("ok".to_string()));
}

#[tokio::test]
async fn test_pull_validates_source_family() {
    let h = harness();

    let (status, body) = call(&h.app, "POST", "/ops/pull", Some(json!({"source": "rss"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert!(body["jobId"].is_string());

    let (status, body) = call(&h.app, "POST", "/ops/pull", Some(json!({"source": "fax"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().unwrap().contains("fax"));

    // Not configured in this harness
    let (status, _) = call(&h.app, "POST", "/ops/pull", Some(json!({"source": "youtube"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_submit_routes_by_url_kind() {
    let h = harness();

    let (status, body) = call(
        &h.app,
        "POST",
        "/ops/submit",
        Some(json!({"url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ&utm_source=x"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "video");
    assert_eq!(body["queue"], "ingest:fetch-youtube-content");
    assert_eq!(body["duplicate"], false);

    let (_, body) = call(
        &h.app,
        "POST",
        "/ops/submit",
        Some(json!({"url": "https://blog.example.com/post", "title": "A post"})),
    )
    .await;
    assert_eq!(body["kind"], "article");
    assert_eq!(body["queue"], "ingest:fetch-content");

    let (status, body) = call(
        &h.app,
        "POST",
        "/ops/submit",
        Some(json!({"url": "https://blog.example.com/post/#comments"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duplicate"], true);
    assert!(body.get("jobId").is_none());

    let (status, body) = call(&h.app, "POST", "/ops/submit", Some(json!({"url": "nope"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);
}

#[tokio::test]
async fn test_schedule_errors_are_400() {
    let h = harness();

    let cases = [
        json!({"queue": "ingest:nothing", "cron": "*/5 * * * *"}),
        json!({"queue": "system:heartbeat", "cron": "every now and then"}),
        json!({"queue": "system:heartbeat", "cron": "*/5 * * * *", "tz": "Mars/Olympus"}),
        json!({"queue": "ingest:pull", "cron": "*/5 * * * *"}),
    ];
    for case in cases {
        let (status, body) = call(&h.app, "POST", "/ops/schedule", Some(case.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", case);
        assert_eq!(body["ok"], false);
    }

    let (status, body) = call(
        &h.app,
        "POST",
        "/ops/schedule",
        Some(json!({"queue": "ingest:pull", "cron": "*/10 * * * *", "payload": {"source": "rss"}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn test_pause_resume_and_status() {
    let h = harness();
    let source = Source::new("Feed", SourceKind::Rss, "https://example.com/feed");
    h.store.insert_source(&source).unwrap();

    let (status, body) = call(&h.app, "POST", "/ops/sources/nope/pause", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["ok"], false);

    let uri = format!("/ops/sources/{}/pause", source.id);
    let (status, body) = call(&h.app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], false);

    let (status, body) = call(&h.app, "GET", "/ops/status", None).await;
    assert_eq!(status, StatusCode::OK);
    // The manual source counts too
    assert_eq!(body["sources"]["total"], 2);
    assert_eq!(body["sources"]["active"], 1);
    assert_eq!(body["youtubeEnabled"], false);
    assert!(body["quota"]["limit"].is_u64());

    let uri = format!("/ops/sources/{}/resume", source.id);
    let (status, _) = call(&h.app, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(h.store.get_source(&source.id).unwrap().unwrap().active);

    let (status, body) = call(&h.app, "GET", "/ops/quota", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["used"], 0);
    assert_eq!(body["canProceed"], true);
}

#[tokio::test]
async fn test_bad_json_bodies_are_400() {
    let h = harness();

    let (status, body) = call(
        &h.app,
        "POST",
        "/ops/submit",
        Some(json!({"link": "https://blog.example.com/post"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().unwrap().contains("url"));

    let (status, body) = call(&h.app, "POST", "/ops/schedule", Some(json!({"queue": "system:heartbeat"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);

    // Not JSON at all
    let req = Request::builder()
        .method("POST")
        .uri("/ops/pull")
        .header("content-type", "application/json")
        .body(Body::from("{source: rss"))
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["ok"], false);

    // Missing content type
    let req = Request::builder()
        .method("POST")
        .uri("/ops/pull")
        .body(Body::from(r#"{"source": "rss"}"#))
        .unwrap();
    let resp = h.app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_submit_lands_under_manual_source() {
    let h = harness();
    let (_, body) = call(
        &h.app,
        "POST",
        "/ops/submit",
        Some(json!({"url": "https://blog.example.com/manual-post"})),
    )
    .await;

    let item = h.store.get_raw_item(body["rawItemId"].as_str().unwrap()).unwrap().unwrap();
    assert_eq!(item.source_id, MANUAL_SOURCE_ID);
}
