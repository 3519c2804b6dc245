/// HTTP surface tests against the full router
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use log_beacon::{
    config::{Config, ObjectStoreBackend},
    index::SearchIndex,
    server::{create_router, Pipeline},
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

async fn setup() -> (Pipeline, Router) {
    let mut config = Config::default();
    config.object_store.backend = ObjectStoreBackend::Memory;
    config.hot_storage.database_url = "sqlite::memory:".to_string();
    config.bus.journal_url = "sqlite::memory:".to_string();

    let pipeline = Pipeline::start(&config).await.unwrap();
    let state = pipeline.app_state(&config, CancellationToken::new());
    (pipeline, create_router(state, None))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, value)
}

fn post_ingest(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn wait_for_docs(pipeline: &Pipeline, expected: u64) {
    for _ in 0..250 {
        if pipeline.index.doc_count().await.unwrap() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {} indexed documents", expected);
}

#[tokio::test]
async fn test_health() {
    let (pipeline, app) = setup().await;

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_ingest_accepts_open_schema_json() {
    let (pipeline, app) = setup().await;

    let (status, body) = send(
        &app,
        post_ingest("/ingest", r#"{"level":"info","message":"hello","user_id":42}"#),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({"status": "accepted"}));

    let (status, _) = send(
        &app,
        post_ingest("/api/v1/ingest", r#"{"level":"info","message":"versioned"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_ingest_rejects_malformed_json() {
    let (pipeline, app) = setup().await;

    let (status, body) = send(&app, post_ingest("/ingest", r#"{"level": "#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = send(&app, post_ingest("/ingest", "[1, 2, 3]")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "log record must be a JSON object"}));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_search_requires_query() {
    let (pipeline, app) = setup().await;

    for uri in ["/search", "/search?q=", "/api/v1/search?q=%20%20"] {
        let (status, body) = send(&app, get(uri)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", uri);
        assert_eq!(body, json!({"error": "Query parameter 'q' is required"}));
    }

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_search_returns_ingested_records() {
    let (pipeline, app) = setup().await;

    for body in [
        r#"{"level":"error","message":"timeout calling upstream","service":"gateway"}"#,
        r#"{"level":"info","message":"request served","service":"gateway"}"#,
        r#"{"level":"error","message":"bad config","service":"worker"}"#,
    ] {
        let (status, _) = send(&app, post_ingest("/ingest", body)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    wait_for_docs(&pipeline, 3).await;

    let (status, body) = send(
        &app,
        get("/search?q=level%3Aerror%20AND%20service%3Agateway"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let records = body.as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["message"], "timeout calling upstream");
    assert_eq!(records[0]["labels"]["service"], "gateway");

    // Unparseable paging values fall back to defaults
    let (status, body) = send(&app, get("/api/v1/search?q=level%3Aerror&page=abc&size=-3")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (status, body) = send(&app, get("/search?q=level%3Adebug")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_tail_requires_websocket_upgrade() {
    let (pipeline, app) = setup().await;

    let response = app.clone().oneshot(get("/tail")).await.unwrap();
    assert!(response.status().is_client_error());

    pipeline.shutdown().await;
}
