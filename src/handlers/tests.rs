//! # Tests for Handlers
//!
//! Router-level tests against an in-memory database.

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use serde_json::{Value, json};
use tower::ServiceExt;

use crate::clock::SystemClock;
use crate::config::AppConfig;
use crate::http_fetcher::ReqwestFetcher;
use crate::server::{AppState, create_app};

const TOKEN: &str = "test-token-123";

async fn test_app() -> Router {
    let config = Arc::new(AppConfig {
        operator_tokens: vec![TOKEN.to_string()],
        ..Default::default()
    });
    let db = sea_orm::Database::connect("sqlite::memory:").await.unwrap();
    crate::db::run_migrations(&db).await.unwrap();
    let fetcher = Arc::new(ReqwestFetcher::new(&config.fetcher).unwrap());

    create_app(AppState::build(config, db, fetcher, Arc::new(SystemClock)))
}

fn post(uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("Authorization", format!("Bearer {TOKEN}"))
        .header("Content-Type", "application/json");
    match body {
        Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn schedule_body(owner: &str, min_delay: i64) -> Value {
    json!({
        "owner": owner,
        "update_uri": "https://buyer.example.com/update",
        "min_delay_minutes": min_delay,
        "partial_custom_audience_data": [{"name": "shoes"}]
    })
}

#[tokio::test]
async fn test_root_returns_service_info() {
    let app = test_app().await;
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["service"], "audience-sync");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_healthz_reports_database() {
    let app = test_app().await;
    let response = app
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["database"], "ok");
}

#[tokio::test]
async fn test_schedule_requires_operator_token() {
    let app = test_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/v1/scheduled-updates")
        .header("Content-Type", "application/json")
        .body(Body::from(schedule_body("com.owner", 30).to_string()))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_schedule_then_conflict() {
    let app = test_app().await;

    let response = app
        .clone()
        .oneshot(post("/v1/scheduled-updates", Some(schedule_body("com.owner", 30))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["buyer"], "buyer.example.com");

    // A different owner avoids the per-owner throttle.
    let response = app
        .clone()
        .oneshot(post("/v1/scheduled-updates", Some(schedule_body("com.other", 30))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
    let response = app
        .oneshot(post("/v1/scheduled-updates", Some(schedule_body("com.owner", 30))))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(response).await["code"], "UPDATE_ALREADY_PENDING");
}

#[tokio::test]
async fn test_schedule_rejects_short_delay() {
    let app = test_app().await;
    let response = app
        .oneshot(post("/v1/scheduled-updates", Some(schedule_body("com.owner", 10))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_ARGUMENT");
}

#[tokio::test]
async fn test_schedule_rejects_malformed_body() {
    let app = test_app().await;
    let response = app
        .oneshot(post("/v1/scheduled-updates", Some(json!({"owner": "com.owner"}))))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_job_triggers_return_stats() {
    let app = test_app().await;

    let response = app
        .clone()
        .oneshot(post("/v1/jobs/background-fetch", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["eligible"], 0);

    let response = app
        .oneshot(post("/v1/jobs/scheduled-updates", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["updates_found"], 0);
}

#[tokio::test]
async fn test_stop_job() {
    let app = test_app().await;

    let response = app
        .clone()
        .oneshot(post("/v1/jobs/background-fetch/stop", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["stopping"], false);

    let response = app
        .oneshot(post("/v1/jobs/unknown/stop", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
