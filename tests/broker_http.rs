mod common;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
};
use serde_json::Value;
use tower::util::ServiceExt;

use common::{broker_app, TestResult, ADMIN_KEY, API_KEY};
use llm_tunnel::tunnel::router::RouterSettings;

async fn json_body(response: axum::response::Response) -> Result<Value, Box<dyn std::error::Error>> {
    let bytes = body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[tokio::test]
async fn health_needs_no_auth() -> TestResult {
    let (app, _) = broker_app(RouterSettings::default());
    let response = app
        .oneshot(Request::builder().uri("/api/health").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
    Ok(())
}

#[tokio::test]
async fn facade_requires_bearer_key() -> TestResult {
    let (app, _) = broker_app(RouterSettings::default());

    let missing = app
        .clone()
        .oneshot(Request::builder().uri("/t/acme/api/tags").body(Body::empty())?)
        .await?;
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let wrong = app
        .oneshot(
            Request::builder()
                .uri("/t/acme/api/tags")
                .header("authorization", "Bearer nope")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(wrong.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn facade_without_agent_reports_offline() -> TestResult {
    let (app, state) = broker_app(RouterSettings::default());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/t/acme/api/generate")
                .header("authorization", format!("Bearer {API_KEY}"))
                .body(Body::from("{}"))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = json_body(response).await?;
    assert_eq!(body["code"], "AGENT_OFFLINE");
    assert_eq!(body["kind"], "session_not_found");
    assert_eq!(body["tenant_id"], "acme");
    assert!(body["correlation_id"].is_null());

    let counters = state.broker.metrics().snapshot("acme").await;
    assert_eq!(counters.requests, 0);
    Ok(())
}

#[tokio::test]
async fn invalid_priority_is_a_bad_request() -> TestResult {
    let (app, _) = broker_app(RouterSettings::default());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/t/acme/api/tags")
                .header("authorization", format!("Bearer {API_KEY}"))
                .header("x-tunnel-priority", "urgent")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn session_listing_requires_admin_token() -> TestResult {
    let (app, _) = broker_app(RouterSettings::default());

    let denied = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/tunnel/sessions?token=wrong")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    let listed = app
        .oneshot(
            Request::builder()
                .uri(format!("/api/tunnel/sessions?token={ADMIN_KEY}"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(listed.status(), StatusCode::OK);
    let body = json_body(listed).await?;
    assert_eq!(body["count"], 0);
    Ok(())
}
