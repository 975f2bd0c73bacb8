//! Request-level tests for the sync server surface, driven through the
//! router with tower's `oneshot` so no socket is bound.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::StreamExt;
use pulse::api::{create_router, AppState, ServerTasks};
use pulse::auth::StreamAuth;
use pulse::config::AppConfig;
use pulse::snapshot::LiveState;
use serde_json::{json, Value};
use tower::ServiceExt;

const SIGNING_SECRET: &str = "integration-signing-secret";

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.auth.signing_secret = Some(SIGNING_SECRET.to_string());
    cfg
}

fn build_app(cfg: &AppConfig) -> (Router, ServerTasks) {
    let (state, tasks) = AppState::new(cfg).expect("app state");
    (create_router(state), tasks)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn ingest_acknowledges_a_well_formed_event() {
    let (app, _tasks) = build_app(&test_config());

    let response = app
        .oneshot(post_json(
            "/ingest",
            json!({"type": "agent.activity", "agentId": "ATLAS", "activity": "thinking"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let ack = body_json(response).await;
    assert_eq!(ack["accepted"], json!(true));
    assert!(ack["eventId"].as_str().is_some());
}

#[tokio::test]
async fn ingest_enforces_the_shared_secret_when_configured() {
    let mut cfg = test_config();
    cfg.auth.ingest_secret = Some("producer-secret".to_string());
    let (app, _tasks) = build_app(&cfg);

    let denied = app
        .clone()
        .oneshot(post_json("/ingest", json!({"type": "agent.activity"})))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    let error = body_json(denied).await;
    assert_eq!(error["error"]["code"], json!("unauthorized"));

    let mut request = post_json(
        "/ingest",
        json!({"type": "agent.activity", "agentId": "ATLAS", "activity": "search"}),
    );
    request.headers_mut().insert(
        axum::http::header::AUTHORIZATION,
        "Bearer producer-secret".parse().unwrap(),
    );
    let allowed = app.oneshot(request).await.unwrap();
    assert_eq!(allowed.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn ingest_rejects_a_missing_type() {
    let (app, _tasks) = build_app(&test_config());

    for body in [json!({}), json!({"type": "  "})] {
        let response = app
            .clone()
            .oneshot(post_json("/ingest", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = body_json(response).await;
        assert_eq!(error["error"]["code"], json!("bad_request"));
    }
}

#[tokio::test]
async fn ingest_rejects_an_oversized_body() {
    let mut cfg = test_config();
    cfg.server.max_body_bytes = 256;
    let (app, _tasks) = build_app(&cfg);

    // Slightly over the ceiling and grossly over it both surface as the
    // contract's 400, never a framework-level 413.
    for filler in [512, 64 * 1024] {
        let response = app
            .clone()
            .oneshot(post_json(
                "/ingest",
                json!({"type": "agent.activity", "payload": {"filler": "x".repeat(filler)}}),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = body_json(response).await;
        assert_eq!(error["error"]["code"], json!("bad_request"));
    }
}

#[tokio::test]
async fn unknown_event_types_are_acknowledged_but_have_no_effect() {
    let (app, _tasks) = build_app(&test_config());

    let response = app
        .clone()
        .oneshot(post_json(
            "/ingest",
            json!({"type": "metrics.sampled", "agentId": "ATLAS"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let state = app.oneshot(get("/state")).await.unwrap();
    let live: LiveState = serde_json::from_value(body_json(state).await).unwrap();
    assert!(live.agents.is_empty());
}

#[tokio::test]
async fn tool_failure_is_visible_through_the_state_endpoint() {
    let (app, _tasks) = build_app(&test_config());

    let response = app
        .clone()
        .oneshot(post_json(
            "/ingest",
            json!({"type": "tool.failed", "agentId": "ATLAS"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let state = app.oneshot(get("/state")).await.unwrap();
    assert_eq!(state.status(), StatusCode::OK);
    let live = body_json(state).await;
    assert_eq!(live["agents"][0]["id"], json!("ATLAS"));
    assert_eq!(live["agents"][0]["status"], json!("busy"));
    assert_eq!(live["agents"][0]["activity"], json!("error"));
    assert_eq!(live["activeAgentId"], json!("ATLAS"));
}

#[tokio::test]
async fn stream_auth_issues_a_verifiable_token() {
    let (app, _tasks) = build_app(&test_config());

    let mut request = Request::builder()
        .method("POST")
        .uri("/stream-auth")
        .body(Body::empty())
        .unwrap();
    request
        .headers_mut()
        .insert("x-pulse-identity", "viewer-context".parse().unwrap());

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let issued = body_json(response).await;
    let token = issued["token"].as_str().unwrap();

    // Any peer holding the signing secret can verify it, no shared state.
    let verifier = StreamAuth::new(SIGNING_SECRET, 600);
    assert!(verifier.verify(token, Utc::now()).is_ok());
}

#[tokio::test]
async fn stream_auth_without_identity_material_is_unauthorized() {
    let (app, _tasks) = build_app(&test_config());

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/stream-auth")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn events_rejects_missing_expired_and_forged_tokens() {
    let (app, _tasks) = build_app(&test_config());

    let missing = app.clone().oneshot(get("/events")).await.unwrap();
    assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

    let issuer = StreamAuth::new(SIGNING_SECRET, 600);
    let expired = issuer.issue("viewer-context", Utc::now() - ChronoDuration::hours(2));
    let response = app
        .clone()
        .oneshot(get(&format!("/events?token={}", expired.token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let forged = StreamAuth::new("some-other-secret", 600).issue("viewer-context", Utc::now());
    let response = app
        .oneshot(get(&format!("/events?token={}", forged.token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn events_primes_a_new_subscriber_with_a_full_snapshot() {
    let (app, _tasks) = build_app(&test_config());

    app.clone()
        .oneshot(post_json(
            "/ingest",
            json!({"type": "tool.started", "agentId": "NOVA"}),
        ))
        .await
        .unwrap();

    let issued = StreamAuth::new(SIGNING_SECRET, 600).issue("viewer-context", Utc::now());
    let response = app
        .oneshot(get(&format!("/events?token={}", issued.token)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let mut body = response.into_body().into_data_stream();
    let first = tokio::time::timeout(std::time::Duration::from_secs(1), body.next())
        .await
        .expect("priming frame arrives immediately")
        .unwrap()
        .unwrap();
    let text = String::from_utf8_lossy(&first);
    assert!(text.contains("event: state"));
    assert!(text.contains("NOVA"));
}

#[tokio::test]
async fn command_endpoint_is_rate_limited() {
    let mut cfg = test_config();
    cfg.server.command_rate_limit = 2;
    let (app, _tasks) = build_app(&cfg);

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(post_json("/command", json!({"text": "pause the swarm"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let ack = body_json(response).await;
        assert_eq!(ack["accepted"], json!(true));
        assert!(ack["commandId"].as_str().is_some());
    }

    let limited = app
        .oneshot(post_json("/command", json!({"text": "pause the swarm"})))
        .await
        .unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    let error = body_json(limited).await;
    assert_eq!(error["error"]["code"], json!("rate_limited"));
}

#[tokio::test]
async fn healthz_reports_liveness() {
    let (app, _tasks) = build_app(&test_config());

    let response = app.oneshot(get("/healthz")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], json!("ok"));
}

#[tokio::test]
async fn stale_agents_project_as_idle_in_state_responses() {
    let mut cfg = test_config();
    cfg.sync.agent_stale_ms = 50;
    cfg.sync.focus_stale_ms = 20;
    let (app, _tasks) = build_app(&cfg);

    app.clone()
        .oneshot(post_json(
            "/ingest",
            json!({"type": "agent.activity", "agentId": "ATLAS", "activity": "search"}),
        ))
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(120)).await;

    let state = app.oneshot(get("/state")).await.unwrap();
    let live = body_json(state).await;
    assert_eq!(live["agents"][0]["status"], json!("idle"));
    assert_eq!(live["agents"][0]["activity"], json!("idle"));
    assert_eq!(live["activeAgentId"], json!(null));
}
