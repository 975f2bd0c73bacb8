use axum::body::{to_bytes, Body};
use axum::extract::{Query, State};
use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use futures_util::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::state::AppState;
use crate::auth::identity_fingerprint;
use crate::error::{PulseError, Result};
use crate::event::{EventEnvelope, IngestAck};
use crate::hub::{current_snapshot, STATE_EVENT};

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| {
            raw.strip_prefix("Bearer ")
                .or_else(|| raw.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// POST /ingest — the gateway the external producer pushes events through.
pub async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<IngestAck>)> {
    if let Some(expected) = state.ingest_secret.as_deref() {
        let provided = extract_bearer(&headers);
        if provided != Some(expected) {
            return Err(PulseError::Unauthorized(
                "missing or invalid ingest secret".to_string(),
            ));
        }
    }

    // Buffer against the gateway's own ceiling, so any oversized body is the
    // contract's 400 rather than a framework-level 413.
    let body = to_bytes(body, state.max_body_bytes).await.map_err(|_| {
        PulseError::BadRequest(format!("body exceeds {} bytes", state.max_body_bytes))
    })?;

    let envelope: EventEnvelope = serde_json::from_slice(&body)
        .map_err(|e| PulseError::BadRequest(format!("invalid event envelope: {}", e)))?;
    if envelope.event_type.trim().is_empty() {
        return Err(PulseError::BadRequest("type is required".to_string()));
    }

    let now = Utc::now();
    let changed = state.store.apply(&envelope, now).await;

    // Raw passthrough first, then the coalesced snapshot push.
    if state.hub.subscriber_count() > 0 {
        match serde_json::to_string(&envelope) {
            Ok(raw) => state.hub.publish(&envelope.event_type, raw),
            Err(e) => warn!("failed to reserialize envelope: {}", e),
        }
    }
    if changed {
        state.snapshots.schedule();
    }

    debug!(event_type = %envelope.event_type, changed, "event ingested");

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestAck {
            accepted: true,
            event_id: Uuid::new_v4().to_string(),
            ts: now,
        }),
    ))
}

/// POST /stream-auth — the stateless token handshake. The opaque identity
/// material never leaves this handler; only its fingerprint enters the token.
pub async fn stream_auth(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<crate::auth::IssuedToken>> {
    let identity = headers
        .get("x-pulse-identity")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| extract_bearer(&headers))
        .ok_or_else(|| PulseError::Unauthorized("identity material required".to_string()))?;

    let issued = state.auth.issue(identity, Utc::now());
    debug!(
        fingerprint = %identity_fingerprint(identity),
        expires_at = %issued.expires_at,
        "stream token issued"
    );
    Ok(Json(issued))
}

#[derive(Deserialize)]
pub struct StreamQuery {
    token: Option<String>,
}

/// GET /events — the SSE push stream. Token-gated; a newly attached client
/// receives one full snapshot immediately so it is never empty-state.
pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse> {
    let token = query
        .token
        .as_deref()
        .ok_or_else(|| PulseError::Unauthorized("stream token required".to_string()))?;
    let claims = state.auth.verify(token, Utc::now())?;
    debug!(fingerprint = %claims.identity_fingerprint, "stream subscriber attached");

    let initial = current_snapshot(&state.store, &state.sync).await;
    let initial = Event::default()
        .event(STATE_EVENT)
        .data(serde_json::to_string(&initial)?);

    let rx = state.hub.subscribe();
    let frames = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    let event = Event::default().event(frame.event).data(frame.data);
                    return Some((Ok::<Event, Infallible>(event), rx));
                }
                // A lagged subscriber just skips ahead; the periodic
                // snapshot reconverges it.
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "slow SSE subscriber lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    let stream: std::pin::Pin<Box<dyn Stream<Item = std::result::Result<Event, Infallible>> + Send>> =
        Box::pin(stream::once(async move { Ok(initial) }).chain(frames));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.keepalive)
            .text("keep-alive"),
    ))
}

/// GET /state — synchronous snapshot, the polling fallback.
pub async fn get_state(State(state): State<AppState>) -> Result<Json<crate::snapshot::LiveState>> {
    Ok(Json(current_snapshot(&state.store, &state.sync).await))
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub text: String,
}

/// POST /command — best-effort free-text intake. Rate-limited and outside
/// the state-sync guarantees; the ack carries a correlation id only.
pub async fn command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CommandRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>)> {
    let caller = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("local");

    let decision = state.command_limiter.hit(caller, Utc::now());
    if !decision.ok {
        return Err(PulseError::RateLimited {
            reset_at: decision.reset_at,
        });
    }

    if req.text.trim().is_empty() {
        return Err(PulseError::BadRequest("text is required".to_string()));
    }

    let command_id = Uuid::new_v4().to_string();
    info!(command_id = %command_id, chars = req.text.len(), "command accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "accepted": true,
            "commandId": command_id,
            "ts": Utc::now(),
        })),
    ))
}

/// GET /healthz — liveness probe for process supervision.
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptimeSeconds": state.uptime_seconds(),
        "subscribers": state.hub.subscriber_count(),
    }))
}
