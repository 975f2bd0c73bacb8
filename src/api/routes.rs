use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::api::{handlers, state::AppState};

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // The ingest handler enforces its own body ceiling; buffering extractors
    // elsewhere keep axum's default limit.
    Router::new()
        // Producer-facing ingest boundary
        .route("/ingest", post(handlers::ingest))
        // Viewer-facing sync surface
        .route("/stream-auth", post(handlers::stream_auth))
        .route("/events", get(handlers::events))
        .route("/state", get(handlers::get_state))
        .route("/command", post(handlers::command))
        // Probes
        .route("/healthz", get(handlers::healthz))
        .with_state(state)
        .layer(cors)
}
