//! Server assembly: builds the shared state, spawns the hub's background
//! timers, and serves the router until a shutdown signal arrives.

use std::net::SocketAddr;
use tokio::signal;
use tracing::{error, info};

use crate::api::{create_router, AppState};
use crate::config::AppConfig;
use crate::error::{PulseError, Result};

pub async fn serve(cfg: AppConfig) -> Result<()> {
    let (state, tasks) = AppState::new(&cfg)?;
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.port));
    info!("Starting sync server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| PulseError::Internal(format!("Server error: {}", e)));

    // No timer outlives the server.
    tasks.abort_all();
    info!("Sync server stopped");
    result
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
