use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::auth::StreamAuth;
use crate::config::AppConfig;
use crate::error::{PulseError, Result};
use crate::hub::{spawn_periodic_snapshots, BroadcastHub, SnapshotScheduler};
use crate::ratelimit::RateLimiter;
use crate::store::StateStore;

/// Shared application state for API handlers. Everything is an explicitly
/// constructed, injectable instance so tests run isolated copies.
#[derive(Clone)]
pub struct AppState {
    /// The one piece of shared mutable state
    pub store: Arc<StateStore>,

    /// SSE fan-out channel
    pub hub: Arc<BroadcastHub>,

    /// Stream-token issuance/verification
    pub auth: Arc<StreamAuth>,

    /// Command-endpoint limiter
    pub command_limiter: Arc<RateLimiter>,

    /// Debounced snapshot trigger
    pub snapshots: SnapshotScheduler,

    /// Shared ingest bearer secret (no ingest auth when unset)
    pub ingest_secret: Option<String>,

    /// Staleness/debounce windows
    pub sync: crate::config::SyncConfig,

    /// Ingest body size ceiling
    pub max_body_bytes: usize,

    /// SSE keep-alive comment cadence
    pub keepalive: Duration,

    /// Application start time
    pub started_at: DateTime<Utc>,
}

/// Handles for the hub's background timers; aborted on shutdown so no timer
/// outlives the server.
pub struct ServerTasks {
    debounce: JoinHandle<()>,
    periodic: JoinHandle<()>,
}

impl ServerTasks {
    pub fn abort_all(&self) {
        self.debounce.abort();
        self.periodic.abort();
    }
}

impl Drop for ServerTasks {
    fn drop(&mut self) {
        self.abort_all();
    }
}

impl AppState {
    pub fn new(cfg: &AppConfig) -> Result<(Self, ServerTasks)> {
        let signing_secret = cfg
            .auth
            .signing_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                PulseError::Internal("auth.signing_secret is not configured".to_string())
            })?;

        let store = Arc::new(StateStore::new());
        let hub = Arc::new(BroadcastHub::default());
        let auth = Arc::new(StreamAuth::new(signing_secret, cfg.auth.token_ttl_secs));
        let command_limiter = Arc::new(RateLimiter::new(
            "command",
            cfg.server.command_rate_limit,
            cfg.server.command_rate_window_secs,
        ));

        let (snapshots, debounce) =
            SnapshotScheduler::spawn(store.clone(), hub.clone(), cfg.sync.clone());
        let periodic = spawn_periodic_snapshots(store.clone(), hub.clone(), cfg.sync.clone());

        let state = Self {
            store,
            hub,
            auth,
            command_limiter,
            snapshots,
            ingest_secret: cfg
                .auth
                .ingest_secret
                .clone()
                .filter(|s| !s.trim().is_empty()),
            sync: cfg.sync.clone(),
            max_body_bytes: cfg.server.max_body_bytes,
            keepalive: Duration::from_millis(cfg.sync.keepalive_ms),
            started_at: Utc::now(),
        };

        Ok((state, ServerTasks { debounce, periodic }))
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }
}
