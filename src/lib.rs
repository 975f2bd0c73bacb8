pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod hub;
pub mod ratelimit;
pub mod server;
pub mod snapshot;
pub mod store;

pub use auth::{IssuedToken, StreamAuth, TokenClaims};
pub use client::{ActivityDebouncer, SyncController, SyncPhase, SyncUpdate};
pub use config::AppConfig;
pub use error::{PulseError, Result, TokenError};
pub use event::{EventEnvelope, EventKind, IngestAck};
pub use hub::BroadcastHub;
pub use ratelimit::{RateDecision, RateLimiter};
pub use snapshot::LiveState;
pub use store::{Activity, AgentRecord, AgentStatus, StateStore};
