pub mod controller;
pub mod debounce;
pub mod sse;

pub use controller::{Backoff, SyncController, SyncHandle, SyncPhase, SyncUpdate};
pub use debounce::{ActivityDebouncer, DebounceConfig};
pub use sse::{SseFrame, SseParser};
