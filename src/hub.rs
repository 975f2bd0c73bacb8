//! SSE broadcast hub.
//!
//! Fan-out runs over a `tokio::sync::broadcast` channel: every subscriber
//! owns its receiver, so a dead or lagging subscriber can never interrupt
//! delivery to the rest. Two background tasks feed it full snapshots — a
//! debounced one that coalesces event bursts into a single push, and a
//! periodic one that reconverges any client that missed a frame.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::snapshot::{project, LiveState};
use crate::store::StateStore;

pub const STATE_EVENT: &str = "state";

/// One named SSE frame, serialized data included.
#[derive(Debug, Clone)]
pub struct Frame {
    pub event: String,
    pub data: String,
}

pub struct BroadcastHub {
    tx: broadcast::Sender<Frame>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Write a frame to every open subscriber. A send error only means
    /// nobody is listening, which is not a failure.
    pub fn publish(&self, event: &str, data: String) {
        let _ = self.tx.send(Frame {
            event: event.to_string(),
            data,
        });
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Compute and broadcast one full snapshot.
pub async fn broadcast_snapshot(store: &StateStore, hub: &BroadcastHub, cfg: &SyncConfig) {
    let contents = store.contents().await;
    let live = project(&contents, Utc::now(), cfg);
    match serde_json::to_string(&live) {
        Ok(json) => hub.publish(STATE_EVENT, json),
        Err(e) => warn!("failed to serialize snapshot: {}", e),
    }
}

/// Compute a snapshot without broadcasting (the `/state` polling path and
/// the priming frame for new subscribers).
pub async fn current_snapshot(store: &StateStore, cfg: &SyncConfig) -> LiveState {
    let contents = store.contents().await;
    project(&contents, Utc::now(), cfg)
}

/// Debounced snapshot trigger. Every call to `schedule()` within the
/// coalescing window collapses into a single broadcast, bounding fan-out
/// cost during event bursts.
#[derive(Clone)]
pub struct SnapshotScheduler {
    trigger: mpsc::UnboundedSender<()>,
}

impl SnapshotScheduler {
    pub fn spawn(
        store: Arc<StateStore>,
        hub: Arc<BroadcastHub>,
        cfg: SyncConfig,
    ) -> (Self, JoinHandle<()>) {
        let (trigger, mut rx) = mpsc::unbounded_channel::<()>();
        let window = Duration::from_millis(cfg.snapshot_debounce_ms);

        let handle = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(window).await;
                // Drain everything that arrived during the window.
                while rx.try_recv().is_ok() {}
                broadcast_snapshot(&store, &hub, &cfg).await;
                debug!("debounced snapshot broadcast");
            }
        });

        (Self { trigger }, handle)
    }

    pub fn schedule(&self) {
        let _ = self.trigger.send(());
    }
}

/// Periodic full-snapshot broadcast: the self-healing path. Any client that
/// missed a fine-grained frame converges within one interval.
pub fn spawn_periodic_snapshots(
    store: Arc<StateStore>,
    hub: Arc<BroadcastHub>,
    cfg: SyncConfig,
) -> JoinHandle<()> {
    let period = Duration::from_millis(cfg.snapshot_interval_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The immediate first tick would duplicate the subscribe-time frame.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if hub.subscriber_count() > 0 {
                broadcast_snapshot(&store, &hub, &cfg).await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventEnvelope;
    use serde_json::json;

    fn activity_event(agent_id: &str, activity: &str) -> EventEnvelope {
        EventEnvelope {
            event_type: "agent.activity".to_string(),
            agent_id: Some(agent_id.to_string()),
            activity: Some(activity.to_string()),
            ts: None,
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_fail() {
        let hub = BroadcastHub::default();
        hub.publish("state", "{}".to_string());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn every_subscriber_sees_published_frames() {
        let hub = BroadcastHub::default();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.publish("state", "{\"x\":1}".to_string());

        assert_eq!(a.recv().await.unwrap().data, "{\"x\":1}");
        assert_eq!(b.recv().await.unwrap().data, "{\"x\":1}");
    }

    #[tokio::test]
    async fn dropped_subscriber_does_not_block_the_rest() {
        let hub = BroadcastHub::default();
        let dead = hub.subscribe();
        let mut live = hub.subscribe();
        drop(dead);

        hub.publish("state", "{}".to_string());
        assert!(live.recv().await.is_ok());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn burst_within_window_collapses_to_one_snapshot() {
        let store = Arc::new(StateStore::new());
        let hub = Arc::new(BroadcastHub::default());
        let cfg = SyncConfig::default();
        let mut rx = hub.subscribe();

        let (scheduler, task) = SnapshotScheduler::spawn(store.clone(), hub.clone(), cfg.clone());

        let now = Utc::now();
        store.apply(&activity_event("ATLAS", "thinking"), now).await;
        scheduler.schedule();
        store.apply(&activity_event("NOVA", "search"), now).await;
        scheduler.schedule();

        // Let the debounce window elapse and the task run.
        tokio::time::sleep(Duration::from_millis(cfg.snapshot_debounce_ms * 3)).await;

        let frame = rx.try_recv().expect("one snapshot frame");
        assert_eq!(frame.event, STATE_EVENT);
        let live: LiveState = serde_json::from_str(&frame.data).unwrap();
        let ids: Vec<&str> = live.agents.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["ATLAS", "NOVA"]);

        // Exactly one — the second trigger was coalesced.
        assert!(rx.try_recv().is_err());

        task.abort();
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn triggers_outside_the_window_produce_separate_snapshots() {
        let store = Arc::new(StateStore::new());
        let hub = Arc::new(BroadcastHub::default());
        let cfg = SyncConfig::default();
        let mut rx = hub.subscribe();

        let (scheduler, task) = SnapshotScheduler::spawn(store.clone(), hub.clone(), cfg.clone());

        scheduler.schedule();
        tokio::time::sleep(Duration::from_millis(cfg.snapshot_debounce_ms * 3)).await;
        scheduler.schedule();
        tokio::time::sleep(Duration::from_millis(cfg.snapshot_debounce_ms * 3)).await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        task.abort();
    }
}
