//! Snapshot reconciler.
//!
//! Pure projection from store contents + wall clock to the `LiveState`
//! value served to clients. Staleness is applied here, at read time, so a
//! stale read never destroys the store's real history. Deterministic given
//! `now`, which makes it unit-testable without mocking timers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;
use crate::store::{Activity, AgentRecord, AgentStatus, StoreContents};

/// Derived, immutable view of the store. Computed fresh on each request and
/// never itself stored, so it cannot drift from the store's contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveState {
    pub ts: DateTime<Utc>,
    pub active_agent_id: Option<String>,
    pub agents: Vec<AgentRecord>,
    pub coordinator_badges: Vec<String>,
}

/// Compute the point-in-time snapshot.
pub fn project(contents: &StoreContents, now: DateTime<Utc>, cfg: &SyncConfig) -> LiveState {
    let agent_stale = cfg.agent_stale();
    let focus_stale = cfg.focus_stale();
    let badge_ttl = cfg.badge_ttl();

    let mut agents: Vec<AgentRecord> = contents
        .agents
        .iter()
        .map(|record| {
            if now - record.updated_at > agent_stale {
                // Read-time projection only; the stored record keeps its
                // real status.
                AgentRecord {
                    id: record.id.clone(),
                    status: AgentStatus::Idle,
                    activity: Activity::Idle,
                    updated_at: record.updated_at,
                }
            } else {
                record.clone()
            }
        })
        .collect();
    agents.sort_by(|a, b| a.id.cmp(&b.id));

    // The focus pointer clears itself with no explicit clear event, so a
    // lost final event cannot leave the indicator stuck.
    let active_agent_id = contents.focus.as_ref().and_then(|(id, set_at)| {
        if now - *set_at > focus_stale {
            None
        } else {
            Some(id.clone())
        }
    });

    let mut badges: Vec<(&String, &DateTime<Utc>)> = contents
        .badges
        .iter()
        .filter(|(_, at)| now - *at <= badge_ttl)
        .map(|(label, at)| (label, at))
        .collect();
    badges.sort_by(|a, b| b.1.cmp(a.1));
    let coordinator_badges = badges
        .into_iter()
        .take(cfg.max_badges)
        .map(|(label, _)| label.clone())
        .collect();

    LiveState {
        ts: now,
        active_agent_id,
        agents,
        coordinator_badges,
    }
}
