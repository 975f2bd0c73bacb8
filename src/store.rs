//! In-memory agent state store.
//!
//! The single piece of shared mutable state in the server. Records are
//! mutated only by whole-record replacement, so interleaved async callers
//! never observe a half-written record. Instances are constructed and
//! injected explicitly so tests can run isolated copies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::event::{EventEnvelope, EventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Busy,
    Active,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    Idle,
    Thinking,
    Search,
    Files,
    Tooling,
    Messaging,
    Error,
}

impl Activity {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "idle" => Some(Activity::Idle),
            "thinking" => Some(Activity::Thinking),
            "search" => Some(Activity::Search),
            "files" => Some(Activity::Files),
            "tooling" => Some(Activity::Tooling),
            "messaging" => Some(Activity::Messaging),
            "error" => Some(Activity::Error),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Activity::Idle)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub status: AgentStatus,
    pub activity: Activity,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    fn fresh(id: &str, status: AgentStatus, activity: Activity, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            status,
            activity,
            updated_at: now,
        }
    }
}

/// Coordinator focus pointer with its own (shorter) staleness clock.
#[derive(Debug, Clone)]
pub struct Focus {
    pub agent_id: String,
    pub set_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Badge {
    pub label: String,
    pub at: DateTime<Utc>,
}

/// Point-in-time copy of everything the reconciler needs.
#[derive(Debug, Clone, Default)]
pub struct StoreContents {
    pub agents: Vec<AgentRecord>,
    pub focus: Option<(String, DateTime<Utc>)>,
    pub badges: Vec<(String, DateTime<Utc>)>,
}

pub struct StateStore {
    agents: RwLock<HashMap<String, AgentRecord>>,
    focus: RwLock<Option<Focus>>,
    badges: RwLock<Vec<Badge>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            focus: RwLock::new(None),
            badges: RwLock::new(Vec::new()),
        }
    }

    /// Apply an event to the store. Records are replaced whole and stamped
    /// with the arrival clock, never with a timestamp embedded in the event,
    /// so the most recently *applied* event wins regardless of producer-side
    /// delays. Returns whether anything changed.
    pub async fn apply(&self, envelope: &EventEnvelope, now: DateTime<Utc>) -> bool {
        let kind = envelope.kind();
        let agent_id = envelope.agent_id.as_deref();

        let changed = match kind {
            EventKind::AgentActivity => {
                let Some(id) = agent_id else { return false };
                let raw = envelope.activity.as_deref().unwrap_or("idle");
                let record = if raw == "idle" {
                    AgentRecord::fresh(id, AgentStatus::Idle, Activity::Idle, now)
                } else {
                    // Best-effort on unrecognized activity values from newer
                    // producers: the agent is demonstrably doing something.
                    let activity = Activity::parse(raw).unwrap_or(Activity::Thinking);
                    AgentRecord::fresh(id, AgentStatus::Active, activity, now)
                };
                self.agents.write().await.insert(id.to_string(), record);
                self.bump_focus(id, now).await;
                true
            }
            EventKind::ToolStarted | EventKind::ToolFinished => {
                let Some(id) = agent_id else { return false };
                let record = AgentRecord::fresh(id, AgentStatus::Busy, Activity::Tooling, now);
                self.agents.write().await.insert(id.to_string(), record);
                self.bump_focus(id, now).await;
                true
            }
            EventKind::ToolFailed => {
                let Some(id) = agent_id else { return false };
                let record = AgentRecord::fresh(id, AgentStatus::Busy, Activity::Error, now);
                self.agents.write().await.insert(id.to_string(), record);
                self.bump_focus(id, now).await;
                true
            }
            EventKind::TaskCreated | EventKind::TaskRouted | EventKind::TaskStarted => {
                let Some(id) = agent_id else { return false };
                let activity = self
                    .agents
                    .read()
                    .await
                    .get(id)
                    .map(|r| r.activity)
                    .unwrap_or(Activity::Idle);
                let record = AgentRecord::fresh(id, AgentStatus::Active, activity, now);
                self.agents.write().await.insert(id.to_string(), record);
                self.bump_focus(id, now).await;
                true
            }
            EventKind::TaskCompleted | EventKind::TaskFailed => {
                // Conservative heuristic: a task boundary implies quiescence
                // unless a later event says otherwise.
                let Some(id) = agent_id else { return false };
                let record = AgentRecord::fresh(id, AgentStatus::Idle, Activity::Idle, now);
                self.agents.write().await.insert(id.to_string(), record);
                true
            }
            EventKind::BulkState => self.apply_bulk(envelope, now).await,
            EventKind::Unknown => {
                debug!(event_type = %envelope.event_type, "ignoring unknown event type");
                false
            }
        };

        if changed {
            if let Some(badge) = envelope.payload.get("badge").and_then(|v| v.as_str()) {
                self.push_badge(badge, now).await;
            }
        }

        changed
    }

    /// Bulk snapshot push — the producer's escape hatch when it holds an
    /// authoritative full view.
    async fn apply_bulk(&self, envelope: &EventEnvelope, now: DateTime<Utc>) -> bool {
        let mut changed = false;

        if let Some(items) = envelope.payload.get("agents").and_then(|v| v.as_array()) {
            let mut agents = self.agents.write().await;
            for item in items {
                let Some(id) = item.get("id").and_then(|v| v.as_str()) else {
                    continue;
                };
                let previous = agents.get(id).cloned();
                let status = item
                    .get("status")
                    .and_then(|v| serde_json::from_value::<AgentStatus>(v.clone()).ok())
                    .or(previous.as_ref().map(|r| r.status))
                    .unwrap_or(AgentStatus::Idle);
                let activity = item
                    .get("activity")
                    .and_then(|v| serde_json::from_value::<Activity>(v.clone()).ok())
                    .or(previous.as_ref().map(|r| r.activity))
                    .unwrap_or(Activity::Idle);
                agents.insert(id.to_string(), AgentRecord::fresh(id, status, activity, now));
                changed = true;
            }
        }

        match envelope.payload.get("activeAgentId") {
            Some(serde_json::Value::String(id)) => {
                self.bump_focus(id, now).await;
                changed = true;
            }
            Some(serde_json::Value::Null) => {
                *self.focus.write().await = None;
                changed = true;
            }
            _ => {}
        }

        if let Some(labels) = envelope.payload.get("coordinatorBadges").and_then(|v| v.as_array()) {
            let replacement: Vec<Badge> = labels
                .iter()
                .filter_map(|v| v.as_str())
                .map(|label| Badge {
                    label: label.to_string(),
                    at: now,
                })
                .collect();
            *self.badges.write().await = replacement;
            changed = true;
        }

        changed
    }

    async fn bump_focus(&self, agent_id: &str, now: DateTime<Utc>) {
        *self.focus.write().await = Some(Focus {
            agent_id: agent_id.to_string(),
            set_at: now,
        });
    }

    async fn push_badge(&self, label: &str, now: DateTime<Utc>) {
        let mut badges = self.badges.write().await;
        badges.push(Badge {
            label: label.to_string(),
            at: now,
        });
        // Old entries are filtered at read time; just bound the buffer here.
        if badges.len() > 64 {
            let excess = badges.len() - 64;
            badges.drain(..excess);
        }
    }

    /// Copy out everything the reconciler needs for one deterministic pass.
    pub async fn contents(&self) -> StoreContents {
        let agents = self.agents.read().await.values().cloned().collect();
        let focus = self
            .focus
            .read()
            .await
            .as_ref()
            .map(|f| (f.agent_id.clone(), f.set_at));
        let badges = self
            .badges
            .read()
            .await
            .iter()
            .map(|b| (b.label.clone(), b.at))
            .collect();
        StoreContents {
            agents,
            focus,
            badges,
        }
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.read().await.get(agent_id).cloned()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
