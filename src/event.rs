use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// In-flight event from an external producer. Transient — only its effect on
/// an agent record persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: Value,
}

/// Closed dispatch over the event types the store understands. Producers
/// evolve independently, so anything unrecognized is an explicit no-op
/// rather than a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    AgentActivity,
    ToolStarted,
    ToolFinished,
    ToolFailed,
    TaskCreated,
    TaskRouted,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    BulkState,
    Unknown,
}

impl EventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "agent.activity" => EventKind::AgentActivity,
            "tool.started" => EventKind::ToolStarted,
            "tool.finished" => EventKind::ToolFinished,
            "tool.failed" => EventKind::ToolFailed,
            "task.created" => EventKind::TaskCreated,
            "task.routed" => EventKind::TaskRouted,
            "task.started" => EventKind::TaskStarted,
            "task.completed" => EventKind::TaskCompleted,
            "task.failed" => EventKind::TaskFailed,
            "state" => EventKind::BulkState,
            _ => EventKind::Unknown,
        }
    }

    /// Whether the store has a defined transition for this kind.
    pub fn mutates_store(&self) -> bool {
        !matches!(self, EventKind::Unknown)
    }
}

impl EventEnvelope {
    pub fn kind(&self) -> EventKind {
        EventKind::parse(&self.event_type)
    }
}

/// Acknowledgement returned by the ingest gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestAck {
    pub accepted: bool,
    pub event_id: String,
    pub ts: DateTime<Utc>,
}
