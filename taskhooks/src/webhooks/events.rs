//! Webhook event types and payload builders.
//!
//! Task status events are produced by the task engine whenever a task transitions between
//! lifecycle states. They are delivered as-is, without any envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// Lifecycle status of a task.
///
/// The lifecycle is ordered but not strictly monotonic: `paused` and `stopped` may occur
/// mid-sequence, `finished` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Initializing,
    Started,
    Paused,
    Stopped,
    Finished,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Finished => "finished",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "started" => Ok(Self::Started),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            "finished" => Ok(Self::Finished),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// A task status transition, as emitted by the task engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub session_id: Uuid,
    pub task_id: Uuid,
    pub status: TaskStatus,
}

impl TaskEvent {
    pub fn new(session_id: Uuid, task_id: Uuid, status: TaskStatus) -> Self {
        Self {
            session_id,
            task_id,
            status,
        }
    }

    /// JSON payload delivered to endpoints.
    pub fn to_payload(&self) -> Value {
        json!({
            "session_id": self.session_id.to_string(),
            "task_id": self.task_id.to_string(),
            "status": self.status.as_str(),
        })
    }
}

/// Fixed body sent once to a newly registered endpoint before it is activated.
pub fn probe_payload() -> Value {
    json!({"test": "ok"})
}
