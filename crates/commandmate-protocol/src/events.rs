use commandmate_core::{AgentState, TaskPriority, TaskStatus, Verdict, now_ms};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One lifecycle event as pushed over `/v1/events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: Uuid,
    pub workspace_id: Option<String>,
    pub task_id: Option<String>,
    pub kind: EventKind,
    pub sent_at_ms: u64,
}

impl Envelope {
    #[must_use]
    pub fn new(kind: EventKind) -> Self {
        Self { event_id: Uuid::new_v4(), workspace_id: None, task_id: None, kind, sent_at_ms: now_ms() }
    }

    #[must_use]
    pub fn for_task(kind: EventKind, workspace_id: &str, task_id: &str) -> Self {
        Self {
            workspace_id: Some(workspace_id.to_string()),
            task_id: Some(task_id.to_string()),
            ..Self::new(kind)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    TaskQueued(TaskQueued),
    TaskClaimed(TaskClaimed),
    TaskProgress(TaskProgress),
    TaskSubmitted(TaskSubmitted),
    TaskReviewed(TaskReviewed),
    AgentHeartbeat(AgentHeartbeat),
    McpCallRecorded(McpCallRecorded),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueued {
    pub title: String,
    pub priority: TaskPriority,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClaimed {
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgress {
    pub agent_id: String,
    pub percent: u8,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmitted {
    pub agent_id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReviewed {
    pub verdict: Verdict,
    pub status: TaskStatus,
    pub reviewer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHeartbeat {
    pub agent_id: String,
    pub state: AgentState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpCallRecorded {
    pub server_id: String,
    pub tool: String,
    pub success: bool,
    pub latency_ms: u64,
}
