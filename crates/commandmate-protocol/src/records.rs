use commandmate_core::{
    AgentState, FeedbackEntry, LatencyStats, LearningSummary, McpTransport, TaskPriority,
    TaskStatus,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub workspace_id: String,
    pub title: String,
    pub description: Option<String>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub requires_approval: bool,
    pub agent_profile: Option<String>,
    pub assigned_agent_id: Option<String>,
    pub progress_percent: u8,
    pub progress_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub review_feedback: Option<String>,
    pub reviewed_by: Option<String>,
    pub attempts: u32,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub claimed_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub name: String,
    pub role: String,
    pub state: AgentState,
    pub profile: Option<String>,
    pub current_task_id: Option<String>,
    pub last_heartbeat_ms: Option<u64>,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub name: String,
    pub description: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub approval_required: bool,
    pub config: serde_json::Value,
    pub approved_count: u64,
    pub rejected_count: u64,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileDetail {
    pub profile: ProfileRecord,
    pub feedback: Vec<FeedbackEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileLearning {
    pub profile: String,
    pub summary: LearningSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub workspace_id: String,
    pub title: String,
    pub content: String,
    pub tags: Vec<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerRecord {
    pub server_id: String,
    pub workspace_id: String,
    pub name: String,
    pub transport: McpTransport,
    pub endpoint: Option<String>,
    pub enabled: bool,
    pub call_count: u64,
    pub error_count: u64,
    pub total_latency_ms: u64,
    pub last_error: Option<String>,
    pub last_called_at_ms: Option<u64>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Tool descriptor as returned by an MCP server's `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolList {
    pub server_id: String,
    pub cached: bool,
    pub tools: Vec<McpTool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpCallResponse {
    pub call_id: String,
    pub server_id: String,
    pub tool: String,
    pub latency_ms: u64,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerMetrics {
    pub server_id: String,
    pub name: String,
    pub lifetime_calls: u64,
    pub lifetime_errors: u64,
    /// Computed over the most recent window of the call log.
    pub recent: LatencyStats,
    pub last_error: Option<String>,
    pub last_called_at_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total_tasks: usize,
    pub queued_tasks: usize,
    pub in_progress_tasks: usize,
    pub pending_approval_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub total_agents: usize,
    pub busy_agents: usize,
    pub offline_agents: usize,
    pub mcp_servers: usize,
    pub mcp_calls: u64,
    pub mcp_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub generated_at_ms: u64,
    pub summary: StatusSummary,
    pub agents: Vec<AgentRecord>,
    pub pending_approvals: Vec<TaskRecord>,
    pub mcp_servers: Vec<McpServerRecord>,
}
