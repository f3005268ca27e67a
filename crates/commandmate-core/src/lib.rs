use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Number of rejection comments surfaced as lessons in a learning summary.
pub const MAX_LESSONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub Uuid);

impl ServerId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    PendingApproval,
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::PendingApproval => "pending_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "pending_approval" => Some(Self::PendingApproval),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Lenient variant for rows read back from storage.
    #[must_use]
    pub fn from_db(raw: &str) -> Self {
        Self::parse(raw).unwrap_or(Self::Queued)
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }

    #[must_use]
    pub fn from_db(raw: &str) -> Self {
        match raw {
            "low" => Self::Low,
            "high" => Self::High,
            "urgent" => Self::Urgent,
            _ => Self::Medium,
        }
    }

    /// Sort key stored next to the label so the queue can be ordered in SQL.
    #[must_use]
    pub fn rank(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Urgent => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Busy,
    Offline,
}

impl AgentState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }

    #[must_use]
    pub fn from_db(raw: &str) -> Self {
        match raw {
            "busy" => Self::Busy,
            "offline" => Self::Offline,
            _ => Self::Idle,
        }
    }
}

/// How the server reaches an MCP tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransport {
    /// JSON-RPC 2.0 posted straight to the server's endpoint.
    Http,
    /// Routed through the configured tool gateway.
    Gateway,
}

impl McpTransport {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Gateway => "gateway",
        }
    }

    #[must_use]
    pub fn from_db(raw: &str) -> Self {
        match raw {
            "gateway" => Self::Gateway,
            _ => Self::Http,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approved,
    Rejected,
}

impl Verdict {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    #[must_use]
    pub fn from_db(raw: &str) -> Self {
        match raw {
            "rejected" => Self::Rejected,
            _ => Self::Approved,
        }
    }
}

/// Status a task lands in when its agent reports completion.
#[must_use]
pub fn completion_status(success: bool, needs_approval: bool) -> TaskStatus {
    match (success, needs_approval) {
        (false, _) => TaskStatus::Failed,
        (true, true) => TaskStatus::PendingApproval,
        (true, false) => TaskStatus::Completed,
    }
}

/// Status a rejected task moves to.
#[must_use]
pub fn rejection_status(requeue: bool) -> TaskStatus {
    if requeue { TaskStatus::Queued } else { TaskStatus::Failed }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub feedback_id: String,
    pub profile: String,
    pub task_id: String,
    pub verdict: Verdict,
    pub comment: Option<String>,
    pub reviewer: Option<String>,
    pub created_at_ms: u64,
}

/// What an agent profile has learned from its reviews so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LearningSummary {
    pub total_reviews: usize,
    pub approved: usize,
    pub rejected: usize,
    pub approval_rate: Option<f64>,
    /// Newest rejection comments first.
    pub lessons: Vec<String>,
}

impl LearningSummary {
    #[must_use]
    pub fn from_feedback(entries: &[FeedbackEntry]) -> Self {
        let approved = entries.iter().filter(|e| e.verdict == Verdict::Approved).count();
        let rejected = entries.len() - approved;

        let mut rejections = entries
            .iter()
            .filter(|e| e.verdict == Verdict::Rejected)
            .filter_map(|e| {
                let comment = e.comment.as_deref()?.trim();
                (!comment.is_empty()).then(|| (e.created_at_ms, comment.to_string()))
            })
            .collect::<Vec<_>>();
        rejections.sort_by(|a, b| b.0.cmp(&a.0));

        Self {
            total_reviews: entries.len(),
            approved,
            rejected,
            approval_rate: (!entries.is_empty())
                .then(|| approved as f64 / entries.len() as f64),
            lessons: rejections.into_iter().take(MAX_LESSONS).map(|(_, c)| c).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSample {
    pub latency_ms: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub calls: usize,
    pub errors: usize,
    pub error_rate: Option<f64>,
    pub avg_latency_ms: Option<u64>,
    pub p95_latency_ms: Option<u64>,
}

impl LatencyStats {
    #[must_use]
    pub fn from_samples(samples: &[CallSample]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let errors = samples.iter().filter(|s| !s.success).count();
        let mut latencies = samples.iter().map(|s| s.latency_ms).collect::<Vec<_>>();
        latencies.sort_unstable();

        let sum: u64 = latencies.iter().sum();
        // nearest-rank percentile
        let rank = (latencies.len() * 95).div_ceil(100).max(1);

        Self {
            calls: samples.len(),
            errors,
            error_rate: Some(errors as f64 / samples.len() as f64),
            avg_latency_ms: Some(sum / latencies.len() as u64),
            p95_latency_ms: latencies.get(rank - 1).copied(),
        }
    }
}

#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feedback(verdict: Verdict, comment: Option<&str>, at: u64) -> FeedbackEntry {
        FeedbackEntry {
            feedback_id: Uuid::new_v4().to_string(),
            profile: "writer".to_string(),
            task_id: TaskId::new().to_string(),
            verdict,
            comment: comment.map(str::to_string),
            reviewer: None,
            created_at_ms: at,
        }
    }

    #[test]
    fn task_id_is_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
    }

    #[test]
    fn status_labels_round_trip() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::InProgress,
            TaskStatus::PendingApproval,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("running"), None);
    }

    #[test]
    fn completion_is_gated_by_approval() {
        assert_eq!(completion_status(true, true), TaskStatus::PendingApproval);
        assert_eq!(completion_status(true, false), TaskStatus::Completed);
        assert_eq!(completion_status(false, true), TaskStatus::Failed);
        assert_eq!(completion_status(false, false), TaskStatus::Failed);
    }

    #[test]
    fn rejection_requeues_unless_told_otherwise() {
        assert_eq!(rejection_status(true), TaskStatus::Queued);
        assert_eq!(rejection_status(false), TaskStatus::Failed);
    }

    #[test]
    fn priority_rank_follows_ordering() {
        assert!(TaskPriority::Urgent.rank() > TaskPriority::High.rank());
        assert!(TaskPriority::High.rank() > TaskPriority::Medium.rank());
        assert!(TaskPriority::Medium.rank() > TaskPriority::Low.rank());
        assert_eq!(TaskPriority::default(), TaskPriority::Medium);
    }

    #[test]
    fn learning_summary_without_feedback() {
        let summary = LearningSummary::from_feedback(&[]);
        assert_eq!(summary.total_reviews, 0);
        assert_eq!(summary.approval_rate, None);
        assert!(summary.lessons.is_empty());
    }

    #[test]
    fn learning_summary_orders_lessons_newest_first() {
        let entries = vec![
            feedback(Verdict::Rejected, Some("cite sources"), 10),
            feedback(Verdict::Approved, Some("nice"), 20),
            feedback(Verdict::Rejected, Some("too long"), 30),
            feedback(Verdict::Rejected, Some("   "), 40),
            feedback(Verdict::Rejected, None, 50),
        ];
        let summary = LearningSummary::from_feedback(&entries);
        assert_eq!(summary.total_reviews, 5);
        assert_eq!(summary.approved, 1);
        assert_eq!(summary.rejected, 4);
        assert_eq!(summary.approval_rate, Some(0.2));
        assert_eq!(summary.lessons, vec!["too long".to_string(), "cite sources".to_string()]);
    }

    #[test]
    fn learning_summary_caps_lessons() {
        let entries = (0..8)
            .map(|i| feedback(Verdict::Rejected, Some(&format!("lesson {i}")), i))
            .collect::<Vec<_>>();
        let summary = LearningSummary::from_feedback(&entries);
        assert_eq!(summary.lessons.len(), MAX_LESSONS);
        assert_eq!(summary.lessons[0], "lesson 7");
    }

    #[test]
    fn latency_stats_use_nearest_rank_p95() {
        let samples = (1..=20)
            .map(|ms| CallSample { latency_ms: ms * 10, success: ms != 3 })
            .collect::<Vec<_>>();
        let stats = LatencyStats::from_samples(&samples);
        assert_eq!(stats.calls, 20);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.error_rate, Some(0.05));
        assert_eq!(stats.avg_latency_ms, Some(105));
        assert_eq!(stats.p95_latency_ms, Some(190));
    }

    #[test]
    fn latency_stats_single_sample() {
        let stats = LatencyStats::from_samples(&[CallSample { latency_ms: 42, success: false }]);
        assert_eq!(stats.p95_latency_ms, Some(42));
        assert_eq!(stats.error_rate, Some(1.0));
    }
}
