use axum::{Json, extract::State};
use commandmate_core::{AgentState, TaskStatus, now_ms};
use commandmate_protocol::{StatusSnapshot, StatusSummary};
use rusqlite::Connection;

use crate::{AppState, agents, error::ApiError, mcp, tasks};

/// Dashboard snapshot: queue counts, agent liveness, approvals waiting on a
/// human and MCP server health.
pub async fn get_status(State(state): State<AppState>) -> Result<Json<StatusSnapshot>, ApiError> {
    let db = state.db.lock().await;
    let counts = count_tasks_by_status(&db)?;
    let agents = agents::query_agents(&db, state.config.agents.offline_after_ms)?;
    let pending_approvals = tasks::query_tasks(&db, Some(TaskStatus::PendingApproval), None, None)?;
    let mcp_servers = mcp::query_servers(&db, None)?;

    let count = |status: TaskStatus| {
        counts.iter().find(|(s, _)| *s == status).map_or(0, |(_, n)| *n)
    };

    let summary = StatusSummary {
        total_tasks: counts.iter().map(|(_, n)| n).sum(),
        queued_tasks: count(TaskStatus::Queued),
        in_progress_tasks: count(TaskStatus::InProgress),
        pending_approval_tasks: count(TaskStatus::PendingApproval),
        completed_tasks: count(TaskStatus::Completed),
        failed_tasks: count(TaskStatus::Failed),
        total_agents: agents.len(),
        busy_agents: agents.iter().filter(|a| matches!(a.state, AgentState::Busy)).count(),
        offline_agents: agents.iter().filter(|a| matches!(a.state, AgentState::Offline)).count(),
        mcp_servers: mcp_servers.len(),
        mcp_calls: mcp_servers.iter().map(|s| s.call_count).sum(),
        mcp_errors: mcp_servers.iter().map(|s| s.error_count).sum(),
    };

    Ok(Json(StatusSnapshot {
        generated_at_ms: now_ms(),
        summary,
        agents,
        pending_approvals,
        mcp_servers,
    }))
}

fn count_tasks_by_status(conn: &Connection) -> Result<Vec<(TaskStatus, usize)>, ApiError> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((TaskStatus::from_db(&row.get::<_, String>(0)?), row.get::<_, i64>(1)? as usize))
    })?;
    Ok(rows.filter_map(Result::ok).collect())
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use commandmate_protocol::{ClaimNextRequest, CreateTaskRequest, RegisterAgentRequest};

    #[tokio::test]
    async fn snapshot_counts_queue_and_agents() {
        let server = spawn().await;
        let client = server.client();
        client
            .register_agent(&RegisterAgentRequest {
                agent_id: "agent-a".to_string(),
                name: "A".to_string(),
                role: "worker".to_string(),
                profile: None,
            })
            .await
            .expect("register");
        for title in ["one", "two", "three"] {
            client
                .create_task(&CreateTaskRequest {
                    workspace_id: None,
                    title: title.to_string(),
                    description: None,
                    priority: None,
                    requires_approval: Some(true),
                    agent_profile: None,
                })
                .await
                .expect("create");
        }
        client
            .claim_next(&ClaimNextRequest { agent_id: "agent-a".to_string(), workspace_id: None })
            .await
            .expect("claim")
            .expect("a queued task");

        let snapshot = client.status().await.expect("status");
        assert_eq!(snapshot.summary.total_tasks, 3);
        assert_eq!(snapshot.summary.queued_tasks, 2);
        assert_eq!(snapshot.summary.in_progress_tasks, 1);
        assert_eq!(snapshot.summary.total_agents, 1);
        assert_eq!(snapshot.summary.busy_agents, 1);
        assert_eq!(snapshot.summary.offline_agents, 0);
        assert!(snapshot.pending_approvals.is_empty());
    }
}
