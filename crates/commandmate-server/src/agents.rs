use axum::{
    Json,
    extract::{Path, State},
};
use commandmate_core::{AgentState, now_ms};
use commandmate_protocol::{
    AgentRecord, Envelope, EventKind, RegisterAgentRequest, events::AgentHeartbeat,
};
use rusqlite::{Connection, params};
use tracing::{debug, info};

use crate::{
    AppState, db,
    error::{ApiError, require},
    extract::ApiJson,
    profiles,
};

const AGENT_COLUMNS: &str =
    "agent_id, name, role, state, profile, current_task_id, last_heartbeat_ms, updated_at_ms";

pub async fn register_agent(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<RegisterAgentRequest>,
) -> Result<Json<AgentRecord>, ApiError> {
    require(&request.agent_id, "agent_id")?;
    require(&request.name, "name")?;
    require(&request.role, "role")?;

    let now = now_ms();
    let db = state.db.lock().await;
    if let Some(profile) = &request.profile
        && profiles::fetch_profile(&db, profile)?.is_none()
    {
        return Err(ApiError::not_found("profile not found"));
    }
    db.execute(
        "
        INSERT INTO agents (agent_id, name, role, state, profile, current_task_id, last_heartbeat_ms, updated_at_ms)
        VALUES (?1, ?2, ?3, 'idle', ?4, NULL, ?5, ?5)
        ON CONFLICT(agent_id) DO UPDATE SET
          name=excluded.name,
          role=excluded.role,
          profile=excluded.profile,
          last_heartbeat_ms=excluded.last_heartbeat_ms,
          updated_at_ms=excluded.updated_at_ms
        ",
        params![request.agent_id, request.name, request.role, request.profile, now],
    )?;

    let agent = fetch_agent(&db, &request.agent_id)?
        .ok_or_else(|| ApiError::internal("failed to reload agent after registration"))?;
    info!(agent_id = %agent.agent_id, role = %agent.role, "agent registered");
    Ok(Json(agent))
}

pub async fn list_agents(
    State(state): State<AppState>,
) -> Result<Json<Vec<AgentRecord>>, ApiError> {
    let db = state.db.lock().await;
    Ok(Json(query_agents(&db, state.config.agents.offline_after_ms)?))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentRecord>, ApiError> {
    let now = now_ms();
    let db = state.db.lock().await;
    if touch_heartbeat(&db, &agent_id, now)? == 0 {
        return Err(ApiError::not_found("agent not found"));
    }
    let agent = fetch_agent(&db, &agent_id)?
        .ok_or_else(|| ApiError::internal("failed to reload agent after heartbeat"))?;
    drop(db);

    debug!(agent_id = %agent.agent_id, "heartbeat");
    state.events.publish(Envelope::new(EventKind::AgentHeartbeat(AgentHeartbeat {
        agent_id: agent.agent_id.clone(),
        state: agent.state,
    })));
    Ok(Json(agent))
}

/// Agents that have not been heard from within `offline_after_ms` read as offline.
#[must_use]
pub fn effective_state(agent: &AgentRecord, now: u64, offline_after_ms: u64) -> AgentState {
    let last_seen = agent.last_heartbeat_ms.unwrap_or(agent.updated_at_ms);
    if now.saturating_sub(last_seen) > offline_after_ms {
        AgentState::Offline
    } else {
        agent.state
    }
}

pub(crate) fn mark_busy(
    conn: &Connection,
    agent_id: &str,
    task_id: &str,
    now: u64,
) -> Result<(), ApiError> {
    conn.execute(
        "UPDATE agents SET state = 'busy', current_task_id = ?2, last_heartbeat_ms = ?3, updated_at_ms = ?3 WHERE agent_id = ?1",
        params![agent_id, task_id, now],
    )?;
    Ok(())
}

pub(crate) fn mark_idle(conn: &Connection, agent_id: &str, now: u64) -> Result<(), ApiError> {
    conn.execute(
        "UPDATE agents SET state = 'idle', current_task_id = NULL, last_heartbeat_ms = ?2, updated_at_ms = ?2 WHERE agent_id = ?1",
        params![agent_id, now],
    )?;
    Ok(())
}

pub(crate) fn touch_heartbeat(
    conn: &Connection,
    agent_id: &str,
    now: u64,
) -> Result<usize, ApiError> {
    Ok(conn.execute(
        "UPDATE agents SET last_heartbeat_ms = ?2 WHERE agent_id = ?1",
        params![agent_id, now],
    )?)
}

pub(crate) fn query_agents(
    conn: &Connection,
    offline_after_ms: u64,
) -> Result<Vec<AgentRecord>, ApiError> {
    let now = now_ms();
    let mut stmt =
        conn.prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY agent_id"))?;
    let rows = stmt.query_map([], map_agent_row)?;
    Ok(rows
        .filter_map(Result::ok)
        .map(|mut agent| {
            agent.state = effective_state(&agent, now, offline_after_ms);
            agent
        })
        .collect())
}

pub(crate) fn fetch_agent(
    conn: &Connection,
    agent_id: &str,
) -> Result<Option<AgentRecord>, ApiError> {
    let mut stmt =
        conn.prepare(&format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = ?1"))?;
    let mut rows = stmt.query(params![agent_id])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(map_agent_row(row)?));
    }
    Ok(None)
}

fn map_agent_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
    Ok(AgentRecord {
        agent_id: row.get(0)?,
        name: row.get(1)?,
        role: row.get(2)?,
        state: AgentState::from_db(&row.get::<_, String>(3)?),
        profile: row.get(4)?,
        current_task_id: row.get(5)?,
        last_heartbeat_ms: db::opt_ms(row.get(6)?),
        updated_at_ms: row.get::<_, i64>(7)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use reqwest::StatusCode;
    use serde_json::json;

    fn agent(state: AgentState, heartbeat: Option<u64>, updated: u64) -> AgentRecord {
        AgentRecord {
            agent_id: "a".to_string(),
            name: "a".to_string(),
            role: "worker".to_string(),
            state,
            profile: None,
            current_task_id: None,
            last_heartbeat_ms: heartbeat,
            updated_at_ms: updated,
        }
    }

    #[test]
    fn stale_heartbeat_reads_as_offline() {
        let busy = agent(AgentState::Busy, Some(1_000), 0);
        assert_eq!(effective_state(&busy, 2_000, 5_000), AgentState::Busy);
        assert_eq!(effective_state(&busy, 10_000, 5_000), AgentState::Offline);

        let never_beat = agent(AgentState::Idle, None, 9_000);
        assert_eq!(effective_state(&never_beat, 10_000, 5_000), AgentState::Idle);
    }

    #[tokio::test]
    async fn register_is_an_upsert() {
        let server = spawn().await;
        server.put("/v1/profiles/writer", &json!({})).await;
        let body = json!({ "agent_id": "a-1", "name": "Ada", "role": "writer" });
        let (status, first) = server.post("/v1/agents/register", &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["state"], "idle");

        let body = json!({ "agent_id": "a-1", "name": "Ada II", "role": "editor", "profile": "writer" });
        let (status, second) = server.post("/v1/agents/register", &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["name"], "Ada II");
        assert_eq!(second["profile"], "writer");

        let (_, agents) = server.get("/v1/agents").await;
        assert_eq!(agents.as_array().expect("array").len(), 1);
    }

    #[tokio::test]
    async fn register_rejects_unknown_profile() {
        let server = spawn().await;
        let body = json!({ "agent_id": "a-1", "name": "Ada", "role": "w", "profile": "ghost" });
        let (status, body) = server.post("/v1/agents/register", &body).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "profile not found");

        let (_, agents) = server.get("/v1/agents").await;
        assert!(agents.as_array().expect("array").is_empty());
    }

    #[tokio::test]
    async fn register_requires_fields() {
        let server = spawn().await;
        let (status, body) = server
            .post("/v1/agents/register", &json!({ "agent_id": "a-1", "name": "", "role": "w" }))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "name is required");
    }

    #[tokio::test]
    async fn heartbeat_unknown_agent_is_404() {
        let server = spawn().await;
        let (status, _) = server.post("/v1/agents/ghost/heartbeat", &json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        server
            .post("/v1/agents/register", &json!({ "agent_id": "a-1", "name": "Ada", "role": "w" }))
            .await;
        let (status, body) = server.post("/v1/agents/a-1/heartbeat", &json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["last_heartbeat_ms"].is_u64());
    }
}
