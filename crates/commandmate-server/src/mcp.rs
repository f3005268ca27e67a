use axum::{
    Json,
    extract::{Path, Query, State},
};
use commandmate_core::{CallSample, LatencyStats, McpTransport, ServerId, now_ms};
use commandmate_protocol::{
    Envelope, EventKind, McpCallRequest, McpCallResponse, McpServerMetrics, McpServerRecord,
    McpToolList, RegisterMcpServerRequest, SetEnabledRequest, events::McpCallRecorded,
};
use rusqlite::{Connection, params};
use serde::Deserialize;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    AppState, db,
    error::{ApiError, require},
    extract::ApiJson,
    mcp_client::{self, McpTarget},
};

/// Calls considered when computing latency percentiles.
const METRICS_WINDOW: i64 = 500;

const SERVER_COLUMNS: &str = "
    server_id, workspace_id, name, transport, endpoint, enabled, call_count, error_count,
    total_latency_ms, last_error, last_called_at_ms, created_at_ms, updated_at_ms
";

#[derive(Debug, Default, Deserialize)]
pub struct ToolsQuery {
    pub refresh: Option<bool>,
}

pub async fn register_server(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    ApiJson(request): ApiJson<RegisterMcpServerRequest>,
) -> Result<Json<McpServerRecord>, ApiError> {
    require(&workspace_id, "workspace_id")?;
    require(&request.name, "name")?;

    let endpoint = request.endpoint.map(|e| e.trim().to_string()).filter(|e| !e.is_empty());
    if let Some(endpoint) = &endpoint
        && !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
    {
        return Err(ApiError::bad_request("endpoint must be an http(s) URL"));
    }
    if request.transport == McpTransport::Http && endpoint.is_none() {
        return Err(ApiError::bad_request("endpoint is required for http transport"));
    }

    let now = now_ms();
    let db = state.db.lock().await;
    db.execute(
        "
        INSERT INTO mcp_servers (
          server_id, workspace_id, name, transport, endpoint, enabled, created_at_ms, updated_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
        ON CONFLICT(workspace_id, name) DO UPDATE SET
          transport = excluded.transport,
          endpoint = excluded.endpoint,
          enabled = excluded.enabled,
          updated_at_ms = excluded.updated_at_ms
        ",
        params![
            ServerId::new().to_string(),
            workspace_id,
            request.name,
            request.transport.as_str(),
            endpoint,
            request.enabled.unwrap_or(true),
            now
        ],
    )?;
    let server = fetch_server_by_name(&db, &workspace_id, &request.name)?
        .ok_or_else(|| ApiError::internal("failed to reload server after registration"))?;
    drop(db);

    state.tools.evict(&server.server_id).await;
    info!(
        server_id = %server.server_id,
        workspace_id = %server.workspace_id,
        name = %server.name,
        transport = server.transport.as_str(),
        "mcp server registered"
    );
    Ok(Json(server))
}

pub async fn list_servers(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
) -> Result<Json<Vec<McpServerRecord>>, ApiError> {
    let db = state.db.lock().await;
    Ok(Json(query_servers(&db, Some(&workspace_id))?))
}

pub async fn get_server(
    State(state): State<AppState>,
    Path((workspace_id, server_id)): Path<(String, String)>,
) -> Result<Json<McpServerRecord>, ApiError> {
    let db = state.db.lock().await;
    Ok(Json(load_server(&db, &workspace_id, &server_id)?))
}

pub async fn delete_server(
    State(state): State<AppState>,
    Path((workspace_id, server_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = state.db.lock().await;
    let deleted = db.execute(
        "DELETE FROM mcp_servers WHERE server_id = ?1 AND workspace_id = ?2",
        params![server_id, workspace_id],
    )?;
    drop(db);
    if deleted == 0 {
        return Err(ApiError::not_found("mcp server not found"));
    }
    state.tools.evict(&server_id).await;
    info!(server_id = %server_id, "mcp server removed");
    Ok(Json(serde_json::json!({ "ok": true, "server_id": server_id })))
}

pub async fn set_enabled(
    State(state): State<AppState>,
    Path((workspace_id, server_id)): Path<(String, String)>,
    ApiJson(request): ApiJson<SetEnabledRequest>,
) -> Result<Json<McpServerRecord>, ApiError> {
    let db = state.db.lock().await;
    let changed = db.execute(
        "UPDATE mcp_servers SET enabled = ?3, updated_at_ms = ?4 WHERE server_id = ?1 AND workspace_id = ?2",
        params![server_id, workspace_id, request.enabled, now_ms()],
    )?;
    if changed == 0 {
        return Err(ApiError::not_found("mcp server not found"));
    }
    Ok(Json(load_server(&db, &workspace_id, &server_id)?))
}

pub async fn list_tools(
    State(state): State<AppState>,
    Path((workspace_id, server_id)): Path<(String, String)>,
    Query(query): Query<ToolsQuery>,
) -> Result<Json<McpToolList>, ApiError> {
    let server = {
        let db = state.db.lock().await;
        load_server(&db, &workspace_id, &server_id)?
    };
    ensure_enabled(&server)?;

    if !query.refresh.unwrap_or(false)
        && let Some(tools) = state.tools.get(&server.server_id).await
    {
        return Ok(Json(McpToolList { server_id: server.server_id, cached: true, tools }));
    }

    let target = resolve_target(&state, &server)?;
    let tools = mcp_client::list_tools(&state.http, target).await.map_err(|err| {
        warn!(server_id = %server.server_id, error = %err, "tool listing failed");
        ApiError::bad_gateway(err)
    })?;
    state.tools.insert(&server.server_id, tools.clone()).await;
    Ok(Json(McpToolList { server_id: server.server_id, cached: false, tools }))
}

/// Proxies one tool call and records its latency and outcome.
pub async fn call_tool(
    State(state): State<AppState>,
    Path((workspace_id, server_id)): Path<(String, String)>,
    ApiJson(request): ApiJson<McpCallRequest>,
) -> Result<Json<McpCallResponse>, ApiError> {
    require(&request.tool, "tool")?;
    let server = {
        let db = state.db.lock().await;
        load_server(&db, &workspace_id, &server_id)?
    };
    ensure_enabled(&server)?;
    let target = resolve_target(&state, &server)?;

    let arguments = if request.arguments.is_null() {
        serde_json::json!({})
    } else {
        request.arguments
    };

    let started = Instant::now();
    let outcome = mcp_client::call_tool(&state.http, target, &request.tool, arguments).await;
    let latency_ms = started.elapsed().as_millis() as u64;

    let call_id = {
        let db = state.db.lock().await;
        record_call(
            &db,
            &server.server_id,
            &request.tool,
            latency_ms,
            outcome.as_ref().err(),
            now_ms(),
        )?
    };

    state.events.publish(Envelope {
        workspace_id: Some(server.workspace_id.clone()),
        ..Envelope::new(EventKind::McpCallRecorded(McpCallRecorded {
            server_id: server.server_id.clone(),
            tool: request.tool.clone(),
            success: outcome.is_ok(),
            latency_ms,
        }))
    });

    match outcome {
        Ok(result) => {
            info!(server_id = %server.server_id, tool = %request.tool, latency_ms, "mcp call succeeded");
            Ok(Json(McpCallResponse {
                call_id,
                server_id: server.server_id,
                tool: request.tool,
                latency_ms,
                result,
            }))
        }
        Err(err) => {
            warn!(server_id = %server.server_id, tool = %request.tool, latency_ms, error = %err, "mcp call failed");
            Err(ApiError::bad_gateway(err))
        }
    }
}

pub async fn server_metrics(
    State(state): State<AppState>,
    Path((workspace_id, server_id)): Path<(String, String)>,
) -> Result<Json<McpServerMetrics>, ApiError> {
    let db = state.db.lock().await;
    let server = load_server(&db, &workspace_id, &server_id)?;

    let mut stmt = db.prepare(
        "
        SELECT latency_ms, success FROM mcp_calls
        WHERE server_id = ?1
        ORDER BY created_at_ms DESC, rowid DESC
        LIMIT ?2
        ",
    )?;
    let samples = stmt
        .query_map(params![server.server_id, METRICS_WINDOW], |row| {
            Ok(CallSample { latency_ms: row.get::<_, i64>(0)? as u64, success: row.get(1)? })
        })?
        .filter_map(Result::ok)
        .collect::<Vec<_>>();

    Ok(Json(McpServerMetrics {
        server_id: server.server_id,
        name: server.name,
        lifetime_calls: server.call_count,
        lifetime_errors: server.error_count,
        recent: LatencyStats::from_samples(&samples),
        last_error: server.last_error,
        last_called_at_ms: server.last_called_at_ms,
    }))
}

fn ensure_enabled(server: &McpServerRecord) -> Result<(), ApiError> {
    if !server.enabled {
        return Err(ApiError::conflict("mcp server is disabled"));
    }
    Ok(())
}

fn resolve_target<'a>(
    state: &'a AppState,
    server: &'a McpServerRecord,
) -> Result<McpTarget<'a>, ApiError> {
    match server.transport {
        McpTransport::Http => {
            let endpoint = server
                .endpoint
                .as_deref()
                .ok_or_else(|| ApiError::bad_request("mcp server has no endpoint"))?;
            Ok(McpTarget::Direct { endpoint })
        }
        McpTransport::Gateway => {
            let base_url = state
                .config
                .mcp
                .gateway_url
                .as_deref()
                .ok_or_else(|| ApiError::bad_request("mcp.gateway_url is not configured"))?;
            Ok(McpTarget::Gateway { base_url, server: &server.name })
        }
    }
}

fn record_call(
    conn: &Connection,
    server_id: &str,
    tool: &str,
    latency_ms: u64,
    error: Option<&String>,
    now: u64,
) -> Result<String, ApiError> {
    let call_id = Uuid::new_v4().to_string();
    conn.execute(
        "
        INSERT INTO mcp_calls (call_id, server_id, tool, success, latency_ms, error, created_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ",
        params![call_id, server_id, tool, error.is_none(), latency_ms, error, now],
    )?;
    conn.execute(
        "
        UPDATE mcp_servers
        SET call_count = call_count + 1,
            error_count = error_count + ?2,
            total_latency_ms = total_latency_ms + ?3,
            last_error = COALESCE(?4, last_error),
            last_called_at_ms = ?5
        WHERE server_id = ?1
        ",
        params![server_id, i64::from(error.is_some()), latency_ms, error, now],
    )?;
    Ok(call_id)
}

fn load_server(
    conn: &Connection,
    workspace_id: &str,
    server_id: &str,
) -> Result<McpServerRecord, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SERVER_COLUMNS} FROM mcp_servers WHERE server_id = ?1 AND workspace_id = ?2"
    ))?;
    let mut rows = stmt.query(params![server_id, workspace_id])?;
    match rows.next()? {
        Some(row) => Ok(map_server_row(row)?),
        None => Err(ApiError::not_found("mcp server not found")),
    }
}

fn fetch_server_by_name(
    conn: &Connection,
    workspace_id: &str,
    name: &str,
) -> Result<Option<McpServerRecord>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SERVER_COLUMNS} FROM mcp_servers WHERE workspace_id = ?1 AND name = ?2"
    ))?;
    let mut rows = stmt.query(params![workspace_id, name])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(map_server_row(row)?));
    }
    Ok(None)
}

pub(crate) fn query_servers(
    conn: &Connection,
    workspace_id: Option<&str>,
) -> Result<Vec<McpServerRecord>, ApiError> {
    let mut stmt = conn.prepare(&format!(
        "
        SELECT {SERVER_COLUMNS}
        FROM mcp_servers
        WHERE (?1 IS NULL OR workspace_id = ?1)
        ORDER BY workspace_id, name
        "
    ))?;
    let rows = stmt.query_map(params![workspace_id], map_server_row)?;
    Ok(rows.filter_map(Result::ok).collect())
}

fn map_server_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<McpServerRecord> {
    Ok(McpServerRecord {
        server_id: row.get(0)?,
        workspace_id: row.get(1)?,
        name: row.get(2)?,
        transport: McpTransport::from_db(&row.get::<_, String>(3)?),
        endpoint: row.get(4)?,
        enabled: row.get(5)?,
        call_count: row.get::<_, i64>(6)? as u64,
        error_count: row.get::<_, i64>(7)? as u64,
        total_latency_ms: row.get::<_, i64>(8)? as u64,
        last_error: row.get(9)?,
        last_called_at_ms: db::opt_ms(row.get(10)?),
        created_at_ms: row.get::<_, i64>(11)? as u64,
        updated_at_ms: row.get::<_, i64>(12)? as u64,
    })
}
