use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use commandmate_core::{
    TaskId, TaskPriority, TaskStatus, Verdict, completion_status, now_ms, rejection_status,
};
use commandmate_protocol::{
    ApproveTaskRequest, ClaimNextRequest, ClaimTaskRequest, CompleteTaskRequest,
    CreateTaskRequest, DEFAULT_WORKSPACE, Envelope, EventKind, ProgressRequest,
    RejectTaskRequest, TaskRecord,
    events::{TaskClaimed, TaskProgress, TaskQueued, TaskReviewed, TaskSubmitted},
};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    AppState, agents, db,
    error::{ApiError, require},
    extract::ApiJson,
    profiles,
};

const TASK_COLUMNS: &str = "
    task_id, workspace_id, title, description, priority, status, requires_approval,
    agent_profile, assigned_agent_id, progress_percent, progress_message, result, error,
    review_feedback, reviewed_by, attempts, created_at_ms, updated_at_ms, claimed_at_ms,
    completed_at_ms
";

#[derive(Debug, Default, Deserialize)]
pub struct TaskListQuery {
    pub status: Option<String>,
    pub workspace_id: Option<String>,
    pub agent_id: Option<String>,
}

pub async fn create_task(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateTaskRequest>,
) -> Result<Json<TaskRecord>, ApiError> {
    require(&request.title, "title")?;

    let workspace_id = request
        .workspace_id
        .filter(|ws| !ws.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string());
    let priority = request.priority.unwrap_or_default();
    let requires_approval =
        request.requires_approval.unwrap_or(state.config.approval.require_by_default);
    let task_id = TaskId::new().to_string();
    let now = now_ms();

    let db = state.db.lock().await;

    if let Some(profile) = &request.agent_profile
        && profiles::fetch_profile(&db, profile)?.is_none()
    {
        return Err(ApiError::not_found("agent_profile not found"));
    }

    db.execute(
        "
        INSERT INTO tasks (
          task_id, workspace_id, title, description, priority, priority_rank, status,
          requires_approval, agent_profile, created_at_ms, updated_at_ms
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
        ",
        params![
            task_id,
            workspace_id,
            request.title,
            request.description,
            priority.as_str(),
            priority.rank(),
            TaskStatus::Queued.as_str(),
            requires_approval,
            request.agent_profile,
            now
        ],
    )?;

    let task = fetch_task(&db, &task_id)?
        .ok_or_else(|| ApiError::internal("failed to reload task after creation"))?;
    drop(db);

    info!(
        task_id = %task.task_id,
        workspace_id = %task.workspace_id,
        priority = priority.as_str(),
        "task queued"
    );
    state.events.publish(Envelope::for_task(
        EventKind::TaskQueued(TaskQueued { title: task.title.clone(), priority }),
        &task.workspace_id,
        &task.task_id,
    ));
    Ok(Json(task))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(filter): Query<TaskListQuery>,
) -> Result<Json<Vec<TaskRecord>>, ApiError> {
    let status = match filter.status.as_deref() {
        Some(raw) => Some(
            TaskStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("unknown status: {raw}")))?,
        ),
        None => None,
    };

    let db = state.db.lock().await;
    Ok(Json(query_tasks(
        &db,
        status,
        filter.workspace_id.as_deref(),
        filter.agent_id.as_deref(),
    )?))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
    let db = state.db.lock().await;
    let task = fetch_task(&db, &task_id)?.ok_or_else(|| ApiError::not_found("task not found"))?;
    Ok(Json(task))
}

pub async fn claim_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    ApiJson(request): ApiJson<ClaimTaskRequest>,
) -> Result<Json<TaskRecord>, ApiError> {
    require(&request.agent_id, "agent_id")?;
    let now = now_ms();

    let mut db = state.db.lock().await;
    ensure_agent(&db, &request.agent_id)?;

    let tx = db.transaction()?;
    let changed = tx.execute(
        "
        UPDATE tasks
        SET status = 'in_progress',
            assigned_agent_id = ?2,
            progress_percent = 0,
            progress_message = NULL,
            attempts = attempts + 1,
            claimed_at_ms = ?3,
            updated_at_ms = ?3
        WHERE task_id = ?1 AND status = 'queued'
        ",
        params![task_id, request.agent_id, now],
    )?;
    if changed == 0 {
        return Err(explain_missed_update(&tx, &task_id, None, TaskStatus::Queued)?);
    }
    agents::mark_busy(&tx, &request.agent_id, &task_id, now)?;
    let task = fetch_task(&tx, &task_id)?
        .ok_or_else(|| ApiError::internal("failed to reload task after claim"))?;
    tx.commit()?;
    drop(db);

    publish_claimed(&state, &task, &request.agent_id);
    Ok(Json(task))
}

/// Claims the highest-priority, oldest queued task in one conditional update.
pub async fn claim_next(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ClaimNextRequest>,
) -> Result<Response, ApiError> {
    require(&request.agent_id, "agent_id")?;
    let now = now_ms();

    let mut db = state.db.lock().await;
    ensure_agent(&db, &request.agent_id)?;

    let tx = db.transaction()?;
    let claimed: Option<String> = tx
        .query_row(
            "
            UPDATE tasks
            SET status = 'in_progress',
                assigned_agent_id = ?1,
                progress_percent = 0,
                progress_message = NULL,
                attempts = attempts + 1,
                claimed_at_ms = ?2,
                updated_at_ms = ?2
            WHERE task_id = (
                SELECT task_id FROM tasks
                WHERE status = 'queued' AND (?3 IS NULL OR workspace_id = ?3)
                ORDER BY priority_rank DESC, created_at_ms ASC, rowid ASC
                LIMIT 1
              )
              AND status = 'queued'
            RETURNING task_id
            ",
            params![request.agent_id, now, request.workspace_id],
            |row| row.get(0),
        )
        .optional()?;

    let Some(task_id) = claimed else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    agents::mark_busy(&tx, &request.agent_id, &task_id, now)?;
    let task = fetch_task(&tx, &task_id)?
        .ok_or_else(|| ApiError::internal("failed to reload task after claim"))?;
    tx.commit()?;
    drop(db);

    publish_claimed(&state, &task, &request.agent_id);
    Ok(Json(task).into_response())
}

pub async fn report_progress(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    ApiJson(request): ApiJson<ProgressRequest>,
) -> Result<Json<TaskRecord>, ApiError> {
    require(&request.agent_id, "agent_id")?;
    let percent = match request.percent {
        Some(p) if p > 100 => {
            return Err(ApiError::bad_request("percent must be between 0 and 100"));
        }
        Some(p) => Some(p as u8),
        None => None,
    };
    let now = now_ms();

    let db = state.db.lock().await;
    let changed = db.execute(
        "
        UPDATE tasks
        SET progress_percent = COALESCE(?3, progress_percent),
            progress_message = COALESCE(?4, progress_message),
            updated_at_ms = ?5
        WHERE task_id = ?1 AND status = 'in_progress' AND assigned_agent_id = ?2
        ",
        params![task_id, request.agent_id, percent, request.message, now],
    )?;
    if changed == 0 {
        return Err(explain_missed_update(
            &db,
            &task_id,
            Some(&request.agent_id),
            TaskStatus::InProgress,
        )?);
    }
    agents::touch_heartbeat(&db, &request.agent_id, now)?;
    let task = fetch_task(&db, &task_id)?
        .ok_or_else(|| ApiError::internal("failed to reload task after progress"))?;
    drop(db);

    state.events.publish(Envelope::for_task(
        EventKind::TaskProgress(TaskProgress {
            agent_id: request.agent_id,
            percent: task.progress_percent,
            message: task.progress_message.clone(),
        }),
        &task.workspace_id,
        &task.task_id,
    ));
    Ok(Json(task))
}

pub async fn complete_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    ApiJson(request): ApiJson<CompleteTaskRequest>,
) -> Result<Json<TaskRecord>, ApiError> {
    require(&request.agent_id, "agent_id")?;
    let now = now_ms();

    let mut db = state.db.lock().await;
    let existing =
        fetch_task(&db, &task_id)?.ok_or_else(|| ApiError::not_found("task not found"))?;

    let profile_requires_approval = match credited_profile(&db, &existing)? {
        Some(name) => profiles::fetch_profile(&db, &name)?.is_some_and(|p| p.approval_required),
        None => false,
    };
    let status =
        completion_status(request.success, existing.requires_approval || profile_requires_approval);
    let result = request.result.as_ref().map(serde_json::Value::to_string);
    let completed_at = status.is_terminal().then_some(now);

    let tx = db.transaction()?;
    let changed = tx.execute(
        "
        UPDATE tasks
        SET status = ?3,
            result = ?4,
            error = ?5,
            progress_percent = CASE WHEN ?6 THEN 100 ELSE progress_percent END,
            completed_at_ms = ?7,
            updated_at_ms = ?8
        WHERE task_id = ?1 AND status = 'in_progress' AND assigned_agent_id = ?2
        ",
        params![
            task_id,
            request.agent_id,
            status.as_str(),
            result,
            request.error,
            request.success,
            completed_at,
            now
        ],
    )?;
    if changed == 0 {
        return Err(explain_missed_update(
            &tx,
            &task_id,
            Some(&request.agent_id),
            TaskStatus::InProgress,
        )?);
    }
    agents::mark_idle(&tx, &request.agent_id, now)?;
    let task = fetch_task(&tx, &task_id)?
        .ok_or_else(|| ApiError::internal("failed to reload task after completion"))?;
    tx.commit()?;
    drop(db);

    if status == TaskStatus::Failed {
        warn!(task_id = %task.task_id, agent_id = %request.agent_id, error = ?task.error, "task failed");
    } else {
        info!(task_id = %task.task_id, agent_id = %request.agent_id, status = %status, "task submitted");
    }
    state.events.publish(Envelope::for_task(
        EventKind::TaskSubmitted(TaskSubmitted { agent_id: request.agent_id, status }),
        &task.workspace_id,
        &task.task_id,
    ));
    Ok(Json(task))
}

pub async fn approve_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    ApiJson(request): ApiJson<ApproveTaskRequest>,
) -> Result<Json<TaskRecord>, ApiError> {
    let now = now_ms();

    let mut db = state.db.lock().await;
    let tx = db.transaction()?;
    let profile = match fetch_task(&tx, &task_id)? {
        Some(existing) => credited_profile(&tx, &existing)?,
        None => None,
    };
    let changed = tx.execute(
        "
        UPDATE tasks
        SET status = 'completed',
            review_feedback = ?2,
            reviewed_by = ?3,
            completed_at_ms = ?4,
            updated_at_ms = ?4
        WHERE task_id = ?1 AND status = 'pending_approval'
        ",
        params![task_id, request.comment, request.reviewer, now],
    )?;
    if changed == 0 {
        return Err(explain_missed_update(&tx, &task_id, None, TaskStatus::PendingApproval)?);
    }
    let task = fetch_task(&tx, &task_id)?
        .ok_or_else(|| ApiError::internal("failed to reload task after approval"))?;
    if let Some(profile) = &profile {
        profiles::record_feedback(
            &tx,
            profile,
            &task.task_id,
            Verdict::Approved,
            request.comment.as_deref(),
            request.reviewer.as_deref(),
            now,
        )?;
    }
    tx.commit()?;
    drop(db);

    info!(task_id = %task.task_id, reviewer = ?request.reviewer, "task approved");
    publish_reviewed(&state, &task, Verdict::Approved, request.reviewer);
    Ok(Json(task))
}

pub async fn reject_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    ApiJson(request): ApiJson<RejectTaskRequest>,
) -> Result<Json<TaskRecord>, ApiError> {
    require(&request.reason, "reason")?;
    let next_status = rejection_status(request.requeue.unwrap_or(true));
    let now = now_ms();

    let mut db = state.db.lock().await;
    let tx = db.transaction()?;
    let profile = match fetch_task(&tx, &task_id)? {
        Some(existing) => credited_profile(&tx, &existing)?,
        None => None,
    };
    let changed = if next_status == TaskStatus::Queued {
        tx.execute(
            "
            UPDATE tasks
            SET status = 'queued',
                assigned_agent_id = NULL,
                progress_percent = 0,
                progress_message = NULL,
                claimed_at_ms = NULL,
                review_feedback = ?2,
                reviewed_by = ?3,
                updated_at_ms = ?4
            WHERE task_id = ?1 AND status = 'pending_approval'
            ",
            params![task_id, request.reason, request.reviewer, now],
        )?
    } else {
        tx.execute(
            "
            UPDATE tasks
            SET status = 'failed',
                error = ?2,
                review_feedback = ?2,
                reviewed_by = ?3,
                completed_at_ms = ?4,
                updated_at_ms = ?4
            WHERE task_id = ?1 AND status = 'pending_approval'
            ",
            params![task_id, request.reason, request.reviewer, now],
        )?
    };
    if changed == 0 {
        return Err(explain_missed_update(&tx, &task_id, None, TaskStatus::PendingApproval)?);
    }
    let task = fetch_task(&tx, &task_id)?
        .ok_or_else(|| ApiError::internal("failed to reload task after rejection"))?;
    if let Some(profile) = &profile {
        profiles::record_feedback(
            &tx,
            profile,
            &task.task_id,
            Verdict::Rejected,
            Some(&request.reason),
            request.reviewer.as_deref(),
            now,
        )?;
    }
    tx.commit()?;
    drop(db);

    info!(task_id = %task.task_id, status = %task.status, reason = %request.reason, "task rejected");
    publish_reviewed(&state, &task, Verdict::Rejected, request.reviewer);
    if task.status == TaskStatus::Queued {
        state.events.publish(Envelope::for_task(
            EventKind::TaskQueued(TaskQueued { title: task.title.clone(), priority: task.priority }),
            &task.workspace_id,
            &task.task_id,
        ));
    }
    Ok(Json(task))
}

pub async fn retry_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
    let now = now_ms();

    let db = state.db.lock().await;
    let changed = db.execute(
        "
        UPDATE tasks
        SET status = 'queued',
            assigned_agent_id = NULL,
            progress_percent = 0,
            progress_message = NULL,
            error = NULL,
            claimed_at_ms = NULL,
            completed_at_ms = NULL,
            updated_at_ms = ?2
        WHERE task_id = ?1 AND status = 'failed'
        ",
        params![task_id, now],
    )?;
    if changed == 0 {
        return Err(explain_missed_update(&db, &task_id, None, TaskStatus::Failed)?);
    }
    let task = fetch_task(&db, &task_id)?
        .ok_or_else(|| ApiError::internal("failed to reload task after retry"))?;
    drop(db);

    info!(task_id = %task.task_id, "task requeued");
    state.events.publish(Envelope::for_task(
        EventKind::TaskQueued(TaskQueued { title: task.title.clone(), priority: task.priority }),
        &task.workspace_id,
        &task.task_id,
    ));
    Ok(Json(task))
}

fn publish_claimed(state: &AppState, task: &TaskRecord, agent_id: &str) {
    info!(task_id = %task.task_id, agent_id = %agent_id, attempt = task.attempts, "task claimed");
    state.events.publish(Envelope::for_task(
        EventKind::TaskClaimed(TaskClaimed { agent_id: agent_id.to_string() }),
        &task.workspace_id,
        &task.task_id,
    ));
}

fn publish_reviewed(state: &AppState, task: &TaskRecord, verdict: Verdict, reviewer: Option<String>) {
    state.events.publish(Envelope::for_task(
        EventKind::TaskReviewed(TaskReviewed { verdict, status: task.status, reviewer }),
        &task.workspace_id,
        &task.task_id,
    ));
}

fn ensure_agent(conn: &Connection, agent_id: &str) -> Result<(), ApiError> {
    if agents::fetch_agent(conn, agent_id)?.is_none() {
        return Err(ApiError::not_found("agent_id is not registered"));
    }
    Ok(())
}

/// Works out why a conditional update touched no rows.
fn explain_missed_update(
    conn: &Connection,
    task_id: &str,
    agent_id: Option<&str>,
    expected: TaskStatus,
) -> Result<ApiError, ApiError> {
    let Some(task) = fetch_task(conn, task_id)? else {
        return Ok(ApiError::not_found("task not found"));
    };
    if task.status != expected {
        return Ok(ApiError::conflict(format!("task is {}, expected {expected}", task.status)));
    }
    match agent_id {
        Some(agent_id) if task.assigned_agent_id.as_deref() != Some(agent_id) => {
            Ok(ApiError::forbidden("task is assigned to another agent"))
        }
        _ => Ok(ApiError::conflict("task changed concurrently")),
    }
}

/// Profile credited with a task's work: the task's own `agent_profile`, else the
/// profile the assigned agent registered with.
pub(crate) fn credited_profile(
    conn: &Connection,
    task: &TaskRecord,
) -> Result<Option<String>, ApiError> {
    if let Some(profile) = &task.agent_profile {
        return Ok(Some(profile.clone()));
    }
    let Some(agent_id) = &task.assigned_agent_id else {
        return Ok(None);
    };
    Ok(agents::fetch_agent(conn, agent_id)?.and_then(|agent| agent.profile))
}

pub(crate) fn fetch_task(conn: &Connection, task_id: &str) -> Result<Option<TaskRecord>, ApiError> {
    let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_id = ?1"))?;
    let mut rows = stmt.query(params![task_id])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(map_task_row(row)?));
    }
    Ok(None)
}

pub(crate) fn query_tasks(
    conn: &Connection,
    status: Option<TaskStatus>,
    workspace_id: Option<&str>,
    agent_id: Option<&str>,
) -> Result<Vec<TaskRecord>, ApiError> {
    let mut clauses = Vec::new();
    let mut values = Vec::new();
    if let Some(status) = status {
        values.push(status.as_str().to_string());
        clauses.push(format!("status = ?{}", values.len()));
    }
    if let Some(workspace_id) = workspace_id {
        values.push(workspace_id.to_string());
        clauses.push(format!("workspace_id = ?{}", values.len()));
    }
    if let Some(agent_id) = agent_id {
        values.push(agent_id.to_string());
        clauses.push(format!("assigned_agent_id = ?{}", values.len()));
    }
    let where_clause =
        if clauses.is_empty() { String::new() } else { format!("WHERE {}", clauses.join(" AND ")) };

    let mut stmt = conn.prepare(&format!(
        "
        SELECT {TASK_COLUMNS}
        FROM tasks
        {where_clause}
        ORDER BY priority_rank DESC, created_at_ms ASC, rowid ASC
        "
    ))?;
    let rows = stmt.query_map(params_from_iter(values.iter()), map_task_row)?;
    Ok(rows.filter_map(Result::ok).collect())
}

fn map_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        task_id: row.get(0)?,
        workspace_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        priority: TaskPriority::from_db(&row.get::<_, String>(4)?),
        status: TaskStatus::from_db(&row.get::<_, String>(5)?),
        requires_approval: row.get(6)?,
        agent_profile: row.get(7)?,
        assigned_agent_id: row.get(8)?,
        progress_percent: row.get::<_, i64>(9)?.clamp(0, 100) as u8,
        progress_message: row.get(10)?,
        result: db::parse_json_column(row.get(11)?),
        error: row.get(12)?,
        review_feedback: row.get(13)?,
        reviewed_by: row.get(14)?,
        attempts: row.get::<_, i64>(15)? as u32,
        created_at_ms: row.get::<_, i64>(16)? as u64,
        updated_at_ms: row.get::<_, i64>(17)? as u64,
        claimed_at_ms: db::opt_ms(row.get(18)?),
        completed_at_ms: db::opt_ms(row.get(19)?),
    })
}
