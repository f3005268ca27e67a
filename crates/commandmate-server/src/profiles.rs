use axum::{
    Json,
    extract::{Path, State},
};
use commandmate_core::{FeedbackEntry, LearningSummary, Verdict, now_ms};
use commandmate_protocol::{ProfileDetail, ProfileLearning, ProfileRecord, UpsertProfileRequest};
use rusqlite::{Connection, params};
use tracing::info;
use uuid::Uuid;

use crate::{
    AppState,
    error::{ApiError, require},
    extract::ApiJson,
};

/// Feedback entries returned alongside a profile.
const RECENT_FEEDBACK: usize = 20;

const PROFILE_COLUMNS: &str = "
    name, description, model, system_prompt, approval_required, config,
    approved_count, rejected_count, created_at_ms, updated_at_ms
";

pub async fn upsert_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
    ApiJson(request): ApiJson<UpsertProfileRequest>,
) -> Result<Json<ProfileRecord>, ApiError> {
    require(&name, "name")?;
    if let Some(config) = &request.config
        && !config.is_object()
    {
        return Err(ApiError::bad_request("config must be a JSON object"));
    }

    let config = request.config.as_ref().map(serde_json::Value::to_string);
    let now = now_ms();

    let db = state.db.lock().await;
    db.execute(
        "
        INSERT INTO agent_profiles (
          name, description, model, system_prompt, approval_required, config,
          approved_count, rejected_count, created_at_ms, updated_at_ms
        ) VALUES (?1, ?2, ?3, ?4, COALESCE(?5, 0), COALESCE(?6, '{}'), 0, 0, ?7, ?7)
        ON CONFLICT(name) DO UPDATE SET
          description = COALESCE(?2, agent_profiles.description),
          model = COALESCE(?3, agent_profiles.model),
          system_prompt = COALESCE(?4, agent_profiles.system_prompt),
          approval_required = COALESCE(?5, agent_profiles.approval_required),
          config = COALESCE(?6, agent_profiles.config),
          updated_at_ms = ?7
        ",
        params![
            name,
            request.description,
            request.model,
            request.system_prompt,
            request.approval_required,
            config,
            now
        ],
    )?;

    let profile = fetch_profile(&db, &name)?
        .ok_or_else(|| ApiError::internal("failed to reload profile after upsert"))?;
    info!(profile = %profile.name, approval_required = profile.approval_required, "profile saved");
    Ok(Json(profile))
}

pub async fn list_profiles(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProfileRecord>>, ApiError> {
    let db = state.db.lock().await;
    let mut stmt =
        db.prepare(&format!("SELECT {PROFILE_COLUMNS} FROM agent_profiles ORDER BY name"))?;
    let rows = stmt.query_map([], map_profile_row)?;
    Ok(Json(rows.filter_map(Result::ok).collect()))
}

pub async fn get_profile(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProfileDetail>, ApiError> {
    let db = state.db.lock().await;
    let profile =
        fetch_profile(&db, &name)?.ok_or_else(|| ApiError::not_found("profile not found"))?;
    let feedback = query_feedback(&db, &name, Some(RECENT_FEEDBACK))?;
    Ok(Json(ProfileDetail { profile, feedback }))
}

pub async fn get_learning(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProfileLearning>, ApiError> {
    let db = state.db.lock().await;
    if fetch_profile(&db, &name)?.is_none() {
        return Err(ApiError::not_found("profile not found"));
    }
    let feedback = query_feedback(&db, &name, None)?;
    Ok(Json(ProfileLearning { profile: name, summary: LearningSummary::from_feedback(&feedback) }))
}

/// Appends a review verdict to the profile's history and bumps its counters.
pub(crate) fn record_feedback(
    conn: &Connection,
    profile: &str,
    task_id: &str,
    verdict: Verdict,
    comment: Option<&str>,
    reviewer: Option<&str>,
    now: u64,
) -> Result<(), ApiError> {
    conn.execute(
        "
        INSERT INTO agent_feedback (feedback_id, profile, task_id, verdict, comment, reviewer, created_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ",
        params![
            Uuid::new_v4().to_string(),
            profile,
            task_id,
            verdict.as_str(),
            comment,
            reviewer,
            now
        ],
    )?;

    let counter = match verdict {
        Verdict::Approved => "approved_count",
        Verdict::Rejected => "rejected_count",
    };
    conn.execute(
        &format!(
            "UPDATE agent_profiles SET {counter} = {counter} + 1, updated_at_ms = ?2 WHERE name = ?1"
        ),
        params![profile, now],
    )?;
    Ok(())
}

pub(crate) fn fetch_profile(
    conn: &Connection,
    name: &str,
) -> Result<Option<ProfileRecord>, ApiError> {
    let mut stmt =
        conn.prepare(&format!("SELECT {PROFILE_COLUMNS} FROM agent_profiles WHERE name = ?1"))?;
    let mut rows = stmt.query(params![name])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(map_profile_row(row)?));
    }
    Ok(None)
}

fn query_feedback(
    conn: &Connection,
    profile: &str,
    limit: Option<usize>,
) -> Result<Vec<FeedbackEntry>, ApiError> {
    let limit = limit.map_or(-1, |l| l as i64);
    let mut stmt = conn.prepare(
        "
        SELECT feedback_id, profile, task_id, verdict, comment, reviewer, created_at_ms
        FROM agent_feedback
        WHERE profile = ?1
        ORDER BY created_at_ms DESC, rowid DESC
        LIMIT ?2
        ",
    )?;
    let rows = stmt.query_map(params![profile, limit], |row| {
        Ok(FeedbackEntry {
            feedback_id: row.get(0)?,
            profile: row.get(1)?,
            task_id: row.get(2)?,
            verdict: Verdict::from_db(&row.get::<_, String>(3)?),
            comment: row.get(4)?,
            reviewer: row.get(5)?,
            created_at_ms: row.get::<_, i64>(6)? as u64,
        })
    })?;
    Ok(rows.filter_map(Result::ok).collect())
}

fn map_profile_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProfileRecord> {
    let config: String = row.get(5)?;
    Ok(ProfileRecord {
        name: row.get(0)?,
        description: row.get(1)?,
        model: row.get(2)?,
        system_prompt: row.get(3)?,
        approval_required: row.get(4)?,
        config: serde_json::from_str(&config).unwrap_or_else(|_| serde_json::json!({})),
        approved_count: row.get::<_, i64>(6)? as u64,
        rejected_count: row.get::<_, i64>(7)? as u64,
        created_at_ms: row.get::<_, i64>(8)? as u64,
        updated_at_ms: row.get::<_, i64>(9)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use crate::test_support::*;
    use reqwest::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn upsert_merges_partial_updates() {
        let server = spawn().await;
        let (status, created) = server
            .put(
                "/v1/profiles/researcher",
                &json!({
                    "description": "digs through papers",
                    "model": "large",
                    "config": { "temperature": 0.2 }
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["approval_required"], false);
        assert_eq!(created["config"]["temperature"], 0.2);

        let (status, updated) =
            server.put("/v1/profiles/researcher", &json!({ "approval_required": true })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["approval_required"], true);
        assert_eq!(updated["model"], "large");
        assert_eq!(updated["description"], "digs through papers");

        let (_, profiles) = server.get("/v1/profiles").await;
        assert_eq!(profiles.as_array().expect("array").len(), 1);
    }

    #[tokio::test]
    async fn config_must_be_an_object() {
        let server = spawn().await;
        let (status, _) = server.put("/v1/profiles/x", &json!({ "config": [1, 2] })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_profile_is_404() {
        let server = spawn().await;
        let (status, _) = server.get("/v1/profiles/ghost").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = server.get("/v1/profiles/ghost/learning").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn learning_is_empty_before_reviews() {
        let server = spawn().await;
        server.put("/v1/profiles/fresh", &json!({})).await;
        let (status, learning) = server.get("/v1/profiles/fresh/learning").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(learning["summary"]["total_reviews"], 0);
        assert_eq!(learning["summary"]["approval_rate"], serde_json::Value::Null);
    }
}
