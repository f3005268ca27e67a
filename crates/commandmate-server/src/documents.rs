use axum::{
    Json,
    extract::{Path, Query, State},
};
use commandmate_core::{DocumentId, now_ms};
use commandmate_protocol::{CreateDocumentRequest, DEFAULT_WORKSPACE, DocumentRecord};
use rusqlite::{Connection, params};
use serde::Deserialize;
use tracing::info;

use crate::{
    AppState,
    error::{ApiError, require},
    extract::ApiJson,
};

const DOCUMENT_COLUMNS: &str =
    "document_id, workspace_id, title, content, tags, created_at_ms, updated_at_ms";

#[derive(Debug, Default, Deserialize)]
pub struct DocumentQuery {
    pub workspace_id: Option<String>,
    /// Case-insensitive substring over title and content.
    pub q: Option<String>,
}

pub async fn create_document(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<CreateDocumentRequest>,
) -> Result<Json<DocumentRecord>, ApiError> {
    require(&request.title, "title")?;

    let document_id = DocumentId::new().to_string();
    let workspace_id = request
        .workspace_id
        .filter(|ws| !ws.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_WORKSPACE.to_string());
    let tags = serde_json::to_string(&request.tags)
        .map_err(|err| ApiError::internal(format!("failed to encode tags: {err}")))?;
    let now = now_ms();

    let db = state.db.lock().await;
    db.execute(
        "
        INSERT INTO documents (document_id, workspace_id, title, content, tags, created_at_ms, updated_at_ms)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
        ",
        params![document_id, workspace_id, request.title, request.content, tags, now],
    )?;
    let document = fetch_document(&db, &document_id)?
        .ok_or_else(|| ApiError::internal("failed to reload document after creation"))?;
    info!(document_id = %document.document_id, workspace_id = %document.workspace_id, "document stored");
    Ok(Json(document))
}

pub async fn list_documents(
    State(state): State<AppState>,
    Query(query): Query<DocumentQuery>,
) -> Result<Json<Vec<DocumentRecord>>, ApiError> {
    let pattern = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(|q| format!("%{}%", escape_like(&q.to_lowercase())));

    let db = state.db.lock().await;
    let mut stmt = db.prepare(&format!(
        "
        SELECT {DOCUMENT_COLUMNS}
        FROM documents
        WHERE (?1 IS NULL OR workspace_id = ?1)
          AND (?2 IS NULL OR lower(title) LIKE ?2 ESCAPE '\\' OR lower(content) LIKE ?2 ESCAPE '\\')
        ORDER BY updated_at_ms DESC, rowid DESC
        "
    ))?;
    let rows = stmt.query_map(params![query.workspace_id, pattern], map_document_row)?;
    Ok(Json(rows.filter_map(Result::ok).collect()))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Result<Json<DocumentRecord>, ApiError> {
    let db = state.db.lock().await;
    let document = fetch_document(&db, &document_id)?
        .ok_or_else(|| ApiError::not_found("document not found"))?;
    Ok(Json(document))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let db = state.db.lock().await;
    let deleted =
        db.execute("DELETE FROM documents WHERE document_id = ?1", params![document_id])?;
    if deleted == 0 {
        return Err(ApiError::not_found("document not found"));
    }
    Ok(Json(serde_json::json!({ "ok": true, "document_id": document_id })))
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn fetch_document(
    conn: &Connection,
    document_id: &str,
) -> Result<Option<DocumentRecord>, ApiError> {
    let mut stmt = conn
        .prepare(&format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE document_id = ?1"))?;
    let mut rows = stmt.query(params![document_id])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(map_document_row(row)?));
    }
    Ok(None)
}

fn map_document_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentRecord> {
    let tags: String = row.get(4)?;
    Ok(DocumentRecord {
        document_id: row.get(0)?,
        workspace_id: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        created_at_ms: row.get::<_, i64>(5)? as u64,
        updated_at_ms: row.get::<_, i64>(6)? as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::escape_like;
    use crate::test_support::*;
    use reqwest::StatusCode;
    use serde_json::json;

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
    }

    #[tokio::test]
    async fn documents_can_be_searched_and_deleted() {
        let server = spawn().await;
        let (status, runbook) = server
            .post(
                "/v1/documents",
                &json!({ "title": "Deploy Runbook", "content": "roll back with care", "tags": ["ops"] }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(runbook["tags"], json!(["ops"]));
        server
            .post(
                "/v1/documents",
                &json!({ "title": "Style guide", "content": "Prefer short sentences", "workspace_id": "docs" }),
            )
            .await;

        let (_, hits) = server.get("/v1/documents?q=RUNBOOK").await;
        assert_eq!(hits.as_array().expect("array").len(), 1);

        let (_, hits) = server.get("/v1/documents?q=short").await;
        assert_eq!(hits[0]["title"], "Style guide");

        let (_, scoped) = server.get("/v1/documents?workspace_id=docs").await;
        assert_eq!(scoped.as_array().expect("array").len(), 1);

        let (_, none) = server.get("/v1/documents?q=100%25").await;
        assert!(none.as_array().expect("array").is_empty());

        let id = runbook["document_id"].as_str().expect("id");
        let (status, _) = server.delete(&format!("/v1/documents/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = server.get(&format!("/v1/documents/{id}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = server.delete(&format!("/v1/documents/{id}")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn document_requires_title_and_content() {
        let server = spawn().await;
        let (status, _) = server.post("/v1/documents", &json!({ "title": "x" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) =
            server.post("/v1/documents", &json!({ "title": " ", "content": "x" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
