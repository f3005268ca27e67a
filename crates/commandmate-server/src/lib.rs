//! CommandMate control plane: task queue, approval workflow, agent profiles
//! and the per-workspace MCP server registry.

pub mod agents;
mod auth;
pub mod config;
pub mod db;
pub mod documents;
pub mod error;
pub mod events;
mod extract;
pub mod mcp;
mod mcp_client;
pub mod profiles;
pub mod status;
pub mod tasks;

use anyhow::Result;
use axum::{
    Json, Router, middleware,
    routing::{get, post},
};
use rusqlite::Connection;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::{config::ServerConfig, events::EventHub, mcp_client::ToolRegistry};

#[derive(Clone)]
pub struct AppState {
    db: Arc<Mutex<Connection>>,
    config: Arc<ServerConfig>,
    events: EventHub,
    tools: ToolRegistry,
    http: reqwest::Client,
}

impl AppState {
    pub fn new(connection: Connection, config: ServerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.mcp.call_timeout_ms))
            .build()?;
        Ok(Self {
            db: Arc::new(Mutex::new(connection)),
            config: Arc::new(config),
            events: EventHub::new(),
            tools: ToolRegistry::default(),
            http,
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/v1/agents", get(agents::list_agents))
        .route("/v1/agents/register", post(agents::register_agent))
        .route("/v1/agents/{agent_id}/heartbeat", post(agents::heartbeat))
        .route("/v1/tasks", post(tasks::create_task).get(tasks::list_tasks))
        .route("/v1/tasks/claim-next", post(tasks::claim_next))
        .route("/v1/tasks/{task_id}", get(tasks::get_task))
        .route("/v1/tasks/{task_id}/claim", post(tasks::claim_task))
        .route("/v1/tasks/{task_id}/progress", post(tasks::report_progress))
        .route("/v1/tasks/{task_id}/complete", post(tasks::complete_task))
        .route("/v1/tasks/{task_id}/approve", post(tasks::approve_task))
        .route("/v1/tasks/{task_id}/reject", post(tasks::reject_task))
        .route("/v1/tasks/{task_id}/retry", post(tasks::retry_task))
        .route("/v1/profiles", get(profiles::list_profiles))
        .route("/v1/profiles/{name}", get(profiles::get_profile).put(profiles::upsert_profile))
        .route("/v1/profiles/{name}/learning", get(profiles::get_learning))
        .route("/v1/documents", post(documents::create_document).get(documents::list_documents))
        .route(
            "/v1/documents/{document_id}",
            get(documents::get_document).delete(documents::delete_document),
        )
        .route(
            "/v1/workspaces/{workspace_id}/mcp/servers",
            post(mcp::register_server).get(mcp::list_servers),
        )
        .route(
            "/v1/workspaces/{workspace_id}/mcp/servers/{server_id}",
            get(mcp::get_server).delete(mcp::delete_server),
        )
        .route(
            "/v1/workspaces/{workspace_id}/mcp/servers/{server_id}/enabled",
            post(mcp::set_enabled),
        )
        .route("/v1/workspaces/{workspace_id}/mcp/servers/{server_id}/tools", get(mcp::list_tools))
        .route("/v1/workspaces/{workspace_id}/mcp/servers/{server_id}/call", post(mcp::call_tool))
        .route(
            "/v1/workspaces/{workspace_id}/mcp/servers/{server_id}/metrics",
            get(mcp::server_metrics),
        )
        .route("/v1/status", get(status::get_status))
        .route("/v1/events", get(events::event_feed))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .route("/healthz", get(healthz))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(config: ServerConfig) -> Result<()> {
    let connection = db::open(&config.db_path)?;
    let port = config.port;
    let db_path = config.db_path.clone();
    let state = AppState::new(connection, config)?;
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("commandmate listening on http://{}", addr);
    info!("sqlite database at {}", db_path.display());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use reqwest::StatusCode;
    use serde::Serialize;
    use serde_json::Value;

    pub(crate) struct TestServer {
        pub base_url: String,
        pub http: reqwest::Client,
    }

    impl TestServer {
        pub(crate) fn url(&self, path: &str) -> String {
            format!("{}{path}", self.base_url)
        }

        pub(crate) fn client(&self) -> commandmate_protocol::ApiClient {
            commandmate_protocol::ApiClient::new(self.base_url.clone(), None)
        }

        pub(crate) async fn post(&self, path: &str, body: &impl Serialize) -> (StatusCode, Value) {
            let response =
                self.http.post(self.url(path)).json(body).send().await.expect("send request");
            read(response).await
        }

        pub(crate) async fn put(&self, path: &str, body: &impl Serialize) -> (StatusCode, Value) {
            let response =
                self.http.put(self.url(path)).json(body).send().await.expect("send request");
            read(response).await
        }

        pub(crate) async fn get(&self, path: &str) -> (StatusCode, Value) {
            let response = self.http.get(self.url(path)).send().await.expect("send request");
            read(response).await
        }

        pub(crate) async fn delete(&self, path: &str) -> (StatusCode, Value) {
            let response = self.http.delete(self.url(path)).send().await.expect("send request");
            read(response).await
        }
    }

    async fn read(response: reqwest::Response) -> (StatusCode, Value) {
        let status = response.status();
        let text = response.text().await.expect("read body");
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        (status, body)
    }

    pub(crate) async fn spawn() -> TestServer {
        spawn_with(ServerConfig::default()).await
    }

    pub(crate) async fn spawn_with(config: ServerConfig) -> TestServer {
        let connection = db::open_in_memory().expect("open in-memory db");
        let state = AppState::new(connection, config).expect("build state");
        let app = build_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        TestServer { base_url: format!("http://{addr}"), http: reqwest::Client::new() }
    }

    /// Binds `app` on an ephemeral port and returns its base URL.
    pub(crate) async fn spawn_stub(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
        let addr = listener.local_addr().expect("stub addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }
}
