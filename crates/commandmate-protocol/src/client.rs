use anyhow::{Context, Result, bail};
use reqwest::{RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::{
    AgentRecord, ApproveTaskRequest, ClaimNextRequest, ClaimTaskRequest, CompleteTaskRequest,
    CreateTaskRequest, ErrorBody, McpCallRequest, McpCallResponse, McpServerMetrics,
    McpServerRecord, McpToolList, ProfileLearning, ProfileRecord, ProgressRequest,
    RegisterAgentRequest, RegisterMcpServerRequest, RejectTaskRequest, StatusSnapshot,
    TaskRecord, UpsertProfileRequest,
};

/// Thin typed client over the CommandMate REST API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http: reqwest::Client::new(), base_url, token }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// WebSocket URL of the lifecycle event feed, carrying the token as a
    /// query parameter when one is set.
    pub fn events_url(&self) -> Result<String> {
        let mut url = Url::parse(&format!("{}/v1/events", self.base_url))
            .with_context(|| format!("invalid server url {}", self.base_url))?;
        let scheme = match url.scheme() {
            "https" => "wss",
            "http" => "ws",
            other => bail!("unsupported server url scheme {other}"),
        };
        if url.set_scheme(scheme).is_err() {
            bail!("cannot derive websocket url from {}", self.base_url);
        }
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url.into())
    }

    pub async fn register_agent(&self, request: &RegisterAgentRequest) -> Result<AgentRecord> {
        self.send(self.http.post(self.url("/v1/agents/register")).json(request)).await
    }

    pub async fn heartbeat(&self, agent_id: &str) -> Result<AgentRecord> {
        self.send(self.http.post(self.url(&format!("/v1/agents/{agent_id}/heartbeat")))).await
    }

    pub async fn create_task(&self, request: &CreateTaskRequest) -> Result<TaskRecord> {
        self.send(self.http.post(self.url("/v1/tasks")).json(request)).await
    }

    pub async fn list_tasks(&self, status: Option<&str>) -> Result<Vec<TaskRecord>> {
        let mut builder = self.http.get(self.url("/v1/tasks"));
        if let Some(status) = status {
            builder = builder.query(&[("status", status)]);
        }
        self.send(builder).await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<TaskRecord> {
        self.send(self.http.get(self.url(&format!("/v1/tasks/{task_id}")))).await
    }

    pub async fn claim(&self, task_id: &str, agent_id: &str) -> Result<TaskRecord> {
        let body = ClaimTaskRequest { agent_id: agent_id.to_string() };
        self.send(self.http.post(self.url(&format!("/v1/tasks/{task_id}/claim"))).json(&body))
            .await
    }

    /// Returns `None` when there is nothing queued.
    pub async fn claim_next(&self, request: &ClaimNextRequest) -> Result<Option<TaskRecord>> {
        let response =
            self.authorize(self.http.post(self.url("/v1/tasks/claim-next")).json(request))
                .send()
                .await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Self::decode(response).await.map(Some)
    }

    pub async fn progress(&self, task_id: &str, request: &ProgressRequest) -> Result<TaskRecord> {
        self.send(self.http.post(self.url(&format!("/v1/tasks/{task_id}/progress"))).json(request))
            .await
    }

    pub async fn complete(
        &self,
        task_id: &str,
        request: &CompleteTaskRequest,
    ) -> Result<TaskRecord> {
        self.send(self.http.post(self.url(&format!("/v1/tasks/{task_id}/complete"))).json(request))
            .await
    }

    pub async fn approve(&self, task_id: &str, request: &ApproveTaskRequest) -> Result<TaskRecord> {
        self.send(self.http.post(self.url(&format!("/v1/tasks/{task_id}/approve"))).json(request))
            .await
    }

    pub async fn reject(&self, task_id: &str, request: &RejectTaskRequest) -> Result<TaskRecord> {
        self.send(self.http.post(self.url(&format!("/v1/tasks/{task_id}/reject"))).json(request))
            .await
    }

    pub async fn retry(&self, task_id: &str) -> Result<TaskRecord> {
        self.send(self.http.post(self.url(&format!("/v1/tasks/{task_id}/retry")))).await
    }

    pub async fn upsert_profile(
        &self,
        name: &str,
        request: &UpsertProfileRequest,
    ) -> Result<ProfileRecord> {
        self.send(self.http.put(self.url(&format!("/v1/profiles/{name}"))).json(request)).await
    }

    pub async fn list_profiles(&self) -> Result<Vec<ProfileRecord>> {
        self.send(self.http.get(self.url("/v1/profiles"))).await
    }

    pub async fn learning(&self, profile: &str) -> Result<ProfileLearning> {
        self.send(self.http.get(self.url(&format!("/v1/profiles/{profile}/learning")))).await
    }

    pub async fn register_mcp_server(
        &self,
        workspace_id: &str,
        request: &RegisterMcpServerRequest,
    ) -> Result<McpServerRecord> {
        let path = format!("/v1/workspaces/{workspace_id}/mcp/servers");
        self.send(self.http.post(self.url(&path)).json(request)).await
    }

    pub async fn list_mcp_servers(&self, workspace_id: &str) -> Result<Vec<McpServerRecord>> {
        let path = format!("/v1/workspaces/{workspace_id}/mcp/servers");
        self.send(self.http.get(self.url(&path))).await
    }

    pub async fn mcp_tools(
        &self,
        workspace_id: &str,
        server_id: &str,
        refresh: bool,
    ) -> Result<McpToolList> {
        let path = format!("/v1/workspaces/{workspace_id}/mcp/servers/{server_id}/tools");
        let builder = self.http.get(self.url(&path)).query(&[("refresh", refresh)]);
        self.send(builder).await
    }

    pub async fn mcp_call(
        &self,
        workspace_id: &str,
        server_id: &str,
        request: &McpCallRequest,
    ) -> Result<McpCallResponse> {
        let path = format!("/v1/workspaces/{workspace_id}/mcp/servers/{server_id}/call");
        self.send(self.http.post(self.url(&path)).json(request)).await
    }

    pub async fn mcp_metrics(
        &self,
        workspace_id: &str,
        server_id: &str,
    ) -> Result<McpServerMetrics> {
        let path = format!("/v1/workspaces/{workspace_id}/mcp/servers/{server_id}/metrics");
        self.send(self.http.get(self.url(&path))).await
    }

    pub async fn status(&self) -> Result<StatusSnapshot> {
        self.send(self.http.get(self.url("/v1/status"))).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = self.authorize(builder).send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }
        let text = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => bail!("{status}: {}", body.error),
            Err(_) => bail!("{status}: {text}"),
        }
    }
}
