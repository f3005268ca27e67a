//! Outbound calls to MCP tool servers, plus the in-process tool list cache.

use commandmate_protocol::McpTool;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::RwLock;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Where a proxied call is sent.
#[derive(Debug, Clone, Copy)]
pub(crate) enum McpTarget<'a> {
    Direct { endpoint: &'a str },
    Gateway { base_url: &'a str, server: &'a str },
}

/// Tool lists keyed by server id. Lives as long as the process; never persisted.
#[derive(Clone, Default)]
pub(crate) struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Vec<McpTool>>>>,
}

impl ToolRegistry {
    pub(crate) async fn get(&self, server_id: &str) -> Option<Vec<McpTool>> {
        self.tools.read().await.get(server_id).cloned()
    }

    pub(crate) async fn insert(&self, server_id: &str, tools: Vec<McpTool>) {
        self.tools.write().await.insert(server_id.to_string(), tools);
    }

    pub(crate) async fn evict(&self, server_id: &str) {
        self.tools.write().await.remove(server_id);
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ToolListResult {
    #[serde(default)]
    tools: Vec<McpTool>,
}

pub(crate) async fn list_tools(
    http: &reqwest::Client,
    target: McpTarget<'_>,
) -> Result<Vec<McpTool>, String> {
    let raw = match target {
        McpTarget::Direct { endpoint } => rpc(http, endpoint, "tools/list", json!({})).await?,
        McpTarget::Gateway { base_url, server } => {
            let url = gateway_url(base_url, server, "tools")?;
            let response = http.get(url).send().await.map_err(describe)?;
            read_json(response).await?
        }
    };
    serde_json::from_value::<ToolListResult>(raw)
        .map(|list| list.tools)
        .map_err(|err| format!("malformed tool list: {err}"))
}

pub(crate) async fn call_tool(
    http: &reqwest::Client,
    target: McpTarget<'_>,
    tool: &str,
    arguments: Value,
) -> Result<Value, String> {
    match target {
        McpTarget::Direct { endpoint } => {
            let result =
                rpc(http, endpoint, "tools/call", json!({ "name": tool, "arguments": arguments }))
                    .await?;
            if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
                return Err(tool_error_text(&result));
            }
            Ok(result)
        }
        McpTarget::Gateway { base_url, server } => {
            let url = gateway_url(base_url, server, "call")?;
            let response = http
                .post(url)
                .json(&json!({ "tool": tool, "arguments": arguments }))
                .send()
                .await
                .map_err(describe)?;
            read_json(response).await
        }
    }
}

/// `{base}/servers/{server}/{action}` with the server name escaped as one path segment.
fn gateway_url(base_url: &str, server: &str, action: &str) -> Result<Url, String> {
    let mut url =
        Url::parse(base_url).map_err(|err| format!("invalid gateway url {base_url}: {err}"))?;
    url.path_segments_mut()
        .map_err(|()| format!("gateway url {base_url} cannot take a path"))?
        .pop_if_empty()
        .extend(["servers", server, action]);
    Ok(url)
}

async fn rpc(
    http: &reqwest::Client,
    endpoint: &str,
    method: &str,
    params: Value,
) -> Result<Value, String> {
    let request = JsonRpcRequest {
        jsonrpc: "2.0",
        id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
        method,
        params,
    };
    let response = http.post(endpoint).json(&request).send().await.map_err(describe)?;
    let body: JsonRpcResponse = serde_json::from_value(read_json(response).await?)
        .map_err(|err| format!("malformed JSON-RPC response: {err}"))?;

    if let Some(error) = body.error {
        return Err(format!("JSON-RPC error {}: {}", error.code, error.message));
    }
    body.result.ok_or_else(|| "JSON-RPC response has no result".to_string())
}

async fn read_json(response: reqwest::Response) -> Result<Value, String> {
    let status = response.status();
    if !status.is_success() {
        return Err(format!("upstream returned {status}"));
    }
    response.json::<Value>().await.map_err(|err| format!("invalid upstream body: {err}"))
}

fn describe(err: reqwest::Error) -> String {
    if err.is_timeout() {
        "upstream timed out".to_string()
    } else if err.is_connect() {
        format!("upstream unreachable: {err}")
    } else {
        format!("upstream request failed: {err}")
    }
}

/// Joins the text parts of an MCP `isError` result.
fn tool_error_text(result: &Value) -> String {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();
    if text.is_empty() { "tool reported an error".to_string() } else { text }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_error_text_joins_parts() {
        let result = json!({
            "isError": true,
            "content": [{ "type": "text", "text": "bad input" }, { "type": "text", "text": "retry" }]
        });
        assert_eq!(tool_error_text(&result), "bad input\nretry");
        assert_eq!(tool_error_text(&json!({ "isError": true })), "tool reported an error");
    }

    #[test]
    fn gateway_url_escapes_server_name() {
        let url = gateway_url("http://gw.local:9000/api/", "team/search?x#y", "call").expect("url");
        assert_eq!(url.as_str(), "http://gw.local:9000/api/servers/team%2Fsearch%3Fx%23y/call");

        let plain = gateway_url("http://gw.local:9000", "brave", "tools").expect("url");
        assert_eq!(plain.as_str(), "http://gw.local:9000/servers/brave/tools");

        assert!(gateway_url("not a url", "brave", "call").is_err());
    }

    #[tokio::test]
    async fn registry_evicts_entries() {
        let registry = ToolRegistry::default();
        let tool = McpTool { name: "echo".to_string(), description: None, input_schema: None };
        registry.insert("s-1", vec![tool.clone()]).await;
        assert_eq!(registry.get("s-1").await, Some(vec![tool]));
        registry.evict("s-1").await;
        assert_eq!(registry.get("s-1").await, None);
    }
}
