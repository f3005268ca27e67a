use axum::{
    extract::{Query, Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use tracing::debug;

use crate::{AppState, error::ApiError};

/// Bearer-token check for the `/v1` API. The event feed may pass the token as
/// `?token=` since browsers cannot set headers on a WebSocket upgrade.
pub(crate) async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let accepted = &state.config.auth.tokens;
    if accepted.is_empty() {
        return Ok(next.run(request).await);
    }

    let presented = bearer_token(&request).or_else(|| query_token(&request));
    match presented {
        Some(token) if accepted.iter().any(|candidate| candidate == &token) => {
            Ok(next.run(request).await)
        }
        Some(_) => {
            debug!(path = %request.uri().path(), "rejected invalid token");
            Err(ApiError::unauthorized("invalid token"))
        }
        None => Err(ApiError::unauthorized("missing bearer token")),
    }
}

fn bearer_token(request: &Request) -> Option<String> {
    let value = request.headers().get(AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(|token| token.trim().to_string())
}

fn query_token(request: &Request) -> Option<String> {
    let Query(mut params) =
        Query::<HashMap<String, String>>::try_from_uri(request.uri()).ok()?;
    params.remove("token")
}

#[cfg(test)]
mod tests {
    use crate::config::{AuthConfig, ServerConfig};
    use crate::test_support::*;
    use reqwest::StatusCode;

    #[tokio::test]
    async fn query_token_is_percent_decoded() {
        let config = ServerConfig {
            auth: AuthConfig { tokens: vec!["a&b c%".to_string()] },
            ..ServerConfig::default()
        };
        let server = spawn_with(config).await;

        let (status, _) = server.get("/v1/status?token=a%26b%20c%25").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = server.get("/v1/status?token=a&b").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn client_event_url_round_trips_awkward_tokens() {
        let config = ServerConfig {
            auth: AuthConfig { tokens: vec!["a&b#c".to_string()] },
            ..ServerConfig::default()
        };
        let server = spawn_with(config).await;
        let client =
            commandmate_protocol::ApiClient::new(server.base_url.clone(), Some("a&b#c".to_string()));
        let ws_url = client.events_url().expect("events url");
        let http_url = ws_url.replacen("ws://", "http://", 1).replace("/v1/events", "/v1/status");

        let response = server.http.get(http_url).send().await.expect("send");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
