//! HTTP Handlers

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use agent_core::{AgentError, Message, QueryRequest, ToolDescriptor};

use crate::state::AppState;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub provider: String,
    pub provider_connected: bool,
    pub tool_host_connected: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub limit: Option<i64>,
}

/// One entry of the durable message log
#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    pub created_at: String,
}

impl From<Message> for HistoryEntry {
    fn from(message: Message) -> Self {
        Self {
            role: message.role.as_str().to_string(),
            content: message.content,
            payload: message.payload,
            created_at: message.timestamp.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.into(),
        }),
    )
}

/// Map service errors onto HTTP statuses
fn error_response(e: &AgentError) -> ApiError {
    match e {
        AgentError::InvalidRequest(_) => {
            api_error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", e.user_message())
        }
        AgentError::Session(_) => {
            api_error(StatusCode::NOT_FOUND, "UNKNOWN_SESSION", e.user_message())
        }
        AgentError::ToolHost(_) => {
            api_error(StatusCode::BAD_GATEWAY, "TOOL_HOST_ERROR", e.user_message())
        }
        _ => {
            tracing::error!("Request failed: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", e.user_message())
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let provider = state.service.provider();
    let provider_connected = provider.health_check().await.unwrap_or(false);
    let tool_host_connected = match state.service.list_tools().await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!("Tool host health check failed: {}", e);
            false
        }
    };

    Json(HealthResponse {
        status: if provider_connected && tool_host_connected { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        provider: provider.name().to_string(),
        provider_connected,
        tool_host_connected,
    })
}

/// Create a session. The body is optional; an unreadable one is treated as empty.
pub async fn create_session(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    let request: CreateSessionRequest = if body.is_empty() {
        CreateSessionRequest::default()
    } else {
        serde_json::from_slice(&body).unwrap_or_else(|e| {
            tracing::debug!("Ignoring unreadable session body: {}", e);
            CreateSessionRequest::default()
        })
    };

    let title = request.title.filter(|t| !t.trim().is_empty());
    let id = state
        .service
        .create_session(title)
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(CreateSessionResponse {
        session_id: id.to_string(),
    }))
}

/// Durable message log of a session. Without `limit` the store's default window applies.
pub async fn session_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    let limit = params.limit.unwrap_or(0);
    let messages = state
        .service
        .history(&id, limit)
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(messages.into_iter().map(HistoryEntry::from).collect()))
}

/// Raw tool catalog from the tool host
pub async fn list_tools(
    State(state): State<AppState>,
) -> Result<Json<Vec<ToolDescriptor>>, ApiError> {
    state.service.list_tools().await.map(Json).map_err(|e| {
        tracing::warn!("Tool listing failed: {}", e);
        api_error(StatusCode::BAD_GATEWAY, "TOOL_HOST_ERROR", e.user_message())
    })
}

/// Run one query through the agent loop
pub async fn query_handler(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) =
        payload.map_err(|e| api_error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", e.body_text()))?;

    let response = state.service.query(request).await.map_err(|e| error_response(&e))?;

    let status = if response.failed() {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)).into_response())
}
