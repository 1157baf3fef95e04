//! rust-agent HTTP Server
//!
//! Axum-based server in front of the agent loop: a Gemini (or Ollama) model
//! calling tools on an MCP host, with every step persisted to SQLite.

mod config;
mod handlers;
mod state;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agent_core::{AgentService, LlmProvider, SamplingBridge, ServiceConfig};
use agent_runtime::{GeminiProvider, McpClient, McpConfig, OllamaProvider};
use agent_store::SqliteConversationStore;

use crate::config::{ProviderConfig, ServerConfig};
use crate::handlers::{create_session, health_check, list_tools, query_handler, session_history};
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment first so RUST_LOG from .env applies
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;

    let provider = build_provider(&config.provider)?;
    match provider.health_check().await {
        Ok(true) => tracing::info!(
            "✓ Connected to {} (model {})",
            provider.name(),
            config.default_model()
        ),
        Ok(false) | Err(_) => {
            tracing::warn!("⚠ {} not available - queries will fail", provider.name());
        }
    }

    // Nested generations requested by tools go back through the same provider
    let bridge = Arc::new(SamplingBridge::new(provider.clone(), config.default_model()));
    let tools = McpClient::new(McpConfig::new(&config.mcp_url))?.with_sampling_handler(bridge);
    tracing::info!("Tool host: {}", tools.url());

    let store = SqliteConversationStore::open(&config.database_url).await?;
    tracing::info!("Conversation store: {}", config.database_url);

    let service = AgentService::new(
        provider,
        Arc::new(tools),
        Arc::new(store),
        ServiceConfig {
            default_model: config.default_model().to_string(),
            history_limit: config.history_limit,
            default_timeout: Some(config.query_timeout),
        },
    );

    let app = build_router(AppState::new(service));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;

    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("🚀 rust-agent server running on http://{}", config.bind_addr);
    tracing::info!("══════════════════════════════════════════════════");
    tracing::info!("Endpoints:");
    tracing::info!("  GET  /health                - Health check");
    tracing::info!("  GET  /tools                 - Tool catalog");
    tracing::info!("  POST /sessions              - Create session");
    tracing::info!("  GET  /sessions/{{id}}/history - Session message log");
    tracing::info!("  POST /query                 - Run a query");

    axum::serve(listener, app).await?;

    Ok(())
}

fn build_provider(config: &ProviderConfig) -> agent_core::Result<Arc<dyn LlmProvider>> {
    Ok(match config {
        ProviderConfig::Gemini(gemini) => Arc::new(GeminiProvider::new(gemini.clone())?),
        ProviderConfig::Ollama(ollama) => Arc::new(OllamaProvider::from_config(ollama.clone())?),
    })
}

fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/tools", get(list_tools))
        .route("/sessions", post(create_session))
        .route("/sessions/{id}/history", get(session_history))
        .route("/query", post(query_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::{
        AgentError, CallContext, CallToolResult, ConversationStore, MemoryConversationStore,
        Message, Role, Tool, ToolCall, ToolDescriptor, ToolRegistry,
        provider::{Completion, FinishReason, GenerationOptions},
    };
    use async_trait::async_trait;
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use serde_json::{Value, json};
    use tower::ServiceExt;

    /// Answers every generation with the same text, or fails when `answer` is `None`
    struct FixedProvider {
        answer: Option<&'static str>,
    }

    #[async_trait]
    impl LlmProvider for FixedProvider {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn health_check(&self) -> agent_core::Result<bool> {
            Ok(self.answer.is_some())
        }

        async fn complete(
            &self,
            _messages: &[Message],
            options: &GenerationOptions,
        ) -> agent_core::Result<Completion> {
            let answer = self
                .answer
                .ok_or_else(|| AgentError::Provider("model offline".into()))?;
            Ok(Completion {
                content: answer.into(),
                tool_calls: Vec::new(),
                model: options.model.clone(),
                usage: None,
                finish_reason: Some(FinishReason::Stop),
            })
        }
    }

    struct ClockTool;

    #[async_trait]
    impl Tool for ClockTool {
        fn descriptor(&self) -> ToolDescriptor {
            ToolDescriptor::new("clock", "Current time", json!({"type": "object"}))
        }

        async fn execute(
            &self,
            _call: &ToolCall,
            _ctx: &CallContext,
        ) -> agent_core::Result<CallToolResult> {
            Ok(CallToolResult::text("noon"))
        }
    }

    fn app(answer: Option<&'static str>) -> Router {
        app_with_store(answer, Arc::new(MemoryConversationStore::new()))
    }

    fn app_with_store(answer: Option<&'static str>, store: Arc<MemoryConversationStore>) -> Router {
        let mut tools = ToolRegistry::new();
        tools.register(ClockTool);
        let service = AgentService::new(
            Arc::new(FixedProvider { answer }),
            Arc::new(tools),
            store,
            ServiceConfig::new("test-model"),
        );
        build_router(AppState::new(service))
    }

    async fn send(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_query_answers_directly() {
        let app = app(Some("4"));
        let (status, body) = send(&app, "POST", "/query", Some(json!({"q": "What is 2+2?"}))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["final"], "4");
        assert_eq!(body["trace"].as_array().unwrap().len(), 1);
        assert_eq!(body["trace"][0]["final"], true);
        assert!(body.get("err").is_none());
        assert!(!body["session_id"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_rejects_bad_input() {
        let app = app(Some("4"));

        let (status, body) = send(&app, "POST", "/query", Some(json!({"q": "   "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");

        let (status, _) = send(
            &app,
            "POST",
            "/query",
            Some(json!({"q": "hi", "session_id": "not-a-uuid"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&app, "POST", "/query", Some(json!({"q": 5}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_query_unknown_session_is_not_found() {
        let app = app(Some("4"));
        let (status, body) = send(
            &app,
            "POST",
            "/query",
            Some(json!({"q": "hi", "session_id": "6f1c2a57-6c1e-4b7a-9a53-2d1f0e8b7c44"})),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "UNKNOWN_SESSION");
    }

    #[tokio::test]
    async fn test_failed_run_is_bad_gateway_with_trace() {
        let app = app(None);
        let (status, body) = send(&app, "POST", "/query", Some(json!({"q": "hello"}))).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["final"], "");
        assert!(body["err"].as_str().unwrap().contains("model offline"));
        assert!(body["trace"].is_array());
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let app = app(Some("hello back"));

        let (status, created) = send(&app, "POST", "/sessions", None).await;
        assert_eq!(status, StatusCode::OK);
        let id = created["session_id"].as_str().unwrap().to_string();

        let query = json!({"q": "hello", "session_id": id});
        let (status, body) = send(&app, "POST", "/query", Some(query)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session_id"], id.as_str());

        let uri = format!("/sessions/{id}/history?limit=10");
        let (status, history) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let entries = history.as_array().unwrap();
        assert!(!entries.is_empty());
        assert_eq!(entries[0]["role"], "user");
        assert_eq!(entries[0]["content"], "hello");
    }

    #[tokio::test]
    async fn test_session_accepts_title() {
        let app = app(Some("ok"));
        let (status, created) =
            send(&app, "POST", "/sessions", Some(json!({"title": "Budget"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(created["session_id"].is_string());
    }

    #[tokio::test]
    async fn test_history_defaults_to_store_window() {
        let store = Arc::new(MemoryConversationStore::new());
        let id = store.create_session(None).await.unwrap();
        for i in 0..60 {
            store.save_message(&id, Role::User, &format!("m{i}"), None).await.unwrap();
        }
        let app = app_with_store(Some("ok"), store);

        let (status, history) = send(&app, "GET", &format!("/sessions/{id}/history"), None).await;
        assert_eq!(status, StatusCode::OK);
        let entries = history.as_array().unwrap();
        assert_eq!(entries.len(), 50);
        assert_eq!(entries[0]["content"], "m0");

        let uri = format!("/sessions/{id}/history?limit=55");
        let (_, history) = send(&app, "GET", &uri, None).await;
        assert_eq!(history.as_array().unwrap().len(), 55);
    }

    #[tokio::test]
    async fn test_tools_and_health() {
        let app = app(Some("ok"));

        let (status, tools) = send(&app, "GET", "/tools", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(tools[0]["name"], "clock");

        let (status, health) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["provider"], "fixed");
        assert_eq!(health["tool_host_connected"], true);
        assert_eq!(health["provider_connected"], true);
    }

    #[tokio::test]
    async fn test_health_reports_degraded_provider() {
        let app = app(None);
        let (status, health) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["provider_connected"], false);
    }
}
