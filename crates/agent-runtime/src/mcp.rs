//! MCP Tool Host Client
//!
//! `ToolHost` over the MCP streamable-HTTP transport. Every JSON-RPC message
//! is POSTed to a single endpoint; the server answers either with a JSON body
//! or with an event stream on which it may interleave its own requests
//! (`sampling/createMessage`, `ping`) before the response. Those are answered
//! by POSTing a JSON-RPC response back while the stream stays open.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    sampling::{CallContext, CreateMessageRequest, SamplingHandler},
    tool::{CallToolResult, ToolCall, ToolDescriptor, ToolHost},
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::OnceCell;

/// Protocol revision requested during initialization
pub const PROTOCOL_VERSION: &str = "2025-06-18";

const ACCEPT_BOTH: &str = "application/json, text/event-stream";
const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;

/// MCP client configuration
#[derive(Clone, Debug)]
pub struct McpConfig {
    /// Streamable-HTTP endpoint, e.g. `http://localhost:8080/mcp/stream`
    pub url: String,

    pub client_name: String,

    pub client_version: String,

    pub connect_timeout: Duration,

    /// Upper bound on `tools/list` pages followed
    pub max_list_pages: usize,
}

impl McpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_name: env!("CARGO_PKG_NAME").into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            connect_timeout: Duration::from_secs(10),
            max_list_pages: 64,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct SessionState {
    session_id: Option<String>,
    protocol_version: Option<String>,
}

/// MCP streamable-HTTP client
pub struct McpClient {
    http: reqwest::Client,
    config: McpConfig,
    state: Mutex<SessionState>,
    initialized: OnceCell<()>,
    next_id: AtomicU64,
    sampling: Option<Arc<dyn SamplingHandler>>,
}

impl McpClient {
    /// Create a client; the connection is initialized on first use
    pub fn new(config: McpConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| AgentError::Config(format!("mcp http client: {e}")))?;

        Ok(Self {
            http,
            config,
            state: Mutex::new(SessionState::default()),
            initialized: OnceCell::new(),
            next_id: AtomicU64::new(1),
            sampling: None,
        })
    }

    /// Answer host-issued generation requests with `handler`; also advertises
    /// the `sampling` capability
    #[must_use]
    pub fn with_sampling_handler(mut self, handler: Arc<dyn SamplingHandler>) -> Self {
        self.sampling = Some(handler);
        self
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn session_state(&self) -> Result<SessionState> {
        self.state
            .lock()
            .map(|state| state.clone())
            .map_err(|_| AgentError::ToolHost("mcp session state poisoned".into()))
    }

    fn update_state(&self, f: impl FnOnce(&mut SessionState)) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| AgentError::ToolHost("mcp session state poisoned".into()))?;
        f(&mut state);
        Ok(())
    }

    async fn ensure_initialized(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| self.initialize())
            .await
            .map(|_| ())
    }

    async fn initialize(&self) -> Result<()> {
        let capabilities = if self.sampling.is_some() {
            json!({ "sampling": {} })
        } else {
            json!({})
        };
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": capabilities,
            "clientInfo": {
                "name": self.config.client_name,
                "version": self.config.client_version,
            },
        });

        let result = self.exchange("initialize", params, &CallContext::default()).await?;
        let info: InitializeResult = serde_json::from_value(result)
            .map_err(|e| AgentError::ToolHost(format!("bad initialize result: {e}")))?;

        self.update_state(|state| state.protocol_version = Some(info.protocol_version.clone()))?;
        self.notify("notifications/initialized").await?;

        tracing::info!(
            url = %self.config.url,
            server = info.server_info.as_ref().map_or("unknown", |s| s.name.as_str()),
            protocol = %info.protocol_version,
            "Connected to MCP server"
        );
        Ok(())
    }

    async fn post(&self, body: &impl Serialize) -> Result<reqwest::Response> {
        let state = self.session_state()?;
        let mut request = self
            .http
            .post(&self.config.url)
            .header(ACCEPT, ACCEPT_BOTH)
            .json(body);
        if let Some(session_id) = state.session_id {
            request = request.header(SESSION_HEADER, session_id);
        }
        if let Some(version) = state.protocol_version {
            request = request.header(PROTOCOL_HEADER, version);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::ToolHost(format!("MCP request failed: {e}")))?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let session_id = session_id.to_string();
            self.update_state(|state| state.session_id = Some(session_id))?;
        }
        Ok(response)
    }

    async fn notify(&self, method: &str) -> Result<()> {
        let response = self
            .post(&JsonRpcNotification {
                jsonrpc: "2.0",
                method,
            })
            .await?;
        if !response.status().is_success() {
            return Err(AgentError::ToolHost(format!(
                "{method}: HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Send one request and wait for its response, servicing any server
    /// requests that arrive on the response stream in the meantime
    async fn exchange(&self, method: &str, params: Value, ctx: &CallContext) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .post(&JsonRpcRequest {
                jsonrpc: "2.0",
                id,
                method,
                params,
            })
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::ToolHost(format!("{method}: HTTP {status}: {body}")));
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let message = if is_stream {
            self.read_event_stream(response, id, ctx).await?
        } else {
            let message: JsonRpcMessage = response
                .json()
                .await
                .map_err(|e| AgentError::ToolHost(format!("{method}: bad response body: {e}")))?;
            if !message.is_response_to(id) {
                return Err(AgentError::ToolHost(format!("{method}: response id mismatch")));
            }
            message
        };

        message.into_result(method)
    }

    async fn read_event_stream(
        &self,
        response: reqwest::Response,
        id: u64,
        ctx: &CallContext,
    ) -> Result<JsonRpcMessage> {
        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                AgentError::ToolHost(format!("MCP event stream interrupted: {e}"))
            })?;
            for event in decoder.push(&chunk) {
                if let Some(message) = self.dispatch_event(event, id, ctx).await {
                    return Ok(message);
                }
            }
        }

        if let Some(event) = decoder.finish() {
            if let Some(message) = self.dispatch_event(event, id, ctx).await {
                return Ok(message);
            }
        }
        Err(AgentError::ToolHost("MCP event stream closed before the response".into()))
    }

    /// Handle one stream event; returns the response once it arrives
    async fn dispatch_event(
        &self,
        event: SseEvent,
        id: u64,
        ctx: &CallContext,
    ) -> Option<JsonRpcMessage> {
        if !matches!(event.event.as_deref(), None | Some("message"))
            || event.data.trim().is_empty()
        {
            return None;
        }
        let message: JsonRpcMessage = match serde_json::from_str(&event.data) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed MCP event");
                return None;
            }
        };

        if message.method.is_some() && message.id.is_some() {
            let reply = self.answer_server_request(message, ctx).await;
            self.send_reply(&reply).await;
            return None;
        }
        if let Some(method) = &message.method {
            tracing::debug!(%method, "MCP notification");
            return None;
        }
        if message.is_response_to(id) {
            return Some(message);
        }
        tracing::debug!(id = ?message.id, "Ignoring response for another request");
        None
    }

    async fn answer_server_request(
        &self,
        message: JsonRpcMessage,
        ctx: &CallContext,
    ) -> JsonRpcResponse {
        let id = message.id.unwrap_or(Value::Null);
        let method = message.method.unwrap_or_default();
        tracing::debug!(%method, "MCP server request");

        match method.as_str() {
            "ping" => JsonRpcResponse::result(id, json!({})),
            "sampling/createMessage" => {
                let Some(handler) = &self.sampling else {
                    return JsonRpcResponse::error(id, METHOD_NOT_FOUND, "sampling not supported");
                };
                let request: CreateMessageRequest =
                    match serde_json::from_value(message.params.unwrap_or(Value::Null)) {
                        Ok(request) => request,
                        Err(e) => return JsonRpcResponse::error(id, INVALID_PARAMS, &e.to_string()),
                    };
                match handler.create_message(request, &ctx.overrides).await {
                    Ok(result) => match serde_json::to_value(result) {
                        Ok(value) => JsonRpcResponse::result(id, value),
                        Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, &e.to_string()),
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "Nested generation failed");
                        JsonRpcResponse::error(id, INTERNAL_ERROR, &e.to_string())
                    }
                }
            }
            other => JsonRpcResponse::error(
                id,
                METHOD_NOT_FOUND,
                &format!("method '{other}' not supported"),
            ),
        }
    }

    async fn send_reply(&self, reply: &JsonRpcResponse) {
        match self.post(reply).await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                tracing::warn!(status = %response.status(), "MCP server rejected reply");
            }
            Err(e) => tracing::warn!(error = %e, "Failed to deliver reply to MCP server"),
        }
    }
}

#[async_trait]
impl ToolHost for McpClient {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.ensure_initialized().await?;

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..self.config.max_list_pages {
            let params = cursor.map_or_else(|| json!({}), |c| json!({ "cursor": c }));
            let result = self.exchange("tools/list", params, &CallContext::default()).await?;
            let page: ListToolsPage = serde_json::from_value(result)
                .map_err(|e| AgentError::ToolHost(format!("bad tools/list result: {e}")))?;

            tools.extend(page.tools.into_iter().map(ToolDescriptor::from_value));
            cursor = page.next_cursor.filter(|c| !c.is_empty());
            if cursor.is_none() {
                tracing::debug!(count = tools.len(), "Listed MCP tools");
                return Ok(tools);
            }
        }

        Err(AgentError::ToolHost(format!(
            "tools/list still paginating after {} pages",
            self.config.max_list_pages
        )))
    }

    async fn call_tool(&self, call: &ToolCall, ctx: &CallContext) -> Result<CallToolResult> {
        self.ensure_initialized().await?;

        let params = json!({ "name": call.name, "arguments": call.arguments });
        let result = self.exchange("tools/call", params, ctx).await?;
        let result: CallToolResult = serde_json::from_value(result)
            .map_err(|e| AgentError::ToolExecution(format!("bad tools/call result: {e}")))?;

        if result.is_error {
            tracing::debug!(tool = %call.name, "Tool reported an error result");
        }
        Ok(result)
    }
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Serialize)]
struct JsonRpcNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

/// Any inbound JSON-RPC message: request, notification or response
#[derive(Debug, Deserialize)]
struct JsonRpcMessage {
    #[serde(default)]
    id: Option<Value>,

    #[serde(default)]
    method: Option<String>,

    #[serde(default)]
    params: Option<Value>,

    #[serde(default)]
    result: Option<Value>,

    #[serde(default)]
    error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    fn is_response_to(&self, id: u64) -> bool {
        self.method.is_none() && self.id.as_ref().and_then(Value::as_u64) == Some(id)
    }

    fn into_result(self, method: &str) -> Result<Value> {
        if let Some(error) = self.error {
            let message = format!("{method}: {} (code {})", error.message, error.code);
            return Err(if method == "tools/call" {
                AgentError::ToolExecution(message)
            } else {
                AgentError::ToolHost(message)
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    const fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i64, message: &str) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeResult {
    protocol_version: String,

    #[serde(default)]
    server_info: Option<Implementation>,
}

#[derive(Debug, Deserialize)]
struct Implementation {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListToolsPage {
    #[serde(default)]
    tools: Vec<Value>,

    #[serde(default)]
    next_cursor: Option<String>,
}

/// One server-sent event
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser; chunks may split lines anywhere
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed a chunk, returning the events it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = self.feed_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush an event left unterminated when the stream ended
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() {
            if let Some(event) = self.feed_line(&rest) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn feed_line(&mut self, raw: &[u8]) -> Option<SseEvent> {
        let line = raw.strip_suffix(b"\n").unwrap_or(raw);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let line = String::from_utf8_lossy(line);

        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = line
            .split_once(':')
            .map_or((line.as_ref(), ""), |(f, v)| (f, v.strip_prefix(' ').unwrap_or(v)));
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event,
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}
