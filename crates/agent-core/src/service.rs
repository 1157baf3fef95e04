//! Query Service
//!
//! One query end to end: resolve the session, replay prior turns, run the
//! agent, and log every step. Audit writes go through a per-query writer task
//! so they never hold up or change the answer, and land in the order the
//! steps happened.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{AgentError, Result};
use crate::message::{Message, Role};
use crate::provider::{FunctionCallingMode, LlmProvider};
use crate::reasoning::{Agent, AgentConfig, StepObserver, StepTrace, clamp_max_steps};
use crate::sampling::{CallContext, GenerationOverrides};
use crate::session::{ConversationStore, Session, SessionId, ToolInvocation};
use crate::tool::{ToolDescriptor, ToolHost};

/// Service-wide defaults
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Model used when a query names none
    pub default_model: String,

    /// Prior messages replayed to the model per query
    pub history_limit: i64,

    /// Run deadline when a query sets none
    pub default_timeout: Option<Duration>,
}

impl ServiceConfig {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            history_limit: 100,
            default_timeout: None,
        }
    }
}

/// Inbound query
#[derive(Clone, Debug, Default, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub session_id: Option<String>,

    /// User query text
    #[serde(default)]
    pub q: String,

    /// System instruction for the loop, also injected into nested generations
    #[serde(default)]
    pub prompt: Option<String>,

    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<i64>,

    #[serde(default)]
    pub stop: Vec<String>,

    #[serde(default)]
    pub max_steps: Option<i64>,

    #[serde(default)]
    pub force_tools: bool,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl QueryRequest {
    pub fn new(q: impl Into<String>) -> Self {
        Self {
            q: q.into(),
            ..Default::default()
        }
    }

    fn overrides(&self) -> GenerationOverrides {
        GenerationOverrides {
            system_prompt: self.prompt.clone(),
            model: non_blank(self.model.as_deref()).map(str::to_string),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stop_sequences: self.stop.clone(),
        }
    }
}

/// Result of a query; `err` is set when the run failed
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub session_id: String,

    #[serde(rename = "final")]
    pub final_text: String,

    pub trace: Vec<StepTrace>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl QueryResponse {
    pub const fn failed(&self) -> bool {
        self.err.is_some()
    }
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.trim().is_empty())
}

enum AuditRecord {
    Invocation(ToolInvocation),
    Message {
        role: Role,
        content: String,
        payload: Option<serde_json::Value>,
    },
}

/// Sends audit records to the writer task of one query
struct AuditLog {
    session_id: SessionId,
    tx: mpsc::UnboundedSender<AuditRecord>,
}

impl AuditLog {
    fn spawn(store: Arc<dyn ConversationStore>, session_id: SessionId) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let writer_session = session_id.clone();
        let handle = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                let outcome = match record {
                    AuditRecord::Invocation(invocation) => {
                        store.save_tool_invocation(&invocation).await
                    }
                    AuditRecord::Message { role, content, payload } => {
                        store.save_message(&writer_session, role, &content, payload).await
                    }
                };
                if let Err(e) = outcome {
                    tracing::warn!(
                        session = %writer_session,
                        error = %e,
                        "Failed to persist audit record"
                    );
                }
            }
        });
        (Self { session_id, tx }, handle)
    }

    fn record(&self, record: AuditRecord) {
        if self.tx.send(record).is_err() {
            tracing::warn!(session = %self.session_id, "Audit writer closed, record dropped");
        }
    }
}

impl StepObserver for AuditLog {
    fn on_tool_step(&self, step: u32, trace: &StepTrace) {
        self.record(AuditRecord::Invocation(ToolInvocation {
            session_id: self.session_id.clone(),
            step_index: step,
            tool_name: trace.call_name.clone(),
            arguments: trace.args.clone(),
            result_text: (!trace.text.is_empty()).then(|| trace.text.clone()),
            raw: trace.raw.as_ref().and_then(|raw| serde_json::to_value(raw).ok()),
            error: trace.error.clone(),
            created_at: Utc::now(),
        }));

        if !trace.text.is_empty() {
            self.record(AuditRecord::Message {
                role: Role::Tool,
                content: trace.text.clone(),
                payload: Some(serde_json::json!({ "tool": trace.call_name, "args": trace.args })),
            });
        }
    }
}

/// Runs queries against a provider, a tool host and a conversation store
pub struct AgentService {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolHost>,
    store: Arc<dyn ConversationStore>,
    config: ServiceConfig,
}

impl AgentService {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolHost>,
        store: Arc<dyn ConversationStore>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            store,
            config,
        }
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub async fn create_session(&self, title: Option<String>) -> Result<SessionId> {
        let id = self.store.create_session(title).await?;
        tracing::info!(session = %id, "Created session");
        Ok(id)
    }

    /// Durable message log of a session, all roles, oldest first
    pub async fn history(&self, session_id: &str, limit: i64) -> Result<Vec<Message>> {
        let id = SessionId::parse(session_id)?;
        self.store.list_messages(&id, limit).await
    }

    /// Raw catalog as advertised by the tool host
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.tools.list_tools().await
    }

    /// Answer one query.
    ///
    /// Bad input and storage failures before the run are returned as errors;
    /// a failed run is reported inside the response with its partial trace.
    pub async fn query(&self, request: QueryRequest) -> Result<QueryResponse> {
        let (response, _writer) = self.run_query(request).await?;
        Ok(response)
    }

    async fn run_query(&self, request: QueryRequest) -> Result<(QueryResponse, JoinHandle<()>)> {
        if request.q.trim().is_empty() {
            return Err(AgentError::InvalidRequest("missing \"q\"".into()));
        }
        let q = request.q.as_str();

        let session = self.resolve_session(request.session_id.as_deref()).await?;
        self.store.touch_session(&session.id).await;

        let history = self.store.load_history(&session.id, self.config.history_limit).await?;
        if let Err(e) = self.store.save_message(&session.id, Role::User, q, None).await {
            tracing::warn!(session = %session.id, error = %e, "Failed to save user message");
        }

        let agent = Agent::new(
            self.provider.clone(),
            self.tools.clone(),
            self.agent_config(&request),
        );
        let ctx = CallContext::new(Some(session.id.clone()), request.overrides());
        let (audit, writer) = AuditLog::spawn(self.store.clone(), session.id.clone());

        tracing::info!(
            session = %session.id,
            model = %agent.config().model,
            history = history.len(),
            "Running query"
        );

        let response = match agent.run(history, q, &ctx, Some(&audit)).await {
            Ok(run) => {
                audit.record(AuditRecord::Message {
                    role: Role::Assistant,
                    content: run.final_text.clone(),
                    payload: None,
                });
                QueryResponse {
                    session_id: session.id.to_string(),
                    final_text: run.final_text,
                    trace: run.trace,
                    err: None,
                }
            }
            Err(failure) => {
                tracing::error!(session = %session.id, error = %failure, "Query failed");
                QueryResponse {
                    session_id: session.id.to_string(),
                    final_text: String::new(),
                    trace: failure.trace,
                    err: Some(failure.error.to_string()),
                }
            }
        };

        Ok((response, writer))
    }

    async fn resolve_session(&self, requested: Option<&str>) -> Result<Session> {
        let Some(raw) = non_blank(requested) else {
            let id = self.create_session(None).await?;
            return self
                .store
                .get_session(&id)
                .await?
                .ok_or_else(|| {
                    AgentError::Storage(format!("session {id} vanished after creation"))
                });
        };

        let id = SessionId::parse(raw)?;
        self.store
            .get_session(&id)
            .await?
            .ok_or_else(|| AgentError::Session(format!("unknown session {id}")))
    }

    fn agent_config(&self, request: &QueryRequest) -> AgentConfig {
        let model = non_blank(request.model.as_deref()).unwrap_or(&self.config.default_model);
        let mut config = AgentConfig::new(model);
        config.system_prompt = non_blank(request.prompt.as_deref()).map(str::to_string);
        config.max_steps = clamp_max_steps(request.max_steps.unwrap_or(0));
        config.function_calling = FunctionCallingMode::from_force(request.force_tools);
        config.timeout = request
            .timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .or(self.config.default_timeout);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryConversationStore;
    use crate::test_support::{ScriptedHost, ScriptedProvider};
    use crate::tool::CallToolResult;
    use serde_json::json;

    struct Fixture {
        provider: Arc<ScriptedProvider>,
        host: Arc<ScriptedHost>,
        store: Arc<MemoryConversationStore>,
        service: AgentService,
    }

    fn fixture(provider: ScriptedProvider, host: ScriptedHost) -> Fixture {
        let provider = Arc::new(provider);
        let host = Arc::new(host);
        let store = Arc::new(MemoryConversationStore::new());
        let service = AgentService::new(
            provider.clone(),
            host.clone(),
            store.clone(),
            ServiceConfig::new("default-model"),
        );
        Fixture {
            provider,
            host,
            store,
            service,
        }
    }

    fn net_worth_host() -> ScriptedHost {
        ScriptedHost::named(&["fetch_net_worth"])
            .respond("fetch_net_worth", Ok(CallToolResult::text("net worth: 100")))
    }

    async fn settled(f: &Fixture, request: QueryRequest) -> QueryResponse {
        let (response, writer) = f.service.run_query(request).await.unwrap();
        writer.await.unwrap();
        response
    }

    fn roles_and_contents(messages: &[Message]) -> Vec<(Role, String)> {
        messages.iter().map(|m| (m.role, m.content.clone())).collect()
    }

    #[tokio::test]
    async fn test_direct_answer_is_persisted() {
        let f = fixture(
            ScriptedProvider::new(vec![ScriptedProvider::text("4")]),
            ScriptedHost::new(vec![]),
        );

        let response = settled(&f, QueryRequest::new("What is 2+2?")).await;

        assert!(!response.failed());
        assert_eq!(response.final_text, "4");
        assert_eq!(response.trace.len(), 1);
        assert!(response.trace[0].is_final());

        let id = SessionId::parse(&response.session_id).unwrap();
        let log = f.store.list_messages(&id, 50).await.unwrap();
        assert_eq!(
            roles_and_contents(&log),
            vec![(Role::User, "What is 2+2?".into()), (Role::Assistant, "4".into())]
        );
        assert!(f.store.list_tool_invocations(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_is_stored_and_sent_as_written() {
        let f = fixture(
            ScriptedProvider::new(vec![ScriptedProvider::text("ok")]),
            ScriptedHost::new(vec![]),
        );

        let response = settled(&f, QueryRequest::new("  What is 2+2?\n")).await;
        assert!(!response.failed());

        let (sent, _) = f.provider.request(0);
        assert_eq!(sent.last().unwrap().content, "  What is 2+2?\n");

        let id = SessionId::parse(&response.session_id).unwrap();
        let log = f.store.list_messages(&id, 50).await.unwrap();
        assert_eq!(log[0].content, "  What is 2+2?\n");
    }

    #[tokio::test]
    async fn test_single_tool_call_is_audited() {
        let f = fixture(
            ScriptedProvider::new(vec![
                ScriptedProvider::tool_calls(&[("fetch_net_worth", json!({"currency": "INR"}))]),
                ScriptedProvider::text("Your net worth is 100"),
            ]),
            net_worth_host(),
        );

        let response = settled(&f, QueryRequest::new("What is my net worth?")).await;
        assert_eq!(response.trace.len(), 2);
        assert_eq!(response.final_text, "Your net worth is 100");

        let id = SessionId::parse(&response.session_id).unwrap();
        let invocations = f.store.list_tool_invocations(&id).await.unwrap();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].step_index, 1);
        assert_eq!(invocations[0].tool_name, "fetch_net_worth");
        assert_eq!(invocations[0].result_text.as_deref(), Some("net worth: 100"));
        assert!(invocations[0].error.is_empty());
        assert!(invocations[0].raw.is_some());

        let log = f.store.list_messages(&id, 50).await.unwrap();
        assert_eq!(
            roles_and_contents(&log),
            vec![
                (Role::User, "What is my net worth?".into()),
                (Role::Tool, "net worth: 100".into()),
                (Role::Assistant, "Your net worth is 100".into()),
            ]
        );
        assert_eq!(
            log[1].payload,
            Some(json!({"tool": "fetch_net_worth", "args": {"currency": "INR"}}))
        );

        let history = f.store.load_history(&id, 50).await.unwrap();
        assert_eq!(history.len(), 2);
    }

    #[tokio::test]
    async fn test_budget_failure_reports_partial_trace() {
        let f = fixture(
            ScriptedProvider::repeating(ScriptedProvider::tool_calls(&[(
                "fetch_net_worth",
                json!({}),
            )])),
            net_worth_host(),
        );

        let mut request = QueryRequest::new("loop forever");
        request.max_steps = Some(1);
        let response = settled(&f, request).await;

        assert!(response.failed());
        assert!(response.err.as_deref().unwrap().contains("Turn budget exhausted"));
        assert!(response.final_text.is_empty());
        assert!(!response.trace.is_empty());
        assert!(response.trace.iter().all(|s| !s.is_final()));

        let id = SessionId::parse(&response.session_id).unwrap();
        let log = f.store.list_messages(&id, 50).await.unwrap();
        assert!(log.iter().all(|m| m.role != Role::Assistant));
        assert_eq!(f.store.list_tool_invocations(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_follow_up_replays_history_without_duplicating_query() {
        let f = fixture(
            ScriptedProvider::new(vec![
                ScriptedProvider::text("first answer"),
                ScriptedProvider::text("second answer"),
            ]),
            ScriptedHost::new(vec![]),
        );

        let first = settled(&f, QueryRequest::new("first question")).await;
        let mut follow_up = QueryRequest::new("second question");
        follow_up.session_id = Some(first.session_id.clone());
        let second = settled(&f, follow_up).await;

        assert_eq!(second.session_id, first.session_id);
        let (messages, _) = f.provider.request(1);
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first question", "first answer", "second question"]);
    }

    #[tokio::test]
    async fn test_step_index_restarts_each_run() {
        let f = fixture(
            ScriptedProvider::new(vec![
                ScriptedProvider::tool_calls(&[("fetch_net_worth", json!({}))]),
                ScriptedProvider::text("one"),
                ScriptedProvider::tool_calls(&[("fetch_net_worth", json!({}))]),
                ScriptedProvider::text("two"),
            ]),
            net_worth_host(),
        );

        let first = settled(&f, QueryRequest::new("a")).await;
        let mut again = QueryRequest::new("b");
        again.session_id = Some(first.session_id.clone());
        settled(&f, again).await;

        let id = SessionId::parse(&first.session_id).unwrap();
        let steps: Vec<_> = f
            .store
            .list_tool_invocations(&id)
            .await
            .unwrap()
            .iter()
            .map(|i| i.step_index)
            .collect();
        assert_eq!(steps, vec![1, 1]);
    }

    #[tokio::test]
    async fn test_overrides_and_session_reach_the_tool_host() {
        let f = fixture(
            ScriptedProvider::new(vec![
                ScriptedProvider::tool_calls(&[("fetch_net_worth", json!({}))]),
                ScriptedProvider::text("done"),
            ]),
            net_worth_host(),
        );

        let mut request = QueryRequest::new("q");
        request.model = Some("custom-model".into());
        request.prompt = Some("Answer tersely.".into());
        request.force_tools = true;
        settled(&f, request).await;

        assert_eq!(f.host.seen_models(), vec![Some("custom-model".to_string())]);
        let (_, options) = f.provider.request(0);
        assert_eq!(options.model, "custom-model");
        assert_eq!(options.system_instruction, vec!["Answer tersely.".to_string()]);
        assert_eq!(options.function_calling, FunctionCallingMode::Required);
        assert!(options.temperature.is_none());
    }

    #[tokio::test]
    async fn test_default_model_when_none_requested() {
        let f = fixture(
            ScriptedProvider::new(vec![ScriptedProvider::text("ok")]),
            ScriptedHost::new(vec![]),
        );
        let mut request = QueryRequest::new("q");
        request.model = Some("  ".into());
        settled(&f, request).await;
        assert_eq!(f.provider.request(0).1.model, "default-model");
    }

    #[tokio::test]
    async fn test_bad_input_is_rejected_before_running() {
        let f = fixture(ScriptedProvider::new(vec![]), ScriptedHost::new(vec![]));

        let blank = f.service.query(QueryRequest::new("   ")).await;
        assert!(matches!(blank, Err(AgentError::InvalidRequest(_))));

        let mut bad_id = QueryRequest::new("q");
        bad_id.session_id = Some("not-a-uuid".into());
        assert!(matches!(f.service.query(bad_id).await, Err(AgentError::InvalidRequest(_))));

        let mut unknown = QueryRequest::new("q");
        unknown.session_id = Some(SessionId::new().to_string());
        assert!(matches!(f.service.query(unknown).await, Err(AgentError::Session(_))));

        assert_eq!(f.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_explicit_session_and_history_listing() {
        let f = fixture(
            ScriptedProvider::new(vec![ScriptedProvider::text("hi")]),
            ScriptedHost::new(vec![]),
        );
        let id = f.service.create_session(Some("Budget".into())).await.unwrap();

        let mut request = QueryRequest::new("hello");
        request.session_id = Some(id.to_string());
        settled(&f, request).await;

        let history = f.service.history(&id.to_string(), 0).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(f.service.history("garbage", 10).await.is_err());
    }

    #[test]
    fn test_response_wire_shape() {
        let response = QueryResponse {
            session_id: "s".into(),
            final_text: "answer".into(),
            trace: vec![StepTrace::final_answer("answer")],
            err: None,
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["final"], "answer");
        assert!(value.get("err").is_none());
        assert_eq!(value["trace"][0]["final"], true);
    }

    #[test]
    fn test_request_accepts_minimal_json() {
        let request: QueryRequest = serde_json::from_value(json!({"q": "hi"})).unwrap();
        assert_eq!(request.q, "hi");
        assert!(request.session_id.is_none());
        assert!(!request.force_tools);
    }
}
