//! Scripted provider and tool host shared by the unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::message::Message;
use crate::provider::{Completion, FinishReason, GenerationOptions, LlmProvider};
use crate::sampling::CallContext;
use crate::tool::{CallToolResult, ToolCall, ToolDescriptor, ToolHost};

/// Provider that replays a fixed script of completions and records each request
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Completion>>,
    repeat: Option<Completion>,
    delay: Option<Duration>,
    requests: Mutex<Vec<(Vec<Message>, GenerationOptions)>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Completion>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            repeat: None,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request with the same completion
    pub fn repeating(completion: Completion) -> Self {
        Self {
            repeat: Some(completion),
            ..Self::new(Vec::new())
        }
    }

    /// Sleep before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn text(content: &str) -> Completion {
        Completion {
            content: content.to_string(),
            model: "scripted".into(),
            finish_reason: Some(FinishReason::Stop),
            ..Default::default()
        }
    }

    pub fn tool_calls(calls: &[(&str, Value)]) -> Completion {
        let tool_calls = calls
            .iter()
            .map(|(name, args)| {
                let arguments: HashMap<String, Value> =
                    serde_json::from_value(args.clone()).unwrap_or_default();
                ToolCall::new(*name, arguments)
            })
            .collect();
        Completion {
            tool_calls,
            model: "scripted".into(),
            finish_reason: Some(FinishReason::ToolUse),
            ..Default::default()
        }
    }

    /// Number of requests received so far
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// The `index`-th request, as received
    pub fn request(&self, index: usize) -> (Vec<Message>, GenerationOptions) {
        self.requests.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        self.requests
            .lock()
            .unwrap()
            .push((messages.to_vec(), options.clone()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.script.lock().unwrap().pop_front();
        next.or_else(|| self.repeat.clone())
            .ok_or_else(|| AgentError::Provider("script exhausted".into()))
    }
}

/// Tool host with a fixed catalog and canned per-tool outcomes
pub struct ScriptedHost {
    catalog: Vec<ToolDescriptor>,
    fail_listing: bool,
    delay: Option<Duration>,
    outcomes: HashMap<String, std::result::Result<CallToolResult, String>>,
    calls: Mutex<Vec<(ToolCall, CallContext)>>,
}

impl ScriptedHost {
    pub fn new(catalog: Vec<ToolDescriptor>) -> Self {
        Self {
            catalog,
            fail_listing: false,
            delay: None,
            outcomes: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Catalog of bare object-schema tools
    pub fn named(names: &[&str]) -> Self {
        Self::new(
            names
                .iter()
                .map(|name| ToolDescriptor::new(name, "", serde_json::json!({"type": "object"})))
                .collect(),
        )
    }

    pub fn respond(mut self, tool: &str, outcome: Result<CallToolResult>) -> Self {
        self.outcomes
            .insert(tool.to_string(), outcome.map_err(|e| e.to_string()));
        self
    }

    /// Sleep inside every tool call before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_catalog(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    /// Calls received, in order
    pub fn calls(&self) -> Vec<ToolCall> {
        self.calls.lock().unwrap().iter().map(|(call, _)| call.clone()).collect()
    }

    /// Nested-generation model override seen by each call
    pub fn seen_models(&self) -> Vec<Option<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, ctx)| ctx.overrides.model.clone())
            .collect()
    }
}

#[async_trait]
impl ToolHost for ScriptedHost {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        if self.fail_listing {
            return Err(AgentError::ToolHost("catalog unavailable".into()));
        }
        Ok(self.catalog.clone())
    }

    async fn call_tool(&self, call: &ToolCall, ctx: &CallContext) -> Result<CallToolResult> {
        self.calls.lock().unwrap().push((call.clone(), ctx.clone()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.outcomes.get(&call.name) {
            Some(Ok(result)) => Ok(result.clone()),
            Some(Err(message)) => Err(AgentError::ToolExecution(message.clone())),
            None => Err(AgentError::ToolExecution(format!("tool '{}' not found", call.name))),
        }
    }
}
