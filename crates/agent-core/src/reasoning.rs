//! Reasoning Loop
//!
//! Function-calling loop: the model sees the conversation plus the tool
//! host's catalog, requests calls, the calls run against the host in the
//! order the model emitted them, their outcomes are appended as tool turns,
//! and the model is asked again until it answers in plain text.
//!
//! ```text
//! fetch-catalog ─▶ generate ─▶ await-calls-or-final ─▶ done
//!                     ▲               │
//!                     │          execute-calls
//!                     └───────────────┘   (budget exhausted ─▶ error)
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{AgentError, Result};
use crate::message::{Conversation, Message};
use crate::provider::{FunctionCallingMode, GenerationOptions, LlmProvider};
use crate::sampling::CallContext;
use crate::tool::{
    CallToolResult, ToolCall, ToolHost, build_function_declarations, extract_tool_text,
};

/// Default number of generate/execute rounds
pub const DEFAULT_MAX_STEPS: usize = 8;

/// Largest accepted round budget
pub const MAX_STEPS_CEILING: usize = 16;

/// Normalize a requested round budget: anything outside (0, 16] becomes 8
pub fn clamp_max_steps(requested: i64) -> usize {
    usize::try_from(requested)
        .ok()
        .filter(|steps| (1..=MAX_STEPS_CEILING).contains(steps))
        .unwrap_or(DEFAULT_MAX_STEPS)
}

/// One entry of a run's trace: either an executed tool call or the final answer
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepTrace {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub call_name: String,

    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub args: std::collections::HashMap<String, serde_json::Value>,

    /// Extracted tool text, or the answer text for the terminal entry
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,

    /// Tool error, empty on success
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<CallToolResult>,

    #[serde(default, rename = "final", skip_serializing_if = "std::ops::Not::not")]
    pub terminal: bool,
}

impl StepTrace {
    pub fn tool_call(call: &ToolCall, outcome: &Result<CallToolResult>) -> Self {
        let mut step = Self {
            call_name: call.name.clone(),
            args: call.arguments.clone(),
            ..Default::default()
        };
        match outcome {
            Ok(result) => {
                step.text = extract_tool_text(result);
                step.raw = Some(result.clone());
            }
            Err(e) => step.error = e.to_string(),
        }
        step
    }

    pub fn final_answer(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            terminal: true,
            ..Default::default()
        }
    }

    pub const fn is_final(&self) -> bool {
        self.terminal
    }

    pub fn failed(&self) -> bool {
        !self.error.is_empty()
    }

    /// Payload fed back to the model in the tool-role turn
    fn tool_response_payload(&self) -> serde_json::Value {
        if self.failed() {
            serde_json::json!({ "error": self.error })
        } else {
            serde_json::json!({ "text": self.text, "raw": self.raw })
        }
    }
}

/// Receives every executed tool call, after it returns and before the next one starts
pub trait StepObserver: Send + Sync {
    /// `step` is 1-based and counts calls across all rounds of the run
    fn on_tool_step(&self, step: u32, trace: &StepTrace);
}

impl<F> StepObserver for F
where
    F: Fn(u32, &StepTrace) + Send + Sync,
{
    fn on_tool_step(&self, step: u32, trace: &StepTrace) {
        self(step, trace);
    }
}

/// Agent configuration for one run
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Model used for the top-level loop
    pub model: String,

    /// System instruction; omitted when blank
    pub system_prompt: Option<String>,

    /// Maximum generate/execute rounds before giving up
    pub max_steps: usize,

    /// Whether the model must call a tool
    pub function_calling: FunctionCallingMode,

    /// Deadline for the whole run, covering every generation and tool call
    pub timeout: Option<Duration>,
}

impl AgentConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            max_steps: DEFAULT_MAX_STEPS,
            function_calling: FunctionCallingMode::Auto,
            timeout: None,
        }
    }
}

/// Successful run
#[derive(Clone, Debug)]
pub struct AgentRun {
    pub final_text: String,
    pub trace: Vec<StepTrace>,
}

/// Failed run, with whatever was attempted before the failure
#[derive(Debug)]
pub struct RunFailure {
    pub error: AgentError,
    pub trace: Vec<StepTrace>,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (after {} steps)", self.error, self.trace.len())
    }
}

impl std::error::Error for RunFailure {}

/// The main Agent struct
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    tools: Arc<dyn ToolHost>,
    config: AgentConfig,
}

impl Agent {
    /// Create a new agent
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: Arc<dyn ToolHost>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            config,
        }
    }

    /// Get configuration
    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run the loop for one user query on top of prior `history` (oldest first)
    pub async fn run(
        &self,
        history: Vec<Message>,
        query: &str,
        ctx: &CallContext,
        observer: Option<&dyn StepObserver>,
    ) -> std::result::Result<AgentRun, RunFailure> {
        let deadline = self.config.timeout.map(|t| Instant::now() + t);
        let mut trace = Vec::new();

        match self.drive(history, query, ctx, observer, deadline, &mut trace).await {
            Ok(final_text) => Ok(AgentRun { final_text, trace }),
            Err(error) => Err(RunFailure { error, trace }),
        }
    }

    async fn drive(
        &self,
        history: Vec<Message>,
        query: &str,
        ctx: &CallContext,
        observer: Option<&dyn StepObserver>,
        deadline: Option<Instant>,
        trace: &mut Vec<StepTrace>,
    ) -> Result<String> {
        let catalog = bounded(deadline, self.tools.list_tools())
            .await?
            .map_err(|e| AgentError::ToolHost(format!("list tools: {e}")))?;
        let options = self.generation_options(&catalog);

        let mut conversation = Conversation::from(history);
        conversation.push(Message::user(query));

        let max_steps = clamp_max_steps(i64::try_from(self.config.max_steps).unwrap_or(0));
        let mut step_index: u32 = 0;

        for round in 1..=max_steps {
            let completion =
                bounded(deadline, self.provider.complete(conversation.messages(), &options))
                    .await??;

            if completion.tool_calls.is_empty() {
                tracing::debug!(round, "Model produced final answer");
                trace.push(StepTrace::final_answer(completion.content.clone()));
                return Ok(completion.content);
            }

            tracing::debug!(
                round,
                calls = completion.tool_calls.len(),
                "Model requested tool calls"
            );
            let calls = completion.tool_calls.clone();
            conversation.push(Message::assistant_tool_calls(
                completion.content,
                completion.tool_calls,
            ));

            for call in calls {
                step_index += 1;
                let outcome = bounded(deadline, self.tools.call_tool(&call, ctx)).await?;

                let step = StepTrace::tool_call(&call, &outcome);
                if step.failed() {
                    tracing::warn!(
                        tool = %call.name,
                        step = step_index,
                        error = %step.error,
                        "Tool call failed"
                    );
                } else {
                    tracing::debug!(tool = %call.name, step = step_index, "Tool call succeeded");
                }

                conversation.push(Message::tool_response(&call.name, step.tool_response_payload()));
                if let Some(observer) = observer {
                    observer.on_tool_step(step_index, &step);
                }
                trace.push(step);
            }
        }

        Err(AgentError::TurnBudgetExhausted(max_steps))
    }

    /// Generation configuration shared by every round of a run
    fn generation_options(&self, catalog: &[crate::tool::ToolDescriptor]) -> GenerationOptions {
        let (declarations, _) = build_function_declarations(catalog);
        let mut options = GenerationOptions::new(&self.config.model)
            .with_system_segment(self.config.system_prompt.as_deref().unwrap_or_default());
        options.tools = declarations;
        options.function_calling = self.config.function_calling;
        options
    }
}

/// Await `fut` unless the run deadline passes first.
///
/// The outer `Result` reports the deadline, the inner one is the operation's own outcome.
async fn bounded<T>(
    deadline: Option<Instant>,
    fut: impl Future<Output = Result<T>>,
) -> Result<Result<T>> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| AgentError::Timeout),
        None => Ok(fut.await),
    }
}
