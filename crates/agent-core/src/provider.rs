//! LLM Provider Strategy Pattern
//!
//! Defines a common interface for function-calling LLM backends (Gemini,
//! Ollama, ...) so the agent loop and the sampling bridge work with any of
//! them without code changes.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_core::provider::{GenerationOptions, LlmProvider};
//!
//! let options = GenerationOptions::new("gemini-2.5-flash").with_system_segment("Be brief.");
//! let completion = provider.complete(&messages, &options).await?;
//! for call in &completion.tool_calls {
//!     println!("model wants {}", call.name);
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::message::Message;
use crate::tool::ToolCall;

/// Model-facing description of a callable tool
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,

    pub description: String,

    /// JSON schema of the arguments, passed through as advertised by the tool host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Whether the model may answer directly or must call a tool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionCallingMode {
    /// Model may answer in text or request calls
    #[default]
    Auto,
    /// Model must emit at least one call
    Required,
}

impl FunctionCallingMode {
    pub const fn from_force(force_tools: bool) -> Self {
        if force_tools { Self::Required } else { Self::Auto }
    }
}

/// Configuration for one generation request
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Model identifier (e.g., "gemini-2.5-flash", "llama3.2")
    pub model: String,

    /// Sampling temperature; provider default when unset
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate; provider default when unset
    #[serde(default)]
    pub max_tokens: Option<u32>,

    /// Stop sequences
    #[serde(default)]
    pub stop_sequences: Vec<String>,

    /// System instruction, one entry per segment
    #[serde(default)]
    pub system_instruction: Vec<String>,

    /// Callable tools offered to the model
    #[serde(default)]
    pub tools: Vec<FunctionDeclaration>,

    /// Function calling mode (ignored when `tools` is empty)
    #[serde(default)]
    pub function_calling: FunctionCallingMode,
}

impl GenerationOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Append a system-instruction segment; blank segments are skipped
    #[must_use]
    pub fn with_system_segment(mut self, segment: impl AsRef<str>) -> Self {
        let segment = segment.as_ref().trim();
        if !segment.is_empty() {
            self.system_instruction.push(segment.to_string());
        }
        self
    }
}

/// Response from an LLM completion
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Completion {
    /// The generated text
    pub content: String,

    /// Tool calls in the order the model emitted them
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,

    /// Model that generated this response
    pub model: String,

    /// Token usage statistics (if available)
    pub usage: Option<TokenUsage>,

    /// Finish reason
    pub finish_reason: Option<FinishReason>,
}

/// Token usage statistics
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Reason for completion finishing
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
    Error,
}

/// Strategy trait for LLM providers
///
/// Implement this trait to add support for new LLM backends.
/// The agent works exclusively through this interface.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name for logs and health output
    fn name(&self) -> &str;

    /// Check if the provider is available and configured correctly
    async fn health_check(&self) -> Result<bool>;

    /// Generate a completion from messages
    async fn complete(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<Completion>;
}
