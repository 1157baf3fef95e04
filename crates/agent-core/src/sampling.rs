//! Nested Generation
//!
//! A tool host may ask the client to run a generation while one of its tools
//! is executing (MCP `sampling/createMessage`). The per-query overrides that
//! shape such a generation travel explicitly in a [`CallContext`] handed to
//! every tool call, and [`SamplingBridge`] turns the host's request plus those
//! overrides into a provider call.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::message::Message;
use crate::provider::{GenerationOptions, LlmProvider};
use crate::session::SessionId;

/// Stop reason reported for every bridged generation
pub const END_TURN: &str = "endTurn";

/// Generation overrides supplied with a query
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOverrides {
    /// System-prompt fragment injected ahead of the host's own system prompt
    #[serde(default)]
    pub system_prompt: Option<String>,

    /// Target model; the bridge default applies when unset
    #[serde(default)]
    pub model: Option<String>,

    /// Applied only when non-zero
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Applied only when positive
    #[serde(default)]
    pub max_tokens: Option<i64>,

    /// Applied only when non-empty
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

/// Per-call context threaded from the query down to the tool host
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    pub session_id: Option<SessionId>,
    pub overrides: GenerationOverrides,
}

impl CallContext {
    pub const fn new(session_id: Option<SessionId>, overrides: GenerationOverrides) -> Self {
        Self {
            session_id,
            overrides,
        }
    }
}

/// Role vocabulary used by the tool host
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingRole {
    User,
    Assistant,
}

/// One message of a host-issued generation request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SamplingMessage {
    pub role: SamplingRole,

    /// Content block (`{"type": "text", "text": ...}`, image, audio, ...)
    pub content: Value,
}

impl SamplingMessage {
    fn text(&self) -> Option<&str> {
        if self.content.get("type").and_then(Value::as_str) != Some("text") {
            return None;
        }
        self.content.get("text").and_then(Value::as_str)
    }
}

/// Host-issued generation request (`sampling/createMessage` params)
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageRequest {
    #[serde(default)]
    pub messages: Vec<SamplingMessage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Reply to a host-issued generation request
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMessageResult {
    pub role: SamplingRole,
    pub content: Value,
    pub model: String,
    pub stop_reason: String,
}

impl CreateMessageResult {
    pub fn text(&self) -> Option<&str> {
        self.content.get("text").and_then(Value::as_str)
    }
}

/// Answers generation requests coming from the tool host
#[async_trait]
pub trait SamplingHandler: Send + Sync {
    async fn create_message(
        &self,
        request: CreateMessageRequest,
        overrides: &GenerationOverrides,
    ) -> Result<CreateMessageResult>;
}

/// Sampling handler backed by an [`LlmProvider`]
pub struct SamplingBridge {
    provider: Arc<dyn LlmProvider>,
    default_model: String,
}

impl SamplingBridge {
    pub fn new(provider: Arc<dyn LlmProvider>, default_model: impl Into<String>) -> Self {
        Self {
            provider,
            default_model: default_model.into(),
        }
    }

    /// Generation options for a bridged request
    pub fn options_for(
        &self,
        request: &CreateMessageRequest,
        overrides: &GenerationOverrides,
    ) -> GenerationOptions {
        let model = overrides
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.default_model);

        let mut options = GenerationOptions::new(model)
            .with_system_segment(overrides.system_prompt.as_deref().unwrap_or_default())
            .with_system_segment(request.system_prompt.as_deref().unwrap_or_default());

        options.temperature = overrides.temperature.filter(|t| *t != 0.0);
        options.max_tokens = overrides
            .max_tokens
            .filter(|m| *m > 0)
            .map(|m| u32::try_from(m).unwrap_or(u32::MAX));
        options.stop_sequences.clone_from(&overrides.stop_sequences);
        options
    }

    /// Translate host messages into model messages; non-text content is skipped
    pub fn messages_for(request: &CreateMessageRequest) -> Vec<Message> {
        request
            .messages
            .iter()
            .filter_map(|m| {
                let text = m.text()?;
                Some(match m.role {
                    SamplingRole::User => Message::user(text),
                    SamplingRole::Assistant => Message::assistant(text),
                })
            })
            .collect()
    }
}

#[async_trait]
impl SamplingHandler for SamplingBridge {
    async fn create_message(
        &self,
        request: CreateMessageRequest,
        overrides: &GenerationOverrides,
    ) -> Result<CreateMessageResult> {
        let options = self.options_for(&request, overrides);
        let messages = Self::messages_for(&request);

        tracing::debug!(
            model = %options.model,
            messages = messages.len(),
            "Servicing nested generation request"
        );

        let completion = self.provider.complete(&messages, &options).await?;

        Ok(CreateMessageResult {
            role: SamplingRole::Assistant,
            content: serde_json::json!({"type": "text", "text": completion.content}),
            model: options.model,
            stop_reason: END_TURN.into(),
        })
    }
}
