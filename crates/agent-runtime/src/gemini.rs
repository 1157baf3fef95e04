//! Gemini LLM Provider
//!
//! Implementation of `LlmProvider` over the Gemini `generateContent` REST
//! endpoint, with native function calling.

use std::collections::HashMap;
use std::time::Duration;

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{
        Completion, FinishReason, FunctionCallingMode, GenerationOptions, LlmProvider, TokenUsage,
    },
    tool::ToolCall,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default Gemini model
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

/// Public Gemini API endpoint
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Gemini provider configuration
#[derive(Clone, Debug)]
pub struct GeminiConfig {
    pub api_key: String,

    /// API root, without the `/v1beta` suffix
    pub base_url: String,

    /// Default model, used by the health check
    pub model: String,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.into(),
            model: DEFAULT_MODEL.into(),
            connect_timeout_secs: 10,
        }
    }

    /// Read `GEMINI_API_KEY` (or `GOOGLE_API_KEY`), `GEMINI_MODEL`, `GEMINI_BASE_URL`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_key = non_empty("GEMINI_API_KEY")
            .or_else(|| non_empty("GOOGLE_API_KEY"))
            .ok_or_else(|| {
                AgentError::Config("GEMINI_API_KEY or GOOGLE_API_KEY must be set".into())
            })?;

        let mut config = Self::new(api_key);
        if let Some(model) = non_empty("GEMINI_MODEL") {
            config.model = model;
        }
        if let Some(base_url) = non_empty("GEMINI_BASE_URL") {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        Ok(config)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// Gemini LLM provider
pub struct GeminiProvider {
    http: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| AgentError::Config(format!("gemini http client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(GeminiConfig::from_env()?)
    }

    fn model_url(&self, model: &str) -> String {
        format!("{}/v1beta/models/{model}", self.config.base_url)
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn health_check(&self) -> Result<bool> {
        let response = self
            .http
            .get(self.model_url(&self.config.model))
            .header("x-goog-api-key", &self.config.api_key)
            .send()
            .await;

        match response {
            Ok(r) if r.status().is_success() => Ok(true),
            Ok(r) => {
                tracing::warn!(status = %r.status(), "Gemini health check failed");
                Ok(false)
            }
            Err(e) => {
                tracing::warn!("Gemini health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        let body = build_request(messages, options);
        let url = format!("{}:generateContent", self.model_url(&options.model));

        tracing::debug!(
            model = %options.model,
            contents = body.contents.len(),
            tools = options.tools.len(),
            "Sending Gemini request"
        );

        let response = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    AgentError::ProviderUnavailable(format!("Gemini API request failed: {e}"))
                } else {
                    AgentError::Provider(format!("Gemini API request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read Gemini error body".to_string());
            return Err(map_http_error(status, &body_text));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| AgentError::Parse(format!("Failed to parse Gemini response: {e}")))?;

        parse_response(parsed, &options.model)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,

    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSpec>,

    #[serde(skip_serializing_if = "Option::is_none")]
    tool_config: Option<ToolConfig>,

    #[serde(skip_serializing_if = "GenerationConfig::is_empty")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,

    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn new(role: &str, parts: Vec<Part>) -> Self {
        Self {
            role: Some(role.to_string()),
            parts,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,

    /// Marks reasoning summaries, which are not part of the answer
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    thought: bool,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,

    #[serde(default)]
    args: HashMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolSpec {
    function_declarations: Vec<FunctionDeclarationSpec>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FunctionDeclarationSpec {
    name: String,
    description: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    parameters_json_schema: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolConfig {
    function_calling_config: FunctionCallingConfig,
}

#[derive(Debug, Serialize)]
struct FunctionCallingConfig {
    mode: &'static str,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
}

impl GenerationConfig {
    fn is_empty(&self) -> bool {
        self.temperature.is_none()
            && self.max_output_tokens.is_none()
            && self.stop_sequences.is_empty()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,

    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,

    #[serde(default)]
    model_version: Option<String>,

    #[serde(default)]
    prompt_feedback: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,

    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,

    #[serde(default)]
    candidates_token_count: u32,

    #[serde(default)]
    total_token_count: u32,
}

#[derive(Deserialize)]
struct ErrorWrapper {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    status: Option<String>,
}

/// Map the agent's conversation onto Gemini contents.
///
/// Assistant turns become `model`, tool turns become `functionResponse`
/// parts of a user turn (consecutive ones merged), and system messages join
/// the system instruction.
fn build_request(messages: &[Message], options: &GenerationOptions) -> GenerateContentRequest {
    let mut system_segments = options.system_instruction.clone();
    let mut contents: Vec<Content> = Vec::with_capacity(messages.len());
    let mut merging_tool_responses = false;

    for message in messages {
        match message.role {
            Role::System => {
                if !message.content.trim().is_empty() {
                    system_segments.push(message.content.clone());
                }
                merging_tool_responses = false;
            }
            Role::User => {
                contents.push(Content::new("user", vec![Part::text(&message.content)]));
                merging_tool_responses = false;
            }
            Role::Assistant => {
                let mut parts = Vec::with_capacity(message.tool_calls.len() + 1);
                if !message.content.is_empty() || message.tool_calls.is_empty() {
                    parts.push(Part::text(&message.content));
                }
                parts.extend(message.tool_calls.iter().map(|call| Part {
                    function_call: Some(FunctionCall {
                        name: call.name.clone(),
                        args: call.arguments.clone(),
                        id: call.id.clone(),
                    }),
                    ..Default::default()
                }));
                contents.push(Content::new("model", parts));
                merging_tool_responses = false;
            }
            Role::Tool => {
                let part = match &message.tool_response {
                    Some(response) => Part {
                        function_response: Some(FunctionResponse {
                            name: response.name.clone(),
                            response: response.response.clone(),
                        }),
                        ..Default::default()
                    },
                    None => Part::text(&message.content),
                };
                match contents.last_mut() {
                    Some(last) if merging_tool_responses => last.parts.push(part),
                    _ => contents.push(Content::new("user", vec![part])),
                }
                merging_tool_responses = true;
            }
        }
    }

    let system_instruction = (!system_segments.is_empty()).then(|| Content {
        role: None,
        parts: system_segments.into_iter().map(Part::text).collect(),
    });

    let (tools, tool_config) = if options.tools.is_empty() {
        (Vec::new(), None)
    } else {
        let declarations = options
            .tools
            .iter()
            .map(|decl| FunctionDeclarationSpec {
                name: decl.name.clone(),
                description: decl.description.clone(),
                parameters_json_schema: decl.parameters.clone(),
            })
            .collect();
        let mode = match options.function_calling {
            FunctionCallingMode::Auto => "AUTO",
            FunctionCallingMode::Required => "ANY",
        };
        (
            vec![ToolSpec {
                function_declarations: declarations,
            }],
            Some(ToolConfig {
                function_calling_config: FunctionCallingConfig { mode },
            }),
        )
    };

    GenerateContentRequest {
        contents,
        system_instruction,
        tools,
        tool_config,
        generation_config: GenerationConfig {
            temperature: options.temperature,
            max_output_tokens: options.max_tokens,
            stop_sequences: options.stop_sequences.clone(),
        },
    }
}

/// Convert the first candidate into a completion
fn parse_response(response: GenerateContentResponse, model: &str) -> Result<Completion> {
    let Some(candidate) = response.candidates.into_iter().next() else {
        let reason = response
            .prompt_feedback
            .map(|feedback| feedback.to_string())
            .unwrap_or_else(|| "no candidates".into());
        return Err(AgentError::Provider(format!("Gemini returned no candidates: {reason}")));
    };

    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();
    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if part.thought {
            continue;
        }
        if let Some(call) = part.function_call {
            tool_calls.push(ToolCall {
                name: call.name,
                arguments: call.args,
                id: call.id,
            });
        } else if let Some(text) = part.text {
            texts.push(text);
        }
    }

    let finish_reason = if tool_calls.is_empty() {
        candidate.finish_reason.as_deref().map(|reason| match reason {
            "STOP" => FinishReason::Stop,
            "MAX_TOKENS" => FinishReason::Length,
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
                FinishReason::ContentFilter
            }
            _ => FinishReason::Error,
        })
    } else {
        Some(FinishReason::ToolUse)
    };

    Ok(Completion {
        content: texts.concat(),
        tool_calls,
        model: response.model_version.unwrap_or_else(|| model.to_string()),
        usage: response.usage_metadata.map(|u| TokenUsage {
            prompt_tokens: u.prompt_token_count,
            completion_tokens: u.candidates_token_count,
            total_tokens: u.total_token_count,
        }),
        finish_reason,
    })
}

fn map_http_error(status: StatusCode, body: &str) -> AgentError {
    let message = serde_json::from_str::<ErrorWrapper>(body)
        .map(|wrapper| {
            let status_text = wrapper.error.status.unwrap_or_default();
            let msg = wrapper.error.message.unwrap_or_else(|| body.to_string());
            if status_text.is_empty() {
                msg
            } else {
                format!("{status_text}: {msg}")
            }
        })
        .unwrap_or_else(|_| body.to_string());

    match status {
        StatusCode::TOO_MANY_REQUESTS => AgentError::RateLimited(message),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => {
            AgentError::ProviderUnavailable(format!("{status}: {message}"))
        }
        _ => AgentError::Provider(format!("{status}: {message}")),
    }
}
