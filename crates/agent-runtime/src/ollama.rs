//! Ollama LLM Provider
//!
//! Implementation of `LlmProvider` for local Ollama inference, with native
//! tool calling through `ollama-rs`.

use std::collections::HashMap;

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    provider::{
        Completion, FinishReason, FunctionCallingMode, FunctionDeclaration, GenerationOptions,
        LlmProvider, TokenUsage,
    },
    tool::ToolCall,
};
use async_trait::async_trait;
use ollama_rs::{
    Ollama,
    generation::chat::{ChatMessage, MessageRole, request::ChatMessageRequest},
};
use serde::Deserialize;
use serde_json::{Value, json};

/// Ollama provider configuration
#[derive(Clone, Debug)]
pub struct OllamaConfig {
    /// Ollama host URL
    pub host: String,

    /// Ollama port
    pub port: u16,

    /// Default model
    pub model: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".into(),
            port: 11434,
            model: "llama3.2".into(),
        }
    }
}

impl OllamaConfig {
    /// Read `OLLAMA_HOST`, `OLLAMA_PORT` and `OLLAMA_MODEL`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            host: lookup("OLLAMA_HOST").unwrap_or(defaults.host),
            port: lookup("OLLAMA_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            model: lookup("OLLAMA_MODEL").unwrap_or(defaults.model),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// Ollama LLM provider
pub struct OllamaProvider {
    client: Ollama,
}

impl OllamaProvider {
    /// Create from configuration. The host must be an absolute URL.
    pub fn from_config(config: OllamaConfig) -> Result<Self> {
        reqwest::Url::parse(&config.host).map_err(|e| {
            AgentError::Config(format!("OLLAMA_HOST '{}' is not a URL: {e}", config.host))
        })?;
        Ok(Self {
            client: Ollama::new(&config.host, config.port),
        })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_config(OllamaConfig::from_env())
    }

    /// Create with default localhost settings
    pub fn localhost() -> Result<Self> {
        Self::from_config(OllamaConfig::default())
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn health_check(&self) -> Result<bool> {
        match self.client.list_local_models().await {
            Ok(_) => Ok(true),
            Err(e) => {
                tracing::warn!("Ollama health check failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &GenerationOptions,
    ) -> Result<Completion> {
        if options.function_calling == FunctionCallingMode::Required && !options.tools.is_empty() {
            tracing::debug!("Ollama cannot force tool calls; using automatic mode");
        }

        let request = build_request(messages, options)?;
        let response = self
            .client
            .send_chat_messages(request)
            .await
            .map_err(|e| AgentError::Provider(format!("Ollama chat failed: {e}")))?;

        let reply: Reply = serde_json::from_value(serde_json::to_value(&response.message)?)?;
        let usage = token_usage(&serde_json::to_value(&response.final_data)?);

        Ok(convert_completion(reply, usage, &options.model))
    }
}

/// Reply message fields the loop needs
#[derive(Debug, Default, Deserialize)]
struct Reply {
    #[serde(default)]
    content: String,

    #[serde(default)]
    tool_calls: Vec<ReplyToolCall>,
}

#[derive(Debug, Deserialize)]
struct ReplyToolCall {
    function: ReplyFunction,
}

#[derive(Debug, Deserialize)]
struct ReplyFunction {
    name: String,

    #[serde(default, alias = "parameters")]
    arguments: HashMap<String, Value>,
}

/// Convert agent messages to Ollama format; system segments go first
fn build_messages(messages: &[Message], options: &GenerationOptions) -> Result<Vec<ChatMessage>> {
    let mut converted: Vec<ChatMessage> = options
        .system_instruction
        .iter()
        .map(|segment| ChatMessage::new(MessageRole::System, segment.clone()))
        .collect();

    for m in messages {
        let message = match m.role {
            Role::System => ChatMessage::new(MessageRole::System, m.content.clone()),
            Role::User => ChatMessage::new(MessageRole::User, m.content.clone()),
            Role::Tool => ChatMessage::new(
                MessageRole::Tool,
                m.tool_response
                    .as_ref()
                    .map_or_else(|| m.content.clone(), |r| r.response.to_string()),
            ),
            Role::Assistant => {
                let mut message = ChatMessage::new(MessageRole::Assistant, m.content.clone());
                if !m.tool_calls.is_empty() {
                    message.tool_calls = serde_json::from_value(tool_calls_json(&m.tool_calls))?;
                }
                message
            }
        };
        converted.push(message);
    }

    Ok(converted)
}

fn tool_calls_json(calls: &[ToolCall]) -> Value {
    Value::Array(
        calls
            .iter()
            .map(|call| json!({ "function": { "name": call.name, "arguments": call.arguments } }))
            .collect(),
    )
}

/// Function declarations in Ollama's `tools` shape
fn tool_specs(declarations: &[FunctionDeclaration]) -> Value {
    Value::Array(
        declarations
            .iter()
            .map(|decl| {
                json!({
                    "type": "function",
                    "function": {
                        "name": decl.name,
                        "description": decl.description,
                        "parameters": decl
                            .parameters
                            .clone()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    }
                })
            })
            .collect(),
    )
}

/// Model options, `None` when the caller set none
fn model_options(options: &GenerationOptions) -> Option<Value> {
    let mut fields = serde_json::Map::new();
    if let Some(temperature) = options.temperature {
        fields.insert("temperature".into(), json!(temperature));
    }
    if let Some(max_tokens) = options.max_tokens {
        fields.insert("num_predict".into(), json!(max_tokens));
    }
    if !options.stop_sequences.is_empty() {
        fields.insert("stop".into(), json!(options.stop_sequences));
    }
    (!fields.is_empty()).then_some(Value::Object(fields))
}

fn build_request(messages: &[Message], options: &GenerationOptions) -> Result<ChatMessageRequest> {
    let mut request =
        ChatMessageRequest::new(options.model.clone(), build_messages(messages, options)?);
    if !options.tools.is_empty() {
        request = request.tools(serde_json::from_value(tool_specs(&options.tools))?);
    }
    if let Some(model_options) = model_options(options) {
        request = request.options(serde_json::from_value(model_options)?);
    }
    Ok(request)
}

/// Token counts from the final response data, if Ollama reported them
fn token_usage(final_data: &Value) -> Option<TokenUsage> {
    let count = |key: &str| {
        final_data
            .get(key)
            .and_then(Value::as_u64)
            .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX))
    };
    if !final_data.is_object() {
        return None;
    }
    let prompt = count("prompt_eval_count");
    let generated = count("eval_count");
    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: generated,
        total_tokens: prompt.saturating_add(generated),
    })
}

/// Convert an Ollama reply to agent completion
fn convert_completion(reply: Reply, usage: Option<TokenUsage>, model: &str) -> Completion {
    let tool_calls: Vec<ToolCall> = reply
        .tool_calls
        .into_iter()
        .map(|call| ToolCall::new(call.function.name, call.function.arguments))
        .collect();

    let finish_reason = if tool_calls.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolUse
    };

    Completion {
        content: reply.content,
        tool_calls,
        model: model.to_string(),
        usage,
        finish_reason: Some(finish_reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_lookup() {
        let config = OllamaConfig::from_lookup(|key| match key {
            "OLLAMA_PORT" => Some("not-a-port".into()),
            "OLLAMA_MODEL" => Some("qwen3".into()),
            _ => None,
        });
        assert_eq!(config.host, "http://localhost");
        assert_eq!(config.port, 11434);
        assert_eq!(config.model, "qwen3");
    }

    #[test]
    fn test_invalid_host_is_config_error() {
        let config = OllamaConfig {
            host: "localhost without scheme".into(),
            ..OllamaConfig::default()
        };
        assert!(matches!(OllamaProvider::from_config(config), Err(AgentError::Config(_))));
        assert!(OllamaProvider::localhost().is_ok());
    }

    #[test]
    fn test_message_conversion() {
        let options = GenerationOptions::new("llama3.2").with_system_segment("Be brief.");
        let messages = vec![
            Message::user("hi"),
            Message::assistant_tool_calls("", vec![ToolCall::new("lookup", HashMap::new())]),
            Message::tool_response("lookup", json!({"text": "found"})),
        ];

        let converted = serde_json::to_value(build_messages(&messages, &options).unwrap()).unwrap();

        assert_eq!(converted[0]["role"], "system");
        assert_eq!(converted[0]["content"], "Be brief.");
        assert_eq!(converted[1]["role"], "user");
        assert_eq!(converted[2]["tool_calls"][0]["function"]["name"], "lookup");
        assert_eq!(converted[3]["role"], "tool");
        assert!(converted[3]["content"].as_str().unwrap().contains("found"));
    }

    #[test]
    fn test_tool_specs_default_schema() {
        let specs = tool_specs(&[FunctionDeclaration {
            name: "lookup".into(),
            description: "Look up".into(),
            parameters: None,
        }]);
        assert_eq!(specs[0]["type"], "function");
        assert_eq!(specs[0]["function"]["name"], "lookup");
        assert_eq!(specs[0]["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn test_model_options_only_when_set() {
        let mut options = GenerationOptions::new("llama3.2");
        assert!(model_options(&options).is_none());

        options.max_tokens = Some(64);
        options.stop_sequences = vec!["END".into()];
        let set = model_options(&options).unwrap();
        assert_eq!(set["num_predict"], 64);
        assert_eq!(set["stop"], json!(["END"]));
        assert!(set.get("temperature").is_none());
    }

    #[test]
    fn test_completion_with_tool_calls() {
        let reply: Reply = serde_json::from_value(json!({
            "role": "assistant",
            "content": "",
            "tool_calls": [{"function": {"name": "lookup", "arguments": {"id": 7}}}]
        }))
        .unwrap();
        let usage = token_usage(&json!({"prompt_eval_count": 12, "eval_count": 3}));

        let completion = convert_completion(reply, usage, "llama3.2");
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].arguments["id"], json!(7));
        assert_eq!(completion.finish_reason, Some(FinishReason::ToolUse));
        assert_eq!(completion.usage.unwrap().total_tokens, 15);
        assert!(token_usage(&Value::Null).is_none());
    }
}
