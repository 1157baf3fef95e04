//! Error Types

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// LLM provider error
    #[error("Provider error: {0}")]
    Provider(String),

    /// Provider unavailable or not responding
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Rate limited by the provider
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Tool host unreachable or returned a protocol error outside a tool call
    #[error("Tool host error: {0}")]
    ToolHost(String),

    /// A single tool call failed
    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// No final answer within the configured number of rounds
    #[error("Turn budget exhausted: no final answer after {0} steps")]
    TurnBudgetExhausted(usize),

    /// Run deadline passed while a generation or tool call was in flight
    #[error("Run deadline exceeded")]
    Timeout,

    /// Caller supplied an unusable request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown or malformed session
    #[error("Session error: {0}")]
    Session(String),

    /// Persistence backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Parse error (wire payloads, stored rows)
    #[error("Parse error: {0}")]
    Parse(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(msg) => format!("The AI service encountered an error: {msg}"),
            Self::ProviderUnavailable(_) => {
                "The AI service is currently unavailable. Please try again.".into()
            }
            Self::RateLimited(_) => {
                "Too many requests to the AI service. Please wait a moment.".into()
            }
            Self::ToolHost(_) => "The tool service is currently unavailable.".into(),
            Self::ToolExecution(msg) => format!("Tool error: {msg}"),
            Self::TurnBudgetExhausted(_) => {
                "The request needed too many steps. Please try a simpler query.".into()
            }
            Self::Timeout => "The request took too long to process.".into(),
            Self::InvalidRequest(msg) | Self::Session(msg) => msg.clone(),
            _ => "An unexpected error occurred.".into(),
        }
    }
}
