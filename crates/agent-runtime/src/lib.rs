//! # agent-runtime
//!
//! Runtime integrations for the agent: model providers and the MCP tool host.
//!
//! ## Providers
//!
//! - **Gemini** (default): Gemini `generateContent` API with native function calling
//! - **Ollama**: Local LLM inference via Ollama's chat API
//!
//! ## Tool host
//!
//! - **MCP**: streamable-HTTP client, answering nested generation requests
//!   through a [`SamplingHandler`](agent_core::SamplingHandler)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use agent_runtime::{GeminiProvider, McpClient, McpConfig};
//!
//! let provider = Arc::new(GeminiProvider::from_env()?);
//! let bridge = Arc::new(SamplingBridge::new(provider.clone(), "gemini-2.5-flash"));
//! let tools = McpClient::new(McpConfig::new("http://localhost:8080/mcp/stream"))?
//!     .with_sampling_handler(bridge);
//! ```

pub mod gemini;
pub mod mcp;

#[cfg(feature = "ollama")]
pub mod ollama;

pub use gemini::{GeminiConfig, GeminiProvider};
pub use mcp::{McpClient, McpConfig};

#[cfg(feature = "ollama")]
pub use ollama::{OllamaConfig, OllamaProvider};

// Re-export core types for convenience
pub use agent_core::{
    Agent, AgentError, AgentService, LlmProvider, Message, Result, Role, SamplingBridge, Session,
    ToolHost,
};
