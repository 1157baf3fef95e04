//! # agent-core
//!
//! Tool-calling agent loop with a provider-agnostic LLM abstraction, a
//! pluggable tool host, and an append-only conversation log.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        AgentService                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌─────────────────────┐  │
//! │  │    Agent     │  │   ToolHost   │  │    LlmProvider      │  │
//! │  │  (reasoning) │──│  (MCP/local) │──│    (Strategy)       │  │
//! │  └──────────────┘  └──────┬───────┘  └──────────▲──────────┘  │
//! │          │                │  nested generation  │             │
//! │          ▼                └──── SamplingBridge ─┘             │
//! │  ConversationStore                                            │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! The `LlmProvider` trait enables swapping between Gemini, Ollama, or any
//! other function-calling backend without changing agent logic.

pub mod error;
pub mod message;
pub mod provider;
pub mod reasoning;
pub mod sampling;
pub mod service;
pub mod session;
pub mod tool;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{AgentError, Result};
pub use message::{Message, Role};
pub use provider::LlmProvider;
pub use reasoning::{Agent, AgentConfig, StepTrace};
pub use sampling::{CallContext, GenerationOverrides, SamplingBridge, SamplingHandler};
pub use service::{AgentService, QueryRequest, QueryResponse, ServiceConfig};
pub use session::{ConversationStore, MemoryConversationStore, Session, SessionId};
pub use tool::{CallToolResult, Tool, ToolCall, ToolDescriptor, ToolHost, ToolRegistry};
