//! Server Configuration
//!
//! Everything comes from the environment (after `.env` is loaded).

use std::time::Duration;

use agent_core::error::{AgentError, Result};
use agent_runtime::{GeminiConfig, OllamaConfig};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:4000";
const DEFAULT_DATABASE: &str = "agent.db";
const DEFAULT_QUERY_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_HISTORY_LIMIT: i64 = 100;

/// Which model backend answers queries
#[derive(Clone, Debug)]
pub enum ProviderConfig {
    Gemini(GeminiConfig),
    Ollama(OllamaConfig),
}

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// MCP streamable-HTTP endpoint of the tool host
    pub mcp_url: String,

    /// SQLite database path
    pub database_url: String,

    pub provider: ProviderConfig,

    pub bind_addr: String,

    /// Run deadline for queries that set no `timeout_ms`
    pub query_timeout: Duration,

    /// Prior messages replayed per query
    pub history_limit: i64,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mcp_url = get("MCP_SERVER_URL")
            .ok_or_else(|| AgentError::Config("MCP_SERVER_URL must be set".into()))?;

        let provider = match get("LLM_PROVIDER").as_deref().unwrap_or("gemini") {
            "gemini" => ProviderConfig::Gemini(GeminiConfig::from_lookup(&lookup)?),
            "ollama" => ProviderConfig::Ollama(OllamaConfig::from_lookup(&lookup)),
            other => {
                return Err(AgentError::Config(format!(
                    "LLM_PROVIDER must be 'gemini' or 'ollama', got '{other}'"
                )));
            }
        };

        let query_timeout_ms = match get("QUERY_TIMEOUT_MS") {
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .ok_or_else(|| {
                    AgentError::Config(format!(
                        "QUERY_TIMEOUT_MS must be a positive integer, got '{raw}'"
                    ))
                })?,
            None => DEFAULT_QUERY_TIMEOUT_MS,
        };

        let history_limit = match get("HISTORY_LIMIT") {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                AgentError::Config(format!("HISTORY_LIMIT must be an integer, got '{raw}'"))
            })?,
            None => DEFAULT_HISTORY_LIMIT,
        };

        Ok(Self {
            mcp_url,
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE.into()),
            provider,
            bind_addr: get("BIND_ADDR")
                .or_else(|| get("ADDR"))
                .unwrap_or_else(|| DEFAULT_BIND_ADDR.into()),
            query_timeout: Duration::from_millis(query_timeout_ms),
            history_limit,
        })
    }

    /// Model used when a query names none
    pub fn default_model(&self) -> &str {
        match &self.provider {
            ProviderConfig::Gemini(config) => &config.model,
            ProviderConfig::Ollama(config) => &config.model,
        }
    }
}
