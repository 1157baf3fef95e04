//! Session Management
//!
//! Sessions own an append-only log of messages and tool invocations. The
//! [`ConversationStore`] trait is the persistence seam; the SQLite
//! implementation lives in `agent-store`, the in-memory one below backs tests
//! and local development.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AgentError, Result};
use crate::message::{Message, Role};

/// Default number of prior messages returned by history queries
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Upper bound accepted for history queries
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// Normalize a requested history limit: anything outside (0, 1000] becomes 50
pub fn clamp_history_limit(requested: i64) -> usize {
    usize::try_from(requested)
        .ok()
        .filter(|limit| (1..=MAX_HISTORY_LIMIT).contains(limit))
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
}

/// Unique session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a client-supplied identifier
    pub fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| AgentError::InvalidRequest(format!("bad session_id '{s}'")))
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A conversation session
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: SessionId,

    /// Display title (blank sessions have none)
    pub title: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last activity timestamp
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new session
    pub fn new(title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            title: title.filter(|t| !t.trim().is_empty()),
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the activity timestamp
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Durable record of one executed tool call
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub session_id: SessionId,

    /// 1-based position within a single agent run
    pub step_index: u32,

    pub tool_name: String,

    pub arguments: HashMap<String, serde_json::Value>,

    /// Extracted plain text, when the call produced any
    pub result_text: Option<String>,

    /// Full result payload as returned by the tool host
    pub raw: Option<serde_json::Value>,

    /// Empty on success
    pub error: String,

    pub created_at: DateTime<Utc>,
}

/// Append-only conversation log keyed by session
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create a session with an optional title
    async fn create_session(&self, title: Option<String>) -> Result<SessionId>;

    /// Fetch session metadata
    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>>;

    /// Update the last-activity timestamp. Best effort: failures are logged, not returned.
    async fn touch_session(&self, id: &SessionId);

    /// Append one message
    async fn save_message(
        &self,
        id: &SessionId,
        role: Role,
        content: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<()>;

    /// Append one tool invocation
    async fn save_tool_invocation(&self, invocation: &ToolInvocation) -> Result<()>;

    /// First `limit` user/assistant messages, oldest first, for replay to the model
    async fn load_history(&self, id: &SessionId, limit: i64) -> Result<Vec<Message>>;

    /// First `limit` messages of any role, oldest first
    async fn list_messages(&self, id: &SessionId, limit: i64) -> Result<Vec<Message>>;

    /// Tool invocations of a session, oldest first
    async fn list_tool_invocations(&self, id: &SessionId) -> Result<Vec<ToolInvocation>>;
}

#[derive(Default)]
struct SessionLog {
    session: Option<Session>,
    messages: Vec<Message>,
    invocations: Vec<ToolInvocation>,
}

/// In-memory conversation store (for development/testing)
pub struct MemoryConversationStore {
    sessions: RwLock<HashMap<SessionId, SessionLog>>,
}

impl Default for MemoryConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn poisoned<T>(_: T) -> AgentError {
        AgentError::Storage("session lock poisoned".into())
    }

    fn with_log<R>(&self, id: &SessionId, f: impl FnOnce(&mut SessionLog) -> R) -> Result<R> {
        let mut sessions = self.sessions.write().map_err(Self::poisoned)?;
        let log = sessions
            .get_mut(id)
            .filter(|log| log.session.is_some())
            .ok_or_else(|| AgentError::Session(format!("unknown session {id}")))?;
        Ok(f(log))
    }

    fn earliest(
        &self,
        id: &SessionId,
        limit: i64,
        keep: impl Fn(&Message) -> bool,
    ) -> Result<Vec<Message>> {
        let limit = clamp_history_limit(limit);
        let sessions = self.sessions.read().map_err(Self::poisoned)?;
        let Some(log) = sessions.get(id) else {
            return Ok(Vec::new());
        };
        Ok(log.messages.iter().filter(|m| keep(*m)).take(limit).cloned().collect())
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn create_session(&self, title: Option<String>) -> Result<SessionId> {
        let session = Session::new(title);
        let id = session.id.clone();
        let mut sessions = self.sessions.write().map_err(Self::poisoned)?;
        sessions.insert(
            id.clone(),
            SessionLog {
                session: Some(session),
                ..Default::default()
            },
        );
        Ok(id)
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        let sessions = self.sessions.read().map_err(Self::poisoned)?;
        Ok(sessions.get(id).and_then(|log| log.session.clone()))
    }

    async fn touch_session(&self, id: &SessionId) {
        if let Err(e) = self.with_log(id, |log| {
            if let Some(session) = log.session.as_mut() {
                session.touch();
            }
        }) {
            tracing::warn!(session = %id, error = %e, "Failed to touch session");
        }
    }

    async fn save_message(
        &self,
        id: &SessionId,
        role: Role,
        content: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut message = Message::new(role, content);
        message.payload = payload;
        self.with_log(id, |log| log.messages.push(message))
    }

    async fn save_tool_invocation(&self, invocation: &ToolInvocation) -> Result<()> {
        let session_id = invocation.session_id.clone();
        let invocation = invocation.clone();
        self.with_log(&session_id, |log| log.invocations.push(invocation))
    }

    async fn load_history(&self, id: &SessionId, limit: i64) -> Result<Vec<Message>> {
        self.earliest(id, limit, |m| m.role.is_conversational())
    }

    async fn list_messages(&self, id: &SessionId, limit: i64) -> Result<Vec<Message>> {
        self.earliest(id, limit, |_| true)
    }

    async fn list_tool_invocations(&self, id: &SessionId) -> Result<Vec<ToolInvocation>> {
        let sessions = self.sessions.read().map_err(Self::poisoned)?;
        Ok(sessions
            .get(id)
            .map(|log| log.invocations.clone())
            .unwrap_or_default())
    }
}
