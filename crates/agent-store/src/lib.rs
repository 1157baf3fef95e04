//! # agent-store
//!
//! SQLite-backed [`ConversationStore`].
//!
//! A single connection lives behind `Arc<Mutex<_>>`; every statement runs on
//! the blocking pool so the async runtime never waits on disk. The schema is
//! created on open.
//!
//! ```text
//! chat_sessions ──< chat_messages
//!       └────────< tool_invocations        (ON DELETE CASCADE)
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex};

use agent_core::{
    error::{AgentError, Result},
    message::{Message, Role},
    session::{ConversationStore, Session, SessionId, ToolInvocation, clamp_history_limit},
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS chat_sessions (
    id          TEXT PRIMARY KEY,
    title       TEXT,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chat_messages (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
    role        TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'tool', 'system')),
    content     TEXT NOT NULL DEFAULT '',
    raw         TEXT,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chat_messages_session_created
    ON chat_messages(session_id, created_at);

CREATE TABLE IF NOT EXISTS tool_invocations (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL REFERENCES chat_sessions(id) ON DELETE CASCADE,
    step_index  INTEGER NOT NULL,
    tool_name   TEXT NOT NULL,
    args        TEXT,
    result_text TEXT,
    raw         TEXT,
    error       TEXT NOT NULL DEFAULT '',
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tool_invocations_session_created
    ON tool_invocations(session_id, created_at);
";

/// Fixed-width UTC timestamps so that text ordering is time ordering
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| AgentError::Parse(format!("bad stored timestamp '{raw}': {e}")))
}

fn parse_json(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    raw.map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(|e| AgentError::Parse(format!("bad stored json: {e}")))
}

fn storage_error(e: rusqlite::Error) -> AgentError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &e {
        if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
            return AgentError::Session("unknown session".into());
        }
    }
    AgentError::Storage(e.to_string())
}

struct MessageRow {
    role: String,
    content: String,
    raw: Option<String>,
    created_at: String,
}

impl MessageRow {
    fn into_message(self) -> Result<Message> {
        let role: Role = self.role.parse()?;
        let mut message = Message::new(role, self.content).at(parse_timestamp(&self.created_at)?);
        message.payload = parse_json(self.raw)?;
        Ok(message)
    }
}

/// SQLite conversation store
#[derive(Clone)]
pub struct SqliteConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConversationStore {
    /// Open (or create) the database at `path` and bootstrap the schema.
    /// `:memory:` gives a private in-memory database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn =
            tokio::task::spawn_blocking(move || Connection::open(&path).and_then(Self::prepare))
                .await
                .map_err(|e| AgentError::Storage(format!("Failed to spawn blocking task: {e}")))?
                .map_err(storage_error)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    fn prepare(conn: Connection) -> rusqlite::Result<Connection> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(conn)
    }

    async fn run_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| AgentError::Storage("connection lock poisoned".into()))?;
            f(&mut conn).map_err(storage_error)
        })
        .await
        .map_err(|e| AgentError::Storage(format!("Task execution failed: {e}")))?
    }

    async fn earliest_messages(
        &self,
        id: &SessionId,
        limit: i64,
        conversational_only: bool,
    ) -> Result<Vec<Message>> {
        let session_id = id.to_string();
        let limit = i64::try_from(clamp_history_limit(limit)).unwrap_or(i64::MAX);
        let roles = if conversational_only {
            "('user', 'assistant')"
        } else {
            "('user', 'assistant', 'tool', 'system')"
        };
        let sql = format!(
            "SELECT role, content, raw, created_at
             FROM chat_messages
             WHERE session_id = ?1 AND role IN {roles}
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?2"
        );

        let rows = self
            .run_blocking(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![session_id, limit], |row| {
                    Ok(MessageRow {
                        role: row.get(0)?,
                        content: row.get(1)?,
                        raw: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        rows.into_iter().map(MessageRow::into_message).collect()
    }
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    async fn create_session(&self, title: Option<String>) -> Result<SessionId> {
        let session = Session::new(title);
        let id = session.id.clone();
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO chat_sessions (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    session.id.to_string(),
                    session.title,
                    timestamp(session.created_at),
                    timestamp(session.updated_at)
                ],
            )
        })
        .await?;
        Ok(id)
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>> {
        let key = id.to_string();
        let row = self
            .run_blocking(move |conn| {
                conn.query_row(
                    "SELECT title, created_at, updated_at FROM chat_sessions WHERE id = ?1",
                    params![key],
                    |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()
            })
            .await?;

        row.map(|(title, created_at, updated_at)| {
            Ok(Session {
                id: id.clone(),
                title,
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&updated_at)?,
            })
        })
        .transpose()
    }

    async fn touch_session(&self, id: &SessionId) {
        let key = id.to_string();
        let now = timestamp(Utc::now());
        let outcome = self
            .run_blocking(move |conn| {
                conn.execute(
                    "UPDATE chat_sessions SET updated_at = ?1 WHERE id = ?2",
                    params![now, key],
                )
            })
            .await;
        match outcome {
            Ok(0) => tracing::warn!(session = %id, "Touched unknown session"),
            Ok(_) => {}
            Err(e) => tracing::warn!(session = %id, error = %e, "Failed to touch session"),
        }
    }

    async fn save_message(
        &self,
        id: &SessionId,
        role: Role,
        content: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<()> {
        let session_id = id.to_string();
        let content = content.to_string();
        let raw = payload.map(|p| p.to_string());
        let now = timestamp(Utc::now());
        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO chat_messages (id, session_id, role, content, raw, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    session_id,
                    role.as_str(),
                    content,
                    raw,
                    now
                ],
            )
        })
        .await
        .map(|_| ())
    }

    async fn save_tool_invocation(&self, invocation: &ToolInvocation) -> Result<()> {
        let session_id = invocation.session_id.to_string();
        let step_index = invocation.step_index;
        let tool_name = invocation.tool_name.clone();
        let args = serde_json::to_string(&invocation.arguments)?;
        let result_text = invocation.result_text.clone();
        let raw = invocation.raw.as_ref().map(serde_json::Value::to_string);
        let error = invocation.error.clone();
        let created_at = timestamp(invocation.created_at);

        self.run_blocking(move |conn| {
            conn.execute(
                "INSERT INTO tool_invocations
                     (id, session_id, step_index, tool_name, args, result_text, raw, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    session_id,
                    step_index,
                    tool_name,
                    args,
                    result_text,
                    raw,
                    error,
                    created_at
                ],
            )
        })
        .await
        .map(|_| ())
    }

    async fn load_history(&self, id: &SessionId, limit: i64) -> Result<Vec<Message>> {
        self.earliest_messages(id, limit, true).await
    }

    async fn list_messages(&self, id: &SessionId, limit: i64) -> Result<Vec<Message>> {
        self.earliest_messages(id, limit, false).await
    }

    async fn list_tool_invocations(&self, id: &SessionId) -> Result<Vec<ToolInvocation>> {
        let key = id.to_string();
        let rows = self
            .run_blocking(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT step_index, tool_name, args, result_text, raw, error, created_at
                     FROM tool_invocations
                     WHERE session_id = ?1
                     ORDER BY created_at ASC, rowid ASC",
                )?;
                let rows = stmt.query_map(params![key], |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        rows.into_iter()
            .map(|row| -> Result<ToolInvocation> {
                let (step_index, tool_name, args, result_text, raw, error, created_at) = row;
                let arguments = match parse_json(args)? {
                    Some(value) => serde_json::from_value(value)?,
                    None => std::collections::HashMap::new(),
                };
                Ok(ToolInvocation {
                    session_id: id.clone(),
                    step_index,
                    tool_name,
                    arguments,
                    result_text,
                    raw: parse_json(raw)?,
                    error,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }
}
