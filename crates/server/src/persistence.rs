//! Session store
//!
//! Durable record of sessions and their transcripts. The orchestrator owns
//! the store and calls it synchronously between suspension points, so a
//! single SQLite connection is enough.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::info;

use cowork_protocol::{SessionInfo, SessionStatus, StreamMessage};

use crate::migration_runner::run_migrations;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("message encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown session status in database: {0}")]
    CorruptStatus(String),
}

/// A persisted session row.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: String,
    pub title: String,
    pub status: SessionStatus,
    pub resume_token: Option<String>,
    pub cwd: Option<String>,
    /// Comma-separated, as received from the client.
    pub allowed_tools: Option<String>,
    pub last_prompt: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SessionRecord {
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            title: self.title.clone(),
            status: self.status,
            claude_session_id: self.resume_token.clone(),
            cwd: self.cwd.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: String,
    pub title: String,
    pub cwd: Option<String>,
    pub allowed_tools: Option<String>,
    pub last_prompt: Option<String>,
}

/// Field-wise update; `None` leaves a column untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub title: Option<String>,
    pub status: Option<SessionStatus>,
    pub resume_token: Option<String>,
    pub last_prompt: Option<String>,
}

pub trait SessionStore: Send {
    fn create(&mut self, new: NewSession, now: i64) -> Result<SessionRecord, StoreError>;

    fn get(&self, id: &str) -> Result<Option<SessionRecord>, StoreError>;

    /// Returns the updated record, or `None` if the session does not exist.
    fn update(
        &mut self,
        id: &str,
        update: SessionUpdate,
        now: i64,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Removes the session and its transcript. Returns whether it existed.
    fn delete(&mut self, id: &str) -> Result<bool, StoreError>;

    /// Most recently updated first.
    fn list(&self) -> Result<Vec<SessionRecord>, StoreError>;

    /// Appends to the transcript. Messages for unknown sessions are dropped.
    fn append_message(
        &mut self,
        id: &str,
        message: &StreamMessage,
        now: i64,
    ) -> Result<(), StoreError>;

    fn history(&self, id: &str) -> Result<Vec<StreamMessage>, StoreError>;

    /// Moves every `running` session back to `idle`. Returns the affected ids.
    fn reset_running(&mut self, now: i64) -> Result<Vec<String>, StoreError>;
}

pub struct SqliteSessionStore {
    conn: Connection,
}

const SESSION_COLUMNS: &str =
    "id, title, status, resume_token, cwd, allowed_tools, last_prompt, created_at, updated_at";

impl SqliteSessionStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut conn = Connection::open(path)?;
        run_migrations(&mut conn)?;
        info!(
            component = "persistence",
            event = "store.opened",
            path = %path.display(),
            "Session store opened"
        );
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        run_migrations(&mut conn)?;
        Ok(Self { conn })
    }
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<(SessionRecord, String)> {
    let status: String = row.get(2)?;
    Ok((
        SessionRecord {
            id: row.get(0)?,
            title: row.get(1)?,
            status: SessionStatus::Idle,
            resume_token: row.get(3)?,
            cwd: row.get(4)?,
            allowed_tools: row.get(5)?,
            last_prompt: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        },
        status,
    ))
}

fn with_status((mut record, status): (SessionRecord, String)) -> Result<SessionRecord, StoreError> {
    record.status = SessionStatus::parse(&status).ok_or(StoreError::CorruptStatus(status))?;
    Ok(record)
}

impl SessionStore for SqliteSessionStore {
    fn create(&mut self, new: NewSession, now: i64) -> Result<SessionRecord, StoreError> {
        self.conn.execute(
            "INSERT INTO sessions (id, title, status, cwd, allowed_tools, last_prompt, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                new.id,
                new.title,
                SessionStatus::Idle.as_str(),
                new.cwd,
                new.allowed_tools,
                new.last_prompt,
                now
            ],
        )?;
        Ok(SessionRecord {
            id: new.id,
            title: new.title,
            status: SessionStatus::Idle,
            resume_token: None,
            cwd: new.cwd,
            allowed_tools: new.allowed_tools,
            last_prompt: new.last_prompt,
            created_at: now,
            updated_at: now,
        })
    }

    fn get(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
                session_from_row,
            )
            .optional()?;
        row.map(with_status).transpose()
    }

    fn update(
        &mut self,
        id: &str,
        update: SessionUpdate,
        now: i64,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let changed = self.conn.execute(
            "UPDATE sessions SET
                title = COALESCE(?2, title),
                status = COALESCE(?3, status),
                resume_token = COALESCE(?4, resume_token),
                last_prompt = COALESCE(?5, last_prompt),
                updated_at = ?6
             WHERE id = ?1",
            params![
                id,
                update.title,
                update.status.map(|s| s.as_str()),
                update.resume_token,
                update.last_prompt,
                now
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        self.get(id)
    }

    fn delete(&mut self, id: &str) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM messages WHERE session_id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY updated_at DESC, created_at DESC"
        ))?;
        let rows = stmt
            .query_map([], session_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(with_status).collect()
    }

    fn append_message(
        &mut self,
        id: &str,
        message: &StreamMessage,
        now: i64,
    ) -> Result<(), StoreError> {
        let data = serde_json::to_string(message)?;
        self.conn.execute(
            "INSERT INTO messages (session_id, seq, data, created_at)
             SELECT ?1, COALESCE((SELECT MAX(seq) FROM messages WHERE session_id = ?1), 0) + 1, ?2, ?3
             WHERE EXISTS (SELECT 1 FROM sessions WHERE id = ?1)",
            params![id, data, now],
        )?;
        Ok(())
    }

    fn history(&self, id: &str) -> Result<Vec<StreamMessage>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT data FROM messages WHERE session_id = ?1 ORDER BY seq ASC")?;
        let rows = stmt
            .query_map(params![id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.iter()
            .map(|data| serde_json::from_str(data).map_err(StoreError::from))
            .collect()
    }

    fn reset_running(&mut self, now: i64) -> Result<Vec<String>, StoreError> {
        let ids = {
            let mut stmt = self
                .conn
                .prepare("SELECT id FROM sessions WHERE status = ?1")?;
            let ids = stmt
                .query_map(params![SessionStatus::Running.as_str()], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            ids
        };
        if !ids.is_empty() {
            self.conn.execute(
                "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE status = ?3",
                params![
                    SessionStatus::Idle.as_str(),
                    now,
                    SessionStatus::Running.as_str()
                ],
            )?;
        }
        Ok(ids)
    }
}
