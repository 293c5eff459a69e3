//! Server → Client messages

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::*;

/// Events broadcast from the orchestrator to every connected observer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    // Streaming
    #[serde(rename = "stream.message", rename_all = "camelCase")]
    StreamMessage {
        session_id: String,
        message: StreamMessage,
    },
    #[serde(rename = "stream.user_prompt", rename_all = "camelCase")]
    StreamUserPrompt { session_id: String, prompt: String },

    // Session lifecycle
    #[serde(rename = "session.status", rename_all = "camelCase")]
    SessionStatus {
        session_id: String,
        status: SessionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "session.list")]
    SessionList { sessions: Vec<SessionInfo> },
    #[serde(rename = "session.history", rename_all = "camelCase")]
    SessionHistory {
        session_id: String,
        status: SessionStatus,
        messages: Vec<StreamMessage>,
    },
    #[serde(rename = "session.deleted", rename_all = "camelCase")]
    SessionDeleted { session_id: String },

    // Permissions
    #[serde(rename = "permission.request", rename_all = "camelCase")]
    PermissionRequest {
        session_id: String,
        tool_use_id: String,
        tool_name: String,
        input: Value,
    },

    // Errors
    #[serde(rename = "runner.error", rename_all = "camelCase")]
    RunnerError {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
    },

    // Diff capture
    #[serde(rename = "tool.write_before", rename_all = "camelCase")]
    ToolWriteBefore {
        session_id: String,
        file_path: String,
        /// `None` when the file does not exist yet
        before_content: Option<String>,
    },

    // Task queue
    #[serde(rename = "task.list")]
    TaskList { tasks: Vec<QueuedTask> },
    #[serde(rename = "task.added")]
    TaskAdded { task: QueuedTask },
    #[serde(rename = "task.updated")]
    TaskUpdated { task: QueuedTask },
    #[serde(rename = "task.removed", rename_all = "camelCase")]
    TaskRemoved { task_id: String },
    #[serde(rename = "task.completed")]
    TaskCompleted { task: QueuedTask },

    // Settings
    #[serde(rename = "settings.loaded")]
    SettingsLoaded { settings: CoworkSettings },
    #[serde(rename = "settings.updated")]
    SettingsUpdated { settings: CoworkSettings },
}

impl ServerMessage {
    /// The session this event concerns, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::StreamMessage { session_id, .. }
            | ServerMessage::StreamUserPrompt { session_id, .. }
            | ServerMessage::SessionStatus { session_id, .. }
            | ServerMessage::SessionHistory { session_id, .. }
            | ServerMessage::SessionDeleted { session_id }
            | ServerMessage::PermissionRequest { session_id, .. }
            | ServerMessage::ToolWriteBefore { session_id, .. } => Some(session_id),
            ServerMessage::RunnerError { session_id, .. } => session_id.as_deref(),
            ServerMessage::SessionList { .. }
            | ServerMessage::TaskList { .. }
            | ServerMessage::TaskAdded { .. }
            | ServerMessage::TaskUpdated { .. }
            | ServerMessage::TaskRemoved { .. }
            | ServerMessage::TaskCompleted { .. }
            | ServerMessage::SettingsLoaded { .. }
            | ServerMessage::SettingsUpdated { .. } => None,
        }
    }
}
