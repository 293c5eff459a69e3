//! Client → Server messages

use serde::{Deserialize, Serialize};

use crate::types::{PermissionResult, SettingsPatch};

/// Commands sent from a UI surface to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    // Sessions
    #[serde(rename = "session.start", rename_all = "camelCase")]
    SessionStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        /// Comma-separated tool names
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowed_tools: Option<String>,
    },
    #[serde(rename = "session.continue", rename_all = "camelCase")]
    SessionContinue { session_id: String, prompt: String },
    #[serde(rename = "session.stop", rename_all = "camelCase")]
    SessionStop { session_id: String },
    #[serde(rename = "session.delete", rename_all = "camelCase")]
    SessionDelete { session_id: String },
    #[serde(rename = "session.list")]
    SessionList,
    #[serde(rename = "session.history", rename_all = "camelCase")]
    SessionHistory { session_id: String },

    // Permissions
    #[serde(rename = "permission.response", rename_all = "camelCase")]
    PermissionResponse {
        session_id: String,
        tool_use_id: String,
        result: PermissionResult,
    },

    // Task queue
    #[serde(rename = "task.queue")]
    TaskQueue { prompt: String, cwd: String },
    #[serde(rename = "task.cancel", rename_all = "camelCase")]
    TaskCancel { task_id: String },
    #[serde(rename = "task.list")]
    TaskList,

    // Settings
    #[serde(rename = "settings.get")]
    SettingsGet,
    #[serde(rename = "settings.update")]
    SettingsUpdate { settings: SettingsPatch },
    #[serde(rename = "settings.toggleMCP", rename_all = "camelCase")]
    SettingsToggleMcp { server_id: String, enabled: bool },
    #[serde(rename = "settings.toggleSkill", rename_all = "camelCase")]
    SettingsToggleSkill { skill_id: String, enabled: bool },
}

impl ClientMessage {
    /// The wire `type` of this command, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::SessionStart { .. } => "session.start",
            ClientMessage::SessionContinue { .. } => "session.continue",
            ClientMessage::SessionStop { .. } => "session.stop",
            ClientMessage::SessionDelete { .. } => "session.delete",
            ClientMessage::SessionList => "session.list",
            ClientMessage::SessionHistory { .. } => "session.history",
            ClientMessage::PermissionResponse { .. } => "permission.response",
            ClientMessage::TaskQueue { .. } => "task.queue",
            ClientMessage::TaskCancel { .. } => "task.cancel",
            ClientMessage::TaskList => "task.list",
            ClientMessage::SettingsGet => "settings.get",
            ClientMessage::SettingsUpdate { .. } => "settings.update",
            ClientMessage::SettingsToggleMcp { .. } => "settings.toggleMCP",
            ClientMessage::SettingsToggleSkill { .. } => "settings.toggleSkill",
        }
    }
}
