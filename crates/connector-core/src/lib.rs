//! Cowork Connector Core
//!
//! The contract between the orchestrator and an agent backend. A connector
//! runs one invocation per call to [`AgentService::invoke`], yields typed
//! [`AgentEvent`]s until the agent finishes, and asks the orchestrator for a
//! decision through a [`PermissionHandler`] whenever a tool needs approval.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use cowork_protocol::{McpServer, PermissionResult};

/// Errors that can occur in connectors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    #[error("Process communication error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Invocation cancelled")]
    Cancelled,
}

/// Events yielded by one agent invocation
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The agent opened (or resumed) a conversation; the token resumes it later.
    Initialized { resume_token: String, message: Value },

    /// A complete message that belongs in the transcript.
    Message(Value),

    /// A streaming delta, superseded by a later `Message`.
    Partial(Value),

    /// Terminal marker for the invocation.
    Finished {
        success: bool,
        error: Option<String>,
        message: Value,
    },
}

impl AgentEvent {
    /// Classify a raw agent JSON message by its `type` / `subtype` fields.
    pub fn from_raw(raw: Value) -> Self {
        let msg_type = raw.get("type").and_then(Value::as_str).unwrap_or("");
        let subtype = raw.get("subtype").and_then(Value::as_str).unwrap_or("");

        match (msg_type, subtype) {
            ("system", "init") => match raw.get("session_id").and_then(Value::as_str) {
                Some(token) if !token.is_empty() => AgentEvent::Initialized {
                    resume_token: token.to_string(),
                    message: raw,
                },
                _ => AgentEvent::Message(raw),
            },
            ("stream_event", _) => AgentEvent::Partial(raw),
            ("result", _) => {
                let success = subtype == "success" && !is_error_flag(&raw);
                let error = if success {
                    None
                } else {
                    Some(result_error_text(&raw, subtype))
                };
                AgentEvent::Finished {
                    success,
                    error,
                    message: raw,
                }
            }
            _ => AgentEvent::Message(raw),
        }
    }

    /// The raw JSON message as the agent produced it.
    pub fn message(&self) -> &Value {
        match self {
            AgentEvent::Initialized { message, .. }
            | AgentEvent::Finished { message, .. }
            | AgentEvent::Message(message)
            | AgentEvent::Partial(message) => message,
        }
    }

    pub fn into_message(self) -> Value {
        match self {
            AgentEvent::Initialized { message, .. }
            | AgentEvent::Finished { message, .. }
            | AgentEvent::Message(message)
            | AgentEvent::Partial(message) => message,
        }
    }
}

fn is_error_flag(raw: &Value) -> bool {
    raw.get("is_error").and_then(Value::as_bool).unwrap_or(false)
}

fn result_error_text(raw: &Value, subtype: &str) -> String {
    if let Some(text) = raw.get("result").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return text.to_string();
        }
    }
    if let Some(errors) = raw.get("errors").and_then(Value::as_array) {
        let joined: Vec<&str> = errors.iter().filter_map(Value::as_str).collect();
        if !joined.is_empty() {
            return joined.join("; ");
        }
    }
    if subtype.is_empty() {
        "Agent run failed".to_string()
    } else {
        format!("Agent run failed: {subtype}")
    }
}

/// Everything an agent needs to run one prompt.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub prompt: String,
    pub cwd: String,
    /// Continue this conversation instead of starting a fresh one.
    pub resume_token: Option<String>,
    pub allowed_tools: Vec<String>,
    pub mcp_servers: Vec<McpServer>,
    /// Fired when the orchestrator aborts the invocation.
    pub cancel: CancellationToken,
}

/// Answers tool authorization requests raised mid-invocation.
pub trait PermissionHandler: Send + Sync {
    fn can_use_tool(&self, tool_name: String, input: Value) -> BoxFuture<'static, PermissionResult>;
}

pub type AgentStream = BoxStream<'static, Result<AgentEvent, ConnectorError>>;

/// An agent backend.
pub trait AgentService: Send + Sync {
    /// Start one invocation. The stream ends after `AgentEvent::Finished`,
    /// on error, or promptly after `request.cancel` fires.
    fn invoke(
        &self,
        request: InvocationRequest,
        permissions: std::sync::Arc<dyn PermissionHandler>,
    ) -> AgentStream;
}

/// Split a comma-separated tool list, dropping blanks.
pub fn parse_tool_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|tool| !tool.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_message_carries_resume_token() {
        let raw = json!({"type": "system", "subtype": "init", "session_id": "abc", "model": "x"});
        match AgentEvent::from_raw(raw.clone()) {
            AgentEvent::Initialized {
                resume_token,
                message,
            } => {
                assert_eq!(resume_token, "abc");
                assert_eq!(message, raw);
            }
            other => panic!("expected Initialized, got {:?}", other),
        }
    }

    #[test]
    fn init_without_session_id_is_plain_message() {
        let raw = json!({"type": "system", "subtype": "init"});
        assert_eq!(AgentEvent::from_raw(raw.clone()), AgentEvent::Message(raw));
    }

    #[test]
    fn stream_events_are_partial() {
        let raw = json!({"type": "stream_event", "event": {"type": "content_block_delta"}});
        assert!(matches!(AgentEvent::from_raw(raw), AgentEvent::Partial(_)));
    }

    #[test]
    fn success_result_finishes_cleanly() {
        let raw = json!({"type": "result", "subtype": "success", "result": "done"});
        match AgentEvent::from_raw(raw) {
            AgentEvent::Finished { success, error, .. } => {
                assert!(success);
                assert!(error.is_none());
            }
            other => panic!("expected Finished, got {:?}", other),
        }
    }

    #[test]
    fn failed_result_reports_subtype() {
        let raw = json!({"type": "result", "subtype": "error_max_turns"});
        match AgentEvent::from_raw(raw) {
            AgentEvent::Finished { success, error, .. } => {
                assert!(!success);
                assert_eq!(error.as_deref(), Some("Agent run failed: error_max_turns"));
            }
            other => panic!("expected Finished, got {:?}", other),
        }
    }

    #[test]
    fn success_subtype_with_error_flag_is_failure() {
        let raw = json!({"type": "result", "subtype": "success", "is_error": true, "result": "API Error: 500"});
        match AgentEvent::from_raw(raw) {
            AgentEvent::Finished { success, error, .. } => {
                assert!(!success);
                assert_eq!(error.as_deref(), Some("API Error: 500"));
            }
            other => panic!("expected Finished, got {:?}", other),
        }
    }

    #[test]
    fn assistant_messages_pass_through() {
        let raw = json!({"type": "assistant", "message": {"content": []}});
        let event = AgentEvent::from_raw(raw.clone());
        assert_eq!(event.message(), &raw);
        assert_eq!(event.into_message(), raw);
    }

    #[test]
    fn tool_list_parsing_drops_blanks() {
        assert_eq!(
            parse_tool_list(Some(" Read, Edit ,,Bash")),
            vec!["Read".to_string(), "Edit".to_string(), "Bash".to_string()]
        );
        assert!(parse_tool_list(None).is_empty());
    }
}
