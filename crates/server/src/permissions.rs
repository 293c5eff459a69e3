//! Suspended permission requests
//!
//! One entry per unresolved `(session id, tool-use id)`. Resolving an entry
//! removes it and completes the agent's pending callback; cancelling a
//! session sweeps all of its entries with a denial.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use cowork_protocol::PermissionResult;

#[derive(Debug)]
pub struct PendingPermission {
    pub tool_name: String,
    pub input: Value,
    reply: oneshot::Sender<PermissionResult>,
}

#[derive(Debug, Default)]
pub struct PendingPermissions {
    by_session: HashMap<String, HashMap<String, PendingPermission>>,
}

impl PendingPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        session_id: &str,
        tool_use_id: &str,
        tool_name: String,
        input: Value,
        reply: oneshot::Sender<PermissionResult>,
    ) {
        self.by_session
            .entry(session_id.to_string())
            .or_default()
            .insert(
                tool_use_id.to_string(),
                PendingPermission {
                    tool_name,
                    input,
                    reply,
                },
            );
    }

    /// Completes and removes one entry. Returns `false` for unknown ids.
    pub fn resolve(&mut self, session_id: &str, tool_use_id: &str, result: PermissionResult) -> bool {
        let Some(entries) = self.by_session.get_mut(session_id) else {
            return false;
        };
        let Some(pending) = entries.remove(tool_use_id) else {
            return false;
        };
        if entries.is_empty() {
            self.by_session.remove(session_id);
        }
        // The agent may have given up already; the entry is gone either way.
        let _ = pending.reply.send(result);
        true
    }

    /// Denies every outstanding entry for the session. Returns how many were swept.
    pub fn deny_all_for_session(&mut self, session_id: &str, message: &str) -> usize {
        let Some(entries) = self.by_session.remove(session_id) else {
            return 0;
        };
        let count = entries.len();
        for (tool_use_id, pending) in entries {
            debug!(
                component = "permissions",
                event = "permission.swept",
                session_id = %session_id,
                tool_use_id = %tool_use_id,
                tool_name = %pending.tool_name,
                input_bytes = pending.input.to_string().len(),
                "Denying unanswered permission request"
            );
            let _ = pending.reply.send(PermissionResult::deny(message));
        }
        count
    }

    /// Denies everything. Used on shutdown.
    pub fn deny_all(&mut self, message: &str) -> usize {
        let sessions: Vec<String> = self.by_session.keys().cloned().collect();
        sessions
            .iter()
            .map(|id| self.deny_all_for_session(id, message))
            .sum()
    }

    #[cfg(test)]
    pub fn contains(&self, session_id: &str, tool_use_id: &str) -> bool {
        self.by_session
            .get(session_id)
            .is_some_and(|entries| entries.contains_key(tool_use_id))
    }

    pub fn len(&self) -> usize {
        self.by_session.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }
}
