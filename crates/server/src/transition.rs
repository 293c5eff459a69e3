//! Pure session status transitions
//!
//! `idle → running → {completed, error}`, plus `running → idle` on stop.
//! Restart reconciliation (`running → idle`) is done in bulk by the store.
//! Completion is only reachable through `running`. No IO here; the
//! orchestrator asks this module what the next status is and applies it.

use cowork_protocol::SessionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    /// A new invocation begins (start, continue, or task promotion).
    Run,
    /// The live invocation was stopped by the user or a task cancel.
    Stop,
    /// The live invocation settled on its own.
    Settled { success: bool },
}

/// Next status, or `None` when the input does not apply in `current`.
pub fn next_status(current: SessionStatus, input: Input) -> Option<SessionStatus> {
    use SessionStatus::*;

    match (current, input) {
        (Idle | Completed | Error, Input::Run) => Some(Running),
        (Running, Input::Run) => None,

        (Running, Input::Stop) => Some(Idle),
        (_, Input::Stop) => None,

        (Running, Input::Settled { success: true }) => Some(Completed),
        (Running, Input::Settled { success: false }) => Some(Error),
        (_, Input::Settled { .. }) => None,
    }
}
