//! Session runs
//!
//! A run is one agent invocation for one session. It is driven by its own
//! tokio task which forwards everything into the orchestrator's runner
//! channel tagged with `(session_id, run_id)`, so events from a superseded
//! run can be recognised and dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cowork_connector_core::{
    AgentEvent, AgentService, AgentStream, InvocationRequest, PermissionHandler,
};
use cowork_protocol::{McpServer, PermissionResult};

use crate::clock::IdGenerator;

pub type RunId = u64;

/// Denial text used whenever a run ends with questions unanswered.
pub const ABORTED_MESSAGE: &str = "Session aborted";

const WRITE_TOOL: &str = "Write";

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    /// The run's own cancellation token fired.
    Cancelled,
}

#[derive(Debug)]
pub enum RunnerEvent {
    Agent {
        session_id: String,
        run_id: RunId,
        event: AgentEvent,
    },
    PermissionRequested {
        session_id: String,
        run_id: RunId,
        tool_use_id: String,
        tool_name: String,
        input: Value,
        reply: oneshot::Sender<PermissionResult>,
    },
    /// The `Write` tool is about to run; `ack` fires once observers have the
    /// prior content.
    WriteBefore {
        session_id: String,
        run_id: RunId,
        file_path: String,
        before_content: Option<String>,
        ack: oneshot::Sender<()>,
    },
    Finished {
        session_id: String,
        run_id: RunId,
        outcome: RunOutcome,
    },
}

impl RunnerEvent {
    pub fn session_id(&self) -> &str {
        match self {
            RunnerEvent::Agent { session_id, .. }
            | RunnerEvent::PermissionRequested { session_id, .. }
            | RunnerEvent::WriteBefore { session_id, .. }
            | RunnerEvent::Finished { session_id, .. } => session_id,
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            RunnerEvent::Agent { run_id, .. }
            | RunnerEvent::PermissionRequested { run_id, .. }
            | RunnerEvent::WriteBefore { run_id, .. }
            | RunnerEvent::Finished { run_id, .. } => *run_id,
        }
    }
}

/// Everything needed to start one run.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub session_id: String,
    pub run_id: RunId,
    pub prompt: String,
    pub cwd: String,
    pub resume_token: Option<String>,
    pub allowed_tools: Vec<String>,
    pub mcp_servers: Vec<McpServer>,
}

/// Orchestrator-side handle of a live run.
#[derive(Debug)]
pub struct LiveRun {
    pub run_id: RunId,
    cancel: CancellationToken,
}

impl LiveRun {
    /// Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Shared context handed to every run's permission handler.
#[derive(Clone)]
pub struct RunContext {
    pub interactive_tools: Arc<Vec<String>>,
    pub ids: Arc<dyn IdGenerator>,
    pub events: mpsc::UnboundedSender<RunnerEvent>,
}

pub fn spawn_run(agent: &Arc<dyn AgentService>, params: RunParams, ctx: &RunContext) -> LiveRun {
    let cancel = CancellationToken::new();
    let permissions = Arc::new(RunPermissions {
        session_id: params.session_id.clone(),
        run_id: params.run_id,
        cwd: PathBuf::from(&params.cwd),
        ctx: ctx.clone(),
        cancel: cancel.clone(),
    });

    info!(
        component = "runner",
        event = "run.started",
        session_id = %params.session_id,
        run_id = params.run_id,
        resumed = params.resume_token.is_some(),
        cwd = %params.cwd,
        "Starting agent run"
    );

    let request = InvocationRequest {
        prompt: params.prompt,
        cwd: params.cwd,
        resume_token: params.resume_token,
        allowed_tools: params.allowed_tools,
        mcp_servers: params.mcp_servers,
        cancel: cancel.clone(),
    };
    let stream = agent.invoke(request, permissions);
    tokio::spawn(drive_run(
        stream,
        params.session_id,
        params.run_id,
        cancel.clone(),
        ctx.events.clone(),
    ));

    LiveRun {
        run_id: params.run_id,
        cancel,
    }
}

async fn drive_run(
    mut stream: AgentStream,
    session_id: String,
    run_id: RunId,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<RunnerEvent>,
) {
    let outcome = loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break RunOutcome::Cancelled,
            item = stream.next() => item,
        };

        match item {
            Some(Ok(event)) => {
                let settled = match &event {
                    AgentEvent::Finished { success: true, .. } => Some(RunOutcome::Completed),
                    AgentEvent::Finished { error, .. } => Some(RunOutcome::Failed(
                        error.clone().unwrap_or_else(|| "Agent run failed".to_string()),
                    )),
                    _ => None,
                };
                let forwarded = events.send(RunnerEvent::Agent {
                    session_id: session_id.clone(),
                    run_id,
                    event,
                });
                if forwarded.is_err() {
                    // Orchestrator is gone.
                    return;
                }
                if let Some(outcome) = settled {
                    break outcome;
                }
            }
            Some(Err(e)) if cancel.is_cancelled() => {
                debug!(
                    component = "runner",
                    event = "run.error_after_cancel",
                    session_id = %session_id,
                    run_id = run_id,
                    error = %e,
                    "Ignoring agent error raised by cancellation"
                );
                break RunOutcome::Cancelled;
            }
            Some(Err(e)) => break RunOutcome::Failed(e.to_string()),
            None if cancel.is_cancelled() => break RunOutcome::Cancelled,
            None => break RunOutcome::Completed,
        }
    };

    info!(
        component = "runner",
        event = "run.settled",
        session_id = %session_id,
        run_id = run_id,
        outcome = ?outcome,
        "Agent run settled"
    );
    let _ = events.send(RunnerEvent::Finished {
        session_id,
        run_id,
        outcome,
    });
}

/// Tool authorization for one run.
///
/// `Write` first publishes the file's prior content and waits until the
/// orchestrator has broadcast it. Interactive tools then suspend on a
/// `permission.response`; everything else is approved unchanged.
struct RunPermissions {
    session_id: String,
    run_id: RunId,
    cwd: PathBuf,
    ctx: RunContext,
    cancel: CancellationToken,
}

impl PermissionHandler for RunPermissions {
    fn can_use_tool(&self, tool_name: String, input: Value) -> BoxFuture<'static, PermissionResult> {
        let session_id = self.session_id.clone();
        let run_id = self.run_id;
        let cwd = self.cwd.clone();
        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();

        async move {
            if tool_name == WRITE_TOOL {
                if let Some(file_path) = input.get("file_path").and_then(Value::as_str) {
                    let before_content = read_before_content(&cwd, file_path).await;
                    let (ack, acked) = oneshot::channel();
                    let sent = ctx.events.send(RunnerEvent::WriteBefore {
                        session_id: session_id.clone(),
                        run_id,
                        file_path: file_path.to_string(),
                        before_content,
                        ack,
                    });
                    if sent.is_err() {
                        return PermissionResult::deny(ABORTED_MESSAGE);
                    }
                    // A dropped ack means the run was superseded before the
                    // prior content was broadcast.
                    tokio::select! {
                        acked = acked => {
                            if acked.is_err() {
                                return PermissionResult::deny(ABORTED_MESSAGE);
                            }
                        }
                        _ = cancel.cancelled() => return PermissionResult::deny(ABORTED_MESSAGE),
                    }
                }
            }

            if !ctx.interactive_tools.iter().any(|t| t == &tool_name) {
                return PermissionResult::allow(input);
            }

            let tool_use_id = ctx.ids.next_id();
            let (reply, decision) = oneshot::channel();
            let sent = ctx.events.send(RunnerEvent::PermissionRequested {
                session_id,
                run_id,
                tool_use_id,
                tool_name,
                input,
                reply,
            });
            if sent.is_err() {
                return PermissionResult::deny(ABORTED_MESSAGE);
            }

            tokio::select! {
                result = decision => result.unwrap_or_else(|_| PermissionResult::deny(ABORTED_MESSAGE)),
                _ = cancel.cancelled() => PermissionResult::deny(ABORTED_MESSAGE),
            }
        }
        .boxed()
    }
}

/// Best-effort: unreadable or missing files count as "no prior content".
async fn read_before_content(cwd: &Path, file_path: &str) -> Option<String> {
    let path = cwd.join(file_path);
    tokio::fs::read_to_string(&path).await.ok()
}
