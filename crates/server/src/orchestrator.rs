//! Orchestrator
//!
//! Owns the task queue, the live-run map, the pending-permission table and
//! the session store. All mutation happens synchronously inside
//! [`Orchestrator::handle_client_message`] and
//! [`Orchestrator::handle_runner_event`]; the actor in `actor.rs` calls them
//! one at a time, so no locking is needed.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use cowork_connector_core::{parse_tool_list, AgentEvent, AgentService};
use cowork_protocol::{
    ClientMessage, CoworkSettings, PermissionResult, QueuedTask, ServerMessage, SessionStatus,
    SettingsPatch, StreamMessage, TaskStatus,
};

use crate::broadcaster::Broadcaster;
use crate::clock::{Clock, IdGenerator};
use crate::permissions::PendingPermissions;
use crate::persistence::{NewSession, SessionRecord, SessionStore, SessionUpdate, StoreError};
use crate::runner::{
    spawn_run, LiveRun, RunContext, RunId, RunOutcome, RunParams, RunnerEvent, ABORTED_MESSAGE,
};
use crate::session_naming::session_title;
use crate::settings::{enabled_mcp_servers, SettingsError, SettingsManager};
use crate::task_queue::TaskQueue;
use crate::transition::{next_status, Input};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Unknown session")]
    UnknownSession { session_id: String },

    #[error("Session has no resume id yet.")]
    NoResumeToken { session_id: String },

    #[error("Session already has a running agent.")]
    SessionBusy { session_id: String },

    #[error("session store error: {0}")]
    Store(#[from] StoreError),

    #[error("settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("orchestrator is not running")]
    Unavailable,
}

impl OrchestratorError {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            OrchestratorError::UnknownSession { session_id }
            | OrchestratorError::NoResumeToken { session_id }
            | OrchestratorError::SessionBusy { session_id } => Some(session_id),
            OrchestratorError::Store(_)
            | OrchestratorError::Settings(_)
            | OrchestratorError::Unavailable => None,
        }
    }

    /// The `runner.error` event reporting this failure.
    pub fn to_server_message(&self) -> ServerMessage {
        ServerMessage::RunnerError {
            session_id: self.session_id().map(str::to_string),
            message: self.to_string(),
        }
    }
}

/// Collaborators the orchestrator is built from.
pub struct OrchestratorDeps {
    pub store: Box<dyn SessionStore>,
    pub agent: Arc<dyn AgentService>,
    pub settings: SettingsManager,
    pub broadcaster: Broadcaster,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    /// Tools that wait for a `permission.response` instead of auto-approval.
    pub interactive_tools: Vec<String>,
}

/// Lock-free view published by the actor for `/health`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorSnapshot {
    pub running_tasks: usize,
    pub queued_tasks: usize,
    pub max_concurrent_tasks: usize,
    pub live_runs: usize,
    pub pending_permissions: usize,
    pub observers: usize,
}

pub struct Orchestrator {
    store: Box<dyn SessionStore>,
    agent: Arc<dyn AgentService>,
    settings_manager: SettingsManager,
    settings: CoworkSettings,
    broadcaster: Broadcaster,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    queue: TaskQueue,
    runs: HashMap<String, LiveRun>,
    permissions: PendingPermissions,
    run_ctx: RunContext,
    next_run_id: RunId,
}

impl Orchestrator {
    /// Builds the orchestrator and reconciles sessions left `running` by a
    /// previous process. Runner events arrive on the returned receiver and
    /// must be fed back through [`Orchestrator::handle_runner_event`].
    pub fn new(
        deps: OrchestratorDeps,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RunnerEvent>), OrchestratorError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let settings = deps.settings.load();
        let mut orchestrator = Self {
            store: deps.store,
            agent: deps.agent,
            settings_manager: deps.settings,
            queue: TaskQueue::new(settings.preferences.max_concurrent_tasks),
            settings,
            broadcaster: deps.broadcaster,
            clock: deps.clock.clone(),
            ids: deps.ids.clone(),
            runs: HashMap::new(),
            permissions: PendingPermissions::new(),
            run_ctx: RunContext {
                interactive_tools: Arc::new(deps.interactive_tools),
                ids: deps.ids,
                events: events_tx,
            },
            next_run_id: 1,
        };
        orchestrator.reconcile()?;
        Ok((orchestrator, events_rx))
    }

    fn reconcile(&mut self) -> Result<(), OrchestratorError> {
        let reset = self.store.reset_running(self.clock.now_ms())?;
        if !reset.is_empty() {
            info!(
                component = "orchestrator",
                event = "sessions.reconciled",
                count = reset.len(),
                session_ids = ?reset,
                "Reset sessions left running by a previous process"
            );
        }
        Ok(())
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn snapshot(&self) -> OrchestratorSnapshot {
        OrchestratorSnapshot {
            running_tasks: self.queue.running_len(),
            queued_tasks: self.queue.waiting_len(),
            max_concurrent_tasks: self.queue.max_concurrent(),
            live_runs: self.runs.len(),
            pending_permissions: self.permissions.len(),
            observers: self.broadcaster.observer_count(),
        }
    }

    // -----------------------------------------------------------------------
    // Client commands
    // -----------------------------------------------------------------------

    pub fn handle_client_message(&mut self, msg: ClientMessage) -> Result<(), OrchestratorError> {
        debug!(
            component = "orchestrator",
            event = "command.received",
            command = msg.kind(),
            "Handling client command"
        );

        match msg {
            ClientMessage::SessionStart {
                title,
                prompt,
                cwd,
                allowed_tools,
            } => self
                .start_session(title, prompt, cwd, allowed_tools)
                .map(|_| ()),
            ClientMessage::SessionContinue { session_id, prompt } => {
                self.continue_session(&session_id, prompt)
            }
            ClientMessage::SessionStop { session_id } => {
                if self.store.get(&session_id)?.is_none() {
                    return Err(OrchestratorError::UnknownSession { session_id });
                }
                self.stop_session(&session_id)
            }
            ClientMessage::SessionDelete { session_id } => self.delete_session(&session_id),
            ClientMessage::SessionList => {
                let sessions = self.store.list()?.iter().map(SessionRecord::info).collect();
                self.emit(ServerMessage::SessionList { sessions });
                Ok(())
            }
            ClientMessage::SessionHistory { session_id } => {
                let Some(session) = self.store.get(&session_id)? else {
                    return Err(OrchestratorError::UnknownSession { session_id });
                };
                let messages = self.store.history(&session_id)?;
                self.emit(ServerMessage::SessionHistory {
                    session_id,
                    status: session.status,
                    messages,
                });
                Ok(())
            }
            ClientMessage::PermissionResponse {
                session_id,
                tool_use_id,
                result,
            } => {
                self.resolve_permission(&session_id, &tool_use_id, result);
                Ok(())
            }
            ClientMessage::TaskQueue { prompt, cwd } => {
                self.enqueue_task(prompt, cwd);
                Ok(())
            }
            ClientMessage::TaskCancel { task_id } => self.cancel_task(&task_id),
            ClientMessage::TaskList => {
                self.emit(ServerMessage::TaskList {
                    tasks: self.queue.list(),
                });
                Ok(())
            }
            ClientMessage::SettingsGet => {
                let settings = self.settings_manager.load();
                self.apply_settings(settings.clone());
                self.emit(ServerMessage::SettingsLoaded { settings });
                Ok(())
            }
            ClientMessage::SettingsUpdate { settings } => self.update_settings(settings),
            ClientMessage::SettingsToggleMcp { server_id, enabled } => {
                let settings = self.settings_manager.toggle_mcp(&server_id, enabled)?;
                self.settings_changed(settings)
            }
            ClientMessage::SettingsToggleSkill { skill_id, enabled } => {
                let settings = self.settings_manager.toggle_skill(&skill_id, enabled)?;
                self.settings_changed(settings)
            }
        }
    }

    /// Creates a session and starts its first run. Returns the session id.
    pub fn start_session(
        &mut self,
        title: Option<String>,
        prompt: String,
        cwd: Option<String>,
        allowed_tools: Option<String>,
    ) -> Result<String, OrchestratorError> {
        let cwd = non_blank(cwd).or_else(|| self.settings.preferences.default_cwd.clone());
        let record = self.store.create(
            NewSession {
                id: self.ids.next_id(),
                title: session_title(title.as_deref(), &prompt),
                cwd,
                allowed_tools: non_blank(allowed_tools),
                last_prompt: Some(prompt.clone()),
            },
            self.clock.now_ms(),
        )?;
        info!(
            component = "orchestrator",
            event = "session.created",
            session_id = %record.id,
            title = %record.title,
            "Session created"
        );
        let session_id = record.id.clone();
        self.begin_run(record, prompt, None)?;
        Ok(session_id)
    }

    fn continue_session(&mut self, session_id: &str, prompt: String) -> Result<(), OrchestratorError> {
        let Some(record) = self.store.get(session_id)? else {
            return Err(OrchestratorError::UnknownSession {
                session_id: session_id.to_string(),
            });
        };
        if self.runs.contains_key(session_id) {
            return Err(OrchestratorError::SessionBusy {
                session_id: session_id.to_string(),
            });
        }
        let Some(resume_token) = record.resume_token.clone() else {
            return Err(OrchestratorError::NoResumeToken {
                session_id: session_id.to_string(),
            });
        };
        self.begin_run(record, prompt, Some(resume_token))
    }

    /// Marks the session running, records the prompt, and spawns the run.
    fn begin_run(
        &mut self,
        record: SessionRecord,
        prompt: String,
        resume_token: Option<String>,
    ) -> Result<(), OrchestratorError> {
        if self.runs.contains_key(&record.id) {
            return Err(OrchestratorError::SessionBusy {
                session_id: record.id,
            });
        }
        let Some(status) = next_status(record.status, Input::Run) else {
            return Err(OrchestratorError::SessionBusy {
                session_id: record.id,
            });
        };

        self.store.update(
            &record.id,
            SessionUpdate {
                last_prompt: Some(prompt.clone()),
                ..SessionUpdate::default()
            },
            self.clock.now_ms(),
        )?;
        self.emit(ServerMessage::SessionStatus {
            session_id: record.id.clone(),
            status,
            title: Some(record.title.clone()),
            cwd: record.cwd.clone(),
            error: None,
        });
        self.emit(ServerMessage::StreamUserPrompt {
            session_id: record.id.clone(),
            prompt: prompt.clone(),
        });

        let run_id = self.next_run_id;
        self.next_run_id += 1;
        let params = RunParams {
            session_id: record.id.clone(),
            run_id,
            prompt,
            cwd: record.cwd.clone().unwrap_or_else(fallback_cwd),
            resume_token,
            allowed_tools: parse_tool_list(record.allowed_tools.as_deref()),
            mcp_servers: enabled_mcp_servers(&self.settings),
        };
        let run = spawn_run(&self.agent, params, &self.run_ctx);
        self.runs.insert(record.id, run);
        Ok(())
    }

    /// Cancels the live run, if any, and returns the session to `idle`.
    /// A running task backed by this session is cancelled too.
    fn stop_session(&mut self, session_id: &str) -> Result<(), OrchestratorError> {
        if !self.abort_run(session_id) {
            debug!(
                component = "orchestrator",
                event = "session.stop.noop",
                session_id = %session_id,
                "No live run to stop"
            );
            return Ok(());
        }

        let backing_task = self
            .queue
            .running_for_session(session_id)
            .map(|task| task.id.clone());
        if let Some(task_id) = backing_task {
            self.finish_cancelled_task(&task_id);
            self.admission_pass();
        }
        Ok(())
    }

    /// Cancels the live run and emits `idle`. Returns whether a run existed.
    /// The status emit is best-effort so callers always finish their task
    /// bookkeeping.
    fn abort_run(&mut self, session_id: &str) -> bool {
        let Some(run) = self.runs.remove(session_id) else {
            return false;
        };
        run.cancel();
        let swept = self
            .permissions
            .deny_all_for_session(session_id, ABORTED_MESSAGE);
        info!(
            component = "orchestrator",
            event = "run.aborted",
            session_id = %session_id,
            run_id = run.run_id,
            swept_permissions = swept,
            "Aborted live run"
        );

        match self.store.get(session_id) {
            Ok(Some(record)) => {
                let status =
                    next_status(record.status, Input::Stop).unwrap_or(SessionStatus::Idle);
                self.emit(ServerMessage::SessionStatus {
                    session_id: session_id.to_string(),
                    status,
                    title: Some(record.title),
                    cwd: record.cwd,
                    error: None,
                });
            }
            Ok(None) => {}
            Err(e) => warn!(
                component = "orchestrator",
                event = "session.lookup_failed",
                session_id = %session_id,
                error = %e,
                "Could not load aborted session to record idle status"
            ),
        }
        true
    }

    fn delete_session(&mut self, session_id: &str) -> Result<(), OrchestratorError> {
        self.stop_session(session_id)?;
        let existed = self.store.delete(session_id)?;
        info!(
            component = "orchestrator",
            event = "session.deleted",
            session_id = %session_id,
            existed = existed,
            "Session deleted"
        );
        self.emit(ServerMessage::SessionDeleted {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    fn resolve_permission(&mut self, session_id: &str, tool_use_id: &str, result: PermissionResult) {
        if self.permissions.resolve(session_id, tool_use_id, result) {
            debug!(
                component = "orchestrator",
                event = "permission.resolved",
                session_id = %session_id,
                tool_use_id = %tool_use_id,
                "Permission request resolved"
            );
        } else {
            debug!(
                component = "orchestrator",
                event = "permission.unknown",
                session_id = %session_id,
                tool_use_id = %tool_use_id,
                "No pending permission request, ignoring response"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Task queue
    // -----------------------------------------------------------------------

    fn enqueue_task(&mut self, prompt: String, cwd: String) -> QueuedTask {
        let task = QueuedTask {
            id: self.ids.next_id(),
            prompt,
            cwd,
            status: TaskStatus::Queued,
            session_id: None,
            error: None,
            created_at: self.clock.now_ms(),
            started_at: None,
            completed_at: None,
        };
        info!(
            component = "orchestrator",
            event = "task.queued",
            task_id = %task.id,
            "Task queued"
        );
        self.queue.enqueue(task.clone());
        self.emit(ServerMessage::TaskAdded { task: task.clone() });
        self.admission_pass();
        task
    }

    /// Unknown or already-finished task ids are a silent no-op.
    fn cancel_task(&mut self, task_id: &str) -> Result<(), OrchestratorError> {
        if let Some(mut task) = self.queue.take_waiting(task_id) {
            task.status = TaskStatus::Cancelled;
            info!(
                component = "orchestrator",
                event = "task.cancelled",
                task_id = %task_id,
                was_running = false,
                "Task cancelled"
            );
            self.emit(ServerMessage::TaskRemoved {
                task_id: task.id,
            });
            return Ok(());
        }

        let Some(session_id) = self
            .queue
            .running_for_task(task_id)
            .and_then(|task| task.session_id.clone())
        else {
            debug!(
                component = "orchestrator",
                event = "task.cancel.unknown",
                task_id = %task_id,
                "Task is not queued or running"
            );
            return Ok(());
        };

        self.abort_run(&session_id);
        self.finish_cancelled_task(task_id);
        self.admission_pass();
        Ok(())
    }

    fn finish_cancelled_task(&mut self, task_id: &str) {
        let Some(mut task) = self.queue.take_running(task_id) else {
            return;
        };
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(self.clock.now_ms());
        info!(
            component = "orchestrator",
            event = "task.cancelled",
            task_id = %task_id,
            was_running = true,
            "Task cancelled"
        );
        self.emit(ServerMessage::TaskRemoved { task_id: task.id });
    }

    /// Promotes waiting tasks, earliest first, until the concurrency bound is
    /// saturated or nothing is waiting. Idempotent.
    fn admission_pass(&mut self) {
        while let Some(task) = self.queue.pop_next() {
            self.promote(task);
        }
    }

    fn promote(&mut self, mut task: QueuedTask) {
        let now = self.clock.now_ms();
        let created = self.store.create(
            NewSession {
                id: self.ids.next_id(),
                title: session_title(None, &task.prompt),
                cwd: Some(task.cwd.clone()),
                allowed_tools: None,
                last_prompt: Some(task.prompt.clone()),
            },
            now,
        );
        let record = match created {
            Ok(record) => record,
            Err(e) => {
                error!(
                    component = "orchestrator",
                    event = "task.promote_failed",
                    task_id = %task.id,
                    error = %e,
                    "Could not create a session for task"
                );
                task.status = TaskStatus::Error;
                task.error = Some(e.to_string());
                task.completed_at = Some(now);
                self.emit(ServerMessage::TaskUpdated { task });
                return;
            }
        };

        task.status = TaskStatus::Running;
        task.session_id = Some(record.id.clone());
        task.started_at = Some(now);
        info!(
            component = "orchestrator",
            event = "task.promoted",
            task_id = %task.id,
            session_id = %record.id,
            "Task promoted to running"
        );
        self.queue.insert_running(task.clone());
        self.emit(ServerMessage::TaskUpdated { task: task.clone() });

        let session_id = record.id.clone();
        if let Err(e) = self.begin_run(record, task.prompt, None) {
            self.settle_task(&session_id, &RunOutcome::Failed(e.to_string()));
            self.set_session_error(&session_id, e.to_string());
        }
    }

    /// Moves the running task backed by `session_id` to its terminal state.
    fn settle_task(&mut self, session_id: &str, outcome: &RunOutcome) {
        let Some(task_id) = self
            .queue
            .running_for_session(session_id)
            .map(|t| t.id.clone())
        else {
            return;
        };
        let Some(mut task) = self.queue.take_running(&task_id) else {
            return;
        };
        task.completed_at = Some(self.clock.now_ms());
        match outcome {
            RunOutcome::Completed => {
                task.status = TaskStatus::Completed;
                self.emit(ServerMessage::TaskCompleted { task });
            }
            RunOutcome::Failed(message) => {
                task.status = TaskStatus::Error;
                task.error = Some(message.clone());
                self.emit(ServerMessage::TaskUpdated { task });
            }
            RunOutcome::Cancelled => {
                task.status = TaskStatus::Cancelled;
                self.emit(ServerMessage::TaskRemoved { task_id: task.id });
            }
        }
    }

    fn set_session_error(&mut self, session_id: &str, message: String) {
        match self.store.get(session_id) {
            Ok(Some(record)) => self.emit(ServerMessage::SessionStatus {
                session_id: session_id.to_string(),
                status: SessionStatus::Error,
                title: Some(record.title),
                cwd: record.cwd,
                error: Some(message),
            }),
            Ok(None) => {}
            Err(e) => warn!(
                component = "orchestrator",
                event = "session.lookup_failed",
                session_id = %session_id,
                error = %e,
                "Could not load session to record error"
            ),
        }
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    fn update_settings(&mut self, patch: SettingsPatch) -> Result<(), OrchestratorError> {
        let settings = self.settings_manager.update(patch)?;
        self.settings_changed(settings)
    }

    fn settings_changed(&mut self, settings: CoworkSettings) -> Result<(), OrchestratorError> {
        self.apply_settings(settings.clone());
        self.emit(ServerMessage::SettingsUpdated { settings });
        Ok(())
    }

    fn apply_settings(&mut self, settings: CoworkSettings) {
        let max = settings.preferences.max_concurrent_tasks;
        let bound_changed = max.max(1) != self.queue.max_concurrent();
        self.settings = settings;
        if bound_changed {
            info!(
                component = "orchestrator",
                event = "queue.bound_changed",
                max_concurrent_tasks = max,
                "Concurrency bound updated"
            );
            self.queue.set_max_concurrent(max);
            self.admission_pass();
        }
    }

    // -----------------------------------------------------------------------
    // Runner events
    // -----------------------------------------------------------------------

    pub fn handle_runner_event(&mut self, event: RunnerEvent) {
        let live = self
            .runs
            .get(event.session_id())
            .is_some_and(|run| run.run_id == event.run_id());
        if !live {
            debug!(
                component = "orchestrator",
                event = "runner.stale_event",
                session_id = %event.session_id(),
                run_id = event.run_id(),
                "Dropping event from a superseded run"
            );
            // Dropping the event drops any reply/ack sender; the permission
            // handler denies the tool call when either one is gone.
            return;
        }

        match event {
            RunnerEvent::Agent {
                session_id, event, ..
            } => self.on_agent_event(session_id, event),
            RunnerEvent::PermissionRequested {
                session_id,
                tool_use_id,
                tool_name,
                input,
                reply,
                ..
            } => {
                info!(
                    component = "orchestrator",
                    event = "permission.requested",
                    session_id = %session_id,
                    tool_use_id = %tool_use_id,
                    tool_name = %tool_name,
                    "Agent requested permission"
                );
                self.permissions.insert(
                    &session_id,
                    &tool_use_id,
                    tool_name.clone(),
                    input.clone(),
                    reply,
                );
                self.emit(ServerMessage::PermissionRequest {
                    session_id,
                    tool_use_id,
                    tool_name,
                    input,
                });
            }
            RunnerEvent::WriteBefore {
                session_id,
                file_path,
                before_content,
                ack,
                ..
            } => {
                self.emit(ServerMessage::ToolWriteBefore {
                    session_id,
                    file_path,
                    before_content,
                });
                let _ = ack.send(());
            }
            RunnerEvent::Finished {
                session_id,
                outcome,
                ..
            } => self.on_run_finished(&session_id, outcome),
        }
    }

    fn on_agent_event(&mut self, session_id: String, event: AgentEvent) {
        if let AgentEvent::Initialized { resume_token, .. } = &event {
            let updated = self.store.update(
                &session_id,
                SessionUpdate {
                    resume_token: Some(resume_token.clone()),
                    ..SessionUpdate::default()
                },
                self.clock.now_ms(),
            );
            match updated {
                Ok(_) => debug!(
                    component = "orchestrator",
                    event = "session.resume_token",
                    session_id = %session_id,
                    "Captured resume token"
                ),
                Err(e) => error!(
                    component = "orchestrator",
                    event = "session.resume_token_failed",
                    session_id = %session_id,
                    error = %e,
                    "Failed to store resume token"
                ),
            }
        }

        self.emit(ServerMessage::StreamMessage {
            session_id,
            message: StreamMessage::Agent(event.into_message()),
        });
    }

    fn on_run_finished(&mut self, session_id: &str, outcome: RunOutcome) {
        self.runs.remove(session_id);
        self.permissions
            .deny_all_for_session(session_id, ABORTED_MESSAGE);

        let settled = match &outcome {
            RunOutcome::Completed => Some(true),
            RunOutcome::Failed(_) => Some(false),
            // Only reachable if the token fired without going through
            // abort_run; stop already owns the status in that case.
            RunOutcome::Cancelled => None,
        };

        if let Some(success) = settled {
            match self.store.get(session_id) {
                Ok(Some(record)) => {
                    if let Some(status) = next_status(record.status, Input::Settled { success }) {
                        let error = match &outcome {
                            RunOutcome::Failed(message) => Some(message.clone()),
                            _ => None,
                        };
                        self.emit(ServerMessage::SessionStatus {
                            session_id: session_id.to_string(),
                            status,
                            title: Some(record.title),
                            cwd: record.cwd,
                            error,
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => error!(
                    component = "orchestrator",
                    event = "session.lookup_failed",
                    session_id = %session_id,
                    error = %e,
                    "Could not load finished session"
                ),
            }
        }

        self.settle_task(session_id, &outcome);
        self.admission_pass();
    }

    // -----------------------------------------------------------------------
    // Emission
    // -----------------------------------------------------------------------

    /// Broadcast, persisting the kinds the store mirrors first so that stored
    /// state never diverges from what observers were shown.
    fn emit(&mut self, msg: ServerMessage) {
        let now = self.clock.now_ms();
        let persisted = match &msg {
            ServerMessage::SessionStatus {
                session_id, status, ..
            } => self
                .store
                .update(
                    session_id,
                    SessionUpdate {
                        status: Some(*status),
                        ..SessionUpdate::default()
                    },
                    now,
                )
                .map(|_| ()),
            ServerMessage::StreamMessage {
                session_id,
                message,
            } if message.is_durable() => self.store.append_message(session_id, message, now),
            ServerMessage::StreamUserPrompt { session_id, prompt } => self.store.append_message(
                session_id,
                &StreamMessage::user_prompt(prompt.clone()),
                now,
            ),
            ServerMessage::StreamMessage { .. }
            | ServerMessage::SessionList { .. }
            | ServerMessage::SessionHistory { .. }
            | ServerMessage::SessionDeleted { .. }
            | ServerMessage::PermissionRequest { .. }
            | ServerMessage::RunnerError { .. }
            | ServerMessage::ToolWriteBefore { .. }
            | ServerMessage::TaskList { .. }
            | ServerMessage::TaskAdded { .. }
            | ServerMessage::TaskUpdated { .. }
            | ServerMessage::TaskRemoved { .. }
            | ServerMessage::TaskCompleted { .. }
            | ServerMessage::SettingsLoaded { .. }
            | ServerMessage::SettingsUpdated { .. } => Ok(()),
        };

        if let Err(e) = persisted {
            error!(
                component = "orchestrator",
                event = "emit.persist_failed",
                session_id = ?msg.session_id(),
                error = %e,
                "Failed to persist emitted event"
            );
        }
        self.broadcaster.send(msg);
    }

    /// Cancels every live run and denies every pending question.
    pub fn shutdown(&mut self) {
        let session_ids: Vec<String> = self.runs.keys().cloned().collect();
        for session_id in &session_ids {
            self.abort_run(session_id);
        }
        if !self.permissions.is_empty() {
            self.permissions.deny_all(ABORTED_MESSAGE);
        }
        info!(
            component = "orchestrator",
            event = "orchestrator.shutdown",
            aborted_runs = session_ids.len(),
            "Orchestrator shut down"
        );
    }

    #[cfg(test)]
    pub(crate) fn pending_permission_count(&self) -> usize {
        self.permissions.len()
    }

    #[cfg(test)]
    pub(crate) fn has_live_run(&self, session_id: &str) -> bool {
        self.runs.contains_key(session_id)
    }

    #[cfg(test)]
    pub(crate) fn session(&self, session_id: &str) -> Option<SessionRecord> {
        self.store.get(session_id).ok().flatten()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn fallback_cwd() -> String {
    dirs::home_dir()
        .or_else(|| std::env::current_dir().ok())
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| ".".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use futures::StreamExt;
    use serde_json::json;
    use tokio::sync::broadcast;
    use tokio::time::timeout;

    use cowork_connector_core::{
        AgentStream, ConnectorError, InvocationRequest, PermissionHandler,
    };
    use cowork_protocol::Preferences;

    use super::*;
    use crate::clock::{ManualClock, SequentialIds};
    use crate::persistence::SqliteSessionStore;

    type EventTx = mpsc::UnboundedSender<Result<AgentEvent, ConnectorError>>;

    struct Invocation {
        request: InvocationRequest,
        permissions: Arc<dyn PermissionHandler>,
        events: EventTx,
    }

    /// Agent whose output the test writes by hand, one channel per invocation.
    #[derive(Default)]
    struct ScriptedAgent {
        invocations: Mutex<Vec<Invocation>>,
    }

    impl AgentService for ScriptedAgent {
        fn invoke(
            &self,
            request: InvocationRequest,
            permissions: Arc<dyn PermissionHandler>,
        ) -> AgentStream {
            let (tx, rx) = mpsc::unbounded_channel();
            self.invocations
                .lock()
                .expect("invocations lock")
                .push(Invocation {
                    request,
                    permissions,
                    events: tx,
                });
            futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (event, rx))
            })
            .boxed()
        }
    }

    impl ScriptedAgent {
        fn count(&self) -> usize {
            self.invocations.lock().expect("invocations lock").len()
        }

        fn request(&self, idx: usize) -> InvocationRequest {
            self.invocations.lock().expect("invocations lock")[idx]
                .request
                .clone()
        }

        fn handler(&self, idx: usize) -> Arc<dyn PermissionHandler> {
            self.invocations.lock().expect("invocations lock")[idx]
                .permissions
                .clone()
        }

        fn emit(&self, idx: usize, event: AgentEvent) {
            self.invocations.lock().expect("invocations lock")[idx]
                .events
                .send(Ok(event))
                .expect("run still listening");
        }

        /// Ends the stream with a transport error instead of a result.
        fn fail(&self, idx: usize, message: &str) {
            self.invocations.lock().expect("invocations lock")[idx]
                .events
                .send(Err(ConnectorError::Provider(message.to_string())))
                .expect("run still listening");
        }

        fn finish(&self, idx: usize, success: bool) {
            let (subtype, error) = if success {
                ("success", None)
            } else {
                ("error_during_execution", Some("boom".to_string()))
            };
            self.emit(
                idx,
                AgentEvent::Finished {
                    success,
                    error,
                    message: json!({"type": "result", "subtype": subtype}),
                },
            );
        }
    }

    /// Sqlite store whose `get` can be switched to fail.
    struct FailingGetStore {
        inner: SqliteSessionStore,
        fail_get: Arc<AtomicBool>,
    }

    impl SessionStore for FailingGetStore {
        fn create(&mut self, new: NewSession, now: i64) -> Result<SessionRecord, StoreError> {
            self.inner.create(new, now)
        }

        fn get(&self, id: &str) -> Result<Option<SessionRecord>, StoreError> {
            if self.fail_get.load(Ordering::SeqCst) {
                return Err(StoreError::CorruptStatus("unreadable".to_string()));
            }
            self.inner.get(id)
        }

        fn update(
            &mut self,
            id: &str,
            update: SessionUpdate,
            now: i64,
        ) -> Result<Option<SessionRecord>, StoreError> {
            self.inner.update(id, update, now)
        }

        fn delete(&mut self, id: &str) -> Result<bool, StoreError> {
            self.inner.delete(id)
        }

        fn list(&self) -> Result<Vec<SessionRecord>, StoreError> {
            self.inner.list()
        }

        fn append_message(
            &mut self,
            id: &str,
            message: &StreamMessage,
            now: i64,
        ) -> Result<(), StoreError> {
            self.inner.append_message(id, message, now)
        }

        fn history(&self, id: &str) -> Result<Vec<StreamMessage>, StoreError> {
            self.inner.history(id)
        }

        fn reset_running(&mut self, now: i64) -> Result<Vec<String>, StoreError> {
            self.inner.reset_running(now)
        }
    }

    struct Harness {
        orch: Orchestrator,
        events: mpsc::UnboundedReceiver<RunnerEvent>,
        agent: Arc<ScriptedAgent>,
        observer: broadcast::Receiver<ServerMessage>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let store = SqliteSessionStore::open_in_memory().expect("in-memory store");
            Self::with_store(Box::new(store))
        }

        fn with_store(store: Box<dyn SessionStore>) -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let agent = Arc::new(ScriptedAgent::default());
            let broadcaster = Broadcaster::new(1024);
            let observer = broadcaster.subscribe();
            let (orch, events) = Orchestrator::new(OrchestratorDeps {
                store,
                agent: agent.clone(),
                settings: SettingsManager::new(
                    dir.path().join("cowork-settings.json"),
                    None,
                    None,
                ),
                broadcaster,
                clock: Arc::new(ManualClock::new(1_000)),
                ids: Arc::new(SequentialIds::new("id")),
                interactive_tools: vec!["AskUserQuestion".to_string()],
            })
            .expect("orchestrator");
            Self {
                orch,
                events,
                agent,
                observer,
                dir,
            }
        }

        fn send(&mut self, msg: ClientMessage) -> Result<(), OrchestratorError> {
            self.orch.handle_client_message(msg)
        }

        fn start(&mut self, prompt: &str) -> String {
            let cwd = self.dir.path().to_string_lossy().to_string();
            self.orch
                .start_session(None, prompt.to_string(), Some(cwd), None)
                .expect("session starts")
        }

        fn queue(&mut self, prompt: &str) -> String {
            let cwd = self.dir.path().to_string_lossy().to_string();
            self.send(ClientMessage::TaskQueue {
                prompt: prompt.to_string(),
                cwd,
            })
            .expect("task queued");
            self.observed()
                .into_iter()
                .find_map(|msg| match msg {
                    ServerMessage::TaskAdded { task } => Some(task.id),
                    _ => None,
                })
                .expect("task.added broadcast")
        }

        /// Feeds runner events back in until the runs go quiet.
        async fn pump(&mut self) {
            while let Ok(Some(event)) =
                timeout(Duration::from_millis(100), self.events.recv()).await
            {
                self.orch.handle_runner_event(event);
            }
        }

        fn observed(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.observer.try_recv() {
                out.push(msg);
            }
            out
        }

        fn status(&self, session_id: &str) -> SessionStatus {
            self.orch.session(session_id).expect("session exists").status
        }
    }

    fn position(msgs: &[ServerMessage], pred: impl Fn(&ServerMessage) -> bool) -> usize {
        msgs.iter().position(pred).expect("message was broadcast")
    }

    #[tokio::test]
    async fn admission_never_exceeds_bound_and_promotes_fifo() {
        let mut h = Harness::new();
        let ids: Vec<String> = (1..=4).map(|n| h.queue(&format!("task {n}"))).collect();

        assert_eq!(h.agent.count(), 3);
        let snapshot = h.orch.snapshot();
        assert_eq!((snapshot.running_tasks, snapshot.queued_tasks), (3, 1));
        let prompts: Vec<String> = (0..3).map(|i| h.agent.request(i).prompt).collect();
        assert_eq!(prompts, vec!["task 1", "task 2", "task 3"]);

        h.observed();
        h.agent.finish(0, true);
        h.pump().await;

        assert_eq!(h.agent.count(), 4);
        assert_eq!(h.agent.request(3).prompt, "task 4");
        let msgs = h.observed();
        let completed = position(&msgs, |m| {
            matches!(m, ServerMessage::TaskCompleted { task } if task.id == ids[0])
        });
        let promoted = position(&msgs, |m| {
            matches!(m, ServerMessage::TaskUpdated { task }
                if task.id == ids[3] && task.status == TaskStatus::Running)
        });
        assert!(completed < promoted);
        assert_eq!(h.orch.snapshot().running_tasks, 3);
        assert_eq!(h.orch.snapshot().queued_tasks, 0);
    }

    #[tokio::test]
    async fn cancelling_a_waiting_task_means_it_never_runs() {
        let mut h = Harness::new();
        let ids: Vec<String> = (1..=4).map(|n| h.queue(&format!("task {n}"))).collect();

        h.send(ClientMessage::TaskCancel {
            task_id: ids[3].clone(),
        })
        .expect("cancel");
        assert!(h
            .observed()
            .contains(&ServerMessage::TaskRemoved { task_id: ids[3].clone() }));

        h.agent.finish(0, true);
        h.pump().await;
        assert_eq!(h.agent.count(), 3);
        assert!(h.orch.queue.list().iter().all(|t| t.id != ids[3]));
    }

    #[tokio::test]
    async fn cancelling_a_running_task_aborts_its_session_and_frees_the_slot() {
        let mut h = Harness::new();
        let ids: Vec<String> = (1..=4).map(|n| h.queue(&format!("task {n}"))).collect();
        let session_id = h.orch.queue.list()[0]
            .session_id
            .clone()
            .expect("running task has a session");
        h.observed();

        h.send(ClientMessage::TaskCancel {
            task_id: ids[0].clone(),
        })
        .expect("cancel");

        assert!(h.agent.request(0).cancel.is_cancelled());
        assert_eq!(h.status(&session_id), SessionStatus::Idle);
        assert_eq!(h.agent.count(), 4);
        let msgs = h.observed();
        assert!(msgs.contains(&ServerMessage::TaskRemoved {
            task_id: ids[0].clone()
        }));

        // The cancelled run's own settle event is from a superseded run.
        h.pump().await;
        assert_eq!(h.status(&session_id), SessionStatus::Idle);
        assert_eq!(h.orch.snapshot().running_tasks, 3);
    }

    #[tokio::test]
    async fn deleting_twice_reports_deleted_both_times() {
        let mut h = Harness::new();
        let session_id = h.start("hello");
        h.observed();

        for _ in 0..2 {
            h.send(ClientMessage::SessionDelete {
                session_id: session_id.clone(),
            })
            .expect("delete");
            assert!(h.observed().contains(&ServerMessage::SessionDeleted {
                session_id: session_id.clone()
            }));
        }
        assert!(h.orch.session(&session_id).is_none());
        assert!(!h.orch.has_live_run(&session_id));
    }

    #[tokio::test]
    async fn stop_denies_pending_question_and_late_answer_is_ignored() {
        let mut h = Harness::new();
        let session_id = h.start("ask me something");
        let handler = h.agent.handler(0);
        let question = tokio::spawn(
            handler.can_use_tool("AskUserQuestion".to_string(), json!({"questions": []})),
        );
        h.pump().await;

        assert_eq!(h.orch.pending_permission_count(), 1);
        let tool_use_id = h
            .observed()
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::PermissionRequest { tool_use_id, .. } => Some(tool_use_id),
                _ => None,
            })
            .expect("permission.request broadcast");

        h.send(ClientMessage::SessionStop {
            session_id: session_id.clone(),
        })
        .expect("stop");
        assert_eq!(h.orch.pending_permission_count(), 0);
        assert_eq!(h.status(&session_id), SessionStatus::Idle);

        let answer = timeout(Duration::from_secs(1), question)
            .await
            .expect("question settles")
            .expect("join");
        assert_eq!(answer, PermissionResult::deny(ABORTED_MESSAGE));

        h.send(ClientMessage::PermissionResponse {
            session_id: session_id.clone(),
            tool_use_id,
            result: PermissionResult::allow(json!({})),
        })
        .expect("late response is not an error");
        assert_eq!(h.orch.pending_permission_count(), 0);
    }

    #[tokio::test]
    async fn answered_question_reaches_the_agent() {
        let mut h = Harness::new();
        let session_id = h.start("ask");
        let handler = h.agent.handler(0);
        let question = tokio::spawn(handler.can_use_tool("AskUserQuestion".to_string(), json!({})));
        h.pump().await;
        let tool_use_id = h
            .observed()
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::PermissionRequest { tool_use_id, .. } => Some(tool_use_id),
                _ => None,
            })
            .expect("permission.request broadcast");

        h.send(ClientMessage::PermissionResponse {
            session_id,
            tool_use_id,
            result: PermissionResult::allow(json!({"answers": {"q": "yes"}})),
        })
        .expect("respond");

        let answer = timeout(Duration::from_secs(1), question)
            .await
            .expect("question settles")
            .expect("join");
        assert_eq!(answer, PermissionResult::allow(json!({"answers": {"q": "yes"}})));
    }

    #[tokio::test]
    async fn continue_resumes_with_captured_token() {
        let mut h = Harness::new();
        let session_id = h.start("first");
        let init = json!({"type": "system", "subtype": "init", "session_id": "abc"});
        h.agent.emit(
            0,
            AgentEvent::Initialized {
                resume_token: "abc".to_string(),
                message: init.clone(),
            },
        );
        h.agent.finish(0, true);
        h.pump().await;
        assert_eq!(h.status(&session_id), SessionStatus::Completed);

        h.send(ClientMessage::SessionContinue {
            session_id: session_id.clone(),
            prompt: "second".to_string(),
        })
        .expect("continue");

        let request = h.agent.request(1);
        assert_eq!(request.resume_token.as_deref(), Some("abc"));
        assert_eq!(request.prompt, "second");
        assert_eq!(h.status(&session_id), SessionStatus::Running);

        let history = h.orch.store.history(&session_id).expect("history");
        assert_eq!(
            history,
            vec![
                StreamMessage::user_prompt("first"),
                StreamMessage::Agent(init),
                StreamMessage::Agent(json!({"type": "result", "subtype": "success"})),
                StreamMessage::user_prompt("second"),
            ]
        );
    }

    #[tokio::test]
    async fn continue_rejects_missing_token_busy_and_unknown_sessions() {
        let mut h = Harness::new();
        let session_id = h.start("first");

        let busy = h.send(ClientMessage::SessionContinue {
            session_id: session_id.clone(),
            prompt: "again".to_string(),
        });
        assert!(matches!(busy, Err(OrchestratorError::SessionBusy { .. })));

        h.agent.finish(0, true);
        h.pump().await;
        let no_token = h.send(ClientMessage::SessionContinue {
            session_id: session_id.clone(),
            prompt: "again".to_string(),
        });
        let err = no_token.expect_err("no resume token");
        assert!(matches!(err, OrchestratorError::NoResumeToken { .. }));
        assert_eq!(
            err.to_server_message(),
            ServerMessage::RunnerError {
                session_id: Some(session_id.clone()),
                message: "Session has no resume id yet.".to_string(),
            }
        );

        let unknown = h.send(ClientMessage::SessionContinue {
            session_id: "missing".to_string(),
            prompt: "x".to_string(),
        });
        assert!(matches!(unknown, Err(OrchestratorError::UnknownSession { .. })));
        assert_eq!(h.agent.count(), 1);
    }

    #[tokio::test]
    async fn write_before_is_broadcast_ahead_of_tool_result() {
        let mut h = Harness::new();
        std::fs::write(h.dir.path().join("notes.txt"), "old text").expect("seed file");
        let session_id = h.start("edit notes");
        h.observed();

        let handler = h.agent.handler(0);
        let input = json!({"file_path": "notes.txt", "content": "new text"});
        let write = tokio::spawn(handler.can_use_tool("Write".to_string(), input.clone()));
        h.pump().await;
        let decision = timeout(Duration::from_secs(1), write)
            .await
            .expect("write approved")
            .expect("join");
        assert_eq!(decision, PermissionResult::allow(input));

        let tool_result = json!({"type": "user", "message": {"content": [{"type": "tool_result"}]}});
        h.agent.emit(0, AgentEvent::Message(tool_result.clone()));
        h.pump().await;

        let msgs = h.observed();
        let before = position(&msgs, |m| {
            matches!(m, ServerMessage::ToolWriteBefore { session_id: s, before_content, .. }
                if *s == session_id && before_content.as_deref() == Some("old text"))
        });
        let result = position(&msgs, |m| {
            matches!(m, ServerMessage::StreamMessage { message: StreamMessage::Agent(v), .. }
                if *v == tool_result)
        });
        assert!(before < result);
    }

    #[tokio::test]
    async fn events_from_superseded_runs_are_dropped() {
        let mut h = Harness::new();
        let session_id = h.start("hello");
        h.send(ClientMessage::SessionStop {
            session_id: session_id.clone(),
        })
        .expect("stop");
        h.pump().await;
        h.observed();
        let history_len = h.orch.store.history(&session_id).expect("history").len();

        h.orch.handle_runner_event(RunnerEvent::Agent {
            session_id: session_id.clone(),
            run_id: 1,
            event: AgentEvent::Message(json!({"type": "assistant"})),
        });
        h.orch.handle_runner_event(RunnerEvent::Finished {
            session_id: session_id.clone(),
            run_id: 1,
            outcome: RunOutcome::Failed("late".to_string()),
        });

        assert!(h.observed().is_empty());
        assert_eq!(h.status(&session_id), SessionStatus::Idle);
        assert_eq!(
            h.orch.store.history(&session_id).expect("history").len(),
            history_len
        );
    }

    #[tokio::test]
    async fn failed_run_marks_session_and_task_as_error() {
        let mut h = Harness::new();
        let task_id = h.queue("will fail");
        let session_id = h.orch.queue.list()[0]
            .session_id
            .clone()
            .expect("session assigned");
        h.observed();

        h.agent.finish(0, false);
        h.pump().await;

        assert_eq!(h.status(&session_id), SessionStatus::Error);
        let failed = h
            .observed()
            .into_iter()
            .find_map(|m| match m {
                ServerMessage::TaskUpdated { task } if task.id == task_id => Some(task),
                _ => None,
            })
            .expect("task.updated broadcast");
        assert_eq!(failed.status, TaskStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert_eq!(h.orch.snapshot().running_tasks, 0);
    }

    #[tokio::test]
    async fn stream_error_marks_session_and_task_as_error_and_promotes_next() {
        let mut h = Harness::new();
        let ids: Vec<String> = (1..=4).map(|n| h.queue(&format!("task {n}"))).collect();
        let session_id = h.orch.queue.list()[0]
            .session_id
            .clone()
            .expect("session assigned");
        h.observed();

        h.agent.fail(0, "boom");
        h.pump().await;

        assert_eq!(h.status(&session_id), SessionStatus::Error);
        let msgs = h.observed();
        let failed = msgs
            .iter()
            .find_map(|m| match m {
                ServerMessage::TaskUpdated { task } if task.id == ids[0] => Some(task.clone()),
                _ => None,
            })
            .expect("task.updated broadcast");
        assert_eq!(failed.status, TaskStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("Provider error: boom"));
        assert!(msgs.iter().any(|m| matches!(m,
            ServerMessage::SessionStatus { session_id: sid, status: SessionStatus::Error, error: Some(e), .. }
                if sid == &session_id && e == "Provider error: boom")));

        assert_eq!(h.agent.count(), 4);
        assert_eq!(h.agent.request(3).prompt, "task 4");
        let snapshot = h.orch.snapshot();
        assert_eq!((snapshot.running_tasks, snapshot.queued_tasks), (3, 0));
    }

    #[tokio::test]
    async fn stopping_or_deleting_a_task_session_removes_the_task() {
        let mut h = Harness::new();
        let ids: Vec<String> = (1..=4).map(|n| h.queue(&format!("task {n}"))).collect();
        let session_of = |h: &Harness, task_id: &str| {
            h.orch
                .queue
                .list()
                .into_iter()
                .find(|t| t.id == task_id)
                .and_then(|t| t.session_id)
                .expect("running task has a session")
        };
        let first = session_of(&h, &ids[0]);
        let second = session_of(&h, &ids[1]);
        h.observed();

        h.send(ClientMessage::SessionStop {
            session_id: first.clone(),
        })
        .expect("stop");
        assert_eq!(h.status(&first), SessionStatus::Idle);
        assert!(h.observed().contains(&ServerMessage::TaskRemoved {
            task_id: ids[0].clone()
        }));
        assert_eq!(h.agent.count(), 4);
        assert_eq!(h.agent.request(3).prompt, "task 4");

        h.send(ClientMessage::SessionDelete {
            session_id: second.clone(),
        })
        .expect("delete");
        let msgs = h.observed();
        let removed = position(&msgs, |m| {
            matches!(m, ServerMessage::TaskRemoved { task_id } if task_id == &ids[1])
        });
        let deleted = position(&msgs, |m| {
            matches!(m, ServerMessage::SessionDeleted { session_id } if session_id == &second)
        });
        assert!(removed < deleted);
        assert!(h.agent.request(1).cancel.is_cancelled());
        assert!(h.orch.session(&second).is_none());

        let snapshot = h.orch.snapshot();
        assert_eq!((snapshot.running_tasks, snapshot.queued_tasks), (2, 0));
        assert_eq!(h.agent.count(), 4);
    }

    #[tokio::test]
    async fn cancelling_a_running_task_survives_a_failed_session_lookup() {
        let fail_get = Arc::new(AtomicBool::new(false));
        let store = FailingGetStore {
            inner: SqliteSessionStore::open_in_memory().expect("in-memory store"),
            fail_get: fail_get.clone(),
        };
        let mut h = Harness::with_store(Box::new(store));
        let ids: Vec<String> = (1..=4).map(|n| h.queue(&format!("task {n}"))).collect();
        h.observed();

        fail_get.store(true, Ordering::SeqCst);
        h.send(ClientMessage::TaskCancel {
            task_id: ids[0].clone(),
        })
        .expect("cancel succeeds despite the store");
        fail_get.store(false, Ordering::SeqCst);

        assert!(h.agent.request(0).cancel.is_cancelled());
        assert!(h.observed().contains(&ServerMessage::TaskRemoved {
            task_id: ids[0].clone()
        }));
        assert_eq!(h.agent.count(), 4);
        let snapshot = h.orch.snapshot();
        assert_eq!((snapshot.running_tasks, snapshot.queued_tasks), (3, 0));
        assert!(h.orch.queue.list().iter().all(|t| t.id != ids[0]));
    }

    #[tokio::test]
    async fn raising_the_bound_promotes_waiting_tasks() {
        let mut h = Harness::new();
        let limited = |max| SettingsPatch {
            preferences: Some(Preferences {
                max_concurrent_tasks: max,
                ..Preferences::default()
            }),
            ..SettingsPatch::default()
        };

        h.send(ClientMessage::SettingsUpdate {
            settings: limited(1),
        })
        .expect("lower bound");
        h.queue("a");
        h.queue("b");
        assert_eq!(h.agent.count(), 1);

        h.send(ClientMessage::SettingsUpdate {
            settings: limited(2),
        })
        .expect("raise bound");
        assert_eq!(h.agent.count(), 2);
        assert_eq!(h.orch.snapshot().max_concurrent_tasks, 2);
    }

    #[tokio::test]
    async fn startup_resets_sessions_left_running() {
        let mut store = SqliteSessionStore::open_in_memory().expect("store");
        store
            .create(
                NewSession {
                    id: "orphan".to_string(),
                    title: "Orphan".to_string(),
                    cwd: None,
                    allowed_tools: None,
                    last_prompt: None,
                },
                10,
            )
            .expect("create");
        store
            .update(
                "orphan",
                SessionUpdate {
                    status: Some(SessionStatus::Running),
                    ..SessionUpdate::default()
                },
                20,
            )
            .expect("update");

        let h = Harness::with_store(Box::new(store));
        assert_eq!(h.status("orphan"), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn list_and_history_reply_with_stored_state() {
        let mut h = Harness::new();
        let session_id = h.start("hello");
        h.observed();

        h.send(ClientMessage::SessionList).expect("list");
        h.send(ClientMessage::SessionHistory {
            session_id: session_id.clone(),
        })
        .expect("history");
        let msgs = h.observed();

        match &msgs[0] {
            ServerMessage::SessionList { sessions } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].status, SessionStatus::Running);
                assert_eq!(sessions[0].title, "hello");
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert_eq!(
            msgs[1],
            ServerMessage::SessionHistory {
                session_id,
                status: SessionStatus::Running,
                messages: vec![StreamMessage::user_prompt("hello")],
            }
        );
    }

    #[tokio::test]
    async fn shutdown_aborts_every_live_run() {
        let mut h = Harness::new();
        let a = h.start("a");
        let b = h.start("b");

        h.orch.shutdown();

        assert!(!h.orch.has_live_run(&a));
        assert!(!h.orch.has_live_run(&b));
        assert_eq!(h.status(&a), SessionStatus::Idle);
        assert!(h.agent.request(1).cancel.is_cancelled());
    }

    #[test]
    fn error_messages_name_the_session() {
        let err = OrchestratorError::UnknownSession {
            session_id: "s-1".to_string(),
        };
        assert_eq!(err.session_id(), Some("s-1"));
        assert_eq!(err.to_string(), "Unknown session");
        assert_eq!(OrchestratorError::Unavailable.session_id(), None);
    }
}
