//! Orchestrator actor: owns the [`Orchestrator`] and processes client
//! commands and runner events one at a time.
//!
//! Connections talk to it through [`OrchestratorHandle`], which sends
//! [`OrchestratorCommand`]s over an mpsc channel. Health reads go through
//! `ArcSwap` and never wait on the actor.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use cowork_protocol::{ClientMessage, ServerMessage};

use crate::broadcaster::Broadcaster;
use crate::orchestrator::{Orchestrator, OrchestratorError, OrchestratorSnapshot};
use crate::runner::RunnerEvent;

const COMMAND_CAPACITY: usize = 256;

pub enum OrchestratorCommand {
    Client {
        message: ClientMessage,
        reply: oneshot::Sender<Result<(), OrchestratorError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the running orchestrator (cheap to Clone).
#[derive(Clone)]
pub struct OrchestratorHandle {
    command_tx: mpsc::Sender<OrchestratorCommand>,
    snapshot: Arc<ArcSwap<OrchestratorSnapshot>>,
    broadcaster: Broadcaster,
}

impl OrchestratorHandle {
    pub fn spawn(
        orchestrator: Orchestrator,
        events_rx: mpsc::UnboundedReceiver<RunnerEvent>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let snapshot = Arc::new(ArcSwap::from_pointee(orchestrator.snapshot()));
        let broadcaster = orchestrator.broadcaster().clone();

        tokio::spawn(actor_loop(
            orchestrator,
            command_rx,
            events_rx,
            snapshot.clone(),
        ));

        Self {
            command_tx,
            snapshot,
            broadcaster,
        }
    }

    /// Runs one client command and waits for it to be applied.
    pub async fn send(&self, message: ClientMessage) -> Result<(), OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.command_tx
            .send(OrchestratorCommand::Client { message, reply })
            .await
            .map_err(|_| OrchestratorError::Unavailable)?;
        rx.await.map_err(|_| OrchestratorError::Unavailable)?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.broadcaster.subscribe()
    }

    /// Lock-free read of the last published state.
    pub fn snapshot(&self) -> OrchestratorSnapshot {
        let mut snapshot = OrchestratorSnapshot::clone(&self.snapshot.load());
        snapshot.observers = self.broadcaster.observer_count();
        snapshot
    }

    /// Aborts every live run and stops the actor.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(OrchestratorCommand::Shutdown { reply })
            .await
            .is_err()
        {
            warn!(
                component = "actor",
                event = "actor.shutdown.closed",
                "Actor channel already closed"
            );
            return;
        }
        let _ = rx.await;
    }
}

async fn actor_loop(
    mut orchestrator: Orchestrator,
    mut command_rx: mpsc::Receiver<OrchestratorCommand>,
    mut events_rx: mpsc::UnboundedReceiver<RunnerEvent>,
    snapshot: Arc<ArcSwap<OrchestratorSnapshot>>,
) {
    loop {
        tokio::select! {
            command = command_rx.recv() => match command {
                Some(OrchestratorCommand::Client { message, reply }) => {
                    let kind = message.kind();
                    let result = orchestrator.handle_client_message(message);
                    if let Err(e) = &result {
                        warn!(
                            component = "actor",
                            event = "command.failed",
                            command = kind,
                            session_id = ?e.session_id(),
                            error = %e,
                            "Client command failed"
                        );
                    }
                    snapshot.store(Arc::new(orchestrator.snapshot()));
                    let _ = reply.send(result);
                    continue;
                }
                Some(OrchestratorCommand::Shutdown { reply }) => {
                    orchestrator.shutdown();
                    snapshot.store(Arc::new(orchestrator.snapshot()));
                    let _ = reply.send(());
                    return;
                }
                None => {
                    info!(
                        component = "actor",
                        event = "actor.handles_dropped",
                        "All handles dropped, shutting down"
                    );
                    orchestrator.shutdown();
                    return;
                }
            },
            Some(event) = events_rx.recv() => orchestrator.handle_runner_event(event),
        }
        snapshot.store(Arc::new(orchestrator.snapshot()));
    }
}
