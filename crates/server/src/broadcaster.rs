//! Fan-out of server events to every connected observer.

use tokio::sync::broadcast;
use tracing::trace;

use cowork_protocol::ServerMessage;

const DEFAULT_CAPACITY: usize = 1024;

/// Fire-and-forget delivery: slow observers lag and skip, they never block
/// the orchestrator.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<ServerMessage>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.tx.subscribe()
    }

    pub fn send(&self, msg: ServerMessage) {
        // Err only means nobody is listening right now.
        if self.tx.send(msg).is_err() {
            trace!(
                component = "broadcaster",
                event = "broadcast.no_observers",
                "No observers connected"
            );
        }
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
