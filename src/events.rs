use serde::Serialize;
use tokio::sync::broadcast;

use crate::server::{Operation, Server};

const EVENT_CAPACITY: usize = 256;

/// Change notifications pushed to dashboard subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Added { server: Server },
    Updated { server: Server },
    Removed { id: String },
    OperationFailed {
        id: String,
        action: Operation,
        error: String,
    },
}

/// Fan-out of `ServerEvent`s. Lagging subscribers miss events rather than
/// block publishers; they can resync from `GET /api/servers`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }
}
