//! Grid event bus.
//!
//! Pub/sub of lifecycle and request events over a broadcast channel.
//! Publishers never block on subscribers; events are delivered to each
//! subscriber in fire order. A bus with no subscribers silently drops
//! events.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::status::NodeStatus;
use crate::{NodeId, RequestId, SessionId};

/// Why a queued new-session request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// The request deadline elapsed while queued.
    Timeout,
    /// The queue was cleared or the distributor shut down.
    Cancelled,
}

/// All events the grid core fires on the bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GridEvent {
    NewSessionRequest {
        request_id: RequestId,
    },
    NewSessionRejected {
        request_id: RequestId,
        reason: RejectionReason,
    },
    NodeAdded {
        node_id: NodeId,
    },
    NodeRemoved {
        node_id: NodeId,
    },
    NodeDrainStarted {
        node_id: NodeId,
    },
    /// Registration refused: secret mismatch.
    NodeRejected {
        node_id: NodeId,
    },
    SessionClosed {
        session_id: SessionId,
        node_id: NodeId,
    },
    /// Periodic node heartbeat with a full status snapshot.
    NodeHeartbeat {
        status: NodeStatus,
    },
}

const BUS_CAPACITY: usize = 1024;

/// Cheaply cloneable handle to the grid event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GridEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Fire an event to all subscribers.
    pub fn publish(&self, event: GridEvent) {
        // Ignore errors — no subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.tx.subscribe()
    }
}
