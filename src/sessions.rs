//! Session descriptors and the authoritative session map.
//!
//! The map is the single source of truth for live sessions. Nodes mutate it
//! indirectly: stopping a session fires `SessionClosed`, which the map's
//! listener task turns into a removal.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::capabilities::Capabilities;
use crate::error::GridError;
use crate::events::{EventBus, GridEvent};
use crate::{NodeId, SessionId, SlotId};

/// A running automation session on one slot of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub node_id: NodeId,
    pub node_uri: String,
    pub slot_id: SlotId,
    pub stereotype: Capabilities,
    /// Capabilities the driver negotiated (may carry more than the request).
    pub capabilities: Capabilities,
    pub started_at: DateTime<Utc>,
    pub uri: String,
}

impl Session {
    pub fn duration_millis(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_milliseconds()
    }
}

/// Registry of live session-id → session descriptor.
pub struct SessionMap {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl SessionMap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Subscribe to `SessionClosed` and auto-remove closed sessions. Runs
    /// until the bus is dropped.
    pub fn spawn_listener(self: &Arc<Self>, bus: &EventBus) {
        let map = Arc::clone(self);
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(GridEvent::SessionClosed { session_id, .. }) => {
                        map.remove(session_id).await;
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "session map lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Record a session. No two sessions may share an id.
    pub async fn add(&self, session: Session) -> Result<(), GridError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(GridError::InvalidPayload(format!(
                "duplicate session id {}",
                session.id
            )));
        }
        debug!(session = %session.id, node = %session.node_id, "session recorded");
        sessions.insert(session.id, session);
        Ok(())
    }

    pub async fn get(&self, id: SessionId) -> Result<Session, GridError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| GridError::NotFound(format!("session {id}")))
    }

    pub async fn remove(&self, id: SessionId) -> Option<Session> {
        let removed = self.sessions.write().await.remove(&id);
        if removed.is_some() {
            debug!(session = %id, "session removed");
        }
        removed
    }

    pub async fn all(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
