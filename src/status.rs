//! Read-only wire views: slot, node, and distributor status snapshots.
//!
//! These are the shapes returned by `GET /se/grid/distributor/status` and fed
//! to the external GraphQL status endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::capabilities::Capabilities;
use crate::{NodeId, SessionId, SlotId};

/// Admissible-for-scheduling flag of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Availability {
    Up,
    Down,
    Draining,
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Availability::Up => write!(f, "UP"),
            Availability::Down => write!(f, "DOWN"),
            Availability::Draining => write!(f, "DRAINING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotState {
    Free,
    Reserved,
    Active,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotStatus {
    pub id: SlotId,
    pub stereotype: Capabilities,
    pub state: SlotState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    /// Most recent session start on this slot; `None` if never used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_started: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub uri: String,
    pub availability: Availability,
    pub draining: bool,
    pub max_session_count: usize,
    pub slots: Vec<SlotStatus>,
}

impl NodeStatus {
    /// Advertised capacity: count of FREE slots when UP and not draining,
    /// zero otherwise.
    pub fn capacity(&self) -> usize {
        if self.availability != Availability::Up || self.draining {
            return 0;
        }
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Free)
            .count()
    }

    /// (occupied, total) slot counts; occupied = RESERVED + ACTIVE.
    pub fn load(&self) -> (usize, usize) {
        let occupied = self
            .slots
            .iter()
            .filter(|s| s.state != SlotState::Free)
            .count();
        (occupied, self.slots.len())
    }

    /// FREE slots whose stereotype matches `requested`.
    pub fn free_matching(&self, requested: &Capabilities) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Free && s.stereotype.matches(requested))
            .count()
    }

    /// Whether any slot (in any state) advertises a matching stereotype.
    pub fn supports(&self, requested: &Capabilities) -> bool {
        self.slots.iter().any(|s| s.stereotype.matches(requested))
    }

    /// Number of distinct stereotypes this node supports.
    pub fn stereotype_count(&self) -> usize {
        let mut seen: Vec<&Capabilities> = Vec::new();
        for slot in &self.slots {
            if !seen.contains(&&slot.stereotype) {
                seen.push(&slot.stereotype);
            }
        }
        seen.len()
    }

    /// Earliest `lastStarted` across the node's slots. A never-used slot
    /// counts as the earliest possible instant.
    pub fn earliest_last_started(&self) -> Option<DateTime<Utc>> {
        if self.slots.iter().any(|s| s.last_started.is_none()) {
            return None;
        }
        self.slots.iter().filter_map(|s| s.last_started).min()
    }

    pub fn has_active_slots(&self) -> bool {
        self.slots.iter().any(|s| s.state != SlotState::Free)
    }
}

/// Aggregated snapshot of the whole grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributorStatus {
    pub uri: String,
    pub nodes: Vec<NodeStatus>,
    pub has_capacity: bool,
}
