//! Candidate-node ranking.
//!
//! Given the nodes able to serve a request, produce a total order:
//!
//! 1. Load ratio ascending — the least-loaded node wins.
//! 2. Stereotype specialization — among equally loaded nodes, prefer the one
//!    whose free matching slots outnumber the variety of stereotypes it
//!    supports (`free_matching - stereotype_count`, higher first), so a
//!    request for a common browser lands on a narrow node and the diverse
//!    node keeps its rare slots.
//! 3. Least-recently-used — earliest `lastStarted` across the node's slots.
//! 4. Stable insertion (registration) order.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::capabilities::Capabilities;
use crate::status::{Availability, NodeStatus};
use crate::NodeId;

/// A node eligible for one request, reduced to its ranking keys.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub node_id: NodeId,
    /// Registration sequence number; the final tie-break.
    pub insertion: u64,
    occupied: usize,
    total: usize,
    specialization: i64,
    earliest_last_started: Option<DateTime<Utc>>,
}

impl Candidate {
    /// Evaluate a node for `requested`. `None` when the node cannot serve it
    /// right now: not UP, draining, or without a free matching slot.
    pub fn evaluate(
        status: &NodeStatus,
        requested: &Capabilities,
        insertion: u64,
    ) -> Option<Candidate> {
        if status.availability != Availability::Up || status.draining {
            return None;
        }
        let free_matching = status.free_matching(requested);
        if free_matching == 0 || status.capacity() == 0 {
            return None;
        }
        let (occupied, total) = status.load();
        Some(Candidate {
            node_id: status.node_id,
            insertion,
            occupied,
            total,
            specialization: free_matching as i64 - status.stereotype_count() as i64,
            earliest_last_started: status.earliest_last_started(),
        })
    }
}

/// Total order over candidates; `Ordering::Less` means preferred.
pub fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    // occupied/total compared without floats: a/b < c/d  ⇔  a*d < c*b.
    // total > 0 is guaranteed by evaluate (a free matching slot exists).
    let load = (a.occupied * b.total).cmp(&(b.occupied * a.total));
    load.then_with(|| b.specialization.cmp(&a.specialization))
        // Option ordering puts never-used (None) first, which is exactly
        // "earliest lastStarted wins".
        .then_with(|| a.earliest_last_started.cmp(&b.earliest_last_started))
        .then_with(|| a.insertion.cmp(&b.insertion))
}

/// The top-ranked candidate, if any.
pub fn select_best(candidates: Vec<Candidate>) -> Option<Candidate> {
    candidates.into_iter().min_by(compare)
}
