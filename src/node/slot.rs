//! Slots: the units of concurrency a node owns.
//!
//! State machine per slot:
//!
//! ```text
//! FREE ──reserve──► RESERVED ──activate──► ACTIVE
//!   ▲                  │                      │
//!   └─────release──────┴──────release─────────┘
//! ```
//!
//! A session id is associated with a slot only while ACTIVE; a RESERVED slot
//! is mid-placement and owned by exactly one in-flight `new_session` call.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::capabilities::Capabilities;
use crate::status::{SlotState, SlotStatus};
use crate::{SessionId, SlotId};

#[derive(Debug, Clone)]
pub struct Slot {
    id: SlotId,
    stereotype: Capabilities,
    state: SlotState,
    session_id: Option<SessionId>,
    last_started: Option<DateTime<Utc>>,
}

impl Slot {
    pub fn new(stereotype: Capabilities) -> Self {
        Self {
            id: Uuid::new_v4(),
            stereotype,
            state: SlotState::Free,
            session_id: None,
            last_started: None,
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn stereotype(&self) -> &Capabilities {
        &self.stereotype
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn last_started(&self) -> Option<DateTime<Utc>> {
        self.last_started
    }

    pub fn is_free(&self) -> bool {
        self.state == SlotState::Free
    }

    pub fn matches(&self, requested: &Capabilities) -> bool {
        self.stereotype.matches(requested)
    }

    /// FREE → RESERVED. Panics in debug builds if the slot is not free;
    /// callers must hold the node's slot lock across the check.
    pub fn reserve(&mut self) {
        debug_assert_eq!(self.state, SlotState::Free, "reserving a non-free slot");
        self.state = SlotState::Reserved;
    }

    /// RESERVED → ACTIVE, binding the session and stamping `lastStarted`.
    pub fn activate(&mut self, session_id: SessionId, started_at: DateTime<Utc>) {
        debug_assert_eq!(self.state, SlotState::Reserved, "activating an unreserved slot");
        self.state = SlotState::Active;
        self.session_id = Some(session_id);
        self.last_started = Some(started_at);
    }

    /// Any state → FREE. `lastStarted` is unchanged.
    pub fn release(&mut self) {
        self.state = SlotState::Free;
        self.session_id = None;
    }

    pub fn status(&self) -> SlotStatus {
        SlotStatus {
            id: self.id,
            stereotype: self.stereotype.clone(),
            state: self.state,
            session_id: self.session_id,
            last_started: self.last_started,
        }
    }
}

/// Pick the FREE slot matching `requested` that was used least recently
/// (`lastStarted` ascending, never-used first) to spread heat. Returns the
/// index into `slots`.
pub fn select_slot(slots: &[Slot], requested: &Capabilities) -> Option<usize> {
    slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.is_free() && slot.matches(requested))
        .min_by_key(|(_, slot)| slot.last_started)
        .map(|(index, _)| index)
}
