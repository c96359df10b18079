//! Local node: owns a set of typed slots and the sessions running on them.
//!
//! A node serializes its own slot mutations behind one lock; `new_session`
//! and `stop` are mutually exclusive per node. The factory call itself runs
//! with the slot RESERVED and the lock released, so a slow driver start never
//! blocks status queries or stops.

pub mod factory;
pub mod health;
pub mod slot;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::capabilities::Capabilities;
use crate::error::GridError;
use crate::events::{EventBus, GridEvent};
use crate::secret::Secret;
use crate::sessions::Session;
use crate::status::{Availability, NodeStatus};
use crate::{NodeId, SessionId};

use factory::{CreateSessionRequest, SessionFactory};
use health::{AlwaysUp, HealthCheck, HealthStatus};
use slot::{select_slot, Slot};

/// The contract every node presents to the distributor. Remote wrappers
/// re-exposing this over HTTP are external collaborators; [`LocalNode`] is
/// the in-process implementation.
#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> NodeId;

    fn uri(&self) -> &str;

    /// Secret presented at registration; compared by the distributor.
    fn registration_secret(&self) -> &Secret;

    /// Place one desired-capability alternative on a FREE matching slot.
    async fn new_session(&self, request: CreateSessionRequest) -> Result<Session, GridError>;

    /// Terminate a session and free its slot. Unknown id is a no-op
    /// returning `NotFound`.
    async fn stop(&self, session_id: SessionId) -> Result<(), GridError>;

    /// Stop accepting new sessions. Monotonic.
    async fn drain(&self);

    async fn status(&self) -> NodeStatus;

    async fn health_check(&self) -> HealthStatus;

    /// Record the distributor's health verdict. Ignored once draining.
    async fn set_availability(&self, availability: Availability);
}

// ─── LocalNode ───────────────────────────────────────────────────────────────

pub struct LocalNode {
    id: NodeId,
    uri: String,
    secret: Secret,
    max_session_count: usize,
    bus: EventBus,
    health: Arc<dyn HealthCheck>,
    availability: RwLock<Availability>,
    draining: AtomicBool,
    /// Fired `NodeRemoved` already — a drained node self-removes exactly once.
    removed: AtomicBool,
    slots: Mutex<Vec<Slot>>,
    factories: HashMap<crate::SlotId, Arc<dyn SessionFactory>>,
}

impl LocalNode {
    pub fn builder(uri: impl Into<String>, secret: Secret, bus: EventBus) -> LocalNodeBuilder {
        LocalNodeBuilder {
            id: Uuid::new_v4(),
            uri: uri.into(),
            secret,
            bus,
            max_session_count: None,
            health: Arc::new(AlwaysUp),
            slots: Vec::new(),
            factories: HashMap::new(),
        }
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Fire `NodeRemoved` once, when a draining node has released its last
    /// occupied slot.
    fn self_remove_if_drained_empty(&self, any_occupied: bool) {
        if self.is_draining()
            && !any_occupied
            && !self.removed.swap(true, Ordering::SeqCst)
        {
            info!(node = %self.id, "drained node is empty, removing itself");
            self.bus.publish(GridEvent::NodeRemoved { node_id: self.id });
        }
    }
}

#[async_trait]
impl Node for LocalNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    fn registration_secret(&self) -> &Secret {
        &self.secret
    }

    async fn new_session(&self, request: CreateSessionRequest) -> Result<Session, GridError> {
        if self.is_draining() {
            return Err(GridError::Draining);
        }

        // Reserve under the slot lock, then start the session with the lock
        // released.
        let (slot_id, stereotype) = {
            let mut slots = self.slots.lock().await;
            if !slots.iter().any(|s| s.matches(&request.capabilities)) {
                return Err(GridError::NoMatch);
            }
            let occupied = slots.iter().filter(|s| !s.is_free()).count();
            if occupied >= self.max_session_count {
                return Err(GridError::NoCapacity);
            }
            let index =
                select_slot(&slots, &request.capabilities).ok_or(GridError::NoCapacity)?;
            slots[index].reserve();
            (slots[index].id(), slots[index].stereotype().clone())
        };

        let factory = self
            .factories
            .get(&slot_id)
            .cloned()
            .expect("every slot is registered with a factory");

        if !factory.matches(&request.capabilities) {
            release_slot(&self.slots, slot_id).await;
            return Err(GridError::NoMatch);
        }

        match factory.create(&request).await {
            Ok(created) => {
                let started_at = Utc::now();
                let mut slots = self.slots.lock().await;
                let slot = slots
                    .iter_mut()
                    .find(|s| s.id() == slot_id)
                    .expect("reserved slot still present");
                slot.activate(created.session_id, started_at);
                info!(
                    node = %self.id,
                    session = %created.session_id,
                    "session started"
                );
                Ok(Session {
                    id: created.session_id,
                    node_id: self.id,
                    node_uri: self.uri.clone(),
                    slot_id,
                    stereotype,
                    capabilities: created.capabilities,
                    started_at,
                    uri: created.uri,
                })
            }
            Err(e) => {
                // The slot must not leak on factory failure.
                release_slot(&self.slots, slot_id).await;
                warn!(node = %self.id, err = %e, "session factory failed");
                Err(e)
            }
        }
    }

    async fn stop(&self, session_id: SessionId) -> Result<(), GridError> {
        let any_occupied = {
            let mut slots = self.slots.lock().await;
            let slot = slots
                .iter_mut()
                .find(|s| s.session_id() == Some(session_id))
                .ok_or_else(|| GridError::NotFound(format!("session {session_id}")))?;
            slot.release();
            slots.iter().any(|s| !s.is_free())
        };

        info!(node = %self.id, session = %session_id, "session stopped");
        self.bus.publish(GridEvent::SessionClosed {
            session_id,
            node_id: self.id,
        });
        self.self_remove_if_drained_empty(any_occupied);
        Ok(())
    }

    async fn drain(&self) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.availability.write().await = Availability::Draining;
        info!(node = %self.id, "drain started");
        self.bus
            .publish(GridEvent::NodeDrainStarted { node_id: self.id });

        let any_occupied = self.slots.lock().await.iter().any(|s| !s.is_free());
        self.self_remove_if_drained_empty(any_occupied);
    }

    async fn status(&self) -> NodeStatus {
        let slots = self.slots.lock().await;
        NodeStatus {
            node_id: self.id,
            uri: self.uri.clone(),
            availability: *self.availability.read().await,
            draining: self.is_draining(),
            max_session_count: self.max_session_count,
            slots: slots.iter().map(Slot::status).collect(),
        }
    }

    async fn health_check(&self) -> HealthStatus {
        if self.is_draining() {
            return HealthStatus {
                availability: Availability::Draining,
                reason: "node is draining".into(),
            };
        }
        self.health.check().await
    }

    async fn set_availability(&self, availability: Availability) {
        if self.is_draining() {
            return;
        }
        let mut current = self.availability.write().await;
        if *current != availability {
            info!(node = %self.id, from = %current, to = %availability, "availability changed");
            *current = availability;
        }
    }
}

async fn release_slot(slots: &Mutex<Vec<Slot>>, slot_id: crate::SlotId) {
    let mut slots = slots.lock().await;
    if let Some(slot) = slots.iter_mut().find(|s| s.id() == slot_id) {
        slot.release();
    }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

pub struct LocalNodeBuilder {
    id: NodeId,
    uri: String,
    secret: Secret,
    bus: EventBus,
    max_session_count: Option<usize>,
    health: Arc<dyn HealthCheck>,
    slots: Vec<Slot>,
    factories: HashMap<crate::SlotId, Arc<dyn SessionFactory>>,
}

impl LocalNodeBuilder {
    pub fn id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    /// Register a slot able to run sessions matching `stereotype` via
    /// `factory`.
    pub fn add_slot(mut self, stereotype: Capabilities, factory: Arc<dyn SessionFactory>) -> Self {
        let slot = Slot::new(stereotype);
        self.factories.insert(slot.id(), factory);
        self.slots.push(slot);
        self
    }

    /// Register `count` identical slots.
    pub fn add_slots(
        mut self,
        stereotype: Capabilities,
        count: usize,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        for _ in 0..count {
            self = self.add_slot(stereotype.clone(), factory.clone());
        }
        self
    }

    pub fn health_check(mut self, health: Arc<dyn HealthCheck>) -> Self {
        self.health = health;
        self
    }

    /// Cap on concurrent sessions; defaults to the slot count.
    pub fn max_session_count(mut self, max: usize) -> Self {
        self.max_session_count = Some(max);
        self
    }

    pub fn build(self) -> Arc<LocalNode> {
        let max_session_count = self.max_session_count.unwrap_or(self.slots.len());
        Arc::new(LocalNode {
            id: self.id,
            uri: self.uri,
            secret: self.secret,
            max_session_count,
            bus: self.bus,
            health: self.health,
            availability: RwLock::new(Availability::Up),
            draining: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            slots: Mutex::new(self.slots),
            factories: self.factories,
        })
    }
}

// ─── Hosted node registry ────────────────────────────────────────────────────

/// In-process nodes known to this grid, addressable by the HTTP registration
/// route. The standalone deployment hosts its nodes here; the distributor's
/// registration table is separate and only populated through `add`.
#[derive(Default)]
pub struct HostedNodes {
    nodes: RwLock<HashMap<NodeId, Arc<dyn Node>>>,
}

impl HostedNodes {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn host(&self, node: Arc<dyn Node>) {
        self.nodes.write().await.insert(node.id(), node);
    }

    pub async fn get(&self, id: NodeId) -> Option<Arc<dyn Node>> {
        self.nodes.read().await.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::factory::StubFactory;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    fn chrome() -> Capabilities {
        let mut caps = Capabilities::new();
        caps.insert("browserName", json!("chrome"));
        caps
    }

    fn request() -> CreateSessionRequest {
        CreateSessionRequest {
            request_id: Uuid::new_v4(),
            capabilities: chrome(),
        }
    }

    fn chrome_node(bus: &EventBus, slots: usize) -> Arc<LocalNode> {
        LocalNode::builder("http://node.test:5555", Secret::none(), bus.clone())
            .add_slots(chrome(), slots, Arc::new(StubFactory::new(chrome())))
            .build()
    }

    #[tokio::test]
    async fn new_session_occupies_a_slot() {
        let bus = EventBus::new();
        let node = chrome_node(&bus, 2);

        let session = node.new_session(request()).await.unwrap();
        assert_eq!(session.node_id, node.id());

        let status = node.status().await;
        assert_eq!(status.capacity(), 1);
        assert_eq!(status.load(), (1, 2));
    }

    #[tokio::test]
    async fn no_match_and_no_capacity_are_distinguished() {
        let bus = EventBus::new();
        let node = chrome_node(&bus, 1);

        let mut edge = Capabilities::new();
        edge.insert("browserName", json!("MicrosoftEdge"));
        let err = node
            .new_session(CreateSessionRequest {
                request_id: Uuid::new_v4(),
                capabilities: edge,
            })
            .await
            .unwrap_err();
        assert_eq!(err, GridError::NoMatch);

        node.new_session(request()).await.unwrap();
        let err = node.new_session(request()).await.unwrap_err();
        assert_eq!(err, GridError::NoCapacity);
    }

    #[tokio::test]
    async fn factory_failure_releases_the_slot() {
        let bus = EventBus::new();
        let factory = Arc::new(StubFactory::failing(chrome()));
        let node = LocalNode::builder("http://node.test:5555", Secret::none(), bus.clone())
            .add_slot(chrome(), factory.clone())
            .build();

        let err = node.new_session(request()).await.unwrap_err();
        assert!(matches!(err, GridError::FactoryFailed(_)));
        assert_eq!(node.status().await.capacity(), 1);

        // The slot is reusable once the factory recovers.
        factory.set_failing(false);
        node.new_session(request()).await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let bus = EventBus::new();
        let node = chrome_node(&bus, 1);
        let session = node.new_session(request()).await.unwrap();

        node.stop(session.id).await.unwrap();
        let err = node.stop(session.id).await.unwrap_err();
        assert!(matches!(err, GridError::NotFound(_)));
        assert_eq!(node.status().await.capacity(), 1);
    }

    #[tokio::test]
    async fn draining_rejects_new_sessions_and_self_removes_when_empty() {
        let bus = EventBus::new();
        let node = chrome_node(&bus, 2);
        let s1 = node.new_session(request()).await.unwrap();
        let s2 = node.new_session(request()).await.unwrap();

        let mut rx = bus.subscribe();
        node.drain().await;
        assert_eq!(node.new_session(request()).await.unwrap_err(), GridError::Draining);
        assert!(matches!(
            rx.recv().await.unwrap(),
            GridEvent::NodeDrainStarted { .. }
        ));

        node.stop(s1.id).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            GridEvent::SessionClosed { .. }
        ));
        // Still one session running: no removal yet.
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        node.stop(s2.id).await.unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            GridEvent::SessionClosed { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            GridEvent::NodeRemoved { node_id } if node_id == node.id()
        ));
    }

    #[tokio::test]
    async fn drain_on_idle_node_removes_immediately() {
        let bus = EventBus::new();
        let node = chrome_node(&bus, 1);
        let mut rx = bus.subscribe();

        node.drain().await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            GridEvent::NodeDrainStarted { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            GridEvent::NodeRemoved { .. }
        ));

        // Draining is monotonic: a second drain fires nothing.
        node.drain().await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn availability_is_pinned_while_draining() {
        let bus = EventBus::new();
        let node = chrome_node(&bus, 1);
        node.drain().await;
        node.set_availability(Availability::Up).await;
        assert_eq!(node.status().await.availability, Availability::Draining);
    }
}
