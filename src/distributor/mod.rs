//! The distributor: schedules new-session requests onto the node fleet.
//!
//! Components are loosely coupled through the event bus — the distributor
//! holds no back-edges into nodes beyond the trait handle it registered.
//! Scheduling passes are serialized by one mutex; the candidate ranking reads
//! an immutable snapshot of node statuses taken outside any node lock. The
//! blocking `new_session` wait is a oneshot channel resolved by the
//! scheduling loop.

pub mod ranking;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::capabilities::{Capabilities, NewSessionPayload};
use crate::error::GridError;
use crate::events::{EventBus, GridEvent, RejectionReason};
use crate::node::factory::CreateSessionRequest;
use crate::node::Node;
use crate::queue::{NewSessionQueue, SessionRequest};
use crate::secret::Secret;
use crate::sessions::{Session, SessionMap};
use crate::status::{Availability, DistributorStatus, NodeStatus};
use crate::{NodeId, RequestId, SessionId};

use ranking::Candidate;

/// Tunables the distributor is built with.
#[derive(Debug, Clone)]
pub struct DistributorSettings {
    /// Public address of this grid, reported in status snapshots.
    pub uri: String,
    /// Secret every registering node must present.
    pub secret: Secret,
    /// How long a new-session caller waits before `TIMEOUT`.
    pub request_timeout: Duration,
    /// Health reconciliation tick.
    pub health_check_interval: Duration,
    /// How long a session whose owning node is gone stays in the session
    /// map. Zero disables the sweeper.
    pub session_ttl: Duration,
}

struct NodeEntry {
    node: Arc<dyn Node>,
    insertion: u64,
}

type Waiter = oneshot::Sender<Result<Session, GridError>>;

pub struct Distributor {
    settings: DistributorSettings,
    bus: EventBus,
    queue: Arc<NewSessionQueue>,
    sessions: Arc<SessionMap>,
    nodes: RwLock<HashMap<NodeId, NodeEntry>>,
    insertion_seq: AtomicU64,
    waiters: Mutex<HashMap<RequestId, Waiter>>,
    /// Serializes scheduling passes; `refresh` and the event loop share it.
    pass_lock: Mutex<()>,
    /// First-seen instants for sessions whose owning node is unregistered.
    orphans: Mutex<HashMap<SessionId, Instant>>,
    shutdown: watch::Sender<bool>,
}

impl Distributor {
    pub fn new(
        settings: DistributorSettings,
        bus: EventBus,
        queue: Arc<NewSessionQueue>,
        sessions: Arc<SessionMap>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            bus,
            queue,
            sessions,
            nodes: RwLock::new(HashMap::new()),
            insertion_seq: AtomicU64::new(0),
            waiters: Mutex::new(HashMap::new()),
            pass_lock: Mutex::new(()),
            orphans: Mutex::new(HashMap::new()),
            shutdown,
        })
    }

    /// Start the event-driven scheduling loop and the health loop.
    pub fn spawn_loops(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut rx = self.bus.subscribe();
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    event = rx.recv() => match event {
                        Ok(event) => this.handle_event(event).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "scheduler lagged behind the event bus");
                            this.schedule_pass().await;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.settings.health_check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        this.reconcile_health().await;
                        this.sweep_orphans().await;
                        this.schedule_pass().await;
                    }
                }
            }
        });
    }

    // ─── Public contract ─────────────────────────────────────────────────────

    /// Register a node. Verifies the shared secret; idempotent on node id —
    /// the first registration wins. Fires `NodeAdded` on first add only.
    pub async fn add(&self, node: Arc<dyn Node>) -> Result<(), GridError> {
        let node_id = node.id();
        if !self.settings.secret.matches(node.registration_secret()) {
            warn!(node = %node_id, "node registration rejected: secret mismatch");
            self.bus.publish(GridEvent::NodeRejected { node_id });
            return Err(GridError::NodeRejected(node_id));
        }
        {
            let mut nodes = self.nodes.write().await;
            if nodes.contains_key(&node_id) {
                return Ok(());
            }
            let insertion = self.insertion_seq.fetch_add(1, Ordering::SeqCst);
            nodes.insert(node_id, NodeEntry { node, insertion });
        }
        info!(node = %node_id, "node registered");
        self.bus.publish(GridEvent::NodeAdded { node_id });
        Ok(())
    }

    /// Unregister a node immediately, regardless of active sessions. The
    /// sessions it owned stay in the map until the orphan sweeper or an
    /// explicit close takes them.
    pub async fn remove(&self, node_id: NodeId) -> Result<(), GridError> {
        if self.nodes.write().await.remove(&node_id).is_none() {
            return Err(GridError::NotFound(format!("node {node_id}")));
        }
        info!(node = %node_id, "node unregistered");
        self.bus.publish(GridEvent::NodeRemoved { node_id });
        Ok(())
    }

    /// Forward `drain` to the node. It stops accepting sessions and
    /// self-removes once empty.
    pub async fn drain(&self, node_id: NodeId) -> Result<(), GridError> {
        let node = self
            .get_node(node_id)
            .await
            .ok_or_else(|| GridError::NotFound(format!("node {node_id}")))?;
        node.drain().await;
        Ok(())
    }

    /// Create a session. Blocks up to `request_timeout` for a placement, a
    /// rejection, or the deadline.
    pub async fn new_session(&self, body: &Value) -> Result<Session, GridError> {
        let payload = NewSessionPayload::parse(body)?;
        let alternatives = payload.alternatives()?;

        // A request no registered stereotype can ever satisfy is rejected up
        // front. With zero registered nodes it waits instead — a node may
        // still join before the deadline.
        let statuses = self.node_statuses().await;
        if !statuses.is_empty() {
            let supported = alternatives
                .iter()
                .any(|alt| statuses.iter().any(|(status, _)| status.supports(alt)));
            if !supported {
                return Err(GridError::UnsupportedCapabilities);
            }
        }

        let request = SessionRequest::new(alternatives, self.settings.request_timeout);
        let request_id = request.request_id;
        let deadline = request.deadline;

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(request_id, tx);

        if !self.queue.offer_last(request).await {
            self.waiters.lock().await.remove(&request_id);
            return Err(GridError::Cancelled);
        }
        debug!(request = %request_id, "new session request queued");

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            // The waiter was dropped without an answer: shutdown.
            Ok(Err(_)) => Err(GridError::Cancelled),
            Err(_) => {
                self.waiters.lock().await.remove(&request_id);
                // Fires the TIMEOUT rejection if the request is still queued.
                self.queue.remove(request_id).await;
                Err(GridError::Timeout)
            }
        }
    }

    /// Force an immediate reconciliation pass: health recheck plus a
    /// scheduling attempt.
    pub async fn refresh(&self) {
        self.reconcile_health().await;
        self.sweep_orphans().await;
        self.schedule_pass().await;
    }

    /// Aggregated snapshot of every registered node.
    pub async fn status(&self) -> DistributorStatus {
        let nodes: Vec<NodeStatus> = self
            .node_statuses()
            .await
            .into_iter()
            .map(|(status, _)| status)
            .collect();
        let has_capacity = nodes.iter().any(|n| n.capacity() > 0);
        DistributorStatus {
            uri: self.settings.uri.clone(),
            nodes,
            has_capacity,
        }
    }

    /// Nodes currently admissible for scheduling: UP and not draining.
    pub async fn available_nodes(&self) -> HashSet<NodeId> {
        self.node_statuses()
            .await
            .into_iter()
            .filter(|(status, _)| {
                status.availability == Availability::Up && !status.draining
            })
            .map(|(status, _)| status.node_id)
            .collect()
    }

    /// Stop the loops, cancel everything pending, and fail all waiters.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.queue.shut_down().await;
        let mut waiters = self.waiters.lock().await;
        for (_, tx) in waiters.drain() {
            let _ = tx.send(Err(GridError::Cancelled));
        }
        info!("distributor shut down");
    }

    // ─── Scheduling ──────────────────────────────────────────────────────────

    async fn handle_event(&self, event: GridEvent) {
        match event {
            GridEvent::NewSessionRequest { .. }
            | GridEvent::NodeAdded { .. }
            | GridEvent::NodeHeartbeat { .. }
            | GridEvent::SessionClosed { .. } => self.schedule_pass().await,
            GridEvent::NodeRemoved { node_id } => {
                // Self-removal of a drained-empty node.
                if self.nodes.write().await.remove(&node_id).is_some() {
                    info!(node = %node_id, "node unregistered");
                }
                self.schedule_pass().await;
            }
            GridEvent::NewSessionRejected { request_id, reason } => {
                let err = match reason {
                    RejectionReason::Timeout => GridError::Timeout,
                    RejectionReason::Cancelled => GridError::Cancelled,
                };
                self.complete_waiter(request_id, Err(err)).await;
            }
            GridEvent::NodeDrainStarted { .. } | GridEvent::NodeRejected { .. } => {}
        }
    }

    async fn schedule_pass(&self) {
        let _guard = self.pass_lock.lock().await;

        for request_id in self.queue.purge_expired().await {
            self.complete_waiter(request_id, Err(GridError::Timeout)).await;
        }

        loop {
            let Some(head) = self.queue.peek().await else { break };
            let request_id = head.request_id;

            let statuses = self.node_statuses().await;
            let mut chosen: Option<(Capabilities, Candidate)> = None;
            for alt in &head.alternatives {
                let candidates: Vec<Candidate> = statuses
                    .iter()
                    .filter_map(|(status, insertion)| {
                        Candidate::evaluate(status, alt, *insertion)
                    })
                    .collect();
                if let Some(best) = ranking::select_best(candidates) {
                    chosen = Some((alt.clone(), best));
                    break;
                }
            }
            // No candidate right now: leave the request queued; a later
            // event retries.
            let Some((capabilities, best)) = chosen else { break };

            let Some(request) = self.queue.remove(request_id).await else {
                // Expired at removal; the queue fired the rejection.
                self.complete_waiter(request_id, Err(GridError::Timeout)).await;
                continue;
            };

            let Some(node) = self.get_node(best.node_id).await else {
                // The node vanished between snapshot and placement.
                self.requeue_or_reject(request, GridError::NoCapacity).await;
                break;
            };

            debug!(request = %request_id, node = %best.node_id, "placing session");
            match node
                .new_session(CreateSessionRequest {
                    request_id,
                    capabilities,
                })
                .await
            {
                Ok(session) => {
                    if let Err(e) = self.sessions.add(session.clone()).await {
                        warn!(session = %session.id, err = %e, "failed to record session");
                    }
                    info!(
                        session = %session.id,
                        node = %session.node_id,
                        "session placed"
                    );
                    self.complete_waiter(request_id, Ok(session)).await;
                }
                Err(e @ (GridError::NoCapacity | GridError::FactoryFailed(_))) => {
                    self.requeue_or_reject(request, e).await;
                    break;
                }
                Err(GridError::Draining | GridError::NoMatch) => {
                    // Lost the race with a drain or a slot change.
                    self.requeue_or_reject(request, GridError::NoCapacity).await;
                    break;
                }
                Err(other) => {
                    self.complete_waiter(request_id, Err(other)).await;
                }
            }
        }
    }

    /// Put a transiently failed request back at the head, or reject it if
    /// its deadline has passed.
    async fn requeue_or_reject(&self, request: SessionRequest, cause: GridError) {
        let request_id = request.request_id;
        if request.is_expired() {
            // Surface a factory failure as such; everything else transient
            // becomes a timeout.
            let err = match cause {
                GridError::FactoryFailed(_) => cause,
                _ => GridError::Timeout,
            };
            self.bus.publish(GridEvent::NewSessionRejected {
                request_id,
                reason: RejectionReason::Timeout,
            });
            self.complete_waiter(request_id, Err(err)).await;
            return;
        }
        debug!(request = %request_id, cause = %cause, "placement failed, retrying");
        if !self.queue.offer_first(request.clone()).await {
            let err = if request.is_expired() {
                GridError::Timeout
            } else {
                GridError::Cancelled
            };
            self.complete_waiter(request_id, Err(err)).await;
        }
    }

    // ─── Health reconciliation ───────────────────────────────────────────────

    async fn reconcile_health(&self) {
        let entries: Vec<Arc<dyn Node>> = {
            let nodes = self.nodes.read().await;
            nodes.values().map(|e| Arc::clone(&e.node)).collect()
        };

        for node in entries {
            let before = node.status().await;
            // Never hold the registry lock across the check call.
            let verdict = node.health_check().await;

            if before.draining {
                // A drained node that emptied while we were not looking is
                // removed here as well as via its own NodeRemoved event.
                if !before.has_active_slots()
                    && self.nodes.write().await.remove(&before.node_id).is_some()
                {
                    info!(node = %before.node_id, "drained node unregistered");
                    self.bus
                        .publish(GridEvent::NodeRemoved { node_id: before.node_id });
                }
                continue;
            }

            if before.availability != verdict.availability {
                match verdict.availability {
                    Availability::Down => {
                        warn!(node = %before.node_id, reason = %verdict.reason, "node went down")
                    }
                    Availability::Up => {
                        info!(node = %before.node_id, reason = %verdict.reason, "node recovered")
                    }
                    Availability::Draining => {}
                }
                node.set_availability(verdict.availability).await;
            }

            self.bus.publish(GridEvent::NodeHeartbeat {
                status: node.status().await,
            });
        }
    }

    /// Drop sessions whose owning node has been unregistered for longer than
    /// the TTL.
    async fn sweep_orphans(&self) {
        if self.settings.session_ttl.is_zero() {
            return;
        }
        let registered: HashSet<NodeId> = self.nodes.read().await.keys().copied().collect();
        let sessions = self.sessions.all().await;
        let now = Instant::now();

        let expired: Vec<SessionId> = {
            let mut orphans = self.orphans.lock().await;
            orphans.retain(|id, _| sessions.iter().any(|s| s.id == *id));
            let mut expired = Vec::new();
            for session in &sessions {
                if registered.contains(&session.node_id) {
                    orphans.remove(&session.id);
                    continue;
                }
                let first_seen = *orphans.entry(session.id).or_insert(now);
                if now.duration_since(first_seen) >= self.settings.session_ttl {
                    expired.push(session.id);
                    orphans.remove(&session.id);
                }
            }
            expired
        };

        for session_id in expired {
            warn!(session = %session_id, "sweeping orphaned session, owning node is gone");
            self.sessions.remove(session_id).await;
        }
    }

    // ─── Internals ───────────────────────────────────────────────────────────

    async fn node_statuses(&self) -> Vec<(NodeStatus, u64)> {
        let entries: Vec<(Arc<dyn Node>, u64)> = {
            let nodes = self.nodes.read().await;
            nodes
                .values()
                .map(|e| (Arc::clone(&e.node), e.insertion))
                .collect()
        };
        let mut statuses = Vec::with_capacity(entries.len());
        for (node, insertion) in entries {
            statuses.push((node.status().await, insertion));
        }
        statuses
    }

    async fn get_node(&self, node_id: NodeId) -> Option<Arc<dyn Node>> {
        self.nodes.read().await.get(&node_id).map(|e| Arc::clone(&e.node))
    }

    async fn complete_waiter(&self, request_id: RequestId, result: Result<Session, GridError>) {
        if let Some(tx) = self.waiters.lock().await.remove(&request_id) {
            let _ = tx.send(result);
        }
    }
}
