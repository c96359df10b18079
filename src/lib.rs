pub mod capabilities;
pub mod config;
pub mod distributor;
pub mod error;
pub mod events;
pub mod node;
pub mod queue;
pub mod rest;
pub mod secret;
pub mod sessions;
pub mod status;

pub use error::GridError;

use std::sync::Arc;

use config::GridConfig;
use distributor::Distributor;
use events::EventBus;
use node::HostedNodes;
use queue::NewSessionQueue;
use sessions::SessionMap;

pub type NodeId = uuid::Uuid;
pub type SessionId = uuid::Uuid;
pub type RequestId = uuid::Uuid;
pub type SlotId = uuid::Uuid;

/// Shared grid state passed to every HTTP handler and background task.
#[derive(Clone)]
pub struct GridContext {
    pub config: Arc<GridConfig>,
    pub bus: EventBus,
    pub queue: Arc<NewSessionQueue>,
    pub sessions: Arc<SessionMap>,
    pub distributor: Arc<Distributor>,
    /// In-process nodes addressable by the HTTP registration route.
    pub hosted_nodes: Arc<HostedNodes>,
    pub started_at: std::time::Instant,
}

impl GridContext {
    /// Wire the core components together and start their background tasks.
    /// Must run inside a tokio runtime.
    pub fn new(config: GridConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let bus = EventBus::new();

        let queue = Arc::new(NewSessionQueue::new(bus.clone(), config.retry_interval));
        let sessions = SessionMap::new();
        sessions.spawn_listener(&bus);

        let distributor = Distributor::new(
            config.distributor_settings(),
            bus.clone(),
            Arc::clone(&queue),
            Arc::clone(&sessions),
        );
        distributor.spawn_loops();

        Arc::new(Self {
            config,
            bus,
            queue,
            sessions,
            distributor,
            hosted_nodes: HostedNodes::new(),
            started_at: std::time::Instant::now(),
        })
    }
}
