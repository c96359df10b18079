//! Pluggable node health checks.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::status::Availability;

/// Outcome of a health probe: the availability verdict plus a
/// human-readable reason.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub availability: Availability,
    pub reason: String,
}

impl HealthStatus {
    pub fn up(reason: impl Into<String>) -> Self {
        Self {
            availability: Availability::Up,
            reason: reason.into(),
        }
    }

    pub fn down(reason: impl Into<String>) -> Self {
        Self {
            availability: Availability::Down,
            reason: reason.into(),
        }
    }
}

/// Health predicate run by the distributor's reconciliation loop. Must never
/// be called while a distributor lock is held.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> HealthStatus;
}

/// Default check: always healthy.
pub struct AlwaysUp;

#[async_trait]
impl HealthCheck for AlwaysUp {
    async fn check(&self) -> HealthStatus {
        HealthStatus::up("node is up")
    }
}

/// Settable check for tests and embedders that track node health externally.
pub struct SettableHealthCheck {
    state: RwLock<HealthStatus>,
}

impl SettableHealthCheck {
    pub fn up() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(HealthStatus::up("node is up")),
        })
    }

    pub fn down(reason: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(HealthStatus::down(reason)),
        })
    }

    pub async fn set(&self, status: HealthStatus) {
        *self.state.write().await = status;
    }
}

#[async_trait]
impl HealthCheck for SettableHealthCheck {
    async fn check(&self) -> HealthStatus {
        self.state.read().await.clone()
    }
}
