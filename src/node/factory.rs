//! Session factories.
//!
//! A factory knows how to start one kind of browser session. Concrete
//! process- and container-backed launchers live outside the scheduling core
//! and plug in through [`SessionFactory`]; the in-crate [`StubFactory`] backs
//! the integration suite and embedders' smoke tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use uuid::Uuid;

use crate::capabilities::Capabilities;
use crate::error::GridError;
use crate::{RequestId, SessionId};

/// One desired-capability alternative, addressed to a node.
#[derive(Debug, Clone)]
pub struct CreateSessionRequest {
    pub request_id: RequestId,
    pub capabilities: Capabilities,
}

/// What a factory hands back on success.
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub session_id: SessionId,
    /// Capabilities the driver actually negotiated.
    pub capabilities: Capabilities,
    /// Address the running session is reachable at.
    pub uri: String,
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Whether this factory can start a session for `capabilities`.
    fn matches(&self, capabilities: &Capabilities) -> bool;

    /// Start a session. Failures surface as [`GridError::FactoryFailed`];
    /// the owning slot is released by the node.
    async fn create(&self, request: &CreateSessionRequest) -> Result<CreatedSession, GridError>;
}

/// Test-grade factory: succeeds with a synthetic session URI, or fails on
/// demand when toggled.
pub struct StubFactory {
    stereotype: Capabilities,
    fail: AtomicBool,
}

impl StubFactory {
    pub fn new(stereotype: Capabilities) -> Self {
        Self {
            stereotype,
            fail: AtomicBool::new(false),
        }
    }

    pub fn failing(stereotype: Capabilities) -> Self {
        Self {
            stereotype,
            fail: AtomicBool::new(true),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionFactory for StubFactory {
    fn matches(&self, capabilities: &Capabilities) -> bool {
        self.stereotype.matches(capabilities)
    }

    async fn create(&self, request: &CreateSessionRequest) -> Result<CreatedSession, GridError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(GridError::FactoryFailed(
                "stub factory configured to fail".into(),
            ));
        }
        let session_id = Uuid::new_v4();
        Ok(CreatedSession {
            session_id,
            capabilities: request.capabilities.clone(),
            uri: format!("stub://{session_id}"),
        })
    }
}
