//! Grid-wide error taxonomy.
//!
//! Component boundaries convert internal failures into these kinds; no other
//! error type crosses between the queue, nodes, session map, and distributor.
//! The HTTP edge maps each kind to a status code and a WebDriver-style error
//! string via [`GridError::http_status`] and [`GridError::wire_kind`].

use axum::http::StatusCode;

use crate::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    /// No registered node advertises a stereotype matching any requested
    /// alternative. Surfaced immediately; the request is never enqueued.
    #[error("no registered node supports the requested capabilities")]
    UnsupportedCapabilities,

    /// A matching slot exists on the node but none is free right now.
    #[error("node has no free slot for the requested capabilities")]
    NoCapacity,

    /// No slot on the node matches the requested capabilities at all.
    #[error("node has no slot matching the requested capabilities")]
    NoMatch,

    /// The node is draining and accepts no new sessions.
    #[error("node is draining")]
    Draining,

    /// The session factory raised while starting the session. The slot has
    /// already been released.
    #[error("session factory failed: {0}")]
    FactoryFailed(String),

    /// The request deadline elapsed while queued.
    #[error("new session request timed out")]
    Timeout,

    /// The request was dropped by an explicit `clear` or by shutdown.
    #[error("new session request was cancelled")]
    Cancelled,

    /// Registration secret mismatch at node join.
    #[error("node {0} rejected: registration secret mismatch")]
    NodeRejected(NodeId),

    /// Lookup miss on the session map or the node table.
    #[error("not found: {0}")]
    NotFound(String),

    /// The new-session payload could not be parsed into capability
    /// alternatives.
    #[error("invalid new-session payload: {0}")]
    InvalidPayload(String),
}

impl GridError {
    /// WebDriver error string used in the wire-level error envelope.
    pub fn wire_kind(&self) -> &'static str {
        match self {
            GridError::Timeout => "timeout",
            GridError::UnsupportedCapabilities | GridError::InvalidPayload(_) => "invalid argument",
            _ => "session not created",
        }
    }

    /// HTTP status code for this kind at the REST edge.
    pub fn http_status(&self) -> StatusCode {
        match self {
            GridError::FactoryFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GridError::Timeout => StatusCode::REQUEST_TIMEOUT,
            GridError::UnsupportedCapabilities | GridError::InvalidPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            GridError::NodeRejected(_) => StatusCode::UNAUTHORIZED,
            GridError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
