//! New-session request queue.
//!
//! A FIFO with head-injection for retries. The queue owns pending requests
//! and their deadlines; it never hands out an expired request. Event firing
//! happens after the queue lock is released, and the lock is never held
//! across I/O.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::capabilities::Capabilities;
use crate::events::{EventBus, GridEvent, RejectionReason};
use crate::RequestId;

/// A pending new-session request: the desired-capability alternatives plus
/// the deadline after which it must be rejected.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub request_id: RequestId,
    pub alternatives: Vec<Capabilities>,
    pub enqueued_at: DateTime<Utc>,
    pub deadline: Instant,
}

impl SessionRequest {
    pub fn new(alternatives: Vec<Capabilities>, timeout: Duration) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4(),
            alternatives,
            enqueued_at: Utc::now(),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

pub struct NewSessionQueue {
    inner: RwLock<VecDeque<SessionRequest>>,
    bus: EventBus,
    retry_interval: Duration,
    closed: AtomicBool,
}

impl NewSessionQueue {
    pub fn new(bus: EventBus, retry_interval: Duration) -> Self {
        Self {
            inner: RwLock::new(VecDeque::new()),
            bus,
            retry_interval,
            closed: AtomicBool::new(false),
        }
    }

    /// Append a request; fires `NewSessionRequest` iff the append succeeded.
    /// Only fails once the queue is shutting down.
    pub async fn offer_last(&self, request: SessionRequest) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let request_id = request.request_id;
        self.inner.write().await.push_back(request);
        self.bus.publish(GridEvent::NewSessionRequest { request_id });
        true
    }

    /// Insert at the head for a transient-failure retry, and schedule a
    /// delayed re-fire of `NewSessionRequest`. The re-fire is bounded by the
    /// request deadline; an already-expired request is rejected instead.
    pub async fn offer_first(&self, request: SessionRequest) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        if request.is_expired() {
            self.reject(request.request_id, RejectionReason::Timeout);
            return false;
        }

        let request_id = request.request_id;
        let until_deadline = request.deadline.saturating_duration_since(Instant::now());
        let delay = self.retry_interval.min(until_deadline);
        self.inner.write().await.push_front(request);

        let bus = self.bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bus.publish(GridEvent::NewSessionRequest { request_id });
        });
        true
    }

    /// Head of the queue, if any.
    pub async fn peek(&self) -> Option<SessionRequest> {
        self.inner.read().await.front().cloned()
    }

    /// Take a specific request out of the queue. O(1) when the target is at
    /// the head, linear scan otherwise. An expired request is rejected with
    /// `TIMEOUT` and `None` is returned.
    pub async fn remove(&self, request_id: RequestId) -> Option<SessionRequest> {
        let found = {
            let mut queue = self.inner.write().await;
            if queue.front().map(|r| r.request_id) == Some(request_id) {
                queue.pop_front()
            } else {
                queue
                    .iter()
                    .position(|r| r.request_id == request_id)
                    .and_then(|index| queue.remove(index))
            }
        };

        match found {
            Some(request) if request.is_expired() => {
                self.reject(request_id, RejectionReason::Timeout);
                None
            }
            other => other,
        }
    }

    /// Drain all pending requests, rejecting each with `CANCELLED`. Returns
    /// the number drained.
    pub async fn clear(&self) -> usize {
        let drained: Vec<SessionRequest> = self.inner.write().await.drain(..).collect();
        for request in &drained {
            self.reject(request.request_id, RejectionReason::Cancelled);
        }
        drained.len()
    }

    /// Reject every expired request anywhere in the queue with `TIMEOUT`.
    pub async fn purge_expired(&self) -> Vec<RequestId> {
        let expired: Vec<RequestId> = {
            let mut queue = self.inner.write().await;
            let (expired, live): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(SessionRequest::is_expired);
            *queue = live;
            expired.iter().map(|r| r.request_id).collect()
        };
        for request_id in &expired {
            self.reject(*request_id, RejectionReason::Timeout);
        }
        expired
    }

    /// Refuse further offers and cancel everything pending. Returns the
    /// number cancelled.
    pub async fn shut_down(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.clear().await
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    fn reject(&self, request_id: RequestId, reason: RejectionReason) {
        debug!(request = %request_id, ?reason, "request rejected");
        self.bus
            .publish(GridEvent::NewSessionRejected { request_id, reason });
    }
}
