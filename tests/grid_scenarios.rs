//! End-to-end scheduling scenarios driven through the library wiring:
//! ranking, draining, health recovery, timeouts, and the registration laws.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use gridd::capabilities::Capabilities;
use gridd::distributor::{Distributor, DistributorSettings};
use gridd::error::GridError;
use gridd::events::EventBus;
use gridd::node::factory::StubFactory;
use gridd::node::health::{HealthStatus, SettableHealthCheck};
use gridd::node::{LocalNode, Node};
use gridd::queue::NewSessionQueue;
use gridd::secret::Secret;
use gridd::sessions::SessionMap;
use gridd::NodeId;

struct TestGrid {
    bus: EventBus,
    queue: Arc<NewSessionQueue>,
    sessions: Arc<SessionMap>,
    distributor: Arc<Distributor>,
}

fn grid(request_timeout: Duration) -> TestGrid {
    grid_with_secret(request_timeout, Secret::none())
}

fn grid_with_secret(request_timeout: Duration, secret: Secret) -> TestGrid {
    let bus = EventBus::new();
    let queue = Arc::new(NewSessionQueue::new(bus.clone(), Duration::from_millis(20)));
    let sessions = SessionMap::new();
    sessions.spawn_listener(&bus);

    let distributor = Distributor::new(
        DistributorSettings {
            uri: "http://localhost:4444".into(),
            secret,
            request_timeout,
            health_check_interval: Duration::from_millis(100),
            session_ttl: Duration::from_secs(300),
        },
        bus.clone(),
        Arc::clone(&queue),
        Arc::clone(&sessions),
    );
    distributor.spawn_loops();

    TestGrid {
        bus,
        queue,
        sessions,
        distributor,
    }
}

fn caps(browser: &str) -> Capabilities {
    let mut c = Capabilities::new();
    c.insert("browserName", json!(browser));
    c
}

fn payload(browser: &str) -> Value {
    json!({"capabilities": {"alwaysMatch": {"browserName": browser}}})
}

/// A node with `count` slots per listed browser, all backed by stub
/// factories.
fn browser_node(bus: &EventBus, browsers: &[(&str, usize)]) -> Arc<LocalNode> {
    let mut builder = LocalNode::builder("http://node.test:5555", Secret::none(), bus.clone());
    for (browser, count) in browsers {
        let stereotype = caps(browser);
        builder = builder.add_slots(
            stereotype.clone(),
            *count,
            Arc::new(StubFactory::new(stereotype)),
        );
    }
    builder.build()
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

// ─── Ranking scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn lightest_loaded_node_wins() {
    let g = grid(Duration::from_secs(5));

    let mut expected: Option<NodeId> = None;
    for load in [4usize, 0, 6, 8] {
        let node = browser_node(&g.bus, &[("chrome", 10)]);
        for _ in 0..load {
            node.new_session(gridd::node::factory::CreateSessionRequest {
                request_id: uuid::Uuid::new_v4(),
                capabilities: caps("chrome"),
            })
            .await
            .unwrap();
        }
        if load == 0 {
            expected = Some(node.id());
        }
        g.distributor.add(node).await.unwrap();
    }

    let session = g.distributor.new_session(&payload("chrome")).await.unwrap();
    assert_eq!(session.node_id, expected.unwrap());
}

#[tokio::test]
async fn equal_nodes_fill_in_insertion_order() {
    let g = grid(Duration::from_secs(5));

    let mut ids = Vec::new();
    for _ in 0..3 {
        let node = browser_node(&g.bus, &[("chrome", 5)]);
        ids.push(node.id());
        g.distributor.add(node).await.unwrap();
    }

    let mut placements = Vec::new();
    for _ in 0..3 {
        let session = g.distributor.new_session(&payload("chrome")).await.unwrap();
        placements.push(session.node_id);
    }
    assert_eq!(placements, ids);
}

#[tokio::test]
async fn common_browsers_avoid_the_specialized_fleet() {
    let g = grid(Duration::from_secs(5));

    let mut edge_capable = Vec::new();
    for _ in 0..3 {
        let node = browser_node(
            &g.bus,
            &[("MicrosoftEdge", 1), ("chrome", 1), ("firefox", 1)],
        );
        edge_capable.push(node.id());
        g.distributor.add(node).await.unwrap();
    }
    let mut chrome_firefox = Vec::new();
    for _ in 0..5 {
        let node = browser_node(&g.bus, &[("chrome", 1), ("firefox", 1)]);
        chrome_firefox.push(node.id());
        g.distributor.add(node).await.unwrap();
    }
    for _ in 0..3 {
        let node = browser_node(&g.bus, &[("firefox", 1)]);
        g.distributor.add(node).await.unwrap();
    }

    for _ in 0..5 {
        let session = g.distributor.new_session(&payload("chrome")).await.unwrap();
        assert!(
            !edge_capable.contains(&session.node_id),
            "chrome landed on an Edge-capable node while narrower nodes were free"
        );
    }
    for _ in 0..5 {
        g.distributor
            .new_session(&payload("firefox"))
            .await
            .unwrap();
    }

    let session = g
        .distributor
        .new_session(&payload("MicrosoftEdge"))
        .await
        .unwrap();
    assert!(edge_capable.contains(&session.node_id));
}

// ─── Lifecycle scenarios ─────────────────────────────────────────────────────

#[tokio::test]
async fn drain_keeps_node_until_sessions_finish() {
    let g = grid(Duration::from_secs(5));
    let node = browser_node(&g.bus, &[("chrome", 2)]);
    let node_id = node.id();
    g.distributor.add(Arc::clone(&node) as Arc<dyn Node>).await.unwrap();

    let s1 = g.distributor.new_session(&payload("chrome")).await.unwrap();
    let s2 = g.distributor.new_session(&payload("chrome")).await.unwrap();

    g.distributor.drain(node_id).await.unwrap();
    let status = g.distributor.status().await;
    assert_eq!(status.nodes.len(), 1, "draining node stays registered");
    assert!(g.distributor.available_nodes().await.is_empty());

    node.stop(s1.id).await.unwrap();
    let status = g.distributor.status().await;
    assert_eq!(status.nodes.len(), 1, "one session still running");

    node.stop(s2.id).await.unwrap();
    let d = Arc::clone(&g.distributor);
    wait_until(|| {
        let d = Arc::clone(&d);
        async move { d.status().await.nodes.is_empty() }
    })
    .await;
    assert!(g.distributor.available_nodes().await.is_empty());
}

#[tokio::test]
async fn down_node_recovers_after_refresh() {
    let g = grid(Duration::from_millis(300));
    let health = SettableHealthCheck::down("driver offline");
    let stereotype = caps("chrome");
    let node = LocalNode::builder("http://node.test:5555", Secret::none(), g.bus.clone())
        .add_slot(stereotype.clone(), Arc::new(StubFactory::new(stereotype)))
        .health_check(health.clone())
        .build();
    g.distributor.add(node).await.unwrap();
    g.distributor.refresh().await;

    assert!(g.distributor.available_nodes().await.is_empty());
    let err = g
        .distributor
        .new_session(&payload("chrome"))
        .await
        .unwrap_err();
    assert_eq!(err, GridError::Timeout);

    health.set(HealthStatus::up("driver back")).await;
    g.distributor.refresh().await;

    assert_eq!(g.distributor.available_nodes().await.len(), 1);
    g.distributor.new_session(&payload("chrome")).await.unwrap();
}

#[tokio::test]
async fn request_times_out_with_no_nodes_and_leaves_queue_empty() {
    let g = grid(Duration::from_secs(2));

    let started = std::time::Instant::now();
    let err = g
        .distributor
        .new_session(&payload("chrome"))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err, GridError::Timeout);
    assert!(
        elapsed >= Duration::from_millis(1900) && elapsed < Duration::from_secs(4),
        "timed out after {elapsed:?}"
    );
    assert!(g.queue.is_empty().await);
}

#[tokio::test]
async fn unsupported_capabilities_are_rejected_up_front() {
    let g = grid(Duration::from_secs(5));
    g.distributor
        .add(browser_node(&g.bus, &[("chrome", 2)]))
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let err = g
        .distributor
        .new_session(&payload("safari"))
        .await
        .unwrap_err();
    assert_eq!(err, GridError::UnsupportedCapabilities);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(g.queue.is_empty().await);
}

#[tokio::test]
async fn first_match_alternatives_fall_through() {
    let g = grid(Duration::from_secs(5));
    g.distributor
        .add(browser_node(&g.bus, &[("firefox", 1)]))
        .await
        .unwrap();

    let body = json!({"capabilities": {
        "alwaysMatch": {},
        "firstMatch": [{"browserName": "chrome"}, {"browserName": "firefox"}]
    }});
    let session = g.distributor.new_session(&body).await.unwrap();
    assert_eq!(session.capabilities.get("browserName"), Some(&json!("firefox")));
}

// ─── Registration laws ───────────────────────────────────────────────────────

#[tokio::test]
async fn registration_is_idempotent() {
    let g = grid(Duration::from_secs(5));
    let node = browser_node(&g.bus, &[("chrome", 2)]);

    g.distributor.add(Arc::clone(&node) as Arc<dyn Node>).await.unwrap();
    g.distributor.add(Arc::clone(&node) as Arc<dyn Node>).await.unwrap();

    let status = g.distributor.status().await;
    assert_eq!(status.nodes.len(), 1);
    assert_eq!(g.distributor.available_nodes().await.len(), 1);
}

#[tokio::test]
async fn wrong_secret_never_joins_the_fleet() {
    let g = grid_with_secret(Duration::from_secs(5), Secret::new("s3cret"));
    let mut rx = g.bus.subscribe();

    let intruder = LocalNode::builder(
        "http://node.test:5555",
        Secret::new("wrong"),
        g.bus.clone(),
    )
    .add_slot(caps("chrome"), Arc::new(StubFactory::new(caps("chrome"))))
    .build();
    let intruder_id = intruder.id();

    let err = g.distributor.add(intruder).await.unwrap_err();
    assert_eq!(err, GridError::NodeRejected(intruder_id));
    assert!(g.distributor.available_nodes().await.is_empty());
    assert!(matches!(
        rx.recv().await.unwrap(),
        gridd::events::GridEvent::NodeRejected { node_id } if node_id == intruder_id
    ));

    // The same node id may retry with the right secret.
    let legit = LocalNode::builder(
        "http://node.test:5555",
        Secret::new("s3cret"),
        g.bus.clone(),
    )
    .id(intruder_id)
    .add_slot(caps("chrome"), Arc::new(StubFactory::new(caps("chrome"))))
    .build();
    g.distributor.add(legit).await.unwrap();
    assert_eq!(g.distributor.available_nodes().await.len(), 1);
}

#[tokio::test]
async fn capacity_survives_factory_failure() {
    let g = grid(Duration::from_millis(300));
    let stereotype = caps("chrome");
    let node = LocalNode::builder("http://node.test:5555", Secret::none(), g.bus.clone())
        .add_slot(
            stereotype.clone(),
            Arc::new(StubFactory::failing(stereotype)),
        )
        .build();
    g.distributor.add(node).await.unwrap();

    let result = g.distributor.new_session(&payload("chrome")).await;
    assert!(result.is_err());

    let status = g.distributor.status().await;
    assert!(status.has_capacity, "slot leaked after factory failure");
}

#[tokio::test]
async fn placed_sessions_are_recorded_and_closed_sessions_removed() {
    let g = grid(Duration::from_secs(5));
    let node = browser_node(&g.bus, &[("chrome", 1)]);
    g.distributor.add(Arc::clone(&node) as Arc<dyn Node>).await.unwrap();

    let session = g.distributor.new_session(&payload("chrome")).await.unwrap();
    assert_eq!(g.sessions.get(session.id).await.unwrap().node_id, node.id());

    node.stop(session.id).await.unwrap();
    let sessions = Arc::clone(&g.sessions);
    let id = session.id;
    wait_until(|| {
        let sessions = Arc::clone(&sessions);
        async move { sessions.get(id).await.is_err() }
    })
    .await;
}

#[tokio::test]
async fn queued_request_is_served_once_capacity_frees_up() {
    let g = grid(Duration::from_secs(5));
    let node = browser_node(&g.bus, &[("chrome", 1)]);
    g.distributor.add(Arc::clone(&node) as Arc<dyn Node>).await.unwrap();

    let first = g.distributor.new_session(&payload("chrome")).await.unwrap();

    // Second request has to wait for the only slot.
    let distributor = Arc::clone(&g.distributor);
    let waiting =
        tokio::spawn(async move { distributor.new_session(&payload("chrome")).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!waiting.is_finished());

    node.stop(first.id).await.unwrap();
    let second = waiting.await.unwrap().unwrap();
    assert_eq!(second.node_id, node.id());
}

#[tokio::test]
async fn removed_node_leaves_sessions_behind_for_the_sweeper() {
    let g = grid(Duration::from_secs(5));
    let node = browser_node(&g.bus, &[("chrome", 1)]);
    let node_id = node.id();
    g.distributor.add(node).await.unwrap();

    let session = g.distributor.new_session(&payload("chrome")).await.unwrap();
    g.distributor.remove(node_id).await.unwrap();

    // Removal is immediate; the session stays until TTL.
    assert!(g.distributor.status().await.nodes.is_empty());
    assert!(g.sessions.get(session.id).await.is_ok());

    assert!(matches!(
        g.distributor.remove(node_id).await,
        Err(GridError::NotFound(_))
    ));
}

#[tokio::test]
async fn shutdown_cancels_pending_requests() {
    let g = grid(Duration::from_secs(30));

    let distributor = Arc::clone(&g.distributor);
    let pending =
        tokio::spawn(async move { distributor.new_session(&payload("chrome")).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    g.distributor.shutdown().await;
    let result = pending.await.unwrap();
    assert_eq!(result.unwrap_err(), GridError::Cancelled);
}
