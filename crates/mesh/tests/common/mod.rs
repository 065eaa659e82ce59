//! Test utilities for multi-node mesh tests

#![allow(dead_code)]

use hybridmesh_core::{Device, MeshConfig, Message, MessageStatus, TransportType};
use hybridmesh_crypto::DeviceIdentity;
use hybridmesh_mesh::{Inbound, Inbox, LoopbackNetwork, MeshNode, SqliteStore};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

pub const WAIT: Duration = Duration::from_secs(5);

/// A started node attached to the loopback network.
pub struct TestNode {
    pub node: Arc<MeshNode>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Config with fast loops and the given radios.
pub fn fast_config(device_id: &str, transports: &[TransportType]) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.node.device_id = device_id.to_string();
    config.node.display_name = device_id.to_uppercase();
    config.node.transports = transports.to_vec();
    config.delivery.attempt_interval_ms = 10;
    config.delivery.retry_interval_ms = 50;
    config
}

/// Build a node over an in-memory store, start it and pump its inbox.
pub async fn spawn_node(
    network: &Arc<LoopbackNetwork>,
    device_id: &str,
    transports: &[TransportType],
) -> TestNode {
    let inbox = network.register(device_id);
    let node = Arc::new(
        MeshNode::new(
            fast_config(device_id, transports),
            Arc::new(DeviceIdentity::generate()),
            Arc::new(SqliteStore::in_memory().unwrap()),
            network.clone(),
        )
        .unwrap(),
    );
    node.start().await.unwrap();
    let inbound = pump(Arc::clone(&node), inbox);
    TestNode { node, inbound }
}

/// Hand every frame in `inbox` to `node` and report what it did.
pub fn pump(node: Arc<MeshNode>, mut inbox: Inbox) -> mpsc::UnboundedReceiver<Inbound> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some((_transport, message)) = inbox.recv().await {
            match node.receive(message).await {
                Ok(inbound) => {
                    let _ = tx.send(inbound);
                }
                Err(e) => tracing::warn!(device_id = %node.local_id(), "receive failed: {}", e),
            }
        }
    });
    rx
}

/// Discovery record for a peer as a radio would report it.
pub fn peer(id: &str, transports: &[TransportType]) -> Device {
    let mut device = Device::new(id, id.to_uppercase(), transports[0]).with_signal(-50);
    device.transports = transports.iter().copied().collect();
    device
}

/// Feed one Bluetooth snapshot holding `peers` to `node`.
pub fn observe(node: &MeshNode, peers: Vec<Device>) {
    let snapshot: HashMap<_, _> = peers.into_iter().map(|d| (d.id.clone(), d)).collect();
    node.observe(TransportType::Bluetooth, snapshot);
}

/// Poll `condition` until it holds or the wait expires.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = timeout(WAIT, async {
        while !condition().await {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

/// Wait until `node` has a route to `to` whose first hop is `via`.
pub async fn wait_for_route(node: &Arc<MeshNode>, to: &str, via: &str) {
    let node = Arc::clone(node);
    let (to, via) = (to.to_string(), via.to_string());
    eventually("route", move || {
        let routes = node.routes_to(&to, 1);
        let found = routes
            .first()
            .and_then(|route| route.next_hop())
            .is_some_and(|hop| hop.device_id == via);
        async move { found }
    })
    .await;
}

/// Wait until the record of `id` stored by `node` satisfies `predicate`.
pub async fn wait_for_message<P>(node: &Arc<MeshNode>, peer: &str, id: &str, predicate: P) -> Message
where
    P: Fn(&Message) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let stored = node.messages_with(peer).await.unwrap();
        if let Some(message) = stored.into_iter().find(|m| m.id == id && predicate(m)) {
            return message;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for message {}", id);
        sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until some message with `peer` reaches `status`.
pub async fn wait_for_any_status(node: &Arc<MeshNode>, peer: &str, status: MessageStatus) -> Message {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let stored = node.messages_with(peer).await.unwrap();
        if let Some(message) = stored.into_iter().find(|m| m.status == status) {
            return message;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {} message", status);
        sleep(Duration::from_millis(10)).await;
    }
}

/// Next inbound event matching `predicate`.
pub async fn next_matching<P>(inbound: &mut mpsc::UnboundedReceiver<Inbound>, predicate: P) -> Inbound
where
    P: Fn(&Inbound) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = inbound.recv().await.expect("inbound pump stopped");
            if predicate(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for inbound event")
}
