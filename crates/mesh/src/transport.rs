//! Transport send contract and an in-process loopback network.

use crate::error::{MeshError, MeshResult};
use async_trait::async_trait;
use hybridmesh_core::{DeviceId, Message, TransportType};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Hands an opaque payload to the next hop over a specific transport.
///
/// Implementations wrap the platform radios; an `Err` is treated as a
/// transient failure and the message is retried.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    async fn send(&self, next_hop: &str, transport: TransportType, payload: &[u8]) -> MeshResult<()>;
}

/// Wire form of a message.
pub fn encode_message(message: &Message) -> MeshResult<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode_message(payload: &[u8]) -> MeshResult<Message> {
    Ok(serde_json::from_slice(payload)?)
}

/// Delivered frame: the transport it arrived on and the decoded message.
pub type Inbox = mpsc::UnboundedReceiver<(TransportType, Message)>;

/// In-process network connecting every registered device.
///
/// Used by tests and local simulations. Links can be cut per device.
#[derive(Debug, Default)]
pub struct LoopbackNetwork {
    inboxes: Mutex<HashMap<DeviceId, mpsc::UnboundedSender<(TransportType, Message)>>>,
    down: Mutex<HashSet<DeviceId>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device and return its inbox.
    pub fn register(&self, device_id: &str) -> Inbox {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inboxes).insert(device_id.to_string(), tx);
        rx
    }

    /// Make sends to `device_id` fail until restored.
    pub fn set_link_down(&self, device_id: &str, down: bool) {
        let mut links = lock(&self.down);
        if down {
            links.insert(device_id.to_string());
        } else {
            links.remove(device_id);
        }
    }
}

#[async_trait]
impl MeshTransport for LoopbackNetwork {
    async fn send(&self, next_hop: &str, transport: TransportType, payload: &[u8]) -> MeshResult<()> {
        if lock(&self.down).contains(next_hop) {
            return Err(MeshError::Transport(format!("link to {} is down", next_hop)));
        }
        let message = decode_message(payload)?;
        let inboxes = lock(&self.inboxes);
        let inbox = inboxes
            .get(next_hop)
            .ok_or_else(|| MeshError::Transport(format!("{} is not reachable", next_hop)))?;
        inbox
            .send((transport, message))
            .map_err(|_| MeshError::Transport(format!("{} stopped listening", next_hop)))?;
        debug!(next_hop = %next_hop, transport = %transport, "Loopback frame delivered");
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
