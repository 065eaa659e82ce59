//! Mesh node - high-level coordinator
//!
//! Wires discovery, routing, encryption, persistence and the delivery
//! pipeline together for one local device.

use crate::control::ControlMessage;
use crate::delivery::{DeliveryPipeline, QueueStatus, StatusUpdate};
use crate::discovery::{Discovery, DeviceSnapshot};
use crate::error::{MeshError, MeshResult};
use crate::routing::{Route, RoutingEngine};
use crate::store::{blocking, MessageStore, SqliteStore};
use crate::sync::{SyncForwarder, SyncSink, SyncStats};
use crate::transport::MeshTransport;
use hybridmesh_core::{
    current_timestamp_ms, Device, DeviceId, MeshConfig, Message, MessageId, TransportType,
};
use hybridmesh_crypto::{
    CryptoError, DeviceIdentity, EncryptedEnvelope, EncryptionEngine, PeerKeyCache,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Aggregate counters for the local node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshStatus {
    pub device_id: DeviceId,
    pub running: bool,
    pub discovered_devices: usize,
    /// Messages waiting in the pending or retry queue
    pub pending_messages: usize,
    /// Whether the sync sink reports connectivity
    pub online: bool,
}

/// What `MeshNode::receive` did with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Addressed to this device and decrypted
    Delivered {
        message_id: MessageId,
        sender_id: DeviceId,
        plaintext: String,
    },
    /// A peer announced its public key
    KeyReceived { device_id: DeviceId },
    /// A peer asked for our public key; it has been queued for them
    KeyRequested { device_id: DeviceId },
    /// Addressed elsewhere and queued for forwarding
    Relayed { message_id: MessageId },
}

pub struct MeshNode {
    config: MeshConfig,
    local_id: DeviceId,
    engine: EncryptionEngine,
    peer_keys: PeerKeyCache,
    discovery: Discovery,
    routing: Arc<RoutingEngine>,
    store: Arc<dyn MessageStore>,
    pipeline: Arc<DeliveryPipeline>,
    sync: Option<Arc<SyncForwarder>>,
    status_tx: watch::Sender<MeshStatus>,
    started: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshNode {
    /// Build a node from explicitly constructed parts.
    pub fn new(
        config: MeshConfig,
        identity: Arc<DeviceIdentity>,
        store: Arc<dyn MessageStore>,
        transport: Arc<dyn MeshTransport>,
    ) -> MeshResult<Self> {
        config.validate()?;
        let local_id = config.node.device_id.clone();
        let routing = Arc::new(RoutingEngine::new());
        routing.update_topology(&[config.node.local_device(current_timestamp_ms())]);

        let pipeline = Arc::new(DeliveryPipeline::new(
            local_id.clone(),
            config.delivery.clone(),
            Arc::clone(&store),
            Arc::clone(&routing),
            transport,
        ));
        let (status_tx, _) = watch::channel(MeshStatus {
            device_id: local_id.clone(),
            running: false,
            discovered_devices: 0,
            pending_messages: 0,
            online: false,
        });

        info!(
            device_id = %local_id,
            fingerprint = %identity.fingerprint(),
            "Mesh node created"
        );

        Ok(Self {
            config,
            local_id,
            engine: EncryptionEngine::new(identity),
            peer_keys: PeerKeyCache::new(),
            discovery: Discovery::new(),
            routing,
            store,
            pipeline,
            sync: None,
            status_tx,
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Open the configured database and identity file.
    pub fn open(config: MeshConfig, transport: Arc<dyn MeshTransport>) -> MeshResult<Self> {
        let store: Arc<dyn MessageStore> = Arc::new(SqliteStore::open(&config.node.database_path)?);
        let identity = Arc::new(DeviceIdentity::load_or_generate(&config.node.identity_path)?);
        Self::new(config, identity, store, transport)
    }

    /// Forward SENT and DELIVERED messages to `sink`. Call before `start`.
    pub fn with_sync_sink(mut self, sink: Arc<dyn SyncSink>) -> Self {
        self.sync = Some(Arc::new(SyncForwarder::new(sink, self.config.sync.clone())));
        self
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        self.engine.identity()
    }

    /// Reload persisted state and start the background tasks.
    pub async fn start(self: &Arc<Self>) -> MeshResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MeshError::InvalidState("node already started".to_string()));
        }

        let keys = self.load_peer_keys().await?;
        let recovered = self.pipeline.recover().await?;

        let mut tasks = vec![
            tokio::spawn(Arc::clone(self).run_topology_loop(self.cancel.clone())),
            tokio::spawn(Arc::clone(self).run_prune_loop(self.cancel.clone())),
            tokio::spawn(Arc::clone(self).run_status_loop(self.cancel.clone())),
        ];
        tasks.extend(self.pipeline.spawn(self.cancel.child_token()));
        if let Some(sync) = &self.sync {
            tasks.push(tokio::spawn(Arc::clone(sync).run(
                Arc::clone(&self.store),
                self.pipeline.subscribe(),
                self.cancel.child_token(),
            )));
        }
        self.tasks().extend(tasks);

        self.refresh_status();
        info!(
            device_id = %self.local_id,
            peer_keys = keys,
            recovered,
            "Mesh node started"
        );
        Ok(())
    }

    /// Cancel every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.tasks());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.refresh_status();
        info!(device_id = %self.local_id, "Mesh node stopped");
    }

    /// Feed one transport's discovery snapshot.
    pub fn observe(&self, transport: TransportType, snapshot: HashMap<DeviceId, Device>) -> DeviceSnapshot {
        self.discovery.observe(transport, snapshot)
    }

    /// Encrypt `text` for `receiver_id` and queue it.
    ///
    /// Without a cached key for the receiver a key request is queued and
    /// [`MeshError::NoKey`] is returned; nothing is sent in plaintext.
    pub async fn send_message(&self, receiver_id: &str, text: &str) -> MeshResult<MessageId> {
        let recipient = match self.peer_keys.agreement_key(receiver_id) {
            Ok(key) => key,
            Err(CryptoError::NoKey { device_id }) => {
                self.request_public_key(receiver_id).await?;
                return Err(MeshError::NoKey { device_id });
            }
            Err(e) => return Err(e.into()),
        };

        let content = self.engine.seal_str(text, &recipient)?;
        let message = self.outgoing(receiver_id, content).encrypted();
        let message_id = message.id.clone();
        self.pipeline.enqueue(message).await?;
        debug!(message_id = %message_id, receiver_id = %receiver_id, "Queued encrypted message");
        Ok(message_id)
    }

    /// Queue a `PUBLIC_KEY:` announcement for `peer`.
    pub async fn share_public_key(&self, peer: &str) -> MeshResult<MessageId> {
        let bundle = self.engine.identity().key_bundle(&self.local_id).encode();
        self.send_control(peer, ControlMessage::PublicKey(bundle)).await
    }

    /// Queue a `REQUEST_PUBLIC_KEY` for `peer`.
    pub async fn request_public_key(&self, peer: &str) -> MeshResult<MessageId> {
        self.send_control(peer, ControlMessage::RequestPublicKey).await
    }

    async fn send_control(&self, peer: &str, control: ControlMessage) -> MeshResult<MessageId> {
        let message = self.outgoing(peer, control.to_content());
        let message_id = message.id.clone();
        self.pipeline.enqueue(message).await?;
        debug!(message_id = %message_id, peer = %peer, control = control_kind(&control), "Queued control message");
        Ok(message_id)
    }

    fn outgoing(&self, receiver_id: &str, content: String) -> Message {
        let mut message = Message::new(self.local_id.clone(), receiver_id, content)
            .with_max_hops(self.config.delivery.default_max_hops);
        let preferred = self
            .discovery
            .current()
            .iter()
            .find(|device| device.id == receiver_id)
            .and_then(Device::preferred_transport);
        if let Some(transport) = preferred {
            message = message.with_transport(transport);
        }
        message
    }

    /// Handle a message handed up by a transport.
    ///
    /// A message that fails authentication is stored unchanged and the
    /// authentication error is returned.
    pub async fn receive(&self, message: Message) -> MeshResult<Inbound> {
        if message.receiver_id != self.local_id {
            let message_id = message.id.clone();
            debug!(
                message_id = %message_id,
                receiver_id = %message.receiver_id,
                hop_count = message.hop_count,
                "Relaying message"
            );
            self.pipeline.enqueue(message).await?;
            return Ok(Inbound::Relayed { message_id });
        }

        if !message.is_encrypted {
            let sender_id = message.sender_id.clone();
            return match ControlMessage::parse(&message.content) {
                Some(ControlMessage::RequestPublicKey) => {
                    self.share_public_key(&sender_id).await?;
                    Ok(Inbound::KeyRequested { device_id: sender_id })
                }
                Some(ControlMessage::PublicKey(bundle)) => {
                    self.remember_peer_key(&sender_id, &bundle).await?;
                    Ok(Inbound::KeyReceived { device_id: sender_id })
                }
                None => Err(MeshError::InvalidMessage(format!(
                    "unencrypted message {} from {}",
                    message.id, sender_id
                ))),
            };
        }

        let plaintext = match self.open_message(&message) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                if e.is_authentication_failure() {
                    warn!(
                        message_id = %message.id,
                        sender_id = %message.sender_id,
                        "Retaining message that failed authentication"
                    );
                    let retained = message.clone();
                    blocking(&self.store, move |store| store.save_message(&retained)).await?;
                }
                return Err(e);
            }
        };

        let inbound = Inbound::Delivered {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            plaintext,
        };
        self.pipeline.accept_delivered(message).await?;
        Ok(inbound)
    }

    /// Plaintext of a stored message sent by or to this device.
    pub fn read_message(&self, message: &Message) -> MeshResult<String> {
        if !message.is_encrypted {
            return Ok(message.content.clone());
        }
        self.open_message(message)
    }

    fn open_message(&self, message: &Message) -> MeshResult<String> {
        let envelope = EncryptedEnvelope::from_json(&message.content)?;
        if let Some(bundle) = self.peer_keys.get(&message.sender_id) {
            if bundle.agreement_key().as_bytes()[..] != envelope.sender_public_key[..] {
                return Err(CryptoError::Envelope(format!(
                    "sender key does not match the key cached for {}",
                    message.sender_id
                ))
                .into());
            }
        }
        let plaintext = self.engine.decrypt(&envelope)?;
        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::Envelope("plaintext is not UTF-8".to_string()).into())
    }

    async fn remember_peer_key(&self, device_id: &str, bundle: &str) -> MeshResult<()> {
        let changed = self.peer_keys.insert_encoded(device_id, bundle)?;
        if changed {
            let (device_id, bundle) = (device_id.to_string(), bundle.to_string());
            blocking(&self.store, move |store| store.save_peer_key(&device_id, &bundle)).await?;
        }
        Ok(())
    }

    async fn load_peer_keys(&self) -> MeshResult<usize> {
        let stored = blocking(&self.store, |store| store.peer_keys()).await?;
        let mut loaded = 0;
        for (device_id, bundle) in stored {
            match self.peer_keys.insert_encoded(&device_id, &bundle) {
                Ok(_) => loaded += 1,
                Err(e) => warn!(device_id = %device_id, "Skipping stored peer key: {}", e),
            }
        }
        Ok(loaded)
    }

    pub fn has_peer_key(&self, device_id: &str) -> bool {
        self.peer_keys.contains(device_id)
    }

    /// Stored messages exchanged with `peer`, oldest first.
    pub async fn messages_with(&self, peer: &str) -> MeshResult<Vec<Message>> {
        let peer = peer.to_string();
        blocking(&self.store, move |store| store.messages_with_peer(&peer)).await
    }

    /// Messages exchanged with `peer`, republished whenever one of them
    /// changes status.
    ///
    /// The stream ends once every receiver is dropped or the node shuts down.
    pub async fn subscribe_peer(&self, peer: &str) -> MeshResult<watch::Receiver<Vec<Message>>> {
        let mut updates = self.pipeline.subscribe();
        let (tx, rx) = watch::channel(self.messages_with(peer).await?);
        let store = Arc::clone(&self.store);
        let cancel = self.cancel.child_token();
        let peer = peer.to_string();

        let handle = tokio::spawn(async move {
            loop {
                let involved = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    update = updates.recv() => match update {
                        Ok(update) => update.sender_id == peer || update.receiver_id == peer,
                        Err(RecvError::Lagged(_)) => true,
                        Err(RecvError::Closed) => break,
                    },
                };
                if !involved {
                    continue;
                }
                let query = peer.clone();
                match blocking(&store, move |store| store.messages_with_peer(&query)).await {
                    Ok(messages) => {
                        if tx.send(messages).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(peer = %peer, "Conversation refresh failed: {}", e),
                }
            }
        });

        let mut tasks = self.tasks();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        Ok(rx)
    }

    /// Message status transitions.
    pub fn subscribe_messages(&self) -> broadcast::Receiver<StatusUpdate> {
        self.pipeline.subscribe()
    }

    /// Merged device set, updated on every discovery change.
    pub fn devices(&self) -> watch::Receiver<DeviceSnapshot> {
        self.discovery.subscribe()
    }

    pub fn status(&self) -> MeshStatus {
        self.status_tx.borrow().clone()
    }

    pub fn status_stream(&self) -> watch::Receiver<MeshStatus> {
        self.status_tx.subscribe()
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.pipeline.queue_status()
    }

    /// Record an acknowledgement for a message this device sent.
    pub async fn mark_delivered(&self, message_id: &str) -> MeshResult<bool> {
        self.pipeline.mark_delivered(message_id).await
    }

    /// Best route first, then disjoint alternates.
    pub fn routes_to(&self, destination: &str, max_routes: usize) -> Vec<Route> {
        self.routing
            .find_alternate_routes(&self.local_id, destination, max_routes)
    }

    /// Directly connected peers of the local device.
    pub fn neighbors(&self) -> Vec<DeviceId> {
        self.routing.snapshot().neighbors(&self.local_id)
    }

    /// Upload queued messages now.
    pub async fn sync_now(&self) -> MeshResult<usize> {
        match &self.sync {
            Some(sync) => sync.flush().await,
            None => Ok(0),
        }
    }

    pub fn sync_stats(&self) -> Option<SyncStats> {
        self.sync.as_ref().map(|sync| sync.stats())
    }

    /// Wipe stored messages, devices, cached keys and the in-memory queues.
    pub async fn clear_all(&self) -> MeshResult<()> {
        blocking(&self.store, |store| store.clear_all()).await?;
        self.pipeline.clear_queues();
        self.peer_keys.clear();
        self.discovery.clear();
        self.routing
            .update_topology(&[self.config.node.local_device(current_timestamp_ms())]);
        self.refresh_status();
        info!(device_id = %self.local_id, "Cleared all mesh data");
        Ok(())
    }

    async fn apply_topology(&self, discovered: &[Device]) {
        let mut devices: Vec<Device> = discovered
            .iter()
            .filter(|device| device.id != self.local_id)
            .cloned()
            .collect();

        for device in &devices {
            if let Some(bundle) = &device.public_key {
                if let Err(e) = self.remember_peer_key(&device.id, bundle).await {
                    debug!(device_id = %device.id, "Ignoring advertised key: {}", e);
                }
            }
        }

        devices.push(self.config.node.local_device(current_timestamp_ms()));
        let snapshot = self.routing.update_topology(&devices);
        devices.pop();
        debug!(
            devices = devices.len(),
            connections = snapshot.connections().len(),
            "Topology updated"
        );

        let result = blocking(&self.store, move |store| {
            for device in &devices {
                store.save_device(device)?;
            }
            Ok(())
        })
        .await;
        if let Err(e) = result {
            warn!("Failed to persist devices: {}", e);
        }
        self.refresh_status();
    }

    async fn run_topology_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut devices = self.discovery.subscribe();
        let initial = Arc::clone(&*devices.borrow_and_update());
        self.apply_topology(&initial).await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = devices.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = Arc::clone(&*devices.borrow_and_update());
                    self.apply_topology(&snapshot).await;
                }
            }
        }
    }

    async fn run_prune_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.discovery.prune_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    // Removals reach routing through the discovery watch.
                    self.discovery.prune(
                        current_timestamp_ms(),
                        self.config.discovery.staleness_window_ms,
                    );
                }
            }
        }
    }

    async fn run_status_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut updates = self.pipeline.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Ok(_) | Err(RecvError::Lagged(_)) => self.refresh_status(),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    fn refresh_status(&self) {
        let queues = self.pipeline.queue_status();
        let status = MeshStatus {
            device_id: self.local_id.clone(),
            running: self.started.load(Ordering::SeqCst) && !self.cancel.is_cancelled(),
            discovered_devices: self
                .discovery
                .current()
                .iter()
                .filter(|device| device.id != self.local_id)
                .count(),
            pending_messages: queues.pending + queues.retry,
            online: self.sync.as_ref().is_some_and(|sync| sync.is_online()),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn control_kind(control: &ControlMessage) -> &'static str {
    match control {
        ControlMessage::RequestPublicKey => "request_public_key",
        ControlMessage::PublicKey(_) => "public_key",
    }
}
