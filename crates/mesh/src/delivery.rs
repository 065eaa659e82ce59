//! Store-and-forward delivery pipeline.
//!
//! # Lifecycle
//!
//! ```text
//! PENDING -> SENT -> DELIVERED
//! PENDING/SENT -> FAILED    hop budget exhausted
//! PENDING/SENT -> EXPIRED   older than the TTL
//! ```
//!
//! Every transition is written to the store before it is published on the
//! status stream. The in-memory queues only hold message ids; the store is
//! authoritative and `recover` rebuilds the pending queue from it.
//!
//! Enqueues, attempts, retry drains, sweeps and explicit delivery marks are
//! serialized by one lock, so at most one transition is in progress per
//! pipeline and a re-enqueue never races an in-flight send of the same id.

use crate::error::{MeshError, MeshResult};
use crate::routing::{Route, RoutingEngine};
use crate::store::{blocking, MessageStore};
use crate::transport::{encode_message, MeshTransport};
use hybridmesh_core::{
    current_timestamp_ms, DeliveryConfig, DeviceId, Message, MessageId, MessageStatus,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Published after every persisted transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub message_id: MessageId,
    pub sender_id: DeviceId,
    pub receiver_id: DeviceId,
    pub status: MessageStatus,
    pub hop_count: u32,
    /// When the transition was recorded (Unix epoch milliseconds)
    pub updated_at: u64,
}

impl StatusUpdate {
    fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.id.clone(),
            sender_id: message.sender_id.clone(),
            receiver_id: message.receiver_id.clone(),
            status: message.status,
            hop_count: message.hop_count,
            updated_at: current_timestamp_ms(),
        }
    }
}

/// Why an attempt did not hand the message to a next hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    UnknownDestination,
    DestinationOffline,
    NoRoute,
    Transport(String),
    Storage(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::UnknownDestination => f.write_str("destination unknown"),
            FailureReason::DestinationOffline => f.write_str("destination offline"),
            FailureReason::NoRoute => f.write_str("no route"),
            FailureReason::Transport(e) => write!(f, "transport: {}", e),
            FailureReason::Storage(e) => write!(f, "storage: {}", e),
        }
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Handed to the next hop and persisted as SENT
    Sent { message_id: MessageId, route: Route },
    /// Queued for retry
    Retrying { message_id: MessageId, reason: FailureReason },
    /// Hop budget exhausted
    Failed { message_id: MessageId, reason: Option<FailureReason> },
    /// Older than the TTL
    Expired { message_id: MessageId },
    /// No longer pending (removed or transitioned elsewhere)
    Skipped { message_id: MessageId },
}

/// Snapshot of the in-memory queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub retry: usize,
    pub in_flight: bool,
}

/// Outcome of an expiry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub deleted: usize,
}

#[derive(Debug, Default)]
struct Queues {
    pending: VecDeque<MessageId>,
    retry: VecDeque<MessageId>,
    queued: HashSet<MessageId>,
}

impl Queues {
    fn push_pending(&mut self, id: MessageId) -> bool {
        if !self.queued.insert(id.clone()) {
            return false;
        }
        self.pending.push_back(id);
        true
    }

    fn push_retry(&mut self, id: MessageId) {
        if self.queued.insert(id.clone()) {
            self.retry.push_back(id);
        }
    }

    fn pop_pending(&mut self) -> Option<MessageId> {
        let id = self.pending.pop_front()?;
        self.queued.remove(&id);
        Some(id)
    }

    fn take_retry(&mut self) -> Vec<MessageId> {
        let ids: Vec<_> = self.retry.drain(..).collect();
        for id in &ids {
            self.queued.remove(id);
        }
        ids
    }

    fn remove(&mut self, id: &str) {
        if self.queued.remove(id) {
            self.pending.retain(|queued| queued != id);
            self.retry.retain(|queued| queued != id);
        }
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.retry.clear();
        self.queued.clear();
    }
}

/// Persistent store-and-forward queue for one local device.
pub struct DeliveryPipeline {
    local_id: DeviceId,
    config: DeliveryConfig,
    store: Arc<dyn MessageStore>,
    routing: Arc<RoutingEngine>,
    transport: Arc<dyn MeshTransport>,
    queues: Mutex<Queues>,
    attempt_lock: tokio::sync::Mutex<()>,
    in_flight: AtomicBool,
    wake: Notify,
    status_tx: broadcast::Sender<StatusUpdate>,
}

impl DeliveryPipeline {
    pub fn new(
        local_id: impl Into<DeviceId>,
        config: DeliveryConfig,
        store: Arc<dyn MessageStore>,
        routing: Arc<RoutingEngine>,
        transport: Arc<dyn MeshTransport>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(config.status_channel_capacity.max(1));
        Self {
            local_id: local_id.into(),
            config,
            store,
            routing,
            transport,
            queues: Mutex::new(Queues::default()),
            attempt_lock: tokio::sync::Mutex::new(()),
            in_flight: AtomicBool::new(false),
            wake: Notify::new(),
            status_tx,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Status stream. Subscribers that fall behind lose the oldest updates.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusUpdate> {
        self.status_tx.subscribe()
    }

    pub fn queue_status(&self) -> QueueStatus {
        let queues = self.queues();
        QueueStatus {
            pending: queues.pending.len(),
            retry: queues.retry.len(),
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Persist `message` as PENDING and admit it to the pending queue.
    ///
    /// Enqueueing an id that already exists replaces the stored record. A
    /// message that arrives with its hop budget already spent is stored as
    /// FAILED and never queued.
    pub async fn enqueue(&self, mut message: Message) -> MeshResult<()> {
        self.validate(&message)?;
        let _guard = self.attempt_lock.lock().await;

        if message.hops_exhausted() {
            warn!(
                message_id = %message.id,
                hop_count = message.hop_count,
                max_hops = message.max_hops,
                "Refusing to queue message with no hops left"
            );
            self.queues().remove(&message.id);
            return self.transition(message, MessageStatus::Failed).await;
        }

        message.status = MessageStatus::Pending;
        self.persist(&message).await?;
        let admitted = self.queues().push_pending(message.id.clone());
        debug!(
            message_id = %message.id,
            receiver_id = %message.receiver_id,
            admitted,
            "Message enqueued"
        );
        self.publish(&message);
        self.wake.notify_one();
        Ok(())
    }

    fn validate(&self, message: &Message) -> MeshResult<()> {
        if message.id.trim().is_empty() {
            return Err(MeshError::InvalidMessage("empty message id".to_string()));
        }
        if message.sender_id.trim().is_empty() || message.receiver_id.trim().is_empty() {
            return Err(MeshError::InvalidMessage(format!(
                "message {} has no sender or receiver",
                message.id
            )));
        }
        if message.receiver_id == self.local_id {
            return Err(MeshError::InvalidMessage(format!(
                "message {} is addressed to the local device",
                message.id
            )));
        }
        if message.max_hops == 0 {
            return Err(MeshError::InvalidMessage(format!(
                "message {} has a zero hop budget",
                message.id
            )));
        }
        Ok(())
    }

    /// Run one delivery attempt for the message at the head of the pending queue.
    ///
    /// Returns `None` when the queue is empty.
    pub async fn attempt_next(&self) -> MeshResult<Option<AttemptOutcome>> {
        let _guard = self.attempt_lock.lock().await;
        let Some(id) = self.queues().pop_pending() else {
            return Ok(None);
        };

        self.in_flight.store(true, Ordering::SeqCst);
        let result = self.attempt(&id).await;
        self.in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                // The stored record is unchanged; try again on the next drain.
                self.queues().push_retry(id.clone());
                error!(message_id = %id, "Delivery attempt aborted: {}", e);
                Err(e)
            }
        }
    }

    async fn attempt(&self, id: &str) -> MeshResult<AttemptOutcome> {
        let message_id = id.to_string();
        let Some(message) = self.load(id).await? else {
            return Ok(AttemptOutcome::Skipped { message_id });
        };
        if message.status != MessageStatus::Pending {
            return Ok(AttemptOutcome::Skipped { message_id });
        }

        if message.age_ms(current_timestamp_ms()) > self.config.ttl_ms {
            self.transition(message, MessageStatus::Expired).await?;
            return Ok(AttemptOutcome::Expired { message_id });
        }
        if message.hops_exhausted() {
            self.transition(message, MessageStatus::Failed).await?;
            return Ok(AttemptOutcome::Failed {
                message_id,
                reason: None,
            });
        }

        let route = match self.resolve_route(&message) {
            Ok(route) => route,
            Err(reason) => return self.record_failure(message, reason).await,
        };
        let Some(hop) = route.next_hop().cloned() else {
            return self.record_failure(message, FailureReason::NoRoute).await;
        };

        let mut outgoing = message.clone();
        outgoing.status = MessageStatus::Sent;
        outgoing.hop_count += 1;
        outgoing.route.extend(route.hop_ids());
        outgoing.transport = hop.transport;
        let payload = encode_message(&outgoing)?;

        if let Err(e) = self
            .transport
            .send(&hop.device_id, hop.transport, &payload)
            .await
        {
            return self
                .record_failure(message, FailureReason::Transport(e.to_string()))
                .await;
        }

        if let Err(e) = self.persist(&outgoing).await {
            error!(
                message_id = %message_id,
                "Sent message could not be persisted, requeueing: {}",
                e
            );
            self.queues().push_retry(message_id.clone());
            return Ok(AttemptOutcome::Retrying {
                message_id,
                reason: FailureReason::Storage(e.to_string()),
            });
        }

        info!(
            message_id = %message_id,
            next_hop = %hop.device_id,
            transport = %hop.transport,
            hops = route.hops.len(),
            "Message sent"
        );
        self.publish(&outgoing);
        Ok(AttemptOutcome::Sent { message_id, route })
    }

    fn resolve_route(&self, message: &Message) -> Result<Route, FailureReason> {
        let snapshot = self.routing.snapshot();
        let destination = snapshot
            .device(&message.receiver_id)
            .ok_or(FailureReason::UnknownDestination)?;
        if !destination.is_online {
            return Err(FailureReason::DestinationOffline);
        }
        snapshot
            .find_best_route(&self.local_id, &message.receiver_id)
            .ok_or(FailureReason::NoRoute)
    }

    async fn record_failure(
        &self,
        mut message: Message,
        reason: FailureReason,
    ) -> MeshResult<AttemptOutcome> {
        let message_id = message.id.clone();
        message.hop_count += 1;

        if message.hop_count < message.max_hops {
            self.persist(&message).await?;
            self.queues().push_retry(message_id.clone());
            debug!(
                message_id = %message_id,
                hop_count = message.hop_count,
                max_hops = message.max_hops,
                "Delivery deferred: {}",
                reason
            );
            self.publish(&message);
            return Ok(AttemptOutcome::Retrying { message_id, reason });
        }

        message.status = MessageStatus::Failed;
        self.persist(&message).await?;
        warn!(
            message_id = %message_id,
            hop_count = message.hop_count,
            "Delivery failed after exhausting hop budget: {}",
            reason
        );
        self.publish(&message);
        Ok(AttemptOutcome::Failed {
            message_id,
            reason: Some(reason),
        })
    }

    /// Move every retry-queued message back to the pending queue.
    ///
    /// Messages whose hop budget is already spent become FAILED instead.
    pub async fn drain_retry_queue(&self) -> MeshResult<usize> {
        let _guard = self.attempt_lock.lock().await;
        let ids = self.queues().take_retry();
        let mut admitted = 0;

        for id in ids {
            let message = match self.load(&id).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    warn!(message_id = %id, "Retry drain could not load message: {}", e);
                    self.queues().push_retry(id);
                    continue;
                }
            };
            if message.status != MessageStatus::Pending {
                continue;
            }
            if message.hops_exhausted() {
                self.transition(message, MessageStatus::Failed).await?;
                continue;
            }
            if self.queues().push_pending(id) {
                admitted += 1;
            }
        }

        if admitted > 0 {
            debug!(count = admitted, "Retry queue drained");
            self.wake.notify_one();
        }
        Ok(admitted)
    }

    /// Expire PENDING/SENT messages older than the TTL and delete DELIVERED
    /// messages past it.
    pub async fn sweep_expired(&self, now_ms: u64) -> MeshResult<SweepReport> {
        let _guard = self.attempt_lock.lock().await;
        let cutoff = now_ms.saturating_sub(self.config.ttl_ms);
        let mut report = SweepReport::default();

        for status in [MessageStatus::Pending, MessageStatus::Sent] {
            let stale = blocking(&self.store, move |store| {
                store.messages_by_status_before(status, cutoff)
            })
            .await?;
            for message in stale {
                let id = message.id.clone();
                self.transition(message, MessageStatus::Expired).await?;
                self.queues().remove(&id);
                report.expired += 1;
            }
        }

        report.deleted = blocking(&self.store, move |store| {
            store.delete_messages_before(MessageStatus::Delivered, cutoff)
        })
        .await?;

        if report.expired > 0 || report.deleted > 0 {
            info!(
                expired = report.expired,
                deleted = report.deleted,
                "Expiry sweep complete"
            );
        }
        Ok(report)
    }

    /// Rebuild the pending queue from stored PENDING messages.
    pub async fn recover(&self) -> MeshResult<usize> {
        let pending = blocking(&self.store, |store| {
            store.messages_by_status(MessageStatus::Pending)
        })
        .await?;

        let mut queues = self.queues();
        let recovered = pending
            .into_iter()
            .filter(|message| queues.push_pending(message.id.clone()))
            .count();
        drop(queues);

        if recovered > 0 {
            info!(count = recovered, "Recovered pending messages");
            self.wake.notify_one();
        }
        Ok(recovered)
    }

    /// Record an acknowledgement for a PENDING or SENT message.
    ///
    /// Returns `false` if the message is unknown or already terminal.
    pub async fn mark_delivered(&self, id: &str) -> MeshResult<bool> {
        let _guard = self.attempt_lock.lock().await;
        let Some(message) = self.load(id).await? else {
            return Ok(false);
        };
        if message.status.is_terminal() {
            return Ok(false);
        }
        self.transition(message, MessageStatus::Delivered).await?;
        self.queues().remove(id);
        Ok(true)
    }

    /// Store a message that reached its destination on this device.
    pub async fn accept_delivered(&self, mut message: Message) -> MeshResult<()> {
        message.status = MessageStatus::Delivered;
        self.persist(&message).await?;
        self.queues().remove(&message.id);
        info!(
            message_id = %message.id,
            sender_id = %message.sender_id,
            hop_count = message.hop_count,
            "Message delivered"
        );
        self.publish(&message);
        Ok(())
    }

    /// Drop every queued id. Stored records are untouched.
    pub fn clear_queues(&self) {
        self.queues().clear();
    }

    /// Start the attempt loop, retry drain and expiry sweep.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).run_attempt_loop(cancel.clone())),
            tokio::spawn(Arc::clone(self).run_retry_loop(cancel.clone())),
            tokio::spawn(Arc::clone(self).run_sweep_loop(cancel)),
        ]
    }

    async fn run_attempt_loop(self: Arc<Self>, cancel: CancellationToken) {
        debug!(device_id = %self.local_id, "Attempt loop started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            // Errors are logged by attempt_next; back off like an empty queue.
            if let Ok(Some(_)) = self.attempt_next().await {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.attempt_interval()) => {}
            }
        }
        debug!(device_id = %self.local_id, "Attempt loop stopped");
    }

    async fn run_retry_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.retry_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_retry_queue().await {
                        error!("Retry drain failed: {}", e);
                    }
                }
            }
        }
    }

    async fn run_sweep_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_expired(current_timestamp_ms()).await {
                        error!("Expiry sweep failed: {}", e);
                    }
                }
            }
        }
    }

    async fn transition(&self, mut message: Message, status: MessageStatus) -> MeshResult<()> {
        message.status = status;
        self.persist(&message).await?;
        debug!(message_id = %message.id, status = %status, "Message transitioned");
        self.publish(&message);
        Ok(())
    }

    async fn load(&self, id: &str) -> MeshResult<Option<Message>> {
        let id = id.to_string();
        blocking(&self.store, move |store| store.get_message(&id)).await
    }

    async fn persist(&self, message: &Message) -> MeshResult<()> {
        let message = message.clone();
        blocking(&self.store, move |store| store.save_message(&message)).await
    }

    fn publish(&self, message: &Message) {
        // No subscribers is fine.
        let _ = self.status_tx.send(StatusUpdate::from_message(message));
    }

    fn queues(&self) -> MutexGuard<'_, Queues> {
        match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
