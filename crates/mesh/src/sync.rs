//! Best-effort upload of sent and delivered messages.
//!
//! The uploader itself lives outside this crate behind [`SyncSink`]. The
//! forwarder listens to the pipeline status stream, queues messages that
//! reached SENT or DELIVERED and uploads them in batches while the sink
//! reports that it is online. Upload failures never affect delivery.
//!
//! The queue holds at most `sync.max_queued` messages, one per id. When it is
//! full the oldest queued message is dropped.

use crate::delivery::StatusUpdate;
use crate::error::MeshResult;
use crate::store::{blocking, MessageStore};
use async_trait::async_trait;
use hybridmesh_core::{Message, MessageId, MessageStatus, SyncConfig};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// External backup destination.
#[async_trait]
pub trait SyncSink: Send + Sync {
    fn is_online(&self) -> bool;

    async fn upload(&self, batch: &[Message]) -> MeshResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub queued: usize,
    pub synced: u64,
    pub failed: u64,
    /// Evicted because the queue was full
    pub dropped: u64,
}

pub struct SyncForwarder {
    sink: Arc<dyn SyncSink>,
    config: SyncConfig,
    queue: Mutex<IndexMap<MessageId, Message>>,
    synced: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl SyncForwarder {
    pub fn new(sink: Arc<dyn SyncSink>, config: SyncConfig) -> Self {
        Self {
            sink,
            config,
            queue: Mutex::new(IndexMap::new()),
            synced: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a message if it has been sent or delivered.
    pub fn offer(&self, message: Message) -> bool {
        if !matches!(message.status, MessageStatus::Sent | MessageStatus::Delivered) {
            return false;
        }
        let mut queue = self.queue();
        // A later status for the same message replaces the queued copy in place.
        queue.insert(message.id.clone(), message);
        self.evict_overflow(&mut queue);
        true
    }

    fn evict_overflow(&self, queue: &mut IndexMap<MessageId, Message>) {
        let limit = self.config.max_queued.max(1);
        if queue.len() <= limit {
            return;
        }
        let excess = queue.len() - limit;
        queue.drain(..excess);
        self.dropped.fetch_add(excess as u64, Ordering::Relaxed);
        warn!(dropped = excess, limit, "Sync queue full, dropped oldest messages");
    }

    /// Upload one batch if the sink is online. Returns the number uploaded.
    pub async fn flush(&self) -> MeshResult<usize> {
        if !self.sink.is_online() {
            return Ok(0);
        }
        let batch: Vec<Message> = {
            let mut queue = self.queue();
            let take = queue.len().min(self.config.batch_size.max(1));
            queue.drain(..take).map(|(_, message)| message).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        match self.sink.upload(&batch).await {
            Ok(()) => {
                self.synced.fetch_add(batch.len() as u64, Ordering::Relaxed);
                debug!(count = batch.len(), "Uploaded message batch");
                Ok(batch.len())
            }
            Err(e) => {
                self.failed.fetch_add(batch.len() as u64, Ordering::Relaxed);
                warn!(count = batch.len(), "Message upload failed: {}", e);
                let mut queue = self.queue();
                // Newer copies offered during the upload stay where they are.
                for message in batch.into_iter().rev() {
                    if !queue.contains_key(&message.id) {
                        queue.shift_insert(0, message.id.clone(), message);
                    }
                }
                self.evict_overflow(&mut queue);
                Err(e)
            }
        }
    }

    /// Whether the sink currently accepts uploads.
    pub fn is_online(&self) -> bool {
        self.sink.is_online()
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            queued: self.queue().len(),
            synced: self.synced.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Follow `updates` and flush on the configured interval until cancelled.
    pub async fn run(
        self: Arc<Self>,
        store: Arc<dyn MessageStore>,
        mut updates: broadcast::Receiver<StatusUpdate>,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Ok(update) => self.follow(&store, update).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Sync forwarder lagged behind status stream");
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => {
                    // Failures are counted and logged by flush.
                    let _ = self.flush().await;
                }
            }
        }
    }

    async fn follow(&self, store: &Arc<dyn MessageStore>, update: StatusUpdate) {
        if !matches!(update.status, MessageStatus::Sent | MessageStatus::Delivered) {
            return;
        }
        let id = update.message_id.clone();
        match blocking(store, move |store| store.get_message(&id)).await {
            Ok(Some(message)) => {
                self.offer(message);
            }
            Ok(None) => {}
            Err(e) => warn!(message_id = %update.message_id, "Sync lookup failed: {}", e),
        }
    }

    fn queue(&self) -> MutexGuard<'_, IndexMap<MessageId, Message>> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MeshError;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct MockSink {
        online: AtomicBool,
        fail: AtomicBool,
        uploaded: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SyncSink for MockSink {
        fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }

        async fn upload(&self, batch: &[Message]) -> MeshResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(MeshError::Transport("backend unavailable".to_string()));
            }
            self.uploaded
                .lock()
                .unwrap()
                .extend(batch.iter().map(|m| m.id.clone()));
            Ok(())
        }
    }

    fn message(status: MessageStatus) -> Message {
        let mut message = Message::new("a", "b", "payload");
        message.status = status;
        message
    }

    #[test]
    fn test_offer_filters_by_status() {
        let forwarder = SyncForwarder::new(Arc::new(MockSink::default()), SyncConfig::default());
        assert!(!forwarder.offer(message(MessageStatus::Pending)));
        assert!(!forwarder.offer(message(MessageStatus::Failed)));
        assert!(forwarder.offer(message(MessageStatus::Sent)));
        assert!(forwarder.offer(message(MessageStatus::Delivered)));
        assert_eq!(forwarder.stats().queued, 2);
    }

    #[tokio::test]
    async fn test_flush_respects_online_and_batch_size() {
        let sink = Arc::new(MockSink::default());
        let config = SyncConfig {
            batch_size: 2,
            ..SyncConfig::default()
        };
        let forwarder = SyncForwarder::new(sink.clone(), config);
        for _ in 0..3 {
            forwarder.offer(message(MessageStatus::Sent));
        }

        assert_eq!(forwarder.flush().await.unwrap(), 0);

        sink.online.store(true, Ordering::SeqCst);
        assert_eq!(forwarder.flush().await.unwrap(), 2);
        assert_eq!(forwarder.flush().await.unwrap(), 1);
        assert_eq!(forwarder.flush().await.unwrap(), 0);

        let stats = forwarder.stats();
        assert_eq!(stats.synced, 3);
        assert_eq!(stats.queued, 0);
        assert_eq!(sink.uploaded.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_upload_is_requeued() {
        let sink = Arc::new(MockSink::default());
        sink.online.store(true, Ordering::SeqCst);
        sink.fail.store(true, Ordering::SeqCst);
        let forwarder = SyncForwarder::new(sink.clone(), SyncConfig::default());
        forwarder.offer(message(MessageStatus::Delivered));

        assert!(forwarder.flush().await.is_err());
        let stats = forwarder.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.queued, 1);

        sink.fail.store(false, Ordering::SeqCst);
        assert_eq!(forwarder.flush().await.unwrap(), 1);
        assert_eq!(forwarder.stats().synced, 1);
    }

    #[test]
    fn test_later_status_replaces_queued_copy() {
        let forwarder = SyncForwarder::new(Arc::new(MockSink::default()), SyncConfig::default());
        let mut sent = message(MessageStatus::Sent);
        forwarder.offer(sent.clone());
        sent.status = MessageStatus::Delivered;
        forwarder.offer(sent);
        assert_eq!(forwarder.stats().queued, 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest() {
        let sink = Arc::new(MockSink::default());
        let config = SyncConfig {
            max_queued: 2,
            ..SyncConfig::default()
        };
        let forwarder = SyncForwarder::new(sink.clone(), config);
        let offered: Vec<Message> = (0..3).map(|_| message(MessageStatus::Sent)).collect();
        for message in &offered {
            forwarder.offer(message.clone());
        }

        let stats = forwarder.stats();
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.dropped, 1);

        sink.online.store(true, Ordering::SeqCst);
        forwarder.flush().await.unwrap();
        assert_eq!(
            *sink.uploaded.lock().unwrap(),
            vec![offered[1].id.clone(), offered[2].id.clone()]
        );
    }
}
