//! Record store for messages, devices and peer keys.
//!
//! The store is the system of record: in-memory queues are rebuilt from it on
//! restart. Methods are synchronous; async callers go through [`blocking`] so
//! SQLite work never runs on the runtime threads.

use crate::error::{MeshError, MeshResult};
use hybridmesh_core::{Device, DeviceId, Message, MessageStatus, TransportType};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Persistence contract required by the delivery pipeline and orchestrator.
pub trait MessageStore: Send + Sync {
    /// Insert or replace by message id.
    fn save_message(&self, message: &Message) -> MeshResult<()>;

    fn get_message(&self, id: &str) -> MeshResult<Option<Message>>;

    /// Messages in `status`, oldest first.
    fn messages_by_status(&self, status: MessageStatus) -> MeshResult<Vec<Message>>;

    /// Messages in `status` created before `before_ms`, oldest first.
    fn messages_by_status_before(
        &self,
        status: MessageStatus,
        before_ms: u64,
    ) -> MeshResult<Vec<Message>>;

    /// Conversation with `peer` in either direction, oldest first.
    fn messages_with_peer(&self, peer: &str) -> MeshResult<Vec<Message>>;

    fn delete_message(&self, id: &str) -> MeshResult<bool>;

    /// Delete messages in `status` created before `before_ms`.
    fn delete_messages_before(&self, status: MessageStatus, before_ms: u64) -> MeshResult<usize>;

    fn count_by_status(&self, status: MessageStatus) -> MeshResult<usize>;

    /// Insert or replace by device id.
    fn save_device(&self, device: &Device) -> MeshResult<()>;

    fn get_device(&self, id: &str) -> MeshResult<Option<Device>>;

    fn all_devices(&self) -> MeshResult<Vec<Device>>;

    fn online_devices(&self) -> MeshResult<Vec<Device>>;

    /// Delete devices last seen before `before_ms`.
    fn delete_devices_before(&self, before_ms: u64) -> MeshResult<usize>;

    /// Insert or replace a peer's encoded key bundle.
    fn save_peer_key(&self, device_id: &str, bundle: &str) -> MeshResult<()>;

    fn peer_keys(&self) -> MeshResult<Vec<(DeviceId, String)>>;

    /// Remove every message, device and peer key.
    fn clear_all(&self) -> MeshResult<()>;
}

/// Run a store operation on the blocking thread pool.
pub async fn blocking<T, F>(store: &Arc<dyn MessageStore>, op: F) -> MeshResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn MessageStore) -> MeshResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref())).await?
}

const MESSAGE_COLUMNS: &str = "id, content, sender_id, receiver_id, timestamp, is_encrypted, \
     hop_count, max_hops, status, route, transport";

/// SQLite-backed store.
#[derive(Debug)]
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`. `:memory:` is allowed.
    pub fn open<P: AsRef<Path>>(db_path: P) -> MeshResult<Self> {
        let db = Connection::open(db_path)?;
        Self::init(db)
    }

    pub fn in_memory() -> MeshResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(db: Connection) -> MeshResult<Self> {
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                is_encrypted INTEGER NOT NULL DEFAULT 0,
                hop_count INTEGER NOT NULL DEFAULT 0,
                max_hops INTEGER NOT NULL,
                status TEXT NOT NULL,
                route TEXT NOT NULL,
                transport TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_status_timestamp
                ON messages(status, timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_peers
                ON messages(sender_id, receiver_id);

            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                last_seen INTEGER NOT NULL,
                is_online INTEGER NOT NULL,
                record TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_devices_last_seen ON devices(last_seen);

            CREATE TABLE IF NOT EXISTS peer_keys (
                device_id TEXT PRIMARY KEY,
                bundle TEXT NOT NULL
            );",
        )?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.db.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn query_messages(&self, sql: &str, params: impl rusqlite::Params) -> MeshResult<Vec<Message>> {
        let db = self.conn();
        let mut stmt = db.prepare(sql)?;
        let rows = stmt
            .query_map(params, row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn query_devices(&self, sql: &str) -> MeshResult<Vec<Device>> {
        let db = self.conn();
        let mut stmt = db.prepare(sql)?;
        let records = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        records
            .iter()
            .map(|record| serde_json::from_str(record).map_err(MeshError::from))
            .collect()
    }
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let status: String = row.get(8)?;
    let route: String = row.get(9)?;
    let transport: String = row.get(10)?;
    Ok(Message {
        id: row.get(0)?,
        content: row.get(1)?,
        sender_id: row.get(2)?,
        receiver_id: row.get(3)?,
        timestamp: row.get::<_, i64>(4)? as u64,
        is_encrypted: row.get::<_, i32>(5)? != 0,
        hop_count: row.get(6)?,
        max_hops: row.get(7)?,
        status: MessageStatus::parse(&status).ok_or_else(|| invalid_column(8, &status))?,
        route: serde_json::from_str(&route).map_err(|_| invalid_column(9, &route))?,
        transport: TransportType::parse(&transport).ok_or_else(|| invalid_column(10, &transport))?,
    })
}

fn invalid_column(index: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        format!("unexpected value: {}", value).into(),
    )
}

impl MessageStore for SqliteStore {
    fn save_message(&self, message: &Message) -> MeshResult<()> {
        let route = serde_json::to_string(&message.route)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO messages
                (id, content, sender_id, receiver_id, timestamp, is_encrypted,
                 hop_count, max_hops, status, route, transport)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.id,
                message.content,
                message.sender_id,
                message.receiver_id,
                message.timestamp as i64,
                message.is_encrypted as i32,
                message.hop_count,
                message.max_hops,
                message.status.as_str(),
                route,
                message.transport.as_str(),
            ],
        )?;
        debug!(message_id = %message.id, status = %message.status, "Persisted message");
        Ok(())
    }

    fn get_message(&self, id: &str) -> MeshResult<Option<Message>> {
        let db = self.conn();
        let message = db
            .query_row(
                &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
                [id],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    fn messages_by_status(&self, status: MessageStatus) -> MeshResult<Vec<Message>> {
        self.query_messages(
            &format!(
                "SELECT {} FROM messages WHERE status = ?1 ORDER BY timestamp, id",
                MESSAGE_COLUMNS
            ),
            [status.as_str()],
        )
    }

    fn messages_by_status_before(
        &self,
        status: MessageStatus,
        before_ms: u64,
    ) -> MeshResult<Vec<Message>> {
        self.query_messages(
            &format!(
                "SELECT {} FROM messages WHERE status = ?1 AND timestamp < ?2 ORDER BY timestamp, id",
                MESSAGE_COLUMNS
            ),
            params![status.as_str(), before_ms as i64],
        )
    }

    fn messages_with_peer(&self, peer: &str) -> MeshResult<Vec<Message>> {
        self.query_messages(
            &format!(
                "SELECT {} FROM messages WHERE sender_id = ?1 OR receiver_id = ?1 ORDER BY timestamp, id",
                MESSAGE_COLUMNS
            ),
            [peer],
        )
    }

    fn delete_message(&self, id: &str) -> MeshResult<bool> {
        let deleted = self.conn().execute("DELETE FROM messages WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    fn delete_messages_before(&self, status: MessageStatus, before_ms: u64) -> MeshResult<usize> {
        let deleted = self.conn().execute(
            "DELETE FROM messages WHERE status = ?1 AND timestamp < ?2",
            params![status.as_str(), before_ms as i64],
        )?;
        Ok(deleted)
    }

    fn count_by_status(&self, status: MessageStatus) -> MeshResult<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn save_device(&self, device: &Device) -> MeshResult<()> {
        let record = serde_json::to_string(device)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO devices (id, last_seen, is_online, record)
             VALUES (?1, ?2, ?3, ?4)",
            params![device.id, device.last_seen as i64, device.is_online as i32, record],
        )?;
        Ok(())
    }

    fn get_device(&self, id: &str) -> MeshResult<Option<Device>> {
        let record: Option<String> = self
            .conn()
            .query_row("SELECT record FROM devices WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        record
            .map(|r| serde_json::from_str(&r).map_err(MeshError::from))
            .transpose()
    }

    fn all_devices(&self) -> MeshResult<Vec<Device>> {
        self.query_devices("SELECT record FROM devices ORDER BY id")
    }

    fn online_devices(&self) -> MeshResult<Vec<Device>> {
        self.query_devices("SELECT record FROM devices WHERE is_online = 1 ORDER BY id")
    }

    fn delete_devices_before(&self, before_ms: u64) -> MeshResult<usize> {
        let deleted = self
            .conn()
            .execute("DELETE FROM devices WHERE last_seen < ?1", [before_ms as i64])?;
        Ok(deleted)
    }

    fn save_peer_key(&self, device_id: &str, bundle: &str) -> MeshResult<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO peer_keys (device_id, bundle) VALUES (?1, ?2)",
            [device_id, bundle],
        )?;
        Ok(())
    }

    fn peer_keys(&self) -> MeshResult<Vec<(DeviceId, String)>> {
        let db = self.conn();
        let mut stmt = db.prepare("SELECT device_id, bundle FROM peer_keys ORDER BY device_id")?;
        let keys = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(keys)
    }

    fn clear_all(&self) -> MeshResult<()> {
        self.conn().execute_batch(
            "DELETE FROM messages;
             DELETE FROM devices;
             DELETE FROM peer_keys;",
        )?;
        Ok(())
    }
}
