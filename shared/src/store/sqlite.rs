use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::key::{KeyNamespace, StoreKey};
use super::{PersistentStore, StorageError, DEFAULT_DETAIL_LIMIT};
use crate::model::{Event, EventId, Timestamp};

/// SQLite-backed key/blob store.
///
/// Events, detail records and metadata share one `kv` table; values are JSON.
/// The connection is guarded by a mutex, so every call runs to completion
/// before the next one starts.
///
/// Detail rows are rewritten with `INSERT OR REPLACE`, so their rowid orders
/// them by last write and the oldest are pruned past the detail limit.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    detail_limit: usize,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            detail_limit: DEFAULT_DETAIL_LIMIT,
        })
    }

    #[must_use]
    pub fn with_detail_limit(mut self, limit: usize) -> Self {
        self.detail_limit = limit;
        self
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut conn = self.conn.lock().map_err(|_| StorageError::LockFailed)?;
        f(&mut conn)
    }

    fn get_value<T: serde::de::DeserializeOwned>(
        &self,
        key: &StoreKey,
    ) -> Result<Option<T>, StorageError> {
        self.with_conn(|conn| {
            let bytes: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT value FROM kv WHERE key = ?1",
                    params![key.raw()],
                    |row| row.get(0),
                )
                .optional()?;
            bytes
                .map(|b| serde_json::from_slice(&b))
                .transpose()
                .map_err(StorageError::from)
        })
    }

    fn set_value<T: serde::Serialize>(&self, key: &StoreKey, value: &T) -> Result<(), StorageError> {
        let data = serde_json::to_vec(value)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key.raw(), data],
            )?;
            Ok(())
        })
    }
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn get_all(&self) -> Result<Vec<Event>, StorageError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM kv WHERE key LIKE ?1")?;
            let rows = stmt.query_map(params![KeyNamespace::Event.like_pattern()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (key, data) = row?;
                match serde_json::from_slice::<Event>(&data) {
                    Ok(event) => events.push(event),
                    Err(e) => tracing::warn!(%key, error = %e, "skipping unreadable cached event"),
                }
            }
            Ok(events)
        })
    }

    async fn put_all(&self, events: &[Event]) -> Result<(), StorageError> {
        let mut rows = Vec::with_capacity(events.len());
        for event in events {
            rows.push((StoreKey::event(&event.id)?.raw(), serde_json::to_vec(event)?));
        }

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM kv WHERE key LIKE ?1",
                params![KeyNamespace::Event.like_pattern()],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO kv (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                )?;
                for (key, data) in &rows {
                    stmt.execute(params![key, data])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM kv", [])?;
            Ok(())
        })
    }

    async fn get_sync_cursor(&self) -> Result<Option<Timestamp>, StorageError> {
        self.get_value(&StoreKey::meta(StoreKey::SYNC_CURSOR)?)
    }

    async fn set_sync_cursor(&self, cursor: Timestamp) -> Result<(), StorageError> {
        self.set_value(&StoreKey::meta(StoreKey::SYNC_CURSOR)?, &cursor)
    }

    async fn get_total_count(&self) -> Result<Option<usize>, StorageError> {
        self.get_value(&StoreKey::meta(StoreKey::TOTAL_COUNT)?)
    }

    async fn set_total_count(&self, total: usize) -> Result<(), StorageError> {
        self.set_value(&StoreKey::meta(StoreKey::TOTAL_COUNT)?, &total)
    }

    async fn get_loaded_pages(&self) -> Result<Option<usize>, StorageError> {
        self.get_value(&StoreKey::meta(StoreKey::LOADED_PAGES)?)
    }

    async fn set_loaded_pages(&self, pages: usize) -> Result<(), StorageError> {
        self.set_value(&StoreKey::meta(StoreKey::LOADED_PAGES)?, &pages)
    }

    async fn get_detail(&self, id: &EventId) -> Result<Option<Event>, StorageError> {
        self.get_value(&StoreKey::detail(id)?)
    }

    async fn put_detail(&self, event: &Event) -> Result<(), StorageError> {
        let key = StoreKey::detail(&event.id)?.raw();
        let data = serde_json::to_vec(event)?;
        let limit = i64::try_from(self.detail_limit).unwrap_or(i64::MAX);
        let pattern = KeyNamespace::Detail.like_pattern();

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
                params![key, data],
            )?;
            tx.execute(
                "DELETE FROM kv WHERE key LIKE ?1 AND rowid NOT IN (
                     SELECT rowid FROM kv WHERE key LIKE ?1 ORDER BY rowid DESC LIMIT ?2
                 )",
                params![pattern, limit],
            )?;
            tx.commit()?;
            Ok(())
        })
    }
}
