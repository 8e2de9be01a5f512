use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{PersistentStore, StorageError, DEFAULT_DETAIL_LIMIT};
use crate::model::{Event, EventId, Timestamp};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 64 * 1024 * 1024;
const STORE_MAGIC: &[u8; 4] = b"EVST";

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct StorePayload {
    events: Vec<Event>,
    /// Oldest write first.
    details: Vec<Event>,
    sync_cursor: Option<Timestamp>,
    total_count: Option<usize>,
    #[serde(default)]
    loaded_pages: Option<usize>,
}

/// Single-file snapshot store.
///
/// Every write rewrites the whole snapshot through a temp file and a rename,
/// so a crash leaves either the old or the new snapshot on disk. Calls are
/// serialized in-process; one file must not be shared by two stores.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    io_lock: Mutex<()>,
    detail_limit: usize,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io_lock: Mutex::new(()),
            detail_limit: DEFAULT_DETAIL_LIMIT,
        }
    }

    #[must_use]
    pub fn with_detail_limit(mut self, limit: usize) -> Self {
        self.detail_limit = limit;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_modify_write(
        &self,
        f: impl FnOnce(&mut StorePayload),
    ) -> Result<(), StorageError> {
        let _guard = self.io_lock.lock().map_err(|_| StorageError::LockFailed)?;
        let mut payload = load_from_path(&self.path)?;
        f(&mut payload);
        save_to_path(&self.path, &payload)
    }

    fn read<T>(&self, f: impl FnOnce(StorePayload) -> T) -> Result<T, StorageError> {
        let _guard = self.io_lock.lock().map_err(|_| StorageError::LockFailed)?;
        Ok(f(load_from_path(&self.path)?))
    }
}

fn serialize(payload: &StorePayload) -> Result<Vec<u8>, StorageError> {
    let mut payload_bytes = Vec::new();
    ciborium::into_writer(payload, &mut payload_bytes)?;

    let checksum = blake3::hash(&payload_bytes);

    let envelope = StoreEnvelope {
        magic: *STORE_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload: payload_bytes,
    };

    let mut envelope_bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut envelope_bytes)?;

    if envelope_bytes.len() > MAX_STORE_BYTES {
        return Err(StorageError::StoreTooLarge {
            size: envelope_bytes.len(),
            max: MAX_STORE_BYTES,
        });
    }
    Ok(envelope_bytes)
}

fn deserialize(bytes: &[u8]) -> Result<StorePayload, StorageError> {
    if bytes.len() > MAX_STORE_BYTES {
        return Err(StorageError::StoreTooLarge {
            size: bytes.len(),
            max: MAX_STORE_BYTES,
        });
    }

    let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StorageError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StorageError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let actual_checksum = blake3::hash(&envelope.payload);
    if actual_checksum.as_bytes() != &envelope.checksum {
        return Err(StorageError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual_checksum.as_bytes()),
        });
    }

    Ok(ciborium::from_reader(&envelope.payload[..])?)
}

fn save_to_path(path: &Path, payload: &StorePayload) -> Result<(), StorageError> {
    let bytes = serialize(payload)?;

    let tmp_path = path.with_extension("tmp");

    let mut file = File::create(&tmp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;

    std::fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

fn load_from_path(path: &Path) -> Result<StorePayload, StorageError> {
    if !path.exists() {
        return Ok(StorePayload::default());
    }

    let bytes = std::fs::read(path)?;

    if bytes.is_empty() {
        return Err(StorageError::Corrupted {
            reason: "empty file",
        });
    }

    deserialize(&bytes)
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn get_all(&self) -> Result<Vec<Event>, StorageError> {
        self.read(|payload| payload.events)
    }

    async fn put_all(&self, events: &[Event]) -> Result<(), StorageError> {
        self.read_modify_write(|payload| payload.events = events.to_vec())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.io_lock.lock().map_err(|_| StorageError::LockFailed)?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_sync_cursor(&self) -> Result<Option<Timestamp>, StorageError> {
        self.read(|payload| payload.sync_cursor)
    }

    async fn set_sync_cursor(&self, cursor: Timestamp) -> Result<(), StorageError> {
        self.read_modify_write(|payload| payload.sync_cursor = Some(cursor))
    }

    async fn get_total_count(&self) -> Result<Option<usize>, StorageError> {
        self.read(|payload| payload.total_count)
    }

    async fn set_total_count(&self, total: usize) -> Result<(), StorageError> {
        self.read_modify_write(|payload| payload.total_count = Some(total))
    }

    async fn get_loaded_pages(&self) -> Result<Option<usize>, StorageError> {
        self.read(|payload| payload.loaded_pages)
    }

    async fn set_loaded_pages(&self, pages: usize) -> Result<(), StorageError> {
        self.read_modify_write(|payload| payload.loaded_pages = Some(pages))
    }

    async fn get_detail(&self, id: &EventId) -> Result<Option<Event>, StorageError> {
        self.read(|payload| payload.details.into_iter().find(|e| &e.id == id))
    }

    async fn put_detail(&self, event: &Event) -> Result<(), StorageError> {
        let limit = self.detail_limit;
        self.read_modify_write(|payload| {
            payload.details.retain(|e| e.id != event.id);
            payload.details.push(event.clone());
            let excess = payload.details.len().saturating_sub(limit);
            payload.details.drain(..excess);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_event;
    use tempfile::tempdir;

    #[tokio::test]
    async fn file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.bin");
        let store = FileStore::new(&path);

        let events = vec![sample_event("a", 2), sample_event("b", 1)];
        store.put_all(&events).await.unwrap();
        store.set_total_count(7).await.unwrap();
        store.set_loaded_pages(3).await.unwrap();
        store.set_sync_cursor(events[0].start_time).await.unwrap();

        let reopened = FileStore::new(&path);
        assert_eq!(reopened.get_all().await.unwrap(), events);
        assert_eq!(reopened.get_total_count().await.unwrap(), Some(7));
        assert_eq!(reopened.get_loaded_pages().await.unwrap(), Some(3));
        assert_eq!(reopened.get_sync_cursor().await.unwrap(), Some(events[0].start_time));
    }

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path().join("nothing.bin"));

        assert!(store.get_all().await.unwrap().is_empty());
        assert_eq!(store.get_sync_cursor().await.unwrap(), None);
    }

    #[tokio::test]
    async fn empty_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        std::fs::write(&path, b"").unwrap();

        let result = FileStore::new(&path).get_all().await;

        assert!(matches!(result, Err(StorageError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn tampered_payload_fails_integrity_check() {
        let mut payload = StorePayload::default();
        payload.events.push(sample_event("a", 1));
        let bytes = serialize(&payload).unwrap();

        let mut envelope: StoreEnvelope = ciborium::from_reader(&bytes[..]).unwrap();
        envelope.checksum[0] ^= 0xFF;
        let mut tampered = Vec::new();
        ciborium::into_writer(&envelope, &mut tampered).unwrap();

        assert!(matches!(
            deserialize(&tampered),
            Err(StorageError::IntegrityCheckFailed { .. })
        ));
    }

    #[test]
    fn future_schema_rejected() {
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION + 1,
            checksum: [0; 32],
            payload: vec![],
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();

        assert!(matches!(
            deserialize(&bytes),
            Err(StorageError::FutureSchema { .. })
        ));
    }

    #[test]
    fn oversized_input_rejected() {
        let oversized = vec![0u8; MAX_STORE_BYTES + 1];
        assert!(matches!(
            deserialize(&oversized),
            Err(StorageError::StoreTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_tmp_on_success() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.bin");
        let store = FileStore::new(&path);

        store.put_all(&[sample_event("a", 1)]).await.unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn details_upsert_by_id_and_clear_removes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.bin");
        let store = FileStore::new(&path);

        let mut event = sample_event("d", 1);
        store.put_detail(&event).await.unwrap();
        event.available_slot = 1;
        store.put_detail(&event).await.unwrap();

        let stored = store.get_detail(&event.id).await.unwrap().unwrap();
        assert_eq!(stored.available_slot, 1);

        store.clear().await.unwrap();
        assert!(!path.exists());
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn stored_details_stay_within_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.bin");
        let store = FileStore::new(&path).with_detail_limit(2);

        for i in 0..6 {
            store.put_detail(&sample_event(&format!("d{i}"), i)).await.unwrap();
        }

        let payload = load_from_path(&path).unwrap();
        assert_eq!(payload.details.len(), 2);
        assert!(store.get_detail(&EventId::new("d0")).await.unwrap().is_none());
        assert!(store.get_detail(&EventId::new("d4")).await.unwrap().is_some());
        assert!(store.get_detail(&EventId::new("d5")).await.unwrap().is_some());
    }
}
