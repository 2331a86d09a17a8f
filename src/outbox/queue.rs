use std::sync::Arc;

use super::record::TelemetryRecord;
use crate::error::StorageError;
use crate::storage::KeyValueStore;

/// Ordered, persisted list of records awaiting delivery.
///
/// Every mutation rewrites the whole array under `key`. The in-memory copy is
/// authoritative: when a write fails the mutation is kept and the error is
/// returned so the caller can report lost durability.
pub struct OutboxQueue<S: KeyValueStore> {
    records: Vec<TelemetryRecord>,
    store: Arc<S>,
    key: String,
}

impl<S: KeyValueStore> OutboxQueue<S> {
    pub fn new(store: Arc<S>, key: impl Into<String>) -> Self {
        Self {
            records: Vec::new(),
            store,
            key: key.into(),
        }
    }

    /// Replace the in-memory records with the persisted copy.
    ///
    /// A missing key is an empty queue. Read or decode failures leave the
    /// queue empty and are returned for logging.
    pub fn load(&mut self) -> Result<usize, StorageError> {
        let Some(bytes) = self.store.read(&self.key)? else {
            self.records.clear();
            return Ok(0);
        };
        let records: Vec<TelemetryRecord> =
            serde_json::from_slice(&bytes).map_err(|e| StorageError::Corrupt {
                key: self.key.clone(),
                reason: e.to_string(),
            })?;
        self.records = records;
        Ok(self.records.len())
    }

    pub fn push(&mut self, record: TelemetryRecord) -> Result<(), StorageError> {
        self.records.push(record);
        self.persist()
    }

    /// Remove the first `n` records (a delivered batch), returning how many
    /// were actually removed
    pub fn remove_front(&mut self, n: usize) -> Result<usize, StorageError> {
        let n = n.min(self.records.len());
        self.records.drain(..n);
        self.persist().map(|_| n)
    }

    /// Drop everything, including the persisted copy
    pub fn clear(&mut self) -> Result<(), StorageError> {
        self.records.clear();
        self.store.delete(&self.key)
    }

    pub fn snapshot(&self) -> Vec<TelemetryRecord> {
        self.records.clone()
    }

    pub fn records(&self) -> &[TelemetryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn persist(&self) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(&self.records).map_err(|e| StorageError::Corrupt {
            key: self.key.clone(),
            reason: e.to_string(),
        })?;
        self.store.write(&self.key, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStore;
    use crate::test_support::FlakyStore;

    fn record(n: u32) -> TelemetryRecord {
        TelemetryRecord {
            device_id: "dev".to_string(),
            timestamp: format!("2025-11-19T12:00:{:02}.000Z", n),
            service_code: "S".to_string(),
            account_id: "A".to_string(),
            latitude: n as f64,
            longitude: -(n as f64),
            speed_kph: 0.0,
            heading: 0.0,
            address: format!("stop {}", n),
        }
    }

    #[test]
    fn test_every_push_is_persisted_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());

        let mut queue = OutboxQueue::new(store.clone(), "outbox_queue");
        queue.push(record(1)).unwrap();
        queue.push(record(2)).unwrap();
        queue.push(record(3)).unwrap();

        // A fresh process sees the same records in the same order
        let mut reloaded = OutboxQueue::new(store, "outbox_queue");
        assert_eq!(reloaded.load().unwrap(), 3);
        assert_eq!(reloaded.records(), queue.records());
        assert_eq!(reloaded.records()[0].address, "stop 1");
        assert_eq!(reloaded.records()[2].address, "stop 3");
    }

    #[test]
    fn test_remove_front_only_drops_the_batch() {
        let store = FlakyStore::new();
        let mut queue = OutboxQueue::new(store.clone(), "q");
        for n in 0..5 {
            queue.push(record(n)).unwrap();
        }

        assert_eq!(queue.remove_front(3).unwrap(), 3);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.records()[0].address, "stop 3");

        let persisted: Vec<TelemetryRecord> = serde_json::from_slice(&store.raw("q").unwrap()).unwrap();
        assert_eq!(persisted.len(), 2);

        // Asking for more than is queued empties it
        assert_eq!(queue.remove_front(10).unwrap(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_clear_deletes_persisted_copy() {
        let store = FlakyStore::new();
        let mut queue = OutboxQueue::new(store.clone(), "q");
        queue.push(record(1)).unwrap();
        assert!(store.raw("q").is_some());

        queue.clear().unwrap();
        assert!(queue.is_empty());
        assert!(store.raw("q").is_none());
    }

    #[test]
    fn test_write_failure_keeps_memory_copy() {
        let store = FlakyStore::new();
        store.set_fail_writes(true);
        let mut queue = OutboxQueue::new(store.clone(), "q");

        assert!(queue.push(record(1)).is_err());
        assert_eq!(queue.len(), 1);
        assert!(store.raw("q").is_none());

        // Durability comes back with the next successful write
        store.set_fail_writes(false);
        queue.push(record(2)).unwrap();
        let persisted: Vec<TelemetryRecord> = serde_json::from_slice(&store.raw("q").unwrap()).unwrap();
        assert_eq!(persisted.len(), 2);
    }

    #[test]
    fn test_corrupt_persisted_value() {
        let store = FlakyStore::new();
        store.write("q", b"{not an array").unwrap();
        let mut queue = OutboxQueue::new(store, "q");
        assert!(matches!(queue.load(), Err(StorageError::Corrupt { .. })));
        assert!(queue.is_empty());
    }
}
