//! In-memory event log and snapshot store.
//!
//! Useful for tests and for embedding an engine whose history does not
//! need to outlive the process. Both stores are cheap to share behind an
//! `Arc`; every engine given the same instance sees the same data.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::event::EventRecord;
use crate::storage::{EventLog, SnapshotRecord, SnapshotStore};

/// [`EventLog`] holding every stream in a map of ordered vectors.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    streams: RwLock<HashMap<String, Vec<EventRecord>>>,
}

impl MemoryEventLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record of `stream_id`, ascending.
    pub async fn records(&self, stream_id: &str) -> Vec<EventRecord> {
        let streams = self.streams.read().await;
        streams.get(stream_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn max_seq(&self, stream_id: &str) -> Result<i64, StoreError> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(stream_id)
            .and_then(|records| records.last())
            .map_or(0, |r| r.seq))
    }

    async fn read_after(&self, stream_id: &str, after: i64) -> Result<Vec<EventRecord>, StoreError> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(stream_id)
            .map(|records| records.iter().filter(|r| r.seq > after).cloned().collect())
            .unwrap_or_default())
    }

    async fn append_batch(&self, records: Vec<EventRecord>) -> Result<(), StoreError> {
        let mut streams = self.streams.write().await;

        // Validate the whole batch before touching any stream.
        for (i, record) in records.iter().enumerate() {
            let stored = streams
                .get(&record.stream_id)
                .is_some_and(|existing| existing.iter().any(|r| r.seq == record.seq));
            let repeated = records[..i]
                .iter()
                .any(|r| r.stream_id == record.stream_id && r.seq == record.seq);
            if stored || repeated {
                return Err(StoreError::Conflict {
                    stream_id: record.stream_id.clone(),
                    seq: record.seq,
                });
            }
        }

        for record in records {
            let stream = streams.entry(record.stream_id.clone()).or_default();
            let at = stream.partition_point(|r| r.seq < record.seq);
            stream.insert(at, record);
        }
        Ok(())
    }
}

/// [`SnapshotStore`] holding the latest snapshot of each stream.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<String, SnapshotRecord>>,
}

impl MemorySnapshotStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn read(&self, stream_id: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        Ok(self.snapshots.read().await.get(stream_id).cloned())
    }

    async fn upsert(&self, record: SnapshotRecord) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .await
            .insert(record.stream_id.clone(), record);
        Ok(())
    }
}
