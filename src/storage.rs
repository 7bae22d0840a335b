//! Event storage traits and the file-backed event log.
//!
//! The engine talks to persistence only through [`EventLog`] and
//! [`SnapshotStore`]. Both must enforce one record per `(stream_id, seq)`;
//! that uniqueness is what arbitrates a race between two writers.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::event::EventRecord;

/// Append-only, per-stream event storage.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Highest stored `seq` for `stream_id`, or `0` if the stream is empty.
    async fn max_seq(&self, stream_id: &str) -> Result<i64, StoreError>;

    /// All records of `stream_id` with `seq > after`, ascending.
    async fn read_after(&self, stream_id: &str, after: i64) -> Result<Vec<EventRecord>, StoreError>;

    /// Append a single record.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if the `(stream_id, seq)` pair exists.
    async fn append(&self, record: EventRecord) -> Result<(), StoreError> {
        self.append_batch(vec![record]).await
    }

    /// Append records of one stream atomically: either all are stored or
    /// none are.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] naming the first contested seq if any
    /// `(stream_id, seq)` pair exists.
    async fn append_batch(&self, records: Vec<EventRecord>) -> Result<(), StoreError>;
}

/// A serialized aggregate state at a given stream position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// Stream (aggregate id) the snapshot belongs to.
    pub stream_id: String,
    /// Highest event seq folded into `state`.
    pub seq: i64,
    /// The serialized aggregate state.
    pub state: serde_json::Value,
}

/// Latest-snapshot-per-stream storage.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The stored snapshot for `stream_id`, if any.
    async fn read(&self, stream_id: &str) -> Result<Option<SnapshotRecord>, StoreError>;

    /// Insert or replace the snapshot for `record.stream_id`.
    async fn upsert(&self, record: SnapshotRecord) -> Result<(), StoreError>;
}

/// Reject ids that cannot be used safely as a single path component.
pub(crate) fn check_stream_id(stream_id: &str) -> Result<(), StoreError> {
    let invalid = stream_id.is_empty()
        || stream_id == "."
        || stream_id == ".."
        || stream_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidStreamId(stream_id.to_owned()));
    }
    Ok(())
}

/// Directory layout shared by the file-backed stores.
///
/// ```text
/// <root>/
///     <event_table>/
///         <stream_id>/
///             events.jsonl
///     <snapshot_table>/
///         <stream_id>/
///             snapshot.json
/// ```
#[derive(Debug, Clone)]
pub struct StreamLayout {
    root: PathBuf,
    event_table: String,
    snapshot_table: String,
}

impl StreamLayout {
    /// Create a layout rooted at `root`.
    ///
    /// # Arguments
    ///
    /// * `root` - Base directory; created lazily on first write.
    /// * `event_table` - Subdirectory holding event logs.
    /// * `snapshot_table` - Subdirectory holding snapshots.
    pub fn new(
        root: impl Into<PathBuf>,
        event_table: impl Into<String>,
        snapshot_table: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            event_table: event_table.into(),
            snapshot_table: snapshot_table.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<event_table>/<stream_id>/events.jsonl`
    pub fn events_path(&self, stream_id: &str) -> PathBuf {
        self.root
            .join(&self.event_table)
            .join(stream_id)
            .join("events.jsonl")
    }

    /// `<root>/<snapshot_table>/<stream_id>/snapshot.json`
    pub fn snapshot_path(&self, stream_id: &str) -> PathBuf {
        self.root
            .join(&self.snapshot_table)
            .join(stream_id)
            .join("snapshot.json")
    }

    /// Lists stream ids that have an event log, sorted.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if reading the directory fails for a reason
    /// other than the directory not existing.
    pub fn list_streams(&self) -> io::Result<Vec<String>> {
        let table_dir = self.root.join(&self.event_table);
        let entries = match std::fs::read_dir(&table_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                entry
                    .file_type()
                    .ok()?
                    .is_dir()
                    .then(|| entry.file_name().to_string_lossy().into_owned())
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Event log stored as one JSON line per record, one file per stream.
///
/// Appends for a stream are serialized behind a per-stream async mutex, and
/// the file's tail seq is re-read under that lock, so uniqueness holds for
/// every writer sharing this instance. Separate processes must not write
/// the same stream directory.
#[derive(Debug)]
pub struct FileEventLog {
    layout: StreamLayout,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileEventLog {
    /// Open (lazily) an event log using `layout`.
    pub fn new(layout: StreamLayout) -> Self {
        Self {
            layout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn stream_lock(&self, stream_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(stream_id.to_owned()).or_default())
    }

    /// Forget the stream's lock once no other append holds or waits on it.
    async fn release_lock(&self, stream_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().await;
        drop(lock);
        if locks.get(stream_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(stream_id);
        }
    }

    /// Append under the stream's lock, truncating a torn tail first.
    async fn append_locked(
        &self,
        stream_id: &str,
        records: &[EventRecord],
    ) -> Result<(), StoreError> {
        let (existing, torn) = self.load_tail(stream_id).await?;
        let mut next = existing.last().map_or(0, |r| r.seq + 1);
        let mut buf = Vec::new();
        for record in records {
            if record.stream_id != stream_id {
                return Err(StoreError::InvalidStreamId(record.stream_id.clone()));
            }
            if record.seq < next {
                return Err(StoreError::Conflict {
                    stream_id: stream_id.to_owned(),
                    seq: record.seq,
                });
            }
            next = record.seq + 1;
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let path = self.layout.events_path(stream_id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        if let Some(intact) = torn {
            file.set_len(intact).await?;
        }
        // One write call per batch keeps the batch in a single append.
        file.write_all(&buf).await?;
        file.sync_data().await?;

        tracing::debug!(
            stream_id = %stream_id,
            count = records.len(),
            path = %path.display(),
            "appended events to log file"
        );
        Ok(())
    }

    /// Read every intact record of a stream.
    async fn load(&self, stream_id: &str) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self.load_tail(stream_id).await?.0)
    }

    /// Read every intact record, plus the byte length of the intact prefix
    /// when the file ends in a torn line.
    ///
    /// A final line without its terminating newline is a write that was
    /// cut short; it is skipped with a warning.
    async fn load_tail(
        &self,
        stream_id: &str,
    ) -> Result<(Vec<EventRecord>, Option<u64>), StoreError> {
        check_stream_id(stream_id)?;
        let path = self.layout.events_path(stream_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), None)),
            Err(e) => return Err(e.into()),
        };

        let complete = match content.rfind('\n') {
            Some(end) => &content[..=end],
            None => "",
        };
        let torn = if complete.len() < content.len() {
            tracing::warn!(
                path = %path.display(),
                stream_id = %stream_id,
                "ignoring torn trailing line in event log"
            );
            Some(complete.len() as u64)
        } else {
            None
        };

        let records = complete
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str::<EventRecord>(line).map_err(StoreError::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((records, torn))
    }
}

#[async_trait]
impl EventLog for FileEventLog {
    async fn max_seq(&self, stream_id: &str) -> Result<i64, StoreError> {
        let records = self.load(stream_id).await?;
        Ok(records.last().map_or(0, |r| r.seq))
    }

    async fn read_after(&self, stream_id: &str, after: i64) -> Result<Vec<EventRecord>, StoreError> {
        let mut records = self.load(stream_id).await?;
        records.retain(|r| r.seq > after);
        Ok(records)
    }

    async fn append_batch(&self, records: Vec<EventRecord>) -> Result<(), StoreError> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let stream_id = first.stream_id.clone();
        check_stream_id(&stream_id)?;

        let lock = self.stream_lock(&stream_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.append_locked(&stream_id, &records).await
        };
        self.release_lock(&stream_id, lock).await;
        result
    }
}
