//! Local file-based snapshot persistence.
//!
//! One JSON file per stream at
//! `<root>/<snapshot_table>/<stream_id>/snapshot.json`. Writes are atomic
//! via a temp-rename pattern so a crash mid-write never leaves a torn
//! snapshot behind.

use std::io;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::storage::{SnapshotRecord, SnapshotStore, StreamLayout, check_stream_id};

/// [`SnapshotStore`] keeping the latest snapshot of each stream on disk.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    layout: StreamLayout,
}

impl FileSnapshotStore {
    /// Open (lazily) a snapshot store using `layout`.
    pub fn new(layout: StreamLayout) -> Self {
        Self { layout }
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    /// Load the snapshot for `stream_id`.
    ///
    /// A file that does not deserialize is treated as missing: the engine
    /// then rebuilds state from the full event log. The failure is logged
    /// via `tracing::warn!`.
    async fn read(&self, stream_id: &str) -> Result<Option<SnapshotRecord>, StoreError> {
        check_stream_id(stream_id)?;
        let path = self.layout.snapshot_path(stream_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<SnapshotRecord>(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to deserialize snapshot; treating as missing"
                );
                Ok(None)
            }
        }
    }

    /// Write `snapshot.json.tmp` next to the target, then rename it over
    /// `snapshot.json`.
    async fn upsert(&self, record: SnapshotRecord) -> Result<(), StoreError> {
        check_stream_id(&record.stream_id)?;
        let path = self.layout.snapshot_path(&record.stream_id);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(&tmp_path, &json).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }
}
