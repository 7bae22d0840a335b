//! Crate-level error types for stream engines and their stores.

/// Error returned by an [`EventLog`](crate::EventLog) or
/// [`SnapshotStore`](crate::SnapshotStore) implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A record with this `(stream_id, seq)` already exists.
    ///
    /// Stores must enforce uniqueness of the pair; this is how a lost
    /// race between two writers is detected.
    #[error("seq {seq} already exists in stream '{stream_id}'")]
    Conflict {
        /// Stream the write targeted.
        stream_id: String,
        /// The duplicated sequence number.
        seq: i64,
    },

    /// The stream id cannot be used as a storage key.
    #[error("invalid stream id '{0}'")]
    InvalidStreamId(String),

    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted record could not be encoded or decoded.
    #[error("malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Error returned by stream engines, handles, and caches.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// An operation was called before `initialize`.
    ///
    /// Always a caller bug; never worth retrying.
    #[error("event stream is not initialized")]
    NotInitialized,

    /// Missing or invalid registration or configuration.
    ///
    /// Raised at startup (registry assembly, config validation) or when an
    /// engine is initialized without an event applicator.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The event applicator handler set is incomplete or inconsistent.
    #[error("invalid event handler registration: {0}")]
    InvalidHandler(String),

    /// No transition is registered for this event type.
    ///
    /// Indicates a deployment or version mismatch between the code and
    /// the stored stream.
    #[error("unsupported event type '{event_type}'")]
    UnsupportedEvent {
        /// The unrecognized type tag.
        event_type: String,
    },

    /// Another writer already appended at this sequence number.
    ///
    /// Recoverable: refresh the state and retry the decide-and-post cycle.
    #[error("concurrency conflict: seq {seq} already written to stream '{stream_id}'")]
    ConcurrencyConflict {
        /// Stream the write targeted.
        stream_id: String,
        /// The contested sequence number.
        seq: i64,
    },

    /// Transient failure in an event log or snapshot store.
    #[error("store I/O error: {0}")]
    StoreIo(#[source] StoreError),

    /// A payload or snapshot could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The actor owning this stream has stopped.
    #[error("stream actor is no longer running")]
    ActorGone,
}

impl From<StoreError> for StreamError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { stream_id, seq } => {
                StreamError::ConcurrencyConflict { stream_id, seq }
            }
            other => StreamError::StoreIo(other),
        }
    }
}
