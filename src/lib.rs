//! Embeddable event sourcing for per-aggregate event streams.
//!
//! Each aggregate instance owns an append-only stream of domain events.
//! A [`StreamEngine`] rebuilds state from the latest snapshot plus the
//! events after it, appends new events under an optimistic concurrency
//! check, writes snapshots according to a [`SnapshotPolicy`], and routes
//! completed cycles to projection callbacks.
//!
//! Most callers go through a [`StreamHandle`] (one stream) or a
//! [`StreamCache`] (many streams, bounded). Wiring is explicit: a
//! [`StreamRegistry`] bundles the stores, the [`EventApplicator`], the
//! [`ProjectionRouter`], and the [`PoliciesConfig`] for one aggregate type.

mod actor;
pub use actor::{ActorConfig, StreamActorHandle, spawn_stream_actor};
mod aggregate;
pub use aggregate::Aggregate;
mod applicator;
pub use applicator::{EventApplicator, EventApplicatorBuilder, TransitionFn};
mod cache;
mod config;
mod engine;
mod error;
mod event;
mod handle;
mod memory;
mod projection;
mod registry;
mod snapshot;
mod storage;

pub use cache::StreamCache;
pub use config::{DatabaseConfig, EngineConfig, PoliciesConfig, SnapshotPolicy};
pub use engine::StreamEngine;
pub use error::{StoreError, StreamError};
pub use event::{
    DomainEvent, EventEnvelope, EventRecord, STREAM_INITIALIZED, UNASSIGNED_SEQ, decode_event,
    encode_event,
};
pub use handle::{PostOptions, PostOutcome, StreamHandle};
pub use memory::{MemoryEventLog, MemorySnapshotStore};
pub use projection::{ProjectionError, ProjectionFuture, ProjectionReport, ProjectionRouter, Triggers};
pub use registry::{StreamRegistry, StreamRegistryBuilder};
pub use snapshot::FileSnapshotStore;
pub use storage::{EventLog, FileEventLog, SnapshotRecord, SnapshotStore, StreamLayout};
