//! The per-aggregate stream engine.
//!
//! A [`StreamEngine`] owns one aggregate's live state and version. It
//! rebuilds state from the latest snapshot plus the events after it, appends
//! new events under an optimistic concurrency check, decides when to write
//! snapshots, and hands each completed cycle to the projection router.
//!
//! Engines are not internally synchronized: every mutating operation takes
//! `&mut self`. Share one behind a mutex or a
//! [`StreamActor`](crate::spawn_stream_actor) when several tasks need it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::Instrument;

use crate::aggregate::Aggregate;
use crate::applicator::EventApplicator;
use crate::config::SnapshotPolicy;
use crate::error::{StoreError, StreamError};
use crate::event::{
    DomainEvent, EventEnvelope, EventRecord, UNASSIGNED_SEQ, decode_event, encode_event,
};
use crate::registry::StreamRegistry;
use crate::storage::SnapshotRecord;

/// State held once an engine is bound to a stream.
struct LiveStream<A> {
    id: String,
    seq: i64,
    state: A,
    last_snapshot_seq: i64,
    last_snapshot_at: Instant,
}

/// What one read or write cycle did, for projection routing.
#[derive(Debug, Default)]
struct Cycle {
    applied: BTreeSet<&'static str>,
    snapshot_written: bool,
}

/// Drives the read/replay/write/snapshot cycle for one aggregate.
pub struct StreamEngine<A: Aggregate> {
    registry: Arc<StreamRegistry<A>>,
    live: Option<LiveStream<A>>,
}

impl<A: Aggregate> fmt::Debug for StreamEngine<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("StreamEngine");
        s.field("aggregate_type", &A::AGGREGATE_TYPE);
        match &self.live {
            Some(live) => s
                .field("id", &live.id)
                .field("seq", &live.seq)
                .field("last_snapshot_seq", &live.last_snapshot_seq),
            None => s.field("initialized", &false),
        };
        s.finish()
    }
}

impl<A: Aggregate> StreamEngine<A> {
    /// An uninitialized engine. Call [`initialize`](Self::initialize) before
    /// anything else.
    pub fn new(registry: Arc<StreamRegistry<A>>) -> Self {
        Self {
            registry,
            live: None,
        }
    }

    /// Whether [`initialize`](Self::initialize) has completed.
    pub fn is_initialized(&self) -> bool {
        self.live.is_some()
    }

    /// The stream id, once initialized.
    pub fn id(&self) -> Option<&str> {
        self.live.as_ref().map(|live| live.id.as_str())
    }

    /// The registry this engine was built with.
    pub fn registry(&self) -> &Arc<StreamRegistry<A>> {
        &self.registry
    }

    /// The version of the state this engine holds.
    ///
    /// # Errors
    ///
    /// [`StreamError::NotInitialized`] before initialization.
    pub fn seq(&self) -> Result<i64, StreamError> {
        Ok(self.live()?.seq)
    }

    /// Seq of the last snapshot this engine wrote or loaded.
    ///
    /// # Errors
    ///
    /// [`StreamError::NotInitialized`] before initialization.
    pub fn last_snapshot_seq(&self) -> Result<i64, StreamError> {
        Ok(self.live()?.last_snapshot_seq)
    }

    fn live(&self) -> Result<&LiveStream<A>, StreamError> {
        self.live.as_ref().ok_or(StreamError::NotInitialized)
    }

    /// Load or create the stream `id` and bind this engine to it.
    ///
    /// Loads the latest snapshot and replays every event after it. A stream
    /// with neither snapshot nor events is created by appending the
    /// `StreamInitialized` event. Whenever events were replayed the snapshot
    /// is rewritten, regardless of the snapshot policy. Projections run once
    /// at the end.
    ///
    /// Calling it again with the same id is a no-op.
    ///
    /// # Errors
    ///
    /// - [`StreamError::Configuration`] if no event applicator is registered,
    ///   or the engine is already bound to a different id.
    /// - [`StreamError::UnsupportedEvent`] if the log holds an undeclared tag.
    /// - [`StreamError::StoreIo`] / [`StreamError::Serialization`] on store
    ///   or decoding failures.
    pub async fn initialize(&mut self, id: &str) -> Result<(), StreamError> {
        if let Some(live) = &self.live {
            if live.id == id {
                tracing::debug!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    stream_id = %id,
                    "stream already initialized"
                );
                return Ok(());
            }
            return Err(StreamError::Configuration(format!(
                "engine is bound to stream '{}', cannot initialize '{id}'",
                live.id
            )));
        }

        let span = tracing::info_span!(
            "initialize",
            aggregate_type = A::AGGREGATE_TYPE,
            stream_id = %id
        );
        async {
            let (live, cycle) = load(&self.registry, id).await?;
            route(&self.registry, &live.state, &cycle).await;
            self.live = Some(live);
            Ok::<(), StreamError>(())
        }
        .instrument(span)
        .await
    }

    /// Reload from the stores, discarding in-memory state.
    ///
    /// Returns whether the snapshot was rewritten, which happens when events
    /// newer than the stored snapshot were replayed.
    ///
    /// # Errors
    ///
    /// Same as [`initialize`](Self::initialize), plus
    /// [`StreamError::NotInitialized`].
    pub async fn read_all(&mut self) -> Result<bool, StreamError> {
        let previous = self.live.as_ref().ok_or(StreamError::NotInitialized)?;
        let id = previous.id.clone();
        let previous_snapshot_at = previous.last_snapshot_at;

        let span = tracing::info_span!(
            "read_all",
            aggregate_type = A::AGGREGATE_TYPE,
            stream_id = %id
        );
        async {
            let (mut live, cycle) = load(&self.registry, &id).await?;
            if !cycle.snapshot_written {
                live.last_snapshot_at = previous_snapshot_at;
            }
            route(&self.registry, &live.state, &cycle).await;
            self.live = Some(live);
            Ok::<bool, StreamError>(cycle.snapshot_written)
        }
        .instrument(span)
        .await
    }

    /// A deep copy of the current state.
    ///
    /// # Errors
    ///
    /// [`StreamError::NotInitialized`] before initialization.
    pub fn copy_state(&self) -> Result<A, StreamError> {
        Ok(self.live()?.state.clone())
    }

    /// Append `deltas` to the stream and fold them into the state.
    ///
    /// With `require_current`, the write is refused (returning `Ok(false)`)
    /// unless this engine's seq equals the log's max seq. Without it, any
    /// events appended by other writers are folded in first so the new seqs
    /// continue the log.
    ///
    /// The batch is appended atomically; state, seq, and snapshots change
    /// only after the append succeeds. A failed snapshot write after a
    /// successful append is logged and does not fail the call.
    ///
    /// # Errors
    ///
    /// - [`StreamError::NotInitialized`] before initialization.
    /// - [`StreamError::ConcurrencyConflict`] if another writer appended one
    ///   of the assigned seqs first. Nothing from this batch is stored and
    ///   the engine's state is unchanged.
    /// - [`StreamError::UnsupportedEvent`] if a delta has no transition.
    /// - [`StreamError::StoreIo`] / [`StreamError::Serialization`] on store
    ///   or encoding failures.
    pub async fn write_events(
        &mut self,
        deltas: Vec<EventEnvelope<A::DomainEvent>>,
        require_current: bool,
    ) -> Result<bool, StreamError> {
        let Self { registry, live } = self;
        let registry: &StreamRegistry<A> = registry;
        let live = live.as_mut().ok_or(StreamError::NotInitialized)?;
        let applicator = applicator(registry)?;

        let span = tracing::info_span!(
            "write_events",
            aggregate_type = A::AGGREGATE_TYPE,
            stream_id = %live.id,
            count = deltas.len()
        );
        async move {
            let max_seq = registry.event_log.max_seq(&live.id).await?;
            if require_current && live.seq != max_seq {
                tracing::info!(seq = live.seq, max_seq, "stale state; write refused");
                return Ok(false);
            }
            if deltas.is_empty() {
                return Ok(true);
            }

            if live.seq < max_seq {
                let missed = registry.event_log.read_after(&live.id, live.seq).await?;
                let (state, seq, _) = fold(applicator, live.state.clone(), live.seq, &missed)?;
                tracing::debug!(from = live.seq, to = seq, "caught up before write");
                live.state = state;
                live.seq = seq;
            }

            let mut staged = Vec::with_capacity(deltas.len());
            let mut records = Vec::with_capacity(deltas.len());
            for (offset, mut envelope) in (1i64..).zip(deltas) {
                let event_type = envelope.event.event_type();
                if !applicator.supports(event_type) {
                    return Err(StreamError::UnsupportedEvent {
                        event_type: event_type.to_owned(),
                    });
                }
                if envelope.seq != UNASSIGNED_SEQ {
                    tracing::debug!(
                        supplied = envelope.seq,
                        "ignoring caller-assigned seq"
                    );
                }
                envelope.id = live.id.clone();
                envelope.seq = live.seq + offset;
                records.push(encode_event(&live.id, &envelope)?);
                staged.push(envelope);
            }

            if let Err(e) = registry.event_log.append_batch(records).await {
                if let StoreError::Conflict { seq, .. } = &e {
                    tracing::warn!(seq, "lost append race to another writer");
                }
                return Err(e.into());
            }

            // Fold the whole batch and commit it before the first snapshot
            // await. A write dropped after this point leaves state and seq
            // in step, possibly with snapshots missing.
            let policy = registry.policies.snapshot_policy;
            let mut cycle = Cycle::default();
            let mut state = live.state.clone();
            let mut seq = live.seq;
            let mut due_seq = live.last_snapshot_seq;
            let mut due_at = live.last_snapshot_at;
            let mut pending = Vec::new();
            for envelope in &staged {
                state = applicator.apply(state, &envelope.event)?;
                seq = envelope.seq;
                cycle.applied.insert(envelope.event.event_type());

                if snapshot_due(policy, seq, due_seq, due_at) {
                    pending.push((seq, state.clone()));
                    due_seq = seq;
                    due_at = Instant::now();
                }
            }
            live.state = state;
            live.seq = seq;
            if policy == SnapshotPolicy::AfterAllEvents {
                pending.push((live.seq, live.state.clone()));
            }

            for (seq, state) in &pending {
                if try_snapshot(registry, &live.id, *seq, state).await {
                    live.last_snapshot_seq = *seq;
                    live.last_snapshot_at = Instant::now();
                    cycle.snapshot_written = true;
                }
            }

            tracing::info!(count = staged.len(), seq = live.seq, "events appended");
            route(registry, &live.state, &cycle).await;
            Ok::<bool, StreamError>(true)
        }
        .instrument(span)
        .await
    }

    /// Persist the current state as the stream's snapshot.
    ///
    /// Resets the snapshot interval counters and runs snapshot projections.
    ///
    /// # Errors
    ///
    /// - [`StreamError::NotInitialized`] before initialization.
    /// - [`StreamError::StoreIo`] / [`StreamError::Serialization`] if the
    ///   snapshot cannot be stored.
    pub async fn write_snapshot(&mut self) -> Result<(), StreamError> {
        let Self { registry, live } = self;
        let registry: &StreamRegistry<A> = registry;
        let live = live.as_mut().ok_or(StreamError::NotInitialized)?;

        store_snapshot(registry, &live.id, live.seq, &live.state).await?;
        live.last_snapshot_seq = live.seq;
        live.last_snapshot_at = Instant::now();

        let cycle = Cycle {
            applied: BTreeSet::new(),
            snapshot_written: true,
        };
        route(registry, &live.state, &cycle).await;
        Ok(())
    }
}

fn applicator<A: Aggregate>(
    registry: &StreamRegistry<A>,
) -> Result<&EventApplicator<A>, StreamError> {
    registry.applicator.as_ref().ok_or_else(|| {
        StreamError::Configuration(format!(
            "no event applicator registered for {}",
            A::AGGREGATE_TYPE
        ))
    })
}

/// Fold stored records into `state`, returning the new state, seq, and the
/// tags applied.
fn fold<A: Aggregate>(
    applicator: &EventApplicator<A>,
    mut state: A,
    mut seq: i64,
    records: &[EventRecord],
) -> Result<(A, i64, BTreeSet<&'static str>), StreamError> {
    let mut applied = BTreeSet::new();
    for record in records {
        let envelope = decode_event::<A::DomainEvent>(record)?;
        state = applicator.apply(state, &envelope.event)?;
        seq = record.seq;
        applied.insert(envelope.event.event_type());
    }
    Ok((state, seq, applied))
}

/// Snapshot plus replay. Creates the stream if it does not exist yet.
async fn load<A: Aggregate>(
    registry: &StreamRegistry<A>,
    id: &str,
) -> Result<(LiveStream<A>, Cycle), StreamError> {
    let applicator = applicator(registry)?;

    // Without a snapshot, replay starts before seq 0 from the default state.
    let (state, snapshot_seq) = match registry.snapshots.read(id).await? {
        Some(snapshot) => (serde_json::from_value::<A>(snapshot.state)?, snapshot.seq),
        None => (A::new(id), UNASSIGNED_SEQ),
    };

    let mut records = registry.event_log.read_after(id, snapshot_seq).await?;
    if snapshot_seq == UNASSIGNED_SEQ && records.is_empty() {
        records = create_stream(registry, id).await?;
    }

    let (state, seq, applied) = fold(applicator, state, snapshot_seq, &records)?;
    let mut live = LiveStream {
        id: id.to_owned(),
        seq,
        state,
        last_snapshot_seq: snapshot_seq,
        last_snapshot_at: Instant::now(),
    };

    let mut cycle = Cycle {
        applied,
        snapshot_written: false,
    };
    if !records.is_empty() {
        store_snapshot(registry, id, live.seq, &live.state).await?;
        live.last_snapshot_seq = live.seq;
        cycle.snapshot_written = true;
    }
    tracing::debug!(
        seq = live.seq,
        replayed = records.len(),
        snapshot_seq,
        "stream loaded"
    );
    Ok((live, cycle))
}

/// Append `StreamInitialized` at seq 0 and return the log's records.
///
/// If another engine created the stream first, its records are returned.
async fn create_stream<A: Aggregate>(
    registry: &StreamRegistry<A>,
    id: &str,
) -> Result<Vec<EventRecord>, StreamError> {
    let mut envelope = EventEnvelope::new(<A::DomainEvent as DomainEvent>::stream_initialized());
    envelope.id = id.to_owned();
    envelope.seq = 0;
    let record = encode_event(id, &envelope)?;

    match registry.event_log.append(record.clone()).await {
        Ok(()) => {
            tracing::info!("stream created");
            Ok(vec![record])
        }
        Err(StoreError::Conflict { .. }) => {
            tracing::debug!("stream created concurrently; replaying");
            Ok(registry.event_log.read_after(id, UNASSIGNED_SEQ).await?)
        }
        Err(e) => Err(e.into()),
    }
}

fn snapshot_due(
    policy: SnapshotPolicy,
    seq: i64,
    last_snapshot_seq: i64,
    last_snapshot_at: Instant,
) -> bool {
    match policy {
        SnapshotPolicy::AfterEachEvent => true,
        SnapshotPolicy::AfterIntervalDeltas(n) => {
            seq - last_snapshot_seq >= i64::try_from(n).unwrap_or(i64::MAX)
        }
        SnapshotPolicy::AfterIntervalSeconds(n) => {
            last_snapshot_at.elapsed() >= Duration::from_secs(n)
        }
        SnapshotPolicy::AfterAllEvents => false,
    }
}

async fn store_snapshot<A: Aggregate>(
    registry: &StreamRegistry<A>,
    id: &str,
    seq: i64,
    state: &A,
) -> Result<(), StreamError> {
    let record = SnapshotRecord {
        stream_id: id.to_owned(),
        seq,
        state: serde_json::to_value(state)?,
    };
    registry.snapshots.upsert(record).await?;
    tracing::debug!(seq, "snapshot written");
    Ok(())
}

/// Snapshot `state` at `seq` during a write. Events are already durable at
/// this point, so a failure is logged rather than returned.
async fn try_snapshot<A: Aggregate>(
    registry: &StreamRegistry<A>,
    id: &str,
    seq: i64,
    state: &A,
) -> bool {
    match store_snapshot(registry, id, seq, state).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(seq, error = %e, "snapshot write failed");
            false
        }
    }
}

async fn route<A: Aggregate>(registry: &StreamRegistry<A>, state: &A, cycle: &Cycle) {
    let report = registry
        .projections
        .route(state, &cycle.applied, cycle.snapshot_written)
        .await;
    if report.invoked > 0 {
        tracing::debug!(
            invoked = report.invoked,
            failed = report.failed,
            "projections routed"
        );
    }
}
