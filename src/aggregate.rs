//! Aggregate trait: the state type an event stream folds into.

use serde::{Serialize, de::DeserializeOwned};

use crate::event::DomainEvent;

/// A domain aggregate whose state is derived from its event stream.
///
/// The implementing type itself serves as the aggregate's state. Engines
/// only ever hand out clones of it, so `Clone` must produce a deep copy.
///
/// # Associated Items
///
/// - `AGGREGATE_TYPE`: name used in log fields and error messages.
/// - `DomainEvent`: the closed set of events that can be applied.
pub trait Aggregate: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. `"customer"`).
    const AGGREGATE_TYPE: &'static str;

    /// The set of events this aggregate records.
    type DomainEvent: DomainEvent;

    /// The default-constructed state for a new stream with the given id.
    fn new(id: &str) -> Self;

    /// The aggregate id stored in the state.
    fn id(&self) -> &str;
}
