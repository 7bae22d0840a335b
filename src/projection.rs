//! Projection routing: side effects triggered after a stream changes.
//!
//! Projections are derived, eventually consistent views. The router maps
//! event type tags and the "snapshot written" flag to callbacks, runs the
//! matched callbacks concurrently once per cycle, and isolates their
//! failures from the write that triggered them.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::aggregate::Aggregate;
use crate::error::StreamError;
use crate::event::DomainEvent;

/// Error type projection callbacks may return.
pub type ProjectionError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future produced by a projection callback.
pub type ProjectionFuture = Pin<Box<dyn Future<Output = Result<(), ProjectionError>> + Send>>;

type Callback<A> = Arc<dyn Fn(A) -> ProjectionFuture + Send + Sync>;

/// What causes a projection callback to run.
///
/// # Examples
///
/// ```
/// use eventstream::Triggers;
///
/// let marital = Triggers::events(["SpouseChanged", "SpouseRemoved"]);
/// let residency = Triggers::snapshot();
/// let both = Triggers::events(["AccountAdded"]).and_snapshot();
/// # let _ = (marital, residency, both);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Triggers {
    events: Vec<String>,
    snapshot: bool,
}

impl Triggers {
    /// Run when any of the given event types was applied.
    pub fn events<I, S>(event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            events: event_types.into_iter().map(Into::into).collect(),
            snapshot: false,
        }
    }

    /// Run whenever a snapshot was written.
    pub fn snapshot() -> Self {
        Self {
            events: Vec::new(),
            snapshot: true,
        }
    }

    /// Also run when a snapshot was written.
    pub fn and_snapshot(mut self) -> Self {
        self.snapshot = true;
        self
    }

    /// Also run when `event_type` was applied.
    pub fn and_event(mut self, event_type: impl Into<String>) -> Self {
        self.events.push(event_type.into());
        self
    }
}

/// Outcome of one routing cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionReport {
    /// Callbacks started this cycle.
    pub invoked: usize,
    /// Callbacks that returned an error or panicked.
    pub failed: usize,
}

struct Registration<A> {
    name: String,
    callback: Callback<A>,
}

/// Event-type and snapshot registries for one aggregate type.
pub struct ProjectionRouter<A: Aggregate> {
    registrations: Vec<Registration<A>>,
    by_event: HashMap<&'static str, Vec<usize>>,
    on_snapshot: Vec<usize>,
}

impl<A: Aggregate> Default for ProjectionRouter<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate> fmt::Debug for ProjectionRouter<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.registrations.iter().map(|r| r.name.as_str()).collect();
        f.debug_struct("ProjectionRouter")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("projections", &names)
            .finish()
    }
}

impl<A: Aggregate> ProjectionRouter<A> {
    /// A router with no projections; routing through it is a no-op.
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            by_event: HashMap::new(),
            on_snapshot: Vec::new(),
        }
    }

    /// Register a named projection callback.
    ///
    /// The callback receives its own copy of the post-update state each
    /// time it runs.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Configuration`] if the trigger set is empty,
    /// names an event type `A` does not declare, or repeats an event type,
    /// or if `name` is already registered.
    pub fn register<F, Fut>(
        mut self,
        name: impl Into<String>,
        triggers: Triggers,
        callback: F,
    ) -> Result<Self, StreamError>
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProjectionError>> + Send + 'static,
    {
        let name = name.into();
        if triggers.events.is_empty() && !triggers.snapshot {
            return Err(StreamError::Configuration(format!(
                "projection '{name}' has no triggers"
            )));
        }
        if self.registrations.iter().any(|r| r.name == name) {
            return Err(StreamError::Configuration(format!(
                "projection '{name}' is already registered"
            )));
        }

        let declared = <A::DomainEvent as DomainEvent>::EVENT_TYPES;
        let mut tags: Vec<&'static str> = Vec::with_capacity(triggers.events.len());
        for event_type in &triggers.events {
            let Some(&tag) = declared.iter().find(|d| **d == event_type.as_str()) else {
                return Err(StreamError::Configuration(format!(
                    "projection '{name}' listens for undeclared event type '{event_type}'"
                )));
            };
            if tags.contains(&tag) {
                return Err(StreamError::Configuration(format!(
                    "projection '{name}' lists event type '{tag}' twice"
                )));
            }
            tags.push(tag);
        }

        let index = self.registrations.len();
        for tag in tags {
            self.by_event.entry(tag).or_default().push(index);
        }
        if triggers.snapshot {
            self.on_snapshot.push(index);
        }
        self.registrations.push(Registration {
            name,
            callback: Arc::new(move |state: A| Box::pin(callback(state)) as ProjectionFuture),
        });
        Ok(self)
    }

    /// Whether no projections are registered.
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Run every callback matched by `event_types` or `snapshot_written`.
    ///
    /// Each matched callback runs once, on its own task with its own copy
    /// of `state`. All of them are awaited before returning. Failures and
    /// panics are logged and counted, never propagated.
    pub async fn route(
        &self,
        state: &A,
        event_types: &BTreeSet<&'static str>,
        snapshot_written: bool,
    ) -> ProjectionReport {
        let mut matched = BTreeSet::new();
        for tag in event_types {
            if let Some(indices) = self.by_event.get(tag) {
                matched.extend(indices.iter().copied());
            }
        }
        if snapshot_written {
            matched.extend(self.on_snapshot.iter().copied());
        }
        if matched.is_empty() {
            return ProjectionReport::default();
        }

        let mut tasks = JoinSet::new();
        for index in &matched {
            let registration = &self.registrations[*index];
            let name = registration.name.clone();
            let future = (registration.callback)(state.clone());
            tasks.spawn(async move { (name, future.await) });
        }

        let mut report = ProjectionReport {
            invoked: matched.len(),
            failed: 0,
        };
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((name, Err(e))) => {
                    report.failed += 1;
                    tracing::warn!(
                        aggregate_type = A::AGGREGATE_TYPE,
                        projection = %name,
                        error = %e,
                        "projection callback failed"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        aggregate_type = A::AGGREGATE_TYPE,
                        error = %e,
                        "projection callback panicked"
                    );
                }
            }
        }
        report
    }
}
