//! Event applicator: the per-aggregate table of state transitions.
//!
//! Built once through [`EventApplicatorBuilder`], which checks the handler
//! set against the aggregate's declared event types so an incomplete table
//! is rejected at startup instead of on the first unlucky event.

use std::collections::HashMap;
use std::fmt;

use crate::aggregate::Aggregate;
use crate::error::StreamError;
use crate::event::{DomainEvent, STREAM_INITIALIZED};

/// A pure state transition: takes the current state by value and returns
/// the next one.
pub type TransitionFn<A> = fn(A, &<A as Aggregate>::DomainEvent) -> A;

/// Identity transition used for tags registered through
/// [`EventApplicatorBuilder::ignore`].
fn unchanged<A: Aggregate>(state: A, _event: &A::DomainEvent) -> A {
    state
}

/// Maps every declared event type of `A` to its transition.
pub struct EventApplicator<A: Aggregate> {
    transitions: HashMap<&'static str, TransitionFn<A>>,
}

impl<A: Aggregate> fmt::Debug for EventApplicator<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<_> = self.transitions.keys().collect();
        tags.sort();
        f.debug_struct("EventApplicator")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("event_types", &tags)
            .finish()
    }
}

impl<A: Aggregate> EventApplicator<A> {
    /// Start an empty handler set.
    pub fn builder() -> EventApplicatorBuilder<A> {
        EventApplicatorBuilder {
            transitions: Vec::new(),
        }
    }

    /// Fold one event into `state`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::UnsupportedEvent`] if no transition is
    /// registered for the event's tag.
    pub fn apply(&self, state: A, event: &A::DomainEvent) -> Result<A, StreamError> {
        let event_type = event.event_type();
        let transition =
            self.transitions
                .get(event_type)
                .ok_or_else(|| StreamError::UnsupportedEvent {
                    event_type: event_type.to_owned(),
                })?;
        Ok(transition(state, event))
    }

    /// Whether a transition exists for `event_type`.
    pub fn supports(&self, event_type: &str) -> bool {
        self.transitions.contains_key(event_type)
    }
}

/// Collects `(tag, transition)` pairs for an [`EventApplicator`].
///
/// # Examples
///
/// ```
/// # use eventstream::{Aggregate, DomainEvent, EventApplicator, STREAM_INITIALIZED};
/// # use serde::{Deserialize, Serialize};
/// #[derive(Clone, Serialize, Deserialize)]
/// struct Tally { id: String, total: i64 }
///
/// #[derive(Clone, Serialize, Deserialize)]
/// #[serde(tag = "type", content = "data")]
/// enum TallyEvent { StreamInitialized, Added { n: i64 } }
///
/// impl DomainEvent for TallyEvent {
///     const EVENT_TYPES: &'static [&'static str] = &[STREAM_INITIALIZED, "Added"];
///     fn event_type(&self) -> &'static str {
///         match self {
///             TallyEvent::StreamInitialized => STREAM_INITIALIZED,
///             TallyEvent::Added { .. } => "Added",
///         }
///     }
///     fn stream_initialized() -> Self { TallyEvent::StreamInitialized }
/// }
///
/// impl Aggregate for Tally {
///     const AGGREGATE_TYPE: &'static str = "tally";
///     type DomainEvent = TallyEvent;
///     fn new(id: &str) -> Self { Tally { id: id.into(), total: 0 } }
///     fn id(&self) -> &str { &self.id }
/// }
///
/// fn added(mut t: Tally, e: &TallyEvent) -> Tally {
///     if let TallyEvent::Added { n } = e { t.total += n; }
///     t
/// }
///
/// let applicator = EventApplicator::<Tally>::builder()
///     .ignore(STREAM_INITIALIZED)
///     .on("Added", added)
///     .build()
///     .unwrap();
/// assert!(applicator.supports("Added"));
/// ```
pub struct EventApplicatorBuilder<A: Aggregate> {
    transitions: Vec<(String, TransitionFn<A>)>,
}

impl<A: Aggregate> EventApplicatorBuilder<A> {
    /// Register the transition for `event_type`.
    pub fn on(mut self, event_type: impl Into<String>, transition: TransitionFn<A>) -> Self {
        self.transitions.push((event_type.into(), transition));
        self
    }

    /// Register `event_type` as a no-op transition.
    pub fn ignore(self, event_type: impl Into<String>) -> Self {
        self.on(event_type, unchanged::<A>)
    }

    /// Validate the handler set and build the applicator.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::InvalidHandler`] if:
    /// - the declared event set or the handler set lacks [`STREAM_INITIALIZED`],
    /// - a tag is not declared by `A::DomainEvent`,
    /// - a tag is registered twice,
    /// - any declared tag has no transition.
    pub fn build(self) -> Result<EventApplicator<A>, StreamError> {
        let declared = <A::DomainEvent as DomainEvent>::EVENT_TYPES;
        let seed = <A::DomainEvent as DomainEvent>::stream_initialized();
        if !declared.contains(&STREAM_INITIALIZED) || seed.event_type() != STREAM_INITIALIZED {
            return Err(StreamError::InvalidHandler(format!(
                "{} does not declare a {STREAM_INITIALIZED} event",
                A::AGGREGATE_TYPE
            )));
        }

        let mut transitions = HashMap::with_capacity(self.transitions.len());
        for (tag, transition) in self.transitions {
            let Some(&declared_tag) = declared.iter().find(|d| **d == tag) else {
                return Err(StreamError::InvalidHandler(format!(
                    "{} does not declare event type '{tag}'",
                    A::AGGREGATE_TYPE
                )));
            };
            if transitions.insert(declared_tag, transition).is_some() {
                return Err(StreamError::InvalidHandler(format!(
                    "event type '{tag}' registered twice for {}",
                    A::AGGREGATE_TYPE
                )));
            }
        }

        let missing: Vec<&str> = declared
            .iter()
            .copied()
            .filter(|d| !transitions.contains_key(d))
            .collect();
        if !missing.is_empty() {
            return Err(StreamError::InvalidHandler(format!(
                "{} has no transition for: {}",
                A::AGGREGATE_TYPE,
                missing.join(", ")
            )));
        }

        Ok(EventApplicator { transitions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Customer, CustomerEvent, customer_applicator};

    fn keep(state: Customer, _: &CustomerEvent) -> Customer {
        state
    }

    /// Every declared tag except `skip` mapped to `keep`.
    fn all_but(skip: &str) -> EventApplicatorBuilder<Customer> {
        CustomerEvent::EVENT_TYPES
            .iter()
            .filter(|t| **t != skip)
            .fold(EventApplicator::builder(), |b, t| b.on(*t, keep))
    }

    #[test]
    fn complete_set_builds() {
        let applicator = customer_applicator();
        for tag in CustomerEvent::EVENT_TYPES {
            assert!(applicator.supports(tag), "missing {tag}");
        }
    }

    #[test]
    fn apply_folds_in_order() {
        let applicator = customer_applicator();
        let events = [
            CustomerEvent::StreamInitialized,
            CustomerEvent::AccountAdded {
                account_number: "ACC-1".into(),
            },
            CustomerEvent::TransactionPosted {
                account_number: "ACC-1".into(),
                amount: 500,
            },
        ];

        let state = events
            .iter()
            .try_fold(Customer::new("c1"), |s, e| applicator.apply(s, e))
            .expect("apply should succeed");

        assert_eq!(state.id, "c1");
        assert_eq!(state.accounts.len(), 1);
        assert_eq!(state.accounts[0].balance, 500);
    }

    #[test]
    fn stream_initialized_ignore_is_a_no_op() {
        let applicator = customer_applicator();
        let before = Customer::new("c1");
        let after = applicator
            .apply(before.clone(), &CustomerEvent::StreamInitialized)
            .expect("apply should succeed");
        assert_eq!(before, after);
    }

    #[test]
    fn missing_stream_initialized_is_rejected() {
        let result = all_but(STREAM_INITIALIZED).build();
        assert!(
            matches!(result, Err(StreamError::InvalidHandler(ref msg)) if msg.contains(STREAM_INITIALIZED)),
            "expected InvalidHandler, got: {result:?}"
        );
    }

    #[test]
    fn missing_declared_tag_is_rejected() {
        let result = all_but("SpouseRemoved").build();
        assert!(
            matches!(result, Err(StreamError::InvalidHandler(ref msg)) if msg.contains("SpouseRemoved"))
        );
    }

    #[test]
    fn undeclared_tag_is_rejected() {
        let result = all_but("").on("AccountFrozen", keep).build();
        assert!(
            matches!(result, Err(StreamError::InvalidHandler(ref msg)) if msg.contains("AccountFrozen"))
        );
    }

    #[test]
    fn duplicate_tag_is_rejected() {
        let result = all_but("").on("AccountAdded", keep).build();
        assert!(
            matches!(result, Err(StreamError::InvalidHandler(ref msg)) if msg.contains("twice"))
        );
    }

    #[test]
    fn unregistered_tag_fails_at_apply() {
        // Tables are only reachable through `build`, so construct a partial
        // one directly to exercise the apply-time guard.
        let applicator = EventApplicator::<Customer> {
            transitions: HashMap::from([(STREAM_INITIALIZED, keep as TransitionFn<Customer>)]),
        };

        let result = applicator.apply(Customer::new("c1"), &CustomerEvent::SpouseRemoved);
        assert!(
            matches!(result, Err(StreamError::UnsupportedEvent { ref event_type }) if event_type == "SpouseRemoved")
        );
    }
}
