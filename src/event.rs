//! Domain event types and the codec between typed events and stored records.
//!
//! Event enums use adjacently tagged serde (`#[serde(tag = "type", content = "data")]`).
//! A stored [`EventRecord`] keeps the `"type"` tag and the `"data"` payload
//! in separate fields so stores can index on the tag without understanding
//! the payload.

use chrono::{DateTime, Utc};
use serde::ser::Error as _;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::error::StreamError;

/// Tag of the implicit event at `seq = 0` of every stream.
pub const STREAM_INITIALIZED: &str = "StreamInitialized";

/// Sequence number of an envelope that has not been stored yet.
pub const UNASSIGNED_SEQ: i64 = -1;

/// The closed set of events an aggregate can record.
///
/// # Contract
///
/// - [`EVENT_TYPES`](DomainEvent::EVENT_TYPES) lists every tag the enum can
///   produce and must include [`STREAM_INITIALIZED`].
/// - [`event_type`](DomainEvent::event_type) returns the same tag serde
///   writes into the `"type"` field.
/// - [`stream_initialized`](DomainEvent::stream_initialized) builds the
///   variant tagged [`STREAM_INITIALIZED`].
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Every type tag this event enum declares.
    const EVENT_TYPES: &'static [&'static str];

    /// Type tag of this value.
    fn event_type(&self) -> &'static str;

    /// The event written at `seq = 0` when a stream is created.
    fn stream_initialized() -> Self;
}

/// A domain event together with its stream identity, version, and time.
///
/// `id` and `seq` are assigned by the engine when the event is written;
/// values supplied by the caller are overwritten.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope<E> {
    /// Stream the event belongs to.
    pub id: String,
    /// Position in the stream, or [`UNASSIGNED_SEQ`] before storage.
    pub seq: i64,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// The domain event itself.
    pub event: E,
}

impl<E> EventEnvelope<E> {
    /// Wrap an event stamped with the current time.
    pub fn new(event: E) -> Self {
        Self::at(event, Utc::now())
    }

    /// Wrap an event with an explicit timestamp.
    pub fn at(event: E, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: String::new(),
            seq: UNASSIGNED_SEQ,
            timestamp,
            event,
        }
    }
}

impl<E> From<E> for EventEnvelope<E> {
    fn from(event: E) -> Self {
        Self::new(event)
    }
}

/// A persisted event as seen by an [`EventLog`](crate::EventLog).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Stream (aggregate id) the record belongs to.
    pub stream_id: String,
    /// Contiguous version within the stream, starting at 0.
    pub seq: i64,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Type tag extracted from the adjacently tagged event.
    pub event_type: String,
    /// Unique id of this record, usable for downstream deduplication.
    pub event_id: Uuid,
    /// The `"data"` portion of the event, `null` for unit variants.
    pub payload: serde_json::Value,
}

/// Encode an envelope whose `seq` has been assigned into a stored record.
///
/// # Errors
///
/// Returns [`StreamError::Serialization`] if the event does not serialize
/// to an adjacently tagged object or if its serde tag disagrees with
/// [`DomainEvent::event_type`].
pub fn encode_event<E: DomainEvent>(
    stream_id: &str,
    envelope: &EventEnvelope<E>,
) -> Result<EventRecord, StreamError> {
    let event_type = envelope.event.event_type();
    let serde_json::Value::Object(mut obj) = serde_json::to_value(&envelope.event)? else {
        return Err(serde_json::Error::custom(format!(
            "event '{event_type}' must serialize to an adjacently tagged object"
        ))
        .into());
    };

    match obj.get("type").and_then(|t| t.as_str()) {
        Some(tag) if tag == event_type => {}
        other => {
            return Err(serde_json::Error::custom(format!(
                "serialized tag {other:?} does not match event_type() '{event_type}'"
            ))
            .into());
        }
    }

    // Unit variants carry no "data" field.
    let payload = obj.remove("data").unwrap_or(serde_json::Value::Null);

    Ok(EventRecord {
        stream_id: stream_id.to_owned(),
        seq: envelope.seq,
        timestamp: envelope.timestamp,
        event_type: event_type.to_owned(),
        event_id: Uuid::new_v4(),
        payload,
    })
}

/// Decode a stored record back into a typed envelope.
///
/// # Errors
///
/// - [`StreamError::UnsupportedEvent`] if the record's tag is not declared
///   by `E`.
/// - [`StreamError::Serialization`] if the payload does not match the
///   variant's shape.
pub fn decode_event<E: DomainEvent>(record: &EventRecord) -> Result<EventEnvelope<E>, StreamError> {
    if !E::EVENT_TYPES.contains(&record.event_type.as_str()) {
        return Err(StreamError::UnsupportedEvent {
            event_type: record.event_type.clone(),
        });
    }

    let tagged = if record.payload.is_null() {
        serde_json::json!({ "type": record.event_type })
    } else {
        serde_json::json!({
            "type": record.event_type,
            "data": record.payload,
        })
    };
    let event = serde_json::from_value::<E>(tagged)?;

    Ok(EventEnvelope {
        id: record.stream_id.clone(),
        seq: record.seq,
        timestamp: record.timestamp,
        event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::CustomerEvent;

    fn stamped(event: CustomerEvent, seq: i64) -> EventEnvelope<CustomerEvent> {
        let mut envelope = EventEnvelope::new(event);
        envelope.seq = seq;
        envelope
    }

    #[test]
    fn new_envelope_is_unassigned() {
        let envelope = EventEnvelope::new(CustomerEvent::SpouseRemoved);
        assert_eq!(envelope.seq, UNASSIGNED_SEQ);
        assert!(envelope.id.is_empty());
    }

    #[test]
    fn encode_splits_tag_and_data() {
        let envelope = stamped(
            CustomerEvent::AccountAdded {
                account_number: "ACC-1".into(),
            },
            3,
        );
        let record = encode_event("c1", &envelope).expect("encode should succeed");

        assert_eq!(record.stream_id, "c1");
        assert_eq!(record.seq, 3);
        assert_eq!(record.event_type, "AccountAdded");
        assert_eq!(record.payload, serde_json::json!({ "account_number": "ACC-1" }));
        assert_eq!(record.timestamp, envelope.timestamp);
    }

    #[test]
    fn unit_variant_encodes_null_payload() {
        let record = encode_event("c1", &stamped(CustomerEvent::stream_initialized(), 0))
            .expect("encode should succeed");
        assert_eq!(record.event_type, STREAM_INITIALIZED);
        assert!(record.payload.is_null());
    }

    #[test]
    fn decode_restores_variant_and_position() {
        let record = encode_event(
            "c1",
            &stamped(
                CustomerEvent::TransactionPosted {
                    account_number: "ACC-1".into(),
                    amount: -250,
                },
                7,
            ),
        )
        .expect("encode should succeed");

        let envelope: EventEnvelope<CustomerEvent> =
            decode_event(&record).expect("decode should succeed");

        assert_eq!(envelope.id, "c1");
        assert_eq!(envelope.seq, 7);
        assert_eq!(
            envelope.event,
            CustomerEvent::TransactionPosted {
                account_number: "ACC-1".into(),
                amount: -250,
            }
        );
    }

    #[test]
    fn decode_unknown_tag_is_unsupported() {
        let record = EventRecord {
            stream_id: "c1".into(),
            seq: 1,
            timestamp: Utc::now(),
            event_type: "AccountFrozen".into(),
            event_id: Uuid::new_v4(),
            payload: serde_json::Value::Null,
        };

        let result = decode_event::<CustomerEvent>(&record);
        assert!(
            matches!(result, Err(StreamError::UnsupportedEvent { ref event_type }) if event_type == "AccountFrozen"),
            "expected UnsupportedEvent, got: {result:?}"
        );
    }

    #[test]
    fn decode_mismatched_payload_is_serialization_error() {
        let record = EventRecord {
            stream_id: "c1".into(),
            seq: 1,
            timestamp: Utc::now(),
            event_type: "AccountAdded".into(),
            event_id: Uuid::new_v4(),
            payload: serde_json::json!({ "unexpected": true }),
        };

        let result = decode_event::<CustomerEvent>(&record);
        assert!(matches!(result, Err(StreamError::Serialization(_))));
    }

    #[test]
    fn every_record_gets_a_fresh_event_id() {
        let envelope = stamped(CustomerEvent::SpouseRemoved, 1);
        let a = encode_event("c1", &envelope).expect("encode should succeed");
        let b = encode_event("c1", &envelope).expect("encode should succeed");
        assert_ne!(a.event_id, b.event_id);
    }
}
