//! Event envelope decoding and validation
//!
//! Events arrive from the stream as JSON bytes:
//!
//! ```json
//! {"event_id":"e-1","entity_key":"order-1","sequence":1,
//!  "occurred_at":"2024-01-01T00:00:00Z","type":"item_added",
//!  "payload":{"sku":"A","quantity":2,"unit_price_cents":250}}
//! ```
//!
//! The set of event types is closed. An unknown `type` tag is a decode-time
//! validation failure, never a silently ignored event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dead_letter::DeadLetterReason;

/// Sequences start here for every entity key.
pub const FIRST_SEQUENCE: u64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed event: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("invalid payload for {event_type}: {source}")]
    InvalidPayload {
        event_type: String,
        source: serde_json::Error,
    },

    #[error("invalid event: {0}")]
    Invalid(String),
}

impl DecodeError {
    /// Dead-letter reason this failure is routed under
    pub fn reason(&self) -> DeadLetterReason {
        match self {
            DecodeError::Malformed(_) => DeadLetterReason::DecodeFailed,
            _ => DeadLetterReason::ValidationFailed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub customer_id: String,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAdded {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRemoved {
    pub sku: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPaid {
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderShipped {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OrderCancelled {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Known event types with their decoded payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    OrderPlaced(OrderPlaced),
    ItemAdded(ItemAdded),
    ItemRemoved(ItemRemoved),
    OrderPaid(OrderPaid),
    OrderShipped(OrderShipped),
    OrderCancelled(OrderCancelled),
}

impl EventKind {
    pub fn type_tag(&self) -> &'static str {
        match self {
            EventKind::OrderPlaced(_) => "order_placed",
            EventKind::ItemAdded(_) => "item_added",
            EventKind::ItemRemoved(_) => "item_removed",
            EventKind::OrderPaid(_) => "order_paid",
            EventKind::OrderShipped(_) => "order_shipped",
            EventKind::OrderCancelled(_) => "order_cancelled",
        }
    }

    fn from_parts(event_type: &str, payload: Value) -> Result<Self, DecodeError> {
        fn parse<T: serde::de::DeserializeOwned>(
            event_type: &str,
            payload: Value,
        ) -> Result<T, DecodeError> {
            serde_json::from_value(payload).map_err(|source| DecodeError::InvalidPayload {
                event_type: event_type.to_string(),
                source,
            })
        }

        // Payload-less events may omit the field entirely
        let payload = if payload.is_null() {
            Value::Object(Default::default())
        } else {
            payload
        };

        let kind = match event_type {
            "order_placed" => EventKind::OrderPlaced(parse(event_type, payload)?),
            "item_added" => EventKind::ItemAdded(parse(event_type, payload)?),
            "item_removed" => EventKind::ItemRemoved(parse(event_type, payload)?),
            "order_paid" => EventKind::OrderPaid(parse(event_type, payload)?),
            "order_shipped" => EventKind::OrderShipped(parse(event_type, payload)?),
            "order_cancelled" => EventKind::OrderCancelled(parse(event_type, payload)?),
            other => return Err(DecodeError::UnknownEventType(other.to_string())),
        };

        Ok(kind)
    }

    fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            EventKind::OrderPlaced(p) => serde_json::to_value(p),
            EventKind::ItemAdded(p) => serde_json::to_value(p),
            EventKind::ItemRemoved(p) => serde_json::to_value(p),
            EventKind::OrderPaid(p) => serde_json::to_value(p),
            EventKind::OrderShipped(p) => serde_json::to_value(p),
            EventKind::OrderCancelled(p) => serde_json::to_value(p),
        }
    }

    fn validate(&self) -> Result<(), DecodeError> {
        match self {
            EventKind::OrderPlaced(p) => {
                if p.customer_id.trim().is_empty() {
                    return Err(DecodeError::Invalid("customer_id is empty".to_string()));
                }
                let currency_ok =
                    p.currency.len() == 3 && p.currency.chars().all(|c| c.is_ascii_uppercase());
                if !currency_ok {
                    return Err(DecodeError::Invalid(format!(
                        "currency must be a 3-letter code, got {:?}",
                        p.currency
                    )));
                }
            }
            EventKind::ItemAdded(p) => {
                if p.sku.trim().is_empty() {
                    return Err(DecodeError::Invalid("sku is empty".to_string()));
                }
                if p.quantity == 0 {
                    return Err(DecodeError::Invalid("quantity must be positive".to_string()));
                }
                if p.unit_price_cents < 0 {
                    return Err(DecodeError::Invalid(
                        "unit_price_cents must not be negative".to_string(),
                    ));
                }
            }
            EventKind::ItemRemoved(p) => {
                if p.sku.trim().is_empty() {
                    return Err(DecodeError::Invalid("sku is empty".to_string()));
                }
                if p.quantity == 0 {
                    return Err(DecodeError::Invalid("quantity must be positive".to_string()));
                }
            }
            EventKind::OrderPaid(p) => {
                if p.amount_cents < 0 {
                    return Err(DecodeError::Invalid(
                        "amount_cents must not be negative".to_string(),
                    ));
                }
            }
            EventKind::OrderShipped(_) | EventKind::OrderCancelled(_) => {}
        }
        Ok(())
    }
}

/// Wire shape of an envelope, before the payload is bound to a known type
#[derive(Debug, Serialize, Deserialize)]
struct RawEnvelope {
    event_id: String,
    entity_key: String,
    sequence: i64,
    occurred_at: DateTime<Utc>,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: Value,
}

/// A decoded, validated event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    pub event_id: String,
    pub entity_key: String,
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
    pub kind: EventKind,
}

impl EventEnvelope {
    /// Decode and validate raw stream bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let raw: RawEnvelope = serde_json::from_slice(bytes)?;

        if raw.event_id.trim().is_empty() {
            return Err(DecodeError::Invalid("event_id is empty".to_string()));
        }
        if raw.entity_key.trim().is_empty() {
            return Err(DecodeError::Invalid("entity_key is empty".to_string()));
        }
        if raw.sequence < FIRST_SEQUENCE as i64 {
            return Err(DecodeError::Invalid(format!(
                "sequence must be >= {}, got {}",
                FIRST_SEQUENCE, raw.sequence
            )));
        }

        let kind = EventKind::from_parts(&raw.event_type, raw.payload)?;
        kind.validate()?;

        Ok(Self {
            event_id: raw.event_id,
            entity_key: raw.entity_key,
            sequence: raw.sequence as u64,
            occurred_at: raw.occurred_at,
            kind,
        })
    }

    /// Encode back to the wire format (stash persistence, dead letters, test fixtures)
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let raw = RawEnvelope {
            event_id: self.event_id.clone(),
            entity_key: self.entity_key.clone(),
            sequence: self.sequence as i64,
            occurred_at: self.occurred_at,
            event_type: self.kind.type_tag().to_string(),
            payload: self.kind.payload()?,
        };
        serde_json::to_vec(&raw)
    }
}
