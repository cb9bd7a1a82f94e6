//! Denormalized order view row

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Items seen but the order was never placed
    Pending,
    Placed,
    Paid,
    Shipped,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Placed => "placed",
            OrderStatus::Paid => "paid",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "placed" => Some(OrderStatus::Placed),
            "paid" => Some(OrderStatus::Paid),
            "shipped" => Some(OrderStatus::Shipped),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub quantity: u32,
    pub unit_price_cents: i64,
}

/// One row of the materialized view, keyed by order id.
///
/// `last_applied_sequence` is 0 only for the zero-value row of an unseen key;
/// stored rows always carry the sequence and id of the event that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderView {
    pub order_id: String,
    pub customer_id: Option<String>,
    pub currency: Option<String>,
    pub status: OrderStatus,
    pub line_items: BTreeMap<String, LineItem>,
    pub item_count: i64,
    pub total_cents: i64,
    pub paid_cents: i64,
    pub last_applied_sequence: u64,
    pub last_applied_event_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl OrderView {
    /// Zero-value row for a key the view has never seen
    pub fn empty(order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            customer_id: None,
            currency: None,
            status: OrderStatus::Pending,
            line_items: BTreeMap::new(),
            item_count: 0,
            total_cents: 0,
            paid_cents: 0,
            last_applied_sequence: 0,
            last_applied_event_id: None,
            updated_at: None,
        }
    }

    /// Sequence as seen by the tracker: `None` until something was applied
    pub fn applied_sequence(&self) -> Option<u64> {
        (self.last_applied_sequence > 0).then_some(self.last_applied_sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings_parse_back() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Placed,
            OrderStatus::Paid,
            OrderStatus::Shipped,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(OrderStatus::parse("refunded"), None);
    }

    #[test]
    fn test_empty_row_has_no_applied_sequence() {
        let row = OrderView::empty("order-1");
        assert_eq!(row.applied_sequence(), None);
        assert_eq!(row.item_count, 0);
        assert_eq!(row.status, OrderStatus::Pending);
    }
}
