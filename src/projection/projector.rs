//! Event-to-row projection
//!
//! `project(row, event)` is a pure function of its inputs: replaying the same
//! events over the same starting row always yields the same row. Money is kept
//! in integer cents with checked arithmetic.

use super::view::{LineItem, OrderStatus, OrderView};
use crate::event::{
    EventEnvelope, EventKind, ItemAdded, ItemRemoved, OrderCancelled, OrderPaid, OrderPlaced,
    OrderShipped,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectionError {
    #[error("event for {event_key} applied to row {row_key}")]
    KeyMismatch { row_key: String, event_key: String },

    #[error("arithmetic overflow computing {0}")]
    Overflow(&'static str),
}

/// Single capability every known event type implements
pub trait ApplyToView {
    fn apply(&self, row: &mut OrderView) -> Result<(), ProjectionError>;
}

impl ApplyToView for OrderPlaced {
    fn apply(&self, row: &mut OrderView) -> Result<(), ProjectionError> {
        row.customer_id = Some(self.customer_id.clone());
        row.currency = Some(self.currency.clone());
        row.status = OrderStatus::Placed;
        Ok(())
    }
}

impl ApplyToView for ItemAdded {
    fn apply(&self, row: &mut OrderView) -> Result<(), ProjectionError> {
        let line = row.line_items.entry(self.sku.clone()).or_insert(LineItem {
            quantity: 0,
            unit_price_cents: self.unit_price_cents,
        });
        line.quantity = line
            .quantity
            .checked_add(self.quantity)
            .ok_or(ProjectionError::Overflow("line quantity"))?;
        // Latest price wins for the whole line
        line.unit_price_cents = self.unit_price_cents;
        Ok(())
    }
}

impl ApplyToView for ItemRemoved {
    fn apply(&self, row: &mut OrderView) -> Result<(), ProjectionError> {
        if let Some(line) = row.line_items.get_mut(&self.sku) {
            line.quantity = line.quantity.saturating_sub(self.quantity);
            if line.quantity == 0 {
                row.line_items.remove(&self.sku);
            }
        }
        Ok(())
    }
}

impl ApplyToView for OrderPaid {
    fn apply(&self, row: &mut OrderView) -> Result<(), ProjectionError> {
        row.paid_cents = row
            .paid_cents
            .checked_add(self.amount_cents)
            .ok_or(ProjectionError::Overflow("paid_cents"))?;
        row.status = OrderStatus::Paid;
        Ok(())
    }
}

impl ApplyToView for OrderShipped {
    fn apply(&self, row: &mut OrderView) -> Result<(), ProjectionError> {
        row.status = OrderStatus::Shipped;
        Ok(())
    }
}

impl ApplyToView for OrderCancelled {
    fn apply(&self, row: &mut OrderView) -> Result<(), ProjectionError> {
        row.status = OrderStatus::Cancelled;
        Ok(())
    }
}

impl ApplyToView for EventKind {
    fn apply(&self, row: &mut OrderView) -> Result<(), ProjectionError> {
        match self {
            EventKind::OrderPlaced(e) => e.apply(row),
            EventKind::ItemAdded(e) => e.apply(row),
            EventKind::ItemRemoved(e) => e.apply(row),
            EventKind::OrderPaid(e) => e.apply(row),
            EventKind::OrderShipped(e) => e.apply(row),
            EventKind::OrderCancelled(e) => e.apply(row),
        }
    }
}

/// Compute the row that results from applying `event` on top of `current`.
pub fn project(current: &OrderView, event: &EventEnvelope) -> Result<OrderView, ProjectionError> {
    if current.order_id != event.entity_key {
        return Err(ProjectionError::KeyMismatch {
            row_key: current.order_id.clone(),
            event_key: event.entity_key.clone(),
        });
    }

    let mut next = current.clone();
    event.kind.apply(&mut next)?;
    recompute_totals(&mut next)?;

    next.last_applied_sequence = event.sequence;
    next.last_applied_event_id = Some(event.event_id.clone());
    next.updated_at = Some(event.occurred_at);

    Ok(next)
}

fn recompute_totals(row: &mut OrderView) -> Result<(), ProjectionError> {
    let mut item_count: i64 = 0;
    let mut total_cents: i64 = 0;

    for line in row.line_items.values() {
        let quantity = i64::from(line.quantity);
        item_count = item_count
            .checked_add(quantity)
            .ok_or(ProjectionError::Overflow("item_count"))?;
        let line_total = quantity
            .checked_mul(line.unit_price_cents)
            .ok_or(ProjectionError::Overflow("line total"))?;
        total_cents = total_cents
            .checked_add(line_total)
            .ok_or(ProjectionError::Overflow("total_cents"))?;
    }

    row.item_count = item_count;
    row.total_cents = total_cents;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn envelope(sequence: u64, kind: EventKind) -> EventEnvelope {
        EventEnvelope {
            event_id: format!("evt-{}", sequence),
            entity_key: "order-1".to_string(),
            sequence,
            occurred_at: Utc.timestamp_opt(1_700_000_000 + sequence as i64, 0).unwrap(),
            kind,
        }
    }

    fn add(sku: &str, quantity: u32, unit_price_cents: i64) -> EventKind {
        EventKind::ItemAdded(ItemAdded {
            sku: sku.to_string(),
            quantity,
            unit_price_cents,
        })
    }

    #[test]
    fn test_cumulative_totals() {
        let row = OrderView::empty("order-1");
        let row = project(
            &row,
            &envelope(
                1,
                EventKind::OrderPlaced(OrderPlaced {
                    customer_id: "c-1".to_string(),
                    currency: "EUR".to_string(),
                }),
            ),
        )
        .unwrap();
        let row = project(&row, &envelope(2, add("A", 2, 250))).unwrap();
        let row = project(&row, &envelope(3, add("B", 1, 1_000))).unwrap();

        assert_eq!(row.status, OrderStatus::Placed);
        assert_eq!(row.item_count, 3);
        assert_eq!(row.total_cents, 1_500);
        assert_eq!(row.last_applied_sequence, 3);
        assert_eq!(row.last_applied_event_id.as_deref(), Some("evt-3"));
    }

    #[test]
    fn test_item_removed_decrements_and_drops_empty_line() {
        let row = OrderView::empty("order-1");
        let row = project(&row, &envelope(1, add("A", 3, 100))).unwrap();
        let row = project(
            &row,
            &envelope(
                2,
                EventKind::ItemRemoved(ItemRemoved {
                    sku: "A".to_string(),
                    quantity: 1,
                }),
            ),
        )
        .unwrap();
        assert_eq!(row.item_count, 2);
        assert_eq!(row.total_cents, 200);

        let row = project(
            &row,
            &envelope(
                3,
                EventKind::ItemRemoved(ItemRemoved {
                    sku: "A".to_string(),
                    quantity: 10,
                }),
            ),
        )
        .unwrap();
        assert!(row.line_items.is_empty());
        assert_eq!(row.item_count, 0);
        assert_eq!(row.total_cents, 0);
    }

    #[test]
    fn test_projection_is_pure() {
        let start = OrderView::empty("order-1");
        let event = envelope(1, add("A", 2, 999));
        assert_eq!(project(&start, &event), project(&start, &event));
        // Input row untouched
        assert_eq!(start, OrderView::empty("order-1"));
    }

    #[test]
    fn test_payment_and_status_transitions() {
        let row = OrderView::empty("order-1");
        let row = project(
            &row,
            &envelope(1, EventKind::OrderPaid(OrderPaid { amount_cents: 500 })),
        )
        .unwrap();
        assert_eq!(row.status, OrderStatus::Paid);
        assert_eq!(row.paid_cents, 500);

        let row = project(
            &row,
            &envelope(2, EventKind::OrderShipped(OrderShipped::default())),
        )
        .unwrap();
        assert_eq!(row.status, OrderStatus::Shipped);
        assert_eq!(row.paid_cents, 500);
    }

    #[test]
    fn test_overflow_is_rejected() {
        let row = OrderView::empty("order-1");
        let err = project(&row, &envelope(1, add("A", u32::MAX, i64::MAX / 2))).unwrap_err();
        assert_eq!(err, ProjectionError::Overflow("line total"));
    }

    #[test]
    fn test_key_mismatch_is_rejected() {
        let row = OrderView::empty("order-2");
        let err = project(&row, &envelope(1, add("A", 1, 1))).unwrap_err();
        assert!(matches!(err, ProjectionError::KeyMismatch { .. }));
    }
}
