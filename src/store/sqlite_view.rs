//! SQLite implementation of the view store
//!
//! The conditional write runs inside an IMMEDIATE transaction: the sequence
//! check, the event-identity insert and the row upsert either all commit or
//! the transaction is dropped and rolled back.

use super::{lock, ApplyOutcome, SharedConnection, StoreError, ViewStore};
use crate::projection::{LineItem, OrderStatus, OrderView};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use std::collections::BTreeMap;

const SELECT_COLUMNS: &str = "order_id, customer_id, currency, status, line_items_json, \
     item_count, total_cents, paid_cents, last_applied_sequence, last_applied_event_id, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest `updated_at` first
    Asc,
    /// Newest `updated_at` first
    Desc,
}

/// Range query by status, for the read API
#[derive(Debug, Clone)]
pub struct ViewQuery {
    pub status: OrderStatus,
    pub order: SortOrder,
    pub limit: usize,
    pub offset: usize,
}

impl ViewQuery {
    pub fn by_status(status: OrderStatus) -> Self {
        Self {
            status,
            order: SortOrder::Desc,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ViewPage {
    pub rows: Vec<OrderView>,
    /// Rows matching the status across all pages
    pub total: usize,
}

pub struct SqliteViewStore {
    conn: SharedConnection,
}

/// Column values as read, before the row is rebuilt
struct StoredRow {
    order_id: String,
    customer_id: Option<String>,
    currency: Option<String>,
    status: String,
    line_items_json: String,
    item_count: i64,
    total_cents: i64,
    paid_cents: i64,
    last_applied_sequence: i64,
    last_applied_event_id: String,
    updated_at: String,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            order_id: row.get(0)?,
            customer_id: row.get(1)?,
            currency: row.get(2)?,
            status: row.get(3)?,
            line_items_json: row.get(4)?,
            item_count: row.get(5)?,
            total_cents: row.get(6)?,
            paid_cents: row.get(7)?,
            last_applied_sequence: row.get(8)?,
            last_applied_event_id: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn into_view(self) -> Result<OrderView, StoreError> {
        let corrupt = |detail: String| StoreError::Corrupt {
            key: self.order_id.clone(),
            detail,
        };

        let status = OrderStatus::parse(&self.status)
            .ok_or_else(|| corrupt(format!("unknown status {:?}", self.status)))?;
        let line_items: BTreeMap<String, LineItem> = serde_json::from_str(&self.line_items_json)
            .map_err(|e| corrupt(format!("line_items_json: {}", e)))?;
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| corrupt(format!("updated_at: {}", e)))?
            .with_timezone(&Utc);

        Ok(OrderView {
            order_id: self.order_id,
            customer_id: self.customer_id,
            currency: self.currency,
            status,
            line_items,
            item_count: self.item_count,
            total_cents: self.total_cents,
            paid_cents: self.paid_cents,
            last_applied_sequence: self.last_applied_sequence as u64,
            last_applied_event_id: Some(self.last_applied_event_id),
            updated_at: Some(updated_at),
        })
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    // Fixed-width nanosecond form keeps lexical order equal to time order
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

impl SqliteViewStore {
    /// Wrap an already-migrated database connection
    pub fn new(conn: SharedConnection) -> Self {
        Self { conn }
    }

    /// Page through rows with a given status, sorted by `updated_at` then `order_id`
    pub fn query_by_status(&self, query: &ViewQuery) -> Result<ViewPage, StoreError> {
        let conn = lock(&self.conn)?;

        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM order_views WHERE status = ?1",
            [query.status.as_str()],
            |row| row.get(0),
        )?;

        let direction = match query.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        let sql = format!(
            "SELECT {} FROM order_views WHERE status = ?1
             ORDER BY updated_at {dir}, order_id {dir} LIMIT ?2 OFFSET ?3",
            SELECT_COLUMNS,
            dir = direction
        );

        let mut stmt = conn.prepare(&sql)?;
        let stored = stmt
            .query_map(
                params![query.status.as_str(), query.limit as i64, query.offset as i64],
                StoredRow::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let rows = stored
            .into_iter()
            .map(StoredRow::into_view)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ViewPage {
            rows,
            total: total as usize,
        })
    }

    /// Number of rows in the view
    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM order_views", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[async_trait]
impl ViewStore for SqliteViewStore {
    async fn load(&self, key: &str) -> Result<Option<OrderView>, StoreError> {
        let conn = lock(&self.conn)?;

        let stored = conn
            .query_row(
                &format!("SELECT {} FROM order_views WHERE order_id = ?1", SELECT_COLUMNS),
                [key],
                StoredRow::from_row,
            )
            .optional()?;

        stored.map(StoredRow::into_view).transpose()
    }

    async fn apply_if_sequence_matches(
        &self,
        key: &str,
        expected_last: Option<u64>,
        new_row: &OrderView,
    ) -> Result<ApplyOutcome, StoreError> {
        let event_id = new_row.last_applied_event_id.as_deref().ok_or_else(|| {
            StoreError::Corrupt {
                key: key.to_string(),
                detail: "row to write has no event id".to_string(),
            }
        })?;
        let updated_at = new_row.updated_at.as_ref().map(format_timestamp).ok_or_else(|| {
            StoreError::Corrupt {
                key: key.to_string(),
                detail: "row to write has no updated_at".to_string(),
            }
        })?;
        let line_items_json =
            serde_json::to_string(&new_row.line_items).map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                detail: e.to_string(),
            })?;

        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT last_applied_sequence FROM order_views WHERE order_id = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.map(|s| s as u64);

        if current != expected_last {
            // Dropping `tx` rolls back
            return Ok(ApplyOutcome::Conflict { current });
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO applied_events (order_id, event_id, sequence)
             VALUES (?1, ?2, ?3)",
            params![key, event_id, new_row.last_applied_sequence as i64],
        )?;
        if inserted == 0 {
            return Ok(ApplyOutcome::DuplicateEvent);
        }

        tx.execute(
            r#"
            INSERT INTO order_views (
                order_id, customer_id, currency, status, line_items_json,
                item_count, total_cents, paid_cents,
                last_applied_sequence, last_applied_event_id, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(order_id) DO UPDATE SET
                customer_id = excluded.customer_id,
                currency = excluded.currency,
                status = excluded.status,
                line_items_json = excluded.line_items_json,
                item_count = excluded.item_count,
                total_cents = excluded.total_cents,
                paid_cents = excluded.paid_cents,
                last_applied_sequence = excluded.last_applied_sequence,
                last_applied_event_id = excluded.last_applied_event_id,
                updated_at = excluded.updated_at
            "#,
            params![
                key,
                new_row.customer_id,
                new_row.currency,
                new_row.status.as_str(),
                line_items_json,
                new_row.item_count,
                new_row.total_cents,
                new_row.paid_cents,
                new_row.last_applied_sequence as i64,
                event_id,
                updated_at,
            ],
        )?;

        tx.commit()?;
        Ok(ApplyOutcome::Applied)
    }

    async fn was_applied(&self, key: &str, event_id: &str) -> Result<bool, StoreError> {
        let conn = lock(&self.conn)?;
        let found = conn
            .query_row(
                "SELECT 1 FROM applied_events WHERE order_id = ?1 AND event_id = ?2",
                [key, event_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    async fn truncate(&self) -> Result<(), StoreError> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows = tx.execute("DELETE FROM order_views", [])?;
        tx.execute("DELETE FROM applied_events", [])?;
        tx.commit()?;

        log::info!("🧹 Truncated view store ({} rows)", rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventEnvelope, EventKind, ItemAdded, OrderPlaced};
    use crate::projection::project;
    use crate::store::open_database;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn create_test_store() -> (NamedTempFile, SqliteViewStore) {
        let temp = NamedTempFile::new().unwrap();
        let conn = open_database(temp.path().to_str().unwrap(), "sql").unwrap();
        (temp, SqliteViewStore::new(conn))
    }

    fn envelope(key: &str, sequence: u64, event_id: &str, kind: EventKind) -> EventEnvelope {
        EventEnvelope {
            event_id: event_id.to_string(),
            entity_key: key.to_string(),
            sequence,
            occurred_at: Utc.timestamp_opt(1_700_000_000 + sequence as i64, 123).unwrap(),
            kind,
        }
    }

    fn placed(key: &str, sequence: u64) -> EventEnvelope {
        envelope(
            key,
            sequence,
            &format!("{}-{}", key, sequence),
            EventKind::OrderPlaced(OrderPlaced {
                customer_id: "c-1".to_string(),
                currency: "USD".to_string(),
            }),
        )
    }

    fn added(key: &str, sequence: u64, event_id: &str) -> EventEnvelope {
        envelope(
            key,
            sequence,
            event_id,
            EventKind::ItemAdded(ItemAdded {
                sku: "A".to_string(),
                quantity: 1,
                unit_price_cents: 100,
            }),
        )
    }

    #[tokio::test]
    async fn test_apply_new_row_and_load() {
        let (_temp, store) = create_test_store();
        let row = project(&OrderView::empty("o-1"), &placed("o-1", 1)).unwrap();

        let outcome = store.apply_if_sequence_matches("o-1", None, &row).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);

        let loaded = store.load("o-1").await.unwrap().unwrap();
        assert_eq!(loaded, row);
        assert_eq!(loaded.applied_sequence(), Some(1));
    }

    #[tokio::test]
    async fn test_load_unknown_key() {
        let (_temp, store) = create_test_store();
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_expectation_conflicts() {
        let (_temp, store) = create_test_store();
        let row1 = project(&OrderView::empty("o-1"), &placed("o-1", 1)).unwrap();
        store.apply_if_sequence_matches("o-1", None, &row1).await.unwrap();

        // A second writer still believes the key is unseen
        let competing = project(&OrderView::empty("o-1"), &placed("o-1", 1)).unwrap();
        let outcome = store
            .apply_if_sequence_matches("o-1", None, &competing)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Conflict { current: Some(1) });

        let row2 = project(&row1, &added("o-1", 2, "o-1-2")).unwrap();
        let outcome = store
            .apply_if_sequence_matches("o-1", Some(5), &row2)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Conflict { current: Some(1) });

        assert_eq!(store.load("o-1").await.unwrap().unwrap(), row1);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_is_rejected() {
        let (_temp, store) = create_test_store();
        let row1 = project(&OrderView::empty("o-1"), &added("o-1", 1, "dup")).unwrap();
        store.apply_if_sequence_matches("o-1", None, &row1).await.unwrap();

        // Same event id reused under a new sequence
        let row2 = project(&row1, &added("o-1", 2, "dup")).unwrap();
        let outcome = store
            .apply_if_sequence_matches("o-1", Some(1), &row2)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::DuplicateEvent);

        let loaded = store.load("o-1").await.unwrap().unwrap();
        assert_eq!(loaded.last_applied_sequence, 1);
        assert_eq!(loaded.item_count, 1);
    }

    #[tokio::test]
    async fn test_was_applied_tracks_event_identity() {
        let (_temp, store) = create_test_store();
        let row1 = project(&OrderView::empty("o-1"), &placed("o-1", 1)).unwrap();
        store.apply_if_sequence_matches("o-1", None, &row1).await.unwrap();

        assert!(store.was_applied("o-1", "o-1-1").await.unwrap());
        assert!(!store.was_applied("o-1", "o-1-2").await.unwrap());
        assert!(!store.was_applied("o-2", "o-1-1").await.unwrap());

        store.truncate().await.unwrap();
        assert!(!store.was_applied("o-1", "o-1-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_query_by_status_paginates() {
        let (_temp, store) = create_test_store();
        for (i, key) in ["o-1", "o-2", "o-3"].iter().enumerate() {
            let mut event = placed(key, 1);
            event.occurred_at = Utc.timestamp_opt(1_700_000_000 + i as i64, 0).unwrap();
            let row = project(&OrderView::empty(*key), &event).unwrap();
            store.apply_if_sequence_matches(key, None, &row).await.unwrap();
        }
        let pending = project(&OrderView::empty("o-4"), &added("o-4", 1, "o-4-1")).unwrap();
        store.apply_if_sequence_matches("o-4", None, &pending).await.unwrap();

        let mut query = ViewQuery::by_status(OrderStatus::Placed);
        query.limit = 2;
        let page = store.query_by_status(&query).unwrap();
        assert_eq!(page.total, 3);
        let ids: Vec<_> = page.rows.iter().map(|r| r.order_id.as_str()).collect();
        assert_eq!(ids, vec!["o-3", "o-2"]);

        query.offset = 2;
        let page = store.query_by_status(&query).unwrap();
        let ids: Vec<_> = page.rows.iter().map(|r| r.order_id.as_str()).collect();
        assert_eq!(ids, vec!["o-1"]);

        query.order = SortOrder::Asc;
        query.offset = 0;
        query.limit = 10;
        let page = store.query_by_status(&query).unwrap();
        let ids: Vec<_> = page.rows.iter().map(|r| r.order_id.as_str()).collect();
        assert_eq!(ids, vec!["o-1", "o-2", "o-3"]);
    }

    #[tokio::test]
    async fn test_truncate_clears_rows_and_identities() {
        let (_temp, store) = create_test_store();
        let row = project(&OrderView::empty("o-1"), &placed("o-1", 1)).unwrap();
        store.apply_if_sequence_matches("o-1", None, &row).await.unwrap();

        store.truncate().await.unwrap();
        assert_eq!(store.count().unwrap(), 0);

        // Same event applies again after a truncate
        let outcome = store.apply_if_sequence_matches("o-1", None, &row).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied);
    }
}
