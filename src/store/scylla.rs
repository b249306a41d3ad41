use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use scylla::client::session::Session;
use scylla::response::query_result::QueryResult;
use scylla::serialize::row::SerializeRow;
use scylla::statement::batch::Batch;
use scylla::value::{CqlValue, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::delivery::DeliveryEvent;
use crate::domain::fulfillment::{LineItemStatus, Order, OrderLineItem, StatusHistoryEntry};
use crate::domain::payment::{ChargeRecord, ChargeState, CompensationRecord};
use crate::domain::review::ReviewRecord;

use super::{
    DeliveryEventStore, LineItemRepository, OrderRepository, PaymentLedger, ReviewStore, StoreError,
};

// ============================================================================
// ScyllaDB Store
// ============================================================================
//
// Tables (created by `ensure_schema`):
//
//   line_items            one partition per line item
//                         static: version, status, snapshot (JSON)
//                         rows:   history_seq -> entry (JSON)
//   order_line_items      order_id -> line_item_id
//   orders                order header (JSON)
//   delivery_events       line_item_id, event_id (v7, so time ordered)
//   delivery_events_by_id event_id -> line_item_id
//   reviews               one per line item, LWT on version
//   charges               charge ledger, LWT on state
//   compensations         compensation ledger, LWT on attempts
//
// A transition is one single-partition conditional batch: the static
// snapshot update carries `IF version = ?` and the history row rides along,
// so both land or neither does.
//
// ============================================================================

const SCHEMA: [&str; 8] = [
    "CREATE TABLE IF NOT EXISTS line_items (
        line_item_id uuid,
        history_seq bigint,
        order_id uuid STATIC,
        version bigint STATIC,
        status text STATIC,
        snapshot text STATIC,
        entry text,
        PRIMARY KEY (line_item_id, history_seq)
    ) WITH CLUSTERING ORDER BY (history_seq ASC)",
    "CREATE TABLE IF NOT EXISTS order_line_items (
        order_id uuid,
        line_item_id uuid,
        PRIMARY KEY (order_id, line_item_id)
    )",
    "CREATE TABLE IF NOT EXISTS orders (
        order_id uuid PRIMARY KEY,
        order_code text,
        payload text,
        created_at timestamp
    )",
    "CREATE TABLE IF NOT EXISTS delivery_events (
        line_item_id uuid,
        event_id uuid,
        payload text,
        PRIMARY KEY (line_item_id, event_id)
    ) WITH CLUSTERING ORDER BY (event_id ASC)",
    "CREATE TABLE IF NOT EXISTS delivery_events_by_id (
        event_id uuid PRIMARY KEY,
        line_item_id uuid
    )",
    "CREATE TABLE IF NOT EXISTS reviews (
        line_item_id uuid PRIMARY KEY,
        version bigint,
        payload text
    )",
    "CREATE TABLE IF NOT EXISTS charges (
        charge_id text PRIMARY KEY,
        state text,
        order_id uuid,
        payload text
    )",
    "CREATE TABLE IF NOT EXISTS compensations (
        id uuid PRIMARY KEY,
        attempts int,
        payload text
    )",
];

pub struct ScyllaStore {
    session: Arc<Session>,
}

impl ScyllaStore {
    pub fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    /// Create the tables in the session's current keyspace.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            self.session
                .query_unpaged(statement, &[])
                .await
                .with_context(|| format!("Failed to apply schema statement: {}", first_line(statement)))?;
        }
        tracing::info!(tables = SCHEMA.len(), "✅ Fulfillment schema ready");
        Ok(())
    }

    async fn current_version(&self, line_item_id: Uuid) -> anyhow::Result<Option<i64>> {
        let result = self
            .session
            .query_unpaged(
                "SELECT version FROM line_items WHERE line_item_id = ? LIMIT 1",
                (line_item_id,),
            )
            .await?;
        let rows = result.into_rows_result()?;
        Ok(rows.maybe_first_row::<(Option<i64>,)>()?.and_then(|(v,)| v))
    }

    async fn json_rows<T: DeserializeOwned>(
        &self,
        query: &'static str,
        values: impl SerializeRow,
    ) -> anyhow::Result<Vec<T>> {
        let result = self.session.query_unpaged(query, values).await?;
        let rows = result.into_rows_result()?;

        let mut decoded = Vec::new();
        for row in rows.rows::<(Option<String>,)>()? {
            if let (Some(payload),) = row? {
                decoded.push(from_json(&payload)?);
            }
        }
        Ok(decoded)
    }

    async fn json_row<T: DeserializeOwned>(
        &self,
        query: &'static str,
        values: impl SerializeRow,
    ) -> anyhow::Result<Option<T>> {
        Ok(self.json_rows(query, values).await?.into_iter().next())
    }
}

// ============================================================================
// Line Items
// ============================================================================

#[async_trait]
impl LineItemRepository for ScyllaStore {
    async fn get_line_item(&self, line_item_id: Uuid) -> Result<Option<OrderLineItem>, StoreError> {
        Ok(self
            .json_row(
                "SELECT snapshot FROM line_items WHERE line_item_id = ? LIMIT 1",
                (line_item_id,),
            )
            .await?)
    }

    async fn list_by_order(&self, order_id: Uuid) -> Result<Vec<OrderLineItem>, StoreError> {
        let result = self
            .session
            .query_unpaged(
                "SELECT line_item_id FROM order_line_items WHERE order_id = ?",
                (order_id,),
            )
            .await
            .backend()?;
        let rows = result.into_rows_result().backend()?;

        let ids = rows
            .rows::<(Uuid,)>()
            .backend()?
            .map(|row| row.map(|(id,)| id))
            .collect::<Result<Vec<_>, _>>()
            .backend()?;

        let mut items = Vec::new();
        for line_item_id in ids {
            if let Some(item) = self.get_line_item(line_item_id).await? {
                items.push(item);
            }
        }
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }

    /// Full scan over partitions; used by the periodic sweeps only.
    async fn list_by_status(&self, status: LineItemStatus) -> Result<Vec<OrderLineItem>, StoreError> {
        let result = self
            .session
            .query_unpaged("SELECT DISTINCT line_item_id, status, snapshot FROM line_items", &[])
            .await
            .backend()?;
        let rows = result.into_rows_result().backend()?;

        let mut items = Vec::new();
        for row in rows.rows::<(Uuid, Option<String>, Option<String>)>().backend()? {
            let (_, row_status, snapshot) = row.backend()?;
            if row_status.as_deref() != Some(status.as_str()) {
                continue;
            }
            if let Some(snapshot) = snapshot {
                items.push(from_json::<OrderLineItem>(&snapshot)?);
            }
        }
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }

    async fn commit_transition(
        &self,
        expected_version: i64,
        item: &OrderLineItem,
        entry: &StatusHistoryEntry,
    ) -> Result<(), StoreError> {
        let mut batch = Batch::default();
        let mut values: Vec<Box<dyn SerializeRow + Send + Sync>> = vec![];

        batch.append_statement(
            "UPDATE line_items SET version = ?, status = ?, snapshot = ?
             WHERE line_item_id = ? IF version = ?",
        );
        values.push(Box::new((
            item.version,
            item.status.as_str().to_string(),
            to_json(item)?,
            item.id,
            expected_version,
        )));

        batch.append_statement(
            "INSERT INTO line_items (line_item_id, history_seq, entry) VALUES (?, ?, ?)",
        );
        values.push(Box::new((item.id, entry.sequence, to_json(entry)?)));

        let result = self.session.batch(&batch, values).await.backend()?;
        if was_applied(result)? {
            tracing::debug!(
                line_item_id = %item.id,
                version = item.version,
                status = %item.status,
                "Line item transition committed"
            );
            return Ok(());
        }

        match self.current_version(item.id).await? {
            None => Err(StoreError::not_found("line item", item.id)),
            actual => Err(StoreError::Conflict {
                expected: expected_version,
                actual,
            }),
        }
    }

    async fn history(&self, line_item_id: Uuid) -> Result<Vec<StatusHistoryEntry>, StoreError> {
        let mut entries: Vec<StatusHistoryEntry> = self
            .json_rows(
                "SELECT entry FROM line_items WHERE line_item_id = ?",
                (line_item_id,),
            )
            .await?;
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }
}

// ============================================================================
// Orders
// ============================================================================

#[async_trait]
impl OrderRepository for ScyllaStore {
    /// Line items first, header last: `get_order` only sees orders whose
    /// items were all written.
    async fn create_order(&self, order: &Order, items: &[OrderLineItem]) -> Result<(), StoreError> {
        for item in items {
            let creation = StatusHistoryEntry::creation(item);
            let result = self
                .session
                .query_unpaged(
                    "INSERT INTO line_items (line_item_id, history_seq, order_id, version, status, snapshot, entry)
                     VALUES (?, ?, ?, ?, ?, ?, ?) IF NOT EXISTS",
                    (
                        item.id,
                        creation.sequence,
                        order.id,
                        item.version,
                        item.status.as_str().to_string(),
                        to_json(item)?,
                        to_json(&creation)?,
                    ),
                )
                .await
                .backend()?;
            if !was_applied(result)? {
                return Err(StoreError::Duplicate { entity: "line item", id: item.id.to_string() });
            }

            self.session
                .query_unpaged(
                    "INSERT INTO order_line_items (order_id, line_item_id) VALUES (?, ?)",
                    (order.id, item.id),
                )
                .await
                .backend()?;
        }

        let result = self
            .session
            .query_unpaged(
                "INSERT INTO orders (order_id, order_code, payload, created_at) VALUES (?, ?, ?, ?) IF NOT EXISTS",
                (order.id, order.order_code.clone(), to_json(order)?, order.created_at),
            )
            .await
            .backend()?;
        if !was_applied(result)? {
            return Err(StoreError::Duplicate { entity: "order", id: order.id.to_string() });
        }

        tracing::debug!(order_id = %order.id, line_items = items.len(), "Order persisted");
        Ok(())
    }

    async fn get_order(&self, order_id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self
            .json_row("SELECT payload FROM orders WHERE order_id = ?", (order_id,))
            .await?)
    }
}

// ============================================================================
// Delivery Events
// ============================================================================

#[async_trait]
impl DeliveryEventStore for ScyllaStore {
    async fn append_event(&self, event: &DeliveryEvent) -> Result<(), StoreError> {
        let mut batch = Batch::default();
        let mut values: Vec<Box<dyn SerializeRow + Send + Sync>> = vec![];

        batch.append_statement(
            "INSERT INTO delivery_events (line_item_id, event_id, payload) VALUES (?, ?, ?)",
        );
        values.push(Box::new((event.line_item_id, event.id, to_json(event)?)));

        batch.append_statement(
            "INSERT INTO delivery_events_by_id (event_id, line_item_id) VALUES (?, ?)",
        );
        values.push(Box::new((event.id, event.line_item_id)));

        self.session.batch(&batch, values).await.backend()?;
        Ok(())
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<DeliveryEvent>, StoreError> {
        let result = self
            .session
            .query_unpaged(
                "SELECT line_item_id FROM delivery_events_by_id WHERE event_id = ?",
                (event_id,),
            )
            .await
            .backend()?;
        let rows = result.into_rows_result().backend()?;
        let Some((line_item_id,)) = rows.maybe_first_row::<(Uuid,)>().backend()? else {
            return Ok(None);
        };

        Ok(self
            .json_row(
                "SELECT payload FROM delivery_events WHERE line_item_id = ? AND event_id = ?",
                (line_item_id, event_id),
            )
            .await?)
    }

    async fn update_event(&self, event: &DeliveryEvent) -> Result<(), StoreError> {
        let result = self
            .session
            .query_unpaged(
                "UPDATE delivery_events SET payload = ? WHERE line_item_id = ? AND event_id = ? IF EXISTS",
                (to_json(event)?, event.line_item_id, event.id),
            )
            .await
            .backend()?;
        if !was_applied(result)? {
            return Err(StoreError::not_found("delivery event", event.id));
        }
        Ok(())
    }

    async fn list_events(&self, line_item_id: Uuid) -> Result<Vec<DeliveryEvent>, StoreError> {
        Ok(self
            .json_rows(
                "SELECT payload FROM delivery_events WHERE line_item_id = ?",
                (line_item_id,),
            )
            .await?)
    }
}

// ============================================================================
// Reviews
// ============================================================================

#[async_trait]
impl ReviewStore for ScyllaStore {
    async fn get_for_line_item(&self, line_item_id: Uuid) -> Result<Option<ReviewRecord>, StoreError> {
        Ok(self
            .json_row("SELECT payload FROM reviews WHERE line_item_id = ?", (line_item_id,))
            .await?)
    }

    async fn insert_review(&self, review: &ReviewRecord) -> Result<(), StoreError> {
        let result = self
            .session
            .query_unpaged(
                "INSERT INTO reviews (line_item_id, version, payload) VALUES (?, ?, ?) IF NOT EXISTS",
                (review.line_item_id, review.version, to_json(review)?),
            )
            .await
            .backend()?;
        if !was_applied(result)? {
            return Err(StoreError::Duplicate {
                entity: "review",
                id: review.line_item_id.to_string(),
            });
        }
        Ok(())
    }

    async fn update_review(&self, review: &ReviewRecord, expected_version: i64) -> Result<(), StoreError> {
        let result = self
            .session
            .query_unpaged(
                "UPDATE reviews SET version = ?, payload = ? WHERE line_item_id = ? IF version = ?",
                (review.version, to_json(review)?, review.line_item_id, expected_version),
            )
            .await
            .backend()?;
        if was_applied(result)? {
            return Ok(());
        }

        match self.get_for_line_item(review.line_item_id).await? {
            None => Err(StoreError::not_found("review", review.line_item_id)),
            Some(stored) => Err(StoreError::Conflict {
                expected: expected_version,
                actual: Some(stored.version),
            }),
        }
    }
}

// ============================================================================
// Payment Ledger
// ============================================================================

#[async_trait]
impl PaymentLedger for ScyllaStore {
    async fn insert_charge(&self, charge: &ChargeRecord) -> Result<(), StoreError> {
        let result = self
            .session
            .query_unpaged(
                "INSERT INTO charges (charge_id, state, order_id, payload) VALUES (?, ?, ?, ?) IF NOT EXISTS",
                (
                    charge.charge_id.clone(),
                    charge.state.as_str().to_string(),
                    charge.order_id,
                    to_json(charge)?,
                ),
            )
            .await
            .backend()?;
        if !was_applied(result)? {
            return Err(StoreError::Duplicate { entity: "charge", id: charge.charge_id.clone() });
        }
        Ok(())
    }

    async fn get_charge(&self, charge_id: &str) -> Result<Option<ChargeRecord>, StoreError> {
        Ok(self
            .json_row("SELECT payload FROM charges WHERE charge_id = ?", (charge_id.to_string(),))
            .await?)
    }

    async fn list_charges(&self, state: ChargeState) -> Result<Vec<ChargeRecord>, StoreError> {
        let mut charges: Vec<ChargeRecord> = self
            .json_rows(
                "SELECT payload FROM charges WHERE state = ? ALLOW FILTERING",
                (state.as_str().to_string(),),
            )
            .await?;
        charges.sort_by_key(|c| c.created_at);
        Ok(charges)
    }

    async fn transition_charge(
        &self,
        charge_id: &str,
        expected: &[ChargeState],
        next: ChargeState,
        order_id: Option<Uuid>,
    ) -> Result<ChargeRecord, StoreError> {
        let mut charge = self
            .get_charge(charge_id)
            .await?
            .ok_or_else(|| StoreError::not_found("charge", charge_id))?;

        if !expected.contains(&charge.state) {
            return Err(StoreError::StateMismatch {
                entity: "charge",
                id: charge_id.to_string(),
                actual: charge.state.to_string(),
            });
        }

        let current = charge.state;
        charge.state = next;
        if order_id.is_some() {
            charge.order_id = order_id;
        }
        charge.updated_at = Utc::now();

        let result = self
            .session
            .query_unpaged(
                "UPDATE charges SET state = ?, order_id = ?, payload = ? WHERE charge_id = ? IF state = ?",
                (
                    next.as_str().to_string(),
                    charge.order_id,
                    to_json(&charge)?,
                    charge_id.to_string(),
                    current.as_str().to_string(),
                ),
            )
            .await
            .backend()?;

        if was_applied(result)? {
            return Ok(charge);
        }

        // Lost the race: report what the winner left behind.
        let actual = self
            .get_charge(charge_id)
            .await?
            .map(|c| c.state.to_string())
            .unwrap_or_else(|| "MISSING".to_string());
        Err(StoreError::StateMismatch {
            entity: "charge",
            id: charge_id.to_string(),
            actual,
        })
    }

    async fn record_compensation(&self, record: &CompensationRecord) -> Result<(), StoreError> {
        self.session
            .query_unpaged(
                "INSERT INTO compensations (id, attempts, payload) VALUES (?, ?, ?)",
                (record.id, attempts_column(record.attempts)?, to_json(record)?),
            )
            .await
            .backend()?;
        Ok(())
    }

    async fn get_compensation(&self, id: Uuid) -> Result<Option<CompensationRecord>, StoreError> {
        Ok(self
            .json_row("SELECT payload FROM compensations WHERE id = ?", (id,))
            .await?)
    }

    async fn list_compensations(&self) -> Result<Vec<CompensationRecord>, StoreError> {
        let mut records: Vec<CompensationRecord> =
            self.json_rows("SELECT payload FROM compensations", ()).await?;
        records.sort_by_key(|r| (r.created_at, r.id));
        Ok(records)
    }

    async fn update_compensation(
        &self,
        record: &CompensationRecord,
        expected_attempts: u32,
    ) -> Result<(), StoreError> {
        let result = self
            .session
            .query_unpaged(
                "UPDATE compensations SET attempts = ?, payload = ? WHERE id = ? IF attempts = ?",
                (
                    attempts_column(record.attempts)?,
                    to_json(record)?,
                    record.id,
                    attempts_column(expected_attempts)?,
                ),
            )
            .await
            .backend()?;
        if was_applied(result)? {
            return Ok(());
        }

        match self.get_compensation(record.id).await? {
            None => Err(StoreError::not_found("compensation", record.id)),
            Some(stored) => Err(StoreError::Conflict {
                expected: i64::from(expected_attempts),
                actual: Some(i64::from(stored.attempts)),
            }),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

trait Backend<T> {
    fn backend(self) -> Result<T, StoreError>;
}

impl<T, E> Backend<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn backend(self) -> Result<T, StoreError> {
        self.map_err(|e| StoreError::Backend(e.into()))
    }
}

/// `[applied]` is the first column of every conditional statement's result.
fn was_applied(result: QueryResult) -> anyhow::Result<bool> {
    let rows = result
        .into_rows_result()
        .context("Conditional statement returned no rows")?;
    let applied = rows
        .maybe_first_row::<Row>()?
        .and_then(|row| row.columns.into_iter().next().flatten());
    Ok(matches!(applied, Some(CqlValue::Boolean(true))))
}

fn to_json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    serde_json::to_string(value).context("Failed to serialize row payload")
}

fn from_json<T: DeserializeOwned>(payload: &str) -> anyhow::Result<T> {
    serde_json::from_str(payload).context("Failed to deserialize row payload")
}

fn attempts_column(attempts: u32) -> anyhow::Result<i32> {
    i32::try_from(attempts).context("Compensation attempt counter out of range")
}

fn first_line(statement: &str) -> &str {
    statement.lines().next().unwrap_or(statement)
}
