//! Order and conversation-log persistence using ScyllaDB

use crate::query::{
    list_conversations_newest_first, list_orders_newest_first, CallStatistics,
    ConversationFilter, OrderFilter, Page,
};
use crate::{PersistenceError, ScyllaClient};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use restaurant_agent_core::{CallStatus, ConversationLog, LineItem, OrderRecord, OrderStatus, Turn};
use uuid::Uuid;

/// How many past orders a caller lookup returns
pub const HISTORY_LIMIT: i32 = 20;

/// Order and conversation store.
///
/// Writes are keyed by call id and safe to retry: a second `save_order` for
/// the same call updates the existing record and returns its id, and a
/// second `save_conversation` is a no-op returning the first log's id.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    async fn save_order(&self, record: &OrderRecord) -> Result<Uuid, PersistenceError>;

    async fn save_conversation(
        &self,
        log: &ConversationLog,
        order_id: Option<Uuid>,
    ) -> Result<Uuid, PersistenceError>;

    /// Newest first
    async fn get_order_history(&self, phone: &str) -> Result<Vec<OrderRecord>, PersistenceError>;

    async fn get_order_for_call(&self, call_id: &str)
        -> Result<Option<OrderRecord>, PersistenceError>;

    async fn get_conversation(
        &self,
        call_id: &str,
    ) -> Result<Option<ConversationLog>, PersistenceError>;

    /// Newest first
    async fn list_orders(&self, filter: &OrderFilter)
        -> Result<Page<OrderRecord>, PersistenceError>;

    /// Set the status of the call's order. `None` if the call has no order.
    async fn update_order_status(
        &self,
        call_id: &str,
        status: OrderStatus,
    ) -> Result<Option<OrderRecord>, PersistenceError>;

    /// Newest first
    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Page<ConversationLog>, PersistenceError>;

    async fn call_statistics(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<CallStatistics, PersistenceError> {
        let logs = self
            .list_conversations(&ConversationFilter::window(from, to))
            .await?
            .items;
        Ok(CallStatistics::from_logs(&logs, from, to))
    }
}

/// ScyllaDB implementation of the order repository
#[derive(Clone)]
pub struct ScyllaOrderRepository {
    client: ScyllaClient,
}

type OrderRow = (
    String,
    Uuid,
    String,
    Option<String>,
    String,
    bool,
    Option<String>,
    Option<i64>,
    Option<i32>,
    String,
    i64,
    i64,
    i64,
    i64,
);

type ConversationRow = (
    String,
    Uuid,
    String,
    String,
    Option<Uuid>,
    String,
    Option<i32>,
    Option<f32>,
    i64,
    i64,
);

impl ScyllaOrderRepository {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    async fn existing_order_key(
        &self,
        call_id: &str,
    ) -> Result<Option<(Uuid, i64)>, PersistenceError> {
        let query = format!(
            "SELECT order_id, created_at FROM {}.orders_by_call WHERE call_id = ?",
            self.client.keyspace()
        );
        let result = self.client.session().query_unpaged(query, (call_id,)).await?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                let key: (Uuid, i64) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    async fn existing_log_id(&self, call_id: &str) -> Result<Option<Uuid>, PersistenceError> {
        let query = format!(
            "SELECT log_id FROM {}.conversations WHERE call_id = ?",
            self.client.keyspace()
        );
        let result = self.client.session().query_unpaged(query, (call_id,)).await?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                let (log_id,): (Uuid,) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                return Ok(Some(log_id));
            }
        }
        Ok(None)
    }

    /// Every stored order. Admin listings only; this is a full table scan.
    async fn scan_orders(&self) -> Result<Vec<OrderRecord>, PersistenceError> {
        let query = format!(
            "SELECT call_id, order_id, customer_phone, customer_name, items_json,
                    is_delivery, delivery_address, reservation_time, party_size, status,
                    delivery_fee_cents, total_cents, created_at, updated_at
             FROM {}.orders_by_call",
            self.client.keyspace()
        );
        let result = self.client.session().query_unpaged(query, &[]).await?;
        result
            .rows
            .unwrap_or_default()
            .into_iter()
            .map(|row| self.row_to_order(row))
            .collect()
    }

    /// Every stored conversation log. Admin listings only.
    async fn scan_conversations(&self) -> Result<Vec<ConversationLog>, PersistenceError> {
        let query = format!(
            "SELECT call_id, log_id, customer_phone, turns_json, order_id,
                    status, duration_secs, sentiment, started_at, ended_at
             FROM {}.conversations",
            self.client.keyspace()
        );
        let result = self.client.session().query_unpaged(query, &[]).await?;
        result
            .rows
            .unwrap_or_default()
            .into_iter()
            .map(|row| self.row_to_conversation(row))
            .collect()
    }

    fn row_to_order(
        &self,
        row: scylla::frame::response::result::Row,
    ) -> Result<OrderRecord, PersistenceError> {
        let (
            call_id,
            order_id,
            customer_phone,
            customer_name,
            items_json,
            is_delivery,
            delivery_address,
            reservation_time,
            party_size,
            status,
            delivery_fee_cents,
            total_cents,
            created_at,
            updated_at,
        ): OrderRow = row
            .into_typed()
            .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;

        let items: Vec<LineItem> = serde_json::from_str(&items_json)?;

        Ok(OrderRecord {
            order_id,
            call_id,
            customer_phone,
            customer_name,
            items,
            is_delivery,
            delivery_address,
            reservation_time: reservation_time.map(millis_to_datetime).transpose()?,
            party_size: party_size.map(|n| n.max(0) as u32),
            status: status
                .parse::<OrderStatus>()
                .map_err(|e| PersistenceError::InvalidData(e.to_string()))?,
            delivery_fee_cents: delivery_fee_cents.max(0) as u64,
            total_cents: total_cents.max(0) as u64,
            created_at: millis_to_datetime(created_at)?,
            updated_at: millis_to_datetime(updated_at)?,
        })
    }

    fn row_to_conversation(
        &self,
        row: scylla::frame::response::result::Row,
    ) -> Result<ConversationLog, PersistenceError> {
        let (
            call_id,
            log_id,
            customer_phone,
            turns_json,
            order_id,
            status,
            duration_secs,
            sentiment,
            started_at,
            ended_at,
        ): ConversationRow = row
            .into_typed()
            .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;

        let turns: Vec<Turn> = serde_json::from_str(&turns_json)?;

        Ok(ConversationLog {
            log_id,
            call_id,
            customer_phone,
            turns,
            order_id,
            status: status
                .parse::<CallStatus>()
                .map_err(|e| PersistenceError::InvalidData(e.to_string()))?,
            duration_secs: duration_secs.map(|d| d.max(0) as u32),
            sentiment,
            started_at: millis_to_datetime(started_at)?,
            ended_at: millis_to_datetime(ended_at)?,
        })
    }
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, PersistenceError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| PersistenceError::InvalidData(format!("Invalid timestamp: {}", millis)))
}

#[async_trait]
impl OrderRepository for ScyllaOrderRepository {
    async fn save_order(&self, record: &OrderRecord) -> Result<Uuid, PersistenceError> {
        let (order_id, created_at) = match self.existing_order_key(&record.call_id).await? {
            Some(existing) => existing,
            None => (record.order_id, record.created_at.timestamp_millis()),
        };

        let items_json = serde_json::to_string(&record.items)?;
        let query = format!(
            "INSERT INTO {}.orders_by_call (
                call_id, order_id, customer_phone, customer_name, items_json,
                is_delivery, delivery_address, reservation_time, party_size, status,
                delivery_fee_cents, total_cents, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace()
        );

        self.client
            .session()
            .query_unpaged(
                query,
                (
                    &record.call_id,
                    order_id,
                    &record.customer_phone,
                    &record.customer_name,
                    items_json,
                    record.is_delivery,
                    &record.delivery_address,
                    record.reservation_time.map(|t| t.timestamp_millis()),
                    record.party_size.map(|n| n as i32),
                    record.status.as_str(),
                    record.delivery_fee_cents as i64,
                    record.total_cents as i64,
                    created_at,
                    Utc::now().timestamp_millis(),
                ),
            )
            .await?;

        let index = format!(
            "INSERT INTO {}.orders_by_phone (customer_phone, created_at, call_id) VALUES (?, ?, ?)",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(index, (&record.customer_phone, created_at, &record.call_id))
            .await?;

        tracing::info!(
            order_id = %order_id,
            call_id = %record.call_id,
            status = record.status.as_str(),
            total_cents = record.total_cents,
            "Order saved to ScyllaDB"
        );

        Ok(order_id)
    }

    async fn save_conversation(
        &self,
        log: &ConversationLog,
        order_id: Option<Uuid>,
    ) -> Result<Uuid, PersistenceError> {
        if let Some(existing) = self.existing_log_id(&log.call_id).await? {
            tracing::debug!(call_id = %log.call_id, "Conversation log already saved");
            return Ok(existing);
        }

        let turns_json = serde_json::to_string(&log.turns)?;
        let query = format!(
            "INSERT INTO {}.conversations (
                call_id, log_id, customer_phone, turns_json, order_id,
                status, duration_secs, sentiment, started_at, ended_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) IF NOT EXISTS",
            self.client.keyspace()
        );

        self.client
            .session()
            .query_unpaged(
                query,
                (
                    &log.call_id,
                    log.log_id,
                    &log.customer_phone,
                    turns_json,
                    order_id,
                    log.status.as_str(),
                    log.duration_secs.map(|d| d as i32),
                    log.sentiment,
                    log.started_at.timestamp_millis(),
                    log.ended_at.timestamp_millis(),
                ),
            )
            .await?;

        // A concurrent writer may have won the conditional insert
        let log_id = self.existing_log_id(&log.call_id).await?.unwrap_or(log.log_id);

        tracing::info!(
            log_id = %log_id,
            call_id = %log.call_id,
            turns = log.turns.len(),
            "Conversation log saved to ScyllaDB"
        );

        Ok(log_id)
    }

    async fn get_order_history(&self, phone: &str) -> Result<Vec<OrderRecord>, PersistenceError> {
        let query = format!(
            "SELECT call_id FROM {}.orders_by_phone WHERE customer_phone = ? LIMIT ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (phone, HISTORY_LIMIT))
            .await?;

        let mut call_ids = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (call_id,): (String,) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                call_ids.push(call_id);
            }
        }

        let mut orders = Vec::with_capacity(call_ids.len());
        for call_id in call_ids {
            if let Some(order) = self.get_order_for_call(&call_id).await? {
                orders.push(order);
            }
        }
        Ok(orders)
    }

    async fn get_order_for_call(
        &self,
        call_id: &str,
    ) -> Result<Option<OrderRecord>, PersistenceError> {
        let query = format!(
            "SELECT call_id, order_id, customer_phone, customer_name, items_json,
                    is_delivery, delivery_address, reservation_time, party_size, status,
                    delivery_fee_cents, total_cents, created_at, updated_at
             FROM {}.orders_by_call WHERE call_id = ?",
            self.client.keyspace()
        );
        let result = self.client.session().query_unpaged(query, (call_id,)).await?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                return Ok(Some(self.row_to_order(row)?));
            }
        }
        Ok(None)
    }

    async fn get_conversation(
        &self,
        call_id: &str,
    ) -> Result<Option<ConversationLog>, PersistenceError> {
        let query = format!(
            "SELECT call_id, log_id, customer_phone, turns_json, order_id,
                    status, duration_secs, sentiment, started_at, ended_at
             FROM {}.conversations WHERE call_id = ?",
            self.client.keyspace()
        );
        let result = self.client.session().query_unpaged(query, (call_id,)).await?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                return Ok(Some(self.row_to_conversation(row)?));
            }
        }
        Ok(None)
    }

    async fn list_orders(
        &self,
        filter: &OrderFilter,
    ) -> Result<Page<OrderRecord>, PersistenceError> {
        let orders = self.scan_orders().await?;
        Ok(list_orders_newest_first(&orders, filter))
    }

    async fn update_order_status(
        &self,
        call_id: &str,
        status: OrderStatus,
    ) -> Result<Option<OrderRecord>, PersistenceError> {
        let Some(mut order) = self.get_order_for_call(call_id).await? else {
            return Ok(None);
        };
        let updated_at = Utc::now();
        let query = format!(
            "UPDATE {}.orders_by_call SET status = ?, updated_at = ? WHERE call_id = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(query, (status.as_str(), updated_at.timestamp_millis(), call_id))
            .await?;

        tracing::info!(call_id, status = status.as_str(), "Order status updated in ScyllaDB");
        order.status = status;
        order.updated_at = updated_at;
        Ok(Some(order))
    }

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Page<ConversationLog>, PersistenceError> {
        let logs = self.scan_conversations().await?;
        Ok(list_conversations_newest_first(&logs, filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_round_trip() {
        let now = Utc::now();
        let restored = millis_to_datetime(now.timestamp_millis()).unwrap();
        assert_eq!(restored.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_invalid_millis_is_rejected() {
        assert!(matches!(
            millis_to_datetime(i64::MAX),
            Err(PersistenceError::InvalidData(_))
        ));
    }
}
