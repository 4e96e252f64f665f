//! In-memory order repository, used when ScyllaDB is disabled and in tests

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use restaurant_agent_core::{ConversationLog, OrderRecord, OrderStatus};
use uuid::Uuid;

use crate::orders::{OrderRepository, HISTORY_LIMIT};
use crate::query::{
    list_conversations_newest_first, list_orders_newest_first, ConversationFilter, OrderFilter,
    Page,
};
use crate::PersistenceError;

#[derive(Default)]
pub struct InMemoryOrderRepository {
    orders: RwLock<HashMap<String, OrderRecord>>,
    conversations: RwLock<HashMap<String, ConversationLog>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_count(&self) -> usize {
        self.orders.read().len()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.read().len()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn save_order(&self, record: &OrderRecord) -> Result<Uuid, PersistenceError> {
        let mut orders = self.orders.write();
        let mut stored = record.clone();
        if let Some(existing) = orders.get(&record.call_id) {
            stored.order_id = existing.order_id;
            stored.created_at = existing.created_at;
        }
        stored.updated_at = Utc::now();
        let order_id = stored.order_id;
        orders.insert(record.call_id.clone(), stored);

        tracing::debug!(order_id = %order_id, call_id = %record.call_id, "Order saved in memory");
        Ok(order_id)
    }

    async fn save_conversation(
        &self,
        log: &ConversationLog,
        order_id: Option<Uuid>,
    ) -> Result<Uuid, PersistenceError> {
        let mut conversations = self.conversations.write();
        if let Some(existing) = conversations.get(&log.call_id) {
            return Ok(existing.log_id);
        }
        let stored = log.clone().with_order(order_id);
        let log_id = stored.log_id;
        conversations.insert(log.call_id.clone(), stored);
        Ok(log_id)
    }

    async fn get_order_history(&self, phone: &str) -> Result<Vec<OrderRecord>, PersistenceError> {
        let mut history: Vec<OrderRecord> = self
            .orders
            .read()
            .values()
            .filter(|order| order.customer_phone == phone)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        history.truncate(HISTORY_LIMIT as usize);
        Ok(history)
    }

    async fn get_order_for_call(
        &self,
        call_id: &str,
    ) -> Result<Option<OrderRecord>, PersistenceError> {
        Ok(self.orders.read().get(call_id).cloned())
    }

    async fn get_conversation(
        &self,
        call_id: &str,
    ) -> Result<Option<ConversationLog>, PersistenceError> {
        Ok(self.conversations.read().get(call_id).cloned())
    }

    async fn list_orders(
        &self,
        filter: &OrderFilter,
    ) -> Result<Page<OrderRecord>, PersistenceError> {
        Ok(list_orders_newest_first(self.orders.read().values(), filter))
    }

    async fn update_order_status(
        &self,
        call_id: &str,
        status: OrderStatus,
    ) -> Result<Option<OrderRecord>, PersistenceError> {
        let mut orders = self.orders.write();
        let Some(order) = orders.get_mut(call_id) else {
            return Ok(None);
        };
        order.status = status;
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }

    async fn list_conversations(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Page<ConversationLog>, PersistenceError> {
        Ok(list_conversations_newest_first(
            self.conversations.read().values(),
            filter,
        ))
    }
}
