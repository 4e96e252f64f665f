//! Order, reservation and conversation-log records

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::{CallStatus, Intent, Turn};

/// Unit price lookup for menu items, in minor currency units
pub trait MenuPricing: Send + Sync {
    fn unit_price_cents(&self, item_name: &str) -> u64;
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Confirmed,
    Modified,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Modified => "modified",
            Self::Cancelled => "cancelled",
        }
    }

    /// Status an ordering intent writes, if any
    pub fn from_intent(intent: Intent) -> Option<Self> {
        match intent {
            Intent::NewOrder => Some(Self::Confirmed),
            Intent::ModifyOrder => Some(Self::Modified),
            Intent::CancelOrder => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Still expected to be fulfilled
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Modified)
    }
}

impl FromStr for OrderStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "confirmed" => Ok(Self::Confirmed),
            "modified" => Ok(Self::Modified),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(crate::Error::UnknownStatus(other.to_string())),
        }
    }
}

/// One ordered menu item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub name: String,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_instructions: Option<String>,
}

impl LineItem {
    pub fn new(name: impl Into<String>, quantity: u32) -> Self {
        Self {
            name: name.into(),
            quantity,
            special_instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.special_instructions = Some(instructions.into());
        self
    }
}

/// Sum of unit price times quantity. Unknown items use the pricing default.
pub fn compute_total(items: &[LineItem], pricing: &dyn MenuPricing) -> u64 {
    items
        .iter()
        .map(|item| pricing.unit_price_cents(&item.name) * u64::from(item.quantity))
        .sum()
}

/// Structured data pulled from a conversation.
///
/// Every optional field stays `None` unless the caller stated it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderDraft {
    pub customer_name: Option<String>,
    pub items: Vec<LineItem>,
    pub is_delivery: bool,
    pub address: Option<String>,
    pub reservation_time: Option<DateTime<Utc>>,
    pub party_size: Option<u32>,
    /// Extraction output could not be parsed; every other field is empty
    pub parsing_failed: bool,
}

impl OrderDraft {
    pub fn failed() -> Self {
        Self {
            parsing_failed: true,
            ..Default::default()
        }
    }

    /// Worth persisting: at least one item or a reservation time
    pub fn has_content(&self) -> bool {
        !self.parsing_failed && (!self.items.is_empty() || self.reservation_time.is_some())
    }

    pub fn into_record(
        self,
        call_id: &str,
        customer_phone: &str,
        status: OrderStatus,
        pricing: &dyn MenuPricing,
        delivery_fee_cents: u64,
    ) -> OrderRecord {
        OrderRecord::from_draft(call_id, customer_phone, self, status, pricing, delivery_fee_cents)
    }
}

/// Persisted order or reservation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: Uuid,
    /// Idempotency key: one record per call
    pub call_id: String,
    pub customer_phone: String,
    pub customer_name: Option<String>,
    pub items: Vec<LineItem>,
    pub is_delivery: bool,
    pub delivery_address: Option<String>,
    pub reservation_time: Option<DateTime<Utc>>,
    pub party_size: Option<u32>,
    pub status: OrderStatus,
    pub delivery_fee_cents: u64,
    pub total_cents: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderRecord {
    /// Price a draft. The total is always derived here, never carried over.
    pub fn from_draft(
        call_id: &str,
        customer_phone: &str,
        draft: OrderDraft,
        status: OrderStatus,
        pricing: &dyn MenuPricing,
        delivery_fee_cents: u64,
    ) -> Self {
        let now = Utc::now();
        let fee = if draft.is_delivery { delivery_fee_cents } else { 0 };
        let total_cents = compute_total(&draft.items, pricing) + fee;
        Self {
            order_id: Uuid::new_v4(),
            call_id: call_id.to_string(),
            customer_phone: customer_phone.to_string(),
            customer_name: draft.customer_name,
            items: draft.items,
            is_delivery: draft.is_delivery,
            delivery_address: draft.address,
            reservation_time: draft.reservation_time,
            party_size: draft.party_size,
            status,
            delivery_fee_cents: fee,
            total_cents,
            created_at: now,
            updated_at: now,
        }
    }

    /// One-line description used as order context in prompts
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if !self.items.is_empty() {
            let items = self
                .items
                .iter()
                .map(|i| format!("{}x {}", i.quantity, i.name))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("items: {}", items));
        }
        if self.is_delivery {
            match &self.delivery_address {
                Some(addr) => parts.push(format!("delivery to {}", addr)),
                None => parts.push("delivery".to_string()),
            }
        }
        if let Some(time) = self.reservation_time {
            let size = self
                .party_size
                .map(|n| format!(" for {}", n))
                .unwrap_or_default();
            parts.push(format!("reservation at {}{}", time.format("%Y-%m-%d %H:%M"), size));
        }
        parts.push(format!("total {}", format_cents(self.total_cents)));
        parts.push(format!("status {}", self.status.as_str()));
        parts.join("; ")
    }
}

/// Full record of one call, written once when the call ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationLog {
    pub log_id: Uuid,
    /// Idempotency key: one log per call
    pub call_id: String,
    pub customer_phone: String,
    pub turns: Vec<Turn>,
    pub order_id: Option<Uuid>,
    pub status: CallStatus,
    pub duration_secs: Option<u32>,
    /// In `[-1, 1]`
    pub sentiment: Option<f32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl ConversationLog {
    pub fn new(
        call_id: &str,
        customer_phone: &str,
        turns: Vec<Turn>,
        status: CallStatus,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            log_id: Uuid::new_v4(),
            call_id: call_id.to_string(),
            customer_phone: customer_phone.to_string(),
            turns,
            order_id: None,
            status,
            duration_secs: None,
            sentiment: None,
            started_at,
            ended_at: Utc::now(),
        }
    }

    pub fn with_order(mut self, order_id: Option<Uuid>) -> Self {
        self.order_id = order_id;
        self
    }

    pub fn with_duration(mut self, duration_secs: Option<u32>) -> Self {
        self.duration_secs = duration_secs;
        self
    }

    pub fn with_sentiment(mut self, sentiment: Option<f32>) -> Self {
        self.sentiment = sentiment.map(|s| s.clamp(-1.0, 1.0));
        self
    }
}

/// Format minor units as dollars, e.g. `1600` -> `$16.00`
pub fn format_cents(cents: u64) -> String {
    format!("${}.{:02}", cents / 100, cents % 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_status_parse() {
        assert_eq!("Cancelled".parse::<OrderStatus>().unwrap(), OrderStatus::Cancelled);
        assert_eq!(" modified ".parse::<OrderStatus>().unwrap(), OrderStatus::Modified);
        assert!(matches!(
            "shipped".parse::<OrderStatus>(),
            Err(crate::Error::UnknownStatus(s)) if s == "shipped"
        ));
    }

    struct FlatPricing;

    impl MenuPricing for FlatPricing {
        fn unit_price_cents(&self, item_name: &str) -> u64 {
            match item_name.to_lowercase().as_str() {
                "margherita pizza" => 1600,
                "tiramisu" => 800,
                _ => 1000,
            }
        }
    }

    #[test]
    fn test_compute_total() {
        let items = vec![LineItem::new("Margherita Pizza", 1), LineItem::new("Tiramisu", 1)];
        assert_eq!(compute_total(&items, &FlatPricing), 2400);
        assert_eq!(compute_total(&[LineItem::new("mystery item", 2)], &FlatPricing), 2000);
        assert_eq!(compute_total(&[], &FlatPricing), 0);
    }

    #[test]
    fn test_record_adds_delivery_fee_only_for_delivery() {
        let draft = OrderDraft {
            items: vec![LineItem::new("Tiramisu", 2)],
            is_delivery: true,
            ..Default::default()
        };
        let record =
            OrderRecord::from_draft("CA1", "+15551234567", draft, OrderStatus::Confirmed, &FlatPricing, 300);
        assert_eq!(record.total_cents, 1900);
        assert_eq!(record.delivery_fee_cents, 300);

        let pickup = OrderDraft {
            items: vec![LineItem::new("Tiramisu", 2)],
            ..Default::default()
        };
        let record =
            OrderRecord::from_draft("CA2", "+15551234567", pickup, OrderStatus::Confirmed, &FlatPricing, 300);
        assert_eq!(record.total_cents, 1600);
    }

    #[test]
    fn test_draft_content() {
        assert!(!OrderDraft::default().has_content());
        assert!(!OrderDraft::failed().has_content());
        let draft = OrderDraft {
            reservation_time: Some(Utc::now()),
            party_size: Some(6),
            ..Default::default()
        };
        assert!(draft.has_content());
    }

    #[test]
    fn test_status_from_intent() {
        assert_eq!(OrderStatus::from_intent(Intent::NewOrder), Some(OrderStatus::Confirmed));
        assert_eq!(OrderStatus::from_intent(Intent::CancelOrder), Some(OrderStatus::Cancelled));
        assert_eq!(OrderStatus::from_intent(Intent::CheckStatus), None);
        assert!(!OrderStatus::Cancelled.is_open());
    }

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(1600), "$16.00");
        assert_eq!(format_cents(305), "$3.05");
        assert_eq!(format_cents(0), "$0.00");
    }

    #[test]
    fn test_sentiment_is_clamped() {
        let log = ConversationLog::new("CA1", "+1555", vec![], CallStatus::Completed, Utc::now())
            .with_sentiment(Some(3.5));
        assert_eq!(log.sentiment, Some(1.0));
    }
}
