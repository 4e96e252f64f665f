//! Admin read models: filters, pages and call statistics

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use restaurant_agent_core::{CallStatus, ConversationLog, OrderRecord, OrderStatus, Speaker};
use serde::Serialize;

/// Default and maximum page size for admin listings
pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 100;

/// Order listing filter. Dates bound `created_at`, both ends inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for OrderFilter {
    fn default() -> Self {
        Self {
            status: None,
            from: None,
            to: None,
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl OrderFilter {
    pub fn matches(&self, order: &OrderRecord) -> bool {
        self.status.map_or(true, |s| order.status == s)
            && in_range(order.created_at, self.from, self.to)
    }
}

/// Conversation listing filter. Dates bound `started_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub sentiment_min: Option<f32>,
    pub sentiment_max: Option<f32>,
    pub offset: usize,
    pub limit: usize,
}

impl Default for ConversationFilter {
    fn default() -> Self {
        Self {
            from: None,
            to: None,
            sentiment_min: None,
            sentiment_max: None,
            offset: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl ConversationFilter {
    /// Everything started inside the window, unpaged
    pub fn window(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            limit: usize::MAX,
            ..Self::default()
        }
    }

    /// A sentiment bound excludes logs that were never scored
    pub fn matches(&self, log: &ConversationLog) -> bool {
        if !in_range(log.started_at, self.from, self.to) {
            return false;
        }
        if self.sentiment_min.is_none() && self.sentiment_max.is_none() {
            return true;
        }
        let Some(score) = log.sentiment else {
            return false;
        };
        self.sentiment_min.map_or(true, |min| score >= min)
            && self.sentiment_max.map_or(true, |max| score <= max)
    }
}

fn in_range(at: DateTime<Utc>, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> bool {
    from.map_or(true, |from| at >= from) && to.map_or(true, |to| at <= to)
}

/// One page of a newest-first listing
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub items: Vec<T>,
}

impl<T> Page<T> {
    /// Cut a page out of the full, already ordered match list
    pub fn slice(matched: Vec<T>, offset: usize, limit: usize) -> Self {
        let total = matched.len();
        let items = matched.into_iter().skip(offset).take(limit).collect();
        Self {
            total,
            offset,
            limit,
            items,
        }
    }
}

pub fn list_orders_newest_first<'a>(
    orders: impl IntoIterator<Item = &'a OrderRecord>,
    filter: &OrderFilter,
) -> Page<OrderRecord> {
    let mut matched: Vec<OrderRecord> = orders
        .into_iter()
        .filter(|o| filter.matches(o))
        .cloned()
        .collect();
    matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Page::slice(matched, filter.offset, filter.limit)
}

pub fn list_conversations_newest_first<'a>(
    logs: impl IntoIterator<Item = &'a ConversationLog>,
    filter: &ConversationFilter,
) -> Page<ConversationLog> {
    let mut matched: Vec<ConversationLog> = logs
        .into_iter()
        .filter(|l| filter.matches(l))
        .cloned()
        .collect();
    matched.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Page::slice(matched, filter.offset, filter.limit)
}

/// Agent performance over a time window
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallStatistics {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub total_conversations: usize,
    pub completed_conversations: usize,
    pub transferred_conversations: usize,
    /// Percent of conversations that ended without a transfer
    pub completion_rate: f64,
    pub orders_created: usize,
    /// Percent of conversations that produced an order
    pub conversion_rate: f64,
    pub avg_sentiment: f64,
    pub avg_duration_secs: f64,
    /// Caller intents across every logged turn
    pub intent_distribution: BTreeMap<String, usize>,
}

impl CallStatistics {
    pub fn from_logs(logs: &[ConversationLog], from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        let total = logs.len();
        let completed = logs.iter().filter(|l| l.status == CallStatus::Completed).count();
        let transferred = logs.iter().filter(|l| l.status == CallStatus::Transferred).count();
        let orders = logs.iter().filter(|l| l.order_id.is_some()).count();

        let mut intents = BTreeMap::new();
        for turn in logs.iter().flat_map(|l| &l.turns) {
            if turn.speaker != Speaker::Caller {
                continue;
            }
            if let Some(intent) = turn.intent {
                *intents.entry(intent.as_str().to_string()).or_insert(0) += 1;
            }
        }

        Self {
            from,
            to,
            total_conversations: total,
            completed_conversations: completed,
            transferred_conversations: transferred,
            completion_rate: percent(completed, total),
            orders_created: orders,
            conversion_rate: percent(orders, total),
            avg_sentiment: mean(logs.iter().filter_map(|l| l.sentiment.map(f64::from))),
            avg_duration_secs: mean(logs.iter().filter_map(|l| l.duration_secs.map(f64::from))),
            intent_distribution: intents,
        }
    }
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
