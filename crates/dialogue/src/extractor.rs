//! Order and reservation extraction
//!
//! The model returns a JSON payload; parsing is lenient about shape and
//! strict about content. Any field the conversation does not back up is
//! dropped, so a misbehaving model cannot invent a name, address, or
//! party size.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use restaurant_agent_config::{RestaurantProfile, ORDER_PARSER_PROMPT};
use restaurant_agent_core::{LanguageModel, LineItem, OrderDraft, Speaker, Turn};
use restaurant_agent_llm::RetryPolicy;
use serde_json::Value;

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%dT%H:%M:%SZ",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

const NUMBER_WORDS: &[&str] = &[
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
    "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen",
    "nineteen", "twenty",
];

const TIME_WORDS: &[&str] = &[
    "today", "tonight", "tomorrow", "noon", "midnight", "am", "pm", "oclock", "morning",
    "afternoon", "evening", "lunch", "dinner", "monday", "tuesday", "wednesday", "thursday",
    "friday", "saturday", "sunday", "weekend",
];

pub struct OrderExtractor {
    model: Arc<dyn LanguageModel>,
    retry: RetryPolicy,
    profile: Arc<RestaurantProfile>,
}

impl OrderExtractor {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        retry: RetryPolicy,
        profile: Arc<RestaurantProfile>,
    ) -> Self {
        Self {
            model,
            retry,
            profile,
        }
    }

    /// Extract a draft from the full call history. Never fails: unusable
    /// model output comes back as [`OrderDraft::failed`].
    pub async fn extract(&self, history: &[Turn]) -> OrderDraft {
        if history.is_empty() {
            return OrderDraft::default();
        }
        let conversation = render_conversation(history);

        let result = self
            .retry
            .run("extract", || {
                self.model
                    .extract_structured(ORDER_PARSER_PROMPT, &conversation)
            })
            .await;

        match result {
            Ok(raw) => {
                let draft = parse_payload(&raw, history, &self.profile);
                if draft.parsing_failed {
                    tracing::warn!(payload_len = raw.len(), "Order payload could not be parsed");
                    metrics::counter!(
                        "restaurant_agent_llm_failures_total",
                        "operation" => "extract_parse"
                    )
                    .increment(1);
                }
                draft
            },
            Err(e) => {
                tracing::error!(error = %e, "Order extraction failed");
                metrics::counter!(
                    "restaurant_agent_llm_failures_total",
                    "operation" => "extract"
                )
                .increment(1);
                OrderDraft::failed()
            },
        }
    }

    /// Item subtotal in cents, priced from the menu
    pub fn compute_total(&self, items: &[LineItem]) -> u64 {
        restaurant_agent_core::compute_total(items, self.profile.as_ref())
    }
}

/// Transcript text as sent to the model
pub fn render_conversation(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|turn| {
            let who = match turn.speaker {
                Speaker::Caller => "Customer",
                Speaker::Assistant => "Assistant",
            };
            format!("{}: {}", who, turn.text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse a date or datetime in one of the accepted formats, as UTC
pub fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(text, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

/// Turn a raw model payload into a draft backed by `history`.
///
/// Menu names from `menu` are accepted on a partial mention ("the
/// margherita"); anything else must be spelled out in full.
pub fn parse_payload(raw: &str, history: &[Turn], menu: &RestaurantProfile) -> OrderDraft {
    let value: Value = match serde_json::from_str(strip_code_fence(raw)) {
        Ok(value @ Value::Object(_)) => value,
        _ => return OrderDraft::failed(),
    };

    let caller_text = history
        .iter()
        .filter(|t| t.is_caller())
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let all_text = history
        .iter()
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let caller_words = words(&caller_text);
    let all_words = words(&all_text);

    let customer_name = string_field(&value, "customer_name")
        .filter(|name| all_words_present(name, &caller_words));

    let is_delivery = value
        .get("is_delivery")
        .map(truthy)
        .unwrap_or(false)
        && caller_text.to_lowercase().contains("deliver");

    let address = string_field(&value, "address")
        .filter(|addr| all_words_present(addr, &caller_words));

    let reservation_time = string_field(&value, "reservation_time")
        .and_then(|text| parse_datetime(&text))
        .filter(|_| mentions_time(&caller_words));

    let party_size = value
        .get("party_size")
        .and_then(positive_int)
        .filter(|size| mentions_number(*size, &all_words));

    let items = value
        .get("order_items")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| parse_item(entry, &all_words, menu))
                .collect()
        })
        .unwrap_or_default();

    OrderDraft {
        customer_name,
        items,
        is_delivery,
        address,
        reservation_time,
        party_size,
        parsing_failed: false,
    }
}

fn parse_item(
    entry: &Value,
    history_words: &HashSet<String>,
    menu: &RestaurantProfile,
) -> Option<LineItem> {
    let (name, quantity, instructions) = match entry {
        Value::String(name) => (name.trim().to_string(), 1, None),
        Value::Object(_) => {
            let name = string_field(entry, "item").or_else(|| string_field(entry, "name"))?;
            // An unstated quantity means one
            let quantity = entry
                .get("quantity")
                .and_then(positive_int)
                .filter(|n| *n == 1 || mentions_number(*n, history_words))
                .unwrap_or(1);
            let instructions = string_field(entry, "special_instructions")
                .filter(|text| any_word_present(text, history_words));
            (name, quantity, instructions)
        },
        _ => return None,
    };

    if name.is_empty() {
        return None;
    }
    let mentioned = if menu.find_item(&name).is_some() {
        any_word_present(&name, history_words)
    } else {
        all_words_present(&name, history_words)
    };
    if !mentioned {
        return None;
    }

    let mut item = LineItem::new(name, quantity);
    if let Some(text) = instructions {
        item = item.with_instructions(text);
    }
    Some(item)
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().trim_end_matches("```").trim()
}

/// Non-blank string value; JSON null and empty strings are absent
fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("null"))
        .map(str::to_string)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes"),
        _ => false,
    }
}

/// Integer from a number or numeric string, floored at 1
fn positive_int(value: &Value) -> Option<u32> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !n.is_finite() {
        return None;
    }
    Some(n.round().clamp(1.0, u32::MAX as f64) as u32)
}

fn words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .replace('\'', "")
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

fn all_words_present(text: &str, known: &HashSet<String>) -> bool {
    let needed = words(text);
    !needed.is_empty() && needed.iter().all(|w| known.contains(w))
}

fn any_word_present(text: &str, known: &HashSet<String>) -> bool {
    words(text).iter().any(|w| known.contains(w))
}

fn mentions_number(n: u32, known: &HashSet<String>) -> bool {
    known.contains(&n.to_string())
        || NUMBER_WORDS
            .get(n as usize)
            .is_some_and(|word| known.contains(*word))
}

fn mentions_time(known: &HashSet<String>) -> bool {
    known
        .iter()
        .any(|w| w.chars().any(|c| c.is_ascii_digit()) || TIME_WORDS.contains(&w.as_str()))
}
