//! Core types and traits for the restaurant phone agent
//!
//! This crate provides foundational types used across all other crates:
//! - Conversation types (turns, call status, intents)
//! - Order and reservation records
//! - Chat message types and the language-model seam
//! - Error types

pub mod conversation;
pub mod error;
pub mod llm_types;
pub mod order;
pub mod phone;
pub mod traits;

pub use conversation::{CallStatus, Intent, Speaker, Turn};
pub use error::{Error, Result};
pub use llm_types::{LlmError, Message, Role};
pub use order::{
    compute_total, format_cents, ConversationLog, LineItem, MenuPricing, OrderDraft, OrderRecord,
    OrderStatus,
};
pub use phone::normalize_phone_number;
pub use traits::LanguageModel;
