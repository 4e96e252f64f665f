//! Persistence layer for the restaurant phone agent
//!
//! Provides storage for:
//! - Orders and reservations (one record per call)
//! - Conversation logs (written once when a call ends)
//! - Caller order history
//! - Admin listings and call statistics

pub mod client;
pub mod error;
pub mod memory;
pub mod orders;
pub mod query;
pub mod schema;

pub use client::{ScyllaClient, ScyllaConfig};
pub use error::PersistenceError;
pub use memory::InMemoryOrderRepository;
pub use orders::{OrderRepository, ScyllaOrderRepository};
pub use query::{CallStatistics, ConversationFilter, OrderFilter, Page, MAX_PAGE_LIMIT};

/// Connect to ScyllaDB, ensure the schema and return the order repository
pub async fn init(config: ScyllaConfig) -> Result<ScyllaOrderRepository, PersistenceError> {
    let client = ScyllaClient::connect(config).await?;
    client.ensure_schema().await?;
    Ok(ScyllaOrderRepository::new(client))
}
