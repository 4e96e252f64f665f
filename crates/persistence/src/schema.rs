//! ScyllaDB schema creation
//!
//! Timestamps are stored as epoch milliseconds in BIGINT columns.

use crate::error::PersistenceError;
use scylla::Session;

/// Create the keyspace if it doesn't exist
pub async fn create_keyspace(
    session: &Session,
    keyspace: &str,
    replication_factor: u8,
) -> Result<(), PersistenceError> {
    let query = format!(
        "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
        keyspace, replication_factor
    );

    session
        .query_unpaged(query, &[])
        .await
        .map_err(|e| PersistenceError::SchemaError(format!("Failed to create keyspace: {}", e)))?;

    Ok(())
}

/// Create all required tables
pub async fn create_tables(session: &Session, keyspace: &str) -> Result<(), PersistenceError> {
    // One order per call; the call id is the idempotency key
    let orders_table = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.orders_by_call (
            call_id TEXT,
            order_id UUID,
            customer_phone TEXT,
            customer_name TEXT,
            items_json TEXT,
            is_delivery BOOLEAN,
            delivery_address TEXT,
            reservation_time BIGINT,
            party_size INT,
            status TEXT,
            delivery_fee_cents BIGINT,
            total_cents BIGINT,
            created_at BIGINT,
            updated_at BIGINT,
            PRIMARY KEY (call_id)
        )
    "#,
        keyspace
    );

    session
        .query_unpaged(orders_table, &[])
        .await
        .map_err(|e| {
            PersistenceError::SchemaError(format!("Failed to create orders_by_call table: {}", e))
        })?;

    // Caller history index, newest first
    let phone_index = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.orders_by_phone (
            customer_phone TEXT,
            created_at BIGINT,
            call_id TEXT,
            PRIMARY KEY ((customer_phone), created_at, call_id)
        ) WITH CLUSTERING ORDER BY (created_at DESC, call_id ASC)
    "#,
        keyspace
    );

    session
        .query_unpaged(phone_index, &[])
        .await
        .map_err(|e| {
            PersistenceError::SchemaError(format!("Failed to create orders_by_phone table: {}", e))
        })?;

    let conversations_table = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {}.conversations (
            call_id TEXT,
            log_id UUID,
            customer_phone TEXT,
            turns_json TEXT,
            order_id UUID,
            status TEXT,
            duration_secs INT,
            sentiment FLOAT,
            started_at BIGINT,
            ended_at BIGINT,
            PRIMARY KEY (call_id)
        )
    "#,
        keyspace
    );

    session
        .query_unpaged(conversations_table, &[])
        .await
        .map_err(|e| {
            PersistenceError::SchemaError(format!("Failed to create conversations table: {}", e))
        })?;

    Ok(())
}
