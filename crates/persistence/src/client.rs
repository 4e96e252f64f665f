//! ScyllaDB session for the order and conversation tables

use std::sync::Arc;
use std::time::Duration;

use restaurant_agent_config::PersistenceConfig;
use scylla::{Session, SessionBuilder};

use crate::error::PersistenceError;
use crate::schema;

/// Where the order tables live
#[derive(Debug, Clone, PartialEq)]
pub struct ScyllaConfig {
    pub hosts: Vec<String>,
    pub keyspace: String,
    pub replication_factor: u8,
    pub connect_timeout: Duration,
}

impl From<&PersistenceConfig> for ScyllaConfig {
    fn from(config: &PersistenceConfig) -> Self {
        Self {
            hosts: config.scylla_hosts.clone(),
            keyspace: config.keyspace.clone(),
            replication_factor: config.replication_factor.max(1),
            connect_timeout: config.connect_timeout(),
        }
    }
}

/// Shared session plus the keyspace every query is qualified with
#[derive(Clone)]
pub struct ScyllaClient {
    session: Arc<Session>,
    keyspace: String,
    replication_factor: u8,
}

impl ScyllaClient {
    pub async fn connect(config: ScyllaConfig) -> Result<Self, PersistenceError> {
        if config.hosts.is_empty() {
            return Err(PersistenceError::Connection(
                "No ScyllaDB hosts configured".to_string(),
            ));
        }
        tracing::info!(
            hosts = ?config.hosts,
            keyspace = %config.keyspace,
            timeout_ms = config.connect_timeout.as_millis() as u64,
            "Connecting to ScyllaDB"
        );

        let session = SessionBuilder::new()
            .known_nodes(&config.hosts)
            .connection_timeout(config.connect_timeout)
            .build()
            .await?;

        Ok(Self {
            session: Arc::new(session),
            keyspace: config.keyspace,
            replication_factor: config.replication_factor,
        })
    }

    /// Create the keyspace and the order, phone-index and conversation tables
    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        schema::create_keyspace(&self.session, &self.keyspace, self.replication_factor).await?;
        schema::create_tables(&self.session, &self.keyspace).await?;
        tracing::info!(keyspace = %self.keyspace, "Order schema ready");
        Ok(())
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_settings() {
        let settings = PersistenceConfig {
            enabled: true,
            scylla_hosts: vec!["10.0.0.5:9042".to_string(), "10.0.0.6:9042".to_string()],
            keyspace: "orders_test".to_string(),
            replication_factor: 0,
            connect_timeout_ms: 2_500,
        };
        let config = ScyllaConfig::from(&settings);
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.keyspace, "orders_test");
        assert_eq!(config.replication_factor, 1);
        assert_eq!(config.connect_timeout, Duration::from_millis(2_500));
    }

    #[tokio::test]
    async fn test_connect_without_hosts_fails_fast() {
        let settings = PersistenceConfig {
            scylla_hosts: Vec::new(),
            ..PersistenceConfig::default()
        };
        let result = ScyllaClient::connect(ScyllaConfig::from(&settings)).await;
        assert!(matches!(result, Err(PersistenceError::Connection(_))));
    }
}
