//! Application State
//!
//! Shared state across all handlers.

use std::sync::Arc;

use restaurant_agent_config::Settings;
use restaurant_agent_core::LanguageModel;
use restaurant_agent_dialogue::CallEngine;
use restaurant_agent_persistence::{InMemoryOrderRepository, OrderRepository};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub engine: Arc<CallEngine>,
    pub repository: Arc<dyn OrderRepository>,
}

impl AppState {
    /// State with an in-memory order repository
    pub fn new(config: Settings, model: Arc<dyn LanguageModel>) -> Self {
        Self::with_repository(config, model, Arc::new(InMemoryOrderRepository::new()))
    }

    /// State backed by the given repository (e.g. ScyllaDB)
    pub fn with_repository(
        config: Settings,
        model: Arc<dyn LanguageModel>,
        repository: Arc<dyn OrderRepository>,
    ) -> Self {
        let engine = Arc::new(CallEngine::new(&config, model, Arc::clone(&repository)));
        Self {
            config: Arc::new(config),
            engine,
            repository,
        }
    }
}
