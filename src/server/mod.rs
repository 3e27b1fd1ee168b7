//! Server module for MCP protocol handling.
//!
//! This module provides:
//! - MCP server implementation over stdio
//! - Tool call handlers and routing
//! - Shared application state: live parameter sets, dashboards and backends

mod handlers;
mod mcp;

pub use handlers::*;
pub use mcp::*;

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::backend::{BackendClient, DropdownBackend, QueryExecutor};
use crate::config::Config;
use crate::dashboard::DashboardCascade;
use crate::parameters::ParameterSetController;
use crate::storage::SqliteStorage;

/// Controller type used for live parameter sets.
pub type SetController = ParameterSetController<dyn DropdownBackend>;

/// A parameter set being edited.
pub struct ActiveSet {
    /// Display name.
    pub name: String,
    /// Stored version the edits are based on; 0 when never saved.
    pub version: i64,
    /// Live parameters.
    pub controller: Arc<SetController>,
}

/// Application state shared across handlers.
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// SQLite storage backend.
    pub storage: SqliteStorage,
    /// Dropdown option source.
    pub dropdowns: Arc<dyn DropdownBackend>,
    /// Widget query execution.
    pub executor: Arc<dyn QueryExecutor>,
    /// Live parameter sets by id.
    pub sets: RwLock<HashMap<String, ActiveSet>>,
    /// Dashboard cascades by dashboard id; each keeps its entity identifier
    /// between loads.
    pub dashboards: RwLock<HashMap<String, Arc<DashboardCascade>>>,
}

impl AppState {
    /// Create new application state backed by the HTTP client
    pub fn new(config: Config, storage: SqliteStorage, backend: BackendClient) -> Self {
        let backend = Arc::new(backend);
        Self::with_backends(config, storage, backend.clone(), backend)
    }

    /// Create application state over explicit backends
    pub fn with_backends(
        config: Config,
        storage: SqliteStorage,
        dropdowns: Arc<dyn DropdownBackend>,
        executor: Arc<dyn QueryExecutor>,
    ) -> Self {
        tracing::info!(
            backend = %config.backend.base_url,
            entity_query = %config.entity.query_name,
            "AppState initializing"
        );

        Self {
            config,
            storage,
            dropdowns,
            executor,
            sets: RwLock::new(HashMap::new()),
            dashboards: RwLock::new(HashMap::new()),
        }
    }

    /// Controller of the live set `id`, if defined
    pub async fn controller(&self, id: &str) -> Option<Arc<SetController>> {
        self.sets.read().await.get(id).map(|set| Arc::clone(&set.controller))
    }

    /// Cascade of the dashboard `id`, if it was loaded before
    pub async fn dashboard(&self, id: &str) -> Option<Arc<DashboardCascade>> {
        self.dashboards.read().await.get(id).cloned()
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;
