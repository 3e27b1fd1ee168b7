//! # Param Cascade
//!
//! Dependent dashboard parameters served over the Model Context Protocol.
//!
//! ## Features
//!
//! - **Dependency cascade**: editing a parameter reloads the options of every
//!   parameter that depends on it and selects their first option, transitively
//! - **Stale-response guard**: option loads that were superseded are discarded
//! - **URL state**: parameters round-trip through query strings, and
//!   `hide_filter` entries hide parameters from display
//! - **Entity-keyed dashboards**: an entity widget resolves an identifier
//!   that is injected into every other widget as an implicit filter
//! - **Query templates**: parameter values are validated against their
//!   definitions before rendering into query text
//! - **Saved sets**: parameter definitions persist in SQLite with versioned,
//!   conflict-checked saves
//!
//! ## Architecture
//!
//! ```text
//! MCP Client → MCP Server (Rust) → Query backend (HTTP)
//!                    ↓
//!              SQLite (saved sets)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use param_cascade::{Config, AppState, McpServer};
//! use param_cascade::backend::BackendClient;
//! use param_cascade::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let backend = BackendClient::new(&config.backend, config.request.clone())?;
//!     let state = Arc::new(AppState::new(config, storage, backend));
//!     McpServer::new(state).run().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Query backend client and dropdown sources.
pub mod backend;
/// Command-line subcommands for saved parameter sets.
pub mod cli;
/// Configuration management.
pub mod config;
/// Entity-keyed dashboard cascade and widgets.
pub mod dashboard;
/// Error types and result aliases for the application.
pub mod error;
/// Parameters, the dependency cascade, and query templates.
pub mod parameters;
/// MCP server implementation and request handling.
pub mod server;
/// SQLite storage for saved parameter sets.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use server::{AppState, McpServer, SharedState};
