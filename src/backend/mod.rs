//! Query backend access.
//!
//! This module provides:
//! - The [`DropdownBackend`] and [`QueryExecutor`] seams the core depends on
//! - An HTTP [`BackendClient`] implementing both
//! - [`QueryDropdownSource`], which derives dropdowns from raw query results

mod client;
mod types;

#[cfg(test)]
#[path = "types_tests.rs"]
mod types_tests;

pub use client::BackendClient;
pub use types::*;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::BackendResult;

/// Parameters sent along with a dropdown fetch, keyed by parent name.
pub type DropdownParams = Option<HashMap<String, Value>>;

/// Source of dropdown options for query-backed parameters.
///
/// Implementations may fail; callers in the cascade convert failures into
/// empty option lists.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DropdownBackend: Send + Sync {
    /// Options of a dropdown query scoped under a parent query.
    async fn fetch_associated_dropdown(
        &self,
        query_id: i64,
        dropdown_query_id: i64,
        parameters: DropdownParams,
    ) -> BackendResult<Vec<DropdownOption>>;

    /// Options of a top-level dropdown query.
    async fn fetch_dropdown(
        &self,
        id: i64,
        parameters: DropdownParams,
    ) -> BackendResult<Vec<DropdownOption>>;
}

/// Executes a saved query with parameter values.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run query `query_id` and return its result.
    async fn execute_query(
        &self,
        query_id: i64,
        request: ExecuteQueryRequest,
    ) -> BackendResult<QueryResult>;
}

/// Dropdown backend that executes the dropdown query itself and plucks
/// `{name, value}` pairs from the rows.
///
/// Parent values are passed to the dropdown query as its parameters. In
/// nested mode the dropdown query is still the one executed; the parent query
/// only scopes the lookup.
pub struct QueryDropdownSource<E: ?Sized> {
    executor: Arc<E>,
}

impl<E: QueryExecutor + ?Sized> QueryDropdownSource<E> {
    /// Wrap an executor
    pub fn new(executor: Arc<E>) -> Self {
        Self { executor }
    }

    async fn run(
        &self,
        query_id: i64,
        parameters: DropdownParams,
    ) -> BackendResult<Vec<DropdownOption>> {
        let request = ExecuteQueryRequest {
            parameters: parameters.unwrap_or_default(),
            max_age: 0,
        };
        let result = self.executor.execute_query(query_id, request).await?;
        debug!(query_id, rows = result.data.rows.len(), "Dropdown query executed");
        Ok(pluck_dropdown_options(&result.data))
    }
}

#[async_trait]
impl<E: QueryExecutor + ?Sized> DropdownBackend for QueryDropdownSource<E> {
    async fn fetch_associated_dropdown(
        &self,
        _query_id: i64,
        dropdown_query_id: i64,
        parameters: DropdownParams,
    ) -> BackendResult<Vec<DropdownOption>> {
        self.run(dropdown_query_id, parameters).await
    }

    async fn fetch_dropdown(
        &self,
        id: i64,
        parameters: DropdownParams,
    ) -> BackendResult<Vec<DropdownOption>> {
        self.run(id, parameters).await
    }
}
