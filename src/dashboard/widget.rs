//! Dashboard widgets and the implicit filters injected into their queries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::backend::{ExecuteQueryRequest, QueryExecutor, QueryResult, QueryStatus};
use crate::error::BackendResult;
use crate::parameters::{comparison_key, Parameter};

/// Cache age allowed for non-forced loads, in seconds.
pub const DEFAULT_MAX_AGE_SECS: u64 = 86_400;

/// How a widget parameter gets its value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MappingType {
    /// Bound to a dashboard-wide parameter
    DashboardLevel,
    /// Set on the widget itself
    #[default]
    WidgetLevel,
    /// Fixed value
    StaticValue,
}

/// Binding of one query parameter to its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterMapping {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: MappingType,
    #[serde(default)]
    pub map_to: String,
}

/// Dashboard-scoped value pushed into a widget's parameters by role.
#[derive(Debug, Clone, PartialEq)]
pub struct ImplicitFilter {
    pub role: String,
    /// Fallback names/titles for parameters that declare no role.
    pub aliases: Vec<String>,
    /// `Value::Null` clears the target parameter.
    pub value: Value,
}

impl ImplicitFilter {
    /// Create a filter for `role` with fallback aliases
    pub fn new(role: impl Into<String>, aliases: &[String], value: Value) -> Self {
        Self {
            role: role.into(),
            aliases: aliases.to_vec(),
            value,
        }
    }

    /// Set the value on the parameter declaring this role, or failing that
    /// the first whose name or title matches an alias. Returns whether a
    /// parameter was found.
    pub fn apply(&self, parameters: &mut [Parameter]) -> bool {
        let by_role = parameters
            .iter()
            .position(|p| p.role.as_deref() == Some(self.role.as_str()));
        let index = by_role.or_else(|| {
            let aliases: Vec<String> = self.aliases.iter().map(|a| comparison_key(a)).collect();
            parameters.iter().position(|p| {
                aliases.contains(&comparison_key(&p.name))
                    || aliases.contains(&comparison_key(&p.title))
            })
        });

        match index {
            Some(index) => {
                parameters[index].set_value(self.value.clone());
                true
            }
            None => false,
        }
    }
}

/// Options of one widget load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WidgetLoadRequest {
    pub force_refresh: bool,
    pub implicit_filters: Vec<ImplicitFilter>,
}

impl WidgetLoadRequest {
    /// A load with no implicit filters
    pub fn new(force_refresh: bool) -> Self {
        Self {
            force_refresh,
            implicit_filters: Vec::new(),
        }
    }

    /// Add an implicit filter
    pub fn with_filter(mut self, filter: ImplicitFilter) -> Self {
        self.implicit_filters.push(filter);
        self
    }
}

/// A dashboard widget backed by a query.
#[async_trait]
pub trait Widget: Send + Sync {
    /// Widget id
    fn id(&self) -> i64;

    /// Name of the widget's query, if it has one
    fn query_name(&self) -> Option<String>;

    /// How the widget's parameters are bound
    fn parameter_mappings(&self) -> Vec<ParameterMapping>;

    /// Execute the widget's query. A query that ran and failed is not an
    /// error; its failure is recorded in the result.
    async fn load(&self, request: WidgetLoadRequest) -> BackendResult<()>;

    /// Latest result, if the widget has loaded
    async fn query_result(&self) -> Option<QueryResult>;
}

/// Widget whose query runs through a [`QueryExecutor`].
pub struct QueryWidget<E: ?Sized> {
    id: i64,
    query_id: i64,
    query_name: String,
    mappings: Vec<ParameterMapping>,
    parameters: Mutex<Vec<Parameter>>,
    result: Mutex<Option<QueryResult>>,
    generation: AtomicU64,
    max_age: u64,
    executor: Arc<E>,
}

impl<E: QueryExecutor + ?Sized> QueryWidget<E> {
    /// Create a widget for query `query_id`
    pub fn new(
        id: i64,
        query_id: i64,
        query_name: impl Into<String>,
        parameters: Vec<Parameter>,
        executor: Arc<E>,
    ) -> Self {
        Self {
            id,
            query_id,
            query_name: query_name.into(),
            mappings: Vec::new(),
            parameters: Mutex::new(parameters),
            result: Mutex::new(None),
            generation: AtomicU64::new(0),
            max_age: DEFAULT_MAX_AGE_SECS,
            executor,
        }
    }

    /// Set the parameter mappings
    pub fn with_mappings(mut self, mappings: Vec<ParameterMapping>) -> Self {
        self.mappings = mappings;
        self
    }

    /// Set the cache age allowed for non-forced loads
    pub fn with_max_age(mut self, max_age: u64) -> Self {
        self.max_age = max_age;
        self
    }

    /// Current parameters of the widget's query
    pub async fn parameters(&self) -> Vec<Parameter> {
        self.parameters.lock().await.clone()
    }
}

#[async_trait]
impl<E: QueryExecutor + ?Sized> Widget for QueryWidget<E> {
    fn id(&self) -> i64 {
        self.id
    }

    fn query_name(&self) -> Option<String> {
        Some(self.query_name.clone())
    }

    fn parameter_mappings(&self) -> Vec<ParameterMapping> {
        self.mappings.clone()
    }

    async fn load(&self, request: WidgetLoadRequest) -> BackendResult<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let values: HashMap<String, Value> = {
            let mut parameters = self.parameters.lock().await;
            for filter in &request.implicit_filters {
                if !filter.apply(&mut parameters) {
                    debug!(
                        widget = self.id,
                        role = %filter.role,
                        "No parameter accepts implicit filter"
                    );
                }
            }
            parameters
                .iter()
                .map(|p| (p.name.clone(), p.execution_value(false)))
                .collect()
        };

        let max_age = if request.force_refresh { 0 } else { self.max_age };
        let result = self
            .executor
            .execute_query(
                self.query_id,
                ExecuteQueryRequest {
                    parameters: values,
                    max_age,
                },
            )
            .await?;

        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(widget = self.id, generation, "Dropping superseded widget result");
            return Ok(());
        }
        if result.status == QueryStatus::Failed {
            warn!(
                widget = self.id,
                query_id = self.query_id,
                error = result.error.as_deref().unwrap_or_default(),
                "Widget query failed"
            );
        }
        *self.result.lock().await = Some(result);
        Ok(())
    }

    async fn query_result(&self) -> Option<QueryResult> {
        self.result.lock().await.clone()
    }
}
