//! Dependent option loading and stale-response guarding.

use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::Parameter;
use crate::backend::{DropdownBackend, DropdownOption, DropdownParams};

impl Parameter {
    /// Parent values keyed by parent name, or `None` when there are none.
    ///
    /// Links without a name are skipped.
    pub fn child_query_params(&self) -> DropdownParams {
        let params: HashMap<String, Value> = self
            .parent_parameter
            .iter()
            .filter(|link| !link.name.is_empty())
            .map(|link| (link.name.clone(), link.value.clone()))
            .collect();

        if params.is_empty() {
            None
        } else {
            Some(params)
        }
    }

    /// Fetch this parameter's dropdown options.
    ///
    /// Nested under `parent_query_id` when set, top-level otherwise. Never
    /// fails: backend errors resolve to an empty list so a broken branch does
    /// not stop the rest of a cascade.
    pub async fn load_dropdown_values<B>(&self, backend: &B) -> Vec<DropdownOption>
    where
        B: DropdownBackend + ?Sized,
    {
        let Some(query_id) = self.query_id else {
            debug!(parameter = %self.name, "No dropdown query, skipping load");
            return Vec::new();
        };
        let params = self.child_query_params();

        let result = match self.parent_query_id {
            Some(parent_query_id) => {
                debug!(
                    parameter = %self.name,
                    parent_query_id,
                    dropdown_query_id = query_id,
                    "Loading nested dropdown"
                );
                backend
                    .fetch_associated_dropdown(parent_query_id, query_id, params)
                    .await
            }
            None => {
                debug!(parameter = %self.name, query_id, "Loading dropdown");
                backend.fetch_dropdown(query_id, params).await
            }
        };

        result.unwrap_or_else(|e| {
            warn!(
                parameter = %self.name,
                query_id,
                error = %e,
                "Dropdown load failed, using no options"
            );
            Vec::new()
        })
    }
}

/// Identity of one option request: the query it was issued for plus a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub query_id: Option<i64>,
    pub ticket: u64,
}

/// Tracks the current option request per parameter so late responses for an
/// outdated context can be recognised and dropped.
#[derive(Debug, Default)]
pub struct OptionRequestGuard {
    current: HashMap<String, RequestContext>,
    next_ticket: u64,
}

impl OptionRequestGuard {
    /// Create an empty guard
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a request for `name` and make it the current one.
    pub fn issue(&mut self, name: &str, query_id: Option<i64>) -> RequestContext {
        self.next_ticket += 1;
        let context = RequestContext {
            query_id,
            ticket: self.next_ticket,
        };
        self.current.insert(name.to_string(), context);
        context
    }

    /// Whether a response for `context` may still be applied to `name`,
    /// given the parameter's query id at response time.
    pub fn is_current(&self, name: &str, context: RequestContext, query_id: Option<i64>) -> bool {
        context.query_id == query_id && self.current.get(name) == Some(&context)
    }

    /// Invalidate any in-flight request for `name`.
    pub fn supersede(&mut self, name: &str) {
        self.issue(name, None);
    }

    /// Forget `name` entirely
    pub fn forget(&mut self, name: &str) {
        self.current.remove(name);
    }
}
