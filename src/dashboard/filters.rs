//! Dashboard filters derived from widget result columns.

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::backend::QueryResult;
use crate::parameters::comparison_key;

const FILTER_SUFFIX: &str = "::filter";
const MULTI_FILTER_SUFFIX: &str = "::multi-filter";

/// A client-side filter over one result column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardFilter {
    /// Column name carrying the filter suffix
    pub name: String,
    pub friendly_name: String,
    pub multiple: bool,
    /// Distinct column values, in first-seen order
    pub values: Vec<Value>,
    /// Selected value (a sequence for multi filters)
    pub current: Value,
}

/// Collect the filters of every result, merging same-named columns.
///
/// `query` supplies selected values keyed by filter name; multi filters
/// decode a JSON array. Filters whose name or friendly name is listed in
/// `hidden` are dropped.
pub fn collect_dashboard_filters(
    results: &[QueryResult],
    query: &HashMap<String, String>,
    hidden: &[String],
) -> Vec<DashboardFilter> {
    let hidden: Vec<String> = hidden.iter().map(|h| comparison_key(h)).collect();
    let mut filters: Vec<DashboardFilter> = Vec::new();

    for result in results {
        for column in &result.data.columns {
            let (friendly, multiple) =
                if let Some(prefix) = column.name.strip_suffix(MULTI_FILTER_SUFFIX) {
                    (prefix, true)
                } else if let Some(prefix) = column.name.strip_suffix(FILTER_SUFFIX) {
                    (prefix, false)
                } else {
                    continue;
                };

            let index = match filters.iter().position(|f| f.name == column.name) {
                Some(index) => index,
                None => {
                    filters.push(DashboardFilter {
                        name: column.name.clone(),
                        friendly_name: column
                            .friendly_name
                            .clone()
                            .unwrap_or_else(|| friendly.to_string()),
                        multiple,
                        values: Vec::new(),
                        current: Value::Null,
                    });
                    filters.len() - 1
                }
            };

            let filter = &mut filters[index];
            for row in &result.data.rows {
                if let Some(value) = row.get(&column.name) {
                    if !filter.values.contains(value) {
                        filter.values.push(value.clone());
                    }
                }
            }
        }
    }

    filters.retain(|f| {
        !hidden.contains(&comparison_key(&f.name))
            && !hidden.contains(&comparison_key(&f.friendly_name))
    });
    for filter in &mut filters {
        filter.current = current_value(filter, query.get(&filter.name));
    }
    filters
}

fn current_value(filter: &DashboardFilter, raw: Option<&String>) -> Value {
    match (raw, filter.multiple) {
        (Some(raw), true) => match serde_json::from_str::<Value>(raw) {
            Ok(decoded @ Value::Array(_)) => decoded,
            _ => Value::Array(vec![Value::String(raw.clone())]),
        },
        (Some(raw), false) => Value::String(raw.clone()),
        (None, true) => Value::Array(Vec::new()),
        (None, false) => filter.values.first().cloned().unwrap_or(Value::Null),
    }
}
