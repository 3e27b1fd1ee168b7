use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// One dropdown choice: a display name and the value it selects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawOption")]
pub struct DropdownOption {
    pub name: Value,
    pub value: Value,
}

/// Wire shape of a dropdown option; bare scalars stand for themselves.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawOption {
    Pair {
        #[serde(default)]
        name: Option<Value>,
        value: Value,
    },
    Bare(Value),
}

impl From<RawOption> for DropdownOption {
    fn from(raw: RawOption) -> Self {
        match raw {
            RawOption::Pair { name, value } => Self {
                name: name.unwrap_or_else(|| value.clone()),
                value,
            },
            RawOption::Bare(value) => Self {
                name: value.clone(),
                value,
            },
        }
    }
}

impl DropdownOption {
    /// Create an option with a display name and value
    pub fn new(name: impl Into<Value>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Body of a dropdown fetch request
#[derive(Debug, Clone, Serialize)]
pub struct DropdownRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<HashMap<String, Value>>,
}

/// Body of a query execution request
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteQueryRequest {
    pub parameters: HashMap<String, Value>,
    /// Maximum cached result age in seconds; 0 forces a fresh execution.
    pub max_age: u64,
}

/// Execution status of a query result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Done,
    Failed,
    #[default]
    Pending,
}

/// Column metadata of a query result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub column_type: Option<String>,
}

/// Tabular payload of a query result
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResultData {
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,
}

/// Result of executing a widget's query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub status: QueryStatus,
    #[serde(default)]
    pub data: QueryResultData,
    /// Backend-provided error text when `status` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryResult {
    /// A completed result
    pub fn done(data: QueryResultData) -> Self {
        Self {
            status: QueryStatus::Done,
            data,
            error: None,
        }
    }

    /// A failed result carrying the backend error text
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: QueryStatus::Failed,
            data: QueryResultData::default(),
            error: Some(error.into()),
        }
    }

    /// First row of a completed result
    pub fn first_row(&self) -> Option<&Map<String, Value>> {
        match self.status {
            QueryStatus::Done => self.data.rows.first(),
            _ => None,
        }
    }
}

/// Response of `POST /api/queries/{id}/results`
#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteQueryResponse {
    #[serde(default)]
    pub query_result: Option<QueryResultPayload>,
    #[serde(default)]
    pub job: Option<Job>,
}

/// Stored query result as returned by the backend
#[derive(Debug, Clone, Deserialize)]
pub struct QueryResultPayload {
    #[serde(default)]
    pub id: Option<i64>,
    pub data: QueryResultData,
}

/// Asynchronous execution job
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub status: u8,
    #[serde(default)]
    pub error: Option<String>,
}

/// Job status code for a failed execution.
const JOB_FAILED: u8 = 4;

impl From<ExecuteQueryResponse> for QueryResult {
    fn from(response: ExecuteQueryResponse) -> Self {
        if let Some(payload) = response.query_result {
            return QueryResult::done(payload.data);
        }
        match response.job {
            Some(job) if job.status == JOB_FAILED => QueryResult::failed(
                job.error
                    .unwrap_or_else(|| "Query execution failed".to_string()),
            ),
            _ => QueryResult::default(),
        }
    }
}

/// Dashboard update sent to the backend
#[derive(Debug, Clone, Serialize)]
pub struct SaveDashboardRequest {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(flatten)]
    pub changes: Map<String, Value>,
}

/// Dashboard as returned after a save
#[derive(Debug, Clone, Deserialize)]
pub struct SavedDashboard {
    pub id: i64,
    #[serde(default)]
    pub version: Option<i64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Turn dropdown query rows into options.
///
/// Uses the `name` and `value` columns when present (case-insensitive),
/// otherwise the first column for both. Values are always strings.
pub fn pluck_dropdown_options(data: &QueryResultData) -> Vec<DropdownOption> {
    let Some(first_column) = data.columns.first().map(|c| c.name.to_lowercase()) else {
        return Vec::new();
    };

    data.rows
        .iter()
        .map(|row| {
            let row: HashMap<String, &Value> =
                row.iter().map(|(k, v)| (k.to_lowercase(), v)).collect();
            let name_column = if row.contains_key("name") {
                "name"
            } else {
                first_column.as_str()
            };
            let value_column = if row.contains_key("value") {
                "value"
            } else {
                first_column.as_str()
            };

            let name = row.get(name_column).map(|v| (*v).clone()).unwrap_or(Value::Null);
            let value = row
                .get(value_column)
                .map(|v| Value::String(value_text(v)))
                .unwrap_or(Value::Null);
            DropdownOption { name, value }
        })
        .collect()
}

/// Plain text of a JSON value: strings without quotes, null as empty.
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
