//! Value model for a single dashboard/query parameter.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::backend::value_text;

/// Default prefix of parameter keys in URL query strings.
pub const DEFAULT_URL_PREFIX: &str = "p_";

/// Kind of parameter. Only [`ParameterType::DependentFilters`] cascades.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParameterType {
    #[default]
    Text,
    TextPattern,
    Number,
    Enum,
    Query,
    DependentFilters,
    Date,
    DatetimeLocal,
    DatetimeWithSeconds,
    DateRange,
    DatetimeRange,
    DatetimeRangeWithSeconds,
}

impl ParameterType {
    /// Whether the value is a `{start, end}` range
    pub fn is_range(&self) -> bool {
        matches!(
            self,
            ParameterType::DateRange
                | ParameterType::DatetimeRange
                | ParameterType::DatetimeRangeWithSeconds
        )
    }

    /// Whether the value is a single date or datetime
    pub fn is_date(&self) -> bool {
        matches!(
            self,
            ParameterType::Date | ParameterType::DatetimeLocal | ParameterType::DatetimeWithSeconds
        )
    }
}

/// Link from a parameter to one parameter it depends on, with the last-known
/// value of that parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentLink {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

impl ParentLink {
    /// Link to `name` with no known value yet
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Value::Null,
        }
    }
}

/// Multi-select serialization settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiValuesOptions {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    #[serde(default = "default_separator")]
    pub separator: String,
}

impl Default for MultiValuesOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            suffix: String::new(),
            separator: default_separator(),
        }
    }
}

fn default_separator() -> String {
    ",".to_string()
}

fn default_url_prefix() -> String {
    DEFAULT_URL_PREFIX.to_string()
}

/// Persistable form of a parameter, as stored in query/dashboard definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterDefinition {
    pub name: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type", default)]
    pub kind: ParameterType,
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "parent_parameter", default)]
    pub parent_parameter: Option<Vec<ParentLink>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_values_options: Option<MultiValuesOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_query_id: Option<i64>,
    /// Newline-separated choices of an `enum` parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_options: Option<String>,
    /// Pattern of a `text-pattern` parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
    /// Declared implicit-filter role (e.g. `entity_id`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hidden: bool,
    #[serde(default = "default_url_prefix")]
    pub url_prefix: String,
}

impl ParameterDefinition {
    /// Minimal definition of a given name and type
    pub fn new(name: impl Into<String>, kind: ParameterType) -> Self {
        let name = name.into();
        Self {
            title: name.clone(),
            name,
            kind,
            value: Value::Null,
            parent_parameter: None,
            multi_values_options: None,
            query_id: None,
            parent_query_id: None,
            enum_options: None,
            regex: None,
            role: None,
            hidden: false,
            url_prefix: default_url_prefix(),
        }
    }
}

/// A live parameter: its definition plus applied and pending values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ParameterDefinition", into = "ParameterDefinition")]
pub struct Parameter {
    pub name: String,
    pub title: String,
    pub kind: ParameterType,
    value: Value,
    /// `None` while nothing is pending; `Some(Value::Null)` is a pending clear.
    pending_value: Option<Value>,
    pub parent_parameter: Vec<ParentLink>,
    pub multi_values_options: Option<MultiValuesOptions>,
    pub query_id: Option<i64>,
    pub parent_query_id: Option<i64>,
    pub enum_options: Option<String>,
    pub regex: Option<String>,
    pub role: Option<String>,
    pub hidden: bool,
    pub url_prefix: String,
}

impl From<ParameterDefinition> for Parameter {
    fn from(def: ParameterDefinition) -> Self {
        let mut parameter = Self {
            name: def.name,
            title: def.title,
            kind: def.kind,
            value: Value::Null,
            pending_value: None,
            parent_parameter: def.parent_parameter.unwrap_or_default(),
            multi_values_options: def.multi_values_options,
            query_id: def.query_id,
            parent_query_id: def.parent_query_id,
            enum_options: def.enum_options,
            regex: def.regex,
            role: def.role,
            hidden: def.hidden,
            url_prefix: def.url_prefix,
        };
        parameter.set_value(def.value);
        parameter
    }
}

impl From<Parameter> for ParameterDefinition {
    fn from(parameter: Parameter) -> Self {
        parameter.to_saveable_object()
    }
}

impl Parameter {
    /// Create a parameter from its definition
    pub fn new(definition: ParameterDefinition) -> Self {
        definition.into()
    }

    /// Applied value
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Pending value, if one was set
    pub fn pending_value(&self) -> Option<&Value> {
        self.pending_value.as_ref()
    }

    /// Pending value when one differs from the applied value, else the applied value
    pub fn effective_value(&self) -> &Value {
        match &self.pending_value {
            Some(pending) if self.has_pending_value() => pending,
            _ => &self.value,
        }
    }

    /// Whether this parameter selects a sequence of values
    pub fn is_multi(&self) -> bool {
        self.multi_values_options.is_some()
    }

    /// Whether the parameter depends on at least one other parameter
    pub fn has_parents(&self) -> bool {
        !self.parent_parameter.is_empty()
    }

    /// Whether `name` is one of this parameter's parents
    pub fn depends_on(&self, name: &str) -> bool {
        self.parent_parameter.iter().any(|link| link.name == name)
    }

    /// Normalize a raw value for storage.
    ///
    /// Null, empty strings and empty sequences become null; empty strings
    /// are dropped from sequences. Multi-value parameters wrap scalars into a
    /// one-element sequence; single-value parameters unwrap a sequence to its
    /// first element. Number parameters coerce numeric text.
    pub fn normalize_value(&self, raw: &Value) -> Value {
        let value = match raw {
            Value::Null => return Value::Null,
            Value::String(text) if text.is_empty() => return Value::Null,
            Value::Array(items) => {
                let items: Vec<Value> = items.iter().filter(|v| !is_blank(v)).cloned().collect();
                match items.first() {
                    None => return Value::Null,
                    Some(first) if !self.is_multi() => return self.normalize_value(first),
                    Some(_) => Value::Array(items),
                }
            }
            scalar if self.is_multi() => Value::Array(vec![scalar.clone()]),
            scalar => scalar.clone(),
        };

        if self.kind == ParameterType::Number {
            return coerce_number(&value);
        }
        value
    }

    /// Replace the applied value with a normalized one
    pub fn set_value(&mut self, raw: Value) -> &mut Self {
        self.value = self.normalize_value(&raw);
        self
    }

    /// Value as sent to query execution.
    ///
    /// With `join_list_values`, a sequence renders as `prefix+v+suffix` per
    /// element joined by the separator (default `,`).
    pub fn execution_value(&self, join_list_values: bool) -> Value {
        match &self.value {
            Value::Array(items) if join_list_values => {
                let options = self.multi_values_options.clone().unwrap_or_default();
                let separator = if self.multi_values_options.is_some() {
                    options.separator.as_str()
                } else {
                    ","
                };
                let joined = items
                    .iter()
                    .map(|v| format!("{}{}{}", options.prefix, value_text(v), options.suffix))
                    .collect::<Vec<_>>()
                    .join(separator);
                Value::String(joined)
            }
            other => other.clone(),
        }
    }

    /// Whether the parameter carries no value
    pub fn is_empty(&self) -> bool {
        is_blank(&self.value)
    }

    /// URL query key of this parameter
    pub fn url_key(&self) -> String {
        format!("{}{}", self.url_prefix, self.name)
    }

    /// Serialize to URL query parameters; an empty parameter maps to `None`.
    pub fn to_url_params(&self) -> BTreeMap<String, Option<String>> {
        let encoded = if self.is_empty() {
            None
        } else {
            match &self.value {
                Value::Array(_) if self.is_multi() => serde_json::to_string(&self.value).ok(),
                scalar => Some(value_text(scalar)),
            }
        };

        let mut params = BTreeMap::new();
        params.insert(self.url_key(), encoded);
        params
    }

    /// Read the applied value back from URL query parameters.
    ///
    /// Multi-value parameters decode a JSON array, falling back to the raw
    /// string as a single value. Absent keys leave the value untouched.
    pub fn from_url_params(&mut self, query: &HashMap<String, String>) -> &mut Self {
        let Some(raw) = query.get(&self.url_key()) else {
            return self;
        };

        let value = if self.is_multi() {
            match serde_json::from_str::<Value>(raw) {
                Ok(decoded @ Value::Array(_)) => decoded,
                _ => Value::String(raw.clone()),
            }
        } else {
            Value::String(raw.clone())
        };
        self.set_value(value)
    }

    /// Whether a pending value differs from the applied value
    pub fn has_pending_value(&self) -> bool {
        matches!(&self.pending_value, Some(pending) if *pending != self.value)
    }

    /// Record a tentatively edited value
    pub fn set_pending_value(&mut self, raw: Value) -> &mut Self {
        self.pending_value = Some(self.normalize_value(&raw));
        self
    }

    /// Drop any pending value
    pub fn clear_pending_value(&mut self) -> &mut Self {
        self.pending_value = None;
        self
    }

    /// Commit the pending value, if any, and clear it
    pub fn apply_pending_value(&mut self) -> &mut Self {
        if self.has_pending_value() {
            if let Some(pending) = self.pending_value.take() {
                self.value = pending;
            }
        }
        self.clear_pending_value()
    }

    /// Record the latest value of parent `parent`; returns false if not linked.
    pub fn update_parent_value(&mut self, parent: &str, value: Value) -> bool {
        match self.parent_parameter.iter_mut().find(|link| link.name == parent) {
            Some(link) => {
                link.value = value;
                true
            }
            None => false,
        }
    }

    /// Persistable snapshot of the definition and applied value
    pub fn to_saveable_object(&self) -> ParameterDefinition {
        ParameterDefinition {
            name: self.name.clone(),
            title: self.title.clone(),
            kind: self.kind,
            value: self.value.clone(),
            parent_parameter: Some(self.parent_parameter.clone()),
            multi_values_options: self.multi_values_options.clone(),
            query_id: self.query_id,
            parent_query_id: self.parent_query_id,
            enum_options: self.enum_options.clone(),
            regex: self.regex.clone(),
            role: self.role.clone(),
            hidden: self.hidden,
            url_prefix: self.url_prefix.clone(),
        }
    }
}

/// Null or an empty string
fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

/// Numbers stay numbers, numeric text becomes a number, anything else null.
fn coerce_number(value: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                Value::from(i)
            } else {
                trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(coerce_number).collect()),
        _ => Value::Null,
    }
}
