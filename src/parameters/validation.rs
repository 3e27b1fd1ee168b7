//! Parameter value validation and query template rendering.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;
use tracing::warn;

use super::{ParameterDefinition, ParameterType};
use crate::backend::{value_text, DropdownBackend};
use crate::error::ValidationError;

/// Whether `pattern` compiles as a regular expression.
pub fn validate_pattern(pattern: &str) -> bool {
    Regex::new(pattern).is_ok()
}

fn mustache_tag() -> &'static Regex {
    static TAG: OnceLock<Regex> = OnceLock::new();
    TAG.get_or_init(|| Regex::new(r"\{\{\s*([#^/]?)\s*(.*?)\s*\}\}").expect("static pattern"))
}

/// Render `{{ name }}` placeholders; unknown names are left in place.
pub fn render_template(template: &str, context: &HashMap<String, Value>) -> String {
    mustache_tag()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[2];
            match context.get(key) {
                Some(value) if caps[1].is_empty() => value_text(value),
                _ => caps[0].to_string(),
            }
        })
        .trim()
        .to_string()
}

/// Join list values per the matching definition's multi-value options.
pub fn join_parameter_list_values(
    parameters: &HashMap<String, Value>,
    schema: &[ParameterDefinition],
) -> HashMap<String, Value> {
    parameters
        .iter()
        .map(|(key, value)| {
            let joined = match value {
                Value::Array(items) => {
                    let options = schema
                        .iter()
                        .find(|def| def.name == *key)
                        .and_then(|def| def.multi_values_options.clone())
                        .unwrap_or_default();
                    let separator = if options.separator.is_empty() {
                        ","
                    } else {
                        options.separator.as_str()
                    };
                    Value::String(
                        items
                            .iter()
                            .map(|v| {
                                format!("{}{}{}", options.prefix, value_text(v), options.suffix)
                            })
                            .collect::<Vec<_>>()
                            .join(separator),
                    )
                }
                other => other.clone(),
            };
            (key.clone(), joined)
        })
        .collect()
}

/// A query template bound to its parameter schema.
#[derive(Debug, Clone)]
pub struct ParameterizedQuery {
    template: String,
    schema: Vec<ParameterDefinition>,
    query: String,
    parameters: HashMap<String, Value>,
}

impl ParameterizedQuery {
    /// Create from a template and its parameter definitions
    pub fn new(template: impl Into<String>, schema: Vec<ParameterDefinition>) -> Self {
        let template = template.into();
        Self {
            query: template.clone(),
            template,
            schema,
            parameters: HashMap::new(),
        }
    }

    /// Validate `values` and render the query with them.
    ///
    /// Fails listing every invalid name; on failure nothing is applied.
    pub async fn apply<B>(
        &mut self,
        values: HashMap<String, Value>,
        backend: &B,
    ) -> Result<&mut Self, ValidationError>
    where
        B: DropdownBackend + ?Sized,
    {
        let mut invalid = Vec::new();
        for (name, value) in &values {
            if !self.is_valid(name, value, backend).await {
                invalid.push(name.clone());
            }
        }

        if !invalid.is_empty() {
            invalid.sort();
            return Err(ValidationError::InvalidParameters { names: invalid });
        }

        self.parameters.extend(values);
        let context = join_parameter_list_values(&self.parameters, &self.schema);
        self.query = render_template(&self.template, &context);
        Ok(self)
    }

    async fn is_valid<B>(&self, name: &str, value: &Value, backend: &B) -> bool
    where
        B: DropdownBackend + ?Sized,
    {
        if self.schema.is_empty() {
            return true;
        }
        let Some(def) = self.schema.iter().find(|d| d.name == name) else {
            return false;
        };
        let allow_list = def.multi_values_options.is_some();

        match def.kind {
            ParameterType::Text => value.is_string(),
            ParameterType::TextPattern => matches_pattern(value, def.regex.as_deref()),
            ParameterType::Number => is_number(value),
            ParameterType::Enum => {
                let options: Vec<String> = def
                    .enum_options
                    .as_deref()
                    .map(|o| o.split('\n').map(String::from).collect())
                    .unwrap_or_default();
                is_within_options(value, &options, allow_list)
            }
            ParameterType::Query => {
                let Some(query_id) = def.query_id else {
                    return false;
                };
                match backend.fetch_dropdown(query_id, None).await {
                    Ok(options) => {
                        let options: Vec<String> =
                            options.iter().map(|o| value_text(&o.value)).collect();
                        is_within_options(value, &options, allow_list)
                    }
                    Err(e) => {
                        warn!(
                            parameter = %name,
                            error = %e,
                            "Could not load options for validation"
                        );
                        false
                    }
                }
            }
            ParameterType::DependentFilters => true,
            ParameterType::Date
            | ParameterType::DatetimeLocal
            | ParameterType::DatetimeWithSeconds => value.as_str().is_some_and(is_date),
            ParameterType::DateRange
            | ParameterType::DatetimeRange
            | ParameterType::DatetimeRangeWithSeconds => is_date_range(value),
        }
    }

    /// Template keys with no supplied value
    pub fn missing_params(&self) -> BTreeSet<String> {
        let supplied = parameter_names(&self.parameters);
        template_keys(&self.template)
            .into_iter()
            .filter(|key| !supplied.contains(key))
            .collect()
    }

    /// Whether the query takes no free-text parameters
    pub fn is_safe(&self) -> bool {
        !self.schema.iter().any(|def| def.kind == ParameterType::Text)
    }

    /// Rendered query text
    pub fn text(&self) -> &str {
        &self.query
    }
}

/// Distinct keys referenced by the template, sections included.
fn template_keys(template: &str) -> BTreeSet<String> {
    mustache_tag()
        .captures_iter(template)
        .filter(|caps| &caps[1] != "/")
        .map(|caps| caps[2].to_string())
        .collect()
}

/// Supplied names, with object values expanded to `key.inner`.
fn parameter_names(parameters: &HashMap<String, Value>) -> BTreeSet<String> {
    parameters
        .iter()
        .flat_map(|(key, value)| match value {
            Value::Object(map) => map.keys().map(|inner| format!("{}.{}", key, inner)).collect(),
            _ => vec![key.clone()],
        })
        .collect()
}

fn matches_pattern(value: &Value, pattern: Option<&str>) -> bool {
    let (Some(text), Some(pattern)) = (value.as_str(), pattern) else {
        return false;
    };
    Regex::new(&format!("^(?:{})$", pattern))
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

fn is_number(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(s) => s.trim().parse::<f64>().is_ok(),
        _ => false,
    }
}

fn is_within_options(value: &Value, options: &[String], allow_list: bool) -> bool {
    match value {
        Value::Array(items) => {
            allow_list && items.iter().all(|v| options.contains(&value_text(v)))
        }
        other => options.contains(&value_text(other)),
    }
}

fn is_date(text: &str) -> bool {
    let text = text.trim();
    DateTime::parse_from_rfc3339(text).is_ok()
        || ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"]
            .iter()
            .any(|fmt| NaiveDateTime::parse_from_str(text, fmt).is_ok())
        || NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
}

fn is_date_range(value: &Value) -> bool {
    let Value::Object(range) = value else {
        return false;
    };
    ["start", "end"]
        .iter()
        .all(|key| range.get(*key).and_then(Value::as_str).is_some_and(is_date))
}
