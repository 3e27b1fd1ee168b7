//! Unit tests for backend wire types.
//!
//! Covers dropdown option decoding, query result conversion and
//! dropdown plucking from raw query rows.

use super::*;
use serde_json::{json, Map, Value};

fn data(columns: &[&str], rows: Value) -> QueryResultData {
    QueryResultData {
        columns: columns
            .iter()
            .map(|name| Column {
                name: name.to_string(),
                friendly_name: None,
                column_type: None,
            })
            .collect(),
        rows: serde_json::from_value(rows).unwrap(),
    }
}

// DropdownOption tests
#[test]
fn test_dropdown_option_from_pair() {
    let option: DropdownOption =
        serde_json::from_value(json!({"name": "Delhi", "value": "DL"})).unwrap();
    assert_eq!(option.name, json!("Delhi"));
    assert_eq!(option.value, json!("DL"));
}

#[test]
fn test_dropdown_option_without_name_uses_value() {
    let option: DropdownOption = serde_json::from_value(json!({"value": 7})).unwrap();
    assert_eq!(option.name, json!(7));
    assert_eq!(option.value, json!(7));
}

#[test]
fn test_dropdown_option_from_bare_scalar() {
    let options: Vec<DropdownOption> = serde_json::from_value(json!(["north", 2])).unwrap();
    assert_eq!(options[0], DropdownOption::new("north", "north"));
    assert_eq!(options[1], DropdownOption::new(2, 2));
}

// QueryResult tests
#[test]
fn test_execute_response_with_result_is_done() {
    let response: ExecuteQueryResponse = serde_json::from_value(json!({
        "query_result": {
            "id": 10,
            "data": {"columns": [{"name": "entity_id"}], "rows": [{"entity_id": 42}]}
        }
    }))
    .unwrap();

    let result = QueryResult::from(response);
    assert_eq!(result.status, QueryStatus::Done);
    assert_eq!(result.first_row().unwrap()["entity_id"], json!(42));
}

#[test]
fn test_execute_response_with_failed_job() {
    let response: ExecuteQueryResponse = serde_json::from_value(json!({
        "job": {"status": 4, "error": "relation \"x\" does not exist"}
    }))
    .unwrap();

    let result = QueryResult::from(response);
    assert_eq!(result.status, QueryStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("relation \"x\" does not exist"));
    assert!(result.first_row().is_none());
}

#[test]
fn test_execute_response_with_running_job_is_pending() {
    let response: ExecuteQueryResponse =
        serde_json::from_value(json!({"job": {"status": 2}})).unwrap();
    assert_eq!(QueryResult::from(response).status, QueryStatus::Pending);
}

#[test]
fn test_query_status_serialization() {
    assert_eq!(serde_json::to_value(QueryStatus::Done).unwrap(), json!("done"));
    assert_eq!(serde_json::to_value(QueryStatus::Failed).unwrap(), json!("failed"));
}

// pluck_dropdown_options tests
#[test]
fn test_pluck_uses_name_and_value_columns() {
    let data = data(
        &["Name", "Value"],
        json!([{"Name": "Delhi", "Value": 11}, {"Name": "Pune", "Value": 12}]),
    );

    let options = pluck_dropdown_options(&data);
    assert_eq!(options.len(), 2);
    assert_eq!(options[0].name, json!("Delhi"));
    assert_eq!(options[0].value, json!("11"));
}

#[test]
fn test_pluck_falls_back_to_first_column() {
    let data = data(&["city", "population"], json!([{"city": "Agra", "population": 5}]));

    let options = pluck_dropdown_options(&data);
    assert_eq!(options, vec![DropdownOption::new("Agra", "Agra")]);
}

#[test]
fn test_pluck_without_columns_is_empty() {
    assert!(pluck_dropdown_options(&QueryResultData::default()).is_empty());
}

#[test]
fn test_value_text() {
    assert_eq!(value_text(&json!("a")), "a");
    assert_eq!(value_text(&json!(3)), "3");
    assert_eq!(value_text(&Value::Null), "");
    assert_eq!(value_text(&json!(true)), "true");
}

#[test]
fn test_save_request_flattens_changes() {
    let mut changes = Map::new();
    changes.insert("name".to_string(), json!("Sales"));
    let request = SaveDashboardRequest {
        id: 3,
        version: Some(7),
        changes,
    };

    let value = serde_json::to_value(&request).unwrap();
    assert_eq!(value, json!({"id": 3, "version": 7, "name": "Sales"}));
}
