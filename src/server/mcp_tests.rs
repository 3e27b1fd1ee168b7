//! Unit tests for the MCP protocol layer and tool routing.

use super::*;
use crate::backend::{
    Column, DropdownOption, MockDropdownBackend, MockQueryExecutor, QueryResult, QueryResultData,
};
use crate::config::{
    BackendConfig, Config, DatabaseConfig, EntityConfig, LogFormat, LoggingConfig, ParameterConfig,
    RequestConfig,
};
use crate::server::AppState;
use crate::storage::SqliteStorage;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

fn test_config() -> Config {
    Config {
        backend: BackendConfig {
            base_url: "http://localhost:5000".to_string(),
            api_key: None,
        },
        database: DatabaseConfig {
            path: PathBuf::from(":memory:"),
            max_connections: 1,
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        },
        request: RequestConfig::default(),
        parameters: ParameterConfig::default(),
        entity: EntityConfig::default(),
    }
}

/// Dropdowns keyed by the `region` parent value: query 2 lists cities.
fn dropdowns() -> MockDropdownBackend {
    let mut backend = MockDropdownBackend::new();
    backend.expect_fetch_dropdown().returning(|id, params| {
        let region = params
            .and_then(|p| p.get("region").cloned())
            .unwrap_or(Value::Null);
        Ok(match (id, region.as_str()) {
            (1, _) => vec![
                DropdownOption::new("West", "west"),
                DropdownOption::new("East", "east"),
            ],
            (2, Some("east")) => vec![DropdownOption::new("Kolkata", "kol")],
            (2, Some("west")) => vec![DropdownOption::new("Pune", "pune")],
            _ => Vec::new(),
        })
    });
    backend
}

async fn test_server() -> McpServer {
    let storage = SqliteStorage::new_in_memory().await.unwrap();
    let mut executor = MockQueryExecutor::new();
    executor
        .expect_execute_query()
        .returning(|_, _| Ok(QueryResult::done(QueryResultData::default())));

    let state = AppState::with_backends(
        test_config(),
        storage,
        Arc::new(dropdowns()),
        Arc::new(executor),
    );
    McpServer::new(Arc::new(state))
}

fn request(id: i64, method: &str, params: Value) -> JsonRpcRequest {
    JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: Some(json!(id)),
        method: method.to_string(),
        params: Some(params),
    }
}

/// Call a tool and return its decoded JSON text, or the error text.
async fn call(server: &McpServer, name: &str, arguments: Value) -> Result<Value, String> {
    let response = server
        .handle_request(request(1, "tools/call", json!({"name": name, "arguments": arguments})))
        .await
        .unwrap();
    let result = response.result.unwrap();
    let text = result["content"][0]["text"].as_str().unwrap().to_string();
    if result.get("isError") == Some(&json!(true)) {
        Err(text)
    } else {
        Ok(serde_json::from_str(&text).unwrap())
    }
}

fn define_args() -> Value {
    json!({
        "set_id": "sales",
        "name": "Sales",
        "parameters": [
            {"name": "region", "title": "Region", "type": "dependent-filters", "queryId": 1},
            {
                "name": "city",
                "title": "City",
                "type": "dependent-filters",
                "queryId": 2,
                "parent_parameter": [{"name": "region", "value": null}]
            }
        ]
    })
}

// ============================================================================
// JSON-RPC envelope
// ============================================================================

#[test]
fn test_jsonrpc_response_success() {
    let response = JsonRpcResponse::success(Some(json!("req-1")), json!({"ok": true}));
    let serialized = serde_json::to_value(&response).unwrap();

    assert_eq!(serialized["jsonrpc"], "2.0");
    assert_eq!(serialized["id"], "req-1");
    assert!(serialized.get("error").is_none());
}

#[test]
fn test_jsonrpc_response_error_without_id() {
    let response = JsonRpcResponse::error(None, codes::PARSE_ERROR, "Parse error");

    assert_eq!(response.id, Value::Null);
    let error = response.error.unwrap();
    assert_eq!(error.code, -32700);
    assert!(response.result.is_none());
}

#[test]
fn test_jsonrpc_notification_has_no_id() {
    let request: JsonRpcRequest =
        serde_json::from_str(r#"{"jsonrpc":"2.0","method":"initialized"}"#).unwrap();
    assert!(request.id.is_none());
    assert!(request.params.is_none());
}

#[test]
fn test_tool_call_params_deserialization() {
    let params: ToolCallParams =
        serde_json::from_str(r#"{"name":"parameters_apply","arguments":{"set_id":"s"}}"#).unwrap();
    assert_eq!(params.name, "parameters_apply");
    assert_eq!(params.arguments.unwrap()["set_id"], "s");
}

// ============================================================================
// Tool definitions
// ============================================================================

#[test]
fn test_fifteen_tools_exposed() {
    assert_eq!(tool_definitions().len(), 15);
}

#[test]
fn test_tool_failure_sets_is_error() {
    let value = serde_json::to_value(ToolCallResult::failure("Error: boom".into())).unwrap();
    assert_eq!(value["isError"], true);
    assert_eq!(value["content"][0]["type"], "text");

    let ok = serde_json::to_value(ToolCallResult::text("{}".into())).unwrap();
    assert!(ok.get("isError").is_none());
}

#[test]
fn test_tool_names_are_unique() {
    let tools = tool_definitions();
    let mut names: Vec<_> = tools.iter().map(|t| t.name.clone()).collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), tools.len());
}

#[test]
fn test_tool_schemas_are_closed_objects() {
    for tool in tool_definitions() {
        assert_eq!(tool.input_schema["type"], "object", "{}", tool.name);
        assert_eq!(tool.input_schema["additionalProperties"], false, "{}", tool.name);
        assert!(tool.input_schema["required"].is_array(), "{}", tool.name);
    }
}

#[test]
fn test_tool_serializes_input_schema_field() {
    let serialized = serde_json::to_value(get_validate_pattern_tool()).unwrap();
    assert!(serialized.get("inputSchema").is_some());
    assert!(serialized.get("input_schema").is_none());
}

// ============================================================================
// Request handling
// ============================================================================

#[tokio::test]
async fn test_initialize() {
    let server = test_server().await;
    let response = server.handle_request(request(1, "initialize", json!({}))).await.unwrap();
    let result = response.result.unwrap();

    assert_eq!(result["serverInfo"]["name"], "param-cascade");
    assert_eq!(result["protocolVersion"], "2024-11-05");
}

#[tokio::test]
async fn test_tools_list_matches_definitions() {
    let server = test_server().await;
    let response = server.handle_request(request(2, "tools/list", json!({}))).await.unwrap();
    let tools = response.result.unwrap()["tools"].as_array().unwrap().len();
    assert_eq!(tools, tool_definitions().len());
}

#[tokio::test]
async fn test_unknown_method_and_notification() {
    let server = test_server().await;
    let response = server.handle_request(request(3, "nope", json!({}))).await.unwrap();
    assert_eq!(response.error.unwrap().code, -32601);

    let notification = JsonRpcRequest {
        jsonrpc: "2.0".to_string(),
        id: None,
        method: "nope".to_string(),
        params: None,
    };
    assert!(server.handle_request(notification).await.is_none());
}

#[tokio::test]
async fn test_unknown_tool_is_error_result() {
    let server = test_server().await;
    let err = call(&server, "parameters_rename", json!({})).await.unwrap_err();
    assert!(err.contains("Unknown tool"));
}

#[tokio::test]
async fn test_define_set_pending_and_apply() {
    let server = test_server().await;
    call(&server, "parameters_define", define_args()).await.unwrap();

    let changed = call(
        &server,
        "parameters_set_pending",
        json!({"set_id": "sales", "name": "region", "value": "east"}),
    )
    .await
    .unwrap();
    assert_eq!(changed["resolved"], json!(["city"]));

    let listed = call(&server, "parameters_list", json!({"set_id": "sales"})).await.unwrap();
    assert_eq!(listed["dirty"], json!(2));
    assert_eq!(listed["options"]["city"][0]["value"], json!("kol"));

    let applied = call(&server, "parameters_apply", json!({"set_id": "sales"})).await.unwrap();
    assert_eq!(applied["url"]["p_region"], json!("east"));
    assert_eq!(applied["url"]["p_city"], json!("kol"));
}

#[tokio::test]
async fn test_list_respects_hide_filter() {
    let server = test_server().await;
    call(&server, "parameters_define", define_args()).await.unwrap();

    let listed = call(
        &server,
        "parameters_list",
        json!({"set_id": "sales", "query": "hide_filter=City"}),
    )
    .await
    .unwrap();
    let names: Vec<_> = listed["parameters"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["region"]);
}

#[tokio::test]
async fn test_load_options_and_reorder() {
    let server = test_server().await;
    call(&server, "parameters_define", define_args()).await.unwrap();

    let loaded = call(
        &server,
        "parameters_load_options",
        json!({"set_id": "sales", "name": "region"}),
    )
    .await
    .unwrap();
    assert_eq!(loaded["outcome"], "applied");
    assert_eq!(loaded["value"], "west");

    let reordered = call(
        &server,
        "parameters_reorder",
        json!({"set_id": "sales", "old_index": 1, "new_index": 0}),
    )
    .await
    .unwrap();
    assert_eq!(reordered["order"], json!(["city", "region"]));
}

#[tokio::test]
async fn test_edit_and_remove() {
    let server = test_server().await;
    call(&server, "parameters_define", define_args()).await.unwrap();

    // city may not become its own parent's parent
    let err = call(
        &server,
        "parameters_edit",
        json!({
            "set_id": "sales",
            "index": 0,
            "parameter": {"name": "region", "parent_parameter": [{"name": "city"}]}
        }),
    )
    .await
    .unwrap_err();
    assert!(err.contains("Cyclic parameter dependency"));

    let edited = call(
        &server,
        "parameters_edit",
        json!({
            "set_id": "sales",
            "index": 0,
            "parameter": {"name": "country", "title": "Country"}
        }),
    )
    .await
    .unwrap();
    assert_eq!(edited["parameters"][0]["name"], "country");

    let removed = call(&server, "parameters_remove", json!({"set_id": "sales", "name": "city"}))
        .await
        .unwrap();
    assert_eq!(removed["removed"], "city");
    assert_eq!(removed["remaining"], json!(1));
}

#[tokio::test]
async fn test_save_restore_and_conflict() {
    let server = test_server().await;
    call(&server, "parameters_define", define_args()).await.unwrap();

    let first = call(&server, "parameters_save", json!({"set_id": "sales"})).await.unwrap();
    assert_eq!(first["version"], json!(1));
    let second = call(&server, "parameters_save", json!({"set_id": "sales"})).await.unwrap();
    assert_eq!(second["version"], json!(2));

    // Redefining keeps the version the live set was based on.
    call(&server, "parameters_define", define_args()).await.unwrap();
    let restored = call(&server, "parameters_restore", json!({"set_id": "sales"})).await.unwrap();
    assert_eq!(restored["version"], json!(2));
    assert_eq!(restored["parameters"].as_array().unwrap().len(), 2);

    // Another editor saves in between: the stale version is rejected.
    let state = &server.state;
    state.sets.write().await.get_mut("sales").unwrap().version = 1;
    let err = call(&server, "parameters_save", json!({"set_id": "sales"})).await.unwrap_err();
    assert!(err.contains("modified by another user"));
}

#[tokio::test]
async fn test_url_reads_query() {
    let server = test_server().await;
    call(&server, "parameters_define", define_args()).await.unwrap();

    let url = call(
        &server,
        "parameters_url",
        json!({"set_id": "sales", "query": "p_region=west&p_city=pune"}),
    )
    .await
    .unwrap();
    assert_eq!(url["url"]["p_region"], "west");
    assert_eq!(url["url"]["p_city"], "pune");
}

#[tokio::test]
async fn test_query_render_and_validate_pattern() {
    let server = test_server().await;
    let rendered = call(
        &server,
        "query_render",
        json!({
            "template": "SELECT * FROM t WHERE n = {{ n }}",
            "schema": [{"name": "n", "type": "number"}],
            "values": {"n": 3}
        }),
    )
    .await
    .unwrap();
    assert_eq!(rendered["query"], "SELECT * FROM t WHERE n = 3");
    assert_eq!(rendered["is_safe"], true);

    let err = call(
        &server,
        "query_render",
        json!({
            "template": "{{ n }}",
            "schema": [{"name": "n", "type": "number"}],
            "values": {"n": "many"}
        }),
    )
    .await
    .unwrap_err();
    assert!(err.contains("incompatible with their definitions: n"));

    let valid = call(&server, "validate_pattern", json!({"pattern": "[a-z"})).await.unwrap();
    assert_eq!(valid["valid"], false);
}

#[tokio::test]
async fn test_dashboard_load_without_key() {
    let server = test_server().await;
    let loaded = call(
        &server,
        "dashboard_load",
        json!({
            "widgets": [
                {"id": 1, "query_id": 10, "query_name": "Entity"},
                {"id": 2, "query_id": 11, "query_name": "Revenue"}
            ]
        }),
    )
    .await
    .unwrap();

    assert_eq!(loaded["report"]["loaded"], json!([1, 2]));
    assert_eq!(loaded["state"], "settled");
    assert_eq!(loaded["visible_widgets"], json!([1, 2]));
}

/// (query id, max_age, injected entity id) per execution
type ExecutionLog = Arc<Mutex<Vec<(i64, u64, Value)>>>;

/// Server whose entity query (10) answers `{entity_id: 42}`
async fn entity_server() -> (McpServer, ExecutionLog) {
    let log: ExecutionLog = Arc::default();
    let mut executor = MockQueryExecutor::new();
    let recorded = Arc::clone(&log);
    executor.expect_execute_query().returning(move |query_id, request| {
        let injected = request.parameters.get("entity_id").cloned().unwrap_or(Value::Null);
        recorded
            .lock()
            .unwrap()
            .push((query_id, request.max_age, injected));
        let data = if query_id == 10 {
            QueryResultData {
                columns: vec![Column {
                    name: "entity_id".to_string(),
                    friendly_name: None,
                    column_type: None,
                }],
                rows: vec![json!({"entity_id": 42}).as_object().cloned().unwrap()],
            }
        } else {
            QueryResultData::default()
        };
        Ok(QueryResult::done(data))
    });

    let state = AppState::with_backends(
        test_config(),
        SqliteStorage::new_in_memory().await.unwrap(),
        Arc::new(dropdowns()),
        Arc::new(executor),
    );
    (McpServer::new(Arc::new(state)), log)
}

fn keyed_dashboard() -> Value {
    json!({
        "dashboard_id": "main",
        "external_key": "K",
        "widgets": [
            {
                "id": 1,
                "query_id": 10,
                "query_name": "Entity",
                "parameters": [{"name": "company", "type": "text", "role": "external_key"}]
            },
            {
                "id": 2,
                "query_id": 20,
                "query_name": "Revenue",
                "parameters": [{"name": "entity_id", "type": "number", "role": "entity_id"}]
            }
        ]
    })
}

fn runs_of(log: &ExecutionLog, query_id: i64) -> Vec<(u64, Value)> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(id, _, _)| *id == query_id)
        .map(|(_, max_age, injected)| (*max_age, injected.clone()))
        .collect()
}

#[tokio::test]
async fn test_stored_dashboard_skips_refresh_for_same_entity() {
    let (server, log) = entity_server().await;

    let first = call(&server, "dashboard_load", keyed_dashboard()).await.unwrap();
    assert_eq!(first["report"]["entity_id"], json!(42));
    assert_eq!(first["report"]["refreshed"], json!([2]));
    assert_eq!(first["visible_widgets"], json!([2]));
    assert_eq!(runs_of(&log, 20).len(), 2);

    log.lock().unwrap().clear();
    let second = call(&server, "dashboard_load", json!({"dashboard_id": "main"}))
        .await
        .unwrap();

    assert_eq!(second["report"]["refreshed"], json!([]));
    assert_eq!(second["entity_id"], json!(42));
    assert_eq!(runs_of(&log, 20), vec![(86400, json!(42))]);
}

#[tokio::test]
async fn test_redefined_dashboard_keeps_entity() {
    let (server, log) = entity_server().await;
    call(&server, "dashboard_load", keyed_dashboard()).await.unwrap();
    log.lock().unwrap().clear();

    let reloaded = call(&server, "dashboard_load", keyed_dashboard()).await.unwrap();

    assert_eq!(reloaded["report"]["refreshed"], json!([]));
    assert_eq!(runs_of(&log, 20).len(), 1);
}

#[tokio::test]
async fn test_entity_change_reloads_dependents() {
    let (server, log) = entity_server().await;
    call(&server, "dashboard_load", keyed_dashboard()).await.unwrap();
    log.lock().unwrap().clear();

    let unchanged = call(
        &server,
        "dashboard_entity_changed",
        json!({"dashboard_id": "main", "entity_id": 42}),
    )
    .await
    .unwrap();
    assert_eq!(unchanged["report"], Value::Null);
    assert!(log.lock().unwrap().is_empty());

    let changed = call(
        &server,
        "dashboard_entity_changed",
        json!({"dashboard_id": "main", "entity_id": "43"}),
    )
    .await
    .unwrap();
    assert_eq!(changed["report"]["refreshed"], json!([2]));
    assert_eq!(changed["entity_id"], json!(43));
    assert_eq!(changed["state"], "settled");
    assert_eq!(runs_of(&log, 20), vec![(0, json!(43))]);
    assert!(runs_of(&log, 10).is_empty());
}

#[tokio::test]
async fn test_unknown_dashboard_is_rejected() {
    let (server, _log) = entity_server().await;

    let err = call(&server, "dashboard_load", json!({"dashboard_id": "nope"}))
        .await
        .unwrap_err();
    assert!(err.contains("widgets are required"));

    let err = call(
        &server,
        "dashboard_entity_changed",
        json!({"dashboard_id": "nope", "entity_id": 1}),
    )
    .await
    .unwrap_err();
    assert!(err.contains("Unknown dashboard: nope"));
}
