//! Stdio JSON-RPC 2.0 front end speaking the MCP tool protocol.
//!
//! One request per line on stdin, one response per line on stdout.
//! Notifications get no response.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use super::{handle_tool_call, SharedState};

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod mcp_tests;

/// MCP protocol revision implemented here.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC error codes used by the server.
pub mod codes {
    /// Request line was not valid JSON-RPC
    pub const PARSE_ERROR: i32 = -32700;
    /// Method does not exist
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Params missing or malformed
    pub const INVALID_PARAMS: i32 = -32602;
    /// Server failed to build its response
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// Incoming JSON-RPC request or notification.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications.
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// Outgoing JSON-RPC response; exactly one of `result` and `error` is set.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    /// Echoed request id, `null` when the request could not be read.
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC error object
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Name and version reported by `initialize`
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// Capabilities reported by `initialize`
#[derive(Debug, Serialize)]
pub struct Capabilities {
    pub tools: ToolCapabilities,
}

/// Tool capabilities; the tool list is fixed for the server's lifetime.
#[derive(Debug, Serialize)]
pub struct ToolCapabilities {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Result of `initialize`
#[derive(Debug, Serialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: Capabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// A callable tool and the JSON Schema of its arguments.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Params of `tools/call`
#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// One content block of a tool result
#[derive(Debug, Serialize)]
pub struct ToolResultContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

/// Result of `tools/call`.
///
/// Tool failures are results with `isError` set, not JSON-RPC errors.
#[derive(Debug, Serialize)]
pub struct ToolCallResult {
    pub content: Vec<ToolResultContent>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl ToolCallResult {
    /// Successful result carrying `text`
    pub fn text(text: String) -> Self {
        Self {
            content: vec![ToolResultContent {
                content_type: "text".to_string(),
                text,
            }],
            is_error: None,
        }
    }

    /// Failed result carrying the error message
    pub fn failure(message: String) -> Self {
        Self {
            is_error: Some(true),
            ..Self::text(message)
        }
    }
}

impl JsonRpcResponse {
    /// Response carrying `result`
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    /// Response carrying an error
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Serialize `result` into a success response, or an internal error
    fn respond<T: Serialize>(id: Option<Value>, result: &T) -> Self {
        match serde_json::to_value(result) {
            Ok(value) => Self::success(id, value),
            Err(e) => {
                error!(error = %e, "Failed to serialize result");
                Self::error(id, codes::INTERNAL_ERROR, format!("Internal error: {}", e))
            }
        }
    }
}

/// Every tool the server exposes, in listing order
pub fn tool_definitions() -> Vec<Tool> {
    vec![
        get_define_tool(),
        get_list_tool(),
        get_set_pending_tool(),
        get_apply_tool(),
        get_reorder_tool(),
        get_edit_tool(),
        get_remove_tool(),
        get_load_options_tool(),
        get_url_tool(),
        get_save_tool(),
        get_restore_tool(),
        get_dashboard_load_tool(),
        get_dashboard_entity_changed_tool(),
        get_query_render_tool(),
        get_validate_pattern_tool(),
    ]
}

/// Line-delimited JSON-RPC server over stdin/stdout.
pub struct McpServer {
    state: SharedState,
}

impl McpServer {
    /// Create a server over shared state
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Serve until stdin closes
    pub async fn run(&self) -> std::io::Result<()> {
        info!("Parameter cascade server starting...");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            debug!(request = %line, "Received request");

            let response = match serde_json::from_str::<JsonRpcRequest>(line) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => {
                    warn!(error = %e, "Unreadable request line");
                    Some(JsonRpcResponse::error(
                        None,
                        codes::PARSE_ERROR,
                        format!("Parse error: {}", e),
                    ))
                }
            };

            let Some(response) = response else {
                continue;
            };
            let mut encoded = serde_json::to_vec(&response)?;
            encoded.push(b'\n');
            stdout.write_all(&encoded).await?;
            stdout.flush().await?;
        }

        info!("stdin closed, shutting down");
        Ok(())
    }

    /// Dispatch one request; `None` when no response is due
    async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let JsonRpcRequest { id, method, params, .. } = request;

        let response = match method.as_str() {
            "initialize" => self.handle_initialize(id),
            "tools/list" => {
                debug!("Listing tools");
                JsonRpcResponse::success(id, json!({ "tools": tool_definitions() }))
            }
            "tools/call" => self.handle_tool_call(id, params).await,
            "ping" => JsonRpcResponse::success(id, json!({})),
            "initialized" | "notifications/cancelled" => {
                debug!(method = %method, "Notification received");
                return None;
            }
            _ if id.is_none() => {
                debug!(method = %method, "Ignoring unknown notification");
                return None;
            }
            _ => {
                warn!(method = %method, "Unknown method");
                JsonRpcResponse::error(
                    id,
                    codes::METHOD_NOT_FOUND,
                    format!("Method not found: {}", method),
                )
            }
        };
        Some(response)
    }

    fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Client initializing");

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: Capabilities {
                tools: ToolCapabilities {
                    list_changed: false,
                },
            },
            server_info: ServerInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        JsonRpcResponse::respond(id, &result)
    }

    async fn handle_tool_call(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let Some(params) = params else {
            return JsonRpcResponse::error(id, codes::INVALID_PARAMS, "Missing params");
        };
        let params: ToolCallParams = match serde_json::from_value(params) {
            Ok(params) => params,
            Err(e) => {
                let message = format!("Invalid params: {}", e);
                return JsonRpcResponse::error(id, codes::INVALID_PARAMS, message);
            }
        };

        let result = match handle_tool_call(&self.state, &params.name, params.arguments).await {
            Ok(value) => match serde_json::to_string_pretty(&value) {
                Ok(text) => ToolCallResult::text(text),
                Err(e) => ToolCallResult::failure(format!("Error: result not serializable: {}", e)),
            },
            Err(e) => {
                debug!(tool = %params.name, error = %e, "Tool call failed");
                ToolCallResult::failure(format!("Error: {}", e))
            }
        };
        JsonRpcResponse::respond(id, &result)
    }
}

/// Schema fragment identifying a live parameter set
fn set_id_property() -> Value {
    serde_json::json!({
        "type": "string",
        "description": "Identifier of the parameter set"
    })
}

/// Get the parameter set definition tool
fn get_define_tool() -> Tool {
    Tool {
        name: "parameters_define".to_string(),
        description: "Create or replace a live parameter set from parameter definitions. Dependent parameters list their parents in parent_parameter.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "set_id": set_id_property(),
                "name": {
                    "type": "string",
                    "description": "Display name of the set"
                },
                "parameters": {
                    "type": "array",
                    "description": "Parameter definitions in display order",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "title": { "type": "string" },
                            "type": { "type": "string" },
                            "value": {},
                            "parent_parameter": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {
                                        "name": { "type": "string" },
                                        "value": {}
                                    }
                                }
                            },
                            "queryId": { "type": "integer" },
                            "parentQueryId": { "type": "integer" },
                            "multiValuesOptions": { "type": "object" }
                        },
                        "required": ["name"]
                    }
                }
            },
            "required": ["set_id", "parameters"],
            "additionalProperties": false
        }),
    }
}

/// Get the parameter listing tool
fn get_list_tool() -> Tool {
    Tool {
        name: "parameters_list".to_string(),
        description: "List the visible parameters of a set with their cached options and the number of pending edits.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "set_id": set_id_property(),
                "query": {
                    "type": "string",
                    "description": "Raw URL query string; hide_filter entries hide parameters"
                }
            },
            "required": ["set_id"],
            "additionalProperties": false
        }),
    }
}

/// Get the pending value tool
fn get_set_pending_tool() -> Tool {
    Tool {
        name: "parameters_set_pending".to_string(),
        description: "Set a parameter's pending value and cascade it: every dependent reloads its options and selects the first one.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "set_id": set_id_property(),
                "name": {
                    "type": "string",
                    "description": "Parameter to change"
                },
                "value": {
                    "description": "New value (scalar or array)"
                },
                "is_dirty": {
                    "type": "boolean",
                    "description": "false clears the pending value instead (default: true)"
                }
            },
            "required": ["set_id", "name"],
            "additionalProperties": false
        }),
    }
}

/// Get the apply tool
fn get_apply_tool() -> Tool {
    Tool {
        name: "parameters_apply".to_string(),
        description: "Commit every pending value and return the applied parameters with the resulting URL parameters.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "set_id": set_id_property()
            },
            "required": ["set_id"],
            "additionalProperties": false
        }),
    }
}

/// Get the reorder tool
fn get_reorder_tool() -> Tool {
    Tool {
        name: "parameters_reorder".to_string(),
        description: "Move one parameter to a new position.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "set_id": set_id_property(),
                "old_index": { "type": "integer", "minimum": 0 },
                "new_index": { "type": "integer", "minimum": 0 }
            },
            "required": ["set_id", "old_index", "new_index"],
            "additionalProperties": false
        }),
    }
}

/// Get the definition edit tool
fn get_edit_tool() -> Tool {
    Tool {
        name: "parameters_edit".to_string(),
        description: "Replace the definition at one position. Rejects duplicate names and edits that would create a dependency cycle.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "set_id": set_id_property(),
                "index": { "type": "integer", "minimum": 0 },
                "parameter": {
                    "type": "object",
                    "description": "Replacement parameter definition",
                    "required": ["name"]
                }
            },
            "required": ["set_id", "index", "parameter"],
            "additionalProperties": false
        }),
    }
}

/// Get the removal tool
fn get_remove_tool() -> Tool {
    Tool {
        name: "parameters_remove".to_string(),
        description: "Remove a parameter from a set.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "set_id": set_id_property(),
                "name": { "type": "string" }
            },
            "required": ["set_id", "name"],
            "additionalProperties": false
        }),
    }
}

/// Get the option loading tool
fn get_load_options_tool() -> Tool {
    Tool {
        name: "parameters_load_options".to_string(),
        description: "Load a parameter's dropdown options and correct its selection to a valid option. Superseded responses report outcome 'stale'.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "set_id": set_id_property(),
                "name": { "type": "string" }
            },
            "required": ["set_id", "name"],
            "additionalProperties": false
        }),
    }
}

/// Get the URL serialization tool
fn get_url_tool() -> Tool {
    Tool {
        name: "parameters_url".to_string(),
        description: "Serialize applied values to URL query parameters, optionally reading values from a query string first.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "set_id": set_id_property(),
                "query": {
                    "type": "string",
                    "description": "Raw URL query string to read values from"
                }
            },
            "required": ["set_id"],
            "additionalProperties": false
        }),
    }
}

/// Get the save tool
fn get_save_tool() -> Tool {
    Tool {
        name: "parameters_save".to_string(),
        description: "Persist a parameter set. Fails if another editor saved it since it was loaded.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "set_id": set_id_property()
            },
            "required": ["set_id"],
            "additionalProperties": false
        }),
    }
}

/// Get the restore tool
fn get_restore_tool() -> Tool {
    Tool {
        name: "parameters_restore".to_string(),
        description: "Load a saved parameter set as the live set.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "set_id": set_id_property()
            },
            "required": ["set_id"],
            "additionalProperties": false
        }),
    }
}

/// Get the dashboard load tool
fn get_dashboard_load_tool() -> Tool {
    Tool {
        name: "dashboard_load".to_string(),
        description: "Load dashboard widgets. With an external key, the entity widget loads first and its identifier is passed to every other widget as an implicit filter.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "dashboard_id": {
                    "type": "string",
                    "description": "Keep the dashboard between calls under this id; omit widgets to reload it"
                },
                "widgets": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": { "type": "integer" },
                            "query_id": { "type": "integer" },
                            "query_name": { "type": "string" },
                            "parameters": { "type": "array" },
                            "mappings": { "type": "array" },
                            "max_age": {
                                "type": "integer",
                                "minimum": 0,
                                "description": "Cached result age allowed when not forced, in seconds (default: 86400)"
                            }
                        },
                        "required": ["id", "query_id", "query_name"]
                    }
                },
                "external_key": {
                    "type": "string",
                    "description": "External key of the entity to scope the dashboard to"
                },
                "force_refresh": { "type": "boolean" },
                "updated_parameters": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Dashboard parameters that changed; only widgets mapped to them reload"
                },
                "query": {
                    "type": "string",
                    "description": "Raw URL query string holding filter selections"
                }
            },
            "required": [],
            "additionalProperties": false
        }),
    }
}

/// Get the entity change tool
fn get_dashboard_entity_changed_tool() -> Tool {
    Tool {
        name: "dashboard_entity_changed".to_string(),
        description: "Report a new entity identifier for a stored dashboard. When it differs from the recorded one, every non-entity widget reloads with it.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "dashboard_id": { "type": "string" },
                "entity_id": {
                    "type": ["integer", "string", "null"],
                    "description": "Observed identifier; null clears it"
                }
            },
            "required": ["dashboard_id"],
            "additionalProperties": false
        }),
    }
}

/// Get the query rendering tool
fn get_query_render_tool() -> Tool {
    Tool {
        name: "query_render".to_string(),
        description: "Validate parameter values against their definitions and render a {{ name }} query template.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "template": { "type": "string" },
                "schema": {
                    "type": "array",
                    "description": "Parameter definitions; empty accepts any value"
                },
                "values": { "type": "object" }
            },
            "required": ["template"],
            "additionalProperties": false
        }),
    }
}

/// Get the pattern validation tool
fn get_validate_pattern_tool() -> Tool {
    Tool {
        name: "validate_pattern".to_string(),
        description: "Check whether a text-pattern parameter's regular expression is valid.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string" }
            },
            "required": ["pattern"],
            "additionalProperties": false
        }),
    }
}
