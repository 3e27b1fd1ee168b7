use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::{ActiveSet, SetController, SharedState};
use crate::backend::QueryExecutor;
use crate::dashboard::{
    normalize_entity_id, DashboardCascade, ParameterMapping, QueryWidget, Widget,
    DEFAULT_MAX_AGE_SECS,
};
use crate::error::{AppError, McpError, McpResult, SaveError, ValidationError};
use crate::parameters::{
    query_map, validate_pattern, HideList, Parameter, ParameterDefinition, ParameterSetController,
    ParameterizedQuery, DEFAULT_URL_PREFIX,
};
use crate::storage::{DefinitionStore, SavedParameterSet};

/// Route tool calls to appropriate handlers
pub async fn handle_tool_call(
    state: &SharedState,
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<Value> {
    info!(tool = %tool_name, "Routing tool call");

    match tool_name {
        "parameters_define" => handle_define(state, arguments).await,
        "parameters_list" => handle_list(state, arguments).await,
        "parameters_set_pending" => handle_set_pending(state, arguments).await,
        "parameters_apply" => handle_apply(state, arguments).await,
        "parameters_reorder" => handle_reorder(state, arguments).await,
        "parameters_edit" => handle_edit(state, arguments).await,
        "parameters_remove" => handle_remove(state, arguments).await,
        "parameters_load_options" => handle_load_options(state, arguments).await,
        "parameters_url" => handle_url(state, arguments).await,
        "parameters_save" => handle_save(state, arguments).await,
        "parameters_restore" => handle_restore(state, arguments).await,
        "dashboard_load" => handle_dashboard_load(state, arguments).await,
        "dashboard_entity_changed" => handle_dashboard_entity_changed(state, arguments).await,
        "query_render" => handle_query_render(state, arguments).await,
        "validate_pattern" => handle_validate_pattern(arguments),
        _ => Err(McpError::UnknownTool {
            tool_name: tool_name.to_string(),
        }),
    }
}

#[derive(Deserialize)]
struct SetRef {
    set_id: String,
}

/// Handle parameters_define - create or replace a live parameter set
async fn handle_define(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    #[derive(Deserialize)]
    struct DefineParams {
        set_id: String,
        #[serde(default)]
        name: Option<String>,
        parameters: Vec<ParameterDefinition>,
    }

    let params: DefineParams = parse_arguments("parameters_define", arguments)?;
    let definitions = params
        .parameters
        .into_iter()
        .map(|def| with_url_prefix(def, &state.config.parameters.url_prefix))
        .collect();
    let controller = new_controller(state, definitions)?;
    let parameters = controller.parameters().await;

    let previous_version = state
        .sets
        .read()
        .await
        .get(&params.set_id)
        .map(|set| set.version)
        .unwrap_or(0);
    state.sets.write().await.insert(
        params.set_id.clone(),
        ActiveSet {
            name: params.name.unwrap_or_else(|| params.set_id.clone()),
            version: previous_version,
            controller,
        },
    );

    Ok(json!({
        "set_id": params.set_id,
        "parameters": parameters,
    }))
}

/// Handle parameters_list - current parameters, options, and dirty count
async fn handle_list(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    #[derive(Deserialize)]
    struct ListParams {
        set_id: String,
        /// Raw URL query; its `hide_filter` entries hide parameters.
        #[serde(default)]
        query: Option<String>,
    }

    let params: ListParams = parse_arguments("parameters_list", arguments)?;
    let controller = require_set(state, &params.set_id).await?;
    let hide = params.query.as_deref().map(HideList::from_query).unwrap_or_default();

    let snapshot = controller.snapshot().await;
    Ok(json!({
        "set_id": params.set_id,
        "parameters": controller.visible_parameters(&hide).await,
        "options": snapshot.options,
        "dirty": controller.dirty_count().await,
    }))
}

/// Handle parameters_set_pending - edit one value and cascade it
async fn handle_set_pending(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    #[derive(Deserialize)]
    struct SetPendingParams {
        set_id: String,
        name: String,
        #[serde(default)]
        value: Value,
        #[serde(default = "default_dirty")]
        is_dirty: bool,
    }

    fn default_dirty() -> bool {
        true
    }

    let params: SetPendingParams = parse_arguments("parameters_set_pending", arguments)?;
    let controller = require_set(state, &params.set_id).await?;
    let resolved = controller
        .set_pending_value(&params.name, params.value, params.is_dirty)
        .await
        .map_err(execution_failed)?;

    Ok(json!({
        "resolved": resolved,
        "parameters": controller.parameters().await,
    }))
}

/// Handle parameters_apply - commit every pending value
async fn handle_apply(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: SetRef = parse_arguments("parameters_apply", arguments)?;
    let controller = require_set(state, &params.set_id).await?;
    let applied = controller.apply_all().await;

    Ok(json!({
        "applied": applied,
        "url": controller.url_params().await,
    }))
}

/// Handle parameters_reorder - move one parameter
async fn handle_reorder(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    #[derive(Deserialize)]
    struct ReorderParams {
        set_id: String,
        old_index: usize,
        new_index: usize,
    }

    let params: ReorderParams = parse_arguments("parameters_reorder", arguments)?;
    let controller = require_set(state, &params.set_id).await?;
    controller
        .reorder(params.old_index, params.new_index)
        .await
        .map_err(execution_failed)?;

    let names: Vec<String> = controller.parameters().await.into_iter().map(|p| p.name).collect();
    Ok(json!({ "order": names }))
}

/// Handle parameters_edit - replace one definition in place
async fn handle_edit(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    #[derive(Deserialize)]
    struct EditParams {
        set_id: String,
        index: usize,
        parameter: ParameterDefinition,
    }

    let params: EditParams = parse_arguments("parameters_edit", arguments)?;
    let controller = require_set(state, &params.set_id).await?;
    let definition = with_url_prefix(params.parameter, &state.config.parameters.url_prefix);
    controller
        .replace_definition(params.index, definition)
        .await
        .map_err(execution_failed)?;

    Ok(json!({ "parameters": controller.parameters().await }))
}

/// Handle parameters_remove - drop one parameter
async fn handle_remove(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    #[derive(Deserialize)]
    struct RemoveParams {
        set_id: String,
        name: String,
    }

    let params: RemoveParams = parse_arguments("parameters_remove", arguments)?;
    let controller = require_set(state, &params.set_id).await?;
    let removed = controller.remove(&params.name).await.map_err(execution_failed)?;

    Ok(json!({
        "removed": removed.name,
        "remaining": controller.parameters().await.len(),
    }))
}

/// Handle parameters_load_options - guarded option load
async fn handle_load_options(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    #[derive(Deserialize)]
    struct LoadParams {
        set_id: String,
        name: String,
    }

    let params: LoadParams = parse_arguments("parameters_load_options", arguments)?;
    let controller = require_set(state, &params.set_id).await?;
    let outcome = controller
        .load_options(&params.name)
        .await
        .map_err(execution_failed)?;

    serde_json::to_value(outcome).map_err(McpError::Json)
}

/// Handle parameters_url - read values from and serialize values to a query string
async fn handle_url(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    #[derive(Deserialize)]
    struct UrlParams {
        set_id: String,
        #[serde(default)]
        query: Option<String>,
    }

    let params: UrlParams = parse_arguments("parameters_url", arguments)?;
    let controller = require_set(state, &params.set_id).await?;
    if let Some(query) = params.query.as_deref() {
        controller.apply_url_params(&query_map(query)).await;
    }

    Ok(json!({ "url": controller.url_params().await }))
}

/// Handle parameters_save - persist the set with a version check
async fn handle_save(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: SetRef = parse_arguments("parameters_save", arguments)?;

    let (name, version, controller) = {
        let sets = state.sets.read().await;
        let set = sets.get(&params.set_id).ok_or_else(|| unknown_set(&params.set_id))?;
        (set.name.clone(), set.version, Arc::clone(&set.controller))
    };

    let mut record = SavedParameterSet::new(&params.set_id, name, controller.saveable().await);
    record.version = version;

    let saved = state.storage.save_parameter_set(&record).await.map_err(|e| {
        warn!(set_id = %params.set_id, error = %e, "Save failed");
        save_failed(&e)
    })?;

    if let Some(set) = state.sets.write().await.get_mut(&params.set_id) {
        set.version = saved.version;
    }

    Ok(json!({
        "set_id": saved.id,
        "version": saved.version,
    }))
}

/// Handle parameters_restore - load a saved set as the live set
async fn handle_restore(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: SetRef = parse_arguments("parameters_restore", arguments)?;
    let saved = state
        .storage
        .get_parameter_set(&params.set_id)
        .await
        .map_err(execution_failed)?
        .ok_or_else(|| unknown_set(&params.set_id))?;

    let controller = new_controller(state, saved.parameters)?;
    let parameters = controller.parameters().await;
    state.sets.write().await.insert(
        saved.id.clone(),
        ActiveSet {
            name: saved.name,
            version: saved.version,
            controller,
        },
    );

    Ok(json!({
        "set_id": saved.id,
        "version": saved.version,
        "parameters": parameters,
    }))
}

#[derive(Deserialize)]
struct WidgetSpec {
    id: i64,
    query_id: i64,
    query_name: String,
    #[serde(default)]
    parameters: Vec<ParameterDefinition>,
    #[serde(default)]
    mappings: Vec<ParameterMapping>,
    #[serde(default)]
    max_age: Option<u64>,
}

/// Handle dashboard_load - run the entity-keyed widget cascade
///
/// With a `dashboard_id`, the cascade is kept in the server state so the
/// entity identifier it derived is compared against on the next load.
/// Passing no widgets reloads the stored dashboard.
async fn handle_dashboard_load(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    #[derive(Deserialize)]
    struct DashboardParams {
        #[serde(default)]
        dashboard_id: Option<String>,
        #[serde(default)]
        widgets: Vec<WidgetSpec>,
        #[serde(default)]
        external_key: Option<String>,
        #[serde(default)]
        force_refresh: bool,
        #[serde(default)]
        updated_parameters: Vec<String>,
        #[serde(default)]
        query: Option<String>,
    }

    let params: DashboardParams = parse_arguments("dashboard_load", arguments)?;
    let stored = match params.dashboard_id.as_deref() {
        Some(id) => state.dashboard(id).await,
        None => None,
    };

    let cascade = match stored {
        Some(cascade) if params.widgets.is_empty() => cascade,
        stored => {
            if params.widgets.is_empty() {
                return Err(McpError::InvalidParameters {
                    tool_name: "dashboard_load".to_string(),
                    message: "widgets are required for a dashboard not loaded before".to_string(),
                });
            }
            let widgets = build_widgets(state, params.widgets);
            let query = params.query.as_deref().map(query_map).unwrap_or_default();
            let mut cascade =
                DashboardCascade::new(widgets, state.config.entity.clone(), params.external_key)
                    .with_query(query);
            if let Some(previous) = stored.filter(|p| p.external_key() == cascade.external_key()) {
                cascade = cascade.with_entity_id(previous.entity_id().await);
            }

            let cascade = Arc::new(cascade);
            if let Some(id) = params.dashboard_id {
                state
                    .dashboards
                    .write()
                    .await
                    .insert(id, Arc::clone(&cascade));
            }
            cascade
        }
    };

    let report = cascade
        .load(params.force_refresh, &params.updated_parameters)
        .await;
    dashboard_response(&cascade, json!(report)).await
}

/// Handle dashboard_entity_changed - push an observed entity identifier
async fn handle_dashboard_entity_changed(
    state: &SharedState,
    arguments: Option<Value>,
) -> McpResult<Value> {
    #[derive(Deserialize)]
    struct EntityChangeParams {
        dashboard_id: String,
        #[serde(default)]
        entity_id: Value,
    }

    let params: EntityChangeParams = parse_arguments("dashboard_entity_changed", arguments)?;
    let cascade = state
        .dashboard(&params.dashboard_id)
        .await
        .ok_or_else(|| McpError::ExecutionFailed {
            message: format!("Unknown dashboard: {}", params.dashboard_id),
        })?;

    let report = cascade
        .observe_entity_change(normalize_entity_id(&params.entity_id))
        .await;
    dashboard_response(&cascade, json!(report)).await
}

fn build_widgets(state: &SharedState, specs: Vec<WidgetSpec>) -> Vec<Arc<dyn Widget>> {
    specs
        .into_iter()
        .map(|spec| -> Arc<dyn Widget> {
            let executor: Arc<dyn QueryExecutor> = Arc::clone(&state.executor);
            let widget = QueryWidget::new(
                spec.id,
                spec.query_id,
                spec.query_name,
                spec.parameters.into_iter().map(Parameter::new).collect(),
                executor,
            )
            .with_mappings(spec.mappings)
            .with_max_age(spec.max_age.unwrap_or(DEFAULT_MAX_AGE_SECS));
            Arc::new(widget)
        })
        .collect()
}

async fn dashboard_response(cascade: &DashboardCascade, report: Value) -> McpResult<Value> {
    let visible: Vec<i64> = cascade.visible_widgets().iter().map(|w| w.id()).collect();
    Ok(json!({
        "report": report,
        "state": cascade.state().await,
        "entity_id": cascade.entity_id().await,
        "visible_widgets": visible,
    }))
}

/// Handle query_render - validate values and render a query template
async fn handle_query_render(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    #[derive(Deserialize)]
    struct RenderParams {
        template: String,
        #[serde(default)]
        schema: Vec<ParameterDefinition>,
        #[serde(default)]
        values: HashMap<String, Value>,
    }

    #[derive(Serialize)]
    struct RenderResult {
        query: String,
        missing: Vec<String>,
        is_safe: bool,
    }

    execute_handler("query_render", arguments, |params: RenderParams| async move {
        let mut query = ParameterizedQuery::new(params.template, params.schema);
        query.apply(params.values, state.dropdowns.as_ref()).await?;
        Ok::<_, ValidationError>(RenderResult {
            query: query.text().to_string(),
            missing: query.missing_params().into_iter().collect(),
            is_safe: query.is_safe(),
        })
    })
    .await
}

/// Handle validate_pattern - check that a regular expression compiles
fn handle_validate_pattern(arguments: Option<Value>) -> McpResult<Value> {
    #[derive(Deserialize)]
    struct PatternParams {
        pattern: String,
    }

    let params: PatternParams = parse_arguments("validate_pattern", arguments)?;
    Ok(json!({ "valid": validate_pattern(&params.pattern) }))
}

fn new_controller(
    state: &SharedState,
    definitions: Vec<ParameterDefinition>,
) -> McpResult<Arc<SetController>> {
    ParameterSetController::from_definitions(Arc::clone(&state.dropdowns), definitions)
        .map(Arc::new)
        .map_err(execution_failed)
}

/// Apply the configured URL prefix to definitions still using the default.
fn with_url_prefix(mut definition: ParameterDefinition, prefix: &str) -> ParameterDefinition {
    if definition.url_prefix == DEFAULT_URL_PREFIX {
        definition.url_prefix = prefix.to_string();
    }
    definition
}

async fn require_set(state: &SharedState, set_id: &str) -> McpResult<Arc<SetController>> {
    state.controller(set_id).await.ok_or_else(|| unknown_set(set_id))
}

fn unknown_set(set_id: &str) -> McpError {
    McpError::ExecutionFailed {
        message: format!("Unknown parameter set: {}", set_id),
    }
}

fn execution_failed(e: impl Into<AppError>) -> McpError {
    McpError::from(e.into())
}

fn save_failed(e: &SaveError) -> McpError {
    let notification = e.notification();
    McpError::ExecutionFailed {
        message: format!("{} {}", notification.title, notification.message),
    }
}

/// Parse tool arguments into a typed struct
fn parse_arguments<T: serde::de::DeserializeOwned>(
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<T> {
    match arguments {
        Some(args) => serde_json::from_value(args).map_err(|e| McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: e.to_string(),
        }),
        None => Err(McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: "Missing arguments".to_string(),
        }),
    }
}

/// Generic handler that runs an operation with consistent error handling.
///
/// Parses `P` from the arguments, maps the operation's error into
/// [`McpError::ExecutionFailed`], and serializes the result.
async fn execute_handler<P, R, E, F, Fut>(
    tool_name: &str,
    arguments: Option<Value>,
    operation: F,
) -> McpResult<Value>
where
    P: serde::de::DeserializeOwned,
    R: Serialize,
    E: Into<AppError>,
    F: FnOnce(P) -> Fut,
    Fut: std::future::Future<Output = Result<R, E>>,
{
    let params: P = parse_arguments(tool_name, arguments)?;

    let result = operation(params).await.map_err(execution_failed)?;

    serde_json::to_value(result).map_err(McpError::Json)
}
