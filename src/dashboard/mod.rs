//! Entity-keyed dashboard loading.
//!
//! This module provides:
//! - [`Widget`] and the executor-backed [`QueryWidget`]
//! - [`ImplicitFilter`]: dashboard-scoped values injected by parameter role
//! - [`DashboardCascade`]: loads the entity widget first, derives the entity
//!   identifier from its result, then loads every other widget with it
//! - [`collect_dashboard_filters`]: filter set from widget results

mod filters;
mod widget;

pub use filters::*;
pub use widget::*;

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::EntityConfig;

/// Progress of the entity cascade
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityCascadeState {
    #[default]
    Idle,
    LoadingEntity,
    EntityFound,
    EntityEmpty,
    LoadingDependents,
    Settled,
}

/// Summary of one dashboard load.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardLoadReport {
    pub entity_widget: Option<i64>,
    pub entity_id: Option<Value>,
    /// Widgets loaded in the dependent pass, by id
    pub loaded: Vec<i64>,
    /// Widgets reloaded by the forced second pass
    pub refreshed: Vec<i64>,
    /// Widgets whose load returned an error
    pub failed: Vec<i64>,
    pub filters: Vec<DashboardFilter>,
}

#[derive(Debug, Default)]
struct CascadeInner {
    state: EntityCascadeState,
    entity_id: Option<Value>,
}

/// Widgets whose dashboard-level mappings target one of `updated`; every
/// widget when nothing was updated.
pub fn affected_widgets(
    widgets: &[Arc<dyn Widget>],
    updated: &[String],
) -> Vec<Arc<dyn Widget>> {
    if updated.is_empty() {
        return widgets.to_vec();
    }
    widgets
        .iter()
        .filter(|widget| {
            widget
                .parameter_mappings()
                .iter()
                .any(|m| m.kind == MappingType::DashboardLevel && updated.contains(&m.map_to))
        })
        .cloned()
        .collect()
}

/// Entity identifier of a result row: the first configured field holding a
/// non-null, non-empty value. Integer text becomes a number.
pub fn extract_entity_id(row: &Map<String, Value>, fields: &[String]) -> Option<Value> {
    fields
        .iter()
        .find_map(|field| row.get(field).and_then(normalize_entity_id))
}

/// `None` for null or blank text; integer text becomes a number.
pub fn normalize_entity_id(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(
            s.trim()
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| Value::String(s.clone())),
        ),
        other => Some(other.clone()),
    }
}

/// Loads a dashboard's widgets, keyed by an entity when an external key is
/// given.
pub struct DashboardCascade {
    widgets: Vec<Arc<dyn Widget>>,
    config: EntityConfig,
    external_key: Option<String>,
    query: HashMap<String, String>,
    inner: Mutex<CascadeInner>,
}

impl DashboardCascade {
    /// Create a cascade over `widgets`
    pub fn new(
        widgets: Vec<Arc<dyn Widget>>,
        config: EntityConfig,
        external_key: Option<String>,
    ) -> Self {
        Self {
            widgets,
            config,
            external_key: external_key.filter(|k| !k.is_empty()),
            query: HashMap::new(),
            inner: Mutex::new(CascadeInner::default()),
        }
    }

    /// Decoded URL query used for filter selections
    pub fn with_query(mut self, query: HashMap<String, String>) -> Self {
        self.query = query;
        self
    }

    /// Start from an identifier recorded by an earlier cascade
    pub fn with_entity_id(mut self, entity_id: Option<Value>) -> Self {
        self.inner.get_mut().entity_id = entity_id;
        self
    }

    /// External key the entity widget is loaded with
    pub fn external_key(&self) -> Option<&str> {
        self.external_key.as_deref()
    }

    /// Current cascade state
    pub async fn state(&self) -> EntityCascadeState {
        self.inner.lock().await.state
    }

    /// Last derived entity identifier
    pub async fn entity_id(&self) -> Option<Value> {
        self.inner.lock().await.entity_id.clone()
    }

    /// The widget whose query is the entity query
    pub fn entity_widget(&self) -> Option<Arc<dyn Widget>> {
        self.widgets
            .iter()
            .find(|w| {
                w.query_name()
                    .is_some_and(|name| name.eq_ignore_ascii_case(&self.config.query_name))
            })
            .cloned()
    }

    /// Widgets to display: the entity widget is hidden when keyed by an entity
    pub fn visible_widgets(&self) -> Vec<Arc<dyn Widget>> {
        if self.external_key.is_none() {
            return self.widgets.clone();
        }
        let entity = self.config.query_name.to_lowercase();
        self.widgets
            .iter()
            .filter(|w| {
                w.query_name()
                    .map_or(true, |name| !name.to_lowercase().contains(&entity))
            })
            .cloned()
            .collect()
    }

    /// Load the widgets affected by `updated_parameters` (all when empty).
    pub async fn load(
        &self,
        force_refresh: bool,
        updated_parameters: &[String],
    ) -> DashboardLoadReport {
        let affected = affected_widgets(&self.widgets, updated_parameters);

        let entity = match (&self.external_key, self.entity_widget()) {
            (Some(key), Some(entity)) => Some((key.clone(), entity)),
            _ => None,
        };
        let Some((key, entity)) = entity else {
            let (loaded, failed) = load_all(affected, WidgetLoadRequest::new(force_refresh)).await;
            let filters = self.collect_filters().await;
            self.transition(EntityCascadeState::Settled).await;
            return DashboardLoadReport {
                loaded,
                failed,
                filters,
                ..DashboardLoadReport::default()
            };
        };

        self.transition(EntityCascadeState::LoadingEntity).await;
        let key_filter = ImplicitFilter::new(
            self.config.key_role.clone(),
            &self.config.key_aliases,
            Value::String(key),
        );
        let mut failed = Vec::new();
        if let Err(e) = entity
            .load(WidgetLoadRequest::new(force_refresh).with_filter(key_filter))
            .await
        {
            warn!(widget = entity.id(), error = %e, "Entity widget load failed");
            failed.push(entity.id());
        }

        let entity_id = entity.query_result().await.and_then(|result| {
            result
                .first_row()
                .and_then(|row| extract_entity_id(row, &self.config.id_fields))
        });

        let newly_found = {
            let mut inner = self.inner.lock().await;
            let newly_found = entity_id.is_some() && inner.entity_id != entity_id;
            inner.entity_id = entity_id.clone();
            newly_found
        };
        match &entity_id {
            Some(id) => {
                info!(entity_id = %id, newly_found, "Entity identifier derived");
                self.transition(EntityCascadeState::EntityFound).await;
            }
            None => {
                warn!(widget = entity.id(), "Entity widget produced no identifier");
                self.transition(EntityCascadeState::EntityEmpty).await;
            }
        }

        self.transition(EntityCascadeState::LoadingDependents).await;
        let id_filter = self.id_filter(entity_id.clone());
        let others: Vec<_> = affected.into_iter().filter(|w| w.id() != entity.id()).collect();
        let request = WidgetLoadRequest::new(force_refresh).with_filter(id_filter.clone());
        let (loaded, mut dependent_failed) = load_all(others, request).await;
        failed.append(&mut dependent_failed);

        let mut refreshed = Vec::new();
        if newly_found {
            let everyone: Vec<_> = self
                .widgets
                .iter()
                .filter(|w| w.id() != entity.id())
                .cloned()
                .collect();
            let (done, mut refresh_failed) =
                load_all(everyone, WidgetLoadRequest::new(true).with_filter(id_filter)).await;
            refreshed = done;
            failed.append(&mut refresh_failed);
        }

        let filters = self.collect_filters().await;
        self.transition(EntityCascadeState::Settled).await;
        failed.sort_unstable();
        failed.dedup();

        DashboardLoadReport {
            entity_widget: Some(entity.id()),
            entity_id,
            loaded,
            refreshed,
            failed,
            filters,
        }
    }

    /// Record an externally observed identifier; when it changed, reload
    /// every non-entity widget with it.
    ///
    /// Returns `None` when nothing had to be reloaded.
    pub async fn observe_entity_change(
        &self,
        entity_id: Option<Value>,
    ) -> Option<DashboardLoadReport> {
        {
            let mut inner = self.inner.lock().await;
            if inner.entity_id == entity_id {
                return None;
            }
            inner.entity_id = entity_id.clone();
        }

        let id = entity_id.clone()?;
        self.external_key.as_ref()?;
        let entity = self.entity_widget()?;

        info!(entity_id = %id, "Entity identifier changed, refreshing widgets");
        self.transition(EntityCascadeState::LoadingDependents).await;
        let others: Vec<_> = self
            .widgets
            .iter()
            .filter(|w| w.id() != entity.id())
            .cloned()
            .collect();
        let request = WidgetLoadRequest::new(true).with_filter(self.id_filter(entity_id.clone()));
        let (refreshed, failed) = load_all(others, request).await;
        let filters = self.collect_filters().await;
        self.transition(EntityCascadeState::Settled).await;

        Some(DashboardLoadReport {
            entity_widget: Some(entity.id()),
            entity_id,
            refreshed,
            failed,
            filters,
            ..DashboardLoadReport::default()
        })
    }

    fn id_filter(&self, entity_id: Option<Value>) -> ImplicitFilter {
        ImplicitFilter::new(
            self.config.filter_role.clone(),
            &self.config.filter_aliases,
            entity_id.unwrap_or(Value::Null),
        )
    }

    async fn collect_filters(&self) -> Vec<DashboardFilter> {
        let mut results = Vec::new();
        for widget in &self.widgets {
            if let Some(result) = widget.query_result().await {
                results.push(result);
            }
        }
        collect_dashboard_filters(&results, &self.query, &self.config.hidden_filter_names)
    }

    async fn transition(&self, state: EntityCascadeState) {
        self.inner.lock().await.state = state;
        info!(state = ?state, "Dashboard cascade state");
    }
}

/// Load `widgets` concurrently; returns (loaded, failed) widget ids, sorted.
async fn load_all(
    widgets: Vec<Arc<dyn Widget>>,
    request: WidgetLoadRequest,
) -> (Vec<i64>, Vec<i64>) {
    let mut tasks = JoinSet::new();
    for widget in widgets {
        let request = request.clone();
        tasks.spawn(async move {
            let id = widget.id();
            (id, widget.load(request).await)
        });
    }

    let mut loaded = Vec::new();
    let mut failed = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((id, Ok(()))) => loaded.push(id),
            Ok((id, Err(e))) => {
                warn!(widget = id, error = %e, "Widget load failed");
                failed.push(id);
            }
            Err(e) => warn!(error = %e, "Widget load task aborted"),
        }
    }
    loaded.sort_unstable();
    failed.sort_unstable();
    (loaded, failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Map<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    fn fields() -> Vec<String> {
        EntityConfig::default().id_fields
    }

    #[test]
    fn test_extract_entity_id_priority() {
        let found = extract_entity_id(&row(json!({"id": 9, "entity_id": 42})), &fields());
        assert_eq!(found, Some(json!(42)));
    }

    #[test]
    fn test_extract_entity_id_skips_null_and_empty() {
        let found = extract_entity_id(
            &row(json!({"entityId": null, "company_id": " ", "id": "17"})),
            &fields(),
        );
        assert_eq!(found, Some(json!(17)));
        assert_eq!(extract_entity_id(&row(json!({"other": 1})), &fields()), None);
    }

    #[test]
    fn test_extract_entity_id_keeps_non_numeric_text() {
        let found = extract_entity_id(&row(json!({"entityId": "abc-1"})), &fields());
        assert_eq!(found, Some(json!("abc-1")));
    }
}
