//! Live parameter set: pending edits, cascades, apply, and reordering.
//!
//! Every mutation takes the state lock for its whole duration, including the
//! backend calls of a cascade, so observers only ever see a fully resolved
//! set and two cascades never interleave.

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use super::cascade::{check_acyclic, CascadeResolver, ParameterSnapshot};
use super::loader::OptionRequestGuard;
use super::url::{merge_url_params, HideList};
use super::{Parameter, ParameterDefinition};
use crate::backend::{DropdownBackend, DropdownOption};
use crate::error::{CascadeError, CascadeResult};

const EVENT_CAPACITY: usize = 64;

/// Notifications emitted after a mutation has been committed.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterEvent {
    /// A pending value changed; `resolved` lists the dependents reloaded.
    PendingValuesChanged { changed: String, resolved: Vec<String> },
    /// Pending values were committed
    ValuesApplied { names: Vec<String> },
    /// Parameter definitions or their order changed
    ParametersEdited,
}

/// Result of a guarded option load.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LoadOutcome {
    /// Options were stored and `value` is the selection after validation
    Applied {
        options: Vec<DropdownOption>,
        value: Value,
    },
    /// A newer request or a query change superseded this one
    Stale,
    /// The parameter has no dropdown query
    Skipped,
}

struct ControllerState {
    snapshot: ParameterSnapshot,
    requests: OptionRequestGuard,
}

/// Owner of one parameter set and its option cache.
pub struct ParameterSetController<B: ?Sized> {
    backend: Arc<B>,
    state: Mutex<ControllerState>,
    events: broadcast::Sender<ParameterEvent>,
}

impl<B: DropdownBackend + ?Sized> ParameterSetController<B> {
    /// Create a controller; parameter names must be unique.
    pub fn new(backend: Arc<B>, parameters: Vec<Parameter>) -> CascadeResult<Self> {
        let mut seen = HashSet::new();
        for parameter in &parameters {
            if !seen.insert(parameter.name.as_str()) {
                return Err(CascadeError::DuplicateName {
                    name: parameter.name.clone(),
                });
            }
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            backend,
            state: Mutex::new(ControllerState {
                snapshot: ParameterSnapshot::new(parameters),
                requests: OptionRequestGuard::new(),
            }),
            events,
        })
    }

    /// Create a controller from stored definitions
    pub fn from_definitions(
        backend: Arc<B>,
        definitions: Vec<ParameterDefinition>,
    ) -> CascadeResult<Self> {
        Self::new(backend, definitions.into_iter().map(Parameter::new).collect())
    }

    /// Current parameters, in order
    pub async fn parameters(&self) -> Vec<Parameter> {
        self.state.lock().await.snapshot.parameters.clone()
    }

    /// Current parameters plus option cache
    pub async fn snapshot(&self) -> ParameterSnapshot {
        self.state.lock().await.snapshot.clone()
    }

    /// Cached options of `name`, if any were loaded
    pub async fn options_for(&self, name: &str) -> Option<Vec<DropdownOption>> {
        self.state.lock().await.snapshot.options.get(name).cloned()
    }

    /// Receive events for mutations committed from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ParameterEvent> {
        self.events.subscribe()
    }

    /// Set (or with `is_dirty == false`, clear) the pending value of `name`
    /// and cascade the new value through its dependents.
    ///
    /// Returns the dependents reloaded, in resolution order. On error the
    /// set is left unchanged.
    pub async fn set_pending_value(
        &self,
        name: &str,
        value: Value,
        is_dirty: bool,
    ) -> CascadeResult<Vec<String>> {
        let mut state = self.state.lock().await;
        let index = state
            .snapshot
            .position(name)
            .ok_or_else(|| CascadeError::UnknownParameter {
                name: name.to_string(),
            })?;

        let mut working = state.snapshot.clone();
        let target = &mut working.parameters[index];
        if is_dirty {
            target.set_pending_value(value);
        } else {
            target.clear_pending_value();
        }
        let effective = target.effective_value().clone();

        info!(parameter = %name, is_dirty, "Cascading parameter change");
        let outcome = CascadeResolver::new(self.backend.as_ref())
            .resolve(name, effective, &working)
            .await?;

        for resolved in &outcome.resolved {
            state.requests.supersede(resolved);
        }
        state.snapshot = outcome.snapshot;
        drop(state);

        let _ = self.events.send(ParameterEvent::PendingValuesChanged {
            changed: name.to_string(),
            resolved: outcome.resolved.clone(),
        });
        Ok(outcome.resolved)
    }

    /// Commit every pending value; returns the parameters that changed.
    pub async fn apply_all(&self) -> Vec<Parameter> {
        let mut state = self.state.lock().await;
        let mut applied = Vec::new();
        for parameter in state.snapshot.parameters.iter_mut() {
            if parameter.has_pending_value() {
                parameter.apply_pending_value();
                applied.push(parameter.clone());
            } else {
                parameter.clear_pending_value();
            }
        }
        drop(state);

        let names: Vec<String> = applied.iter().map(|p| p.name.clone()).collect();
        debug!(applied = names.len(), "Applied pending values");
        let _ = self.events.send(ParameterEvent::ValuesApplied { names });
        applied
    }

    /// Number of parameters with a pending value
    pub async fn dirty_count(&self) -> usize {
        self.state
            .lock()
            .await
            .snapshot
            .parameters
            .iter()
            .filter(|p| p.has_pending_value())
            .count()
    }

    /// Move the parameter at `old_index` to `new_index`.
    pub async fn reorder(&self, old_index: usize, new_index: usize) -> CascadeResult<()> {
        let mut state = self.state.lock().await;
        let len = state.snapshot.parameters.len();
        for index in [old_index, new_index] {
            if index >= len {
                return Err(CascadeError::IndexOutOfRange { index, len });
            }
        }
        if old_index == new_index {
            return Ok(());
        }

        let moved = state.snapshot.parameters.remove(old_index);
        state.snapshot.parameters.insert(new_index, moved);
        drop(state);

        let _ = self.events.send(ParameterEvent::ParametersEdited);
        Ok(())
    }

    /// Replace the parameter at `index` with an edited definition.
    ///
    /// Rejects a name already used by another parameter and edits that
    /// would close a dependency cycle.
    pub async fn replace_definition(
        &self,
        index: usize,
        definition: ParameterDefinition,
    ) -> CascadeResult<()> {
        let mut state = self.state.lock().await;
        let len = state.snapshot.parameters.len();
        if index >= len {
            return Err(CascadeError::IndexOutOfRange { index, len });
        }
        let clash = state
            .snapshot
            .parameters
            .iter()
            .enumerate()
            .any(|(i, p)| i != index && p.name == definition.name);
        if clash {
            return Err(CascadeError::DuplicateName {
                name: definition.name,
            });
        }

        let replacement = Parameter::new(definition);
        let mut parameters = state.snapshot.parameters.clone();
        let previous = std::mem::replace(&mut parameters[index], replacement);
        check_acyclic(&parameters, &parameters[index].name)?;

        state.snapshot.parameters = parameters;
        state.snapshot.options.remove(&previous.name);
        state.requests.forget(&previous.name);
        drop(state);

        let _ = self.events.send(ParameterEvent::ParametersEdited);
        Ok(())
    }

    /// Remove the parameter called `name`
    pub async fn remove(&self, name: &str) -> CascadeResult<Parameter> {
        let mut state = self.state.lock().await;
        let index = state
            .snapshot
            .position(name)
            .ok_or_else(|| CascadeError::UnknownParameter {
                name: name.to_string(),
            })?;
        let removed = state.snapshot.parameters.remove(index);
        state.snapshot.options.remove(name);
        state.requests.forget(name);
        drop(state);

        let _ = self.events.send(ParameterEvent::ParametersEdited);
        Ok(removed)
    }

    /// Load the options of `name` and keep its selection valid.
    ///
    /// The state lock is released while the backend call is in flight; a
    /// response that is no longer current on return is dropped. When the
    /// selection had to change, the corrected value is set as pending and
    /// cascaded.
    pub async fn load_options(&self, name: &str) -> CascadeResult<LoadOutcome> {
        let (parameter, context) = {
            let mut state = self.state.lock().await;
            let parameter = state
                .snapshot
                .get(name)
                .cloned()
                .ok_or_else(|| CascadeError::UnknownParameter {
                    name: name.to_string(),
                })?;
            if parameter.query_id.is_none() {
                return Ok(LoadOutcome::Skipped);
            }
            let context = state.requests.issue(name, parameter.query_id);
            (parameter, context)
        };

        let options = parameter.load_dropdown_values(self.backend.as_ref()).await;

        let (value, needs_update) = {
            let mut state = self.state.lock().await;
            let current = state.snapshot.get(name).map(|p| p.query_id);
            let is_current = current
                .is_some_and(|query_id| state.requests.is_current(name, context, query_id));
            if !is_current {
                debug!(
                    parameter = %name,
                    ticket = context.ticket,
                    "Dropping stale option response"
                );
                return Ok(LoadOutcome::Stale);
            }

            state.snapshot.options.insert(name.to_string(), options.clone());
            let Some(current) = state.snapshot.get(name) else {
                return Ok(LoadOutcome::Stale);
            };
            let selected = select_valid_value(current, &options);
            let needs_update = selected != *current.effective_value();
            (selected, needs_update)
        };

        if needs_update {
            debug!(parameter = %name, value = %value, "Correcting selection to a loaded option");
            self.set_pending_value(name, value.clone(), true).await?;
        }

        Ok(LoadOutcome::Applied { options, value })
    }

    /// Merged URL parameters of the applied values
    pub async fn url_params(&self) -> std::collections::BTreeMap<String, Option<String>> {
        merge_url_params(&self.state.lock().await.snapshot.parameters)
    }

    /// Read applied values from decoded URL query pairs
    pub async fn apply_url_params(&self, query: &HashMap<String, String>) {
        let mut state = self.state.lock().await;
        for parameter in state.snapshot.parameters.iter_mut() {
            parameter.from_url_params(query);
        }
        drop(state);

        let _ = self.events.send(ParameterEvent::ParametersEdited);
    }

    /// Parameters not flagged hidden and not named in `hide`
    pub async fn visible_parameters(&self, hide: &HideList) -> Vec<Parameter> {
        self.state
            .lock()
            .await
            .snapshot
            .parameters
            .iter()
            .filter(|p| !p.hidden && !hide.hides(&p.name) && !hide.hides(&p.title))
            .cloned()
            .collect()
    }

    /// Persistable definitions of every parameter
    pub async fn saveable(&self) -> Vec<ParameterDefinition> {
        self.state
            .lock()
            .await
            .snapshot
            .parameters
            .iter()
            .map(Parameter::to_saveable_object)
            .collect()
    }
}

/// Selection of `parameter` restricted to `options`.
///
/// Multi-value parameters keep the values present in the options. Single
/// values are kept when offered, otherwise the first option is chosen.
pub fn select_valid_value(parameter: &Parameter, options: &[DropdownOption]) -> Value {
    let current = parameter.effective_value();
    if parameter.is_multi() {
        let selected: Vec<Value> = match current {
            Value::Array(items) => items.clone(),
            Value::Null => Vec::new(),
            other => vec![other.clone()],
        }
        .into_iter()
        .filter(|v| options.iter().any(|o| o.value == *v))
        .collect();
        return parameter.normalize_value(&Value::Array(selected));
    }

    if options.iter().any(|o| o.value == *current) {
        current.clone()
    } else {
        options
            .first()
            .map(|o| parameter.normalize_value(&o.value))
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockDropdownBackend;
    use crate::parameters::{MultiValuesOptions, ParameterType, ParentLink};
    use serde_json::json;

    fn param(name: &str, parents: &[&str]) -> Parameter {
        let mut def = ParameterDefinition::new(name, ParameterType::DependentFilters);
        def.parent_parameter = Some(parents.iter().map(|p| ParentLink::new(*p)).collect());
        Parameter::new(def)
    }

    fn controller(parameters: Vec<Parameter>) -> ParameterSetController<MockDropdownBackend> {
        ParameterSetController::new(Arc::new(MockDropdownBackend::new()), parameters).unwrap()
    }

    #[test]
    fn test_new_rejects_duplicate_names() {
        let result = ParameterSetController::new(
            Arc::new(MockDropdownBackend::new()),
            vec![param("a", &[]), param("a", &[])],
        );
        assert!(matches!(result, Err(CascadeError::DuplicateName { name }) if name == "a"));
    }

    #[tokio::test]
    async fn test_set_pending_without_dependents() {
        let controller = controller(vec![param("a", &[])]);
        let mut events = controller.subscribe();

        let resolved = controller.set_pending_value("a", json!("x"), true).await.unwrap();
        assert!(resolved.is_empty());
        assert_eq!(controller.dirty_count().await, 1);
        assert_eq!(
            events.recv().await.unwrap(),
            ParameterEvent::PendingValuesChanged {
                changed: "a".to_string(),
                resolved: vec![]
            }
        );
    }

    #[tokio::test]
    async fn test_set_pending_not_dirty_clears() {
        let controller = controller(vec![param("a", &[])]);
        controller.set_pending_value("a", json!("x"), true).await.unwrap();
        controller.set_pending_value("a", json!("x"), false).await.unwrap();
        assert_eq!(controller.dirty_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_parameter() {
        let controller = controller(vec![param("a", &[])]);
        let err = controller.set_pending_value("z", json!(1), true).await.unwrap_err();
        assert_eq!(err, CascadeError::UnknownParameter { name: "z".to_string() });
    }

    #[tokio::test]
    async fn test_apply_all_returns_changed() {
        let controller = controller(vec![param("a", &[]), param("b", &[])]);
        controller.set_pending_value("b", json!("y"), true).await.unwrap();

        let applied = controller.apply_all().await;
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].name, "b");
        assert_eq!(applied[0].value(), &json!("y"));
        assert_eq!(controller.dirty_count().await, 0);
    }

    #[tokio::test]
    async fn test_reorder() {
        let controller = controller(vec![param("a", &[]), param("b", &[]), param("c", &[])]);
        controller.reorder(0, 2).await.unwrap();
        let names: Vec<_> = controller.parameters().await.into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["b", "c", "a"]);

        assert_eq!(
            controller.reorder(0, 3).await.unwrap_err(),
            CascadeError::IndexOutOfRange { index: 3, len: 3 }
        );
    }

    #[tokio::test]
    async fn test_reorder_same_index_emits_nothing() {
        let controller = controller(vec![param("a", &[]), param("b", &[])]);
        let mut events = controller.subscribe();
        controller.reorder(1, 1).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_replace_definition_rejects_cycle_and_duplicate() {
        let controller = controller(vec![param("a", &[]), param("b", &["a"])]);

        let mut cyclic = ParameterDefinition::new("a", ParameterType::DependentFilters);
        cyclic.parent_parameter = Some(vec![ParentLink::new("b")]);
        assert!(matches!(
            controller.replace_definition(0, cyclic).await,
            Err(CascadeError::CyclicDependency { .. })
        ));

        let duplicate = ParameterDefinition::new("b", ParameterType::Text);
        assert!(matches!(
            controller.replace_definition(0, duplicate).await,
            Err(CascadeError::DuplicateName { .. })
        ));

        let renamed = ParameterDefinition::new("root", ParameterType::Text);
        controller.replace_definition(0, renamed).await.unwrap();
        assert_eq!(controller.parameters().await[0].name, "root");
    }

    #[tokio::test]
    async fn test_remove() {
        let controller = controller(vec![param("a", &[]), param("b", &[])]);
        let removed = controller.remove("a").await.unwrap();
        assert_eq!(removed.name, "a");
        assert_eq!(controller.parameters().await.len(), 1);
        assert!(controller.remove("a").await.is_err());
    }

    #[tokio::test]
    async fn test_load_options_skipped_without_query() {
        let controller = controller(vec![param("a", &[])]);
        assert_eq!(controller.load_options("a").await.unwrap(), LoadOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_load_options_corrects_selection() {
        let mut backend = MockDropdownBackend::new();
        backend
            .expect_fetch_dropdown()
            .returning(|_, _| {
                Ok(vec![
                    DropdownOption::new("East", "e"),
                    DropdownOption::new("West", "w"),
                ])
            });

        let mut def = ParameterDefinition::new("region", ParameterType::DependentFilters);
        def.query_id = Some(1);
        def.value = json!("north");
        let controller =
            ParameterSetController::new(Arc::new(backend), vec![Parameter::new(def)]).unwrap();

        let outcome = controller.load_options("region").await.unwrap();
        assert!(matches!(outcome, LoadOutcome::Applied { ref value, .. } if *value == json!("e")));
        let region = &controller.parameters().await[0];
        assert_eq!(region.effective_value(), &json!("e"));
        assert_eq!(controller.options_for("region").await.unwrap().len(), 2);
    }

    #[test]
    fn test_select_valid_value_multi_intersects() {
        let mut def = ParameterDefinition::new("city", ParameterType::DependentFilters);
        def.multi_values_options = Some(MultiValuesOptions::default());
        def.value = json!(["a", "b", "z"]);
        let p = Parameter::new(def);
        let options = vec![DropdownOption::new("A", "a"), DropdownOption::new("B", "b")];
        assert_eq!(select_valid_value(&p, &options), json!(["a", "b"]));
        assert_eq!(select_valid_value(&p, &[]), Value::Null);
    }

    #[tokio::test]
    async fn test_visible_parameters() {
        let mut hidden = ParameterDefinition::new("entity_id", ParameterType::Number);
        hidden.hidden = true;
        let controller = controller(vec![
            param("region", &[]),
            param("city", &[]),
            Parameter::new(hidden),
        ]);

        let visible = controller.visible_parameters(&HideList::new(["Region"])).await;
        let names: Vec<_> = visible.into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["city"]);
    }

    #[tokio::test]
    async fn test_url_params_round_trip() {
        let controller = controller(vec![param("region", &[])]);
        let mut query = HashMap::new();
        query.insert("p_region".to_string(), "west".to_string());
        controller.apply_url_params(&query).await;

        let params = controller.url_params().await;
        assert_eq!(params["p_region"].as_deref(), Some("west"));
    }
}
