//! Dependency cascade resolution.
//!
//! When a parameter's effective value changes, every parameter that lists it
//! as a parent reloads its options, takes the first option as its pending
//! value, and passes that value on to its own dependents. Resolution is
//! sequential and depth-first in parameter order.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, info};

use super::Parameter;
use crate::backend::{DropdownBackend, DropdownOption};
use crate::error::{CascadeError, CascadeResult};

/// Most recently loaded options per parameter name.
pub type OptionCache = HashMap<String, Vec<DropdownOption>>;

/// Parameters plus their option cache, as one consistent state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSnapshot {
    pub parameters: Vec<Parameter>,
    pub options: OptionCache,
}

impl ParameterSnapshot {
    /// Snapshot with no cached options
    pub fn new(parameters: Vec<Parameter>) -> Self {
        Self {
            parameters,
            options: OptionCache::new(),
        }
    }

    /// Index of the parameter called `name`
    pub fn position(&self, name: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p.name == name)
    }

    /// Parameter called `name`
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// Outcome of one cascade: the new state and the parameters reloaded, in
/// the order they were resolved (a parameter with several changed parents
/// appears once per parent).
#[derive(Debug, Clone)]
pub struct CascadeOutcome {
    pub snapshot: ParameterSnapshot,
    pub resolved: Vec<String>,
}

/// Parameters naming `parent` in their `parent_parameter`, in list order.
pub fn direct_children<'a>(
    parameters: &'a [Parameter],
    parent: &'a str,
) -> impl DoubleEndedIterator<Item = &'a Parameter> + 'a {
    parameters.iter().filter(move |p| p.depends_on(parent))
}

/// Fail if a dependency cycle is reachable from `root`.
pub fn check_acyclic(parameters: &[Parameter], root: &str) -> CascadeResult<()> {
    fn visit(
        parameters: &[Parameter],
        name: &str,
        path: &mut Vec<String>,
        finished: &mut HashSet<String>,
    ) -> CascadeResult<()> {
        path.push(name.to_string());
        for child in direct_children(parameters, name) {
            if path.contains(&child.name) {
                path.push(child.name.clone());
                return Err(CascadeError::CyclicDependency {
                    path: path.join(" -> "),
                });
            }
            if !finished.contains(&child.name) {
                visit(parameters, &child.name, path, finished)?;
            }
        }
        path.pop();
        finished.insert(name.to_string());
        Ok(())
    }

    visit(parameters, root, &mut Vec::new(), &mut HashSet::new())
}

/// One pending unit of work: reload `child` because `parent` became `value`.
struct Step {
    child: String,
    parent: String,
    value: Value,
}

/// Resolves cascades against a dropdown backend.
pub struct CascadeResolver<'a, B: ?Sized> {
    backend: &'a B,
}

impl<'a, B: DropdownBackend + ?Sized> CascadeResolver<'a, B> {
    /// Create a resolver using `backend` for option loads
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    /// Propagate `changed` taking `new_value` through all its descendants.
    ///
    /// The input snapshot is not modified; the returned snapshot holds the
    /// updated parameters and options. Cycles reachable from `changed` are
    /// rejected before any option is loaded.
    pub async fn resolve(
        &self,
        changed: &str,
        new_value: Value,
        snapshot: &ParameterSnapshot,
    ) -> CascadeResult<CascadeOutcome> {
        if snapshot.position(changed).is_none() {
            return Err(CascadeError::UnknownParameter {
                name: changed.to_string(),
            });
        }
        check_acyclic(&snapshot.parameters, changed)?;

        let start = Instant::now();
        let mut next = snapshot.clone();
        let mut resolved = Vec::new();
        let mut stack = children_steps(&next.parameters, changed, &new_value);

        while let Some(step) = stack.pop() {
            let Some(index) = next.position(&step.child) else {
                continue;
            };

            let mut child = next.parameters[index].clone();
            child.update_parent_value(&step.parent, step.value);

            let options = child.load_dropdown_values(self.backend).await;
            let child_value = options
                .first()
                .map(|option| option.value.clone())
                .unwrap_or(Value::Null);
            child.set_pending_value(child_value.clone());

            debug!(
                parameter = %child.name,
                parent = %step.parent,
                options = options.len(),
                value = %child_value,
                "Resolved dependent parameter"
            );

            next.options.insert(child.name.clone(), options);
            next.parameters[index] = child;
            resolved.push(step.child.clone());

            stack.extend(children_steps(&next.parameters, &step.child, &child_value));
        }

        info!(
            parameter = %changed,
            resolved = resolved.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Cascade complete"
        );

        Ok(CascadeOutcome {
            snapshot: next,
            resolved,
        })
    }
}

/// Steps for the children of `parent`, reversed so the first child pops first.
fn children_steps(parameters: &[Parameter], parent: &str, value: &Value) -> Vec<Step> {
    direct_children(parameters, parent)
        .rev()
        .map(|child| Step {
            child: child.name.clone(),
            parent: parent.to_string(),
            value: value.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::{ParameterDefinition, ParameterType, ParentLink};

    fn param(name: &str, parents: &[&str]) -> Parameter {
        let mut def = ParameterDefinition::new(name, ParameterType::DependentFilters);
        def.parent_parameter = Some(parents.iter().map(|p| ParentLink::new(*p)).collect());
        Parameter::new(def)
    }

    #[test]
    fn test_direct_children_in_order() {
        let params = vec![
            param("a", &[]),
            param("c", &["a"]),
            param("b", &["a"]),
            param("d", &["c"]),
        ];
        let names: Vec<_> = direct_children(&params, "a").map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["c", "b"]);
    }

    #[test]
    fn test_check_acyclic_accepts_diamond() {
        let params = vec![
            param("a", &[]),
            param("b", &["a"]),
            param("c", &["a"]),
            param("d", &["b", "c"]),
        ];
        assert!(check_acyclic(&params, "a").is_ok());
    }

    #[test]
    fn test_check_acyclic_rejects_cycle() {
        let params = vec![param("a", &["c"]), param("b", &["a"]), param("c", &["b"])];
        let err = check_acyclic(&params, "a").unwrap_err();
        assert_eq!(
            err,
            CascadeError::CyclicDependency {
                path: "a -> b -> c -> a".to_string()
            }
        );
    }

    #[test]
    fn test_check_acyclic_rejects_self_dependency() {
        let params = vec![param("a", &["a"])];
        assert!(matches!(
            check_acyclic(&params, "a"),
            Err(CascadeError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = ParameterSnapshot::new(vec![param("a", &[]), param("b", &["a"])]);
        assert_eq!(snapshot.position("b"), Some(1));
        assert!(snapshot.get("z").is_none());
    }
}
