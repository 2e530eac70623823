//! Pre-flight validation: the configuration checks §7 says must "fail the facade
//! call before any task runs" — unknown actions, unresolved variable references,
//! unresolved link targets, and dependency cycles.
//!
//! Grounded on the teacher's `Graph::validate`/`GraphBuilder::compile` pair: the
//! teacher checks every edge target exists before a graph is ever executed, and
//! returns a validation error from `compile()` rather than discovering a dangling
//! edge mid-run. This module plays the same role for a [`FlowDocument`], generalized
//! to this engine's richer edge shape (template/link/lambda dependencies, not just
//! named edges) and to cycle detection, which the teacher's graph doesn't need since
//! its Pregel loop is explicitly designed to support cycles — this engine's
//! `ValueSpec` dependency graph must not contain any.
//!
//! Variables are only known at invocation time (they're a caller-supplied argument
//! to `run`/`stream`/`run_all`/`stream_all`), so this validation runs once per
//! facade call rather than once per loaded document — it's a pure, side-effect-free
//! walk of already-in-memory structures, cheap enough to repeat.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::action::ActionRegistry;
use crate::dependency::{extract_dependencies, free_roots, strip_root_marker};
use crate::error::{FlowError, Result};
use crate::model::{Executable, ExecutableId, FlowDocument, ValueSpec, Variables};
use crate::scheduler::FlowScope;

/// Walks every executable reachable from `doc` (including nested loop bodies) and
/// fails fast on the first configuration problem: an action invocation naming an
/// action `registry` doesn't know, a template/lambda root that resolves to neither
/// a known executable id nor a supplied variable, a link whose target doesn't
/// exist, or a cycle in the static dependency graph.
pub fn validate(doc: &FlowDocument, registry: &ActionRegistry, variables: &Variables) -> Result<()> {
    let scope = FlowScope::root(doc);
    let for_bound: HashSet<String> = HashSet::new();
    validate_scope(&doc.flow, &scope, registry, variables, &for_bound)
}

fn validate_scope(
    local: &IndexMap<ExecutableId, Executable>,
    scope: &Arc<FlowScope>,
    registry: &ActionRegistry,
    variables: &Variables,
    for_bound: &HashSet<String>,
) -> Result<()> {
    let known_ids = scope.known_ids();
    let known_refs: HashSet<&str> = known_ids.iter().map(String::as_str).collect();
    let mut var_names: HashSet<&str> = variables.keys().map(String::as_str).collect();
    for name in for_bound {
        var_names.insert(name.as_str());
    }
    let local_ids: HashSet<&str> = local.keys().map(String::as_str).collect();

    let mut adjacency: HashMap<String, HashSet<String>> = HashMap::new();

    for (id, executable) in local {
        let mut deps = HashSet::new();
        match executable {
            Executable::Action(invocation) => {
                if !registry.contains(&invocation.action) {
                    return Err(FlowError::UnknownAction(invocation.action.clone()));
                }
                for spec in invocation.fields.values() {
                    check_roots(spec, &known_refs, &var_names)?;
                    deps.extend(collect_local_deps(spec, &known_refs, &var_names, &local_ids));
                }
                if let Some(cache_key) = &invocation.cache_key {
                    check_roots(cache_key, &known_refs, &var_names)?;
                    deps.extend(collect_local_deps(cache_key, &known_refs, &var_names, &local_ids));
                }
            }
            Executable::Value(spec) => {
                check_roots(spec, &known_refs, &var_names)?;
                deps.extend(collect_local_deps(spec, &known_refs, &var_names, &local_ids));
            }
            Executable::Loop(loop_spec) => {
                check_roots(&loop_spec.in_, &known_refs, &var_names)?;
                deps.extend(collect_local_deps(&loop_spec.in_, &known_refs, &var_names, &local_ids));

                let child_scope = scope.child(loop_spec.flow.clone());
                let mut nested_for_bound = for_bound.clone();
                nested_for_bound.insert(loop_spec.for_.clone());
                validate_scope(&loop_spec.flow, &child_scope, registry, variables, &nested_for_bound)?;
            }
        }
        adjacency.insert(id.clone(), deps);
    }

    detect_cycle(&adjacency)
}

/// Every dependency of `spec` whose root lands on another id declared in this same
/// scope — the only edges that can participate in a cycle within this scope (an
/// edge to an outer id was already validated by the outer call and can't be part of
/// a cycle back into this one, since outer scopes never see into this one).
fn collect_local_deps(
    spec: &ValueSpec,
    known_refs: &HashSet<&str>,
    var_names: &HashSet<&str>,
    local_ids: &HashSet<&str>,
) -> HashSet<String> {
    let mut unresolved = Vec::new();
    extract_dependencies(spec, known_refs, var_names, &mut unresolved)
        .into_iter()
        .filter(|dep| local_ids.contains(dep.executable_id.as_str()))
        .map(|dep| dep.executable_id)
        .collect()
}

/// Checks every free root in `spec` resolves to either a known executable id or a
/// supplied variable. A bare `link` whose target is missing is reported as
/// [`FlowError::UnresolvedLink`] (it names an executable by construction); any other
/// unresolved root (from a template or lambda body) is reported as
/// [`FlowError::UnresolvedVariable`], since those read like ordinary identifiers a
/// caller forgot to bind.
fn check_roots(spec: &ValueSpec, known_refs: &HashSet<&str>, var_names: &HashSet<&str>) -> Result<()> {
    match spec {
        ValueSpec::Literal(_) => Ok(()),
        ValueSpec::Link { link, .. } => {
            let root = root_of(link);
            if known_refs.contains(root) || var_names.contains(root) {
                Ok(())
            } else {
                Err(FlowError::UnresolvedLink(root.to_string()))
            }
        }
        ValueSpec::Lambda { lambda, .. } => check_free_roots(lambda, known_refs, var_names),
        ValueSpec::Template(text) => check_free_roots(text, known_refs, var_names),
        ValueSpec::List(items) => {
            for item in items {
                check_roots(item, known_refs, var_names)?;
            }
            Ok(())
        }
        ValueSpec::Map(fields) => {
            for spec in fields.values() {
                check_roots(spec, known_refs, var_names)?;
            }
            Ok(())
        }
    }
}

fn check_free_roots(text: &str, known_refs: &HashSet<&str>, var_names: &HashSet<&str>) -> Result<()> {
    for root in free_roots(text) {
        if !known_refs.contains(root.as_str()) && !var_names.contains(root.as_str()) {
            return Err(FlowError::UnresolvedVariable(root));
        }
    }
    Ok(())
}

fn root_of(path: &str) -> &str {
    let path = strip_root_marker(path);
    path.split('.').next().unwrap_or(path).trim()
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Done,
}

/// Plain DFS cycle detection over the local-to-this-scope adjacency map. Reports
/// the first cycle found as a [`FlowError::Configuration`] naming the path that
/// closed the loop.
fn detect_cycle(adjacency: &HashMap<String, HashSet<String>>) -> Result<()> {
    let mut state: HashMap<&str, VisitState> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        adjacency: &'a HashMap<String, HashSet<String>>,
        state: &mut HashMap<&'a str, VisitState>,
        stack: &mut Vec<&'a str>,
    ) -> Result<()> {
        match state.get(node) {
            Some(VisitState::Done) => return Ok(()),
            Some(VisitState::Visiting) => {
                stack.push(node);
                let start = stack.iter().position(|n| *n == node).unwrap_or(0);
                let cycle = stack[start..].join(" -> ");
                return Err(FlowError::configuration(format!("dependency cycle detected: {cycle}")));
            }
            None => {}
        }
        state.insert(node, VisitState::Visiting);
        stack.push(node);
        if let Some(deps) = adjacency.get(node) {
            for dep in deps {
                visit(dep.as_str(), adjacency, state, stack)?;
            }
        }
        stack.pop();
        state.insert(node, VisitState::Done);
        Ok(())
    }

    for node in adjacency.keys() {
        if state.get(node.as_str()) != Some(&VisitState::Done) {
            visit(node.as_str(), adjacency, &mut state, &mut stack)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionContext, ActionDescriptor, ActionOutcome};
    use async_trait::async_trait;
    use serde_json::Value as JsonValue;

    struct Noop(ActionDescriptor);

    #[async_trait]
    impl Action for Noop {
        fn descriptor(&self) -> &ActionDescriptor {
            &self.0
        }
        async fn run(&self, ctx: ActionContext) -> Result<ActionOutcome> {
            Ok(ActionOutcome::Single(ctx.inputs))
        }
    }

    fn registry_with(name: &str) -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(Noop(ActionDescriptor::new(name))));
        registry
    }

    #[test]
    fn unknown_action_is_rejected_before_any_task_runs() {
        let yaml = r#"
version: "0.1"
flow:
  a:
    action: does_not_exist
    x: 1
"#;
        let doc: FlowDocument = serde_yaml::from_str(yaml).unwrap();
        let registry = ActionRegistry::new();
        let err = validate(&doc, &registry, &Variables::new()).unwrap_err();
        assert!(matches!(err, FlowError::UnknownAction(name) if name == "does_not_exist"));
    }

    #[test]
    fn unresolved_link_target_is_rejected() {
        let yaml = r#"
version: "0.1"
flow:
  a:
    action: noop
    x:
      link: "missing.result"
"#;
        let doc: FlowDocument = serde_yaml::from_str(yaml).unwrap();
        let registry = registry_with("noop");
        let err = validate(&doc, &registry, &Variables::new()).unwrap_err();
        assert!(matches!(err, FlowError::UnresolvedLink(root) if root == "missing"));
    }

    #[test]
    fn unresolved_template_root_is_rejected_as_unresolved_variable() {
        let yaml = r#"
version: "0.1"
flow:
  a:
    action: noop
    x: "{{ mystery }}"
"#;
        let doc: FlowDocument = serde_yaml::from_str(yaml).unwrap();
        let registry = registry_with("noop");
        let err = validate(&doc, &registry, &Variables::new()).unwrap_err();
        assert!(matches!(err, FlowError::UnresolvedVariable(root) if root == "mystery"));
    }

    #[test]
    fn caller_supplied_variable_resolves_cleanly() {
        let yaml = r#"
version: "0.1"
flow:
  a:
    action: noop
    x: "{{ who }}"
"#;
        let doc: FlowDocument = serde_yaml::from_str(yaml).unwrap();
        let registry = registry_with("noop");
        let mut vars = Variables::new();
        vars.insert("who".to_string(), JsonValue::String("alice".to_string()));
        assert!(validate(&doc, &registry, &vars).is_ok());
    }

    #[test]
    fn direct_self_cycle_is_rejected() {
        let yaml = r#"
version: "0.1"
flow:
  a:
    action: noop
    x: "{{ a.result }}"
"#;
        let doc: FlowDocument = serde_yaml::from_str(yaml).unwrap();
        let registry = registry_with("noop");
        let err = validate(&doc, &registry, &Variables::new()).unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
    }

    #[test]
    fn two_node_mutual_cycle_is_rejected() {
        let yaml = r#"
version: "0.1"
flow:
  a:
    action: noop
    x: "{{ b.result }}"
  b:
    action: noop
    x: "{{ a.result }}"
"#;
        let doc: FlowDocument = serde_yaml::from_str(yaml).unwrap();
        let registry = registry_with("noop");
        let err = validate(&doc, &registry, &Variables::new()).unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
    }

    #[test]
    fn acyclic_chain_passes_validation() {
        let yaml = r#"
version: "0.1"
flow:
  a:
    action: noop
    x: 1
  b:
    action: noop
    x: "{{ a.result }}"
"#;
        let doc: FlowDocument = serde_yaml::from_str(yaml).unwrap();
        let registry = registry_with("noop");
        assert!(validate(&doc, &registry, &Variables::new()).is_ok());
    }

    #[test]
    fn loop_for_binding_is_not_an_unresolved_variable() {
        let yaml = r#"
version: "0.1"
flow:
  items:
    for: item
    in: "{{ xs }}"
    flow:
      doubled:
        action: noop
        x: "{{ item }}"
"#;
        let doc: FlowDocument = serde_yaml::from_str(yaml).unwrap();
        let registry = registry_with("noop");
        let mut vars = Variables::new();
        vars.insert("xs".to_string(), JsonValue::Array(vec![JsonValue::from(1), JsonValue::from(2)]));
        assert!(validate(&doc, &registry, &vars).is_ok());
    }
}
