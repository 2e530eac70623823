//! Dependency extraction: given a [`ValueSpec`], which other executables does it
//! read from, and in streaming or terminal mode?
//!
//! Root-identifier extraction is delegated to `minijinja`'s own undeclared-variable
//! analysis (`Template::undeclared_variables`) rather than a hand-rolled expression
//! walker, so the free-root set stays correct as the expression grammar grows
//! filters, boolean operators, comprehensions, etc. — the engine never has to keep
//! a second parser in sync with the template engine's grammar.

use std::collections::HashSet;

use minijinja::Environment;

use crate::model::{ExecutableId, ValueSpec};

/// One dependency: the executable it points at, and whether the reader wants every
/// intermediate value (`streaming = true`) or only the terminal one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dependency {
    pub executable_id: ExecutableId,
    pub streaming: bool,
}

/// Walks `spec` and returns every executable it reads from.
///
/// `known_ids` is the set of executable ids valid in the current scope (the flow
/// plus any enclosing loop bodies); roots outside that set and not present in
/// `variable_names` are reported via `unresolved` rather than included as
/// dependencies — the caller substitutes `null` for those and logs a warning,
/// matching the "best-effort continuation" behavior at the root-resolution edge.
pub fn extract_dependencies(
    spec: &ValueSpec,
    known_ids: &HashSet<&str>,
    variable_names: &HashSet<&str>,
    unresolved: &mut Vec<String>,
) -> HashSet<Dependency> {
    let mut out = HashSet::new();
    collect(spec, known_ids, variable_names, &mut out, unresolved);
    out
}

fn collect(
    spec: &ValueSpec,
    known_ids: &HashSet<&str>,
    variable_names: &HashSet<&str>,
    out: &mut HashSet<Dependency>,
    unresolved: &mut Vec<String>,
) {
    match spec {
        ValueSpec::Literal(_) => {}
        ValueSpec::Link { link, streaming } => {
            add_root(link, *streaming, known_ids, variable_names, out, unresolved);
        }
        ValueSpec::Lambda { lambda, streaming } => {
            for root in free_roots(lambda) {
                add_root(&root, *streaming, known_ids, variable_names, out, unresolved);
            }
        }
        ValueSpec::Template(text) => {
            for root in free_roots(text) {
                // Bare templates don't carry an explicit streaming flag; they default
                // to non-streaming (wait for the dependency's terminal value), matching
                // the scheduler's default render cadence for plain `{{ }}` interpolation.
                add_root(&root, false, known_ids, variable_names, out, unresolved);
            }
        }
        ValueSpec::List(items) => {
            for item in items {
                collect(item, known_ids, variable_names, out, unresolved);
            }
        }
        ValueSpec::Map(fields) => {
            for spec in fields.values() {
                collect(spec, known_ids, variable_names, out, unresolved);
            }
        }
    }
}

/// Strip a leading `$.` (or bare `$`) root-namespace marker from a link path. The
/// document format uses `$` to mean "the flow's own root namespace" (§6); since
/// every scope already exposes its own ids plus every enclosing scope's, a link
/// simply resolves the same with or without the marker unless it's disambiguating
/// against a shadowed outer id — a case this implementation doesn't special-case
/// (see DESIGN.md).
pub(crate) fn strip_root_marker(path: &str) -> &str {
    path.strip_prefix("$.").or_else(|| path.strip_prefix('$')).unwrap_or(path)
}

fn add_root(
    path: &str,
    streaming: bool,
    known_ids: &HashSet<&str>,
    variable_names: &HashSet<&str>,
    out: &mut HashSet<Dependency>,
    unresolved: &mut Vec<String>,
) {
    let path = strip_root_marker(path);
    let root = path.split('.').next().unwrap_or(path).trim();
    if variable_names.contains(root) {
        return;
    }
    if known_ids.contains(root) {
        out.insert(Dependency {
            executable_id: root.to_string(),
            streaming,
        });
    } else {
        unresolved.push(root.to_string());
    }
}

/// The set of free (undeclared) root identifiers referenced by a template or
/// expression body. Wraps the text as a one-expression template so expressions and
/// full templates go through the same analysis path.
pub(crate) fn free_roots(text: &str) -> HashSet<String> {
    let wrapped = if text.trim_start().starts_with("{{") {
        text.to_string()
    } else {
        format!("{{{{ {text} }}}}")
    };
    let env = Environment::new();
    match env.template_from_str(&wrapped) {
        Ok(tmpl) => tmpl.undeclared_variables(false),
        Err(_) => HashSet::new(),
    }
}
