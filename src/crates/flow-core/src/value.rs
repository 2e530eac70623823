//! Value rendering: turns a [`ValueSpec`] plus a render context into a concrete
//! value, or the [`Rendered::Undefined`] sentinel when some dependency hasn't
//! produced a value yet.
//!
//! Rendering must never raise — a `{{ }}` that reaches into a path that doesn't
//! exist yet is exactly as valid as one that does; it just isn't ready. That's the
//! whole reason this module routes through [`Rendered`] instead of plain
//! `serde_json::Value`: "undefined" has to be distinguishable from `null`.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use minijinja::value::Value as JinjaValue;
use minijinja::Environment;
use serde_json::Value as JsonValue;

use crate::error::Result;
use crate::model::{ExecutableId, ValueSpec, Variables};

/// The context a [`ValueSpec`] is rendered against: each dependency's current
/// output, plus the caller's variable bindings. Assembled fresh for every render —
/// dependency outputs change as the scheduler streams new snapshots.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    pub outputs: BTreeMap<ExecutableId, JsonValue>,
    pub variables: Variables,
}

impl RenderContext {
    pub fn new(variables: Variables) -> Self {
        RenderContext {
            outputs: BTreeMap::new(),
            variables,
        }
    }

    pub fn with_output(mut self, id: ExecutableId, value: JsonValue) -> Self {
        self.outputs.insert(id, value);
        self
    }

    fn to_jinja_context(&self) -> JinjaValue {
        let mut map = serde_json::Map::with_capacity(self.variables.len() + self.outputs.len());
        for (k, v) in &self.variables {
            map.insert(k.clone(), v.clone());
        }
        // Executable outputs take precedence over identically-named variables —
        // outputs are the whole point of referencing another executable by id.
        for (k, v) in &self.outputs {
            map.insert(k.clone(), v.clone());
        }
        JinjaValue::from_serialize(&JsonValue::Object(map))
    }
}

/// The result of rendering a [`ValueSpec`]: either a concrete value or the sentinel
/// meaning "at least one dependency hasn't produced anything yet". Undefined is not
/// an error — callers treat it as "try again once more dependencies have values".
#[derive(Debug, Clone, PartialEq)]
pub enum Rendered {
    Value(JsonValue),
    Undefined,
}

impl Rendered {
    pub fn into_option(self) -> Option<JsonValue> {
        match self {
            Rendered::Value(v) => Some(v),
            Rendered::Undefined => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Rendered::Undefined)
    }
}

fn jinja_to_json(value: JinjaValue) -> Rendered {
    if value.is_undefined() {
        return Rendered::Undefined;
    }
    match serde_json::to_value(&value) {
        Ok(json) => Rendered::Value(json),
        Err(_) => Rendered::Undefined,
    }
}

/// Wraps a `minijinja::Environment` configured the way this engine needs it:
/// lenient undefined handling for ordinary string templates (an undefined
/// sub-expression renders as empty text rather than raising), with a separate
/// expression-compilation path for templates whose entire body is a single `{{ }}`
/// span, so those can yield structured values instead of stringifying.
pub struct Renderer {
    env: Environment<'static>,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer {
    pub fn new() -> Self {
        let env = Environment::new();
        Renderer { env }
    }

    /// Render a [`ValueSpec`] against `ctx`. Never returns `Err` for an undefined
    /// dependency — only for genuine template syntax errors, which are treated as
    /// configuration problems upstream.
    pub fn render(&self, spec: &ValueSpec, ctx: &RenderContext) -> Result<Rendered> {
        match spec {
            ValueSpec::Literal(json) => Ok(Rendered::Value(json.clone())),
            ValueSpec::Link { link, .. } => self.render_link(link, ctx),
            ValueSpec::Lambda { lambda, .. } => self.render_expression(lambda, ctx),
            ValueSpec::Template(text) => self.render_template(text, ctx),
            ValueSpec::List(items) => self.render_list(items, ctx),
            ValueSpec::Map(fields) => self.render_map(fields, ctx),
        }
    }

    fn render_link(&self, path: &str, ctx: &RenderContext) -> Result<Rendered> {
        // `$.` / `$` marks the flow's own root namespace (§6); strip it before
        // compiling, since every scope already exposes its own ids plus every
        // enclosing scope's (see `dependency::strip_root_marker`).
        self.render_expression(crate::dependency::strip_root_marker(path), ctx)
    }

    fn render_expression(&self, expr: &str, ctx: &RenderContext) -> Result<Rendered> {
        let compiled = self.env.compile_expression(expr)?;
        let value = compiled.eval(ctx.to_jinja_context())?;
        Ok(jinja_to_json(value))
    }

    fn render_template(&self, text: &str, ctx: &RenderContext) -> Result<Rendered> {
        if let Some(inner) = single_expression_span(text) {
            return self.render_expression(inner, ctx);
        }
        let tmpl = self.env.template_from_str(text)?;
        let rendered = tmpl.render(ctx.to_jinja_context())?;
        Ok(Rendered::Value(JsonValue::String(rendered)))
    }

    fn render_list(&self, items: &[ValueSpec], ctx: &RenderContext) -> Result<Rendered> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match self.render(item, ctx)? {
                Rendered::Value(v) => out.push(v),
                Rendered::Undefined => return Ok(Rendered::Undefined),
            }
        }
        Ok(Rendered::Value(JsonValue::Array(out)))
    }

    fn render_map(&self, fields: &IndexMap<String, ValueSpec>, ctx: &RenderContext) -> Result<Rendered> {
        let mut out = serde_json::Map::with_capacity(fields.len());
        for (key, spec) in fields {
            match self.render(spec, ctx)? {
                Rendered::Value(v) => {
                    out.insert(key.clone(), v);
                }
                Rendered::Undefined => return Ok(Rendered::Undefined),
            }
        }
        Ok(Rendered::Value(JsonValue::Object(out)))
    }

    /// Render a dotted path (`a.b.c`) against a context directly, used by the
    /// facade to re-render the caller's requested target output after each update.
    pub fn render_path(&self, path: &str, ctx: &RenderContext) -> Result<Rendered> {
        self.render_expression(path, ctx)
    }

    /// Render an action invocation's flattened field map as a single `Inputs`
    /// snapshot: `Undefined` unless every field renders to a concrete value.
    pub fn render_fields(&self, fields: &IndexMap<String, ValueSpec>, ctx: &RenderContext) -> Result<Rendered> {
        self.render_map(fields, ctx)
    }
}

/// If `text` is, modulo surrounding whitespace, exactly one `{{ ... }}` span with no
/// other literal text, return the inner expression so it can be compiled and
/// evaluated directly (yielding a structured value) instead of being rendered as a
/// template (which would always stringify).
fn single_expression_span(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}
