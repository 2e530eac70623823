//! The in-memory flow document: the typed tree `serde` deserializes a YAML/JSON flow
//! definition onto. Parsing/schema-construction from raw text is someone else's
//! concern (a document loader upstream of this crate); this module only defines the
//! shape the loader must produce and that the scheduler consumes.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifies an executable within a single flow scope. Unique within that scope;
/// stable across loop iterations (the iteration index is appended separately when a
/// [`crate::ids::TaskId`] is built).
pub type ExecutableId = String;

/// The name an action is registered under in an [`crate::action::ActionRegistry`].
pub type ActionName = String;

/// A caller-supplied binding, visible in every render context alongside executable
/// outputs but never written by an executable.
pub type Variables = BTreeMap<String, serde_json::Value>;

/// A loaded flow document: an ordered map of executables plus the handful of
/// flow-wide settings that affect every executable in it.
///
/// Order is significant — [`FlowDocument::default_output`] falls back to "the last
/// entry in declaration order" when unset, which is why this is an `IndexMap` and
/// not a `HashMap`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDocument {
    #[serde(default = "default_version")]
    pub version: String,

    pub flow: IndexMap<ExecutableId, Executable>,

    #[serde(default)]
    pub default_model: Option<ValueSpec>,

    #[serde(default)]
    pub default_output: Option<String>,

    #[serde(default = "default_action_timeout")]
    pub action_timeout: u64,
}

fn default_version() -> String {
    "0.1".to_string()
}

const fn default_action_timeout() -> u64 {
    360
}

impl FlowDocument {
    /// The executable id `run`/`stream` target when the caller doesn't name one:
    /// the explicit `default_output` path's root, or the last declared executable.
    pub fn default_target(&self) -> Option<&str> {
        if let Some(path) = &self.default_output {
            return path.split('.').next();
        }
        self.flow.keys().last().map(String::as_str)
    }
}

/// One entry in a flow's executable map.
///
/// `#[serde(untagged)]` because the document format has no explicit discriminator
/// tag — the three shapes are told apart structurally: a loop has `for`/`in`/`flow`
/// keys, an action invocation has an `action` key, and anything else is a bare value
/// declaration. Variant order matters: serde tries each in turn and the first whose
/// required fields are all present wins, so the most-specific shape (`Loop`) must be
/// tried before the most general (`ValueDeclaration`, which accepts nearly anything).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Executable {
    Loop(LoopSpec),
    Action(ActionInvocation),
    Value(ValueSpec),
}

/// A single action invocation: `action` names the registered action type, every
/// other field is a [`ValueSpec`] bound to one of that action's declared input
/// fields. `cache_key`, if present, is rendered and used verbatim as the cache key
/// instead of one derived from the rendered inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionInvocation {
    pub action: ActionName,

    #[serde(default)]
    pub cache_key: Option<ValueSpec>,

    /// Every field besides `action`/`cache_key` is an input binding. Flattening into
    /// a map (rather than an open-ended struct) keeps this type decoupled from any
    /// particular action's input shape, which is exactly the point: this crate knows
    /// nothing about what fields `action` declares.
    #[serde(flatten)]
    pub fields: IndexMap<String, ValueSpec>,
}

/// `for NAME in EXPR: flow: { ... }` — runs `flow` once per element of `in_`,
/// binding `for_` in each iteration's scope. Inner executable ids shadow identically
/// named outer ones only at lookup time; the outer flow's executables remain visible
/// to the loop body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSpec {
    #[serde(rename = "for")]
    pub for_: String,

    #[serde(rename = "in")]
    pub in_: ValueSpec,

    pub flow: IndexMap<ExecutableId, Executable>,
}

/// Any expression that can appear as an executable's "body" or as an action's input
/// field. `streaming` (present on [`ValueSpec::Template`] and [`ValueSpec::Link`])
/// controls whether the referenced dependency's partial values or only its terminal
/// value drive re-renders — see the dependency extractor and value renderer.
///
/// Variant order is load-bearing: `#[serde(untagged)]` tries each variant in
/// declaration order and commits to the first one whose shape matches, so the
/// struct-shaped variants (`Link`, `Lambda`) must come before the catch-alls
/// (`Template` matches any plain string, `List`/`Map` match any sequence/mapping
/// that isn't link/lambda-shaped) and `Literal` — whose inner `serde_json::Value`
/// happily deserializes from *any* input at all — must come dead last, or it would
/// swallow every other variant before they ever got a chance to match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueSpec {
    /// `{ link: "other.path", streaming: bool }` — references another executable's
    /// output, or a dotted subpath of it.
    Link {
        link: String,
        #[serde(default)]
        streaming: bool,
    },

    /// `{ lambda: "expr", streaming: bool }` — a pure expression over the render
    /// context, evaluated as a standalone `minijinja` expression so the result can be
    /// a structured value rather than a string.
    Lambda {
        lambda: String,
        #[serde(default)]
        streaming: bool,
    },

    /// A bare template string, e.g. `"{{ a.result }} and {{ b.result }}"`. Mixed
    /// literal/expression text always renders to a string; a lone `{{ expr }}` with
    /// no surrounding text is still stored this way but rendered as an expression
    /// (see `value.rs`) so it can yield a structured value. Matches any plain
    /// string, so it must come before `Literal`.
    Template(String),

    /// An ordered list of sub-specs, each rendered independently. Matches any YAML/
    /// JSON sequence, so it must come before `Literal`.
    List(Vec<ValueSpec>),

    /// A nested mapping of sub-specs, each rendered independently. Tried after
    /// `Link`/`Lambda` (whose shapes it would otherwise also match) but before
    /// `Literal`, which would otherwise swallow any mapping.
    Map(IndexMap<String, ValueSpec>),

    /// A fixed JSON scalar with no dependencies — what's left once none of the
    /// above matched: a number, bool, or null (strings, sequences, and mappings are
    /// all claimed by the variants above).
    Literal(serde_json::Value),
}
