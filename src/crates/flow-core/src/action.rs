//! The action contract: the external boundary the engine runs opaque computations
//! through.
//!
//! `flow-core` never inspects what an action actually does — an [`Action`] is
//! addressed by name, validates its own inputs, and produces either a single
//! terminal value or a lazy sequence of snapshots. The only things the scheduler
//! needs to know up front are carried on [`ActionDescriptor`]: whether the action
//! caches, what version it's at, and which ambient capabilities (a redis url, the
//! blob repo, the resolved default model, a final "finished" pass) it wants injected.
//!
//! Grounded on the teacher's `tool.rs` `Tool`/`ToolRegistry` pair: a name-keyed
//! registry of boxed trait objects, executed with an optional runtime-context bundle.
//! Generalized here to support the streaming/non-streaming split the spec requires
//! (`ToolRegistry` only ever produces one `ToolResult` per call).

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value as JsonValue;

use crate::error::{FlowError, Result};
use crate::model::ActionName;

/// Which ambient values an action's `Inputs` type wants injected before `run` is
/// called. Mirrors the spec's "marker fields on the Inputs type" idea, but as an
/// explicit descriptor on the registration rather than something the engine infers
/// by reflecting on a declared supertype — there's no such reflection in Rust, and
/// an explicit bitflag-style struct is the idiomatic stand-in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub redis_url: bool,
    pub blob_repo: bool,
    pub default_model: bool,
    /// Whether the runner should perform one extra invocation with
    /// [`ActionContext::finished`] set, after the input-dependency stream ends.
    pub final_invocation: bool,
}

/// Registration-time metadata for one action type. `name` must match the `action:`
/// field actions are addressed by from a flow document.
#[derive(Debug, Clone)]
pub struct ActionDescriptor {
    pub name: ActionName,
    pub cache: bool,
    pub version: Option<i64>,
    pub capabilities: Capabilities,
}

impl ActionDescriptor {
    pub fn new(name: impl Into<ActionName>) -> Self {
        ActionDescriptor {
            name: name.into(),
            cache: true,
            version: None,
            capabilities: Capabilities::default(),
        }
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Ambient values injected into a `run` call when [`ActionDescriptor::capabilities`]
/// opts in, bundled with the already-rendered, already-validated input snapshot.
pub struct ActionContext {
    pub inputs: JsonValue,
    pub redis_url: Option<String>,
    pub blob_repo: Option<Arc<dyn flow_store::BlobRepo>>,
    pub default_model: Option<String>,
    /// Set on the final-invocation re-run (§4.2 step 4), `false` otherwise.
    pub finished: bool,
}

impl ActionContext {
    pub fn new(inputs: JsonValue) -> Self {
        ActionContext {
            inputs,
            redis_url: None,
            blob_repo: None,
            default_model: None,
            finished: false,
        }
    }
}

/// The output of one `run` call: either the single terminal value a non-streaming
/// action produces, or a lazy sequence of snapshots a streaming action produces (the
/// stream's last item is that task's terminal value).
pub enum ActionOutcome {
    Single(JsonValue),
    Stream(Pin<Box<dyn Stream<Item = Result<JsonValue>> + Send>>),
}

/// An opaque, externally-defined computation addressed by name. Concrete
/// implementations (LLM calls, HTTP fetches, blob I/O) live outside this crate —
/// this trait is the entire surface the engine depends on.
#[async_trait]
pub trait Action: Send + Sync {
    fn descriptor(&self) -> &ActionDescriptor;

    /// Validate and normalize a raw field-map rendering into this action's declared
    /// `Inputs` shape. The default accepts anything — actions with no input schema
    /// simply pass the raw snapshot through. Returning `Err` causes the caller to
    /// log and skip that snapshot (§7, input validation failure), not fail the flow.
    fn validate_inputs(&self, raw: &JsonValue) -> Result<JsonValue> {
        Ok(raw.clone())
    }

    async fn run(&self, ctx: ActionContext) -> Result<ActionOutcome>;
}

/// Name-keyed collection of registered actions, consulted by the scheduler to
/// resolve an `ActionInvocation`'s `action` field. Unlike `ToolRegistry`, lookups
/// hand back a strong reference the caller can hold across an `await` — actions here
/// run for the lifetime of a task, not a single call.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<ActionName, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        ActionRegistry::default()
    }

    pub fn register(&mut self, action: Arc<dyn Action>) {
        let name = action.descriptor().name.clone();
        self.actions.insert(name, action);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Action>> {
        self.actions
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::UnknownAction(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> Vec<ActionName> {
        self.actions.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo(ActionDescriptor);

    #[async_trait]
    impl Action for Echo {
        fn descriptor(&self) -> &ActionDescriptor {
            &self.0
        }

        async fn run(&self, ctx: ActionContext) -> Result<ActionOutcome> {
            Ok(ActionOutcome::Single(ctx.inputs))
        }
    }

    #[test]
    fn registry_resolves_by_descriptor_name() {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(Echo(ActionDescriptor::new("echo"))));
        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_err());
    }

    #[tokio::test]
    async fn registered_action_runs() {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(Echo(ActionDescriptor::new("echo"))));
        let action = registry.get("echo").unwrap();
        let outcome = action.run(ActionContext::new(json!({"x": 1}))).await.unwrap();
        match outcome {
            ActionOutcome::Single(v) => assert_eq!(v, json!({"x": 1})),
            _ => panic!("expected single value"),
        }
    }
}
