//! The public entry points: `run`/`stream`/`run_all`/`stream_all`, target-output
//! resolution, and the per-invocation lifecycle an embedder actually calls.
//!
//! One [`FlowInstance`] binds one loaded [`FlowDocument`] to one [`Scheduler`] — its
//! task registry and broadcast hub are scoped to this instance alone, matching the
//! teacher's `GraphRunner`, which owns one execution's state rather than being a
//! process-wide singleton.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value as JsonValue;
use tracing::instrument;

use crate::error::{FlowError, Result};
use crate::ids::TaskPrefix;
use crate::model::{ExecutableId, FlowDocument, Variables};
use crate::scheduler::{FlowScope, Scheduler, ValueStream};
use crate::value::{Rendered, RenderContext};

/// A loaded, runnable flow.
#[derive(Clone)]
pub struct FlowInstance {
    scheduler: Scheduler,
    scope: Arc<FlowScope>,
    doc: Arc<FlowDocument>,
}

impl FlowInstance {
    pub fn new(doc: Arc<FlowDocument>, scheduler: Scheduler) -> Self {
        let scope = FlowScope::root(&doc);
        FlowInstance { scheduler, scope, doc }
    }

    pub fn document(&self) -> &FlowDocument {
        &self.doc
    }

    /// Split a caller-supplied (or document-default) target path into the
    /// top-level executable it names and, if present, a dotted subpath into its
    /// output. Fails fast (a [`FlowError::UnresolvedLink`]) when the root isn't
    /// declared in this flow at all — a caller typo should not silently run the
    /// document's fallback target instead.
    fn resolve_target(&self, target: Option<&str>) -> Result<(ExecutableId, Option<String>)> {
        let raw = target
            .map(str::to_string)
            .or_else(|| self.doc.default_output.clone())
            .or_else(|| self.doc.default_target().map(str::to_string))
            .ok_or(FlowError::UnresolvedTarget)?;
        let mut parts = raw.splitn(2, '.');
        let root = parts.next().unwrap_or(&raw).to_string();
        let subpath = parts.next().map(str::to_string);
        if !self.doc.flow.contains_key(&root) {
            return Err(FlowError::UnresolvedLink(root));
        }
        Ok((root, subpath))
    }

    /// `run(target?) -> value`: drains the target executable to its terminal
    /// value, then navigates into the requested subpath if the target named one
    /// (e.g. `second_sum.result`).
    #[instrument(skip(self, variables))]
    pub async fn run(&self, target: Option<&str>, variables: Variables) -> Result<Option<JsonValue>> {
        self.scheduler.validate(&self.doc, &variables)?;
        let (root, subpath) = self.resolve_target(target)?;
        let value = self
            .scheduler
            .run_executable(root.clone(), variables.clone(), self.scope.clone(), TaskPrefix::root())
            .await;
        self.apply_subpath(root, value, subpath, &variables)
    }

    /// `stream(target?) -> lazy sequence`: every intermediate value the target
    /// executable produces. Subpath navigation isn't applied here — streaming a
    /// subpath of a streaming value is rarely what a caller wants, since it would
    /// have to re-derive the subpath value from every whole-output snapshot itself.
    pub fn stream(&self, target: Option<&str>, variables: Variables) -> Result<ValueStream> {
        self.scheduler.validate(&self.doc, &variables)?;
        let (root, _subpath) = self.resolve_target(target)?;
        Ok(self
            .scheduler
            .stream_executable(root, variables, true, self.scope.clone(), TaskPrefix::root()))
    }

    /// `run_all() -> map`: every top-level executable's terminal value, keyed by
    /// id, running all of them concurrently.
    pub async fn run_all(&self, variables: Variables) -> Result<JsonValue> {
        self.scheduler.validate(&self.doc, &variables)?;
        let ids: Vec<ExecutableId> = self.doc.flow.keys().cloned().collect();
        let mut handles = Vec::with_capacity(ids.len());
        for id in &ids {
            let scheduler = self.scheduler.clone();
            let scope = self.scope.clone();
            let variables = variables.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                scheduler.run_executable(id, variables, scope, TaskPrefix::root()).await
            }));
        }
        let mut out = serde_json::Map::with_capacity(ids.len());
        for (id, handle) in ids.into_iter().zip(handles) {
            if let Some(value) = handle.await.unwrap_or(None) {
                out.insert(id, value);
            }
        }
        Ok(JsonValue::Object(out))
    }

    /// `stream_all() -> lazy sequence of cumulative maps`: every top-level
    /// executable streamed concurrently, yielding a full snapshot of every
    /// executable's latest known value each time any one of them updates.
    pub fn stream_all(&self, variables: Variables) -> Result<ValueStream> {
        self.scheduler.validate(&self.doc, &variables)?;
        let ids: Vec<ExecutableId> = self.doc.flow.keys().cloned().collect();
        let scheduler = self.scheduler.clone();
        let scope = self.scope.clone();
        Ok(Box::pin(async_stream::stream! {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            for id in &ids {
                let tx = tx.clone();
                let scheduler = scheduler.clone();
                let scope = scope.clone();
                let variables = variables.clone();
                let id = id.clone();
                tokio::spawn(async move {
                    let mut stream = scheduler.stream_executable(id.clone(), variables, true, scope, TaskPrefix::root());
                    while let Some(value) = stream.next().await {
                        if tx.send((id.clone(), value)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);
            let mut snapshot: BTreeMap<ExecutableId, JsonValue> = BTreeMap::new();
            while let Some((id, value)) = rx.recv().await {
                snapshot.insert(id, value);
                let map: serde_json::Map<String, JsonValue> =
                    snapshot.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                yield JsonValue::Object(map);
            }
        }))
    }

    /// Tear down this invocation's resources. The engine itself holds nothing that
    /// needs releasing beyond the `Arc`s this struct already drops on its own —
    /// this hook exists for the lifecycle the spec calls for, matching the
    /// embedder-owned backends (`flow_store` implementations) that may need an
    /// explicit close of their own someday.
    pub async fn close(&self) {}

    fn apply_subpath(
        &self,
        root: ExecutableId,
        value: Option<JsonValue>,
        subpath: Option<String>,
        variables: &Variables,
    ) -> Result<Option<JsonValue>> {
        let Some(value) = value else {
            return Ok(None);
        };
        let Some(subpath) = subpath else {
            return Ok(Some(value));
        };
        let mut outputs = BTreeMap::new();
        outputs.insert(root.clone(), value);
        let ctx = RenderContext {
            outputs,
            variables: variables.clone(),
        };
        let path_expr = format!("{root}.{subpath}");
        match self.scheduler.renderer().render_path(&path_expr, &ctx)? {
            Rendered::Value(v) => Ok(Some(v)),
            Rendered::Undefined => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{Action, ActionContext, ActionDescriptor, ActionOutcome};
    use crate::settings::FlowSettings;
    use async_trait::async_trait;
    use flow_store::{InMemoryBlobRepo, InMemoryCacheRepo};
    use serde_json::json;

    struct Adder(ActionDescriptor);

    #[async_trait]
    impl Action for Adder {
        fn descriptor(&self) -> &ActionDescriptor {
            &self.0
        }

        async fn run(&self, ctx: ActionContext) -> Result<ActionOutcome> {
            let a = ctx.inputs.get("a").and_then(JsonValue::as_i64).unwrap_or(0);
            let b = ctx.inputs.get("b").and_then(JsonValue::as_i64).unwrap_or(0);
            Ok(ActionOutcome::Single(json!({"result": a + b})))
        }
    }

    fn instance_with_chained_adds() -> FlowInstance {
        let mut registry = crate::action::ActionRegistry::new();
        registry.register(Arc::new(Adder(ActionDescriptor::new("test_add"))));
        let scheduler = Scheduler::new(
            Arc::new(registry),
            Arc::new(InMemoryCacheRepo::new()),
            Arc::new(InMemoryBlobRepo::new()),
            None,
            FlowSettings::default(),
        );
        let yaml = r#"
version: "0.1"
flow:
  first_sum:
    action: test_add
    a: 1
    b: 2
  second_sum:
    action: test_add
    a: "{{ first_sum.result }}"
    b: 4
"#;
        let doc: FlowDocument = serde_yaml::from_str(yaml).unwrap();
        FlowInstance::new(Arc::new(doc), scheduler)
    }

    #[tokio::test]
    async fn run_with_subpath_navigates_into_terminal_output() {
        let instance = instance_with_chained_adds();
        let value = instance.run(Some("second_sum.result"), Variables::new()).await.unwrap();
        assert_eq!(value, Some(json!(7)));
    }

    #[tokio::test]
    async fn run_with_no_target_falls_back_to_last_declared_executable() {
        let instance = instance_with_chained_adds();
        let value = instance.run(None, Variables::new()).await.unwrap();
        assert_eq!(value, Some(json!({"result": 7})));
    }

    #[tokio::test]
    async fn run_all_returns_every_top_level_executable() {
        let instance = instance_with_chained_adds();
        let values = instance.run_all(Variables::new()).await.unwrap();
        assert_eq!(values["first_sum"], json!({"result": 3}));
        assert_eq!(values["second_sum"], json!({"result": 7}));
    }

    #[tokio::test]
    async fn unknown_target_root_is_an_error() {
        let instance = instance_with_chained_adds();
        assert!(instance.run(Some("nonexistent"), Variables::new()).await.is_err());
    }
}
