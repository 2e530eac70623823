//! The flow scheduler: the top-level orchestrator that resolves an executable id to
//! a stream of its values, spawning at most one runner task per [`TaskId`] and
//! merging dependency streams into input snapshots as they update.
//!
//! Grounded on the teacher's `pregel/executor.rs` (a task executor owning retry/
//! timeout policy around an opaque `execute` call) generalized from "one task, one
//! attempt budget" to "one task per `TaskId`, shared by every subscriber, re-entered
//! once per updated dependency snapshot" — and on `stream.rs`'s channel-based
//! multiplexing for how dependency updates fan in to a single render loop.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use flow_store::{BlobRepo, CacheRepo};

use crate::action::{Action, ActionContext, ActionDescriptor, ActionOutcome, ActionRegistry};
use crate::cache_coordinator::CacheCoordinator;
use crate::default_model;
use crate::dependency::{extract_dependencies, Dependency};
use crate::error::Result;
use crate::hub::{Broadcast, BroadcastHub, SubscriberId};
use crate::ids::{TaskId, TaskPrefix};
use crate::model::{ActionInvocation, Executable, ExecutableId, FlowDocument, LoopSpec, ValueSpec, Variables};
use crate::value::{RenderContext, Rendered, Renderer};

/// A lazy sequence of an executable's values, as returned by [`Scheduler::stream_executable`].
pub type ValueStream = Pin<Box<dyn Stream<Item = JsonValue> + Send>>;

/// The lexical scope an executable id is looked up in: the root flow plus any
/// enclosing loop bodies. Inner scopes see everything an outer scope declares;
/// outer scopes never see into a loop body (§3, "Loop scopes are lexically
/// nested"). Lookup favors the innermost declaration of a given id.
#[derive(Clone)]
pub struct FlowScope {
    parent: Option<Arc<FlowScope>>,
    local: Arc<indexmap::IndexMap<ExecutableId, Executable>>,
    default_model: Option<Arc<ValueSpec>>,
}

impl FlowScope {
    pub fn root(doc: &FlowDocument) -> Arc<FlowScope> {
        Arc::new(FlowScope {
            parent: None,
            local: Arc::new(doc.flow.clone()),
            default_model: doc.default_model.clone().map(Arc::new),
        })
    }

    /// Build the scope a loop body executes in: `local` shadows anything the parent
    /// declares under the same id, but everything the parent declares remains
    /// reachable for ids `local` doesn't redefine.
    pub fn child(self: &Arc<Self>, local: indexmap::IndexMap<ExecutableId, Executable>) -> Arc<FlowScope> {
        Arc::new(FlowScope {
            parent: Some(self.clone()),
            local: Arc::new(local),
            default_model: None,
        })
    }

    pub fn get(&self, id: &str) -> Option<Executable> {
        self.local
            .get(id)
            .cloned()
            .or_else(|| self.parent.as_ref().and_then(|p| p.get(id)))
    }

    /// Every executable id visible from this scope, own plus every enclosing scope's
    /// — the "known ids" set the dependency extractor needs to tell a real
    /// dependency from an unresolved root.
    pub fn known_ids(&self) -> HashSet<String> {
        let mut ids: HashSet<String> = self.local.keys().cloned().collect();
        if let Some(parent) = &self.parent {
            ids.extend(parent.known_ids());
        }
        ids
    }

    pub fn default_model(&self) -> Option<Arc<ValueSpec>> {
        self.default_model
            .clone()
            .or_else(|| self.parent.as_ref().and_then(|p| p.default_model()))
    }
}

struct Inner {
    registry: Arc<ActionRegistry>,
    cache: CacheCoordinator,
    hub: BroadcastHub,
    renderer: Renderer,
    settings: crate::settings::FlowSettings,
    blob_repo: Arc<dyn BlobRepo>,
    redis_url: Option<String>,
    active_tasks: Arc<Mutex<HashMap<TaskId, JoinHandle<()>>>>,
}

/// The scheduler. Cheap to clone — everything mutable lives behind the shared
/// `Inner`, so every subscriber and every spawned task holds its own handle to the
/// same task registry, hub, and cache coordinator.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<ActionRegistry>,
        cache_repo: Arc<dyn CacheRepo>,
        blob_repo: Arc<dyn BlobRepo>,
        redis_url: Option<String>,
        settings: crate::settings::FlowSettings,
    ) -> Self {
        Scheduler {
            inner: Arc::new(Inner {
                registry,
                cache: CacheCoordinator::new(cache_repo, blob_repo.clone()),
                hub: BroadcastHub::new(),
                renderer: Renderer::new(),
                settings,
                blob_repo,
                redis_url,
                active_tasks: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    pub fn renderer(&self) -> &Renderer {
        &self.inner.renderer
    }

    /// Pre-flight configuration check (§7): unknown actions, unresolved variable/
    /// link references, and dependency cycles, all detected before any task is
    /// scheduled. Called by [`crate::facade::FlowInstance`] at the top of every
    /// entry point.
    pub fn validate(&self, doc: &FlowDocument, variables: &Variables) -> Result<()> {
        crate::preflight::validate(doc, &self.inner.registry, variables)
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.inner.hub
    }

    /// `run_executable`: shorthand for draining `stream_executable(..., partial=false)`
    /// and keeping whatever was last yielded.
    pub async fn run_executable(
        &self,
        id: ExecutableId,
        variables: Variables,
        scope: Arc<FlowScope>,
        task_prefix: TaskPrefix,
    ) -> Option<JsonValue> {
        let mut stream = self.stream_executable(id, variables, false, scope, task_prefix);
        let mut last = None;
        while let Some(value) = stream.next().await {
            last = Some(value);
        }
        last
    }

    /// Dispatches to the runner matching `id`'s executable kind. Looking up an id
    /// that doesn't exist in `scope` is a dependency-extraction bug upstream (every
    /// id reaching here was already validated as a resolvable dependency) — logged
    /// and treated as "produces nothing" rather than panicking.
    pub fn stream_executable(
        &self,
        id: ExecutableId,
        variables: Variables,
        partial: bool,
        scope: Arc<FlowScope>,
        task_prefix: TaskPrefix,
    ) -> ValueStream {
        let scheduler = self.clone();
        Box::pin(async_stream::stream! {
            let Some(executable) = scope.get(&id) else {
                warn!(executable_id = %id, "dispatch on unknown executable id");
                return;
            };
            let mut inner = match executable {
                Executable::Action(invocation) => {
                    scheduler.stream_action(id.clone(), invocation, variables, scope, task_prefix, partial)
                }
                Executable::Loop(loop_spec) => {
                    scheduler.stream_loop(id.clone(), loop_spec, variables, scope, task_prefix, partial)
                }
                Executable::Value(spec) => {
                    scheduler.stream_value_declaration(id.clone(), spec, variables, scope, task_prefix, partial)
                }
            };
            while let Some(value) = inner.next().await {
                yield value;
            }
        })
    }

    /// Renders `spec`'s dependencies to completion (every streaming dependency's
    /// last value, every non-streaming dependency's terminal value) and renders once.
    /// Used wherever the spec calls for a value "to terminal" rather than as a live
    /// stream: a loop's `in_spec`, an explicit `cache_key`, the flow's `default_model`.
    async fn render_to_completion(
        &self,
        spec: &ValueSpec,
        variables: &Variables,
        scope: &Arc<FlowScope>,
        task_prefix: &TaskPrefix,
    ) -> Option<JsonValue> {
        let known_ids = scope.known_ids();
        let known_refs: HashSet<&str> = known_ids.iter().map(String::as_str).collect();
        let var_names: HashSet<&str> = variables.keys().map(String::as_str).collect();
        let mut unresolved = Vec::new();
        let deps = extract_dependencies(spec, &known_refs, &var_names, &mut unresolved);
        for root in &unresolved {
            warn!(root, "unresolved dependency root, substituting null");
        }
        let mut outputs: BTreeMap<ExecutableId, JsonValue> =
            unresolved.iter().map(|root| (root.clone(), JsonValue::Null)).collect();
        let mut merged = self.merge_dependency_streams(deps, variables.clone(), scope.clone(), task_prefix.clone());
        while let Some((dep_id, value)) = merged.next().await {
            outputs.insert(dep_id, value);
        }
        let ctx = RenderContext {
            outputs,
            variables: variables.clone(),
        };
        self.inner.renderer.render(spec, &ctx).ok().and_then(Rendered::into_option)
    }

    /// Fans in one stream per dependency (streaming or collapsed-to-terminal per its
    /// own flag) into a single channel tagged by executable id. The merged stream
    /// ends once every dependency's stream has ended — plain channel-close, no
    /// explicit completion bookkeeping needed.
    fn merge_dependency_streams(
        &self,
        deps: HashSet<Dependency>,
        variables: Variables,
        scope: Arc<FlowScope>,
        task_prefix: TaskPrefix,
    ) -> Pin<Box<dyn Stream<Item = (ExecutableId, JsonValue)> + Send>> {
        let scheduler = self.clone();
        Box::pin(async_stream::stream! {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            for dep in deps {
                let scheduler = scheduler.clone();
                let variables = variables.clone();
                let scope = scope.clone();
                let task_prefix = task_prefix.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut stream = scheduler.stream_executable(
                        dep.executable_id.clone(),
                        variables,
                        dep.streaming,
                        scope,
                        task_prefix,
                    );
                    while let Some(value) = stream.next().await {
                        if tx.send((dep.executable_id.clone(), value)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);
            while let Some(item) = rx.recv().await {
                yield item;
            }
        })
    }

    /// `stream_value_declaration`: renders `spec` against the merged outputs of its
    /// dependencies, re-rendering on every update when `partial`, or once after every
    /// dependency reaches terminal otherwise.
    fn stream_value_declaration(
        &self,
        id: ExecutableId,
        spec: ValueSpec,
        variables: Variables,
        scope: Arc<FlowScope>,
        task_prefix: TaskPrefix,
        partial: bool,
    ) -> ValueStream {
        let scheduler = self.clone();
        Box::pin(async_stream::stream! {
            if !partial {
                if let Some(value) = scheduler.render_to_completion(&spec, &variables, &scope, &task_prefix).await {
                    yield value;
                }
                return;
            }

            let known_ids = scope.known_ids();
            let known_refs: HashSet<&str> = known_ids.iter().map(String::as_str).collect();
            let var_names: HashSet<&str> = variables.keys().map(String::as_str).collect();
            let mut unresolved = Vec::new();
            let deps = extract_dependencies(&spec, &known_refs, &var_names, &mut unresolved);
            for root in &unresolved {
                warn!(executable_id = %id, root, "unresolved dependency root, substituting null");
            }
            let mut outputs: BTreeMap<ExecutableId, JsonValue> =
                unresolved.iter().map(|root| (root.clone(), JsonValue::Null)).collect();
            let mut merged = scheduler.merge_dependency_streams(deps, variables.clone(), scope.clone(), task_prefix.clone());
            while let Some((dep_id, value)) = merged.next().await {
                outputs.insert(dep_id, value);
                let ctx = RenderContext {
                    outputs: outputs.clone(),
                    variables: variables.clone(),
                };
                if let Ok(Rendered::Value(value)) = scheduler.inner.renderer.render(&spec, &ctx) {
                    yield value;
                }
            }
        })
    }

    /// `stream_loop`: evaluates `in_spec` to terminal, fans out one concurrent
    /// invocation of every body executable per element, and yields a single list
    /// (indexed by iteration order, not completion order) once every iteration's
    /// body has finished. Loop-level streaming is not supported — a `partial=true`
    /// request is downgraded with a warning (§4.1).
    fn stream_loop(
        &self,
        id: ExecutableId,
        loop_spec: LoopSpec,
        variables: Variables,
        scope: Arc<FlowScope>,
        task_prefix: TaskPrefix,
        partial: bool,
    ) -> ValueStream {
        let scheduler = self.clone();
        Box::pin(async_stream::stream! {
            if partial {
                warn!(executable_id = %id, "loop-level streaming is not supported, downgrading to run-to-completion");
            }

            let Some(in_value) = scheduler.render_to_completion(&loop_spec.in_, &variables, &scope, &task_prefix).await else {
                return;
            };
            let JsonValue::Array(items) = in_value else {
                warn!(executable_id = %id, "loop 'in' expression did not render to an iterable value");
                return;
            };

            let child_scope = scope.child(loop_spec.flow.clone());
            let body_ids: Vec<ExecutableId> = loop_spec.flow.keys().cloned().collect();

            let mut handles = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                let iter_prefix = task_prefix.nested(&id, index);
                let mut iter_variables = variables.clone();
                iter_variables.insert(loop_spec.for_.clone(), item);
                let scheduler = scheduler.clone();
                let child_scope = child_scope.clone();
                let body_ids = body_ids.clone();
                handles.push(tokio::spawn(async move {
                    // Faithful to the source: every body executable runs each
                    // iteration, even ones not on the path to an eventual caller's
                    // target, since this flow instance has no way to know in
                    // advance which ones a sibling request might still need.
                    let mut out = serde_json::Map::with_capacity(body_ids.len());
                    for body_id in &body_ids {
                        let value = scheduler
                            .run_executable(body_id.clone(), iter_variables.clone(), child_scope.clone(), iter_prefix.clone())
                            .await;
                        if let Some(value) = value {
                            out.insert(body_id.clone(), value);
                        }
                    }
                    JsonValue::Object(out)
                }));
            }

            let mut iteration_outputs = Vec::with_capacity(handles.len());
            for handle in handles {
                match handle.await {
                    Ok(value) => iteration_outputs.push(value),
                    Err(err) => {
                        warn!(executable_id = %id, %err, "loop iteration task panicked");
                        iteration_outputs.push(JsonValue::Null);
                    }
                }
            }
            yield JsonValue::Array(iteration_outputs);
        })
    }

    /// `stream_action`: the subscriber side of §4.1. Ensures exactly one runner task
    /// is in flight for this `task_id`, subscribes to its broadcasts, and relays them
    /// under the caller's partial/terminal-only policy.
    fn stream_action(
        &self,
        id: ExecutableId,
        invocation: ActionInvocation,
        variables: Variables,
        scope: Arc<FlowScope>,
        task_prefix: TaskPrefix,
        partial: bool,
    ) -> ValueStream {
        let scheduler = self.clone();
        Box::pin(async_stream::stream! {
            let task_id = task_prefix.resolve(&id);
            let timeout = scheduler.inner.settings.action_timeout;

            let subscription = {
                let mut active = scheduler.inner.active_tasks.lock().await;
                let sub = scheduler.inner.hub.subscribe(&task_id).await;
                if !active.contains_key(&task_id) {
                    let runner_scheduler = scheduler.clone();
                    let runner_id = id.clone();
                    let runner_task_id = task_id.clone();
                    let runner_invocation = invocation.clone();
                    let runner_variables = variables.clone();
                    let runner_scope = scope.clone();
                    let runner_prefix = task_prefix.clone();
                    let handle = tokio::spawn(async move {
                        runner_scheduler
                            .run_and_broadcast_action(
                                runner_id,
                                runner_task_id,
                                runner_invocation,
                                runner_variables,
                                runner_scope,
                                runner_prefix,
                            )
                            .await;
                    });
                    active.insert(task_id.clone(), handle);
                }
                sub
            };

            let _guard = SubscriptionGuard {
                hub: scheduler.inner.hub.clone(),
                active_tasks: scheduler.inner.active_tasks.clone(),
                task_id: task_id.clone(),
                subscriber_id: subscription.subscriber_id,
            };
            let mut receiver = subscription.receiver;
            let mut last_value: Option<JsonValue> = None;

            loop {
                match tokio::time::timeout(timeout, receiver.recv()).await {
                    Ok(Some(Broadcast::Value(value))) => {
                        if partial {
                            yield value.clone();
                        }
                        last_value = Some(value);
                    }
                    Ok(Some(Broadcast::Terminal)) | Ok(None) => break,
                    Err(_) => {
                        warn!(task_id = %task_id, "subscriber queue-read timed out, exiting as terminal");
                        break;
                    }
                }
            }

            if !partial {
                if let Some(value) = last_value {
                    yield value;
                }
            }
        })
    }

    /// `_run_and_broadcast_action`: the runner, §4.2. Owns the one in-flight
    /// execution for `task_id` — only one of these runs per task id at a time, no
    /// matter how many subscribers attach.
    #[instrument(skip_all, fields(task_id = %task_id, action = %invocation.action))]
    async fn run_and_broadcast_action(
        &self,
        id: ExecutableId,
        task_id: TaskId,
        invocation: ActionInvocation,
        variables: Variables,
        scope: Arc<FlowScope>,
        task_prefix: TaskPrefix,
    ) {
        let last_output = match self.run_action_inner(&id, &task_id, &invocation, &variables, &scope, &task_prefix).await {
            Ok(last) => last,
            Err(err) => {
                warn!(task_id = %task_id, action_id = %id, %err, "action task ended in error");
                None
            }
        };

        if let Some(value) = last_output {
            // Step 6: deliver the last value to anyone who joined too late to have
            // seen it broadcast live.
            self.inner.hub.flush_to_new_listeners(&task_id, value).await;
        }
        self.inner.hub.publish_terminal(&task_id).await;
        self.inner.active_tasks.lock().await.remove(&task_id);
    }

    async fn run_action_inner(
        &self,
        id: &ExecutableId,
        task_id: &TaskId,
        invocation: &ActionInvocation,
        variables: &Variables,
        scope: &Arc<FlowScope>,
        task_prefix: &TaskPrefix,
    ) -> Result<Option<JsonValue>> {
        let action = self.inner.registry.get(&invocation.action)?;
        let descriptor = action.descriptor().clone();

        // Step 1: explicit cache-key resolution, consulted before dependencies run.
        if let Some(cache_key_spec) = &invocation.cache_key {
            if let Some(rendered) = self.render_to_completion(cache_key_spec, variables, scope, task_prefix).await {
                let key = stringify_cache_key(&rendered);
                if descriptor.cache && self.inner.settings.cache_enabled {
                    if let Some(cached) = self.inner.cache.lookup(&key, &descriptor.name, descriptor.version).await {
                        self.inner.hub.publish(task_id, cached.clone()).await;
                        return Ok(Some(cached));
                    }
                }
                return self
                    .run_with_cache_key(id, task_id, invocation, &descriptor, &action, variables, scope, task_prefix, Some(key))
                    .await;
            }
        }

        self.run_with_cache_key(id, task_id, invocation, &descriptor, &action, variables, scope, task_prefix, None)
            .await
    }

    /// Steps 2-5: stream input-field dependencies into successive `Inputs`
    /// snapshots, running the action (with cache lookup/store around each) for
    /// every snapshot, plus the final invocation pass if the action opts in.
    #[allow(clippy::too_many_arguments)]
    async fn run_with_cache_key(
        &self,
        id: &ExecutableId,
        task_id: &TaskId,
        invocation: &ActionInvocation,
        descriptor: &ActionDescriptor,
        action: &Arc<dyn Action>,
        variables: &Variables,
        scope: &Arc<FlowScope>,
        task_prefix: &TaskPrefix,
        explicit_key: Option<String>,
    ) -> Result<Option<JsonValue>> {
        let known_ids = scope.known_ids();
        let known_refs: HashSet<&str> = known_ids.iter().map(String::as_str).collect();
        let var_names: HashSet<&str> = variables.keys().map(String::as_str).collect();

        let mut all_deps = HashSet::new();
        for spec in invocation.fields.values() {
            let mut unresolved = Vec::new();
            all_deps.extend(extract_dependencies(spec, &known_refs, &var_names, &mut unresolved));
            for root in unresolved {
                warn!(task_id = %task_id, root, "unresolved input dependency root, substituting null");
            }
        }

        let resolved_default_model = if descriptor.capabilities.default_model {
            self.resolve_default_model(variables, scope, task_prefix).await
        } else {
            None
        };

        let mut dep_outputs: BTreeMap<ExecutableId, JsonValue> = BTreeMap::new();
        let mut last_output: Option<JsonValue> = None;
        let mut last_was_cache_hit = false;

        // Process once before any dependency update arrives — covers actions whose
        // fields are entirely literal (no dependencies to wait on at all).
        self.process_inputs_snapshot(
            id,
            task_id,
            invocation,
            descriptor,
            action,
            &dep_outputs,
            variables,
            explicit_key.as_deref(),
            resolved_default_model.as_deref(),
            false,
            &mut last_output,
            &mut last_was_cache_hit,
        )
        .await;

        let mut merged = self.merge_dependency_streams(all_deps, variables.clone(), scope.clone(), task_prefix.clone());
        while let Some((dep_id, value)) = merged.next().await {
            dep_outputs.insert(dep_id, value);
            self.process_inputs_snapshot(
                id,
                task_id,
                invocation,
                descriptor,
                action,
                &dep_outputs,
                variables,
                explicit_key.as_deref(),
                resolved_default_model.as_deref(),
                false,
                &mut last_output,
                &mut last_was_cache_hit,
            )
            .await;
        }

        if descriptor.capabilities.final_invocation {
            self.process_inputs_snapshot(
                id,
                task_id,
                invocation,
                descriptor,
                action,
                &dep_outputs,
                variables,
                explicit_key.as_deref(),
                resolved_default_model.as_deref(),
                true,
                &mut last_output,
                &mut last_was_cache_hit,
            )
            .await;
        }

        Ok(last_output)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_inputs_snapshot(
        &self,
        id: &ExecutableId,
        task_id: &TaskId,
        invocation: &ActionInvocation,
        descriptor: &ActionDescriptor,
        action: &Arc<dyn Action>,
        dep_outputs: &BTreeMap<ExecutableId, JsonValue>,
        variables: &Variables,
        explicit_key: Option<&str>,
        default_model: Option<&str>,
        finished: bool,
        last_output: &mut Option<JsonValue>,
        last_was_cache_hit: &mut bool,
    ) {
        let ctx = RenderContext {
            outputs: dep_outputs.clone(),
            variables: variables.clone(),
        };
        let rendered = match self.inner.renderer.render_fields(&invocation.fields, &ctx) {
            Ok(Rendered::Value(value)) => value,
            Ok(Rendered::Undefined) => return,
            Err(err) => {
                warn!(task_id = %task_id, executable_id = %id, %err, "input rendering failed, skipping snapshot");
                return;
            }
        };

        let validated = match action.validate_inputs(&rendered) {
            Ok(value) => value,
            Err(err) => {
                warn!(task_id = %task_id, %err, "input validation failed, skipping snapshot");
                return;
            }
        };

        let cache_key = explicit_key
            .map(str::to_string)
            .or_else(|| self.inner.cache.derive_key(&validated));

        if !finished {
            if let Some(key) = &cache_key {
                if descriptor.cache && self.inner.settings.cache_enabled {
                    if let Some(cached) = self.inner.cache.lookup(key, &descriptor.name, descriptor.version).await {
                        *last_output = Some(cached.clone());
                        *last_was_cache_hit = true;
                        self.inner.hub.publish(task_id, cached).await;
                        return;
                    }
                }
            }
        }

        let mut action_ctx = ActionContext::new(validated);
        if descriptor.capabilities.blob_repo {
            action_ctx.blob_repo = Some(self.inner.blob_repo.clone());
        }
        if descriptor.capabilities.redis_url {
            action_ctx.redis_url = self.inner.redis_url.clone();
        }
        if descriptor.capabilities.default_model {
            action_ctx.default_model = default_model.map(str::to_string);
        }
        action_ctx.finished = finished;

        let outcome = tokio::time::timeout(self.inner.settings.action_timeout, action.run(action_ctx)).await;
        match outcome {
            Ok(Ok(ActionOutcome::Single(value))) => {
                *last_output = Some(value.clone());
                *last_was_cache_hit = false;
                self.inner.hub.publish(task_id, value).await;
            }
            Ok(Ok(ActionOutcome::Stream(mut stream))) => {
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(value) => {
                            *last_output = Some(value.clone());
                            *last_was_cache_hit = false;
                            self.inner.hub.publish(task_id, value).await;
                        }
                        Err(err) => {
                            warn!(task_id = %task_id, %err, "streaming action step failed");
                            break;
                        }
                    }
                }
            }
            Ok(Err(err)) => {
                warn!(task_id = %task_id, %err, "action run failed");
            }
            Err(_) => {
                warn!(
                    task_id = %task_id,
                    timeout_secs = self.inner.settings.action_timeout.as_secs(),
                    "action run timed out"
                );
            }
        }

        if !*last_was_cache_hit && descriptor.cache && self.inner.settings.cache_enabled {
            if let (Some(key), Some(output)) = (&cache_key, last_output.as_ref()) {
                if !output_opts_out_of_cache(output) {
                    if let Ok(bytes) = serde_json::to_vec(output) {
                        self.inner.cache.store(key, &descriptor.name, descriptor.version, bytes).await;
                    }
                }
            }
        }
    }

    async fn resolve_default_model(
        &self,
        variables: &Variables,
        scope: &Arc<FlowScope>,
        task_prefix: &TaskPrefix,
    ) -> Option<String> {
        let explicit = match scope.default_model() {
            Some(spec) => self.render_to_completion(&spec, variables, scope, task_prefix).await,
            None => None,
        };
        let explicit = explicit
            .as_ref()
            .and_then(|v| v.get("model"))
            .and_then(JsonValue::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        match explicit {
            Some(model) => Some(model),
            None => default_model::infer_default_model().await,
        }
    }
}

fn stringify_cache_key(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// An output opts out of caching by carrying a top-level `_no_cache: true` field —
/// the per-output cache-control flag the cache coordinator's rules (§4.5) require.
fn output_opts_out_of_cache(value: &JsonValue) -> bool {
    value
        .get("_no_cache")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false)
}

/// Drops alongside a subscriber's stream: unsubscribes from the hub, and — if that
/// left the task with no subscribers at all — waits the grace period before
/// cancelling the underlying runner (§5, Cancellation). Spawns its cleanup rather
/// than running it inline since `Drop` can't `.await`; this assumes a tokio runtime
/// is still reachable at drop time, true for every call site in this crate.
struct SubscriptionGuard {
    hub: BroadcastHub,
    active_tasks: Arc<Mutex<HashMap<TaskId, JoinHandle<()>>>>,
    task_id: TaskId,
    subscriber_id: SubscriberId,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let hub = self.hub.clone();
        let active_tasks = self.active_tasks.clone();
        let task_id = self.task_id.clone();
        let subscriber_id = self.subscriber_id;
        tokio::spawn(async move {
            hub.unsubscribe(&task_id, subscriber_id).await;
            if hub.subscriber_count(&task_id).await > 0 {
                return;
            }
            tokio::time::sleep(crate::settings::SUBSCRIBER_DRAIN_GRACE).await;
            if hub.subscriber_count(&task_id).await > 0 {
                return;
            }
            let mut active = active_tasks.lock().await;
            if let Some(handle) = active.remove(&task_id) {
                if !handle.is_finished() {
                    handle.abort();
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionContext, ActionDescriptor, ActionOutcome};
    use async_trait::async_trait;
    use flow_store::{InMemoryBlobRepo, InMemoryCacheRepo};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Adder(ActionDescriptor, Arc<AtomicUsize>);

    #[async_trait]
    impl Action for Adder {
        fn descriptor(&self) -> &ActionDescriptor {
            &self.0
        }

        async fn run(&self, ctx: ActionContext) -> Result<ActionOutcome> {
            self.1.fetch_add(1, Ordering::SeqCst);
            let a = ctx.inputs.get("a").and_then(JsonValue::as_i64).unwrap_or(0);
            let b = ctx.inputs.get("b").and_then(JsonValue::as_i64).unwrap_or(0);
            Ok(ActionOutcome::Single(json!({"result": a + b})))
        }
    }

    fn test_scheduler(registry: ActionRegistry) -> Scheduler {
        Scheduler::new(
            Arc::new(registry),
            Arc::new(InMemoryCacheRepo::new()),
            Arc::new(InMemoryBlobRepo::new()),
            None,
            crate::settings::FlowSettings::default(),
        )
    }

    fn doc_with_two_adds() -> FlowDocument {
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
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn chained_action_sees_upstream_terminal_value() {
        let mut registry = ActionRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(Arc::new(Adder(ActionDescriptor::new("test_add"), calls.clone())));
        let scheduler = test_scheduler(registry);
        let doc = doc_with_two_adds();
        let scope = FlowScope::root(&doc);

        let value = scheduler
            .run_executable("second_sum".to_string(), Variables::new(), scope, TaskPrefix::root())
            .await;
        assert_eq!(value, Some(json!({"result": 7})));
    }

    #[tokio::test]
    async fn repeated_run_with_identical_inputs_hits_cache() {
        let mut registry = ActionRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(Arc::new(Adder(ActionDescriptor::new("test_add"), calls.clone())));
        let scheduler = test_scheduler(registry);
        let yaml = r#"
version: "0.1"
flow:
  sum:
    action: test_add
    a: 1
    b: 2
"#;
        let doc: FlowDocument = serde_yaml::from_str(yaml).unwrap();
        let scope = FlowScope::root(&doc);

        let first = scheduler
            .run_executable("sum".to_string(), Variables::new(), scope.clone(), TaskPrefix::root())
            .await;
        let second = scheduler
            .run_executable("sum".to_string(), Variables::new(), scope, TaskPrefix::root())
            .await;
        assert_eq!(first, Some(json!({"result": 3})));
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "cache hit must skip the second run");
    }

    #[tokio::test]
    async fn at_most_one_execution_per_task_id_across_concurrent_subscribers() {
        let mut registry = ActionRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        registry.register(Arc::new(Adder(ActionDescriptor::new("test_add"), calls.clone())));
        let scheduler = test_scheduler(registry);
        let yaml = r#"
version: "0.1"
flow:
  sum:
    action: test_add
    a: 1
    b: 2
"#;
        let doc: FlowDocument = serde_yaml::from_str(yaml).unwrap();
        let scope = FlowScope::root(&doc);

        let a = scheduler.run_executable("sum".to_string(), Variables::new(), scope.clone(), TaskPrefix::root());
        let b = scheduler.run_executable("sum".to_string(), Variables::new(), scope, TaskPrefix::root());
        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra, Some(json!({"result": 3})));
        assert_eq!(rb, ra);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
