//! End-to-end scenarios from the engine's testable-properties section, run against
//! the public facade and scheduler rather than any single module in isolation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use flow_core::action::{Action, ActionContext, ActionDescriptor, ActionOutcome};
use flow_core::{ActionRegistry, FlowDocument, FlowInstance, FlowSettings, Scheduler, Variables};
use flow_store::{InMemoryBlobRepo, InMemoryCacheRepo};
use futures::StreamExt;
use proptest::prelude::*;
use serde_json::{json, Value as JsonValue};

struct Adder {
    descriptor: ActionDescriptor,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Action for Adder {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn run(&self, ctx: ActionContext) -> flow_core::Result<ActionOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let a = ctx.inputs.get("a").and_then(JsonValue::as_i64).unwrap_or(0);
        let b = ctx.inputs.get("b").and_then(JsonValue::as_i64).unwrap_or(0);
        Ok(ActionOutcome::Single(json!({"result": a + b})))
    }
}

/// A streaming action: yields `{value: 0}` .. `{value: n-1}` one at a time.
struct RangeStream(ActionDescriptor);

#[async_trait]
impl Action for RangeStream {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.0
    }

    async fn run(&self, ctx: ActionContext) -> flow_core::Result<ActionOutcome> {
        let n = ctx.inputs.get("range").and_then(JsonValue::as_i64).unwrap_or(0);
        let stream = async_stream::stream! {
            for i in 0..n {
                yield Ok(json!({"value": i}));
            }
        };
        Ok(ActionOutcome::Stream(Box::pin(stream)))
    }
}

/// An action that always fails — used to prove a failing branch doesn't block an
/// independent sibling.
struct AlwaysErrs(ActionDescriptor);

#[async_trait]
impl Action for AlwaysErrs {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.0
    }

    async fn run(&self, _ctx: ActionContext) -> flow_core::Result<ActionOutcome> {
        Err(flow_core::FlowError::action_failed("err", "always_errs", "boom"))
    }
}

fn instance(doc_yaml: &str, registry: ActionRegistry) -> FlowInstance {
    let scheduler = Scheduler::new(
        Arc::new(registry),
        Arc::new(InMemoryCacheRepo::new()),
        Arc::new(InMemoryBlobRepo::new()),
        None,
        FlowSettings::default(),
    );
    let doc: FlowDocument = serde_yaml::from_str(doc_yaml).unwrap();
    FlowInstance::new(Arc::new(doc), scheduler)
}

#[tokio::test]
async fn three_independent_adds_run_all_and_stream_all() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(Adder {
        descriptor: ActionDescriptor::new("test_add"),
        calls: Arc::new(AtomicUsize::new(0)),
    }));
    let yaml = r#"
version: "0.1"
flow:
  add_two:
    action: test_add
    a: 1
    b: 2
  add_three:
    action: test_add
    a: 1
    b: 3
  add_four:
    action: test_add
    a: 1
    b: 4
"#;
    let inst = instance(yaml, registry);

    let values = inst.run_all(Variables::new()).await.unwrap();
    assert_eq!(values["add_two"], json!({"result": 3}));
    assert_eq!(values["add_three"], json!({"result": 4}));
    assert_eq!(values["add_four"], json!({"result": 5}));

    let mut stream = inst.stream_all(Variables::new()).unwrap();
    let mut last = None;
    while let Some(snapshot) = stream.next().await {
        last = Some(snapshot);
    }
    let last = last.expect("stream_all must yield at least one snapshot");
    assert_eq!(last["add_two"], json!({"result": 3}));
    assert_eq!(last["add_three"], json!({"result": 4}));
    assert_eq!(last["add_four"], json!({"result": 5}));
}

#[tokio::test]
async fn range_stream_stream_consumer_sees_every_value_run_consumer_sees_only_the_last() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(RangeStream(ActionDescriptor::new("range_stream"))));
    let yaml = r#"
version: "0.1"
flow:
  numbers:
    action: range_stream
    range: 10
"#;
    let inst = instance(yaml, registry);

    let mut stream = inst.stream(Some("numbers"), Variables::new()).unwrap();
    let mut seen = Vec::new();
    while let Some(value) = stream.next().await {
        seen.push(value);
    }
    let expected: Vec<JsonValue> = (0..10).map(|i| json!({"value": i})).collect();
    assert_eq!(seen, expected);

    let value = inst.run(Some("numbers"), Variables::new()).await.unwrap();
    assert_eq!(value, Some(json!({"value": 9})));
}

#[tokio::test]
async fn chained_add_resolves_through_subpath() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(Adder {
        descriptor: ActionDescriptor::new("test_add"),
        calls: Arc::new(AtomicUsize::new(0)),
    }));
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
    let inst = instance(yaml, registry);
    let value = inst.run(Some("second_sum.result"), Variables::new()).await.unwrap();
    assert_eq!(value, Some(json!(7)));
}

/// A "subflow" isn't a distinct executable kind in this engine's data model — it's
/// expressed as a length-one loop whose body is the subflow's own flow, binding the
/// parent's variables into the iteration scope. `run()` on the loop id returns a
/// one-element list containing the subflow's output map; navigating into
/// `[0].<subflow default output id>` reproduces "what the subflow's own
/// default_output would return" (see DESIGN.md).
#[tokio::test]
async fn subflow_call_modeled_as_a_single_iteration_loop() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(Adder {
        descriptor: ActionDescriptor::new("test_add"),
        calls: Arc::new(AtomicUsize::new(0)),
    }));
    let yaml = r#"
version: "0.1"
flow:
  call_subflow:
    for: _unused
    in: [1]
    flow:
      subflow_result:
        action: test_add
        a: 10
        b: 5
"#;
    let inst = instance(yaml, registry);
    let value = inst.run(Some("call_subflow"), Variables::new()).await.unwrap();
    let JsonValue::Array(iterations) = value.expect("loop produces a value") else {
        panic!("expected an array");
    };
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0]["subflow_result"], json!({"result": 15}));
}

#[tokio::test]
async fn identical_inputs_hit_cache_on_second_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(Adder {
        descriptor: ActionDescriptor::new("test_add"),
        calls: calls.clone(),
    }));
    let yaml = r#"
version: "0.1"
flow:
  sum:
    action: test_add
    a: 1
    b: 2
"#;
    let inst = instance(yaml, registry);
    let first = inst.run(Some("sum"), Variables::new()).await.unwrap();
    let second = inst.run(Some("sum"), Variables::new()).await.unwrap();
    assert_eq!(first, Some(json!({"result": 3})));
    assert_eq!(second, first);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "second run must be served from cache");
}

#[tokio::test]
async fn failing_action_does_not_block_an_independent_branch() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(AlwaysErrs(ActionDescriptor::new("always_errs"))));
    registry.register(Arc::new(Adder {
        descriptor: ActionDescriptor::new("test_add"),
        calls: Arc::new(AtomicUsize::new(0)),
    }));
    let yaml = r#"
version: "0.1"
flow:
  err:
    action: always_errs
  add:
    action: test_add
    a: 1
    b: 2
"#;
    let inst = instance(yaml, registry);
    let value = inst.run(Some("add"), Variables::new()).await.unwrap();
    assert_eq!(value, Some(json!({"result": 3})));
}

#[tokio::test]
async fn unknown_action_fails_the_facade_call_before_any_task_runs() {
    let registry = ActionRegistry::new();
    let yaml = r#"
version: "0.1"
flow:
  a:
    action: nonexistent_action
    x: 1
"#;
    let inst = instance(yaml, registry);
    let err = inst.run(Some("a"), Variables::new()).await.unwrap_err();
    assert!(matches!(err, flow_core::FlowError::UnknownAction(name) if name == "nonexistent_action"));
}

#[tokio::test]
async fn dependency_cycle_is_rejected_before_any_task_runs() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(Adder {
        descriptor: ActionDescriptor::new("test_add"),
        calls: Arc::new(AtomicUsize::new(0)),
    }));
    let yaml = r#"
version: "0.1"
flow:
  a:
    action: test_add
    a: "{{ b.result }}"
    b: 1
  b:
    action: test_add
    a: "{{ a.result }}"
    b: 1
"#;
    let inst = instance(yaml, registry);
    let err = inst.run(Some("a"), Variables::new()).await.unwrap_err();
    assert!(matches!(err, flow_core::FlowError::Configuration(_)));
}

proptest! {
    /// However many values a task publishes before finishing, one subscriber
    /// observes exactly that sequence in order, terminated by the terminal marker —
    /// the hub never reorders or drops a value for a subscriber that was attached
    /// for its entire lifetime.
    #[test]
    fn fifo_order_holds_for_any_published_sequence(values in prop::collection::vec(any::<i64>(), 0..50)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let hub = flow_core::scheduler::Scheduler::new(
                Arc::new(ActionRegistry::new()),
                Arc::new(InMemoryCacheRepo::new()),
                Arc::new(InMemoryBlobRepo::new()),
                None,
                FlowSettings::default(),
            )
            .hub()
            .clone();
            let task_id = flow_core::ids::TaskId::root(&"seq".to_string());
            let mut sub = hub.subscribe(&task_id).await;
            for v in &values {
                hub.publish(&task_id, json!(v)).await;
            }
            hub.publish_terminal(&task_id).await;

            for expected in &values {
                let received = sub.receiver.recv().await;
                prop_assert!(matches!(
                    received,
                    Some(flow_core::hub::Broadcast::Value(v)) if v == json!(expected)
                ));
            }
            prop_assert!(matches!(
                sub.receiver.recv().await,
                Some(flow_core::hub::Broadcast::Terminal)
            ));
            Ok(())
        })?;
    }

    /// However many concurrent subscribers attach to the same task id before it's
    /// run, the action backing it executes exactly once — every subscriber ends up
    /// sharing one run rather than each triggering its own.
    #[test]
    fn at_most_one_execution_per_task_id_regardless_of_subscriber_count(subscriber_count in 2usize..12) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let calls = Arc::new(AtomicUsize::new(0));
            let mut registry = ActionRegistry::new();
            registry.register(Arc::new(Adder {
                descriptor: ActionDescriptor::new("test_add"),
                calls: calls.clone(),
            }));
            let yaml = r#"
version: "0.1"
flow:
  sum:
    action: test_add
    a: 3
    b: 4
"#;
            let inst = instance(yaml, registry);
            let mut handles = Vec::with_capacity(subscriber_count);
            for _ in 0..subscriber_count {
                let inst = inst.clone();
                handles.push(tokio::spawn(async move {
                    inst.run(Some("sum"), Variables::new()).await
                }));
            }
            for handle in handles {
                let value = handle.await.unwrap().unwrap();
                prop_assert_eq!(value, Some(json!({"result": 7})));
            }
            prop_assert_eq!(calls.load(Ordering::SeqCst), 1);
            Ok(())
        })?;
    }
}
