//! The broadcast hub: per-task output fan-out to every active subscriber, plus
//! delivery of the latest value to subscribers that join after earlier values were
//! already published.
//!
//! Grounded on the teacher's `stream.rs` multiplexer (mpsc-channel based stream
//! fan-out) but generalized from a fixed set of `StreamMode`s to an arbitrary number
//! of per-task subscriber queues keyed by [`TaskId`], since here fan-out happens per
//! *task*, not per fixed channel kind.
//!
//! State is guarded by a `tokio::sync::Mutex` rather than left unsynchronized the
//! way a single-threaded cooperative loop could get away with — this crate runs on
//! tokio's multi-threaded executor, so the hub's task table is genuinely shared
//! mutable state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

use crate::ids::TaskId;

/// One value published by a task's runner: either an output snapshot or the
/// terminal marker, published exactly once per task, always last.
#[derive(Debug, Clone)]
pub enum Broadcast {
    Value(JsonValue),
    Terminal,
}

pub type SubscriberId = u64;

struct TaskChannels {
    subscribers: HashMap<SubscriberId, UnboundedSender<Broadcast>>,
    /// Subscribers that haven't yet received any value — tracked so the runner can
    /// flush its last output to a late joiner instead of leaving it waiting for a
    /// publish that already happened.
    new_listeners: HashMap<SubscriberId, UnboundedSender<Broadcast>>,
}

impl TaskChannels {
    fn new() -> Self {
        TaskChannels {
            subscribers: HashMap::new(),
            new_listeners: HashMap::new(),
        }
    }
}

/// A subscription handle. Dropping it without calling [`BroadcastHub::unsubscribe`]
/// leaves a stale entry in the hub's table — callers (the scheduler's `stream_action`
/// loop) always unsubscribe in a `finally`-equivalent path.
pub struct Subscription {
    pub task_id: TaskId,
    pub subscriber_id: SubscriberId,
    pub receiver: UnboundedReceiver<Broadcast>,
}

#[derive(Clone)]
pub struct BroadcastHub {
    tasks: Arc<Mutex<HashMap<TaskId, TaskChannels>>>,
    next_subscriber_id: Arc<AtomicU64>,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastHub {
    pub fn new() -> Self {
        BroadcastHub {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_subscriber_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether a task is already registered (has at least one active or past
    /// subscriber). The scheduler uses this to decide whether to spawn a new runner
    /// or simply attach to the one already in flight.
    pub async fn has_task(&self, task_id: &TaskId) -> bool {
        self.tasks.lock().await.contains_key(task_id)
    }

    /// Register that a task now exists (about to be run), so concurrent
    /// `subscribe` calls racing the runner's own startup see it immediately.
    pub async fn register_task(&self, task_id: &TaskId) {
        self.tasks
            .lock()
            .await
            .entry(task_id.clone())
            .or_insert_with(TaskChannels::new);
    }

    pub async fn subscribe(&self, task_id: &TaskId) -> Subscription {
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded_channel();
        let mut tasks = self.tasks.lock().await;
        let channels = tasks.entry(task_id.clone()).or_insert_with(TaskChannels::new);
        channels.subscribers.insert(subscriber_id, tx.clone());
        channels.new_listeners.insert(subscriber_id, tx);
        Subscription {
            task_id: task_id.clone(),
            subscriber_id,
            receiver: rx,
        }
    }

    pub async fn unsubscribe(&self, task_id: &TaskId, subscriber_id: SubscriberId) {
        if let Some(channels) = self.tasks.lock().await.get_mut(task_id) {
            channels.subscribers.remove(&subscriber_id);
            channels.new_listeners.remove(&subscriber_id);
        }
    }

    /// How many subscribers `task_id` currently has. Used by the scheduler to decide
    /// whether a just-unsubscribed task has gone to zero listeners and should start
    /// its grace-period countdown toward cancellation.
    pub async fn subscriber_count(&self, task_id: &TaskId) -> usize {
        self.tasks
            .lock()
            .await
            .get(task_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    /// Publish a value to every current subscriber of `task_id`. Subscribers that
    /// receive it are cleared from the new-listener set — they're caught up now.
    pub async fn publish(&self, task_id: &TaskId, value: JsonValue) {
        let mut tasks = self.tasks.lock().await;
        if let Some(channels) = tasks.get_mut(task_id) {
            let mut delivered = Vec::new();
            let mut dead = Vec::new();
            for (id, tx) in channels.subscribers.iter() {
                if tx.send(Broadcast::Value(value.clone())).is_ok() {
                    delivered.push(*id);
                } else {
                    dead.push(*id);
                }
            }
            for id in delivered {
                channels.new_listeners.remove(&id);
            }
            for id in dead {
                channels.subscribers.remove(&id);
                channels.new_listeners.remove(&id);
            }
        }
    }

    /// Publish the terminal marker. Called exactly once per task, after which the
    /// task's entry is dropped — no further subscribers can usefully attach.
    pub async fn publish_terminal(&self, task_id: &TaskId) {
        let mut tasks = self.tasks.lock().await;
        if let Some(channels) = tasks.remove(task_id) {
            for tx in channels.subscribers.values() {
                let _ = tx.send(Broadcast::Terminal);
            }
        }
    }

    /// Deliver `value` only to subscribers that joined after it was already
    /// published — the late-joiner flush the runner performs once, right before
    /// publishing the terminal marker.
    pub async fn flush_to_new_listeners(&self, task_id: &TaskId, value: JsonValue) {
        let mut tasks = self.tasks.lock().await;
        if let Some(channels) = tasks.get_mut(task_id) {
            let recipients: Vec<SubscriberId> = channels.new_listeners.keys().copied().collect();
            for id in recipients {
                if let Some(tx) = channels.subscribers.get(&id) {
                    let _ = tx.send(Broadcast::Value(value.clone()));
                }
                channels.new_listeners.remove(&id);
            }
        }
    }
}
