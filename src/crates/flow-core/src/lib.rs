//! `flow-core`: a concurrent DAG flow execution engine.
//!
//! A flow document declares a set of named [`model::Executable`]s — action
//! invocations, loops, and plain value declarations — wired together by
//! [`model::ValueSpec`] expressions that reference each other's outputs. The
//! [`scheduler::Scheduler`] resolves those references into a dependency graph at
//! run time, runs each action at most once per task id no matter how many other
//! executables depend on it, and streams every intermediate value through a
//! [`hub::BroadcastHub`] to however many subscribers are currently interested.
//!
//! Concrete actions, blob storage, and cache backends are all external to this
//! crate by design — see [`action::Action`] and `flow_store::{CacheRepo, BlobRepo}`
//! for the seams an embedder implements.

pub mod action;
pub mod cache_coordinator;
pub mod default_model;
pub mod dependency;
pub mod error;
pub mod facade;
pub mod hub;
pub mod ids;
pub mod model;
pub mod preflight;
pub mod scheduler;
pub mod settings;
pub mod value;

pub use action::{Action, ActionContext, ActionDescriptor, ActionOutcome, ActionRegistry, Capabilities};
pub use error::{FlowError, Result};
pub use facade::FlowInstance;
pub use model::{ActionInvocation, Executable, ExecutableId, FlowDocument, LoopSpec, ValueSpec, Variables};
pub use scheduler::{FlowScope, Scheduler, ValueStream};
pub use settings::FlowSettings;
