//! The engine's single error type.
//!
//! Mirrors the shape of a typical graph-engine error enum: one `thiserror` type with
//! a variant per failure class, `#[from]` conversions for the handful of upstream
//! error types we wrap, and small constructor helpers for the variants that carry
//! enough context to be worth a named constructor.
//!
//! Only [`FlowError::Configuration`]-class variants are meant to escape a facade call
//! as a hard `Err`. Everything else is logged at the point it occurs and degrades the
//! affected task's output stream without failing sibling branches — see the error
//! handling notes in the design doc for which is which.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlowError>;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("unresolved variable: {0}")]
    UnresolvedVariable(String),

    #[error("unresolved link target: {0}")]
    UnresolvedLink(String),

    #[error("executable {id} is not an action invocation")]
    NotAnAction { id: String },

    #[error("executable {id} is not a loop")]
    NotALoop { id: String },

    #[error("executable {id} is not a value declaration")]
    NotAValueDeclaration { id: String },

    #[error("loop {loop_id}: 'in' expression did not render to an iterable value")]
    LoopSourceNotIterable { loop_id: String },

    #[error("input validation failed for task {task_id}: {reason}")]
    InputValidation { task_id: String, reason: String },

    #[error("action {action_name} failed for task {task_id}: {reason}")]
    ActionFailed {
        task_id: String,
        action_name: String,
        reason: String,
    },

    #[error("cache backend error: {0}")]
    Cache(#[from] flow_store::StoreError),

    #[error("task {task_id} timed out after {timeout_secs}s")]
    Timeout { task_id: String, timeout_secs: u64 },

    #[error("task {task_id} was cancelled")]
    Cancelled { task_id: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("a target output could not be resolved (still undefined after its dependency finished)")]
    UnresolvedTarget,
}

impl FlowError {
    pub fn action_failed(
        task_id: impl Into<String>,
        action_name: impl Into<String>,
        reason: impl std::fmt::Display,
    ) -> Self {
        FlowError::ActionFailed {
            task_id: task_id.into(),
            action_name: action_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn input_validation(task_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        FlowError::InputValidation {
            task_id: task_id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn configuration(reason: impl std::fmt::Display) -> Self {
        FlowError::Configuration(reason.to_string())
    }

    /// Whether this error represents a pre-flight configuration problem that should
    /// fail the whole facade call, as opposed to one that only degrades a task's
    /// output stream.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FlowError::UnknownAction(_)
                | FlowError::UnresolvedVariable(_)
                | FlowError::UnresolvedLink(_)
                | FlowError::Configuration(_)
                | FlowError::UnresolvedTarget
        )
    }
}
