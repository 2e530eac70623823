//! Task identity.
//!
//! A [`TaskId`] is fully-qualified: it's the concatenation of every enclosing loop
//! iteration's prefix with the executable's own id. Two requests that produce the
//! same `TaskId` within one flow invocation share a single running task — this is
//! the "at most one execution per task id" invariant the scheduler and hub both
//! depend on.
//!
//! Deliberately a plain string rather than a `Uuid`: task identity here is
//! deterministic and derived from structural position, not randomly generated, so
//! there's nothing for a random-id generator to do.

use crate::model::ExecutableId;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(String);

impl TaskId {
    /// A task id for a top-level executable, no enclosing loop prefix.
    pub fn root(executable_id: &ExecutableId) -> Self {
        TaskId(executable_id.clone())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A prefix prepended to executable ids when resolving task ids inside a loop
/// iteration's scope. Kept distinct from `TaskId` so a prefix can't accidentally be
/// used as a complete task id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskPrefix(String);

impl TaskPrefix {
    pub fn root() -> Self {
        TaskPrefix(String::new())
    }

    pub fn resolve(&self, executable_id: &ExecutableId) -> TaskId {
        TaskId(format!("{}{}", self.0, executable_id))
    }

    pub fn nested(&self, loop_id: &ExecutableId, index: usize) -> TaskPrefix {
        TaskPrefix(format!("{}{}[{}].", self.0, loop_id, index))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
