//! Engine-wide settings, analogous to the teacher's `ExecutionContext`/
//! `CheckpointConfig`: constructed from a loaded [`crate::model::FlowDocument`] and
//! freely overridable by the embedding application before a flow instance is run.

use std::time::Duration;

use crate::model::FlowDocument;

/// Grace period `stream_action` gives a task that just lost its last subscriber
/// before aborting it (§5, Cancellation).
pub const SUBSCRIBER_DRAIN_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct FlowSettings {
    /// Bounds both the per-step action timeout and the per-subscriber queue-read
    /// timeout (§5) — the spec uses the same value for both surfaces.
    pub action_timeout: Duration,
    /// Master switch; an embedder can disable caching entirely regardless of what
    /// individual actions declare.
    pub cache_enabled: bool,
}

impl FlowSettings {
    pub fn from_document(doc: &FlowDocument) -> Self {
        FlowSettings {
            action_timeout: Duration::from_secs(doc.action_timeout),
            cache_enabled: true,
        }
    }

    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        FlowSettings {
            action_timeout: Duration::from_secs(360),
            cache_enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    #[test]
    fn settings_inherit_action_timeout_from_document() {
        let doc = FlowDocument {
            version: "0.1".to_string(),
            flow: IndexMap::new(),
            default_model: None,
            default_output: None,
            action_timeout: 42,
        };
        let settings = FlowSettings::from_document(&doc);
        assert_eq!(settings.action_timeout, Duration::from_secs(42));
    }
}
