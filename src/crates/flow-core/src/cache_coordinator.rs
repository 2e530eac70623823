//! Cache coordination: key construction, lookup/validation (including the
//! blob-expiry-demotes-to-miss rule), and storage of action outputs.
//!
//! This wraps `flow_store::CacheRepo`/`BlobRepo` — the interfaces themselves are
//! out of this crate's scope — with the policy the scheduler needs: namespacing by
//! `(action_name, version)`, canonical key derivation from an inputs snapshot, and
//! the rule that a cache hit referencing a since-deleted blob must be served as a
//! miss, never as a stale pointer.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use flow_store::{BlobRepo, CacheRepo};

pub struct CacheCoordinator {
    cache_repo: Arc<dyn CacheRepo>,
    blob_repo: Arc<dyn BlobRepo>,
}

impl CacheCoordinator {
    pub fn new(cache_repo: Arc<dyn CacheRepo>, blob_repo: Arc<dyn BlobRepo>) -> Self {
        CacheCoordinator {
            cache_repo,
            blob_repo,
        }
    }

    /// Canonical cache key for an inputs snapshot: serialize it through a
    /// `BTreeMap`-normalized view so the key never depends on struct field
    /// declaration order, only on the field names and values actually present.
    /// Returns `None` if the snapshot contains something non-serializable — callers
    /// treat that as "skip caching for this snapshot", not an error.
    pub fn derive_key(&self, inputs: &JsonValue) -> Option<String> {
        let normalized = normalize(inputs);
        serde_json::to_string(&normalized).ok()
    }

    /// Look up `key` under `(action_name, version)`. Returns the decoded JSON value
    /// on a genuine hit; `None` on a plain miss, a backend error (logged, not
    /// propagated), an undecodable payload, or a hit whose output graph references a
    /// blob that no longer exists (logged as an expired-blob demotion). Blob ids are
    /// discovered by scanning the decoded value itself — the caller never needs to
    /// know them ahead of a successful decode.
    pub async fn lookup(&self, key: &str, action_name: &str, version: Option<i64>) -> Option<JsonValue> {
        let stored = match self.cache_repo.retrieve(key, action_name, version).await {
            Ok(value) => value,
            Err(err) => {
                warn!(action_name, key, %err, "cache retrieve failed, treating as miss");
                None
            }
        }?;

        let decoded: JsonValue = match serde_json::from_slice(&stored) {
            Ok(value) => value,
            Err(err) => {
                warn!(action_name, key, %err, "cache hit undecodable, treating as miss");
                return None;
            }
        };

        for blob_id in collect_blob_ids(&decoded) {
            match self.blob_repo.exists(&blob_id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        action_name,
                        key, blob_id, "cache hit references an expired blob, demoting to miss"
                    );
                    return None;
                }
                Err(err) => {
                    warn!(action_name, key, blob_id, %err, "blob existence check failed, demoting to miss");
                    return None;
                }
            }
        }

        debug!(action_name, key, "cache hit");
        Some(decoded)
    }

    /// Best-effort store. Failures are logged and swallowed — caching is always an
    /// optimization, never a correctness requirement.
    pub async fn store(&self, key: &str, action_name: &str, version: Option<i64>, bytes: Vec<u8>) {
        if let Err(err) = self.cache_repo.store(key, bytes, action_name, version).await {
            warn!(action_name, key, %err, "cache store failed, continuing uncached");
        } else {
            debug!(action_name, key, "cached output");
        }
    }
}

/// Sort object keys recursively so two JSON values that differ only in field order
/// serialize identically.
fn normalize(value: &JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => {
            let mut ordered: std::collections::BTreeMap<String, JsonValue> =
                std::collections::BTreeMap::new();
            for (k, v) in map {
                ordered.insert(k.clone(), normalize(v));
            }
            serde_json::to_value(ordered).unwrap_or(JsonValue::Null)
        }
        JsonValue::Array(items) => JsonValue::Array(items.iter().map(normalize).collect()),
        other => other.clone(),
    }
}

/// Recursively scans a serialized output for blob references so [`lookup`] knows
/// which blob ids to validate before serving a cache hit. Blob references are
/// represented as `{"$blob": "<id>"}` objects anywhere in the output tree.
pub fn collect_blob_ids(value: &JsonValue) -> Vec<String> {
    let mut out = Vec::new();
    collect_blob_ids_into(value, &mut out);
    out
}

fn collect_blob_ids_into(value: &JsonValue, out: &mut Vec<String>) {
    match value {
        JsonValue::Object(map) => {
            if let Some(JsonValue::String(id)) = map.get("$blob") {
                out.push(id.clone());
                return;
            }
            for v in map.values() {
                collect_blob_ids_into(v, out);
            }
        }
        JsonValue::Array(items) => {
            for v in items {
                collect_blob_ids_into(v, out);
            }
        }
        _ => {}
    }
}
