//! Cache repository interface — key/value storage for serialized action outputs.
//!
//! `flow-core` only ever talks to a cache through the [`CacheRepo`] trait; concrete
//! backends (Redis, SQLite, a `shelve`-style file, ...) are swapped in at the edges.
//! The in-memory implementation here exists for tests and quick local runs, mirroring
//! the role `InMemoryStore` plays for `langgraph-core`'s `Store` trait.
//!
//! Keys are namespaced by `(namespace, version)` so that two actions (or two versions
//! of the same action) never collide on the same cache key.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::Result;

/// A cache of serialized action outputs, keyed by a caller-chosen string.
///
/// Implementations must be safe to share across concurrently-running tasks: the
/// flow scheduler may call `retrieve`/`store` for many tasks at once.
#[async_trait]
pub trait CacheRepo: Send + Sync {
    /// Look up a previously stored value. Returns `Ok(None)` on a plain miss; a
    /// backend error should also be mapped to `None` by the caller (the engine logs
    /// and treats retrieve failures as misses, never as fatal).
    async fn retrieve(
        &self,
        key: &str,
        namespace: &str,
        version: Option<i64>,
    ) -> Result<Option<Vec<u8>>>;

    /// Store a serialized value under `key`. Best-effort: failures are logged by the
    /// caller and otherwise swallowed.
    async fn store(
        &self,
        key: &str,
        value: Vec<u8>,
        namespace: &str,
        version: Option<i64>,
    ) -> Result<()>;

    /// Release any resources held by the backend (file handles, connections, ...).
    async fn close(&self) -> Result<()>;
}

fn namespaced_key(namespace: &str, version: Option<i64>, key: &str) -> String {
    format!("{namespace}:{}:{key}", version.unwrap_or(0))
}

/// Reference [`CacheRepo`] backed by a `HashMap` guarded with an `RwLock`.
///
/// Not persistent across process restarts (the engine's spec explicitly treats
/// cross-restart persistence as out of scope); suitable for tests and single-process
/// deployments that don't need a shared cache.
#[derive(Default)]
pub struct InMemoryCacheRepo {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryCacheRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheRepo for InMemoryCacheRepo {
    async fn retrieve(
        &self,
        key: &str,
        namespace: &str,
        version: Option<i64>,
    ) -> Result<Option<Vec<u8>>> {
        let full_key = namespaced_key(namespace, version, key);
        let data = self.data.read().await;
        Ok(data.get(&full_key).cloned())
    }

    async fn store(
        &self,
        key: &str,
        value: Vec<u8>,
        namespace: &str,
        version: Option<i64>,
    ) -> Result<()> {
        let full_key = namespaced_key(namespace, version, key);
        let mut data = self.data.write().await;
        data.insert(full_key, value);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_value() {
        let repo = InMemoryCacheRepo::new();
        repo.store("k", b"hello".to_vec(), "ns", Some(1))
            .await
            .unwrap();
        let got = repo.retrieve("k", "ns", Some(1)).await.unwrap();
        assert_eq!(got, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn misses_are_none_not_errors() {
        let repo = InMemoryCacheRepo::new();
        let got = repo.retrieve("missing", "ns", None).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn namespace_and_version_isolate_keys() {
        let repo = InMemoryCacheRepo::new();
        repo.store("k", b"v1".to_vec(), "ns", Some(1))
            .await
            .unwrap();
        repo.store("k", b"v2".to_vec(), "ns", Some(2))
            .await
            .unwrap();
        assert_eq!(
            repo.retrieve("k", "ns", Some(1)).await.unwrap(),
            Some(b"v1".to_vec())
        );
        assert_eq!(
            repo.retrieve("k", "ns", Some(2)).await.unwrap(),
            Some(b"v2".to_vec())
        );
    }
}
