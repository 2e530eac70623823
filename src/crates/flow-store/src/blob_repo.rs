//! Blob repository interface — append-only, content-addressed byte storage.
//!
//! Cached action outputs may reference large opaque payloads (images, audio, raw
//! documents) by id rather than embedding them. The [`BlobRepo`] trait is that
//! indirection: `save` hands back a content-derived id, `exists`/`retrieve` look it
//! up again. A cache hit whose referenced blob has since been deleted must be
//! treated as a miss by the caller (see `flow-core`'s cache coordinator) — that
//! invalidation rule lives one layer up, not in this trait.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{Result, StoreError};

/// Opaque identifier for a stored blob. Content-addressed implementations derive
/// this from a hash of the bytes; the in-memory reference implementation uses one
/// too, so two `save` calls with identical bytes return the same id.
pub type BlobId = String;

#[async_trait]
pub trait BlobRepo: Send + Sync {
    /// Persist `bytes`, returning an id that can be used to retrieve them later.
    async fn save(&self, bytes: Vec<u8>) -> Result<BlobId>;

    /// Retrieve previously-saved bytes. Errors with [`StoreError::BlobNotFound`] if
    /// the id is unknown.
    async fn retrieve(&self, id: &BlobId) -> Result<Vec<u8>>;

    /// Cheap existence check, used to decide whether a cached record referencing
    /// this blob is still valid.
    async fn exists(&self, id: &BlobId) -> Result<bool>;

    async fn close(&self) -> Result<()>;
}

fn content_id(bytes: &[u8]) -> BlobId {
    // Content-addressing without pulling in a hashing crate the teacher didn't
    // already depend on: a simple non-cryptographic digest is enough for the
    // dedup/identity properties the in-memory backend needs.
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("blob-{:016x}-{}", hasher.finish(), bytes.len())
}

/// Reference [`BlobRepo`] backed by an in-memory map. Blobs never expire on their
/// own; call [`InMemoryBlobRepo::remove`] to simulate expiry in tests that exercise
/// the cache coordinator's blob-invalidation path.
#[derive(Default)]
pub struct InMemoryBlobRepo {
    data: Arc<RwLock<HashMap<BlobId, Vec<u8>>>>,
}

impl InMemoryBlobRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove a blob, simulating expiry/eviction for tests.
    pub async fn remove(&self, id: &BlobId) {
        self.data.write().await.remove(id);
    }
}

#[async_trait]
impl BlobRepo for InMemoryBlobRepo {
    async fn save(&self, bytes: Vec<u8>) -> Result<BlobId> {
        let id = content_id(&bytes);
        self.data.write().await.insert(id.clone(), bytes);
        Ok(id)
    }

    async fn retrieve(&self, id: &BlobId) -> Result<Vec<u8>> {
        self.data
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::BlobNotFound(id.clone()))
    }

    async fn exists(&self, id: &BlobId) -> Result<bool> {
        Ok(self.data.read().await.contains_key(id))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
