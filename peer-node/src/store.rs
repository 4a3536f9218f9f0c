//! Content store seam.
//!
//! The node never owns the post database. It reads authored deltas back for
//! backfill and hands over inbound deltas once they are admitted. Payloads
//! stored here are already sealed under the local storage key.

use async_trait::async_trait;
use peer_types::{ContentHash, Delta, PeerId, Sequence};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

/// Content store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No delta with this content hash.
    #[error("content not found: {hash}")]
    NotFound {
        /// Hex-encoded content hash.
        hash: String,
    },

    /// Backend failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Where deltas live at rest.
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    /// Fetch a delta by content hash.
    async fn get_content(&self, hash: &ContentHash) -> Result<Delta, StoreError>;

    /// Persist a delta. Storing the same hash twice is a no-op.
    async fn put_content(&self, delta: Delta) -> Result<(), StoreError>;

    /// `(sequence, hash)` of every delta authored by `origin`, ascending.
    async fn sequences(&self, origin: &PeerId) -> Result<Vec<(Sequence, ContentHash)>, StoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    by_hash: HashMap<ContentHash, Delta>,
    arrival: Vec<ContentHash>,
}

/// In-memory store for tests and the standalone daemon.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deltas in the order they were first stored.
    pub fn arrivals(&self) -> Vec<Delta> {
        let inner = self.lock();
        inner
            .arrival
            .iter()
            .filter_map(|hash| inner.by_hash.get(hash).cloned())
            .collect()
    }

    /// Number of stored deltas.
    pub fn len(&self) -> usize {
        self.lock().by_hash.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn get_content(&self, hash: &ContentHash) -> Result<Delta, StoreError> {
        self.lock()
            .by_hash
            .get(hash)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                hash: hex::encode(hash.as_bytes()),
            })
    }

    async fn put_content(&self, delta: Delta) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.by_hash.contains_key(&delta.content_hash) {
            inner.arrival.push(delta.content_hash);
            inner.by_hash.insert(delta.content_hash, delta);
        }
        Ok(())
    }

    async fn sequences(&self, origin: &PeerId) -> Result<Vec<(Sequence, ContentHash)>, StoreError> {
        let inner = self.lock();
        let mut out: Vec<_> = inner
            .by_hash
            .values()
            .filter(|d| &d.origin == origin)
            .map(|d| (d.sequence, d.content_hash))
            .collect();
        out.sort_by_key(|(seq, _)| *seq);
        Ok(out)
    }
}
