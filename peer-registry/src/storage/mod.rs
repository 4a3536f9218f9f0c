//! Storage layer for the registry server.
//!
//! One row per peer; a newer publish overwrites the older one.

mod sqlite;

pub use sqlite::SqliteStorage;

use crate::error::StorageError;
use async_trait::async_trait;
use peer_types::{PeerId, RegistryRecord};

/// A record as held by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    /// The signed record, byte-for-byte as published.
    pub record: RegistryRecord,
    /// Unix timestamp of the publish.
    pub published_at: i64,
    /// Unix timestamp after which the record is dropped.
    pub expires_at: i64,
}

impl StoredRecord {
    /// Seconds of validity left at `now`.
    pub fn expires_in(&self, now: i64) -> u32 {
        (self.expires_at - now).clamp(0, i64::from(u32::MAX)) as u32
    }
}

/// Trait for record storage backends.
#[async_trait]
pub trait RecordStorage: Send + Sync {
    /// Insert or replace the record for its peer. Expiry is `now + record.ttl()`.
    async fn upsert(&self, record: &RegistryRecord) -> Result<StoredRecord, StorageError>;

    /// The peer's record, if present and not expired.
    async fn lookup(&self, peer_id: &PeerId) -> Result<Option<StoredRecord>, StorageError>;

    /// Remove expired records.
    ///
    /// Returns the number of records deleted.
    async fn cleanup_expired(&self) -> Result<u64, StorageError>;

    /// Number of live records.
    async fn count(&self) -> Result<u64, StorageError>;
}
