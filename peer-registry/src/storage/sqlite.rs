//! SQLite storage backend for the registry server.

use super::{RecordStorage, StoredRecord};
use crate::error::StorageError;
use async_trait::async_trait;
use peer_types::{PeerId, RegistryRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// SQLite-based record storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        let path_str = path.to_str().ok_or_else(|| StorageError::InvalidPath {
            path: path.to_path_buf(),
        })?;
        let options = SqliteConnectOptions::from_str(path_str)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                peer_id BLOB PRIMARY KEY,
                record BLOB NOT NULL,
                ttl INTEGER NOT NULL,
                published_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_expires ON records(expires_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn current_timestamp() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl RecordStorage for SqliteStorage {
    async fn upsert(&self, record: &RegistryRecord) -> Result<StoredRecord, StorageError> {
        let now = Self::current_timestamp();
        let ttl = record.ttl();
        let expires_at = now + i64::from(ttl);
        let encoded = rmp_serde::to_vec_named(record)?;

        sqlx::query(
            r#"
            INSERT INTO records (peer_id, record, ttl, published_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(peer_id) DO UPDATE SET
                record = excluded.record,
                ttl = excluded.ttl,
                published_at = excluded.published_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(record.peer_id.as_bytes().as_slice())
        .bind(&encoded)
        .bind(i64::from(ttl))
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(StoredRecord {
            record: record.clone(),
            published_at: now,
            expires_at,
        })
    }

    async fn lookup(&self, peer_id: &PeerId) -> Result<Option<StoredRecord>, StorageError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT peer_id, record, published_at, expires_at
            FROM records
            WHERE peer_id = ?1 AND expires_at > ?2
            "#,
        )
        .bind(peer_id.as_bytes().as_slice())
        .bind(Self::current_timestamp())
        .fetch_optional(&self.pool)
        .await?;

        row.map(StoredRecord::try_from).transpose()
    }

    async fn cleanup_expired(&self) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM records WHERE expires_at <= ?1")
            .bind(Self::current_timestamp())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn count(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE expires_at > ?1")
            .bind(Self::current_timestamp())
            .fetch_one(&self.pool)
            .await?;

        Ok(count as u64)
    }
}

/// Internal row type for SQLite queries.
#[derive(sqlx::FromRow)]
struct RecordRow {
    peer_id: Vec<u8>,
    record: Vec<u8>,
    published_at: i64,
    expires_at: i64,
}

impl TryFrom<RecordRow> for StoredRecord {
    type Error = StorageError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| StorageError::Corrupt {
            peer_id: hex::encode(&row.peer_id),
            reason,
        };
        let record: RegistryRecord =
            rmp_serde::from_slice(&row.record).map_err(|e| corrupt(e.to_string()))?;
        if record.peer_id.as_bytes().as_slice() != row.peer_id.as_slice() {
            return Err(corrupt("key does not match record".to_string()));
        }
        Ok(StoredRecord {
            record,
            published_at: row.published_at,
            expires_at: row.expires_at,
        })
    }
}
