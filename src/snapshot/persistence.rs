// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Snapshot storage.
//!
//! Snapshots are write-once. The SQLite store shares the mutation log's file
//! (and pool) with its own table; the body column holds the captured values
//! as JSON.

use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use tracing::{debug, info};

use super::{Snapshot, SnapshotSummary};
use crate::error::StorageError;
use crate::queue::log::open_sqlite;
use crate::resilience::retry::{retry, RetryConfig};

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    async fn load(&self, snapshot_id: &str) -> Result<Option<Snapshot>, StorageError>;

    async fn latest(&self) -> Result<Option<Snapshot>, StorageError>;

    /// Newest first.
    async fn list(&self) -> Result<Vec<SnapshotSummary>, StorageError>;

    /// Delete snapshots created before `cutoff_ms`, always keeping the newest.
    async fn prune_older_than(&self, cutoff_ms: i64) -> Result<usize, StorageError>;

    fn backend(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════
// SQLITE
// ═══════════════════════════════════════════════════════════════════════════

pub struct SqliteSnapshotStore {
    pool: AnyPool,
}

impl SqliteSnapshotStore {
    /// Open on its own connection pool.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let pool = open_sqlite(path.as_ref()).await?;
        Self::with_pool(pool).await
    }

    /// Use an existing pool (normally the mutation log's).
    pub async fn with_pool(pool: AnyPool) -> Result<Self, StorageError> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                snapshot_id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                created_by TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                world_digest TEXT NOT NULL,
                body TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_snapshots_created ON snapshots (created_at)",
        ];
        for sql in statements {
            retry("snapshot_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }
        Ok(())
    }

    fn row_to_snapshot(row: &AnyRow) -> Result<Snapshot, StorageError> {
        let id: String = row
            .try_get("snapshot_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let body: String = row
            .try_get::<String, _>("body")
            .or_else(|_| {
                row.try_get::<Vec<u8>, _>("body")
                    .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
            })
            .map_err(|e| StorageError::Corrupt {
                id: id.clone(),
                reason: e.to_string(),
            })?;
        serde_json::from_str(&body).map_err(|e| StorageError::Corrupt {
            id,
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let body = serde_json::to_string(snapshot).map_err(|e| StorageError::Corrupt {
            id: snapshot.snapshot_id.clone(),
            reason: e.to_string(),
        })?;
        retry("snapshot_save", &RetryConfig::query(), || async {
            sqlx::query(
                "INSERT INTO snapshots (snapshot_id, created_at, created_by, size_bytes, world_digest, body) \
                 VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT(snapshot_id) DO NOTHING",
            )
            .bind(snapshot.snapshot_id.as_str())
            .bind(snapshot.created_at)
            .bind(snapshot.created_by.as_str())
            .bind(snapshot.size_bytes as i64)
            .bind(snapshot.world_digest.as_str())
            .bind(body.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;
        debug!(snapshot_id = %snapshot.snapshot_id, "Snapshot persisted");
        Ok(())
    }

    async fn load(&self, snapshot_id: &str) -> Result<Option<Snapshot>, StorageError> {
        let row = sqlx::query("SELECT snapshot_id, body FROM snapshots WHERE snapshot_id = ?")
            .bind(snapshot_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.as_ref().map(Self::row_to_snapshot).transpose()
    }

    async fn latest(&self) -> Result<Option<Snapshot>, StorageError> {
        let row = sqlx::query(
            "SELECT snapshot_id, body FROM snapshots ORDER BY created_at DESC, snapshot_id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.as_ref().map(Self::row_to_snapshot).transpose()
    }

    async fn list(&self) -> Result<Vec<SnapshotSummary>, StorageError> {
        let rows = sqlx::query(
            "SELECT snapshot_id, body FROM snapshots ORDER BY created_at DESC, snapshot_id DESC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.iter()
            .map(|row| Self::row_to_snapshot(row).map(|s| s.summary()))
            .collect()
    }

    async fn prune_older_than(&self, cutoff_ms: i64) -> Result<usize, StorageError> {
        let result = sqlx::query(
            "DELETE FROM snapshots WHERE created_at < ? AND snapshot_id NOT IN \
             (SELECT snapshot_id FROM snapshots ORDER BY created_at DESC, snapshot_id DESC LIMIT 1)",
        )
        .bind(cutoff_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        let pruned = result.rows_affected() as usize;
        if pruned > 0 {
            info!(pruned, "Pruned expired snapshots");
        }
        Ok(pruned)
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MEMORY
// ═══════════════════════════════════════════════════════════════════════════

/// Process-local snapshot store. Lost on restart.
#[derive(Default)]
pub struct MemorySnapshotStore {
    // Creation order
    snapshots: Mutex<Vec<Snapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut snapshots = self.snapshots.lock();
        if !snapshots.iter().any(|s| s.snapshot_id == snapshot.snapshot_id) {
            snapshots.push(snapshot.clone());
        }
        Ok(())
    }

    async fn load(&self, snapshot_id: &str) -> Result<Option<Snapshot>, StorageError> {
        Ok(self
            .snapshots
            .lock()
            .iter()
            .find(|s| s.snapshot_id == snapshot_id)
            .cloned())
    }

    async fn latest(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.snapshots.lock().last().cloned())
    }

    async fn list(&self) -> Result<Vec<SnapshotSummary>, StorageError> {
        Ok(self
            .snapshots
            .lock()
            .iter()
            .rev()
            .map(Snapshot::summary)
            .collect())
    }

    async fn prune_older_than(&self, cutoff_ms: i64) -> Result<usize, StorageError> {
        let mut snapshots = self.snapshots.lock();
        let Some(newest) = snapshots.last().map(|s| s.snapshot_id.clone()) else {
            return Ok(0);
        };
        let before = snapshots.len();
        snapshots.retain(|s| s.created_at >= cutoff_ms || s.snapshot_id == newest);
        Ok(before - snapshots.len())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
