// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable mutation log.
//!
//! Every accepted op is appended before it becomes visible to the drainer, so
//! a crash never loses a player intent. Rows move `pending → committed` (or
//! `escalated` / `rejected`); committed rows double as the replay source for
//! conflict resolution and restart recovery.
//!
//! ```sql
//! CREATE TABLE mutation_log (
//!   seq INTEGER PRIMARY KEY AUTOINCREMENT,
//!   op_id TEXT NOT NULL UNIQUE,
//!   component TEXT NOT NULL,
//!   base_version INTEGER NOT NULL,
//!   payload TEXT NOT NULL,          -- MutationPayload as JSON
//!   retries INTEGER NOT NULL,
//!   enqueued_at INTEGER NOT NULL,
//!   status TEXT NOT NULL,           -- pending | committed | escalated | rejected
//!   committed_version INTEGER,
//!   committed_at INTEGER
//! )
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info, warn};

use crate::component::{epoch_millis, MutationOp, MutationPayload, StateComponent};
use crate::error::StorageError;
use crate::resilience::retry::{retry, RetryConfig};

static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Open a SQLite pool with WAL journaling and full fsync on commit.
pub(crate) async fn open_sqlite(path: &Path) -> Result<AnyPool, StorageError> {
    install_drivers();
    let url = format!("sqlite://{}?mode=rwc", path.to_string_lossy());

    let pool = retry("sqlite_connect", &RetryConfig::startup(), || async {
        AnyPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&url)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    })
    .await?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;
    // Commits are player intents: fsync every one
    sqlx::query("PRAGMA synchronous = FULL")
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

    Ok(pool)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Pending,
    Committed,
    Escalated,
    Rejected,
}

impl LogStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Escalated => "escalated",
            Self::Rejected => "rejected",
        }
    }
}

/// A committed op and the version it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedMutation {
    pub op: MutationOp,
    pub committed_version: u64,
    pub committed_at: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LogStats {
    pub pending: u64,
    pub committed: u64,
    pub escalated: u64,
    pub rejected: u64,
    /// Statements that failed since startup
    pub errors: u64,
}

#[async_trait]
pub trait MutationLog: Send + Sync {
    /// Append a pending op. Returns false if the op id is already logged.
    async fn append(&self, op: &MutationOp) -> Result<bool, StorageError>;

    /// Persist the rebased base version and retry count of a pending op.
    async fn record_retry(&self, op: &MutationOp) -> Result<(), StorageError>;

    async fn mark_committed(&self, op_id: &str, version: u64) -> Result<(), StorageError>;

    /// Log an engine-issued op (rollback, resolution) that was applied directly.
    async fn append_committed(&self, op: &MutationOp, version: u64) -> Result<(), StorageError>;

    async fn mark_escalated(&self, op_id: &str) -> Result<(), StorageError>;

    async fn mark_rejected(&self, op_id: &str) -> Result<(), StorageError>;

    /// Pending ops in append order.
    async fn pending(&self) -> Result<Vec<MutationOp>, StorageError>;

    /// Last `k` committed ops of a component, oldest first.
    async fn committed_tail(
        &self,
        component: StateComponent,
        k: usize,
    ) -> Result<Vec<LoggedMutation>, StorageError>;

    /// Committed ops of a component that produced a version above `version`, oldest first.
    async fn committed_after(
        &self,
        component: StateComponent,
        version: u64,
    ) -> Result<Vec<LoggedMutation>, StorageError>;

    /// Drop committed entries of a component at or below `through_version`.
    /// Returns how many were dropped.
    async fn prune_committed(
        &self,
        component: StateComponent,
        through_version: u64,
    ) -> Result<u64, StorageError>;

    async fn stats(&self) -> Result<LogStats, StorageError>;

    fn backend(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════
// SQLITE
// ═══════════════════════════════════════════════════════════════════════════

pub struct SqliteMutationLog {
    pool: AnyPool,
    path: String,
    errors: AtomicU64,
}

impl SqliteMutationLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        let pool = open_sqlite(path_ref).await?;
        let log = Self {
            pool,
            path: path_ref.to_string_lossy().to_string(),
            errors: AtomicU64::new(0),
        };
        log.init_schema().await?;

        let stats = log.stats().await?;
        if stats.pending > 0 {
            warn!(path = %log.path, pending = stats.pending, "Mutation log has pending ops from previous run");
        } else {
            info!(path = %log.path, committed = stats.committed, "Opened mutation log");
        }
        Ok(log)
    }

    /// Share the pool with the snapshot store (same file).
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS mutation_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                op_id TEXT NOT NULL UNIQUE,
                component TEXT NOT NULL,
                base_version INTEGER NOT NULL,
                payload TEXT NOT NULL,
                retries INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                committed_version INTEGER,
                committed_at INTEGER
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_mutation_log_status ON mutation_log (status)",
            "CREATE INDEX IF NOT EXISTS idx_mutation_log_committed ON mutation_log (component, committed_version)",
        ];

        for sql in statements {
            retry("mutation_log_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }
        Ok(())
    }

    fn backend_err(&self, e: sqlx::Error) -> StorageError {
        self.errors.fetch_add(1, Ordering::Relaxed);
        StorageError::Backend(e.to_string())
    }

    fn row_to_op(row: &AnyRow) -> Result<MutationOp, StorageError> {
        let op_id: String = row
            .try_get("op_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let corrupt = |reason: String| StorageError::Corrupt { id: op_id.clone(), reason };

        let component: String = row.try_get("component").map_err(|e| corrupt(e.to_string()))?;
        let component: StateComponent = component.parse().map_err(|e: crate::error::EngineError| corrupt(e.to_string()))?;
        let payload_json: String = row
            .try_get::<String, _>("payload")
            .or_else(|_| {
                row.try_get::<Vec<u8>, _>("payload")
                    .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
            })
            .map_err(|e| corrupt(e.to_string()))?;
        let payload: MutationPayload =
            serde_json::from_str(&payload_json).map_err(|e| corrupt(e.to_string()))?;
        let base_version: i64 = row.try_get("base_version").map_err(|e| corrupt(e.to_string()))?;
        let retries: i64 = row.try_get("retries").unwrap_or(0);
        let enqueued_at: i64 = row.try_get("enqueued_at").unwrap_or(0);

        Ok(MutationOp {
            op_id: op_id.clone(),
            component,
            base_version: base_version as u64,
            payload,
            retries: retries as u32,
            enqueued_at,
        })
    }

    fn row_to_logged(row: &AnyRow) -> Result<LoggedMutation, StorageError> {
        let op = Self::row_to_op(row)?;
        let committed_version: i64 = row.try_get("committed_version").map_err(|e| {
            StorageError::Corrupt { id: op.op_id.clone(), reason: e.to_string() }
        })?;
        let committed_at: i64 = row.try_get("committed_at").unwrap_or(0);
        Ok(LoggedMutation {
            op,
            committed_version: committed_version as u64,
            committed_at,
        })
    }

    async fn set_status(&self, op_id: &str, status: LogStatus) -> Result<(), StorageError> {
        sqlx::query("UPDATE mutation_log SET status = ? WHERE op_id = ?")
            .bind(status.as_str())
            .bind(op_id)
            .execute(&self.pool)
            .await
            .map_err(|e| self.backend_err(e))?;
        Ok(())
    }

    fn encode_payload(op: &MutationOp) -> Result<String, StorageError> {
        serde_json::to_string(&op.payload).map_err(|e| StorageError::Corrupt {
            id: op.op_id.clone(),
            reason: e.to_string(),
        })
    }
}

const SELECT_COLUMNS: &str =
    "op_id, component, base_version, payload, retries, enqueued_at, committed_version, committed_at";

#[async_trait]
impl MutationLog for SqliteMutationLog {
    async fn append(&self, op: &MutationOp) -> Result<bool, StorageError> {
        let payload = Self::encode_payload(op)?;
        let result = retry("mutation_log_append", &RetryConfig::query(), || async {
            sqlx::query(
                "INSERT INTO mutation_log (op_id, component, base_version, payload, retries, enqueued_at, status) \
                 VALUES (?, ?, ?, ?, ?, ?, 'pending') ON CONFLICT(op_id) DO NOTHING",
            )
            .bind(op.op_id.as_str())
            .bind(op.component.as_str())
            .bind(op.base_version as i64)
            .bind(payload.as_str())
            .bind(op.retries as i64)
            .bind(op.enqueued_at)
            .execute(&self.pool)
            .await
            .map_err(|e| self.backend_err(e))
        })
        .await?;

        let inserted = result.rows_affected() > 0;
        debug!(op_id = %op.op_id, inserted, "Appended op to mutation log");
        Ok(inserted)
    }

    async fn record_retry(&self, op: &MutationOp) -> Result<(), StorageError> {
        sqlx::query("UPDATE mutation_log SET base_version = ?, retries = ? WHERE op_id = ?")
            .bind(op.base_version as i64)
            .bind(op.retries as i64)
            .bind(op.op_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| self.backend_err(e))?;
        Ok(())
    }

    async fn mark_committed(&self, op_id: &str, version: u64) -> Result<(), StorageError> {
        retry("mutation_log_commit", &RetryConfig::query(), || async {
            sqlx::query(
                "UPDATE mutation_log SET status = 'committed', committed_version = ?, committed_at = ? WHERE op_id = ?",
            )
            .bind(version as i64)
            .bind(epoch_millis())
            .bind(op_id)
            .execute(&self.pool)
            .await
            .map_err(|e| self.backend_err(e))
        })
        .await?;
        Ok(())
    }

    async fn append_committed(&self, op: &MutationOp, version: u64) -> Result<(), StorageError> {
        let payload = Self::encode_payload(op)?;
        retry("mutation_log_append_committed", &RetryConfig::query(), || async {
            sqlx::query(
                "INSERT INTO mutation_log (op_id, component, base_version, payload, retries, enqueued_at, status, committed_version, committed_at) \
                 VALUES (?, ?, ?, ?, ?, ?, 'committed', ?, ?) \
                 ON CONFLICT(op_id) DO UPDATE SET status = 'committed', committed_version = excluded.committed_version, committed_at = excluded.committed_at",
            )
            .bind(op.op_id.as_str())
            .bind(op.component.as_str())
            .bind(op.base_version as i64)
            .bind(payload.as_str())
            .bind(op.retries as i64)
            .bind(op.enqueued_at)
            .bind(version as i64)
            .bind(epoch_millis())
            .execute(&self.pool)
            .await
            .map_err(|e| self.backend_err(e))
        })
        .await?;
        Ok(())
    }

    async fn mark_escalated(&self, op_id: &str) -> Result<(), StorageError> {
        self.set_status(op_id, LogStatus::Escalated).await
    }

    async fn mark_rejected(&self, op_id: &str) -> Result<(), StorageError> {
        self.set_status(op_id, LogStatus::Rejected).await
    }

    async fn pending(&self) -> Result<Vec<MutationOp>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM mutation_log WHERE status = 'pending' ORDER BY seq",
            SELECT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.backend_err(e))?;

        let mut ops = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::row_to_op(row) {
                Ok(op) => ops.push(op),
                Err(e) => warn!(error = %e, "Skipping unreadable pending op"),
            }
        }
        Ok(ops)
    }

    async fn committed_tail(
        &self,
        component: StateComponent,
        k: usize,
    ) -> Result<Vec<LoggedMutation>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM mutation_log WHERE status = 'committed' AND component = ? \
             ORDER BY committed_version DESC LIMIT ?",
            SELECT_COLUMNS
        ))
        .bind(component.as_str())
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.backend_err(e))?;

        let mut tail = rows
            .iter()
            .map(Self::row_to_logged)
            .collect::<Result<Vec<_>, _>>()?;
        tail.reverse();
        Ok(tail)
    }

    async fn committed_after(
        &self,
        component: StateComponent,
        version: u64,
    ) -> Result<Vec<LoggedMutation>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM mutation_log WHERE status = 'committed' AND component = ? \
             AND committed_version > ? ORDER BY committed_version",
            SELECT_COLUMNS
        ))
        .bind(component.as_str())
        .bind(version as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| self.backend_err(e))?;

        rows.iter().map(Self::row_to_logged).collect()
    }

    async fn prune_committed(
        &self,
        component: StateComponent,
        through_version: u64,
    ) -> Result<u64, StorageError> {
        let result = sqlx::query(
            "DELETE FROM mutation_log WHERE status = 'committed' AND component = ? AND committed_version <= ?",
        )
        .bind(component.as_str())
        .bind(through_version as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| self.backend_err(e))?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<LogStats, StorageError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS cnt FROM mutation_log GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.backend_err(e))?;

        let mut stats = LogStats {
            errors: self.errors.load(Ordering::Relaxed),
            ..Default::default()
        };
        for row in rows {
            let status: String = row.try_get("status").unwrap_or_default();
            let count: i64 = row.try_get("cnt").unwrap_or(0);
            match status.as_str() {
                "pending" => stats.pending = count as u64,
                "committed" => stats.committed = count as u64,
                "escalated" => stats.escalated = count as u64,
                "rejected" => stats.rejected = count as u64,
                _ => {}
            }
        }
        Ok(stats)
    }

    fn backend(&self) -> &'static str {
        "sqlite"
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// IN-MEMORY
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
struct MemoryEntry {
    op: MutationOp,
    status: LogStatus,
    committed_version: Option<u64>,
    committed_at: i64,
}

/// Non-durable log for tests and `storage_path = None`.
///
/// Entries are kept in append order and indexed by op id and, once
/// committed, by component and version.
#[derive(Default)]
pub struct MemoryMutationLog {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    next_seq: u64,
    entries: BTreeMap<u64, MemoryEntry>,
    by_op: HashMap<String, u64>,
    /// component → committed version → seq
    committed: HashMap<StateComponent, BTreeMap<u64, u64>>,
}

impl MemoryInner {
    fn push(&mut self, entry: MemoryEntry) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_op.insert(entry.op.op_id.clone(), seq);
        self.entries.insert(seq, entry);
        seq
    }

    fn entry_mut(&mut self, op_id: &str) -> Option<(u64, &mut MemoryEntry)> {
        let seq = *self.by_op.get(op_id)?;
        self.entries.get_mut(&seq).map(|e| (seq, e))
    }

    fn index_committed(&mut self, seq: u64) {
        let Some(entry) = self.entries.get(&seq) else {
            return;
        };
        if let (LogStatus::Committed, Some(version)) = (entry.status, entry.committed_version) {
            self.committed
                .entry(entry.op.component)
                .or_default()
                .insert(version, seq);
        }
    }

    fn unindex(&mut self, seq: u64) {
        let Some(entry) = self.entries.get(&seq) else {
            return;
        };
        if let (Some(versions), Some(version)) =
            (self.committed.get_mut(&entry.op.component), entry.committed_version)
        {
            if versions.get(&version) == Some(&seq) {
                versions.remove(&version);
            }
        }
    }

    fn logged(&self, seq: u64) -> Option<LoggedMutation> {
        let entry = self.entries.get(&seq)?;
        Some(LoggedMutation {
            op: entry.op.clone(),
            committed_version: entry.committed_version?,
            committed_at: entry.committed_at,
        })
    }
}

impl MemoryMutationLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_status(&self, op_id: &str, status: LogStatus) {
        let mut inner = self.inner.lock();
        let Some((seq, _)) = inner.entry_mut(op_id) else {
            return;
        };
        inner.unindex(seq);
        if let Some(entry) = inner.entries.get_mut(&seq) {
            entry.status = status;
        }
    }
}

#[async_trait]
impl MutationLog for MemoryMutationLog {
    async fn append(&self, op: &MutationOp) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock();
        if inner.by_op.contains_key(&op.op_id) {
            return Ok(false);
        }
        inner.push(MemoryEntry {
            op: op.clone(),
            status: LogStatus::Pending,
            committed_version: None,
            committed_at: 0,
        });
        Ok(true)
    }

    async fn record_retry(&self, op: &MutationOp) -> Result<(), StorageError> {
        if let Some((_, e)) = self.inner.lock().entry_mut(&op.op_id) {
            e.op.base_version = op.base_version;
            e.op.retries = op.retries;
        }
        Ok(())
    }

    async fn mark_committed(&self, op_id: &str, version: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let Some((seq, _)) = inner.entry_mut(op_id) else {
            return Ok(());
        };
        inner.unindex(seq);
        if let Some(e) = inner.entries.get_mut(&seq) {
            e.status = LogStatus::Committed;
            e.committed_version = Some(version);
            e.committed_at = epoch_millis();
        }
        inner.index_committed(seq);
        Ok(())
    }

    async fn append_committed(&self, op: &MutationOp, version: u64) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let entry = MemoryEntry {
            op: op.clone(),
            status: LogStatus::Committed,
            committed_version: Some(version),
            committed_at: epoch_millis(),
        };
        let seq = match inner.by_op.get(&op.op_id).copied() {
            Some(seq) => {
                inner.unindex(seq);
                inner.entries.insert(seq, entry);
                seq
            }
            None => inner.push(entry),
        };
        inner.index_committed(seq);
        Ok(())
    }

    async fn mark_escalated(&self, op_id: &str) -> Result<(), StorageError> {
        self.set_status(op_id, LogStatus::Escalated);
        Ok(())
    }

    async fn mark_rejected(&self, op_id: &str) -> Result<(), StorageError> {
        self.set_status(op_id, LogStatus::Rejected);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<MutationOp>, StorageError> {
        Ok(self
            .inner
            .lock()
            .entries
            .values()
            .filter(|e| e.status == LogStatus::Pending)
            .map(|e| e.op.clone())
            .collect())
    }

    async fn committed_tail(
        &self,
        component: StateComponent,
        k: usize,
    ) -> Result<Vec<LoggedMutation>, StorageError> {
        let inner = self.inner.lock();
        let Some(versions) = inner.committed.get(&component) else {
            return Ok(Vec::new());
        };
        let mut tail: Vec<LoggedMutation> = versions
            .values()
            .rev()
            .take(k)
            .filter_map(|seq| inner.logged(*seq))
            .collect();
        tail.reverse();
        Ok(tail)
    }

    async fn committed_after(
        &self,
        component: StateComponent,
        version: u64,
    ) -> Result<Vec<LoggedMutation>, StorageError> {
        let inner = self.inner.lock();
        let Some(versions) = inner.committed.get(&component) else {
            return Ok(Vec::new());
        };
        Ok(versions
            .range(version.saturating_add(1)..)
            .filter_map(|(_, seq)| inner.logged(*seq))
            .collect())
    }

    async fn prune_committed(
        &self,
        component: StateComponent,
        through_version: u64,
    ) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock();
        let Some(versions) = inner.committed.get_mut(&component) else {
            return Ok(0);
        };
        let kept = versions.split_off(&through_version.saturating_add(1));
        let dropped = std::mem::replace(versions, kept);
        for seq in dropped.values() {
            if let Some(entry) = inner.entries.remove(seq) {
                inner.by_op.remove(&entry.op.op_id);
            }
        }
        Ok(dropped.len() as u64)
    }

    async fn stats(&self) -> Result<LogStats, StorageError> {
        let mut stats = LogStats::default();
        for e in self.inner.lock().entries.values() {
            match e.status {
                LogStatus::Pending => stats.pending += 1,
                LogStatus::Committed => stats.committed += 1,
                LogStatus::Escalated => stats.escalated += 1,
                LogStatus::Rejected => stats.rejected += 1,
            }
        }
        Ok(stats)
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn op(component: StateComponent, base: u64, id: &str) -> MutationOp {
        MutationOp::new(component, base, MutationPayload::CasUpdate { value: json!({"b": base}) })
            .with_op_id(id)
    }

    async fn exercise(log: &dyn MutationLog) {
        assert!(log.append(&op(StateComponent::World, 0, "a")).await.unwrap());
        assert!(!log.append(&op(StateComponent::World, 0, "a")).await.unwrap());
        assert!(log.append(&op(StateComponent::World, 1, "b")).await.unwrap());
        assert!(log.append(&op(StateComponent::Economy, 0, "c")).await.unwrap());

        log.mark_committed("a", 1).await.unwrap();
        log.record_retry(&op(StateComponent::World, 1, "b").rebased(1)).await.unwrap();
        log.mark_committed("b", 2).await.unwrap();
        log.mark_escalated("c").await.unwrap();
        log.append_committed(&op(StateComponent::World, 2, "restore-1"), 3)
            .await
            .unwrap();

        assert!(log.pending().await.unwrap().is_empty());

        let tail = log.committed_tail(StateComponent::World, 2).await.unwrap();
        let versions: Vec<u64> = tail.iter().map(|l| l.committed_version).collect();
        assert_eq!(versions, vec![2, 3]);
        assert_eq!(tail[0].op.retries, 1);

        let after = log.committed_after(StateComponent::World, 1).await.unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[1].op.op_id, "restore-1");

        let stats = log.stats().await.unwrap();
        assert_eq!(stats.committed, 3);
        assert_eq!(stats.escalated, 1);
        assert_eq!(stats.pending, 0);
    }

    async fn prune(log: &dyn MutationLog) {
        for version in 1..=6 {
            let id = format!("w{version}");
            log.append(&op(StateComponent::World, version - 1, &id)).await.unwrap();
            log.mark_committed(&id, version).await.unwrap();
        }
        log.append_committed(&op(StateComponent::Economy, 0, "e1"), 1).await.unwrap();
        log.append(&op(StateComponent::World, 6, "w-pending")).await.unwrap();

        assert_eq!(log.prune_committed(StateComponent::World, 4).await.unwrap(), 4);
        assert_eq!(log.prune_committed(StateComponent::World, 4).await.unwrap(), 0);

        let tail = log.committed_tail(StateComponent::World, 16).await.unwrap();
        let versions: Vec<u64> = tail.iter().map(|l| l.committed_version).collect();
        assert_eq!(versions, vec![5, 6]);
        assert_eq!(log.committed_after(StateComponent::Economy, 0).await.unwrap().len(), 1);
        assert_eq!(log.pending().await.unwrap().len(), 1);

        let stats = log.stats().await.unwrap();
        assert_eq!(stats.committed, 3);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_memory_log_prunes_committed() {
        let log = MemoryMutationLog::new();
        prune(&log).await;
        // A pruned op id can be appended again
        assert!(log.append(&op(StateComponent::World, 0, "w1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_log_prunes_committed() {
        let dir = tempdir().unwrap();
        let log = SqliteMutationLog::open(dir.path().join("prune.db")).await.unwrap();
        prune(&log).await;
    }

    #[tokio::test]
    async fn test_memory_log_lifecycle() {
        exercise(&MemoryMutationLog::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_log_lifecycle() {
        let dir = tempdir().unwrap();
        let log = SqliteMutationLog::open(dir.path().join("log.db")).await.unwrap();
        exercise(&log).await;
        assert_eq!(log.backend(), "sqlite");
    }

    #[tokio::test]
    async fn test_sqlite_pending_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("restart.db");

        {
            let log = SqliteMutationLog::open(&path).await.unwrap();
            log.append(&op(StateComponent::Player, 4, "p1")).await.unwrap();
            log.append(&op(StateComponent::Player, 5, "p2")).await.unwrap();
            log.mark_committed("p1", 5).await.unwrap();
        }

        let log = SqliteMutationLog::open(&path).await.unwrap();
        let pending = log.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op_id, "p2");
        assert_eq!(pending[0].base_version, 5);
        assert_eq!(pending[0].payload, MutationPayload::CasUpdate { value: json!({"b": 5}) });
    }
}
