// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Point-in-time captures of every component, and rollback to them.
//!
//! # Capture
//!
//! ```text
//! pause dequeue ──► wait for in-flight ops (≤ budget) ──► capture ──► resume
//!                         │
//!                         └── over budget: abort with SnapshotPauseTimeout
//! ```
//!
//! Producers keep enqueueing throughout; only the drainer is held.
//!
//! # Rollback
//!
//! Rollback restores each captured value through an authoritative `RESTORE`
//! op, so versions keep moving forward. Components that already hold the
//! captured value are left alone, which makes a repeated rollback a no-op.

pub mod persistence;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::alerts::AlertBus;
use crate::component::{epoch_millis, MutationOp, MutationPayload, StateComponent};
use crate::config::SharedConfig;
use crate::conflict::ConflictRegistry;
use crate::error::{EngineError, Result};
use crate::metrics;
use crate::queue::log::MutationLog;
use crate::queue::MutationQueue;
use crate::resilience::retry::{retry, RetryConfig};
use crate::store::StateStore;
use crate::sync::digest::world_digest;
use crate::sync::SyncCoordinator;

pub use persistence::{MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedComponent {
    pub version: u64,
    pub value: Value,
    pub digest: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub created_at: i64,
    pub created_by: String,
    pub size_bytes: u64,
    pub tags: Vec<String>,
    pub component_versions: BTreeMap<StateComponent, u64>,
    pub world_digest: String,
    pub components: BTreeMap<StateComponent, CapturedComponent>,
}

/// A snapshot without its captured values, for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotSummary {
    pub snapshot_id: String,
    pub created_at: i64,
    pub created_by: String,
    pub size_bytes: u64,
    pub tags: Vec<String>,
    pub component_versions: BTreeMap<StateComponent, u64>,
    pub world_digest: String,
}

impl Snapshot {
    #[must_use]
    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            snapshot_id: self.snapshot_id.clone(),
            created_at: self.created_at,
            created_by: self.created_by.clone(),
            size_bytes: self.size_bytes,
            tags: self.tags.clone(),
            component_versions: self.component_versions.clone(),
            world_digest: self.world_digest.clone(),
        }
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RollbackReport {
    pub snapshot_id: String,
    /// Components rewritten, with the version the restore produced
    pub restored: BTreeMap<StateComponent, u64>,
    /// Components that already matched the snapshot
    pub unchanged: Vec<StateComponent>,
    pub stale_conflicts: usize,
}

pub struct SnapshotManager {
    store: Arc<StateStore>,
    queue: Arc<MutationQueue>,
    log: Arc<dyn MutationLog>,
    snapshots: Arc<dyn SnapshotStore>,
    coordinator: Arc<SyncCoordinator>,
    conflicts: Arc<ConflictRegistry>,
    alerts: Arc<AlertBus>,
    config: SharedConfig,
    rollback_lock: tokio::sync::Mutex<()>,
}

impl SnapshotManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StateStore>,
        queue: Arc<MutationQueue>,
        log: Arc<dyn MutationLog>,
        snapshots: Arc<dyn SnapshotStore>,
        coordinator: Arc<SyncCoordinator>,
        conflicts: Arc<ConflictRegistry>,
        alerts: Arc<AlertBus>,
        config: SharedConfig,
    ) -> Self {
        Self {
            store,
            queue,
            log,
            snapshots,
            coordinator,
            conflicts,
            alerts,
            config,
            rollback_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.snapshots.backend()
    }

    /// Capture every component atomically with respect to the drainer.
    #[instrument(skip(self))]
    pub async fn create_snapshot(&self, tags: Vec<String>, created_by: &str) -> Result<Snapshot> {
        let budget = self.config.read().snapshot_pause_budget();
        let started = Instant::now();

        let cut = {
            let _pause = self.queue.pause();
            if let Err(e) = self.queue.wait_idle(budget).await {
                metrics::record_snapshot("pause_timeout");
                warn!(error = %e, "Snapshot aborted, queue did not quiesce in time");
                return Err(e);
            }
            self.store.capture()
        };
        metrics::record_snapshot_pause(started.elapsed());

        let components: BTreeMap<StateComponent, CapturedComponent> = cut
            .iter()
            .map(|(c, s)| {
                (
                    *c,
                    CapturedComponent {
                        version: s.version,
                        value: (*s.value).clone(),
                        digest: s.digest.clone(),
                        updated_at: s.updated_at,
                    },
                )
            })
            .collect();
        let component_versions = components.iter().map(|(c, s)| (*c, s.version)).collect();
        let digest_input = components
            .iter()
            .map(|(c, s)| (*c, (s.version, s.digest.clone())))
            .collect();

        let mut snapshot = Snapshot {
            snapshot_id: uuid::Uuid::new_v4().to_string(),
            created_at: epoch_millis(),
            created_by: created_by.to_string(),
            size_bytes: 0,
            tags,
            component_versions,
            world_digest: world_digest(&digest_input),
            components,
        };
        snapshot.size_bytes = serde_json::to_vec(&snapshot.components)
            .map(|b| b.len() as u64)
            .unwrap_or(0);

        self.snapshots.save(&snapshot).await?;
        self.prune_log(&snapshot).await;
        metrics::record_snapshot("created");
        metrics::record_snapshot_bytes(snapshot.size_bytes);
        info!(
            snapshot_id = %snapshot.snapshot_id,
            tags = ?snapshot.tags,
            size_bytes = snapshot.size_bytes,
            pause_ms = started.elapsed().as_millis() as u64,
            "Snapshot created"
        );
        Ok(snapshot)
    }

    /// Drop committed log entries the snapshot makes redundant, keeping the
    /// last `replay_window` versions at or below it for replay resolution.
    async fn prune_log(&self, snapshot: &Snapshot) {
        let window = self.config.read().replay_window as u64;
        for (component, version) in &snapshot.component_versions {
            let through = version.saturating_sub(window);
            if through == 0 {
                continue;
            }
            match self.log.prune_committed(*component, through).await {
                Ok(0) => {}
                Ok(dropped) => debug!(%component, through, dropped, "Pruned committed log entries"),
                Err(e) => warn!(%component, error = %e, "Failed to prune committed log entries"),
            }
        }
    }

    /// [`Self::create_snapshot`], retried with backoff while the queue is busy.
    pub async fn create_with_retry(&self, tags: Vec<String>, created_by: &str) -> Result<Snapshot> {
        retry("snapshot_create", &RetryConfig::snapshot(), || {
            self.create_snapshot(tags.clone(), created_by)
        })
        .await
    }

    pub async fn get(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.snapshots
            .load(snapshot_id)
            .await?
            .ok_or_else(|| EngineError::not_found("snapshot", snapshot_id))
    }

    pub async fn list(&self) -> Result<Vec<SnapshotSummary>> {
        Ok(self.snapshots.list().await?)
    }

    pub async fn latest(&self) -> Result<Option<Snapshot>> {
        Ok(self.snapshots.latest().await?)
    }

    /// Force every component back to the snapshot's captured value.
    #[instrument(skip(self))]
    pub async fn rollback(&self, snapshot_id: &str) -> Result<RollbackReport> {
        let (enabled, retention_ms, budget) = {
            let cfg = self.config.read();
            (
                cfg.rollback_enabled,
                cfg.snapshot_retention_secs as i64 * 1_000,
                cfg.snapshot_pause_budget(),
            )
        };
        let conflict = |reason: String| EngineError::RollbackConflict {
            snapshot_id: snapshot_id.to_string(),
            reason,
        };
        if !enabled {
            metrics::record_rollback("disabled");
            return Err(conflict("rollback is disabled".into()));
        }
        let Some(snapshot) = self.snapshots.load(snapshot_id).await? else {
            metrics::record_rollback("missing");
            return Err(conflict("unknown or pruned snapshot".into()));
        };
        let age_ms = epoch_millis() - snapshot.created_at;
        if age_ms > retention_ms {
            metrics::record_rollback("expired");
            return Err(conflict(format!(
                "snapshot is {}s old, past the {}s retention window",
                age_ms / 1_000,
                retention_ms / 1_000
            )));
        }

        let _serial = self.rollback_lock.lock().await;
        let mut report = RollbackReport {
            snapshot_id: snapshot_id.to_string(),
            restored: BTreeMap::new(),
            unchanged: Vec::new(),
            stale_conflicts: 0,
        };

        {
            let _pause = self.queue.pause();
            self.queue.wait_idle(budget).await?;

            for (component, captured) in &snapshot.components {
                let component = *component;
                if self.store.get_state(component).digest == captured.digest {
                    report.unchanged.push(component);
                    continue;
                }
                let op_id = format!("rollback:{}:{}", snapshot_id, uuid::Uuid::new_v4());
                let payload = MutationPayload::Restore {
                    value: captured.value.clone(),
                };
                let version = self.store.apply_authoritative(component, &payload, &op_id)?;
                let op = MutationOp {
                    op_id,
                    component,
                    base_version: version - 1,
                    payload,
                    retries: 0,
                    enqueued_at: epoch_millis(),
                };
                self.log.append_committed(&op, version).await?;
                report.stale_conflicts += self.conflicts.mark_stale(component);
                report.restored.insert(component, version);
            }
        }

        for component in report.restored.keys() {
            let replication = self.coordinator.propagate_authoritative(*component).await;
            if !replication.failed.is_empty() {
                warn!(%component, failed = ?replication.failed, "Rollback not yet on every replica");
            }
        }

        metrics::record_rollback("applied");
        self.alerts.warning(
            "snapshots",
            None,
            format!(
                "rolled back to snapshot {} ({} components restored, {} conflicts voided)",
                snapshot_id,
                report.restored.len(),
                report.stale_conflicts
            ),
        );
        info!(snapshot_id, restored = report.restored.len(), unchanged = report.unchanged.len(), "Rollback complete");
        Ok(report)
    }

    /// Drop snapshots past the retention window. Returns how many went.
    pub async fn prune(&self) -> Result<usize> {
        let retention_ms = self.config.read().snapshot_retention_secs as i64 * 1_000;
        let pruned = self
            .snapshots
            .prune_older_than(epoch_millis() - retention_ms)
            .await?;
        if pruned > 0 {
            metrics::record_snapshots_pruned(pruned);
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldSyncConfig;
    use crate::queue::log::MemoryMutationLog;
    use crate::sync::InMemoryTransport;
    use parking_lot::RwLock;
    use serde_json::json;

    struct Fixture {
        store: Arc<StateStore>,
        queue: Arc<MutationQueue>,
        log: Arc<dyn MutationLog>,
        conflicts: Arc<ConflictRegistry>,
        snapshots: Arc<MemorySnapshotStore>,
        manager: SnapshotManager,
    }

    fn fixture(config: WorldSyncConfig) -> Fixture {
        let config = Arc::new(RwLock::new(config));
        let store = Arc::new(StateStore::default());
        let log: Arc<dyn MutationLog> = Arc::new(MemoryMutationLog::new());
        let queue = Arc::new(MutationQueue::new(log.clone(), 100, RetryConfig::mutation()));
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let coordinator = Arc::new(SyncCoordinator::new(
            store.clone(),
            Arc::new(InMemoryTransport::new()),
            config.clone(),
        ));
        let conflicts = Arc::new(ConflictRegistry::new());
        let manager = SnapshotManager::new(
            store.clone(),
            queue.clone(),
            log.clone(),
            snapshots.clone(),
            coordinator,
            conflicts.clone(),
            Arc::new(AlertBus::default()),
            config,
        );
        Fixture {
            store,
            queue,
            log,
            conflicts,
            snapshots,
            manager,
        }
    }

    fn set(store: &StateStore, component: StateComponent, value: Value) -> u64 {
        let base = store.version(component);
        store
            .apply_mutation(component, base, &MutationPayload::CasUpdate { value })
            .unwrap()
    }

    #[tokio::test]
    async fn test_snapshot_records_every_component() {
        let f = fixture(WorldSyncConfig::default());
        set(&f.store, StateComponent::World, json!({"day": 1}));
        set(&f.store, StateComponent::World, json!({"day": 2}));

        let snapshot = f.manager.create_snapshot(vec!["manual".into()], "ops").await.unwrap();
        assert_eq!(snapshot.component_versions.len(), 6);
        assert_eq!(snapshot.component_versions[&StateComponent::World], 2);
        assert_eq!(snapshot.world_digest, f.store.world_digest());
        assert!(snapshot.size_bytes > 0);
        assert!(snapshot.has_tag("manual"));
        assert!(!f.queue.is_paused());
    }

    #[tokio::test]
    async fn test_snapshot_prunes_log_beyond_replay_window() {
        let f = fixture(WorldSyncConfig {
            replay_window: 4,
            ..Default::default()
        });
        for day in 1..=20 {
            let version = set(&f.store, StateComponent::World, json!({"day": day}));
            let op = MutationOp::new(StateComponent::World, version - 1, MutationPayload::CasUpdate { value: json!({"day": day}) });
            f.log.append_committed(&op, version).await.unwrap();
        }
        set(&f.store, StateComponent::Quests, json!({"open": 1}));

        f.manager.create_snapshot(vec![], "ops").await.unwrap();

        let tail = f.log.committed_tail(StateComponent::World, 16).await.unwrap();
        let versions: Vec<u64> = tail.iter().map(|l| l.committed_version).collect();
        assert_eq!(versions, vec![17, 18, 19, 20]);
        assert_eq!(f.log.stats().await.unwrap().committed, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_aborts_when_queue_stays_busy() {
        let f = fixture(WorldSyncConfig::default());
        f.queue
            .enqueue(MutationOp::new(StateComponent::World, 0, MutationPayload::CasUpdate { value: json!(1) }))
            .await
            .unwrap();
        let in_flight = f.queue.dequeue_batch(1);
        assert_eq!(in_flight.len(), 1);

        let err = f.manager.create_snapshot(vec![], "ops").await.unwrap_err();
        assert!(matches!(err, EngineError::SnapshotPauseTimeout { in_flight: 1, .. }));
        // Dequeue resumes after the abort
        assert!(!f.queue.is_paused());
    }

    #[tokio::test]
    async fn test_rollback_restores_values_and_is_idempotent() {
        let f = fixture(WorldSyncConfig::default());
        set(&f.store, StateComponent::Economy, json!({"gold": 10}));
        let snapshot = f.manager.create_snapshot(vec![], "ops").await.unwrap();
        set(&f.store, StateComponent::Economy, json!({"gold": 99}));
        f.conflicts.open_drift(StateComponent::Economy, 30.0, vec![], 1).unwrap();

        let first = f.manager.rollback(&snapshot.snapshot_id).await.unwrap();
        assert_eq!(first.restored.get(&StateComponent::Economy), Some(&3));
        assert_eq!(first.stale_conflicts, 1);
        assert_eq!(*f.store.get_state(StateComponent::Economy).value, json!({"gold": 10}));
        let versions_after_first: Vec<u64> = StateComponent::ALL.iter().map(|c| f.store.version(*c)).collect();

        let second = f.manager.rollback(&snapshot.snapshot_id).await.unwrap();
        assert!(second.restored.is_empty());
        let versions_after_second: Vec<u64> = StateComponent::ALL.iter().map(|c| f.store.version(*c)).collect();
        assert_eq!(versions_after_first, versions_after_second);
    }

    #[tokio::test]
    async fn test_rollback_refused_when_disabled_or_unknown() {
        let f = fixture(WorldSyncConfig {
            rollback_enabled: false,
            ..Default::default()
        });
        let snapshot = f.manager.create_snapshot(vec![], "ops").await.unwrap();
        let err = f.manager.rollback(&snapshot.snapshot_id).await.unwrap_err();
        assert!(matches!(err, EngineError::RollbackConflict { .. }));

        let f = fixture(WorldSyncConfig::default());
        let err = f.manager.rollback("no-such-snapshot").await.unwrap_err();
        assert!(matches!(err, EngineError::RollbackConflict { .. }));
    }

    #[tokio::test]
    async fn test_rollback_past_retention_fails() {
        let f = fixture(WorldSyncConfig::default());
        let mut snapshot = f.manager.create_snapshot(vec![], "ops").await.unwrap();
        snapshot.snapshot_id = "ancient".into();
        snapshot.created_at -= 8 * 24 * 3_600 * 1_000;
        f.snapshots.save(&snapshot).await.unwrap();

        let err = f.manager.rollback("ancient").await.unwrap_err();
        assert!(err.is_operator_visible());
        assert!(err.to_string().contains("retention"));
    }
}
