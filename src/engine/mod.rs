// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine coordinator.
//!
//! [`WorldSyncEngine`] owns every component and the background workers that
//! move data between them:
//!
//! ```text
//! submit ──► MutationQueue ──drainer──► StateStore ──StateChanged──► SyncCoordinator ──► replicas
//!                 │                          ▲                             │
//!                 └─ retries exhausted ─┐    │ authoritative restore       │ heartbeats
//!                                       ▼    │                             ▼
//!                               ConflictRegistry ◄── ConflictDetector ◄── replica digests
//!                                       │
//!                                       └──► ConflictResolver ──► AlertBus (escalations)
//! ```
//!
//! The components are shared through one explicit [`EngineState`]; each
//! worker holds a clone of it and nothing is reachable through globals.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Restoring → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use world_sync::{EnginePhase, InMemoryTransport, WorldSyncConfig, WorldSyncEngine};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = WorldSyncConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//! let engine = WorldSyncEngine::new(config, rx, Arc::new(InMemoryTransport::new()));
//!
//! assert_eq!(engine.phase(), EnginePhase::Created);
//! // engine.start().await.expect("start failed");
//! # }
//! ```

mod api;
mod lifecycle;
mod types;
mod workers;

pub use types::{DrainReport, EnginePhase, HealthCheck, RestoreReport, SyncStatusReport};

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::alerts::AlertBus;
use crate::config::{SharedConfig, WorldSyncConfig};
use crate::conflict::detector::ConflictDetector;
use crate::conflict::resolver::ConflictResolver;
use crate::conflict::ConflictRegistry;
use crate::error::Result;
use crate::queue::log::{MemoryMutationLog, MutationLog, SqliteMutationLog};
use crate::queue::MutationQueue;
use crate::snapshot::{MemorySnapshotStore, SnapshotManager, SnapshotStore, SqliteSnapshotStore};
use crate::store::StateStore;
use crate::sync::{ReplicaTransport, SyncCoordinator, SyncStatus};
use crate::zone::ZoneManager;

/// Handles to every engine component.
///
/// Cheap to clone; workers each take their own copy.
#[derive(Clone)]
pub struct EngineState {
    pub config: SharedConfig,
    pub store: Arc<StateStore>,
    pub log: Arc<dyn MutationLog>,
    pub queue: Arc<MutationQueue>,
    pub conflicts: Arc<ConflictRegistry>,
    pub coordinator: Arc<SyncCoordinator>,
    pub detector: Arc<ConflictDetector>,
    pub resolver: Arc<ConflictResolver>,
    pub snapshots: Arc<SnapshotManager>,
    pub zones: Arc<ZoneManager>,
    pub alerts: Arc<AlertBus>,
}

impl EngineState {
    /// Wire the components together over the given backends.
    pub fn new(
        config: WorldSyncConfig,
        transport: Arc<dyn ReplicaTransport>,
        log: Arc<dyn MutationLog>,
        snapshot_store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let store = Arc::new(StateStore::new(config.health_alpha));
        let queue = Arc::new(MutationQueue::new(
            log.clone(),
            config.max_queue_depth,
            config.mutation_retry(),
        ));
        let alerts = Arc::new(AlertBus::new(config.alert_capacity));
        let config: SharedConfig = Arc::new(RwLock::new(config));

        let conflicts = Arc::new(ConflictRegistry::new());
        let coordinator = Arc::new(SyncCoordinator::new(store.clone(), transport, config.clone()));
        let detector = Arc::new(ConflictDetector::new(
            store.clone(),
            coordinator.clone(),
            conflicts.clone(),
            config.clone(),
        ));
        let resolver = Arc::new(ConflictResolver::new(
            store.clone(),
            log.clone(),
            coordinator.clone(),
            conflicts.clone(),
            alerts.clone(),
            config.clone(),
        ));
        let snapshots = Arc::new(SnapshotManager::new(
            store.clone(),
            queue.clone(),
            log.clone(),
            snapshot_store,
            coordinator.clone(),
            conflicts.clone(),
            alerts.clone(),
            config.clone(),
        ));
        let zones = Arc::new(ZoneManager::new(alerts.clone(), config.clone()));

        Self {
            config,
            store,
            log,
            queue,
            conflicts,
            coordinator,
            detector,
            resolver,
            snapshots,
            zones,
            alerts,
        }
    }
}

/// The world sync engine.
///
/// `Send + Sync`; every method takes `&self`, so the engine can sit behind
/// an `Arc` and serve many callers while its workers run.
pub struct WorldSyncEngine {
    pub(super) state: EngineState,

    /// Runtime config updates; taken by the config watcher when it starts
    pub(super) config_rx: parking_lot::Mutex<Option<watch::Receiver<WorldSyncConfig>>>,

    pub(super) phase: watch::Sender<EnginePhase>,
    pub(super) phase_rx: watch::Receiver<EnginePhase>,

    /// Flipped to true to stop every worker
    pub(super) shutdown_tx: watch::Sender<bool>,

    pub(super) workers: Mutex<JoinSet<()>>,
}

impl WorldSyncEngine {
    /// Create an engine over in-memory stores.
    ///
    /// Nothing survives a restart; use [`Self::open`] with `storage_path` set
    /// for a durable engine.
    pub fn new(
        config: WorldSyncConfig,
        config_rx: watch::Receiver<WorldSyncConfig>,
        transport: Arc<dyn ReplicaTransport>,
    ) -> Self {
        if let Some(path) = &config.storage_path {
            warn!(path = %path, "storage_path ignored by WorldSyncEngine::new, use open() for durability");
        }
        Self::with_stores(
            config,
            config_rx,
            transport,
            Arc::new(MemoryMutationLog::new()),
            Arc::new(MemorySnapshotStore::new()),
        )
    }

    /// Create an engine, opening the SQLite stores at `storage_path` if set.
    pub async fn open(
        config: WorldSyncConfig,
        config_rx: watch::Receiver<WorldSyncConfig>,
        transport: Arc<dyn ReplicaTransport>,
    ) -> Result<Self> {
        let (log, snapshots): (Arc<dyn MutationLog>, Arc<dyn SnapshotStore>) =
            match &config.storage_path {
                Some(path) => {
                    let log = SqliteMutationLog::open(path).await?;
                    let snapshots = SqliteSnapshotStore::with_pool(log.pool()).await?;
                    info!(path = %path, "Durable mutation log and snapshot store opened");
                    (Arc::new(log), Arc::new(snapshots))
                }
                None => {
                    warn!("No storage_path configured, running without durability");
                    (
                        Arc::new(MemoryMutationLog::new()),
                        Arc::new(MemorySnapshotStore::new()),
                    )
                }
            };
        Ok(Self::with_stores(config, config_rx, transport, log, snapshots))
    }

    /// Create an engine over caller-supplied backends.
    pub fn with_stores(
        config: WorldSyncConfig,
        config_rx: watch::Receiver<WorldSyncConfig>,
        transport: Arc<dyn ReplicaTransport>,
        log: Arc<dyn MutationLog>,
        snapshot_store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let (phase_tx, phase_rx) = watch::channel(EnginePhase::Created);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            state: EngineState::new(config, transport, log, snapshot_store),
            config_rx: parking_lot::Mutex::new(Some(config_rx)),
            phase: phase_tx,
            phase_rx,
            shutdown_tx,
            workers: Mutex::new(JoinSet::new()),
        }
    }

    #[must_use]
    pub fn phase(&self) -> EnginePhase {
        *self.phase_rx.borrow()
    }

    #[must_use]
    pub fn phase_receiver(&self) -> watch::Receiver<EnginePhase> {
        self.phase_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase() == EnginePhase::Running
    }

    pub(super) fn set_phase(&self, phase: EnginePhase) {
        crate::metrics::set_engine_phase(phase.as_str());
        let _ = self.phase.send(phase);
    }

    /// Component handles, for callers that need more than the API surface.
    #[must_use]
    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Current configuration (a copy).
    #[must_use]
    pub fn config(&self) -> WorldSyncConfig {
        self.state.config.read().clone()
    }

    /// Aggregate engine health.
    ///
    /// Everything here is cached in memory except the log stats, which read
    /// the durable log once.
    pub async fn health_check(&self) -> HealthCheck {
        let phase = self.phase();
        let queue = self.state.queue.stats();
        let backpressure_level = queue.backpressure;
        let accepting_writes = phase.accepts_submissions() && backpressure_level.should_accept_writes();
        let sync_status = self.state.coordinator.status();
        let counts = self.state.conflicts.counts();
        let nodes = self.state.coordinator.nodes();
        let unreachable_nodes = nodes.iter().filter(|n| !n.reachable).count();

        let log = match self.state.log.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Mutation log unreadable during health check");
                None
            }
        };

        let healthy = phase == EnginePhase::Running
            && log.is_some()
            && accepting_writes
            && sync_status != SyncStatus::OutOfSync
            && counts.escalated == 0;

        HealthCheck {
            phase,
            ready: phase == EnginePhase::Running && accepting_writes,
            sync_status,
            backpressure_level,
            accepting_writes,
            queue,
            open_conflicts: counts.open(),
            escalated_conflicts: counts.escalated,
            node_count: nodes.len(),
            unreachable_nodes,
            log_backend: self.state.log.backend(),
            log,
            snapshot_backend: self.state.snapshots.backend(),
            world_digest: self.state.store.world_digest(),
            healthy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::InMemoryTransport;

    fn engine() -> WorldSyncEngine {
        let config = WorldSyncConfig::default();
        let (_tx, rx) = watch::channel(config.clone());
        WorldSyncEngine::new(config, rx, Arc::new(InMemoryTransport::new()))
    }

    #[test]
    fn test_new_engine_is_created() {
        let engine = engine();
        assert_eq!(engine.phase(), EnginePhase::Created);
        assert!(!engine.is_running());
        assert_eq!(engine.state().log.backend(), "memory");
    }

    #[tokio::test]
    async fn test_health_before_start_is_not_ready() {
        let engine = engine();
        let health = engine.health_check().await;
        assert!(!health.ready);
        assert!(!health.healthy);
        assert!(health.accepting_writes);
        assert_eq!(health.sync_status, SyncStatus::Healthy);
        assert_eq!(health.log.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_open_with_storage_path_uses_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorldSyncConfig {
            storage_path: Some(dir.path().join("engine.db").to_string_lossy().into_owned()),
            ..Default::default()
        };
        let (_tx, rx) = watch::channel(config.clone());
        let engine = WorldSyncEngine::open(config, rx, Arc::new(InMemoryTransport::new()))
            .await
            .unwrap();
        let health = engine.health_check().await;
        assert_eq!(health.log_backend, "sqlite");
        assert_eq!(health.snapshot_backend, "sqlite");
    }
}
