// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: restore, start, shutdown.

use std::time::Instant;

use tracing::{error, info, warn};

use crate::component::StateComponent;
use crate::error::{EngineError, Result};
use crate::queue::MutationLog;
use crate::snapshot::Snapshot;

use super::workers;
use super::{EnginePhase, RestoreReport, WorldSyncEngine};

impl WorldSyncEngine {
    /// Start the engine: restore durable state, then spawn the workers.
    ///
    /// Startup flow:
    /// 1. Load the latest snapshot into the store
    /// 2. Replay committed log entries newer than each snapshot version
    /// 3. Re-queue ops that were accepted but never applied
    /// 4. Spawn drainer, replication, heartbeat, conflict, snapshot,
    ///    zone-population and config workers
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<RestoreReport> {
        let phase = self.phase();
        if phase != EnginePhase::Created {
            return Err(EngineError::InvalidTransition {
                entity: "engine",
                id: "world-sync".into(),
                from: phase.to_string(),
                to: EnginePhase::Starting.to_string(),
            });
        }
        let started = Instant::now();
        info!("Starting world sync engine...");
        self.set_phase(EnginePhase::Starting);

        let report = match self.restore().await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Restore failed, engine not started");
                self.set_phase(EnginePhase::Stopped);
                return Err(e);
            }
        };

        self.spawn_workers().await;
        self.set_phase(EnginePhase::Running);
        crate::metrics::record_startup_phase("total", started.elapsed());
        info!(
            snapshot = ?report.snapshot_id,
            replayed = report.replayed,
            requeued = report.requeued,
            "World sync engine running"
        );
        Ok(report)
    }

    /// Rebuild in-memory state from the snapshot store and the mutation log.
    ///
    /// Called by [`Self::start`]. Safe to call on its own (without workers)
    /// to drive the engine by hand.
    #[tracing::instrument(skip(self))]
    pub async fn restore(&self) -> Result<RestoreReport> {
        self.set_phase(EnginePhase::Restoring);
        let state = &self.state;
        let mut report = RestoreReport::default();

        // ========== PHASE 1: Latest snapshot ==========
        let phase_start = Instant::now();
        if let Some(snapshot) = state.snapshots.latest().await? {
            for (component, captured) in &snapshot.components {
                state
                    .store
                    .load(*component, captured.version, captured.value.clone(), captured.updated_at);
            }
            info!(snapshot_id = %snapshot.snapshot_id, "Loaded snapshot");
            report.snapshot_id = Some(snapshot.snapshot_id);
        } else {
            info!("No snapshot found, starting from empty state");
        }
        crate::metrics::record_startup_phase("snapshot_load", phase_start.elapsed());

        // ========== PHASE 2: Replay committed log ==========
        let phase_start = Instant::now();
        for component in StateComponent::ALL {
            let from = state.store.version(component);
            for logged in state.log.committed_after(component, from).await? {
                let expected = state.store.version(component) + 1;
                if logged.committed_version != expected {
                    warn!(
                        %component,
                        expected,
                        found = logged.committed_version,
                        "Gap in committed log, stopping replay for component"
                    );
                    break;
                }
                state
                    .store
                    .apply_authoritative(component, &logged.op.payload, &logged.op.op_id)?;
                report.replayed += 1;
            }
        }
        crate::metrics::record_startup_phase("log_replay", phase_start.elapsed());

        // ========== PHASE 3: Pending ops back on the queue ==========
        let pending = state.log.pending().await?;
        report.requeued = state.queue.restore_pending(pending);

        info!(replayed = report.replayed, requeued = report.requeued, "Restore complete");
        Ok(report)
    }

    async fn spawn_workers(&self) {
        let mut tasks = self.workers.lock().await;
        let state = &self.state;

        tasks.spawn(workers::run_drainer(state.clone(), self.shutdown_tx.subscribe()));
        tasks.spawn(workers::run_replicator(state.clone(), self.shutdown_tx.subscribe()));
        tasks.spawn(workers::run_zone_population(state.clone(), self.shutdown_tx.subscribe()));
        tasks.spawn(workers::run_heartbeats(state.clone(), self.shutdown_tx.subscribe()));
        tasks.spawn(workers::run_conflicts(state.clone(), self.shutdown_tx.subscribe()));
        tasks.spawn(workers::run_snapshots(state.clone(), self.shutdown_tx.subscribe()));

        if let Some(config_rx) = self.config_rx.lock().take() {
            tasks.spawn(workers::run_config_watcher(
                state.clone(),
                config_rx,
                self.shutdown_tx.subscribe(),
            ));
        }
        info!(workers = tasks.len(), "Workers spawned");
    }

    /// Stop every worker, then take a final snapshot tagged `shutdown`.
    ///
    /// Returns the final snapshot, or `None` if it could not be taken.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) -> Option<Snapshot> {
        let phase = self.phase();
        if matches!(phase, EnginePhase::ShuttingDown | EnginePhase::Stopped) {
            return None;
        }
        let started = Instant::now();
        info!("Initiating world sync engine shutdown...");
        self.set_phase(EnginePhase::ShuttingDown);

        self.shutdown_tx.send_replace(true);
        {
            let mut workers = self.workers.lock().await;
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "Worker ended abnormally");
                }
            }
        }

        let snapshot = match self
            .state
            .snapshots
            .create_with_retry(vec!["shutdown".into()], "engine")
            .await
        {
            Ok(snapshot) => {
                info!(snapshot_id = %snapshot.snapshot_id, "Final snapshot taken");
                Some(snapshot)
            }
            Err(e) => {
                error!(error = %e, "Final snapshot failed");
                None
            }
        };

        self.set_phase(EnginePhase::Stopped);
        crate::metrics::record_startup_phase("shutdown", started.elapsed());
        info!("World sync engine shutdown complete");
        snapshot
    }
}
