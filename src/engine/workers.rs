// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background workers and the single-pass operations they repeat.
//!
//! Each worker is a loop over one `EngineState` clone that exits when the
//! shutdown watch flips. Intervals are re-read from the live config on every
//! iteration, so config updates apply without a restart. The single passes
//! (`drain_once`, `heartbeat_once`, `detect_once`, `resolve_pending`) are
//! public so tests and embedders can drive the engine deterministically.

use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::component::{epoch_millis, StateComponent};
use crate::config::WorldSyncConfig;
use crate::conflict::detector::DetectionReport;
use crate::conflict::resolver::ResolutionOutcome;
use crate::error::EngineError;
use crate::queue::RetryOutcome;
use crate::sync::{HeartbeatReport, ReplicaUpdate, SyncStatus};

use super::{DrainReport, EngineState};

impl EngineState {
    // ═══════════════════════════════════════════════════════════════════════
    // Single passes
    // ═══════════════════════════════════════════════════════════════════════

    /// Dequeue one batch and apply it against the store.
    pub async fn drain_once(&self) -> DrainReport {
        let max = self.config.read().dequeue_batch_size;
        let batch = self.queue.dequeue_batch(max);
        let mut report = DrainReport::default();

        for op in batch {
            match self.store.apply_op(&op) {
                Ok(version) => {
                    self.queue.complete(&op, version).await;
                    report.applied += 1;
                }
                Err(EngineError::VersionConflict { actual, .. }) => {
                    match self.queue.retry(&op, actual).await {
                        RetryOutcome::Requeued { .. } => report.requeued += 1,
                        RetryOutcome::Exhausted(op) => {
                            let record = self.conflicts.open_exhausted(&op, epoch_millis());
                            self.alerts.warning(
                                "queue",
                                Some(op.component),
                                format!(
                                    "op {} out of retries after {} attempts, raised conflict {}",
                                    op.op_id, op.retries, record.conflict_id
                                ),
                            );
                            report.escalated += 1;
                        }
                    }
                }
                Err(e) => {
                    self.queue.reject(&op, &e).await;
                    report.rejected += 1;
                }
            }
        }
        report
    }

    /// One heartbeat round, then resend whatever replicas have not confirmed.
    pub async fn heartbeat_once(&self) -> HeartbeatReport {
        let before = self.coordinator.status();
        let report = self.coordinator.heartbeat_round(epoch_millis()).await;

        for node_id in &report.became_unreachable {
            self.alerts
                .warning("sync", None, format!("replica {node_id} unreachable"));
        }
        for node_id in &report.evicted {
            self.alerts
                .warning("sync", None, format!("replica {node_id} evicted after missing heartbeats"));
        }
        let resent = self.coordinator.resend_pending().await;
        if resent > 0 {
            debug!(resent, "Caught up replicas");
        }

        let after = self.coordinator.status();
        if after != before {
            info!(from = %before, to = %after, "Sync status changed");
            if after == SyncStatus::OutOfSync {
                self.alerts.critical("sync", None, "replication is OUT_OF_SYNC");
            }
        }
        report
    }

    /// One conflict detection scan.
    pub fn detect_once(&self) -> DetectionReport {
        let report = self.detector.scan(epoch_millis());
        for record in &report.raised {
            self.alerts.warning(
                "detector",
                Some(record.component),
                format!("drift conflict {} raised", record.conflict_id),
            );
        }
        report
    }

    /// One resolution attempt on every actionable conflict.
    pub async fn resolve_pending(&self) -> Vec<(String, ResolutionOutcome)> {
        self.resolver.resolve_pending().await
    }

    /// Push the current value of `component` to every replica.
    pub async fn replicate_component(&self, component: StateComponent) {
        let state = self.store.get_state(component);
        let report = self
            .coordinator
            .replicate(ReplicaUpdate::from_state(&state, false))
            .await;
        if !report.failed.is_empty() {
            debug!(%component, failed = ?report.failed, "Replication incomplete, left for resend");
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Worker loops
// ═══════════════════════════════════════════════════════════════════════════

/// Sleep for `period` unless shutdown is signalled first. Returns false on shutdown.
async fn pause_or_stop(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        biased;
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
        _ = tokio::time::sleep(period) => true,
    }
}

pub(super) async fn run_drainer(state: EngineState, mut shutdown: watch::Receiver<bool>) {
    info!("Mutation drainer started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let report = state.drain_once().await;
        if !report.is_idle() && state.queue.backpressure().drain_eagerly() {
            tokio::task::yield_now().await;
            continue;
        }

        let idle = Duration::from_millis(state.config.read().drain_interval_ms);
        let wait = match state.queue.next_ready_at() {
            Some(at) => at
                .saturating_duration_since(tokio::time::Instant::now())
                .min(idle),
            None => idle,
        };
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = state.queue.ready() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    info!("Mutation drainer stopped");
}

/// Forwards `StateChanged` events to the replicas.
pub(super) async fn run_replicator(state: EngineState, mut shutdown: watch::Receiver<bool>) {
    let mut events = state.store.subscribe();
    info!("Replication worker started");
    loop {
        let event = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            event = events.recv() => event,
        };
        match event {
            Ok(changed) => {
                // A newer event for the same component will follow
                if state.store.version(changed.component) == changed.version {
                    state.replicate_component(changed.component).await;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Replication worker lagged, pushing every component");
                for component in StateComponent::ALL {
                    state.replicate_component(component).await;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    info!("Replication worker stopped");
}

/// Keeps zone populations in step with the PLAYER component.
pub(super) async fn run_zone_population(state: EngineState, mut shutdown: watch::Receiver<bool>) {
    let mut events = state.store.subscribe();
    // Pick up whatever was restored before the worker started
    state
        .zones
        .apply_population(&state.store.get_state(StateComponent::Player).value);
    loop {
        let event = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            event = events.recv() => event,
        };
        match event {
            Ok(changed) if changed.component != StateComponent::Player => {}
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                let player = state.store.get_state(StateComponent::Player);
                let updated = state.zones.apply_population(&player.value);
                if updated > 0 {
                    debug!(updated, version = player.version, "Zone populations refreshed");
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

pub(super) async fn run_heartbeats(state: EngineState, mut shutdown: watch::Receiver<bool>) {
    info!("Heartbeat worker started");
    loop {
        let period = Duration::from_millis(state.config.read().heartbeat_interval_ms);
        if !pause_or_stop(&mut shutdown, period).await {
            break;
        }
        state.heartbeat_once().await;
    }
    info!("Heartbeat worker stopped");
}

pub(super) async fn run_conflicts(state: EngineState, mut shutdown: watch::Receiver<bool>) {
    info!("Conflict worker started");
    loop {
        let period = Duration::from_millis(state.config.read().detector_interval_ms);
        if !pause_or_stop(&mut shutdown, period).await {
            break;
        }
        state.detect_once();
        for (conflict_id, outcome) in state.resolve_pending().await {
            debug!(conflict_id = %conflict_id, ?outcome, "Resolution attempt");
        }
    }
    info!("Conflict worker stopped");
}

pub(super) async fn run_snapshots(state: EngineState, mut shutdown: watch::Receiver<bool>) {
    info!("Snapshot worker started");
    loop {
        let secs = state.config.read().snapshot_interval_secs;
        // Disabled: check again in a minute in case config enables it
        let period = Duration::from_secs(if secs == 0 { 60 } else { secs });
        if !pause_or_stop(&mut shutdown, period).await {
            break;
        }
        if secs == 0 {
            continue;
        }
        match state
            .snapshots
            .create_with_retry(vec!["periodic".into()], "scheduler")
            .await
        {
            Ok(snapshot) => debug!(snapshot_id = %snapshot.snapshot_id, "Periodic snapshot taken"),
            Err(e) => {
                error!(error = %e, "Periodic snapshot failed");
                state.alerts.warning("snapshots", None, format!("periodic snapshot failed: {e}"));
            }
        }
        if let Err(e) = state.snapshots.prune().await {
            warn!(error = %e, "Snapshot pruning failed");
        }
    }
    info!("Snapshot worker stopped");
}

/// Applies config updates to the live copy.
pub(super) async fn run_config_watcher(
    state: EngineState,
    mut config_rx: watch::Receiver<WorldSyncConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            changed = config_rx.changed() => {
                if changed.is_err() {
                    debug!("Config channel closed, keeping current config");
                    break;
                }
                let config = config_rx.borrow_and_update().clone();
                state
                    .queue
                    .set_limits(config.max_queue_depth, config.mutation_retry());
                info!(
                    max_queue_depth = config.max_queue_depth,
                    heartbeat_interval_ms = config.heartbeat_interval_ms,
                    snapshot_interval_secs = config.snapshot_interval_secs,
                    "Config updated"
                );
                *state.config.write() = config;
            }
        }
    }
}
