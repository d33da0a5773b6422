// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public query and command surface of the engine.
//!
//! Queries:
//! - `get_component_status()` - version, health, pending mutations, drift
//! - `list_conflicts()` / `get_sync_status()`
//! - `list_zones()` / `list_instances()`
//!
//! Commands:
//! - `submit_mutation()` / `submit()` - enqueue a CAS mutation
//! - `create_snapshot()` / `rollback()`
//! - `plan_transfer()` / `execute_transfer()`
//! - `plan_evacuation()` / `execute_evacuation()`

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertSeverity};
use crate::component::{MutationKind, MutationOp, MutationPayload, StateComponent};
use crate::conflict::detector::DetectionReport;
use crate::conflict::resolver::ResolutionOutcome;
use crate::conflict::{ConflictRecord, ConflictStatus};
use crate::error::{EngineError, Result};
use crate::snapshot::{RollbackReport, Snapshot, SnapshotSummary};
use crate::store::ComponentStatus;
use crate::sync::HeartbeatReport;
use crate::zone::plan::{EvacuationPlan, EvacuationRequest, PlanPriority, TransferPlan};
use crate::zone::{InstanceStatus, RealtimeInstance, Zone};

use super::{DrainReport, SyncStatusReport, WorldSyncEngine};

impl WorldSyncEngine {
    // ═══════════════════════════════════════════════════════════════════════════
    // Commands: mutations
    // ═══════════════════════════════════════════════════════════════════════════

    /// Submit a compare-and-swap mutation against `component`.
    ///
    /// Returns the op id once the op is durable. Version conflicts are
    /// retried inside the engine and never surface here.
    ///
    /// # Errors
    /// - `InvalidMutation` if the payload cannot apply to the component
    /// - `Backpressure` if the queue is saturated or the engine is stopping
    pub async fn submit_mutation(
        &self,
        component: StateComponent,
        base_version: u64,
        payload: MutationPayload,
    ) -> Result<String> {
        self.submit(MutationOp::new(component, base_version, payload)).await
    }

    /// Submit a pre-built op (caller-chosen op id).
    ///
    /// Submitting the same op id twice is a no-op that returns the id again.
    #[tracing::instrument(skip(self, op), fields(op_id = %op.op_id, component = %op.component))]
    pub async fn submit(&self, op: MutationOp) -> Result<String> {
        let phase = self.phase();
        if !phase.accepts_submissions() {
            return Err(EngineError::Backpressure(format!("engine is {phase}")));
        }
        op.validate()?;

        let threshold = self.state.config.read().large_patch_threshold;
        if op.kind() == MutationKind::DeltaPatch && op.payload.patch_width() > threshold {
            match self
                .state
                .snapshots
                .create_snapshot(vec!["pre-delta-patch".into()], "engine")
                .await
            {
                Ok(snapshot) => {
                    info!(snapshot_id = %snapshot.snapshot_id, keys = op.payload.patch_width(), "Snapshot before large delta patch");
                }
                Err(e) => {
                    warn!(error = %e, "Pre-patch snapshot failed, submitting anyway");
                }
            }
        }

        let op_id = op.op_id.clone();
        if !self.state.queue.enqueue(op).await? {
            debug!("Duplicate submission");
        }
        Ok(op_id)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn get_component_status(&self, component: StateComponent) -> ComponentStatus {
        let pending = self.state.queue.pending_for(component);
        self.state.store.status(component, pending)
    }

    /// Current value of one component.
    #[must_use]
    pub fn get_component_value(&self, component: StateComponent) -> Value {
        (*self.state.store.get_state(component).value).clone()
    }

    #[must_use]
    pub fn list_conflicts(&self, status: Option<ConflictStatus>) -> Vec<ConflictRecord> {
        self.state.conflicts.list(status)
    }

    #[must_use]
    pub fn get_sync_status(&self) -> SyncStatusReport {
        let queue = self.state.queue.stats();
        SyncStatusReport {
            status: self.state.coordinator.status(),
            queue_size: queue.depth,
            success_rate: queue.success_rate,
            backlog_minutes: queue.backlog_minutes,
            nodes: self.state.coordinator.nodes(),
            open_circuits: self.state.coordinator.open_circuits(),
        }
    }

    #[must_use]
    pub fn list_zones(&self, region: Option<&str>) -> Vec<Zone> {
        self.state.zones.list_zones(region)
    }

    #[must_use]
    pub fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        region: Option<&str>,
    ) -> Vec<RealtimeInstance> {
        self.state.zones.list_instances(status, region)
    }

    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotSummary>> {
        self.state.snapshots.list().await
    }

    /// Alerts still held in the bounded feed, oldest first.
    #[must_use]
    pub fn alerts(&self, severity: Option<AlertSeverity>) -> Vec<Alert> {
        self.state.alerts.recent(severity)
    }

    #[must_use]
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.state.alerts.subscribe()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Commands: snapshots
    // ═══════════════════════════════════════════════════════════════════════════

    /// Take a consistent snapshot of every component.
    ///
    /// # Errors
    /// `SnapshotPauseTimeout` if the drainer could not be quiesced in time.
    pub async fn create_snapshot(&self, tags: Vec<String>) -> Result<Snapshot> {
        self.state.snapshots.create_snapshot(tags, "operator").await
    }

    /// Restore every component to a snapshot's captured values.
    ///
    /// Versions keep increasing; rolling back twice to the same snapshot is a
    /// no-op the second time.
    ///
    /// # Errors
    /// `RollbackConflict` if the snapshot is unknown or past retention.
    pub async fn rollback(&self, snapshot_id: &str) -> Result<RollbackReport> {
        self.state.snapshots.rollback(snapshot_id).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Commands: conflicts
    // ═══════════════════════════════════════════════════════════════════════════

    /// Close an escalated conflict with an operator-chosen value.
    pub async fn resolve_conflict_manually(&self, conflict_id: &str, value: Value) -> Result<ConflictRecord> {
        self.state.resolver.resolve_manually(conflict_id, value).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Commands: replicas and zones
    // ═══════════════════════════════════════════════════════════════════════════

    /// Add a replica to the roster. Returns `false` if it was already known.
    pub fn register_node(&self, node_id: &str) -> bool {
        self.state.coordinator.register_node(node_id)
    }

    pub fn register_instance(&self, instance: RealtimeInstance) {
        self.state.zones.register_instance(instance);
    }

    pub fn register_zone(&self, zone: Zone) -> Result<()> {
        self.state.zones.register_zone(zone)
    }

    /// # Errors
    /// `CapacityExceeded` if the instance is at `max_zones` or not online.
    pub fn assign_zone(&self, zone_id: &str, instance_id: &str) -> Result<()> {
        self.state.zones.assign_zone(zone_id, instance_id)
    }

    /// Feed one tick duration. May return an automatically planned transfer.
    pub fn report_tick(&self, instance_id: &str, tick_ms: f64) -> Result<Option<TransferPlan>> {
        self.state.zones.report_tick(instance_id, tick_ms)
    }

    pub fn plan_transfer(
        &self,
        zone_id: &str,
        target_instance_id: &str,
        priority: PlanPriority,
        reason: &str,
    ) -> Result<TransferPlan> {
        self.state.zones.plan_transfer(zone_id, target_instance_id, priority, reason)
    }

    pub async fn execute_transfer(&self, plan_id: &str) -> Result<TransferPlan> {
        self.state.zones.execute_transfer(plan_id).await
    }

    pub fn plan_evacuation(&self, request: EvacuationRequest) -> Result<EvacuationPlan> {
        self.state.zones.plan_evacuation(request)
    }

    pub async fn execute_evacuation(&self, plan_id: &str) -> Result<EvacuationPlan> {
        self.state.zones.execute_evacuation(plan_id).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Manual drive (tests, tools, engines run without workers)
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn drain_once(&self) -> DrainReport {
        self.state.drain_once().await
    }

    pub async fn heartbeat_once(&self) -> HeartbeatReport {
        self.state.heartbeat_once().await
    }

    #[must_use]
    pub fn detect_once(&self) -> DetectionReport {
        self.state.detect_once()
    }

    pub async fn resolve_pending(&self) -> Vec<(String, ResolutionOutcome)> {
        self.state.resolve_pending().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Map};
    use tokio::sync::watch;

    use crate::component::{MutationPayload, StateComponent};
    use crate::config::WorldSyncConfig;
    use crate::engine::WorldSyncEngine;
    use crate::error::EngineError;
    use crate::sync::InMemoryTransport;

    fn engine_with(config: WorldSyncConfig) -> WorldSyncEngine {
        let (_tx, rx) = watch::channel(config.clone());
        WorldSyncEngine::new(config, rx, Arc::new(InMemoryTransport::new()))
    }

    #[tokio::test]
    async fn test_submit_then_drain_updates_status() {
        let engine = engine_with(WorldSyncConfig::default());
        let op_id = engine
            .submit_mutation(StateComponent::World, 0, MutationPayload::CasUpdate { value: json!({"weather": "rain"}) })
            .await
            .unwrap();
        assert!(!op_id.is_empty());
        assert_eq!(engine.get_component_status(StateComponent::World).pending_mutations, 1);

        engine.drain_once().await;
        let status = engine.get_component_status(StateComponent::World);
        assert_eq!(status.version, 1);
        assert_eq!(status.pending_mutations, 0);
        assert_eq!(engine.get_component_value(StateComponent::World)["weather"], "rain");
    }

    #[tokio::test]
    async fn test_large_delta_patch_takes_snapshot_first() {
        let config = WorldSyncConfig { large_patch_threshold: 2, ..Default::default() };
        let engine = engine_with(config);

        let mut patch = Map::new();
        for key in ["a", "b", "c"] {
            patch.insert(key.into(), json!(1));
        }
        engine
            .submit_mutation(StateComponent::Factions, 0, MutationPayload::DeltaPatch { patch })
            .await
            .unwrap();

        let snapshots = engine.list_snapshots().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].tags.iter().any(|t| t == "pre-delta-patch"));
    }

    #[tokio::test]
    async fn test_submit_rejected_after_shutdown() {
        let engine = engine_with(WorldSyncConfig::default());
        engine.start().await.unwrap();
        engine.shutdown().await;

        let err = engine
            .submit_mutation(StateComponent::Combat, 0, MutationPayload::CasUpdate { value: json!({}) })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Backpressure(_)));
    }

    #[tokio::test]
    async fn test_sync_status_lists_registered_nodes() {
        let engine = engine_with(WorldSyncConfig::default());
        assert!(engine.register_node("replica-a"));
        assert!(!engine.register_node("replica-a"));

        let status = engine.get_sync_status();
        assert_eq!(status.nodes.len(), 1);
        assert_eq!(status.queue_size, 0);
        assert!(status.open_circuits.is_empty());
    }
}
