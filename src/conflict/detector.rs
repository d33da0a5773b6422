// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Periodic drift scan over replica views.
//!
//! The scan reads the canonical store and the views replicas reported in
//! their last heartbeat or push ack. It never touches component values; its
//! only outputs are drift gauges and new PENDING conflict records.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, instrument};

use super::{ConflictRecord, ConflictRegistry};
use crate::component::StateComponent;
use crate::config::SharedConfig;
use crate::store::{ComponentState, StateStore};
use crate::sync::{SyncCoordinator, SyncNode};

/// Percent divergence of a replica version from the canonical version.
///
/// `|replica - canonical| / canonical * 100`, capped at 100. With a canonical
/// version of 0 any replica version other than 0 is fully diverged. Equal
/// versions with different digests are fully diverged too.
#[must_use]
pub fn drift_percent(replica_version: u64, canonical_version: u64, digests_match: bool) -> f64 {
    if replica_version == canonical_version {
        return if digests_match { 0.0 } else { 100.0 };
    }
    if canonical_version == 0 {
        return 100.0;
    }
    let diff = replica_version.abs_diff(canonical_version) as f64;
    (diff * 100.0 / canonical_version as f64).min(100.0)
}

/// Drift of one component across the roster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentDrift {
    pub component: StateComponent,
    pub canonical_version: u64,
    /// Worst drift among reachable nodes
    pub drift_percent: f64,
    pub threshold: f64,
    /// Reachable nodes above the threshold
    pub diverged_nodes: Vec<String>,
}

impl ComponentDrift {
    #[must_use]
    pub fn exceeded(&self) -> bool {
        self.drift_percent > self.threshold
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionReport {
    pub scanned_at: i64,
    pub drifts: Vec<ComponentDrift>,
    pub raised: Vec<ConflictRecord>,
    /// Components over threshold that already had an open conflict
    pub suppressed: Vec<StateComponent>,
}

impl DetectionReport {
    #[must_use]
    pub fn drift(&self, component: StateComponent) -> Option<&ComponentDrift> {
        self.drifts.iter().find(|d| d.component == component)
    }
}

/// Drift of `canonical` against every reachable node that reported a view.
#[must_use]
pub fn evaluate(nodes: &[SyncNode], canonical: &ComponentState, threshold: f64) -> ComponentDrift {
    let mut worst = 0.0f64;
    let mut diverged = Vec::new();
    for node in nodes.iter().filter(|n| n.reachable) {
        let Some(view) = node.replicas.get(&canonical.component) else {
            continue;
        };
        let drift = drift_percent(view.version, canonical.version, view.digest == canonical.digest);
        worst = worst.max(drift);
        if drift > threshold {
            diverged.push(node.node_id.clone());
        }
    }
    ComponentDrift {
        component: canonical.component,
        canonical_version: canonical.version,
        drift_percent: worst,
        threshold,
        diverged_nodes: diverged,
    }
}

pub struct ConflictDetector {
    store: Arc<StateStore>,
    coordinator: Arc<SyncCoordinator>,
    registry: Arc<ConflictRegistry>,
    config: SharedConfig,
}

impl ConflictDetector {
    pub fn new(
        store: Arc<StateStore>,
        coordinator: Arc<SyncCoordinator>,
        registry: Arc<ConflictRegistry>,
        config: SharedConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            registry,
            config,
        }
    }

    /// One pass over every component.
    #[instrument(skip(self))]
    pub fn scan(&self, now_ms: i64) -> DetectionReport {
        let nodes = self.coordinator.nodes();
        let mut report = DetectionReport {
            scanned_at: now_ms,
            ..Default::default()
        };

        for component in StateComponent::ALL {
            let threshold = self.config.read().drift_threshold(component);
            let canonical = self.store.get_state(component);
            let drift = evaluate(&nodes, &canonical, threshold);
            self.store.set_drift(component, drift.drift_percent);

            if drift.exceeded() {
                match self.registry.open_drift(
                    component,
                    drift.drift_percent,
                    drift.diverged_nodes.clone(),
                    now_ms,
                ) {
                    Some(record) => report.raised.push(record),
                    None => {
                        debug!(%component, drift = drift.drift_percent, "Conflict already open");
                        report.suppressed.push(component);
                    }
                }
            }
            report.drifts.push(drift);
        }
        report
    }
}
