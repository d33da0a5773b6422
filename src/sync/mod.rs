// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replica roster, heartbeats and change propagation.
//!
//! The coordinator never blocks local writes: pushes and heartbeats run as
//! concurrent round-trips with a per-call timeout, and each replica sits
//! behind its own circuit breaker so a dead node is skipped fast.
//!
//! # Node lifecycle
//!
//! ```text
//! register ──► reachable ──(no ack for unreachable_after)──► unreachable
//!                  ▲                                              │
//!                  └──────────────── ack ◄────────────────────────┤
//!                                                                 │
//!                                  (no ack for evict_after) ──────┴──► evicted
//! ```
//!
//! Delivery is at-least-once. A push that fails is remembered as unacked and
//! resent by [`SyncCoordinator::resend_pending`]; replicas ignore versions
//! they already hold, so duplicates are harmless.

pub mod digest;
pub mod memory;
pub mod transport;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::component::{epoch_millis, StateComponent};
use crate::config::SharedConfig;
use crate::conflict::detector::drift_percent;
use crate::error::{EngineError, Result};
use crate::metrics;
use crate::resilience::circuit_breaker::{CircuitConfig, CircuitError, NodeCircuits};
use crate::store::StateStore;

pub use memory::{InMemoryTransport, LoopbackReplica};
pub use transport::{
    HeartbeatAck, PushAck, ReplicaState, ReplicaTransport, ReplicaUpdate, ReplicaView,
};

/// Aggregate replication health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Healthy,
    Degraded,
    OutOfSync,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "HEALTHY",
            Self::Degraded => "DEGRADED",
            Self::OutOfSync => "OUT_OF_SYNC",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A push the node has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingPush {
    pub version: u64,
    pub authoritative: bool,
}

/// One replica as the coordinator sees it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncNode {
    pub node_id: String,
    pub latency_ms: u64,
    /// Replica clock minus local clock, latency-corrected
    pub drift_ms: i64,
    /// Worst component drift against the canonical store
    pub drift_percent: f64,
    pub last_ack_at: Option<i64>,
    pub registered_at: i64,
    pub missed_heartbeats: u32,
    pub reachable: bool,
    pub replicas: BTreeMap<StateComponent, ReplicaView>,
    pub unacked: BTreeMap<StateComponent, PendingPush>,
}

impl SyncNode {
    fn new(node_id: &str, now_ms: i64) -> Self {
        Self {
            node_id: node_id.to_string(),
            latency_ms: 0,
            drift_ms: 0,
            drift_percent: 0.0,
            last_ack_at: None,
            registered_at: now_ms,
            missed_heartbeats: 0,
            reachable: true,
            replicas: BTreeMap::new(),
            unacked: BTreeMap::new(),
        }
    }

    /// Millis since the last ack, or since registration if never acked.
    #[must_use]
    pub fn silent_for(&self, now_ms: i64) -> i64 {
        (now_ms - self.last_ack_at.unwrap_or(self.registered_at)).max(0)
    }

    fn refresh_drift(&mut self, store: &StateStore) {
        self.drift_percent = self
            .replicas
            .iter()
            .map(|(c, view)| {
                let canonical = store.get_state(*c);
                drift_percent(
                    view.version,
                    canonical.version,
                    view.digest == canonical.digest,
                )
            })
            .fold(0.0, f64::max);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub acked: Vec<String>,
    pub failed: Vec<String>,
    pub became_unreachable: Vec<String>,
    pub recovered: Vec<String>,
    pub evicted: Vec<String>,
}

/// Outcome of pushing one component version to the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationReport {
    pub component: StateComponent,
    pub version: u64,
    pub acked: Vec<String>,
    pub failed: Vec<String>,
    /// Unreachable nodes left for resend
    pub skipped: Vec<String>,
    /// Digest each acking node now holds
    pub digests: BTreeMap<String, String>,
}

impl ReplicationReport {
    /// Every node pushed to acked and now holds `digest`.
    #[must_use]
    pub fn converged(&self, digest: &str) -> bool {
        self.failed.is_empty() && self.digests.values().all(|d| d == digest)
    }
}

pub struct SyncCoordinator {
    nodes: DashMap<String, SyncNode>,
    store: Arc<StateStore>,
    transport: Arc<dyn ReplicaTransport>,
    circuits: NodeCircuits,
    config: SharedConfig,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<StateStore>,
        transport: Arc<dyn ReplicaTransport>,
        config: SharedConfig,
    ) -> Self {
        let circuit_config = {
            let cfg = config.read();
            CircuitConfig {
                failure_threshold: cfg.circuit_failure_threshold,
                recovery_timeout: Duration::from_millis(cfg.circuit_recovery_ms),
                ..CircuitConfig::default()
            }
        };
        Self {
            nodes: DashMap::new(),
            store,
            transport,
            circuits: NodeCircuits::new(circuit_config),
            config,
        }
    }

    /// Add a replica to the roster. Returns false if it was already known.
    #[instrument(skip(self))]
    pub fn register_node(&self, node_id: &str) -> bool {
        if self.nodes.contains_key(node_id) {
            return false;
        }
        self.nodes
            .insert(node_id.to_string(), SyncNode::new(node_id, epoch_millis()));
        metrics::set_node_count(self.nodes.len());
        info!(node_id, "Replica registered");
        true
    }

    pub fn remove_node(&self, node_id: &str) -> bool {
        let removed = self.nodes.remove(node_id).is_some();
        if removed {
            self.circuits.remove(node_id);
            metrics::set_node_count(self.nodes.len());
        }
        removed
    }

    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<SyncNode> {
        self.nodes.get(node_id).map(|n| n.value().clone())
    }

    /// Roster snapshot, ordered by node id.
    #[must_use]
    pub fn nodes(&self) -> Vec<SyncNode> {
        let mut nodes: Vec<SyncNode> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes whose circuit breaker is open.
    #[must_use]
    pub fn open_circuits(&self) -> Vec<String> {
        self.circuits.open_nodes()
    }

    fn reachable_ids(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.reachable)
            .map(|n| n.key().clone())
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Heartbeats
    // ═══════════════════════════════════════════════════════════════════

    /// Ping every node once and update the roster.
    ///
    /// `now_ms` is the wall-clock reference for unreachable/evict windows.
    #[instrument(skip(self))]
    pub async fn heartbeat_round(&self, now_ms: i64) -> HeartbeatReport {
        let (timeout, unreachable_after, evict_after) = {
            let cfg = self.config.read();
            (
                cfg.network_timeout(),
                cfg.unreachable_after_ms as i64,
                cfg.evict_after_ms as i64,
            )
        };

        let mut set = JoinSet::new();
        for node_id in self.nodes.iter().map(|n| n.key().clone()) {
            let transport = self.transport.clone();
            set.spawn(async move {
                let started = tokio::time::Instant::now();
                let result = within(&node_id, timeout, transport.heartbeat(&node_id)).await;
                (node_id, started.elapsed(), result)
            });
        }

        let mut report = HeartbeatReport::default();
        while let Some(joined) = set.join_next().await {
            let (node_id, elapsed, result) = match joined {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "Heartbeat task failed");
                    continue;
                }
            };
            let Some(mut node) = self.nodes.get_mut(&node_id) else {
                continue;
            };
            match result {
                Ok(ack) => {
                    let latency_ms = elapsed.as_millis() as u64;
                    node.latency_ms = latency_ms;
                    node.drift_ms = ack.clock_ms - (epoch_millis() - latency_ms as i64 / 2);
                    node.last_ack_at = Some(now_ms);
                    node.missed_heartbeats = 0;
                    if !node.reachable {
                        node.reachable = true;
                        report.recovered.push(node_id.clone());
                        info!(node_id = %node_id, "Replica reachable again");
                    }
                    // Authoritative pushes are only cleared by their own ack
                    node.unacked.retain(|c, pending| {
                        pending.authoritative
                            || ack
                                .replicas
                                .get(c)
                                .map_or(true, |view| view.version < pending.version)
                    });
                    node.replicas = ack.replicas;
                    node.refresh_drift(&self.store);
                    metrics::record_heartbeat(&node_id, "ack");
                    metrics::set_node_latency(&node_id, latency_ms);
                    metrics::set_node_drift(&node_id, node.drift_percent);
                    report.acked.push(node_id);
                }
                Err(e) => {
                    node.missed_heartbeats += 1;
                    debug!(node_id = %node_id, missed = node.missed_heartbeats, error = %e, "Heartbeat missed");
                    metrics::record_heartbeat(&node_id, "missed");
                    report.failed.push(node_id);
                }
            }
        }

        for mut node in self.nodes.iter_mut() {
            let silent = node.silent_for(now_ms);
            if silent >= evict_after {
                report.evicted.push(node.node_id.clone());
            } else if silent >= unreachable_after && node.reachable {
                node.reachable = false;
                warn!(node_id = %node.node_id, silent_ms = silent, "Replica unreachable");
                report.became_unreachable.push(node.node_id.clone());
            }
        }
        for node_id in &report.evicted {
            if self.remove_node(node_id) {
                warn!(node_id = %node_id, "Replica evicted after missing heartbeats");
                metrics::record_node_evicted(node_id);
            }
        }

        report.acked.sort();
        report.failed.sort();
        report.evicted.sort();
        metrics::set_sync_status(self.status_at(now_ms) as u8);
        report
    }

    /// Aggregate status at `now_ms`.
    #[must_use]
    pub fn status_at(&self, now_ms: i64) -> SyncStatus {
        let cfg = self.config.read();
        let mut degraded = false;
        for node in self.nodes.iter() {
            if node.silent_for(now_ms) >= cfg.evict_after_ms as i64 {
                return SyncStatus::OutOfSync;
            }
            if node.reachable && node.drift_percent > cfg.out_of_sync_drift_percent {
                return SyncStatus::OutOfSync;
            }
            if !node.reachable
                || node.drift_percent >= cfg.healthy_drift_percent
                || node.latency_ms >= cfg.healthy_latency_ms
            {
                degraded = true;
            }
        }
        if degraded {
            SyncStatus::Degraded
        } else {
            SyncStatus::Healthy
        }
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        self.status_at(epoch_millis())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Propagation
    // ═══════════════════════════════════════════════════════════════════

    /// Push a change to every reachable node.
    ///
    /// Unreachable nodes are recorded as unacked and caught up by
    /// [`Self::resend_pending`] once they answer heartbeats again.
    #[instrument(skip(self, update), fields(component = %update.component, version = update.version))]
    pub async fn replicate(&self, update: ReplicaUpdate) -> ReplicationReport {
        let mut report = ReplicationReport {
            component: update.component,
            version: update.version,
            acked: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            digests: BTreeMap::new(),
        };

        let mut targets = Vec::new();
        for mut node in self.nodes.iter_mut() {
            if node.reachable {
                targets.push((node.node_id.clone(), update.clone()));
            } else {
                node.unacked.insert(
                    update.component,
                    PendingPush {
                        version: update.version,
                        authoritative: update.authoritative,
                    },
                );
                report.skipped.push(node.node_id.clone());
            }
        }

        for (node_id, _, result) in self.push_many(targets).await {
            match result {
                Ok(ack) => {
                    report.digests.insert(node_id.clone(), ack.view.digest.clone());
                    report.acked.push(node_id);
                }
                Err(_) => report.failed.push(node_id),
            }
        }
        report.acked.sort();
        report.failed.sort();
        report.skipped.sort();
        report
    }

    /// Push the current canonical value of `component` as authoritative.
    pub async fn propagate_authoritative(&self, component: StateComponent) -> ReplicationReport {
        let state = self.store.get_state(component);
        self.replicate(ReplicaUpdate::from_state(&state, true)).await
    }

    /// Resend unacked pushes and catch up lagging replicas.
    ///
    /// Returns the number of pushes that were acked.
    pub async fn resend_pending(&self) -> usize {
        let mut targets = Vec::new();
        for node in self.nodes.iter().filter(|n| n.reachable) {
            for component in StateComponent::ALL {
                let canonical = self.store.get_state(component);
                let pending = node.unacked.get(&component).copied();
                let lagging = node
                    .replicas
                    .get(&component)
                    .is_some_and(|v| v.version < canonical.version);
                if pending.is_some() || lagging {
                    let authoritative = pending.is_some_and(|p| p.authoritative);
                    targets.push((
                        node.node_id.clone(),
                        ReplicaUpdate::from_state(&canonical, authoritative),
                    ));
                }
            }
        }
        if targets.is_empty() {
            return 0;
        }
        debug!(count = targets.len(), "Resending unacked changes");
        self.push_many(targets)
            .await
            .iter()
            .filter(|(_, _, r)| r.is_ok())
            .count()
    }

    /// Full copy of a component from one replica.
    pub async fn fetch_state(
        &self,
        node_id: &str,
        component: StateComponent,
    ) -> Result<ReplicaState> {
        if !self.nodes.contains_key(node_id) {
            return Err(EngineError::not_found("node", node_id));
        }
        let timeout = self.config.read().network_timeout();
        let circuit = self.circuits.for_node(node_id);
        let transport = self.transport.clone();
        let id = node_id.to_string();
        circuit
            .call(move || async move {
                within(&id, timeout, transport.fetch_state(&id, component)).await
            })
            .await
            .map_err(|e| circuit_error(node_id, e))
    }

    /// Copies of `component` from every reachable node that answers.
    pub async fn fetch_all(&self, component: StateComponent) -> Vec<ReplicaState> {
        let mut copies = Vec::new();
        for node_id in self.reachable_ids() {
            match self.fetch_state(&node_id, component).await {
                Ok(state) => copies.push(state),
                Err(e) => debug!(node_id = %node_id, %component, error = %e, "Fetch failed"),
            }
        }
        copies
    }

    async fn push_many(
        &self,
        targets: Vec<(String, ReplicaUpdate)>,
    ) -> Vec<(String, ReplicaUpdate, Result<PushAck>)> {
        let timeout = self.config.read().network_timeout();
        let mut set = JoinSet::new();
        for (node_id, update) in targets {
            let circuit = self.circuits.for_node(&node_id);
            let transport = self.transport.clone();
            set.spawn(async move {
                let push = update.clone();
                let id = node_id.clone();
                let result = circuit
                    .call(move || async move {
                        within(&id, timeout, transport.push(&id, &push)).await
                    })
                    .await
                    .map_err(|e| circuit_error(&node_id, e));
                (node_id, update, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (node_id, update, result) = match joined {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "Push task failed");
                    continue;
                }
            };
            self.record_push(&node_id, &update, &result);
            results.push((node_id, update, result));
        }
        results
    }

    fn record_push(&self, node_id: &str, update: &ReplicaUpdate, result: &Result<PushAck>) {
        let Some(mut node) = self.nodes.get_mut(node_id) else {
            return;
        };
        match result {
            Ok(ack) => {
                node.replicas.insert(update.component, ack.view.clone());
                let confirmed = ack.view.version >= update.version
                    && (!update.authoritative || ack.view.digest == update.digest);
                if confirmed {
                    node.unacked.remove(&update.component);
                }
                node.refresh_drift(&self.store);
                metrics::record_replication_push(node_id, "ack");
            }
            Err(e) => {
                node.unacked.insert(
                    update.component,
                    PendingPush {
                        version: update.version,
                        authoritative: update.authoritative,
                    },
                );
                debug!(node_id, component = %update.component, error = %e, "Push failed, will resend");
                metrics::record_replication_push(node_id, "failed");
            }
        }
    }
}

async fn within<T>(
    node_id: &str,
    timeout: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::NodeUnreachable {
            node_id: node_id.to_string(),
            reason: format!("no reply within {}ms", timeout.as_millis()),
        }),
    }
}

fn circuit_error(node_id: &str, err: CircuitError<EngineError>) -> EngineError {
    match err {
        CircuitError::Rejected => EngineError::NodeUnreachable {
            node_id: node_id.to_string(),
            reason: "circuit open".into(),
        },
        CircuitError::Inner(e) => e,
    }
}
