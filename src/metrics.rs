// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the world sync engine.
//!
//! Uses the `metrics` crate for backend-agnostic collection. The host process
//! picks the exporter (Prometheus, OTEL, ...).
//!
//! # Metric Naming Convention
//! - `world_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `component`: WORLD, FACTIONS, ECONOMY, PLAYER, QUESTS, COMBAT
//! - `node`: replica node id
//! - `instance`: realtime instance id
//! - `outcome`: success, conflict, failure, rejected, ...

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::component::StateComponent;

// ═══════════════════════════════════════════════════════════════════════════
// STATE STORE
// ═══════════════════════════════════════════════════════════════════════════

/// Record a mutation apply attempt
pub fn record_mutation(component: StateComponent, outcome: &'static str) {
    counter!(
        "world_sync_mutations_total",
        "component" => component.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_latency(area: &'static str, operation: &'static str, duration: Duration) {
    histogram!(
        "world_sync_operation_seconds",
        "area" => area,
        "operation" => operation
    )
    .record(duration.as_secs_f64());
}

pub fn set_component_version(component: StateComponent, version: u64) {
    gauge!("world_sync_component_version", "component" => component.as_str()).set(version as f64);
}

pub fn set_component_health(component: StateComponent, health: f64) {
    gauge!("world_sync_component_health", "component" => component.as_str()).set(health);
}

pub fn set_component_drift(component: StateComponent, drift_percent: f64) {
    gauge!("world_sync_component_drift_percent", "component" => component.as_str())
        .set(drift_percent);
}

// ═══════════════════════════════════════════════════════════════════════════
// MUTATION QUEUE
// ═══════════════════════════════════════════════════════════════════════════

pub fn set_queue_depth(depth: usize) {
    gauge!("world_sync_queue_depth").set(depth as f64);
}

pub fn set_backlog_minutes(minutes: f64) {
    gauge!("world_sync_queue_backlog_minutes").set(minutes);
}

/// 0 = Normal ... 5 = Shutdown
pub fn set_backpressure_level(level: u8) {
    gauge!("world_sync_backpressure_level").set(level as f64);
}

pub fn record_mutation_retry(component: StateComponent) {
    counter!("world_sync_mutation_retries_total", "component" => component.as_str()).increment(1);
}

pub fn record_mutation_escalated(component: StateComponent) {
    counter!("world_sync_mutation_escalations_total", "component" => component.as_str())
        .increment(1);
}

pub fn record_log_error(operation: &'static str) {
    counter!("world_sync_log_errors_total", "operation" => operation).increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFLICTS
// ═══════════════════════════════════════════════════════════════════════════

/// `event`: raised, resolved, escalated, stale, manual
pub fn record_conflict(component: StateComponent, event: &'static str) {
    counter!(
        "world_sync_conflicts_total",
        "component" => component.as_str(),
        "event" => event
    )
    .increment(1);
}

pub fn record_resolution_attempt(strategy: &'static str, outcome: &'static str) {
    counter!(
        "world_sync_resolution_attempts_total",
        "strategy" => strategy,
        "outcome" => outcome
    )
    .increment(1);
}

pub fn set_open_conflicts(count: usize) {
    gauge!("world_sync_conflicts_open").set(count as f64);
}

/// Escalated records are operational debt; alert on this staying above zero.
pub fn set_escalated_conflicts(count: usize) {
    gauge!("world_sync_conflicts_escalated").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// REPLICATION
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_replication_push(node: &str, outcome: &'static str) {
    counter!(
        "world_sync_replication_pushes_total",
        "node" => node.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_heartbeat(node: &str, outcome: &'static str) {
    counter!(
        "world_sync_heartbeats_total",
        "node" => node.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn set_node_latency(node: &str, latency_ms: u64) {
    gauge!("world_sync_node_latency_ms", "node" => node.to_string()).set(latency_ms as f64);
}

pub fn set_node_drift(node: &str, drift_percent: f64) {
    gauge!("world_sync_node_drift_percent", "node" => node.to_string()).set(drift_percent);
}

pub fn record_node_evicted(node: &str) {
    counter!("world_sync_nodes_evicted_total", "node" => node.to_string()).increment(1);
}

pub fn set_node_count(count: usize) {
    gauge!("world_sync_nodes").set(count as f64);
}

/// 0 = HEALTHY, 1 = DEGRADED, 2 = OUT_OF_SYNC
pub fn set_sync_status(status: u8) {
    gauge!("world_sync_status").set(status as f64);
}

pub fn record_circuit_call(circuit: &str, outcome: &'static str) {
    counter!(
        "world_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn set_circuit_state(circuit: &str, state: u8) {
    gauge!("world_sync_circuit_breaker_state", "circuit" => circuit.to_string())
        .set(state as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// SNAPSHOTS
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_snapshot(outcome: &'static str) {
    counter!("world_sync_snapshots_total", "outcome" => outcome).increment(1);
}

/// Time the drainer was paused for a snapshot capture
pub fn record_snapshot_pause(duration: Duration) {
    histogram!("world_sync_snapshot_pause_seconds").record(duration.as_secs_f64());
}

pub fn record_snapshot_bytes(bytes: u64) {
    histogram!("world_sync_snapshot_bytes").record(bytes as f64);
}

pub fn record_rollback(outcome: &'static str) {
    counter!("world_sync_rollbacks_total", "outcome" => outcome).increment(1);
}

pub fn record_snapshots_pruned(count: usize) {
    counter!("world_sync_snapshots_pruned_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// ZONES
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_tick(instance: &str, tick_ms: f64, over_sla: bool) {
    histogram!("world_sync_instance_tick_ms", "instance" => instance.to_string()).record(tick_ms);
    if over_sla {
        counter!("world_sync_instance_ticks_over_sla_total", "instance" => instance.to_string())
            .increment(1);
    }
}

/// `kind`: manual, auto, evacuation
pub fn record_plan(kind: &'static str) {
    counter!("world_sync_plans_total", "kind" => kind).increment(1);
}

pub fn record_plan_execution(kind: &'static str, outcome: &'static str) {
    counter!(
        "world_sync_plan_executions_total",
        "kind" => kind,
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_players_moved(kind: &'static str, count: u32) {
    counter!("world_sync_players_moved_total", "kind" => kind).increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// ALERTS / LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

pub fn record_alert(severity: &'static str, source: &'static str) {
    counter!(
        "world_sync_alerts_total",
        "severity" => severity,
        "source" => source
    )
    .increment(1);
}

pub fn set_engine_phase(phase: &'static str) {
    counter!("world_sync_phase_transitions_total", "phase" => phase).increment(1);
}

pub fn record_startup_phase(phase: &'static str, duration: Duration) {
    histogram!("world_sync_startup_seconds", "phase" => phase).record(duration.as_secs_f64());
}

/// Records latency into `world_sync_operation_seconds` on drop.
pub struct LatencyTimer {
    area: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(area: &'static str, operation: &'static str) -> Self {
        Self {
            area,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.area, self.operation, self.start.elapsed());
    }
}
