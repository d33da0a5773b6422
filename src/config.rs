// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the world sync engine.
//!
//! # Example
//!
//! ```
//! use world_sync::{StateComponent, WorldSyncConfig};
//!
//! // Minimal config (in-memory stores, default thresholds)
//! let config = WorldSyncConfig::default();
//! assert_eq!(config.drift_threshold(StateComponent::World), 5.0);
//! assert_eq!(config.drift_threshold(StateComponent::Economy), 10.0);
//!
//! // Durable config
//! let config = WorldSyncConfig {
//!     storage_path: Some("/var/lib/world-sync/engine.db".into()),
//!     heartbeat_interval_ms: 500,
//!     ..Default::default()
//! };
//! assert!(config.storage_path.is_some());
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Deserialize;

use crate::component::StateComponent;
use crate::conflict::{MergePolicy, ResolutionStrategy};
use crate::resilience::retry::RetryConfig;

/// Live configuration shared by the engine's components. The config watcher
/// swaps the contents when an update arrives.
pub type SharedConfig = Arc<RwLock<WorldSyncConfig>>;

/// Configuration for the world sync engine.
///
/// Every field has a default. Set `storage_path` for anything that must
/// survive a restart.
#[derive(Debug, Clone, Deserialize)]
pub struct WorldSyncConfig {
    /// SQLite file for the mutation log and snapshot store (None = in-memory)
    #[serde(default)]
    pub storage_path: Option<String>,

    // ── Mutation queue ──────────────────────────────────────────────────
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    #[serde(default = "default_dequeue_batch_size")]
    pub dequeue_batch_size: usize,
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    /// First retry delay after a version conflict; doubles per retry
    #[serde(default = "default_mutation_retry_base_ms")]
    pub mutation_retry_base_ms: u64,
    #[serde(default = "default_mutation_max_retries")]
    pub mutation_max_retries: u32,
    /// DELTA_PATCH ops wider than this take a snapshot first
    #[serde(default = "default_large_patch_threshold")]
    pub large_patch_threshold: usize,

    // ── Store ───────────────────────────────────────────────────────────
    /// Smoothing factor of the per-component success EWMA
    #[serde(default = "default_health_alpha")]
    pub health_alpha: f64,

    // ── Conflict detection / resolution ─────────────────────────────────
    #[serde(default = "default_detector_interval_ms")]
    pub detector_interval_ms: u64,
    #[serde(default = "default_drift_thresholds")]
    pub drift_thresholds: BTreeMap<StateComponent, f64>,
    #[serde(default = "default_drift_threshold")]
    pub default_drift_threshold: f64,
    #[serde(default = "default_resolution_strategies")]
    pub resolution_strategies: BTreeMap<StateComponent, Vec<ResolutionStrategy>>,
    #[serde(default = "default_merge_policies")]
    pub merge_policies: BTreeMap<StateComponent, MergePolicy>,
    /// Committed ops replayed by deterministic replay
    #[serde(default = "default_replay_window")]
    pub replay_window: usize,
    #[serde(default = "default_max_resolution_attempts")]
    pub max_resolution_attempts: u32,

    // ── Replication ─────────────────────────────────────────────────────
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Timeout for every network round-trip (heartbeat, push, fetch)
    #[serde(default = "default_network_timeout_ms")]
    pub network_timeout_ms: u64,
    #[serde(default = "default_unreachable_after_ms")]
    pub unreachable_after_ms: u64,
    #[serde(default = "default_evict_after_ms")]
    pub evict_after_ms: u64,
    #[serde(default = "default_healthy_drift_percent")]
    pub healthy_drift_percent: f64,
    #[serde(default = "default_healthy_latency_ms")]
    pub healthy_latency_ms: u64,
    #[serde(default = "default_out_of_sync_drift_percent")]
    pub out_of_sync_drift_percent: f64,
    /// Consecutive push failures before a node's circuit opens
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_recovery_ms")]
    pub circuit_recovery_ms: u64,

    // ── Snapshots ───────────────────────────────────────────────────────
    /// Periodic snapshot interval in seconds (0 = disabled)
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    #[serde(default = "default_snapshot_pause_budget_ms")]
    pub snapshot_pause_budget_ms: u64,
    #[serde(default = "default_snapshot_retention_secs")]
    pub snapshot_retention_secs: u64,
    #[serde(default = "default_rollback_enabled")]
    pub rollback_enabled: bool,

    // ── Zones ───────────────────────────────────────────────────────────
    /// Ticks over SLA in a row before an automatic transfer
    #[serde(default = "default_overload_tick_threshold")]
    pub overload_tick_threshold: u32,
    /// Fraction of the tick budget (1000 / tickRateHz) allowed per tick
    #[serde(default = "default_tick_sla_fraction")]
    pub tick_sla_fraction: f64,
    #[serde(default = "default_auto_transfer_cooldown_secs")]
    pub auto_transfer_cooldown_secs: u64,
    #[serde(default = "default_transfer_batch_size")]
    pub transfer_batch_size: u32,
    #[serde(default = "default_transfer_interval_ms")]
    pub transfer_interval_ms: u64,

    // ── Alerts ──────────────────────────────────────────────────────────
    #[serde(default = "default_alert_capacity")]
    pub alert_capacity: usize,
}

fn default_max_queue_depth() -> usize { 10_000 }
fn default_dequeue_batch_size() -> usize { 64 }
fn default_drain_interval_ms() -> u64 { 50 }
fn default_mutation_retry_base_ms() -> u64 { 100 }
fn default_mutation_max_retries() -> u32 { 5 }
fn default_large_patch_threshold() -> usize { 64 }
fn default_health_alpha() -> f64 { 0.1 }
fn default_detector_interval_ms() -> u64 { 2_000 }
fn default_drift_threshold() -> f64 { 5.0 }
fn default_replay_window() -> usize { 16 }
fn default_max_resolution_attempts() -> u32 { 3 }
fn default_heartbeat_interval_ms() -> u64 { 1_000 }
fn default_network_timeout_ms() -> u64 { 2_000 }
fn default_unreachable_after_ms() -> u64 { 5_000 }
fn default_evict_after_ms() -> u64 { 30_000 }
fn default_healthy_drift_percent() -> f64 { 2.0 }
fn default_healthy_latency_ms() -> u64 { 100 }
fn default_out_of_sync_drift_percent() -> f64 { 10.0 }
fn default_circuit_failure_threshold() -> u32 { 5 }
fn default_circuit_recovery_ms() -> u64 { 10_000 }
fn default_snapshot_interval_secs() -> u64 { 3_600 } // hourly
fn default_snapshot_pause_budget_ms() -> u64 { 50 }
fn default_snapshot_retention_secs() -> u64 { 7 * 24 * 3_600 } // 7 days
fn default_rollback_enabled() -> bool { true }
fn default_overload_tick_threshold() -> u32 { 10 }
fn default_tick_sla_fraction() -> f64 { 0.9 }
fn default_auto_transfer_cooldown_secs() -> u64 { 300 }
fn default_transfer_batch_size() -> u32 { 25 }
fn default_transfer_interval_ms() -> u64 { 500 }
fn default_alert_capacity() -> usize { 256 }

fn default_drift_thresholds() -> BTreeMap<StateComponent, f64> {
    BTreeMap::from([
        (StateComponent::World, 5.0),
        (StateComponent::Factions, 5.0),
        // Pricing data is eventually consistent
        (StateComponent::Economy, 10.0),
    ])
}

fn default_resolution_strategies() -> BTreeMap<StateComponent, Vec<ResolutionStrategy>> {
    use ResolutionStrategy::*;
    BTreeMap::from([
        (StateComponent::World, vec![DeterministicReplay, PriorityMerge]),
        (StateComponent::Combat, vec![DeterministicReplay, PriorityMerge]),
        (StateComponent::Economy, vec![PriorityMerge, DeterministicReplay]),
        (StateComponent::Factions, vec![DeterministicReplay, PriorityMerge]),
        (StateComponent::Player, vec![DeterministicReplay, ManualEscalation]),
        (StateComponent::Quests, vec![DeterministicReplay, ManualEscalation]),
    ])
}

fn default_merge_policies() -> BTreeMap<StateComponent, MergePolicy> {
    BTreeMap::from([
        (StateComponent::World, MergePolicy::LastWriterWins),
        (StateComponent::Combat, MergePolicy::LastWriterWins),
        (StateComponent::Economy, MergePolicy::LastWriterWins),
        (StateComponent::Factions, MergePolicy::Union),
    ])
}

impl Default for WorldSyncConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            max_queue_depth: default_max_queue_depth(),
            dequeue_batch_size: default_dequeue_batch_size(),
            drain_interval_ms: default_drain_interval_ms(),
            mutation_retry_base_ms: default_mutation_retry_base_ms(),
            mutation_max_retries: default_mutation_max_retries(),
            large_patch_threshold: default_large_patch_threshold(),
            health_alpha: default_health_alpha(),
            detector_interval_ms: default_detector_interval_ms(),
            drift_thresholds: default_drift_thresholds(),
            default_drift_threshold: default_drift_threshold(),
            resolution_strategies: default_resolution_strategies(),
            merge_policies: default_merge_policies(),
            replay_window: default_replay_window(),
            max_resolution_attempts: default_max_resolution_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            network_timeout_ms: default_network_timeout_ms(),
            unreachable_after_ms: default_unreachable_after_ms(),
            evict_after_ms: default_evict_after_ms(),
            healthy_drift_percent: default_healthy_drift_percent(),
            healthy_latency_ms: default_healthy_latency_ms(),
            out_of_sync_drift_percent: default_out_of_sync_drift_percent(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_recovery_ms: default_circuit_recovery_ms(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            snapshot_pause_budget_ms: default_snapshot_pause_budget_ms(),
            snapshot_retention_secs: default_snapshot_retention_secs(),
            rollback_enabled: default_rollback_enabled(),
            overload_tick_threshold: default_overload_tick_threshold(),
            tick_sla_fraction: default_tick_sla_fraction(),
            auto_transfer_cooldown_secs: default_auto_transfer_cooldown_secs(),
            transfer_batch_size: default_transfer_batch_size(),
            transfer_interval_ms: default_transfer_interval_ms(),
            alert_capacity: default_alert_capacity(),
        }
    }
}

impl WorldSyncConfig {
    /// Drift percentage above which a component raises a conflict.
    #[must_use]
    pub fn drift_threshold(&self, component: StateComponent) -> f64 {
        self.drift_thresholds
            .get(&component)
            .copied()
            .unwrap_or(self.default_drift_threshold)
    }

    /// Resolution strategies for a component, in the order they are tried.
    #[must_use]
    pub fn strategies_for(&self, component: StateComponent) -> Vec<ResolutionStrategy> {
        self.resolution_strategies
            .get(&component)
            .cloned()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| vec![ResolutionStrategy::DeterministicReplay])
    }

    #[must_use]
    pub fn merge_policy(&self, component: StateComponent) -> Option<MergePolicy> {
        self.merge_policies.get(&component).copied()
    }

    /// Requeue schedule for ops that lost a CAS race.
    #[must_use]
    pub fn mutation_retry(&self) -> RetryConfig {
        let base = Duration::from_millis(self.mutation_retry_base_ms);
        let exp = self.mutation_max_retries.saturating_sub(1).min(16);
        RetryConfig {
            initial_delay: base,
            max_delay: base.saturating_mul(1u32 << exp),
            factor: 2.0,
            max_retries: Some(self.mutation_max_retries as usize),
        }
    }

    #[must_use]
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    #[must_use]
    pub fn snapshot_pause_budget(&self) -> Duration {
        Duration::from_millis(self.snapshot_pause_budget_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_serde_defaults() {
        let from_json: WorldSyncConfig = serde_json::from_str("{}").unwrap();
        let default = WorldSyncConfig::default();

        assert_eq!(from_json.max_queue_depth, default.max_queue_depth);
        assert_eq!(from_json.heartbeat_interval_ms, 1_000);
        assert_eq!(from_json.snapshot_interval_secs, 3_600);
        assert_eq!(from_json.drift_thresholds, default.drift_thresholds);
        assert!(from_json.storage_path.is_none());
    }

    #[test]
    fn test_drift_thresholds() {
        let config = WorldSyncConfig::default();
        assert_eq!(config.drift_threshold(StateComponent::World), 5.0);
        assert_eq!(config.drift_threshold(StateComponent::Factions), 5.0);
        assert_eq!(config.drift_threshold(StateComponent::Economy), 10.0);
        assert_eq!(config.drift_threshold(StateComponent::Quests), 5.0);
    }

    #[test]
    fn test_component_keyed_tables_deserialize() {
        let json = r#"{
            "drift_thresholds": {"ECONOMY": 15.0},
            "resolution_strategies": {"WORLD": ["MANUAL_ESCALATION"]},
            "merge_policies": {"PLAYER": "UNION"}
        }"#;
        let config: WorldSyncConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.drift_threshold(StateComponent::Economy), 15.0);
        assert_eq!(config.drift_threshold(StateComponent::World), 5.0);
        assert_eq!(
            config.strategies_for(StateComponent::World),
            vec![ResolutionStrategy::ManualEscalation]
        );
        assert_eq!(config.merge_policy(StateComponent::Player), Some(MergePolicy::Union));
        assert_eq!(config.merge_policy(StateComponent::World), None);
    }

    #[test]
    fn test_mutation_retry_matches_preset() {
        let config = WorldSyncConfig::default();
        let retry = config.mutation_retry();
        let preset = RetryConfig::mutation();

        assert_eq!(retry.max_retries, preset.max_retries);
        for n in 1..=5 {
            assert_eq!(retry.delay_for(n), preset.delay_for(n));
        }
        assert_eq!(retry.delay_for(5), Duration::from_millis(1_600));
    }
}
