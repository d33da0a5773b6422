// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Conflict records and their registry.
//!
//! A record moves `PENDING → RESOLVING → RESOLVED` and never backwards.
//! Records are raised by the detector (replica drift) or by the queue when an
//! op runs out of retries, and closed by the resolver. A rollback marks the
//! open records of affected components stale: they stop counting as open but
//! stay listed for audit.

pub mod detector;
pub mod resolver;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::component::{MutationOp, StateComponent};
use crate::error::{EngineError, Result};
use crate::metrics;

pub use detector::{ConflictDetector, DetectionReport};
pub use resolver::{ConflictResolver, ResolutionOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStatus {
    Pending,
    Resolving,
    Resolved,
}

impl ConflictStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Resolving => "RESOLVING",
            Self::Resolved => "RESOLVED",
        }
    }

    fn can_move_to(self, next: ConflictStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Resolving) | (Self::Resolving, Self::Resolved)
        )
    }
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionStrategy {
    /// Re-apply the last committed ops from the durable log
    DeterministicReplay,
    /// Merge replica copies with the component's merge policy
    PriorityMerge,
    /// Hand to an operator
    ManualEscalation,
}

impl ResolutionStrategy {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeterministicReplay => "DETERMINISTIC_REPLAY",
            Self::PriorityMerge => "PRIORITY_MERGE",
            Self::ManualEscalation => "MANUAL_ESCALATION",
        }
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergePolicy {
    /// Newest `updated_at` across canonical and replica copies wins
    LastWriterWins,
    /// Keys from every copy; canonical wins on collision
    Union,
}

/// Why a record was raised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictOrigin {
    Drift {
        observed_percent: f64,
        node_ids: Vec<String>,
    },
    RetryExhausted {
        op_id: String,
        retries: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictRecord {
    pub conflict_id: String,
    pub component: StateComponent,
    pub detected_at: i64,
    pub status: ConflictStatus,
    /// Human-readable description of the chosen resolution
    pub strategy: String,
    pub resolved_version: Option<u64>,
    pub origin: ConflictOrigin,
    /// 1 (low) to 10 (urgent)
    pub priority: u8,
    pub attempts: u32,
    pub escalated: bool,
    /// Voided by a rollback
    pub stale: bool,
    pub resolved_at: Option<i64>,
    pub last_error: Option<String>,
    /// The op that ran out of retries, re-applied on resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<MutationOp>,
    /// Version at which `intent` was committed; it is never applied twice
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_applied_version: Option<u64>,
}

impl ConflictRecord {
    fn new(component: StateComponent, origin: ConflictOrigin, detected_at: i64) -> Self {
        Self {
            conflict_id: uuid::Uuid::new_v4().to_string(),
            component,
            detected_at,
            status: ConflictStatus::Pending,
            strategy: "unassigned".into(),
            resolved_version: None,
            priority: priority_for(component, &origin),
            origin,
            attempts: 0,
            escalated: false,
            stale: false,
            resolved_at: None,
            last_error: None,
            intent: None,
            intent_applied_version: None,
        }
    }

    /// Counts against "one open conflict per component".
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status != ConflictStatus::Resolved && !self.stale
    }
}

fn priority_for(component: StateComponent, origin: &ConflictOrigin) -> u8 {
    let mut priority = 5u8;
    if matches!(origin, ConflictOrigin::RetryExhausted { .. }) {
        priority += 2;
    }
    priority += match component {
        StateComponent::World | StateComponent::Combat => 2,
        StateComponent::Economy | StateComponent::Player => 1,
        _ => 0,
    };
    priority.min(10)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConflictCounts {
    pub pending: usize,
    pub resolving: usize,
    pub resolved: usize,
    pub escalated: usize,
    pub stale: usize,
}

impl ConflictCounts {
    #[must_use]
    pub fn open(&self) -> usize {
        self.pending + self.resolving
    }
}

#[derive(Default)]
pub struct ConflictRegistry {
    records: DashMap<String, ConflictRecord>,
}

impl ConflictRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise a drift conflict unless the component already has an open drift
    /// record. Open exhausted-op records do not suppress it.
    pub fn open_drift(
        &self,
        component: StateComponent,
        observed_percent: f64,
        node_ids: Vec<String>,
        detected_at: i64,
    ) -> Option<ConflictRecord> {
        if self.has_open_drift(component) {
            return None;
        }
        let record = ConflictRecord::new(
            component,
            ConflictOrigin::Drift {
                observed_percent,
                node_ids,
            },
            detected_at,
        );
        info!(
            conflict_id = %record.conflict_id,
            %component,
            observed_percent,
            "Drift conflict raised"
        );
        self.insert(record.clone());
        metrics::record_conflict(component, "drift");
        Some(record)
    }

    /// Raise a conflict for an op that exhausted its retries.
    ///
    /// One record per op id; a second escalation of the same op returns the
    /// existing record.
    pub fn open_exhausted(&self, op: &MutationOp, detected_at: i64) -> ConflictRecord {
        if let Some(existing) = self.records.iter().find(|r| {
            matches!(&r.origin, ConflictOrigin::RetryExhausted { op_id, .. } if *op_id == op.op_id)
        }) {
            return existing.value().clone();
        }
        let mut record = ConflictRecord::new(
            op.component,
            ConflictOrigin::RetryExhausted {
                op_id: op.op_id.clone(),
                retries: op.retries,
            },
            detected_at,
        );
        record.intent = Some(op.clone());
        warn!(
            conflict_id = %record.conflict_id,
            component = %op.component,
            op_id = %op.op_id,
            retries = op.retries,
            "Mutation out of retries, raised as conflict"
        );
        self.insert(record.clone());
        metrics::record_conflict(op.component, "retry_exhausted");
        record
    }

    fn insert(&self, record: ConflictRecord) {
        self.records.insert(record.conflict_id.clone(), record);
        self.publish_gauges();
    }

    #[must_use]
    pub fn get(&self, conflict_id: &str) -> Option<ConflictRecord> {
        self.records.get(conflict_id).map(|r| r.value().clone())
    }

    /// Records, optionally filtered by status, oldest first.
    #[must_use]
    pub fn list(&self, status: Option<ConflictStatus>) -> Vec<ConflictRecord> {
        let mut records: Vec<ConflictRecord> = self
            .records
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| {
            a.detected_at
                .cmp(&b.detected_at)
                .then_with(|| a.conflict_id.cmp(&b.conflict_id))
        });
        records
    }

    #[must_use]
    pub fn has_open(&self, component: StateComponent) -> bool {
        self.records
            .iter()
            .any(|r| r.component == component && r.is_open())
    }

    #[must_use]
    pub fn has_open_drift(&self, component: StateComponent) -> bool {
        self.records.iter().any(|r| {
            r.component == component && r.is_open() && matches!(r.origin, ConflictOrigin::Drift { .. })
        })
    }

    /// Open, non-escalated records in resolution order: priority, then age.
    #[must_use]
    pub fn actionable(&self) -> Vec<ConflictRecord> {
        let mut records: Vec<ConflictRecord> = self
            .records
            .iter()
            .filter(|r| r.is_open() && !r.escalated)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.detected_at.cmp(&b.detected_at))
        });
        records
    }

    /// Move a record to `next`, enforcing the forward-only state machine.
    pub fn transition(&self, conflict_id: &str, next: ConflictStatus) -> Result<ConflictRecord> {
        let mut record = self
            .records
            .get_mut(conflict_id)
            .ok_or_else(|| EngineError::not_found("conflict", conflict_id))?;
        if !record.status.can_move_to(next) {
            return Err(EngineError::InvalidTransition {
                entity: "conflict",
                id: conflict_id.to_string(),
                from: record.status.to_string(),
                to: next.to_string(),
            });
        }
        record.status = next;
        let updated = record.value().clone();
        drop(record);
        self.publish_gauges();
        Ok(updated)
    }

    /// Apply `f` to a record in place.
    pub fn update<F>(&self, conflict_id: &str, f: F) -> Option<ConflictRecord>
    where
        F: FnOnce(&mut ConflictRecord),
    {
        let updated = self.records.get_mut(conflict_id).map(|mut r| {
            f(r.value_mut());
            r.value().clone()
        });
        self.publish_gauges();
        updated
    }

    /// Void every open record of `component`. Returns how many were marked.
    pub fn mark_stale(&self, component: StateComponent) -> usize {
        let mut marked = 0;
        for mut record in self.records.iter_mut() {
            if record.component == component && record.is_open() {
                record.stale = true;
                marked += 1;
            }
        }
        if marked > 0 {
            info!(%component, marked, "Open conflicts voided by rollback");
            self.publish_gauges();
        }
        marked
    }

    #[must_use]
    pub fn counts(&self) -> ConflictCounts {
        let mut counts = ConflictCounts::default();
        for record in self.records.iter() {
            if record.stale {
                counts.stale += 1;
                continue;
            }
            match record.status {
                ConflictStatus::Pending => counts.pending += 1,
                ConflictStatus::Resolving => counts.resolving += 1,
                ConflictStatus::Resolved => counts.resolved += 1,
            }
            if record.escalated && record.status != ConflictStatus::Resolved {
                counts.escalated += 1;
            }
        }
        counts
    }

    fn publish_gauges(&self) {
        let counts = self.counts();
        metrics::set_open_conflicts(counts.open());
        metrics::set_escalated_conflicts(counts.escalated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::MutationPayload;
    use serde_json::json;

    #[test]
    fn test_one_open_drift_conflict_per_component() {
        let registry = ConflictRegistry::new();
        assert!(registry.open_drift(StateComponent::World, 12.0, vec!["n1".into()], 1).is_some());
        assert!(registry.open_drift(StateComponent::World, 30.0, vec!["n1".into()], 2).is_none());
        assert!(registry.open_drift(StateComponent::Economy, 12.0, vec![], 3).is_some());
        assert_eq!(registry.counts().pending, 2);
    }

    #[test]
    fn test_status_only_moves_forward() {
        let registry = ConflictRegistry::new();
        let record = registry.open_drift(StateComponent::Quests, 8.0, vec![], 1).unwrap();
        let id = record.conflict_id.as_str();

        assert!(registry.transition(id, ConflictStatus::Resolved).is_err());
        registry.transition(id, ConflictStatus::Resolving).unwrap();
        registry.transition(id, ConflictStatus::Resolved).unwrap();

        let err = registry.transition(id, ConflictStatus::Pending).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert!(!registry.has_open(StateComponent::Quests));
    }

    #[test]
    fn test_priority_rules() {
        let op = MutationOp::new(
            StateComponent::Combat,
            3,
            MutationPayload::CasUpdate { value: json!(1) },
        );
        let registry = ConflictRegistry::new();
        assert_eq!(registry.open_exhausted(&op, 1).priority, 9);
        assert_eq!(
            registry.open_drift(StateComponent::Factions, 6.0, vec![], 1).unwrap().priority,
            5
        );
        assert_eq!(
            registry.open_drift(StateComponent::Player, 6.0, vec![], 1).unwrap().priority,
            6
        );
        let op = MutationOp::new(StateComponent::Quests, 0, MutationPayload::CasUpdate { value: json!(1) });
        assert_eq!(registry.open_exhausted(&op, 1).priority, 7);
    }

    #[test]
    fn test_exhausted_op_raised_once() {
        let registry = ConflictRegistry::new();
        let op = MutationOp::new(StateComponent::Player, 1, MutationPayload::CasUpdate { value: json!(1) });
        let a = registry.open_exhausted(&op, 1);
        let b = registry.open_exhausted(&op, 2);
        assert_eq!(a.conflict_id, b.conflict_id);
        assert_eq!(registry.list(None).len(), 1);
        assert_eq!(b.intent.unwrap().op_id, op.op_id);
    }

    #[test]
    fn test_open_exhausted_record_does_not_block_drift() {
        let registry = ConflictRegistry::new();
        let op = MutationOp::new(StateComponent::Economy, 4, MutationPayload::CasUpdate { value: json!(1) });
        registry.open_exhausted(&op, 1);
        assert!(registry.has_open(StateComponent::Economy));
        assert!(!registry.has_open_drift(StateComponent::Economy));

        assert!(registry.open_drift(StateComponent::Economy, 15.0, vec!["n1".into()], 2).is_some());
        assert!(registry.open_drift(StateComponent::Economy, 20.0, vec!["n1".into()], 3).is_none());
        assert_eq!(registry.counts().pending, 2);
    }

    #[test]
    fn test_mark_stale_closes_open_records() {
        let registry = ConflictRegistry::new();
        registry.open_drift(StateComponent::World, 12.0, vec![], 1).unwrap();
        assert_eq!(registry.mark_stale(StateComponent::World), 1);
        assert!(!registry.has_open(StateComponent::World));
        assert!(registry.actionable().is_empty());
        assert_eq!(registry.counts().stale, 1);
        // A fresh drift can be raised again
        assert!(registry.open_drift(StateComponent::World, 12.0, vec![], 2).is_some());
    }

    #[test]
    fn test_strategy_serde_names() {
        let s: ResolutionStrategy = serde_json::from_str("\"MANUAL_ESCALATION\"").unwrap();
        assert_eq!(s, ResolutionStrategy::ManualEscalation);
        let m: MergePolicy = serde_json::from_str("\"LAST_WRITER_WINS\"").unwrap();
        assert_eq!(m, MergePolicy::LastWriterWins);
    }
}
