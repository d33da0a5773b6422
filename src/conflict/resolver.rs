// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Drives conflict records to a canonical value.
//!
//! # Attempt
//!
//! One call to [`ConflictResolver::resolve`] is one attempt. An attempt walks
//! the component's configured strategies in order; the first that yields a
//! candidate value is committed and pushed, and the attempt ends there
//! whether or not the replicas converged. Later strategies only run when an
//! earlier one is not applicable or errors before committing:
//!
//! 1. The candidate is written as a `RESTORE` op against the current version,
//!    so the version always moves forward by one.
//! 2. The synthetic op is appended to the durable log as committed.
//! 3. The new state is pushed authoritatively to every reachable replica.
//! 4. The record is RESOLVED only if every push acked the new digest.
//!
//! An exhausted op's intent is applied in the first committed candidate only.
//! The version it landed at is kept on the record and later attempts reconcile
//! without it.
//!
//! After `max_resolution_attempts` failed attempts the record stays RESOLVING,
//! is flagged escalated and a CRITICAL alert is raised. Only an operator
//! ([`ConflictResolver::resolve_manually`]) closes it from there.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use super::{ConflictRecord, ConflictRegistry, ConflictStatus, MergePolicy, ResolutionStrategy};
use crate::alerts::AlertBus;
use crate::component::{epoch_millis, MutationOp, MutationPayload, StateComponent};
use crate::config::SharedConfig;
use crate::error::{EngineError, Result};
use crate::metrics;
use crate::queue::log::MutationLog;
use crate::store::{ComponentState, StateStore};
use crate::sync::{ReplicaState, ReplicaUpdate, SyncCoordinator};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionOutcome {
    Resolved {
        version: u64,
        strategy: String,
    },
    /// Attempt failed; the record will be retried
    Retrying {
        attempts: u32,
        error: String,
    },
    /// Out of attempts; waiting for an operator
    Escalated {
        attempts: u32,
    },
    /// Nothing to do (closed, stale or already escalated)
    Skipped {
        reason: String,
    },
}

struct Candidate {
    value: Value,
    description: String,
    /// Carries the record's exhausted op on top of the reconciled value
    with_intent: bool,
}

pub struct ConflictResolver {
    store: Arc<StateStore>,
    log: Arc<dyn MutationLog>,
    coordinator: Arc<SyncCoordinator>,
    registry: Arc<ConflictRegistry>,
    alerts: Arc<AlertBus>,
    config: SharedConfig,
}

impl ConflictResolver {
    pub fn new(
        store: Arc<StateStore>,
        log: Arc<dyn MutationLog>,
        coordinator: Arc<SyncCoordinator>,
        registry: Arc<ConflictRegistry>,
        alerts: Arc<AlertBus>,
        config: SharedConfig,
    ) -> Self {
        Self {
            store,
            log,
            coordinator,
            registry,
            alerts,
            config,
        }
    }

    /// One attempt on every open, non-escalated record, most urgent first.
    pub async fn resolve_pending(&self) -> Vec<(String, ResolutionOutcome)> {
        let mut outcomes = Vec::new();
        for record in self.registry.actionable() {
            match self.resolve(&record.conflict_id).await {
                Ok(outcome) => outcomes.push((record.conflict_id, outcome)),
                Err(e) => warn!(conflict_id = %record.conflict_id, error = %e, "Resolution attempt errored"),
            }
        }
        outcomes
    }

    /// Run one resolution attempt on a record.
    #[instrument(skip(self))]
    pub async fn resolve(&self, conflict_id: &str) -> Result<ResolutionOutcome> {
        let record = self
            .registry
            .get(conflict_id)
            .ok_or_else(|| EngineError::not_found("conflict", conflict_id))?;

        if let Some(reason) = skip_reason(&record) {
            return Ok(ResolutionOutcome::Skipped { reason: reason.into() });
        }
        if record.status == ConflictStatus::Pending {
            self.registry.transition(conflict_id, ConflictStatus::Resolving)?;
        }

        let (strategies, max_attempts) = {
            let cfg = self.config.read();
            (cfg.strategies_for(record.component), cfg.max_resolution_attempts)
        };
        if strategies.first() == Some(&ResolutionStrategy::ManualEscalation) {
            return Ok(self.escalate(&record, record.attempts, "manual escalation configured"));
        }

        let attempts = record.attempts + 1;
        self.registry.update(conflict_id, |r| r.attempts = attempts);

        let mut last_error = String::from("no strategy produced a candidate");
        for strategy in strategies
            .iter()
            .filter(|s| **s != ResolutionStrategy::ManualEscalation)
        {
            let candidate = match self.candidate(&record, *strategy).await {
                Ok(Some(c)) => c,
                Ok(None) => {
                    debug!(conflict_id, %strategy, "Strategy not applicable");
                    continue;
                }
                Err(e) => {
                    metrics::record_resolution_attempt(strategy.as_str(), "error");
                    last_error = format!("{strategy}: {e}");
                    continue;
                }
            };

            match self.commit(&record, candidate).await {
                Ok((version, description, true)) => {
                    metrics::record_resolution_attempt(strategy.as_str(), "converged");
                    return self.close(conflict_id, version, description);
                }
                Ok((version, _, false)) => {
                    // One commit per attempt; the next attempt starts from this version
                    metrics::record_resolution_attempt(strategy.as_str(), "diverged");
                    last_error = format!("{strategy}: replicas did not converge on version {version}");
                    break;
                }
                Err(e) => {
                    metrics::record_resolution_attempt(strategy.as_str(), "error");
                    last_error = format!("{strategy}: {e}");
                }
            }
        }

        self.registry
            .update(conflict_id, |r| r.last_error = Some(last_error.clone()));
        if attempts >= max_attempts {
            let record = self.registry.get(conflict_id).unwrap_or(record);
            return Ok(self.escalate(&record, attempts, &last_error));
        }
        debug!(conflict_id, attempts, error = %last_error, "Resolution attempt failed");
        Ok(ResolutionOutcome::Retrying {
            attempts,
            error: last_error,
        })
    }

    /// Close an open record with an operator-supplied value.
    #[instrument(skip(self, value))]
    pub async fn resolve_manually(&self, conflict_id: &str, value: Value) -> Result<ConflictRecord> {
        let record = self
            .registry
            .get(conflict_id)
            .ok_or_else(|| EngineError::not_found("conflict", conflict_id))?;
        if !record.is_open() {
            return Err(EngineError::InvalidTransition {
                entity: "conflict",
                id: conflict_id.to_string(),
                from: record.status.to_string(),
                to: ConflictStatus::Resolved.to_string(),
            });
        }
        if record.status == ConflictStatus::Pending {
            self.registry.transition(conflict_id, ConflictStatus::Resolving)?;
        }

        let candidate = Candidate {
            value,
            description: "MANUAL_ESCALATION: operator-supplied value".into(),
            with_intent: false,
        };
        let (version, description, converged) = self.commit(&record, candidate).await?;
        if converged {
            self.close(conflict_id, version, description)?;
        } else {
            self.registry.update(conflict_id, |r| {
                r.last_error = Some(format!(
                    "operator value committed at version {version}; replicas not yet converged"
                ));
            });
        }
        self.registry
            .get(conflict_id)
            .ok_or_else(|| EngineError::not_found("conflict", conflict_id))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Strategies
    // ═══════════════════════════════════════════════════════════════════

    async fn candidate(
        &self,
        record: &ConflictRecord,
        strategy: ResolutionStrategy,
    ) -> Result<Option<Candidate>> {
        let candidate = match strategy {
            ResolutionStrategy::DeterministicReplay => self.replay(record.component).await?,
            ResolutionStrategy::PriorityMerge => self.merge(record.component).await?,
            ResolutionStrategy::ManualEscalation => None,
        };
        let Some(mut candidate) = candidate else {
            return Ok(None);
        };

        // An exhausted op's intent lands on top of the reconciled value, once
        if let Some(intent) = record.intent.as_ref().filter(|_| record.intent_applied_version.is_none()) {
            let handler = self.store.handlers().get(record.component);
            candidate.value = handler.apply(record.component, &candidate.value, &intent.payload)?;
            candidate.description.push_str(&format!(", then op {}", intent.op_id));
            candidate.with_intent = true;
        }
        Ok(Some(candidate))
    }

    /// Rebuild the canonical value from the last K committed ops.
    async fn replay(&self, component: StateComponent) -> Result<Option<Candidate>> {
        let window = self.config.read().replay_window;
        let canonical = self.store.get_state(component);
        let tail = self.log.committed_tail(component, window).await?;

        let Some(first) = tail.first() else {
            return Ok(Some(Candidate {
                value: (*canonical.value).clone(),
                description: format!("DETERMINISTIC_REPLAY: reassert version {}", canonical.version),
                with_intent: false,
            }));
        };

        let contiguous = tail
            .windows(2)
            .all(|w| w[1].committed_version == w[0].committed_version + 1);
        let reaches_head = tail.last().map(|l| l.committed_version) == Some(canonical.version);
        if !contiguous || !reaches_head {
            debug!(%component, "Committed log does not line up with the store, replay skipped");
            return Ok(None);
        }

        let base_version = first.committed_version.saturating_sub(1);
        let Some(base) = self.store.value_at(component, base_version) else {
            debug!(%component, base_version, "Replay base no longer in history");
            return Ok(None);
        };

        let handler = self.store.handlers().get(component);
        let mut value = (*base).clone();
        for entry in &tail {
            value = handler.apply(component, &value, &entry.op.payload)?;
        }
        Ok(Some(Candidate {
            value,
            description: format!(
                "DETERMINISTIC_REPLAY: {} ops from version {}",
                tail.len(),
                base_version
            ),
            with_intent: false,
        }))
    }

    async fn merge(&self, component: StateComponent) -> Result<Option<Candidate>> {
        let Some(policy) = self.config.read().merge_policy(component) else {
            return Ok(None);
        };
        let canonical = self.store.get_state(component);
        let copies = self.coordinator.fetch_all(component).await;
        let value = merge_values(policy, &canonical, &copies);
        let label = match policy {
            MergePolicy::LastWriterWins => "last writer wins",
            MergePolicy::Union => "union",
        };
        Ok(Some(Candidate {
            value,
            description: format!("PRIORITY_MERGE: {label} over {} replicas", copies.len()),
            with_intent: false,
        }))
    }

    // ═══════════════════════════════════════════════════════════════════
    // Commit / close
    // ═══════════════════════════════════════════════════════════════════

    /// Apply the candidate authoritatively, log it and push it out.
    async fn commit(
        &self,
        record: &ConflictRecord,
        candidate: Candidate,
    ) -> Result<(u64, String, bool)> {
        let component = record.component;
        let op_id = format!("resolve:{}:{}", record.conflict_id, uuid::Uuid::new_v4());
        let payload = MutationPayload::Restore {
            value: candidate.value,
        };
        let version = self.store.apply_authoritative(component, &payload, &op_id)?;
        if candidate.with_intent {
            self.registry
                .update(&record.conflict_id, |r| r.intent_applied_version = Some(version));
        }

        let op = MutationOp {
            op_id,
            component,
            base_version: version - 1,
            payload,
            retries: 0,
            enqueued_at: epoch_millis(),
        };
        self.log.append_committed(&op, version).await?;
        self.registry
            .update(&record.conflict_id, |r| r.strategy = candidate.description.clone());

        let state: Arc<ComponentState> = self.store.get_state(component);
        let report = self
            .coordinator
            .replicate(ReplicaUpdate::from_state(&state, true))
            .await;
        let converged = report.converged(&state.digest);
        if !converged {
            warn!(
                conflict_id = %record.conflict_id,
                %component,
                version,
                failed = ?report.failed,
                "Corrected value did not reach every replica"
            );
        }
        Ok((version, candidate.description, converged))
    }

    fn close(&self, conflict_id: &str, version: u64, description: String) -> Result<ResolutionOutcome> {
        let record = self.registry.transition(conflict_id, ConflictStatus::Resolved)?;
        self.registry.update(conflict_id, |r| {
            r.resolved_version = Some(version);
            r.resolved_at = Some(epoch_millis());
            r.strategy = description.clone();
            r.last_error = None;
        });
        metrics::record_conflict(record.component, "resolved");
        info!(conflict_id, component = %record.component, version, strategy = %description, "Conflict resolved");
        Ok(ResolutionOutcome::Resolved {
            version,
            strategy: description,
        })
    }

    fn escalate(&self, record: &ConflictRecord, attempts: u32, reason: &str) -> ResolutionOutcome {
        self.registry.update(&record.conflict_id, |r| {
            r.escalated = true;
            r.strategy = format!("MANUAL_ESCALATION after {attempts} attempts");
        });
        metrics::record_conflict(record.component, "escalated");
        self.alerts.critical(
            "resolver",
            Some(record.component),
            format!(
                "conflict {} on {} needs an operator after {} attempts: {}",
                record.conflict_id, record.component, attempts, reason
            ),
        );
        ResolutionOutcome::Escalated { attempts }
    }
}

fn skip_reason(record: &ConflictRecord) -> Option<&'static str> {
    if record.stale {
        Some("voided by rollback")
    } else if record.status == ConflictStatus::Resolved {
        Some("already resolved")
    } else if record.escalated {
        Some("awaiting operator")
    } else {
        None
    }
}

/// Merge canonical and replica copies under `policy`.
#[must_use]
pub fn merge_values(policy: MergePolicy, canonical: &ComponentState, copies: &[ReplicaState]) -> Value {
    match policy {
        MergePolicy::LastWriterWins => {
            let mut winner: &Value = &canonical.value;
            let mut newest = canonical.updated_at;
            for copy in copies {
                if copy.updated_at > newest {
                    newest = copy.updated_at;
                    winner = &copy.value;
                }
            }
            winner.clone()
        }
        MergePolicy::Union => {
            let Value::Object(canonical_map) = canonical.value.as_ref() else {
                return (*canonical.value).clone();
            };
            let mut sorted: Vec<&ReplicaState> = copies.iter().collect();
            sorted.sort_by(|a, b| a.node_id.cmp(&b.node_id));

            let mut merged = Map::new();
            for copy in sorted {
                if let Value::Object(map) = &copy.value {
                    for (k, v) in map {
                        merged.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
            }
            for (k, v) in canonical_map {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
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
        log: Arc<dyn MutationLog>,
        transport: Arc<InMemoryTransport>,
        coordinator: Arc<SyncCoordinator>,
        registry: Arc<ConflictRegistry>,
        alerts: Arc<AlertBus>,
        resolver: ConflictResolver,
    }

    fn fixture(config: WorldSyncConfig) -> Fixture {
        let config = Arc::new(RwLock::new(config));
        let store = Arc::new(StateStore::default());
        let log: Arc<dyn MutationLog> = Arc::new(MemoryMutationLog::new());
        let transport = Arc::new(InMemoryTransport::new());
        let coordinator = Arc::new(SyncCoordinator::new(store.clone(), transport.clone(), config.clone()));
        let registry = Arc::new(ConflictRegistry::new());
        let alerts = Arc::new(AlertBus::default());
        let resolver = ConflictResolver::new(
            store.clone(),
            log.clone(),
            coordinator.clone(),
            registry.clone(),
            alerts.clone(),
            config,
        );
        Fixture {
            store,
            log,
            transport,
            coordinator,
            registry,
            alerts,
            resolver,
        }
    }

    async fn commit_op(f: &Fixture, component: StateComponent, payload: MutationPayload) -> u64 {
        let op = MutationOp::new(component, f.store.version(component), payload);
        f.log.append(&op).await.unwrap();
        let version = f.store.apply_op(&op).unwrap();
        f.log.mark_committed(&op.op_id, version).await.unwrap();
        version
    }

    fn canonical(value: Value, updated_at: i64) -> ComponentState {
        ComponentState {
            component: StateComponent::Factions,
            version: 4,
            digest: crate::sync::digest::value_digest(&value),
            value: Arc::new(value),
            updated_at,
        }
    }

    fn copy(node: &str, value: Value, updated_at: i64) -> ReplicaState {
        ReplicaState {
            node_id: node.into(),
            component: StateComponent::Factions,
            version: 4,
            digest: crate::sync::digest::value_digest(&value),
            value,
            updated_at,
        }
    }

    #[test]
    fn test_union_merge_prefers_canonical_on_collision() {
        let copies = vec![
            copy("n2", json!({"blue": 9, "green": 3}), 50),
            copy("n1", json!({"gold": 4, "green": 8}), 50),
        ];
        let merged = merge_values(
            MergePolicy::Union,
            &canonical(json!({"red": 1, "blue": 2}), 10),
            &copies,
        );
        // n1 sorts first, so its "green" is kept
        assert_eq!(merged, json!({"red": 1, "blue": 2, "green": 8, "gold": 4}));
    }

    #[test]
    fn test_last_writer_wins_by_timestamp() {
        let copies = vec![copy("n1", json!({"price": 7}), 30), copy("n2", json!({"price": 5}), 20)];
        let merged = merge_values(MergePolicy::LastWriterWins, &canonical(json!({"price": 6}), 25), &copies);
        assert_eq!(merged, json!({"price": 7}));

        let merged = merge_values(MergePolicy::LastWriterWins, &canonical(json!({"price": 6}), 40), &copies);
        assert_eq!(merged, json!({"price": 6}));
    }

    #[tokio::test]
    async fn test_replay_resolves_drift_and_converges_replicas() {
        let f = fixture(WorldSyncConfig::default());
        for i in 0..3 {
            commit_op(&f, StateComponent::World, MutationPayload::CounterAdd { key: "tick".into(), delta: i + 1 }).await;
        }
        let replica = f.transport.add_replica("n1");
        f.coordinator.register_node("n1");
        replica.diverge(StateComponent::World, 40, json!({"tick": -1}));

        let record = f.registry.open_drift(StateComponent::World, 100.0, vec!["n1".into()], 1).unwrap();
        let outcome = f.resolver.resolve(&record.conflict_id).await.unwrap();

        let ResolutionOutcome::Resolved { version, strategy } = outcome else {
            panic!("expected resolution, got {outcome:?}");
        };
        assert_eq!(version, 4);
        assert!(strategy.starts_with("DETERMINISTIC_REPLAY"));
        assert_eq!(*f.store.get_state(StateComponent::World).value, json!({"tick": 6}));

        let held = replica.state(StateComponent::World).unwrap();
        assert_eq!(held.version, 4);
        assert_eq!(held.digest, f.store.get_state(StateComponent::World).digest);

        let record = f.registry.get(&record.conflict_id).unwrap();
        assert_eq!(record.status, ConflictStatus::Resolved);
        assert_eq!(record.resolved_version, Some(4));
        assert_eq!(f.log.committed_tail(StateComponent::World, 1).await.unwrap()[0].committed_version, 4);
    }

    #[tokio::test]
    async fn test_unconverged_attempts_escalate_after_limit() {
        let f = fixture(WorldSyncConfig::default());
        f.transport.add_replica("n1").set_reachable(false);
        f.coordinator.register_node("n1");

        let record = f.registry.open_drift(StateComponent::Combat, 50.0, vec!["n1".into()], 1).unwrap();
        let id = record.conflict_id.as_str();

        for attempt in 1..=2 {
            let outcome = f.resolver.resolve(id).await.unwrap();
            assert!(matches!(outcome, ResolutionOutcome::Retrying { attempts, .. } if attempts == attempt));
        }
        let outcome = f.resolver.resolve(id).await.unwrap();
        assert_eq!(outcome, ResolutionOutcome::Escalated { attempts: 3 });

        let record = f.registry.get(id).unwrap();
        assert_eq!(record.status, ConflictStatus::Resolving);
        assert!(record.escalated);
        assert_eq!(f.alerts.recent(Some(crate::alerts::AlertSeverity::Critical)).len(), 1);

        // Escalated records are left for the operator
        assert!(matches!(f.resolver.resolve(id).await.unwrap(), ResolutionOutcome::Skipped { .. }));
        assert!(f.resolver.resolve_pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_manual_escalation_strategy_escalates_immediately() {
        let mut config = WorldSyncConfig::default();
        config
            .resolution_strategies
            .insert(StateComponent::Quests, vec![ResolutionStrategy::ManualEscalation]);
        let f = fixture(config);

        let record = f.registry.open_drift(StateComponent::Quests, 20.0, vec![], 1).unwrap();
        let outcome = f.resolver.resolve(&record.conflict_id).await.unwrap();
        assert_eq!(outcome, ResolutionOutcome::Escalated { attempts: 0 });
    }

    #[tokio::test]
    async fn test_manual_resolution_commits_operator_value() {
        let f = fixture(WorldSyncConfig::default());
        let before = f.store.version(StateComponent::Player);
        let record = f.registry.open_drift(StateComponent::Player, 20.0, vec![], 1).unwrap();

        let closed = f
            .resolver
            .resolve_manually(&record.conflict_id, json!({"hp": 100}))
            .await
            .unwrap();
        assert_eq!(closed.status, ConflictStatus::Resolved);
        assert_eq!(closed.resolved_version, Some(before + 1));
        assert_eq!(*f.store.get_state(StateComponent::Player).value, json!({"hp": 100}));

        let err = f
            .resolver
            .resolve_manually(&record.conflict_id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_exhausted_intent_is_applied_on_resolution() {
        let f = fixture(WorldSyncConfig::default());
        commit_op(&f, StateComponent::Economy, MutationPayload::CasUpdate { value: json!({"gold": 10}) }).await;

        let intent = MutationOp::new(
            StateComponent::Economy,
            0,
            MutationPayload::CounterAdd { key: "gold".into(), delta: 5 },
        );
        let record = f.registry.open_exhausted(&intent, 1);
        let outcome = f.resolver.resolve(&record.conflict_id).await.unwrap();
        assert!(matches!(outcome, ResolutionOutcome::Resolved { version: 2, .. }));
        assert_eq!(*f.store.get_state(StateComponent::Economy).value, json!({"gold": 15}));
    }

    #[tokio::test]
    async fn test_intent_lands_once_across_unconverged_attempts() {
        use ResolutionStrategy::*;
        for order in [vec![DeterministicReplay, PriorityMerge], vec![PriorityMerge, DeterministicReplay]] {
            let mut config = WorldSyncConfig::default();
            config.resolution_strategies.insert(StateComponent::Economy, order.clone());
            let f = fixture(config);
            commit_op(&f, StateComponent::Economy, MutationPayload::CasUpdate { value: json!({"gold": 10}) }).await;
            f.transport.add_replica("n1").set_reachable(false);
            f.coordinator.register_node("n1");

            let intent = MutationOp::new(
                StateComponent::Economy,
                0,
                MutationPayload::CounterAdd { key: "gold".into(), delta: 5 },
            );
            let record = f.registry.open_exhausted(&intent, 1);

            let mut version = f.store.version(StateComponent::Economy);
            for _ in 0..3 {
                f.resolver.resolve(&record.conflict_id).await.unwrap();
                let next = f.store.version(StateComponent::Economy);
                assert!(next <= version + 1, "{order:?}: attempt moved {version} -> {next}");
                version = next;
                assert_eq!(
                    *f.store.get_state(StateComponent::Economy).value,
                    json!({"gold": 15}),
                    "{order:?}"
                );
            }

            let record = f.registry.get(&record.conflict_id).unwrap();
            assert!(record.escalated);
            assert_eq!(record.intent_applied_version, Some(2));
        }
    }
}
