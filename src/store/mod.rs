// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Versioned per-component state with compare-and-swap writes.
//!
//! Each component lives in its own slot:
//!
//! ```text
//! ┌──────────────── Slot(WORLD) ────────────────┐
//! │ current: RwLock<Arc<ComponentState>>        │  readers clone the Arc
//! │ writer:  Mutex<WriterState>                 │  one writer at a time
//! │ success EWMA, drift (atomics)               │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Readers take the read lock only long enough to clone an `Arc`, so a slow
//! writer never stalls them. Writers to different components never contend.
//! Every successful apply bumps the version by exactly one and publishes a
//! [`StateChanged`] event.

pub mod handlers;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::component::{epoch_millis, MutationOp, MutationPayload, StateComponent};
use crate::error::{EngineError, Result};
use crate::metrics::{self, LatencyTimer};
use crate::sync::digest::{value_digest, world_digest};

pub use handlers::{HandlerRegistry, JsonMutationHandler, MutationHandler};

/// Applied `(baseVersion, opId)` pairs remembered per component.
const RECENT_OPS: usize = 512;
/// Past values kept per component for deterministic replay.
const HISTORY_DEPTH: usize = 128;
const EVENT_CAPACITY: usize = 4_096;

/// Immutable view of one component at one version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentState {
    pub component: StateComponent,
    pub version: u64,
    pub value: Arc<Value>,
    /// Hex SHA-256 of `value`
    pub digest: String,
    pub updated_at: i64,
}

impl ComponentState {
    fn initial(component: StateComponent) -> Self {
        let value = Value::Object(Default::default());
        Self {
            component,
            version: 0,
            digest: value_digest(&value),
            value: Arc::new(value),
            updated_at: epoch_millis(),
        }
    }
}

/// Query shape for `GetComponentStatus`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentStatus {
    pub component: StateComponent,
    pub version: u64,
    /// 0-100
    pub health_score: f64,
    pub pending_mutations: usize,
    pub drift_percent: f64,
    pub last_updated: i64,
    pub digest: String,
}

/// Published after every successful apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChanged {
    pub component: StateComponent,
    pub version: u64,
}

struct WriterState {
    recent_ops: VecDeque<(u64, String)>,
    history: VecDeque<(u64, Arc<Value>)>,
}

struct Slot {
    current: RwLock<Arc<ComponentState>>,
    writer: Mutex<WriterState>,
    success_ewma: AtomicU64,
    drift_percent: AtomicU64,
}

impl Slot {
    fn new(component: StateComponent) -> Self {
        let initial = ComponentState::initial(component);
        let mut history = VecDeque::with_capacity(HISTORY_DEPTH);
        history.push_back((0, initial.value.clone()));
        Self {
            current: RwLock::new(Arc::new(initial)),
            writer: Mutex::new(WriterState {
                recent_ops: VecDeque::with_capacity(RECENT_OPS),
                history,
            }),
            success_ewma: AtomicU64::new(1.0f64.to_bits()),
            drift_percent: AtomicU64::new(0.0f64.to_bits()),
        }
    }

    fn load(&self) -> Arc<ComponentState> {
        self.current.read().clone()
    }
}

/// The per-component state store.
pub struct StateStore {
    slots: [Slot; 6],
    handlers: HandlerRegistry,
    events: broadcast::Sender<StateChanged>,
    health_alpha: f64,
}

impl StateStore {
    pub fn new(health_alpha: f64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            slots: StateComponent::ALL.map(Slot::new),
            handlers: HandlerRegistry::default(),
            events,
            health_alpha: health_alpha.clamp(0.01, 1.0),
        }
    }

    fn slot(&self, component: StateComponent) -> &Slot {
        &self.slots[component as usize]
    }

    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChanged> {
        self.events.subscribe()
    }

    /// Current value and version of a component.
    #[must_use]
    pub fn get_state(&self, component: StateComponent) -> Arc<ComponentState> {
        self.slot(component).load()
    }

    #[must_use]
    pub fn version(&self, component: StateComponent) -> u64 {
        self.slot(component).current.read().version
    }

    /// CAS apply: fails with `VersionConflict` unless `base_version` is current.
    pub fn apply_mutation(
        &self,
        component: StateComponent,
        base_version: u64,
        payload: &MutationPayload,
    ) -> Result<u64> {
        self.apply_inner(component, Some(base_version), payload, None)
    }

    /// CAS apply with idempotency on `(component, baseVersion, opId)`.
    ///
    /// Re-applying an op that already produced a transition returns the
    /// version it produced without touching state.
    pub fn apply_op(&self, op: &MutationOp) -> Result<u64> {
        self.apply_inner(op.component, Some(op.base_version), &op.payload, Some(&op.op_id))
    }

    /// Authoritative write against whatever version is current.
    ///
    /// Used by rollback and conflict resolution. Still goes through the writer
    /// lock and still bumps the version by one.
    pub fn apply_authoritative(
        &self,
        component: StateComponent,
        payload: &MutationPayload,
        op_id: &str,
    ) -> Result<u64> {
        self.apply_inner(component, None, payload, Some(op_id))
    }

    fn apply_inner(
        &self,
        component: StateComponent,
        base_version: Option<u64>,
        payload: &MutationPayload,
        op_id: Option<&str>,
    ) -> Result<u64> {
        let _timer = LatencyTimer::new("store", "apply");
        let slot = self.slot(component);
        let mut writer = slot.writer.lock();
        let current = slot.load();

        if let (Some(base), Some(op_id)) = (base_version, op_id) {
            if writer
                .recent_ops
                .iter()
                .any(|(b, id)| *b == base && id == op_id)
            {
                debug!(%component, op_id, base, "Duplicate op, already applied");
                metrics::record_mutation(component, "duplicate");
                return Ok(base + 1);
            }
        }

        let base = base_version.unwrap_or(current.version);
        if base != current.version {
            self.record_outcome(component, slot, false);
            metrics::record_mutation(component, "conflict");
            return Err(EngineError::VersionConflict {
                component,
                expected: base,
                actual: current.version,
            });
        }

        let next = match self.handlers.get(component).apply(component, &current.value, payload) {
            Ok(v) => v,
            Err(e) => {
                self.record_outcome(component, slot, false);
                metrics::record_mutation(component, "invalid");
                return Err(e);
            }
        };

        let version = current.version + 1;
        let value = Arc::new(next);
        let state = Arc::new(ComponentState {
            component,
            version,
            digest: value_digest(&value),
            value: value.clone(),
            updated_at: epoch_millis(),
        });
        *slot.current.write() = state;

        if writer.history.len() >= HISTORY_DEPTH {
            writer.history.pop_front();
        }
        writer.history.push_back((version, value));
        if let Some(op_id) = op_id {
            if writer.recent_ops.len() >= RECENT_OPS {
                writer.recent_ops.pop_front();
            }
            writer.recent_ops.push_back((base, op_id.to_string()));
        }
        self.record_outcome(component, slot, true);
        drop(writer);

        // No receivers is fine: replication may not be running yet
        let _ = self.events.send(StateChanged { component, version });
        metrics::record_mutation(component, "success");
        metrics::set_component_version(component, version);
        Ok(version)
    }

    fn record_outcome(&self, component: StateComponent, slot: &Slot, success: bool) {
        let sample = if success { 1.0 } else { 0.0 };
        let prev = f64::from_bits(slot.success_ewma.load(Ordering::Acquire));
        let next = prev + self.health_alpha * (sample - prev);
        slot.success_ewma.store(next.to_bits(), Ordering::Release);
        metrics::set_component_health(component, self.health_score(component));
    }

    /// Value the component held at `version`, if still in recent history.
    #[must_use]
    pub fn value_at(&self, component: StateComponent, version: u64) -> Option<Arc<Value>> {
        self.slot(component)
            .writer
            .lock()
            .history
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, value)| value.clone())
    }

    /// Consistent cut of every component.
    ///
    /// Takes every writer lock in component order, so no apply can land
    /// between two reads.
    #[must_use]
    pub fn capture(&self) -> BTreeMap<StateComponent, Arc<ComponentState>> {
        let guards: Vec<_> = self.slots.iter().map(|s| s.writer.lock()).collect();
        let cut = StateComponent::ALL
            .into_iter()
            .map(|c| (c, self.slot(c).load()))
            .collect();
        drop(guards);
        cut
    }

    /// Install recovered state during startup. Never moves a version backwards.
    pub fn load(&self, component: StateComponent, version: u64, value: Value, updated_at: i64) {
        let slot = self.slot(component);
        let mut writer = slot.writer.lock();
        let current = slot.load();
        if version < current.version {
            warn!(%component, version, current = current.version, "Ignoring stale recovered state");
            return;
        }
        let value = Arc::new(value);
        *slot.current.write() = Arc::new(ComponentState {
            component,
            version,
            digest: value_digest(&value),
            value: value.clone(),
            updated_at,
        });
        writer.history.clear();
        writer.history.push_back((version, value));
        metrics::set_component_version(component, version);
    }

    pub fn set_drift(&self, component: StateComponent, drift_percent: f64) {
        self.slot(component)
            .drift_percent
            .store(drift_percent.max(0.0).to_bits(), Ordering::Release);
        metrics::set_component_drift(component, drift_percent);
    }

    #[must_use]
    pub fn drift(&self, component: StateComponent) -> f64 {
        f64::from_bits(self.slot(component).drift_percent.load(Ordering::Acquire))
    }

    /// Success EWMA scaled to 0-100, minus current drift.
    #[must_use]
    pub fn health_score(&self, component: StateComponent) -> f64 {
        let slot = self.slot(component);
        let ewma = f64::from_bits(slot.success_ewma.load(Ordering::Acquire));
        (ewma * 100.0 - self.drift(component)).clamp(0.0, 100.0)
    }

    #[must_use]
    pub fn status(&self, component: StateComponent, pending_mutations: usize) -> ComponentStatus {
        let state = self.get_state(component);
        ComponentStatus {
            component,
            version: state.version,
            health_score: self.health_score(component),
            pending_mutations,
            drift_percent: self.drift(component),
            last_updated: state.updated_at,
            digest: state.digest.clone(),
        }
    }

    /// Root digest over every component's version and value.
    #[must_use]
    pub fn world_digest(&self) -> String {
        let map = StateComponent::ALL
            .into_iter()
            .map(|c| {
                let s = self.get_state(c);
                (c, (s.version, s.digest.clone()))
            })
            .collect();
        world_digest(&map)
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(0.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cas(value: Value) -> MutationPayload {
        MutationPayload::CasUpdate { value }
    }

    #[test]
    fn test_cas_increments_by_one() {
        let store = StateStore::default();
        assert_eq!(store.version(StateComponent::World), 0);

        assert_eq!(store.apply_mutation(StateComponent::World, 0, &cas(json!({"a": 1}))).unwrap(), 1);
        assert_eq!(store.apply_mutation(StateComponent::World, 1, &cas(json!({"a": 2}))).unwrap(), 2);

        let state = store.get_state(StateComponent::World);
        assert_eq!(state.version, 2);
        assert_eq!(*state.value, json!({"a": 2}));
        // Other components untouched
        assert_eq!(store.version(StateComponent::Economy), 0);
    }

    #[test]
    fn test_stale_base_leaves_state_unchanged() {
        let store = StateStore::default();
        store.apply_mutation(StateComponent::World, 0, &cas(json!({"a": 1}))).unwrap();
        let before = store.get_state(StateComponent::World);

        let err = store
            .apply_mutation(StateComponent::World, 0, &cas(json!({"a": 99})))
            .unwrap_err();

        match err {
            EngineError::VersionConflict { expected, actual, .. } => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected conflict, got {other}"),
        }
        assert_eq!(store.get_state(StateComponent::World), before);
    }

    #[test]
    fn test_duplicate_op_is_not_reapplied() {
        let store = StateStore::default();
        let op = MutationOp::new(
            StateComponent::Economy,
            0,
            MutationPayload::CounterAdd { key: "gold".into(), delta: 10 },
        );

        assert_eq!(store.apply_op(&op).unwrap(), 1);
        assert_eq!(store.apply_op(&op).unwrap(), 1);

        let state = store.get_state(StateComponent::Economy);
        assert_eq!(state.version, 1);
        assert_eq!(state.value["gold"], 10);
    }

    #[test]
    fn test_authoritative_apply_always_lands() {
        let store = StateStore::default();
        store.apply_mutation(StateComponent::Combat, 0, &cas(json!({"hp": 1}))).unwrap();

        let version = store
            .apply_authoritative(
                StateComponent::Combat,
                &MutationPayload::Restore { value: json!({"hp": 100}) },
                "restore-1",
            )
            .unwrap();

        assert_eq!(version, 2);
        assert_eq!(store.get_state(StateComponent::Combat).value["hp"], 100);
    }

    #[tokio::test]
    async fn test_state_changed_published() {
        let store = StateStore::default();
        let mut rx = store.subscribe();

        store.apply_mutation(StateComponent::Quests, 0, &cas(json!({}))).unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event, StateChanged { component: StateComponent::Quests, version: 1 });
    }

    #[test]
    fn test_health_decays_on_failures() {
        let store = StateStore::new(0.5);
        assert_eq!(store.health_score(StateComponent::World), 100.0);

        let _ = store.apply_mutation(StateComponent::World, 7, &cas(json!({})));
        assert_eq!(store.health_score(StateComponent::World), 50.0);

        store.set_drift(StateComponent::World, 20.0);
        assert_eq!(store.health_score(StateComponent::World), 30.0);

        store.apply_mutation(StateComponent::World, 0, &cas(json!({}))).unwrap();
        assert_eq!(store.health_score(StateComponent::World), 55.0);
    }

    #[test]
    fn test_history_and_capture() {
        let store = StateStore::default();
        store.apply_mutation(StateComponent::World, 0, &cas(json!({"v": 1}))).unwrap();
        store.apply_mutation(StateComponent::World, 1, &cas(json!({"v": 2}))).unwrap();

        assert_eq!(*store.value_at(StateComponent::World, 1).unwrap(), json!({"v": 1}));
        assert!(store.value_at(StateComponent::World, 9).is_none());

        let cut = store.capture();
        assert_eq!(cut.len(), 6);
        assert_eq!(cut[&StateComponent::World].version, 2);
    }

    #[test]
    fn test_load_never_moves_backwards() {
        let store = StateStore::default();
        store.load(StateComponent::Player, 40, json!({"n": 40}), 1);
        store.load(StateComponent::Player, 12, json!({"n": 12}), 2);

        let state = store.get_state(StateComponent::Player);
        assert_eq!(state.version, 40);
        assert_eq!(state.value["n"], 40);
    }
}
