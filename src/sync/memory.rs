// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process replicas for tests, demos and single-host deployments.
//!
//! Each [`LoopbackReplica`] behaves like a well-formed remote node: it keeps
//! the newest version it was sent and ignores stale pushes. Faults are
//! injected explicitly (`set_reachable`, `set_latency`, `diverge`).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::digest::value_digest;
use super::transport::{
    HeartbeatAck, PushAck, ReplicaState, ReplicaTransport, ReplicaUpdate, ReplicaView,
};
use crate::component::{epoch_millis, StateComponent};
use crate::error::{EngineError, Result};

pub struct LoopbackReplica {
    node_id: String,
    components: Mutex<BTreeMap<StateComponent, ReplicaState>>,
    reachable: AtomicBool,
    latency_ms: AtomicU64,
    clock_skew_ms: AtomicI64,
    pushes: AtomicU64,
}

impl LoopbackReplica {
    fn new(node_id: &str) -> Self {
        let components = StateComponent::ALL
            .into_iter()
            .map(|c| {
                let value = Value::Object(Default::default());
                (
                    c,
                    ReplicaState {
                        node_id: node_id.to_string(),
                        component: c,
                        version: 0,
                        digest: value_digest(&value),
                        value,
                        updated_at: 0,
                    },
                )
            })
            .collect();
        Self {
            node_id: node_id.to_string(),
            components: Mutex::new(components),
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            clock_skew_ms: AtomicI64::new(0),
            pushes: AtomicU64::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::Release);
    }

    pub fn set_clock_skew(&self, skew_ms: i64) {
        self.clock_skew_ms.store(skew_ms, Ordering::Release);
    }

    /// Force this replica to hold `value` at `version`, as a faulty node would.
    pub fn diverge(&self, component: StateComponent, version: u64, value: Value) {
        let mut components = self.components.lock();
        components.insert(
            component,
            ReplicaState {
                node_id: self.node_id.clone(),
                component,
                version,
                digest: value_digest(&value),
                value,
                updated_at: epoch_millis(),
            },
        );
    }

    #[must_use]
    pub fn state(&self, component: StateComponent) -> Option<ReplicaState> {
        self.components.lock().get(&component).cloned()
    }

    #[must_use]
    pub fn pushes_received(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    async fn round_trip(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::Acquire);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.reachable.load(Ordering::Acquire) {
            return Err(EngineError::NodeUnreachable {
                node_id: self.node_id.clone(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }

    fn view(state: &ReplicaState) -> ReplicaView {
        ReplicaView {
            version: state.version,
            digest: state.digest.clone(),
            updated_at: state.updated_at,
        }
    }
}

/// Routes transport calls to in-process replicas by node id.
#[derive(Default)]
pub struct InMemoryTransport {
    replicas: DashMap<String, Arc<LoopbackReplica>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or return) the replica behind `node_id`.
    pub fn add_replica(&self, node_id: &str) -> Arc<LoopbackReplica> {
        self.replicas
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(LoopbackReplica::new(node_id)))
            .clone()
    }

    #[must_use]
    pub fn replica(&self, node_id: &str) -> Option<Arc<LoopbackReplica>> {
        self.replicas.get(node_id).map(|r| r.value().clone())
    }

    fn lookup(&self, node_id: &str) -> Result<Arc<LoopbackReplica>> {
        self.replica(node_id).ok_or_else(|| EngineError::NodeUnreachable {
            node_id: node_id.to_string(),
            reason: "no such replica".into(),
        })
    }
}

#[async_trait]
impl ReplicaTransport for InMemoryTransport {
    async fn heartbeat(&self, node_id: &str) -> Result<HeartbeatAck> {
        let replica = self.lookup(node_id)?;
        replica.round_trip().await?;
        let replicas = replica
            .components
            .lock()
            .iter()
            .map(|(c, s)| (*c, LoopbackReplica::view(s)))
            .collect();
        Ok(HeartbeatAck {
            node_id: node_id.to_string(),
            clock_ms: epoch_millis() + replica.clock_skew_ms.load(Ordering::Acquire),
            replicas,
        })
    }

    async fn push(&self, node_id: &str, update: &ReplicaUpdate) -> Result<PushAck> {
        let replica = self.lookup(node_id)?;
        replica.round_trip().await?;
        replica.pushes.fetch_add(1, Ordering::Relaxed);

        let mut components = replica.components.lock();
        let current_version = components.get(&update.component).map(|s| s.version).unwrap_or(0);
        let applied = update.authoritative || update.version > current_version;
        if applied {
            components.insert(
                update.component,
                ReplicaState {
                    node_id: node_id.to_string(),
                    component: update.component,
                    version: update.version,
                    value: (*update.value).clone(),
                    digest: update.digest.clone(),
                    updated_at: update.updated_at,
                },
            );
        } else {
            debug!(node_id, component = %update.component, version = update.version, current_version, "Ignoring stale push");
        }

        let view = components
            .get(&update.component)
            .map(LoopbackReplica::view)
            .unwrap_or(ReplicaView {
                version: 0,
                digest: String::new(),
                updated_at: 0,
            });
        Ok(PushAck {
            node_id: node_id.to_string(),
            component: update.component,
            view,
            applied,
        })
    }

    async fn fetch_state(&self, node_id: &str, component: StateComponent) -> Result<ReplicaState> {
        let replica = self.lookup(node_id)?;
        replica.round_trip().await?;
        replica
            .state(component)
            .ok_or_else(|| EngineError::not_found("replica component", component.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(version: u64, value: Value, authoritative: bool) -> ReplicaUpdate {
        ReplicaUpdate {
            component: StateComponent::World,
            version,
            digest: value_digest(&value),
            value: Arc::new(value),
            updated_at: 1,
            authoritative,
        }
    }

    #[tokio::test]
    async fn test_push_keeps_newest_version() {
        let transport = InMemoryTransport::new();
        transport.add_replica("n1");

        let ack = transport.push("n1", &update(3, json!({"v": 3}), false)).await.unwrap();
        assert!(ack.applied);
        assert_eq!(ack.view.version, 3);

        // Duplicate and stale sends are harmless
        let ack = transport.push("n1", &update(3, json!({"v": 3}), false)).await.unwrap();
        assert!(!ack.applied);
        let ack = transport.push("n1", &update(2, json!({"v": 2}), false)).await.unwrap();
        assert!(!ack.applied);
        assert_eq!(ack.view.version, 3);
    }

    #[tokio::test]
    async fn test_authoritative_push_overwrites_diverged_replica() {
        let transport = InMemoryTransport::new();
        let replica = transport.add_replica("n1");
        replica.diverge(StateComponent::World, 50, json!({"bad": true}));

        let ack = transport.push("n1", &update(13, json!({"good": true}), true)).await.unwrap();
        assert!(ack.applied);
        assert_eq!(replica.state(StateComponent::World).unwrap().version, 13);
    }

    #[tokio::test]
    async fn test_unreachable_replica_fails_calls() {
        let transport = InMemoryTransport::new();
        transport.add_replica("n1").set_reachable(false);

        let err = transport.heartbeat("n1").await.unwrap_err();
        assert!(matches!(err, EngineError::NodeUnreachable { .. }));
        assert!(transport.heartbeat("missing").await.is_err());
    }
}
