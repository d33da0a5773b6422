// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The seam between the coordinator and replica nodes.
//!
//! The engine fixes no wire format; a deployment plugs in whatever RPC it
//! uses by implementing [`ReplicaTransport`]. Every call is wrapped in the
//! configured network timeout by the caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::component::StateComponent;
use crate::error::Result;
use crate::store::ComponentState;

/// What a replica reports holding for one component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaView {
    pub version: u64,
    pub digest: String,
    pub updated_at: i64,
}

/// A component value shipped to a replica.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicaUpdate {
    pub component: StateComponent,
    pub version: u64,
    pub value: Arc<Value>,
    pub digest: String,
    pub updated_at: i64,
    /// Overwrite regardless of the replica's version (resolution, rollback)
    pub authoritative: bool,
}

impl ReplicaUpdate {
    pub fn from_state(state: &ComponentState, authoritative: bool) -> Self {
        Self {
            component: state.component,
            version: state.version,
            value: state.value.clone(),
            digest: state.digest.clone(),
            updated_at: state.updated_at,
            authoritative,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub node_id: String,
    /// Replica wall clock at reply (epoch millis)
    pub clock_ms: i64,
    pub replicas: BTreeMap<StateComponent, ReplicaView>,
}

/// Replica's view of a component after handling a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    pub node_id: String,
    pub component: StateComponent,
    pub view: ReplicaView,
    /// False when the replica already had this or a newer version
    pub applied: bool,
}

/// Full replica copy of a component, fetched for merges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub node_id: String,
    pub component: StateComponent,
    pub version: u64,
    pub value: Value,
    pub digest: String,
    pub updated_at: i64,
}

#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    /// Fails with `NodeUnreachable` when the node does not answer.
    async fn heartbeat(&self, node_id: &str) -> Result<HeartbeatAck>;

    async fn push(&self, node_id: &str, update: &ReplicaUpdate) -> Result<PushAck>;

    async fn fetch_state(&self, node_id: &str, component: StateComponent) -> Result<ReplicaState>;
}
