// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! State components and the mutations that flow through the engine.
//!
//! The engine treats each [`StateComponent`] as an opaque, versioned JSON blob.
//! Changes arrive as [`MutationOp`] records whose [`MutationPayload`] is a
//! tagged union, so applying one never needs runtime reflection.
//!
//! # Example
//!
//! ```
//! use world_sync::{MutationOp, MutationPayload, MutationKind, StateComponent};
//! use serde_json::json;
//!
//! let op = MutationOp::new(
//!     StateComponent::World,
//!     10,
//!     MutationPayload::CasUpdate { value: json!({"weather": "rain"}) },
//! );
//!
//! assert_eq!(op.kind(), MutationKind::CasUpdate);
//! assert_eq!(op.base_version, 10);
//! assert_eq!(op.retries, 0);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

/// Milliseconds since the Unix epoch.
pub(crate) fn epoch_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The fixed set of state components the engine versions and replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateComponent {
    World,
    Factions,
    Economy,
    Player,
    Quests,
    Combat,
}

impl StateComponent {
    /// Every component, in the fixed order used for multi-component locking.
    pub const ALL: [StateComponent; 6] = [
        Self::World,
        Self::Factions,
        Self::Economy,
        Self::Player,
        Self::Quests,
        Self::Combat,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::World => "WORLD",
            Self::Factions => "FACTIONS",
            Self::Economy => "ECONOMY",
            Self::Player => "PLAYER",
            Self::Quests => "QUESTS",
            Self::Combat => "COMBAT",
        }
    }
}

impl fmt::Display for StateComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StateComponent {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EngineError::InvalidMutation(format!("unknown component '{}'", s)))
    }
}

/// Discriminant of a [`MutationPayload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationKind {
    CasUpdate,
    DeltaPatch,
    CounterAdd,
    Restore,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CasUpdate => "CAS_UPDATE",
            Self::DeltaPatch => "DELTA_PATCH",
            Self::CounterAdd => "COUNTER_ADD",
            Self::Restore => "RESTORE",
        };
        f.write_str(s)
    }
}

/// Typed mutation body, tagged by mutation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationPayload {
    /// Replace the whole component value.
    CasUpdate { value: Value },
    /// Merge top-level keys into the component object; `null` removes a key.
    DeltaPatch { patch: Map<String, Value> },
    /// Add `delta` to an integer field.
    CounterAdd { key: String, delta: i64 },
    /// Authoritative overwrite issued by rollback and conflict resolution.
    Restore { value: Value },
}

impl MutationPayload {
    #[must_use]
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::CasUpdate { .. } => MutationKind::CasUpdate,
            Self::DeltaPatch { .. } => MutationKind::DeltaPatch,
            Self::CounterAdd { .. } => MutationKind::CounterAdd,
            Self::Restore { .. } => MutationKind::Restore,
        }
    }

    /// Number of top-level keys a delta patch touches (0 for other kinds).
    #[must_use]
    pub fn patch_width(&self) -> usize {
        match self {
            Self::DeltaPatch { patch } => patch.len(),
            _ => 0,
        }
    }
}

/// An immutable record of a pending compare-and-swap against one component.
///
/// Retrying an op produces a new record (see [`MutationOp::rebased`]) rather
/// than mutating this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationOp {
    pub op_id: String,
    pub component: StateComponent,
    /// Expected version of the component before this op applies.
    pub base_version: u64,
    pub payload: MutationPayload,
    pub retries: u32,
    /// Enqueue timestamp (epoch millis)
    pub enqueued_at: i64,
}

impl MutationOp {
    /// Create an op with a fresh random id.
    pub fn new(component: StateComponent, base_version: u64, payload: MutationPayload) -> Self {
        Self {
            op_id: uuid::Uuid::new_v4().to_string(),
            component,
            base_version,
            payload,
            retries: 0,
            enqueued_at: epoch_millis(),
        }
    }

    /// Use a caller-supplied id (for at-least-once upstream delivery).
    #[must_use]
    pub fn with_op_id(mut self, op_id: impl Into<String>) -> Self {
        self.op_id = op_id.into();
        self
    }

    #[must_use]
    pub fn kind(&self) -> MutationKind {
        self.payload.kind()
    }

    /// `(component, baseVersion, opId)`: an op applies at most once per key.
    #[must_use]
    pub fn idempotency_key(&self) -> (StateComponent, u64, &str) {
        (self.component, self.base_version, &self.op_id)
    }

    /// Copy of this op retargeted at `base_version`, with one more retry.
    #[must_use]
    pub fn rebased(&self, base_version: u64) -> Self {
        Self {
            base_version,
            retries: self.retries + 1,
            ..self.clone()
        }
    }

    /// Reject ops the queue should never accept.
    pub fn validate(&self) -> Result<()> {
        if self.op_id.trim().is_empty() {
            return Err(EngineError::InvalidMutation("op_id is empty".into()));
        }
        match &self.payload {
            MutationPayload::DeltaPatch { patch } if patch.is_empty() => Err(
                EngineError::InvalidMutation(format!("{}: empty delta patch", self.op_id)),
            ),
            MutationPayload::CounterAdd { key, .. } if key.is_empty() => Err(
                EngineError::InvalidMutation(format!("{}: counter key is empty", self.op_id)),
            ),
            _ => Ok(()),
        }
    }
}
