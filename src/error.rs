// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy for the engine.
//!
//! Recoverable errors (version conflicts, unreachable nodes, snapshot pause
//! timeouts) are absorbed inside the engine: retried, degraded into health
//! signals, or converted into conflict records. Capacity and rollback failures
//! are returned to the caller.

use thiserror::Error;

use crate::component::StateComponent;

/// Failures from the durable mutation log and the snapshot store.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Record not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Corrupt record '{id}': {reason}")]
    Corrupt { id: String, reason: String },
}

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("version conflict on {component}: expected base {expected}, current is {actual}")]
    VersionConflict {
        component: StateComponent,
        expected: u64,
        actual: u64,
    },

    #[error("instance '{instance_id}' is at capacity: {reason}")]
    CapacityExceeded { instance_id: String, reason: String },

    #[error("node '{node_id}' unreachable: {reason}")]
    NodeUnreachable { node_id: String, reason: String },

    #[error("snapshot quiesce took longer than {budget_ms}ms ({in_flight} ops still in flight)")]
    SnapshotPauseTimeout { budget_ms: u64, in_flight: usize },

    #[error("cannot roll back to snapshot '{snapshot_id}': {reason}")]
    RollbackConflict { snapshot_id: String, reason: String },

    #[error("payload rejected for {component}: {reason}")]
    InvalidPayload {
        component: StateComponent,
        reason: String,
    },

    #[error("malformed mutation: {0}")]
    InvalidMutation(String),

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{entity} '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: String,
        from: String,
        to: String,
    },

    #[error("zone '{zone_id}' of type '{zone_type}' is not supported by instance '{instance_id}'")]
    IncompatibleZone {
        zone_id: String,
        zone_type: String,
        instance_id: String,
    },

    #[error("mutation queue under pressure ({0}), submission rejected")]
    Backpressure(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl EngineError {
    pub(crate) fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    /// Errors the engine handles internally (retry, degrade, escalate).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::VersionConflict { .. }
                | Self::NodeUnreachable { .. }
                | Self::SnapshotPauseTimeout { .. }
                | Self::Backpressure(_)
        )
    }

    /// Errors that must reach a caller or operator.
    #[must_use]
    pub fn is_operator_visible(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::RollbackConflict { .. }
                | Self::IncompatibleZone { .. }
                | Self::Storage(_)
        )
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::VersionConflict { .. } => "version_conflict",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::NodeUnreachable { .. } => "node_unreachable",
            Self::SnapshotPauseTimeout { .. } => "snapshot_pause_timeout",
            Self::RollbackConflict { .. } => "rollback_conflict",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::InvalidMutation(_) => "invalid_mutation",
            Self::NotFound { .. } => "not_found",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::IncompatibleZone { .. } => "incompatible_zone",
            Self::Backpressure(_) => "backpressure",
            Self::Storage(_) => "storage",
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
