// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the engine coordinator.

use serde::Serialize;

use crate::backpressure::BackpressureLevel;
use crate::queue::{LogStats, QueueStats};
use crate::sync::{SyncNode, SyncStatus};

/// Engine lifecycle phase.
///
/// Use [`super::WorldSyncEngine::phase()`] to check the current phase or
/// [`super::WorldSyncEngine::phase_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnginePhase {
    /// Just created, not yet started
    Created,
    /// Start requested
    Starting,
    /// Loading the latest snapshot and replaying the mutation log
    Restoring,
    /// Workers running
    Running,
    /// Workers stopping, final snapshot in progress
    ShuttingDown,
    Stopped,
}

impl EnginePhase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Starting => "STARTING",
            Self::Restoring => "RESTORING",
            Self::Running => "RUNNING",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Stopped => "STOPPED",
        }
    }

    /// Submissions are accepted in every phase before shutdown.
    #[must_use]
    pub fn accepts_submissions(&self) -> bool {
        !matches!(self, Self::ShuttingDown | Self::Stopped)
    }
}

impl std::fmt::Display for EnginePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `restore` recovered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub snapshot_id: Option<String>,
    /// Committed log entries re-applied on top of the snapshot
    pub replayed: usize,
    /// Pending ops put back on the queue
    pub requeued: usize,
}

/// One pass of the mutation drainer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub applied: usize,
    pub requeued: usize,
    /// Ops that exhausted their retries and became conflict records
    pub escalated: usize,
    pub rejected: usize,
}

impl DrainReport {
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.applied + self.requeued + self.escalated + self.rejected == 0
    }
}

/// Query shape for `GetSyncStatus`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatusReport {
    pub status: SyncStatus,
    pub queue_size: usize,
    /// Share of recent apply attempts that succeeded
    pub success_rate: f64,
    pub backlog_minutes: f64,
    pub nodes: Vec<SyncNode>,
    pub open_circuits: Vec<String>,
}

/// Engine health, suitable for `/ready` and `/health` endpoints.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub phase: EnginePhase,
    /// Running and able to take submissions
    pub ready: bool,
    pub sync_status: SyncStatus,
    pub backpressure_level: BackpressureLevel,
    pub accepting_writes: bool,
    pub queue: QueueStats,
    pub open_conflicts: usize,
    pub escalated_conflicts: usize,
    pub node_count: usize,
    pub unreachable_nodes: usize,
    pub log_backend: &'static str,
    /// None if the log could not be read
    pub log: Option<LogStats>,
    pub snapshot_backend: &'static str,
    pub world_digest: String,
    /// Running, log readable, not out of sync, nothing escalated, accepting writes
    pub healthy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_phase_display() {
        assert_eq!(format!("{}", EnginePhase::Created), "CREATED");
        assert_eq!(format!("{}", EnginePhase::ShuttingDown), "SHUTTING_DOWN");
    }

    #[test]
    fn test_phase_gates_submissions() {
        assert!(EnginePhase::Created.accepts_submissions());
        assert!(EnginePhase::Running.accepts_submissions());
        assert!(!EnginePhase::ShuttingDown.accepts_submissions());
        assert!(!EnginePhase::Stopped.accepts_submissions());
    }

    #[test]
    fn test_drain_report_idle() {
        assert!(DrainReport::default().is_idle());
        let busy = DrainReport { requeued: 1, ..Default::default() };
        assert!(!busy.is_idle());
    }
}
