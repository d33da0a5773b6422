// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transfer and evacuation work orders.

use serde::{Deserialize, Serialize};

use crate::component::epoch_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Planned,
    Executing,
    Completed,
    Failed,
}

impl PlanStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "PLANNED",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanPriority {
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Drain players in batches of `batch_size` every `interval_ms`
    Gradual,
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferPlan {
    pub plan_id: String,
    pub zone_id: String,
    pub source_instance_id: String,
    pub target_instance_id: String,
    pub priority: PlanPriority,
    pub reason: String,
    pub mode: TransferMode,
    pub batch_size: u32,
    pub interval_ms: u64,
    /// Raised by the load monitor rather than a caller
    pub automatic: bool,
    pub status: PlanStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub players_moved: u32,
    pub batches: u32,
    pub failure: Option<String>,
}

impl TransferPlan {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        zone_id: &str,
        source_instance_id: &str,
        target_instance_id: &str,
        priority: PlanPriority,
        reason: impl Into<String>,
        mode: TransferMode,
        batch_size: u32,
        interval_ms: u64,
        automatic: bool,
    ) -> Self {
        Self {
            plan_id: uuid::Uuid::new_v4().to_string(),
            zone_id: zone_id.to_string(),
            source_instance_id: source_instance_id.to_string(),
            target_instance_id: target_instance_id.to_string(),
            priority,
            reason: reason.into(),
            mode,
            batch_size: batch_size.max(1),
            interval_ms,
            automatic,
            status: PlanStatus::Planned,
            created_at: epoch_millis(),
            started_at: None,
            completed_at: None,
            players_moved: 0,
            batches: 0,
            failure: None,
        }
    }
}

/// Parameters of `plan_evacuation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvacuationRequest {
    pub zone_id: String,
    pub target_zone_id: String,
    pub batch_size: u32,
    pub interval_ms: u64,
    pub notify_players: bool,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvacuationPlan {
    pub plan_id: String,
    pub zone_id: String,
    pub target_zone_id: String,
    pub source_instance_id: String,
    pub batch_size: u32,
    pub interval_ms: u64,
    pub notify_players: bool,
    pub timeout_seconds: u64,
    pub status: PlanStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub players_moved: u32,
    pub npcs_moved: u32,
    pub batches: u32,
    pub failure: Option<String>,
}

impl EvacuationPlan {
    pub(crate) fn new(request: EvacuationRequest, source_instance_id: &str) -> Self {
        Self {
            plan_id: uuid::Uuid::new_v4().to_string(),
            zone_id: request.zone_id,
            target_zone_id: request.target_zone_id,
            source_instance_id: source_instance_id.to_string(),
            batch_size: request.batch_size.max(1),
            interval_ms: request.interval_ms,
            notify_players: request.notify_players,
            timeout_seconds: request.timeout_seconds,
            status: PlanStatus::Planned,
            created_at: epoch_millis(),
            started_at: None,
            completed_at: None,
            players_moved: 0,
            npcs_moved: 0,
            batches: 0,
            failure: None,
        }
    }
}
