// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Zone partitioning across realtime instances.
//!
//! The zone map (zones plus instances) sits behind one `RwLock`; locks are
//! never held across an await, so batch drains sleep between short write
//! sections. A zone's `assigned_instance_id` only changes through
//! [`ZoneManager::assign_zone`] on an unassigned zone or a completed
//! transfer plan.
//!
//! # Transfer
//!
//! ```text
//! ONLINE(source) ──execute──► MIGRATING ──batches──► ONLINE(target)
//!                                 │
//!                                 └─ source activePlayers drains by batch_size
//! ```

pub mod load;
pub mod plan;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::alerts::AlertBus;
use crate::component::epoch_millis;
use crate::config::SharedConfig;
use crate::error::{EngineError, Result};
use crate::metrics;

pub use load::{tick_sla_ms, LoadMonitor, LoadSnapshot, TickVerdict};
pub use plan::{
    EvacuationPlan, EvacuationRequest, PlanPriority, PlanStatus, TransferMode, TransferPlan,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoneStatus {
    Online,
    Maintenance,
    Migrating,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Online,
    Maintenance,
    Draining,
    Offline,
}

impl InstanceStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "ONLINE",
            Self::Maintenance => "MAINTENANCE",
            Self::Draining => "DRAINING",
            Self::Offline => "OFFLINE",
        }
    }
}

/// Simulation rate of an instance. Only 20, 30 and 60 Hz exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum TickRate {
    Hz20,
    Hz30,
    Hz60,
}

impl TickRate {
    #[must_use]
    pub fn hz(&self) -> u32 {
        match self {
            Self::Hz20 => 20,
            Self::Hz30 => 30,
            Self::Hz60 => 60,
        }
    }
}

impl TryFrom<u32> for TickRate {
    type Error = String;

    fn try_from(hz: u32) -> std::result::Result<Self, Self::Error> {
        match hz {
            20 => Ok(Self::Hz20),
            30 => Ok(Self::Hz30),
            60 => Ok(Self::Hz60),
            other => Err(format!("unsupported tick rate {other} Hz (expected 20, 30 or 60)")),
        }
    }
}

impl From<TickRate> for u32 {
    fn from(rate: TickRate) -> Self {
        rate.hz()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub zone_id: String,
    pub zone_name: String,
    /// Matched against an instance's `supported_zone_types`
    pub zone_type: String,
    pub status: ZoneStatus,
    pub assigned_instance_id: Option<String>,
    /// Taken from the assigned instance
    pub region: Option<String>,
    pub player_count: u32,
    pub npc_count: u32,
    pub pvp_enabled: bool,
}

impl Zone {
    pub fn new(zone_id: &str, zone_name: &str, zone_type: &str) -> Self {
        Self {
            zone_id: zone_id.to_string(),
            zone_name: zone_name.to_string(),
            zone_type: zone_type.to_string(),
            status: ZoneStatus::Online,
            assigned_instance_id: None,
            region: None,
            player_count: 0,
            npc_count: 0,
            pvp_enabled: false,
        }
    }

    #[must_use]
    pub fn with_population(mut self, players: u32, npcs: u32) -> Self {
        self.player_count = players;
        self.npc_count = npcs;
        self
    }

    #[must_use]
    pub fn with_pvp(mut self, enabled: bool) -> Self {
        self.pvp_enabled = enabled;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeInstance {
    pub instance_id: String,
    pub region: String,
    pub status: InstanceStatus,
    pub tick_rate_hz: TickRate,
    pub max_players: u32,
    pub active_players: u32,
    pub max_zones: u32,
    pub supported_zone_types: Vec<String>,
    #[serde(default)]
    pub last_tick_ms: Option<f64>,
}

impl RealtimeInstance {
    pub fn new(
        instance_id: &str,
        region: &str,
        tick_rate_hz: TickRate,
        max_players: u32,
        max_zones: u32,
        supported_zone_types: &[&str],
    ) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            region: region.to_string(),
            status: InstanceStatus::Online,
            tick_rate_hz,
            max_players,
            active_players: 0,
            max_zones,
            supported_zone_types: supported_zone_types.iter().map(|s| s.to_string()).collect(),
            last_tick_ms: None,
        }
    }

    #[must_use]
    pub fn supports(&self, zone_type: &str) -> bool {
        self.supported_zone_types.iter().any(|t| t == zone_type)
    }

    fn load_ratio(&self) -> f64 {
        if self.max_players == 0 {
            return f64::INFINITY;
        }
        f64::from(self.active_players) / f64::from(self.max_players)
    }
}

#[derive(Default)]
struct ZoneMap {
    zones: BTreeMap<String, Zone>,
    instances: BTreeMap<String, RealtimeInstance>,
    /// Inbound transfers in flight per target instance
    reserved: BTreeMap<String, u32>,
}

impl ZoneMap {
    fn zones_on(&self, instance_id: &str) -> u32 {
        let assigned = self
            .zones
            .values()
            .filter(|z| z.assigned_instance_id.as_deref() == Some(instance_id))
            .count() as u32;
        assigned + self.reserved.get(instance_id).copied().unwrap_or(0)
    }

    fn zone(&self, zone_id: &str) -> Result<&Zone> {
        self.zones
            .get(zone_id)
            .ok_or_else(|| EngineError::not_found("zone", zone_id))
    }

    fn instance(&self, instance_id: &str) -> Result<&RealtimeInstance> {
        self.instances
            .get(instance_id)
            .ok_or_else(|| EngineError::not_found("instance", instance_id))
    }

    /// Can `zone` land on `instance_id`? Checks status, type and zone slots.
    fn check_target(&self, zone: &Zone, instance_id: &str) -> Result<()> {
        let instance = self.instance(instance_id)?;
        if !instance.supports(&zone.zone_type) {
            return Err(EngineError::IncompatibleZone {
                zone_id: zone.zone_id.clone(),
                zone_type: zone.zone_type.clone(),
                instance_id: instance_id.to_string(),
            });
        }
        if instance.status != InstanceStatus::Online {
            return Err(EngineError::CapacityExceeded {
                instance_id: instance_id.to_string(),
                reason: format!("instance is {}", instance.status.as_str()),
            });
        }
        let zones = self.zones_on(instance_id);
        if zones >= instance.max_zones {
            return Err(EngineError::CapacityExceeded {
                instance_id: instance_id.to_string(),
                reason: format!("{zones}/{} zones assigned", instance.max_zones),
            });
        }
        Ok(())
    }

    fn move_players(&mut self, from: &str, to: &str, count: u32) {
        if let Some(source) = self.instances.get_mut(from) {
            source.active_players = source.active_players.saturating_sub(count);
        }
        if let Some(target) = self.instances.get_mut(to) {
            target.active_players += count;
        }
    }
}

pub struct ZoneManager {
    map: RwLock<ZoneMap>,
    transfers: DashMap<String, TransferPlan>,
    evacuations: DashMap<String, EvacuationPlan>,
    load: LoadMonitor,
    alerts: Arc<AlertBus>,
    config: SharedConfig,
}

impl ZoneManager {
    pub fn new(alerts: Arc<AlertBus>, config: SharedConfig) -> Self {
        let load = {
            let cfg = config.read();
            LoadMonitor::new(
                cfg.overload_tick_threshold,
                Duration::from_secs(cfg.auto_transfer_cooldown_secs),
            )
        };
        Self {
            map: RwLock::new(ZoneMap::default()),
            transfers: DashMap::new(),
            evacuations: DashMap::new(),
            load,
            alerts,
            config,
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Registry
    // ═══════════════════════════════════════════════════════════════════

    /// Add an instance, or refresh a known one's static fields.
    #[instrument(skip(self, instance), fields(instance_id = %instance.instance_id))]
    pub fn register_instance(&self, instance: RealtimeInstance) {
        let mut map = self.map.write();
        match map.instances.get_mut(&instance.instance_id) {
            Some(existing) => {
                existing.region = instance.region;
                existing.status = instance.status;
                existing.tick_rate_hz = instance.tick_rate_hz;
                existing.max_players = instance.max_players;
                existing.max_zones = instance.max_zones;
                existing.supported_zone_types = instance.supported_zone_types;
                debug!("Instance refreshed");
            }
            None => {
                info!(region = %instance.region, tick_rate = instance.tick_rate_hz.hz(), "Instance registered");
                map.instances.insert(instance.instance_id.clone(), instance);
            }
        }
    }

    /// Add a zone. A zone that names an instance is assigned to it.
    #[instrument(skip(self, zone), fields(zone_id = %zone.zone_id))]
    pub fn register_zone(&self, mut zone: Zone) -> Result<()> {
        let target = zone.assigned_instance_id.take();
        zone.region = None;
        {
            let mut map = self.map.write();
            if let Some(target) = &target {
                map.check_target(&zone, target)?;
            }
            map.zones.entry(zone.zone_id.clone()).or_insert(zone.clone());
        }
        match target {
            Some(instance_id) => self.assign_zone(&zone.zone_id, &instance_id),
            None => Ok(()),
        }
    }

    /// Place an unassigned zone on an instance.
    ///
    /// Fails with `CapacityExceeded` when the instance already holds
    /// `max_zones` zones; it never over-assigns.
    #[instrument(skip(self))]
    pub fn assign_zone(&self, zone_id: &str, instance_id: &str) -> Result<()> {
        let mut map = self.map.write();
        let zone = map.zone(zone_id)?.clone();
        match zone.assigned_instance_id.as_deref() {
            Some(current) if current == instance_id => return Ok(()),
            Some(current) => {
                return Err(EngineError::InvalidTransition {
                    entity: "zone",
                    id: zone_id.to_string(),
                    from: current.to_string(),
                    to: instance_id.to_string(),
                })
            }
            None => {}
        }
        map.check_target(&zone, instance_id)?;

        let region = map.instance(instance_id)?.region.clone();
        if let Some(instance) = map.instances.get_mut(instance_id) {
            instance.active_players += zone.player_count;
        }
        if let Some(zone) = map.zones.get_mut(zone_id) {
            zone.assigned_instance_id = Some(instance_id.to_string());
            zone.region = Some(region);
        }
        info!(zone_id, instance_id, "Zone assigned");
        Ok(())
    }

    pub fn set_instance_status(&self, instance_id: &str, status: InstanceStatus) -> Result<RealtimeInstance> {
        let mut map = self.map.write();
        let instance = map
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| EngineError::not_found("instance", instance_id))?;
        if instance.status != status {
            info!(instance_id, from = instance.status.as_str(), to = status.as_str(), "Instance status changed");
            instance.status = status;
        }
        Ok(instance.clone())
    }

    /// Set a zone's live population; its instance's player count follows.
    pub fn set_zone_population(&self, zone_id: &str, players: u32, npcs: u32) -> Result<()> {
        let mut map = self.map.write();
        let zone = map
            .zones
            .get_mut(zone_id)
            .ok_or_else(|| EngineError::not_found("zone", zone_id))?;
        let previous = zone.player_count;
        zone.player_count = players;
        zone.npc_count = npcs;
        if let Some(instance_id) = zone.assigned_instance_id.clone() {
            if let Some(instance) = map.instances.get_mut(&instance_id) {
                instance.active_players = (instance.active_players + players).saturating_sub(previous);
            }
        }
        Ok(())
    }

    /// Read `{"zone_population": {"<zone_id>": {"players": n, "npcs": m}}}`
    /// from a component value. Unknown zones are skipped. Returns zones updated.
    pub fn apply_population(&self, value: &Value) -> usize {
        let Some(entries) = value.get("zone_population").and_then(Value::as_object) else {
            return 0;
        };
        let mut updated = 0;
        for (zone_id, entry) in entries {
            let count = |key: &str| {
                entry
                    .get(key)
                    .and_then(Value::as_u64)
                    .map(|n| n.min(u64::from(u32::MAX)) as u32)
            };
            let Some(players) = count("players") else {
                continue;
            };
            let npcs = count("npcs").unwrap_or(0);
            if self.set_zone_population(zone_id, players, npcs).is_ok() {
                updated += 1;
            }
        }
        updated
    }

    // ═══════════════════════════════════════════════════════════════════
    // Queries
    // ═══════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn zone(&self, zone_id: &str) -> Option<Zone> {
        self.map.read().zones.get(zone_id).cloned()
    }

    #[must_use]
    pub fn instance(&self, instance_id: &str) -> Option<RealtimeInstance> {
        self.map.read().instances.get(instance_id).cloned()
    }

    #[must_use]
    pub fn list_zones(&self, region: Option<&str>) -> Vec<Zone> {
        self.map
            .read()
            .zones
            .values()
            .filter(|z| region.map_or(true, |r| z.region.as_deref() == Some(r)))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn list_instances(
        &self,
        status: Option<InstanceStatus>,
        region: Option<&str>,
    ) -> Vec<RealtimeInstance> {
        self.map
            .read()
            .instances
            .values()
            .filter(|i| status.map_or(true, |s| i.status == s))
            .filter(|i| region.map_or(true, |r| i.region == r))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn zone_count(&self, instance_id: &str) -> u32 {
        self.map.read().zones_on(instance_id)
    }

    #[must_use]
    pub fn transfer_plan(&self, plan_id: &str) -> Option<TransferPlan> {
        self.transfers.get(plan_id).map(|p| p.value().clone())
    }

    /// All transfer plans, oldest first.
    #[must_use]
    pub fn transfer_plans(&self) -> Vec<TransferPlan> {
        let mut plans: Vec<TransferPlan> = self.transfers.iter().map(|p| p.value().clone()).collect();
        plans.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.plan_id.cmp(&b.plan_id)));
        plans
    }

    #[must_use]
    pub fn evacuation_plan(&self, plan_id: &str) -> Option<EvacuationPlan> {
        self.evacuations.get(plan_id).map(|p| p.value().clone())
    }

    #[must_use]
    pub fn load(&self, instance_id: &str) -> Option<LoadSnapshot> {
        self.load.snapshot(instance_id)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Load monitoring
    // ═══════════════════════════════════════════════════════════════════

    /// Feed one tick duration. Returns the automatic transfer plan if this
    /// tick tipped the instance into overload.
    pub fn report_tick(&self, instance_id: &str, tick_ms: f64) -> Result<Option<TransferPlan>> {
        let sla_ms = {
            let mut map = self.map.write();
            let instance = map
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| EngineError::not_found("instance", instance_id))?;
            instance.last_tick_ms = Some(tick_ms);
            tick_sla_ms(instance.tick_rate_hz, self.config.read().tick_sla_fraction)
        };
        metrics::record_tick(instance_id, tick_ms, tick_ms > sla_ms);

        match self.load.record(instance_id, tick_ms, sla_ms) {
            TickVerdict::Overloaded { consecutive } => {
                let reason = format!(
                    "tick {tick_ms:.1}ms over {sla_ms:.1}ms SLA for {consecutive} consecutive ticks"
                );
                match self.auto_plan(instance_id, &reason) {
                    Some(plan) => {
                        self.load.mark_auto_transfer(instance_id);
                        self.alerts.warning(
                            "zones",
                            None,
                            format!(
                                "{instance_id} overloaded ({reason}); planned transfer of {} to {}",
                                plan.zone_id, plan.target_instance_id
                            ),
                        );
                        Ok(Some(plan))
                    }
                    None => {
                        self.alerts.warning(
                            "zones",
                            None,
                            format!("{instance_id} overloaded ({reason}); no compatible target"),
                        );
                        Ok(None)
                    }
                }
            }
            TickVerdict::CoolingDown { consecutive } => {
                debug!(instance_id, consecutive, "Overloaded inside cooldown window, no auto transfer");
                Ok(None)
            }
            TickVerdict::OverSla { .. } | TickVerdict::WithinSla => Ok(None),
        }
    }

    /// Highest-population zone of `instance_id` to the least-loaded compatible instance.
    fn auto_plan(&self, instance_id: &str, reason: &str) -> Option<TransferPlan> {
        let (batch_size, interval_ms) = {
            let cfg = self.config.read();
            (cfg.transfer_batch_size, cfg.transfer_interval_ms)
        };
        let busy = self.zones_with_open_plans();
        let (zone_id, target_id) = {
            let map = self.map.read();
            let zone = map
                .zones
                .values()
                .filter(|z| z.assigned_instance_id.as_deref() == Some(instance_id))
                .filter(|z| z.status == ZoneStatus::Online && !busy.contains(&z.zone_id))
                .max_by(|a, b| {
                    a.player_count
                        .cmp(&b.player_count)
                        .then_with(|| b.zone_id.cmp(&a.zone_id))
                })?;
            let target = map
                .instances
                .values()
                .filter(|i| i.instance_id != instance_id)
                .filter(|i| map.check_target(zone, &i.instance_id).is_ok())
                .filter(|i| i.active_players + zone.player_count <= i.max_players)
                .min_by(|a, b| {
                    a.load_ratio()
                        .total_cmp(&b.load_ratio())
                        .then_with(|| a.instance_id.cmp(&b.instance_id))
                })?;
            (zone.zone_id.clone(), target.instance_id.clone())
        };

        let plan = TransferPlan::new(
            &zone_id,
            instance_id,
            &target_id,
            PlanPriority::High,
            reason,
            TransferMode::Gradual,
            batch_size,
            interval_ms,
            true,
        );
        self.transfers.insert(plan.plan_id.clone(), plan.clone());
        metrics::record_plan("auto_transfer");
        info!(plan_id = %plan.plan_id, zone_id = %zone_id, from = instance_id, to = %target_id, "Automatic transfer planned");
        Some(plan)
    }

    fn zones_with_open_plans(&self) -> Vec<String> {
        self.transfers
            .iter()
            .filter(|p| matches!(p.status, PlanStatus::Planned | PlanStatus::Executing))
            .map(|p| p.zone_id.clone())
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Transfers
    // ═══════════════════════════════════════════════════════════════════

    /// Draft a gradual transfer. Advisory until executed.
    ///
    /// Planning the same zone to the same target again returns the open plan.
    #[instrument(skip(self, reason))]
    pub fn plan_transfer(
        &self,
        zone_id: &str,
        target_instance_id: &str,
        priority: PlanPriority,
        reason: &str,
    ) -> Result<TransferPlan> {
        self.plan_transfer_with_mode(zone_id, target_instance_id, priority, reason, TransferMode::Gradual)
    }

    pub fn plan_transfer_with_mode(
        &self,
        zone_id: &str,
        target_instance_id: &str,
        priority: PlanPriority,
        reason: &str,
        mode: TransferMode,
    ) -> Result<TransferPlan> {
        if let Some(open) = self.transfers.iter().find(|p| {
            p.zone_id == zone_id && matches!(p.status, PlanStatus::Planned | PlanStatus::Executing)
        }) {
            if open.target_instance_id == target_instance_id {
                return Ok(open.value().clone());
            }
            return Err(EngineError::InvalidTransition {
                entity: "zone",
                id: zone_id.to_string(),
                from: format!("transfer plan {} open", open.plan_id),
                to: target_instance_id.to_string(),
            });
        }

        let source = {
            let map = self.map.read();
            let zone = map.zone(zone_id)?;
            let source = zone.assigned_instance_id.clone().ok_or_else(|| {
                EngineError::InvalidTransition {
                    entity: "zone",
                    id: zone_id.to_string(),
                    from: "unassigned".into(),
                    to: target_instance_id.to_string(),
                }
            })?;
            if source == target_instance_id {
                return Err(EngineError::InvalidTransition {
                    entity: "zone",
                    id: zone_id.to_string(),
                    from: source,
                    to: target_instance_id.to_string(),
                });
            }
            map.check_target(zone, target_instance_id)?;
            source
        };

        let (batch_size, interval_ms) = {
            let cfg = self.config.read();
            (cfg.transfer_batch_size, cfg.transfer_interval_ms)
        };
        let plan = TransferPlan::new(
            zone_id,
            &source,
            target_instance_id,
            priority,
            reason,
            mode,
            batch_size,
            interval_ms,
            false,
        );
        self.transfers.insert(plan.plan_id.clone(), plan.clone());
        metrics::record_plan("transfer");
        info!(plan_id = %plan.plan_id, zone_id, from = %source, to = target_instance_id, ?priority, "Transfer planned");
        Ok(plan)
    }

    /// Carry out a planned transfer. Executing a plan that is already running
    /// or completed returns its current state unchanged.
    #[instrument(skip(self))]
    pub async fn execute_transfer(&self, plan_id: &str) -> Result<TransferPlan> {
        let plan = {
            let mut plan = self
                .transfers
                .get_mut(plan_id)
                .ok_or_else(|| EngineError::not_found("transfer plan", plan_id))?;
            match plan.status {
                PlanStatus::Executing | PlanStatus::Completed => return Ok(plan.clone()),
                PlanStatus::Planned => {}
                other => {
                    return Err(EngineError::InvalidTransition {
                        entity: "transfer plan",
                        id: plan_id.to_string(),
                        from: other.to_string(),
                        to: PlanStatus::Executing.to_string(),
                    })
                }
            }
            plan.status = PlanStatus::Executing;
            plan.started_at = Some(epoch_millis());
            plan.clone()
        };

        let players = match self.begin_transfer(&plan) {
            Ok(players) => players,
            Err(e) => {
                self.finish_transfer(plan_id, PlanStatus::Failed, Some(e.to_string()))?;
                metrics::record_plan_execution("transfer", "failed");
                return Err(e);
            }
        };

        let batch = match plan.mode {
            TransferMode::Gradual => plan.batch_size,
            TransferMode::Immediate => players.max(1),
        };
        let mut remaining = players;
        while remaining > 0 {
            let moved = remaining.min(batch);
            self.map
                .write()
                .move_players(&plan.source_instance_id, &plan.target_instance_id, moved);
            remaining -= moved;
            if let Some(mut p) = self.transfers.get_mut(plan_id) {
                p.players_moved += moved;
                p.batches += 1;
            }
            metrics::record_players_moved("transfer", moved);
            debug!(plan_id, moved, remaining, "Transfer batch moved");
            if remaining > 0 {
                tokio::time::sleep(Duration::from_millis(plan.interval_ms)).await;
            }
        }

        {
            let mut map = self.map.write();
            let region = map
                .instances
                .get(&plan.target_instance_id)
                .map(|i| i.region.clone());
            if let Some(zone) = map.zones.get_mut(&plan.zone_id) {
                zone.assigned_instance_id = Some(plan.target_instance_id.clone());
                zone.region = region;
                zone.status = ZoneStatus::Online;
            }
            release(&mut map, &plan.target_instance_id);
        }
        metrics::record_plan_execution("transfer", "completed");
        info!(plan_id, zone_id = %plan.zone_id, to = %plan.target_instance_id, players, "Transfer complete");
        self.finish_transfer(plan_id, PlanStatus::Completed, None)
    }

    /// Validate, reserve the target slot and mark the zone MIGRATING.
    /// Returns the number of players to move.
    fn begin_transfer(&self, plan: &TransferPlan) -> Result<u32> {
        let mut map = self.map.write();
        let zone = map.zone(&plan.zone_id)?.clone();
        if zone.assigned_instance_id.as_deref() != Some(plan.source_instance_id.as_str()) {
            return Err(EngineError::InvalidTransition {
                entity: "zone",
                id: zone.zone_id,
                from: zone.assigned_instance_id.unwrap_or_else(|| "unassigned".into()),
                to: plan.target_instance_id.clone(),
            });
        }
        if zone.status != ZoneStatus::Online {
            return Err(EngineError::InvalidTransition {
                entity: "zone",
                id: zone.zone_id,
                from: format!("{:?}", zone.status).to_uppercase(),
                to: "MIGRATING".into(),
            });
        }
        map.check_target(&zone, &plan.target_instance_id)?;

        *map.reserved.entry(plan.target_instance_id.clone()).or_default() += 1;
        if let Some(zone) = map.zones.get_mut(&plan.zone_id) {
            zone.status = ZoneStatus::Migrating;
        }
        Ok(zone.player_count)
    }

    fn finish_transfer(&self, plan_id: &str, status: PlanStatus, failure: Option<String>) -> Result<TransferPlan> {
        let mut plan = self
            .transfers
            .get_mut(plan_id)
            .ok_or_else(|| EngineError::not_found("transfer plan", plan_id))?;
        plan.status = status;
        plan.completed_at = Some(epoch_millis());
        if let Some(reason) = failure {
            warn!(plan_id, reason = %reason, "Transfer failed");
            plan.failure = Some(reason);
        }
        Ok(plan.clone())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Evacuations
    // ═══════════════════════════════════════════════════════════════════

    /// Draft an evacuation of an ONLINE, assigned zone into another ONLINE zone.
    ///
    /// Planning the same zone to the same target again returns the open plan.
    #[instrument(skip(self, request), fields(zone_id = %request.zone_id, target = %request.target_zone_id))]
    pub fn plan_evacuation(&self, request: EvacuationRequest) -> Result<EvacuationPlan> {
        if let Some(open) = self.evacuations.iter().find(|p| {
            p.zone_id == request.zone_id && matches!(p.status, PlanStatus::Planned | PlanStatus::Executing)
        }) {
            if open.target_zone_id == request.target_zone_id {
                return Ok(open.value().clone());
            }
            return Err(EngineError::InvalidTransition {
                entity: "zone",
                id: request.zone_id.clone(),
                from: format!("evacuation plan {} open", open.plan_id),
                to: request.target_zone_id,
            });
        }
        if request.zone_id == request.target_zone_id {
            return Err(EngineError::InvalidTransition {
                entity: "zone",
                id: request.zone_id.clone(),
                from: request.zone_id.clone(),
                to: request.target_zone_id,
            });
        }
        let source_instance = {
            let map = self.map.read();
            let zone = map.zone(&request.zone_id)?;
            let target = map.zone(&request.target_zone_id)?;
            if target.assigned_instance_id.is_none() || target.status != ZoneStatus::Online {
                return Err(EngineError::InvalidTransition {
                    entity: "zone",
                    id: target.zone_id.clone(),
                    from: format!("{:?}", target.status).to_uppercase(),
                    to: "EVACUATION_TARGET".into(),
                });
            }
            match (&zone.assigned_instance_id, zone.status) {
                (Some(instance_id), ZoneStatus::Online) => instance_id.clone(),
                (None, _) => {
                    return Err(EngineError::InvalidTransition {
                        entity: "zone",
                        id: zone.zone_id.clone(),
                        from: "unassigned".into(),
                        to: "EVACUATING".into(),
                    })
                }
                (Some(_), status) => {
                    return Err(EngineError::InvalidTransition {
                        entity: "zone",
                        id: zone.zone_id.clone(),
                        from: format!("{status:?}").to_uppercase(),
                        to: "EVACUATING".into(),
                    })
                }
            }
        };

        let plan = EvacuationPlan::new(request, &source_instance);
        self.evacuations.insert(plan.plan_id.clone(), plan.clone());
        metrics::record_plan("evacuation");
        info!(plan_id = %plan.plan_id, "Evacuation planned");
        Ok(plan)
    }

    /// Move everyone out of the zone in batches. Repeat calls on a running or
    /// completed plan return its current state.
    ///
    /// The zone goes OFFLINE when empty, and its instance goes OFFLINE once it
    /// has no active players left. Past `timeout_seconds` the plan fails and
    /// the zone is left in MAINTENANCE with whoever remains.
    #[instrument(skip(self))]
    pub async fn execute_evacuation(&self, plan_id: &str) -> Result<EvacuationPlan> {
        let plan = {
            let mut plan = self
                .evacuations
                .get_mut(plan_id)
                .ok_or_else(|| EngineError::not_found("evacuation plan", plan_id))?;
            match plan.status {
                PlanStatus::Executing | PlanStatus::Completed => return Ok(plan.clone()),
                PlanStatus::Planned => {}
                other => {
                    return Err(EngineError::InvalidTransition {
                        entity: "evacuation plan",
                        id: plan_id.to_string(),
                        from: other.to_string(),
                        to: PlanStatus::Executing.to_string(),
                    })
                }
            }
            plan.status = PlanStatus::Executing;
            plan.started_at = Some(epoch_millis());
            plan.clone()
        };

        if let Some(zone) = self.map.write().zones.get_mut(&plan.zone_id) {
            zone.status = ZoneStatus::Migrating;
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(plan.timeout_seconds);

        loop {
            let (players, npcs, remaining) = {
                let mut map = self.map.write();
                let Some(zone) = map.zones.get_mut(&plan.zone_id) else {
                    break;
                };
                let players = zone.player_count.min(plan.batch_size);
                let npcs = zone.npc_count.min(plan.batch_size);
                zone.player_count -= players;
                zone.npc_count -= npcs;
                let remaining = zone.player_count + zone.npc_count;

                let target_instance = map.zones.get_mut(&plan.target_zone_id).and_then(|t| {
                    t.player_count += players;
                    t.npc_count += npcs;
                    t.assigned_instance_id.clone()
                });
                if let Some(target_instance) = target_instance {
                    map.move_players(&plan.source_instance_id, &target_instance, players);
                }
                (players, npcs, remaining)
            };

            if let Some(mut p) = self.evacuations.get_mut(plan_id) {
                p.players_moved += players;
                p.npcs_moved += npcs;
                p.batches += 1;
            }
            metrics::record_players_moved("evacuation", players);
            if plan.notify_players && players > 0 {
                self.alerts.info(
                    "zones",
                    format!(
                        "evacuating {players} players from {} to {}",
                        plan.zone_id, plan.target_zone_id
                    ),
                );
            }
            if remaining == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(self.fail_evacuation(&plan, remaining));
            }
            tokio::time::sleep(Duration::from_millis(plan.interval_ms)).await;
            if tokio::time::Instant::now() >= deadline {
                return Ok(self.fail_evacuation(&plan, remaining));
            }
        }

        let instance_offline = {
            let mut map = self.map.write();
            if let Some(zone) = map.zones.get_mut(&plan.zone_id) {
                zone.status = ZoneStatus::Offline;
            }
            match map.instances.get_mut(&plan.source_instance_id) {
                Some(instance) if instance.active_players == 0 => {
                    instance.status = InstanceStatus::Offline;
                    true
                }
                _ => false,
            }
        };
        if instance_offline {
            self.load.forget(&plan.source_instance_id);
            info!(instance_id = %plan.source_instance_id, "Instance empty after evacuation, marked offline");
        }

        metrics::record_plan_execution("evacuation", "completed");
        let mut done = match self.evacuations.get_mut(plan_id) {
            Some(p) => p,
            None => return Err(EngineError::not_found("evacuation plan", plan_id)),
        };
        done.status = PlanStatus::Completed;
        done.completed_at = Some(epoch_millis());
        info!(plan_id, players = done.players_moved, npcs = done.npcs_moved, "Evacuation complete");
        Ok(done.clone())
    }

    fn fail_evacuation(&self, plan: &EvacuationPlan, remaining: u32) -> EvacuationPlan {
        if let Some(zone) = self.map.write().zones.get_mut(&plan.zone_id) {
            zone.status = ZoneStatus::Maintenance;
        }
        let reason = format!(
            "timed out after {}s with {remaining} entities still in {}",
            plan.timeout_seconds, plan.zone_id
        );
        self.alerts.critical("zones", None, format!("evacuation {} failed: {reason}", plan.plan_id));
        metrics::record_plan_execution("evacuation", "timeout");
        match self.evacuations.get_mut(&plan.plan_id) {
            Some(mut p) => {
                p.status = PlanStatus::Failed;
                p.completed_at = Some(epoch_millis());
                p.failure = Some(reason);
                p.clone()
            }
            None => plan.clone(),
        }
    }
}

fn release(map: &mut ZoneMap, instance_id: &str) {
    if let Some(reserved) = map.reserved.get_mut(instance_id) {
        *reserved = reserved.saturating_sub(1);
        if *reserved == 0 {
            map.reserved.remove(instance_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorldSyncConfig;

    fn manager() -> ZoneManager {
        ZoneManager::new(
            Arc::new(AlertBus::default()),
            Arc::new(RwLock::new(WorldSyncConfig::default())),
        )
    }

    fn seeded() -> ZoneManager {
        let zones = manager();
        zones.register_instance(RealtimeInstance::new("rt-a", "us-east", TickRate::Hz20, 500, 2, &["city", "wild"]));
        zones.register_instance(RealtimeInstance::new("rt-b", "us-west", TickRate::Hz20, 500, 3, &["city"]));
        zones
            .register_zone(Zone::new("z-market", "Market", "city").with_population(60, 10))
            .unwrap();
        zones.assign_zone("z-market", "rt-a").unwrap();
        zones
    }

    #[test]
    fn test_tick_rate_rejects_unknown_values() {
        assert!(TickRate::try_from(45).is_err());
        let rate: TickRate = serde_json::from_str("60").unwrap();
        assert_eq!(rate, TickRate::Hz60);
        assert!(serde_json::from_str::<TickRate>("25").is_err());
    }

    #[test]
    fn test_assign_takes_region_and_players() {
        let zones = seeded();
        let zone = zones.zone("z-market").unwrap();
        assert_eq!(zone.region.as_deref(), Some("us-east"));
        assert_eq!(zones.instance("rt-a").unwrap().active_players, 60);
        assert_eq!(zones.list_zones(Some("us-east")).len(), 1);
        assert!(zones.list_zones(Some("us-west")).is_empty());
        // Re-assigning to the same instance is a no-op
        zones.assign_zone("z-market", "rt-a").unwrap();
        assert_eq!(zones.instance("rt-a").unwrap().active_players, 60);
    }

    #[test]
    fn test_assign_at_capacity_fails() {
        let zones = seeded();
        zones.register_zone(Zone::new("z-2", "Docks", "city")).unwrap();
        zones.assign_zone("z-2", "rt-a").unwrap();
        zones.register_zone(Zone::new("z-3", "Slums", "city")).unwrap();

        let err = zones.assign_zone("z-3", "rt-a").unwrap_err();
        assert!(matches!(err, EngineError::CapacityExceeded { .. }));
        assert_eq!(zones.zone_count("rt-a"), 2);
        assert!(zones.zone("z-3").unwrap().assigned_instance_id.is_none());
    }

    #[test]
    fn test_assign_incompatible_zone_type() {
        let zones = seeded();
        zones.register_zone(Zone::new("z-wild", "Badlands", "wild")).unwrap();
        let err = zones.assign_zone("z-wild", "rt-b").unwrap_err();
        assert!(matches!(err, EngineError::IncompatibleZone { .. }));
    }

    #[test]
    fn test_assigned_zone_moves_only_through_transfer() {
        let zones = seeded();
        let err = zones.assign_zone("z-market", "rt-b").unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_population_updates_follow_to_instance() {
        let zones = seeded();
        let updated = zones.apply_population(&serde_json::json!({
            "zone_population": {"z-market": {"players": 80, "npcs": 5}, "z-unknown": {"players": 1}}
        }));
        assert_eq!(updated, 1);
        assert_eq!(zones.zone("z-market").unwrap().player_count, 80);
        assert_eq!(zones.instance("rt-a").unwrap().active_players, 80);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gradual_transfer_drains_source_in_batches() {
        let zones = seeded();
        let plan = zones
            .plan_transfer("z-market", "rt-b", PlanPriority::Normal, "rebalance")
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Planned);
        // Planning is advisory
        assert_eq!(zones.zone("z-market").unwrap().assigned_instance_id.as_deref(), Some("rt-a"));
        // And idempotent
        assert_eq!(
            zones.plan_transfer("z-market", "rt-b", PlanPriority::Normal, "again").unwrap().plan_id,
            plan.plan_id
        );

        let done = zones.execute_transfer(&plan.plan_id).await.unwrap();
        assert_eq!(done.status, PlanStatus::Completed);
        assert_eq!(done.players_moved, 60);
        assert_eq!(done.batches, 3);

        let zone = zones.zone("z-market").unwrap();
        assert_eq!(zone.assigned_instance_id.as_deref(), Some("rt-b"));
        assert_eq!(zone.status, ZoneStatus::Online);
        assert_eq!(zone.region.as_deref(), Some("us-west"));
        assert_eq!(zones.instance("rt-a").unwrap().active_players, 0);
        assert_eq!(zones.instance("rt-b").unwrap().active_players, 60);

        // Executing again returns the completed plan
        let again = zones.execute_transfer(&plan.plan_id).await.unwrap();
        assert_eq!(again.players_moved, 60);
        assert_eq!(zones.instance("rt-b").unwrap().active_players, 60);
    }

    #[tokio::test]
    async fn test_immediate_transfer_moves_everyone_at_once() {
        let zones = seeded();
        let plan = zones
            .plan_transfer_with_mode("z-market", "rt-b", PlanPriority::Critical, "failover", TransferMode::Immediate)
            .unwrap();
        let done = zones.execute_transfer(&plan.plan_id).await.unwrap();
        assert_eq!(done.batches, 1);
        assert_eq!(zones.instance("rt-b").unwrap().active_players, 60);
    }

    #[tokio::test]
    async fn test_transfer_fails_when_target_filled_meanwhile() {
        let zones = manager();
        zones.register_instance(RealtimeInstance::new("rt-a", "eu", TickRate::Hz30, 500, 4, &["city"]));
        zones.register_instance(RealtimeInstance::new("rt-b", "eu", TickRate::Hz30, 500, 1, &["city"]));
        zones.register_zone(Zone::new("z-1", "One", "city")).unwrap();
        zones.register_zone(Zone::new("z-2", "Two", "city")).unwrap();
        zones.assign_zone("z-1", "rt-a").unwrap();

        let plan = zones.plan_transfer("z-1", "rt-b", PlanPriority::Low, "test").unwrap();
        zones.assign_zone("z-2", "rt-b").unwrap();

        let err = zones.execute_transfer(&plan.plan_id).await.unwrap_err();
        assert!(matches!(err, EngineError::CapacityExceeded { .. }));
        assert_eq!(zones.transfer_plan(&plan.plan_id).unwrap().status, PlanStatus::Failed);
        assert_eq!(zones.zone("z-1").unwrap().status, ZoneStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overload_plans_one_auto_transfer_per_window() {
        let zones = seeded();
        zones.register_zone(Zone::new("z-small", "Alley", "city").with_population(5, 0)).unwrap();
        zones.assign_zone("z-small", "rt-a").unwrap();

        let mut plans = Vec::new();
        for _ in 0..10 {
            plans.extend(zones.report_tick("rt-a", 58.0).unwrap());
        }
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].zone_id, "z-market");
        assert_eq!(plans[0].target_instance_id, "rt-b");
        assert!(plans[0].automatic);

        for _ in 0..10 {
            assert!(zones.report_tick("rt-a", 58.0).unwrap().is_none());
        }
        assert_eq!(zones.transfer_plans().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evacuation_empties_zone_and_instance() {
        let zones = seeded();
        zones.register_zone(Zone::new("z-safe", "Haven", "city")).unwrap();
        zones.assign_zone("z-safe", "rt-b").unwrap();

        let plan = zones
            .plan_evacuation(EvacuationRequest {
                zone_id: "z-market".into(),
                target_zone_id: "z-safe".into(),
                batch_size: 25,
                interval_ms: 500,
                notify_players: true,
                timeout_seconds: 60,
            })
            .unwrap();
        let done = zones.execute_evacuation(&plan.plan_id).await.unwrap();
        assert_eq!(done.status, PlanStatus::Completed);
        assert_eq!(done.players_moved, 60);
        assert_eq!(done.npcs_moved, 10);

        let zone = zones.zone("z-market").unwrap();
        assert_eq!(zone.status, ZoneStatus::Offline);
        assert_eq!(zone.player_count, 0);
        assert_eq!(zones.zone("z-safe").unwrap().player_count, 60);
        assert_eq!(zones.instance("rt-a").unwrap().status, InstanceStatus::Offline);
        assert_eq!(zones.instance("rt-b").unwrap().active_players, 60);
    }

    fn evacuate_market(batch_size: u32) -> EvacuationRequest {
        EvacuationRequest {
            zone_id: "z-market".into(),
            target_zone_id: "z-safe".into(),
            batch_size,
            interval_ms: 500,
            notify_players: false,
            timeout_seconds: 60,
        }
    }

    #[test]
    fn test_evacuation_requires_online_assigned_source() {
        let zones = seeded();
        zones.register_zone(Zone::new("z-safe", "Haven", "city")).unwrap();
        zones.assign_zone("z-safe", "rt-b").unwrap();
        zones.register_zone(Zone::new("z-ruins", "Ruins", "city")).unwrap();

        let err = zones
            .plan_evacuation(EvacuationRequest { zone_id: "z-ruins".into(), ..evacuate_market(10) })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        zones.map.write().zones.get_mut("z-market").unwrap().status = ZoneStatus::Migrating;
        let err = zones.plan_evacuation(evacuate_market(10)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert!(zones.evacuations.is_empty());
    }

    #[test]
    fn test_evacuation_plan_is_reused_for_same_target() {
        let zones = seeded();
        zones.register_zone(Zone::new("z-safe", "Haven", "city")).unwrap();
        zones.assign_zone("z-safe", "rt-b").unwrap();
        zones.register_zone(Zone::new("z-camp", "Camp", "city")).unwrap();
        zones.assign_zone("z-camp", "rt-b").unwrap();

        let first = zones.plan_evacuation(evacuate_market(10)).unwrap();
        let again = zones.plan_evacuation(evacuate_market(20)).unwrap();
        assert_eq!(first.plan_id, again.plan_id);
        assert_eq!(zones.evacuations.len(), 1);

        let err = zones
            .plan_evacuation(EvacuationRequest { target_zone_id: "z-camp".into(), ..evacuate_market(10) })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeat_execute_returns_running_plan() {
        let zones = seeded();
        zones.register_zone(Zone::new("z-safe", "Haven", "city")).unwrap();
        zones.assign_zone("z-safe", "rt-b").unwrap();

        let evacuation = zones.plan_evacuation(evacuate_market(25)).unwrap();
        let (done, running) = tokio::join!(zones.execute_evacuation(&evacuation.plan_id), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            zones.execute_evacuation(&evacuation.plan_id).await
        });
        let running = running.unwrap();
        assert_eq!(running.status, PlanStatus::Executing);
        assert_eq!(running.players_moved, 25);
        let done = done.unwrap();
        assert_eq!(done.status, PlanStatus::Completed);
        assert_eq!(done.players_moved, 60);

        let zones = seeded();
        let transfer = zones
            .plan_transfer("z-market", "rt-b", PlanPriority::Normal, "rebalance")
            .unwrap();
        let (done, running) = tokio::join!(zones.execute_transfer(&transfer.plan_id), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            zones.execute_transfer(&transfer.plan_id).await
        });
        let running = running.unwrap();
        assert_eq!(running.status, PlanStatus::Executing);
        assert_eq!(running.batches, 1);
        let done = done.unwrap();
        assert_eq!(done.players_moved, 60);
        assert_eq!(zones.instance("rt-b").unwrap().active_players, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evacuation_times_out() {
        let zones = seeded();
        zones.register_zone(Zone::new("z-safe", "Haven", "city")).unwrap();
        zones.assign_zone("z-safe", "rt-b").unwrap();

        let plan = zones
            .plan_evacuation(EvacuationRequest {
                zone_id: "z-market".into(),
                target_zone_id: "z-safe".into(),
                batch_size: 10,
                interval_ms: 1_000,
                notify_players: false,
                timeout_seconds: 2,
            })
            .unwrap();
        let done = zones.execute_evacuation(&plan.plan_id).await.unwrap();
        assert_eq!(done.status, PlanStatus::Failed);
        assert!(done.players_moved < 60);
        assert_eq!(zones.zone("z-market").unwrap().status, ZoneStatus::Maintenance);
        assert_eq!(zones.instance("rt-a").unwrap().status, InstanceStatus::Online);
    }
}
