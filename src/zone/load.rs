// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-instance tick accounting for automatic load balancing.
//!
//! An instance is overloaded after `threshold` consecutive ticks over its
//! SLA. Each overload resets the streak; automatic transfers are further
//! limited to one per instance per cooldown window.

use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use super::TickRate;

/// Tick budget for an instance: the tick period scaled by `fraction`.
///
/// 20 Hz at 0.9 gives 45 ms.
#[must_use]
pub fn tick_sla_ms(rate: TickRate, fraction: f64) -> f64 {
    1_000.0 / f64::from(rate.hz()) * fraction
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum TickVerdict {
    WithinSla,
    OverSla { consecutive: u32 },
    /// Streak reached the threshold and the cooldown allows a transfer
    Overloaded { consecutive: u32 },
    /// Streak reached the threshold inside the cooldown window
    CoolingDown { consecutive: u32 },
}

#[derive(Debug, Clone, Default)]
struct InstanceLoad {
    consecutive_over: u32,
    last_tick_ms: f64,
    /// Mean of the ticks in the current over-SLA streak
    streak_mean_ms: f64,
    last_auto_transfer: Option<Instant>,
}

/// Snapshot of an instance's tick health.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadSnapshot {
    pub consecutive_over_sla: u32,
    pub last_tick_ms: f64,
    pub streak_mean_ms: f64,
    pub cooling_down: bool,
}

pub struct LoadMonitor {
    threshold: u32,
    cooldown: Duration,
    instances: DashMap<String, InstanceLoad>,
}

impl LoadMonitor {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            instances: DashMap::new(),
        }
    }

    pub fn record(&self, instance_id: &str, tick_ms: f64, sla_ms: f64) -> TickVerdict {
        let mut load = self.instances.entry(instance_id.to_string()).or_default();
        load.last_tick_ms = tick_ms;

        if tick_ms <= sla_ms {
            load.consecutive_over = 0;
            load.streak_mean_ms = 0.0;
            return TickVerdict::WithinSla;
        }

        load.consecutive_over += 1;
        let n = f64::from(load.consecutive_over);
        load.streak_mean_ms += (tick_ms - load.streak_mean_ms) / n;
        let consecutive = load.consecutive_over;
        if consecutive < self.threshold {
            return TickVerdict::OverSla { consecutive };
        }

        load.consecutive_over = 0;
        let cooling = load
            .last_auto_transfer
            .is_some_and(|at| at.elapsed() < self.cooldown);
        if cooling {
            TickVerdict::CoolingDown { consecutive }
        } else {
            TickVerdict::Overloaded { consecutive }
        }
    }

    /// Start the cooldown window for `instance_id`.
    pub fn mark_auto_transfer(&self, instance_id: &str) {
        self.instances
            .entry(instance_id.to_string())
            .or_default()
            .last_auto_transfer = Some(Instant::now());
    }

    #[must_use]
    pub fn snapshot(&self, instance_id: &str) -> Option<LoadSnapshot> {
        self.instances.get(instance_id).map(|l| LoadSnapshot {
            consecutive_over_sla: l.consecutive_over,
            last_tick_ms: l.last_tick_ms,
            streak_mean_ms: l.streak_mean_ms,
            cooling_down: l
                .last_auto_transfer
                .is_some_and(|at| at.elapsed() < self.cooldown),
        })
    }

    pub fn forget(&self, instance_id: &str) {
        self.instances.remove(instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sla_from_tick_rate() {
        assert_eq!(tick_sla_ms(TickRate::Hz20, 0.9), 45.0);
        assert!((tick_sla_ms(TickRate::Hz60, 0.9) - 15.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_streak_resets_on_good_tick() {
        let monitor = LoadMonitor::new(3, Duration::from_secs(300));
        assert_eq!(monitor.record("rt", 50.0, 45.0), TickVerdict::OverSla { consecutive: 1 });
        assert_eq!(monitor.record("rt", 50.0, 45.0), TickVerdict::OverSla { consecutive: 2 });
        assert_eq!(monitor.record("rt", 40.0, 45.0), TickVerdict::WithinSla);
        assert_eq!(monitor.record("rt", 50.0, 45.0), TickVerdict::OverSla { consecutive: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_limits_auto_transfers() {
        let monitor = LoadMonitor::new(2, Duration::from_secs(300));
        monitor.record("rt", 58.0, 45.0);
        assert_eq!(monitor.record("rt", 58.0, 45.0), TickVerdict::Overloaded { consecutive: 2 });
        monitor.mark_auto_transfer("rt");

        monitor.record("rt", 58.0, 45.0);
        assert_eq!(monitor.record("rt", 58.0, 45.0), TickVerdict::CoolingDown { consecutive: 2 });
        assert!(monitor.snapshot("rt").unwrap().cooling_down);

        tokio::time::advance(Duration::from_secs(301)).await;
        monitor.record("rt", 58.0, 45.0);
        assert_eq!(monitor.record("rt", 58.0, 45.0), TickVerdict::Overloaded { consecutive: 2 });
    }
}
