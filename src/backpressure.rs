// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mutation queue backpressure.
//!
//! Producers are never blocked by snapshots or slow replicas, but a queue
//! that keeps growing means the drainer cannot keep up. Past the critical
//! tier new submissions are rejected instead of growing the durable log
//! without bound.
//!
//! # Example
//!
//! ```
//! use world_sync::BackpressureLevel;
//!
//! let level = BackpressureLevel::from_queue(500, 10_000);
//! assert_eq!(level, BackpressureLevel::Normal);
//! assert!(level.should_accept_writes());
//!
//! let level = BackpressureLevel::from_queue(9_300, 10_000);
//! assert_eq!(level, BackpressureLevel::Critical);
//! assert!(!level.should_accept_writes());
//! ```

/// Queue pressure tier.
///
/// - **Normal** (< 70%)
/// - **Warn** (70-80%): log and alert
/// - **Throttle** (80-90%): accept, drainer runs without idle waits
/// - **Critical** (90-95%): reject submissions
/// - **Emergency** (95-98%): reject submissions
/// - **Shutdown** (> 98%): reject submissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackpressureLevel {
    Normal = 0,
    Warn = 1,
    Throttle = 2,
    Critical = 3,
    Emergency = 4,
    Shutdown = 5,
}

impl BackpressureLevel {
    /// Level from a pressure ratio (0.0 → 1.0)
    #[must_use]
    pub fn from_pressure(pressure: f64) -> Self {
        match pressure {
            p if p < 0.70 => Self::Normal,
            p if p < 0.80 => Self::Warn,
            p if p < 0.90 => Self::Throttle,
            p if p < 0.95 => Self::Critical,
            p if p < 0.98 => Self::Emergency,
            _ => Self::Shutdown,
        }
    }

    /// Level from queue depth against the configured maximum.
    #[must_use]
    pub fn from_queue(depth: usize, max_depth: usize) -> Self {
        if max_depth == 0 {
            return Self::Normal;
        }
        Self::from_pressure(depth as f64 / max_depth as f64)
    }

    #[must_use]
    pub fn should_accept_writes(&self) -> bool {
        matches!(self, Self::Normal | Self::Warn | Self::Throttle)
    }

    /// Whether the drainer should skip its idle wait between batches.
    #[must_use]
    pub fn drain_eagerly(&self) -> bool {
        *self >= Self::Throttle
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Normal => "Normal operation",
            Self::Warn => "Warning - queue filling up",
            Self::Throttle => "Throttling - drainer running hot",
            Self::Critical => "Critical - submissions rejected",
            Self::Emergency => "Emergency - submissions rejected",
            Self::Shutdown => "Shutdown - queue saturated",
        }
    }
}

impl std::fmt::Display for BackpressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_level_thresholds() {
        assert_eq!(BackpressureLevel::from_pressure(0.0), BackpressureLevel::Normal);
        assert_eq!(BackpressureLevel::from_pressure(0.69), BackpressureLevel::Normal);
        assert_eq!(BackpressureLevel::from_pressure(0.70), BackpressureLevel::Warn);
        assert_eq!(BackpressureLevel::from_pressure(0.80), BackpressureLevel::Throttle);
        assert_eq!(BackpressureLevel::from_pressure(0.90), BackpressureLevel::Critical);
        assert_eq!(BackpressureLevel::from_pressure(0.95), BackpressureLevel::Emergency);
        assert_eq!(BackpressureLevel::from_pressure(0.98), BackpressureLevel::Shutdown);
        assert_eq!(BackpressureLevel::from_pressure(1.5), BackpressureLevel::Shutdown);
    }

    #[test]
    fn test_from_queue() {
        assert_eq!(BackpressureLevel::from_queue(0, 100), BackpressureLevel::Normal);
        assert_eq!(BackpressureLevel::from_queue(85, 100), BackpressureLevel::Throttle);
        assert_eq!(BackpressureLevel::from_queue(100, 100), BackpressureLevel::Shutdown);
        // Unbounded queue
        assert_eq!(BackpressureLevel::from_queue(1_000_000, 0), BackpressureLevel::Normal);
    }

    #[test]
    fn test_should_accept_writes() {
        assert!(BackpressureLevel::Normal.should_accept_writes());
        assert!(BackpressureLevel::Throttle.should_accept_writes());
        assert!(!BackpressureLevel::Critical.should_accept_writes());
        assert!(!BackpressureLevel::Shutdown.should_accept_writes());
    }

    #[test]
    fn test_drain_eagerly_from_throttle() {
        assert!(!BackpressureLevel::Warn.drain_eagerly());
        assert!(BackpressureLevel::Throttle.drain_eagerly());
        assert!(BackpressureLevel::Emergency.drain_eagerly());
    }
}
