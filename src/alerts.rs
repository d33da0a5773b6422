// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single feed of operator-facing warnings.
//!
//! Alerts are kept in a bounded in-memory ring (oldest dropped first) and
//! fanned out to live subscribers over a broadcast channel. A subscriber that
//! falls behind loses alerts, not the engine.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::component::{epoch_millis, StateComponent};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl AlertSeverity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub alert_id: u64,
    pub severity: AlertSeverity,
    /// Subsystem that raised it ("resolver", "sync", "zones", ...)
    pub source: &'static str,
    pub component: Option<StateComponent>,
    pub message: String,
    pub raised_at: i64,
}

pub struct AlertBus {
    capacity: usize,
    feed: Mutex<VecDeque<Alert>>,
    next_id: Mutex<u64>,
    tx: broadcast::Sender<Alert>,
}

impl AlertBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            capacity,
            feed: Mutex::new(VecDeque::with_capacity(capacity)),
            next_id: Mutex::new(1),
            tx,
        }
    }

    pub fn raise(
        &self,
        severity: AlertSeverity,
        source: &'static str,
        component: Option<StateComponent>,
        message: impl Into<String>,
    ) -> Alert {
        let alert_id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };
        let alert = Alert {
            alert_id,
            severity,
            source,
            component,
            message: message.into(),
            raised_at: epoch_millis(),
        };

        match severity {
            AlertSeverity::Info => info!(source, component = ?component, message = %alert.message, "Alert"),
            AlertSeverity::Warning => warn!(source, component = ?component, message = %alert.message, "Alert"),
            AlertSeverity::Critical => error!(source, component = ?component, message = %alert.message, "Alert"),
        }
        metrics::record_alert(severity.as_str(), source);

        {
            let mut feed = self.feed.lock();
            if feed.len() >= self.capacity {
                feed.pop_front();
            }
            feed.push_back(alert.clone());
        }
        // Nobody listening is fine; the feed keeps it
        let _ = self.tx.send(alert.clone());
        alert
    }

    pub fn info(&self, source: &'static str, message: impl Into<String>) -> Alert {
        self.raise(AlertSeverity::Info, source, None, message)
    }

    pub fn warning(
        &self,
        source: &'static str,
        component: Option<StateComponent>,
        message: impl Into<String>,
    ) -> Alert {
        self.raise(AlertSeverity::Warning, source, component, message)
    }

    pub fn critical(
        &self,
        source: &'static str,
        component: Option<StateComponent>,
        message: impl Into<String>,
    ) -> Alert {
        self.raise(AlertSeverity::Critical, source, component, message)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    /// Retained alerts, oldest first, optionally only one severity.
    #[must_use]
    pub fn recent(&self, severity: Option<AlertSeverity>) -> Vec<Alert> {
        self.feed
            .lock()
            .iter()
            .filter(|a| severity.map_or(true, |s| a.severity == s))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.feed.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_is_bounded() {
        let bus = AlertBus::new(3);
        for i in 0..5 {
            bus.info("test", format!("alert {i}"));
        }
        let recent = bus.recent(None);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "alert 2");
        assert_eq!(recent[2].alert_id, 5);
    }

    #[test]
    fn test_filter_by_severity() {
        let bus = AlertBus::default();
        bus.info("zones", "evacuation batch 1");
        bus.critical("resolver", Some(StateComponent::World), "needs operator");
        let critical = bus.recent(Some(AlertSeverity::Critical));
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].component, Some(StateComponent::World));
    }

    #[tokio::test]
    async fn test_subscribers_receive_alerts() {
        let bus = AlertBus::default();
        let mut rx = bus.subscribe();
        bus.warning("sync", None, "replica n1 unreachable");
        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.severity, AlertSeverity::Warning);
        assert_eq!(alert.source, "sync");
    }
}
