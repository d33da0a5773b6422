// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-node circuit breakers for replication traffic, built on `recloser`.
//!
//! A replica that keeps timing out would otherwise cost one full network
//! timeout per state change. Once its breaker opens, pushes to it fail fast
//! and are picked up again by the resend pass after the breaker half-opens.
//!
//! States:
//! - Closed: pushes go through
//! - Open: pushes rejected without touching the transport
//! - HalfOpen: a few probe pushes allowed

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use tracing::{debug, warn};

/// Inferred circuit state, for metrics and health output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Calls in the closed-state window; half of them failing trips the breaker
    pub failure_threshold: u32,
    /// Probe calls allowed while half-open
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(10),
        }
    }
}

impl CircuitConfig {
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named circuit breaker with call accounting.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    state: AtomicU8,
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(0.5)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.success_threshold.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// State as seen by the last call through the breaker.
    ///
    /// recloser keeps its state private, so this is inferred: a rejection
    /// means open, a failure after a rejection means the probe failed.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::Acquire) {
            2 => CircuitState::Open,
            1 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        let was_open = self.state() == CircuitState::Open;

        match self.inner.call(f()).await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.set_state(CircuitState::Closed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                if !was_open {
                    warn!(circuit = %self.name, "Circuit opened, rejecting calls");
                }
                self.set_state(CircuitState::Open);
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                if was_open {
                    // A call got through an open breaker: it was a half-open probe
                    self.set_state(CircuitState::HalfOpen);
                }
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    fn set_state(&self, state: CircuitState) {
        let prev = self.state.swap(state as u8, Ordering::AcqRel);
        if prev != state as u8 {
            crate::metrics::set_circuit_state(&self.name, state as u8);
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

/// One breaker per replica node, created on first use.
pub struct NodeCircuits {
    config: CircuitConfig,
    circuits: DashMap<String, Arc<CircuitBreaker>>,
}

impl NodeCircuits {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    pub fn for_node(&self, node_id: &str) -> Arc<CircuitBreaker> {
        self.circuits
            .entry(node_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    format!("replica:{}", node_id),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Drop the breaker of an evicted node.
    pub fn remove(&self, node_id: &str) {
        self.circuits.remove(node_id);
    }

    /// Nodes whose breaker is currently open.
    #[must_use]
    pub fn open_nodes(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .circuits
            .iter()
            .filter(|e| e.value().state() == CircuitState::Open)
            .map(|e| e.key().clone())
            .collect();
        open.sort();
        open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_circuit_passes_successful_calls() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(42) }).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(cb.successes(), 1);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_circuit_tracks_failures() {
        let cb = CircuitBreaker::new("test", CircuitConfig::test());

        let result: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("boom") }).await;

        assert!(matches!(result, Err(CircuitError::Inner("boom"))));
        assert_eq!(cb.failures(), 1);
    }

    #[tokio::test]
    async fn test_circuit_rejects_after_repeated_failures() {
        let config = CircuitConfig {
            failure_threshold: 2,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        };
        let cb = CircuitBreaker::new("test", config);

        for _ in 0..4 {
            let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Err("fail") }).await;
        }
        let _: Result<i32, CircuitError<&str>> = cb.call(|| async { Ok(1) }).await;

        // Tripping depends on recloser's ring buffer; at least one call is rejected
        assert!(cb.rejections() >= 1);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_node_circuits_are_per_node() {
        let circuits = NodeCircuits::new(CircuitConfig::test());

        let a = circuits.for_node("node-a");
        let again = circuits.for_node("node-a");
        let b = circuits.for_node("node-b");

        assert!(Arc::ptr_eq(&a, &again));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "replica:node-a");

        let _: Result<(), CircuitError<&str>> = a.call(|| async { Err("down") }).await;
        assert_eq!(a.failures(), 1);
        assert_eq!(b.failures(), 0);

        circuits.remove("node-a");
        assert_eq!(circuits.for_node("node-a").calls_total(), 0);
        assert!(circuits.open_nodes().is_empty());
    }
}
