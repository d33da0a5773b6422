// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable FIFO of pending compare-and-swap ops.
//!
//! One lane per component. A lane hands out at most one op at a time, so
//! ops against the same component apply in enqueue order; lanes are
//! independent of each other.
//!
//! ```text
//! enqueue ──► log.append ──► lane[WORLD]   [op3, op2, op1] ──► drainer
//!                            lane[ECONOMY] [op5, op4]      ──►
//!                                                    ▲
//!                 VersionConflict: rebase + backoff ─┘ (front of lane)
//! ```
//!
//! Snapshots quiesce the queue with [`MutationQueue::pause`] +
//! [`MutationQueue::wait_idle`]. Only dequeue stops; `enqueue` keeps working.

pub mod log;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backpressure::BackpressureLevel;
use crate::component::{MutationOp, StateComponent};
use crate::error::{EngineError, Result};
use crate::metrics;
use crate::resilience::retry::RetryConfig;

pub use log::{LogStats, LoggedMutation, MemoryMutationLog, MutationLog, SqliteMutationLog};

const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);

struct Queued {
    op: MutationOp,
    not_before: Instant,
}

#[derive(Default)]
struct Lane {
    ops: VecDeque<Queued>,
    in_flight: bool,
}

/// What happened to an op that lost a CAS race.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Back at the front of its lane with a new base version.
    Requeued { base_version: u64, retries: u32, delay: Duration },
    /// Retry ceiling reached; the op left the queue.
    Exhausted(MutationOp),
}

/// Queue health signals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub in_flight: usize,
    pub throughput_per_minute: f64,
    pub backlog_minutes: f64,
    /// Share of apply attempts in the last minute that succeeded (1.0 when idle)
    pub success_rate: f64,
    pub paused: bool,
    #[serde(skip)]
    pub backpressure: BackpressureLevel,
}

pub struct MutationQueue {
    lanes: Mutex<BTreeMap<StateComponent, Lane>>,
    known: DashSet<String>,
    log: Arc<dyn MutationLog>,
    retry: RwLock<RetryConfig>,
    max_depth: AtomicUsize,
    depth: AtomicUsize,
    in_flight: AtomicUsize,
    pause_depth: AtomicUsize,
    idle: Notify,
    ready: Notify,
    outcomes: Mutex<VecDeque<(Instant, bool)>>,
}

impl MutationQueue {
    pub fn new(log: Arc<dyn MutationLog>, max_depth: usize, retry: RetryConfig) -> Self {
        Self {
            lanes: Mutex::new(BTreeMap::new()),
            known: DashSet::new(),
            log,
            retry: RwLock::new(retry),
            max_depth: AtomicUsize::new(max_depth),
            depth: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            pause_depth: AtomicUsize::new(0),
            idle: Notify::new(),
            ready: Notify::new(),
            outcomes: Mutex::new(VecDeque::new()),
        }
    }

    #[must_use]
    pub fn log(&self) -> &Arc<dyn MutationLog> {
        &self.log
    }

    /// Apply new limits from a config update.
    pub fn set_limits(&self, max_depth: usize, retry: RetryConfig) {
        self.max_depth.store(max_depth, Ordering::Release);
        *self.retry.write() = retry;
    }

    #[must_use]
    pub fn backpressure(&self) -> BackpressureLevel {
        BackpressureLevel::from_queue(self.len(), self.max_depth.load(Ordering::Acquire))
    }

    /// Accept an op. Returns `false` if an op with this id was already accepted.
    ///
    /// The op is durable before this returns `Ok`.
    #[tracing::instrument(skip(self, op), fields(op_id = %op.op_id, component = %op.component))]
    pub async fn enqueue(&self, op: MutationOp) -> Result<bool> {
        op.validate()?;

        if self.known.contains(&op.op_id) {
            debug!("Op already queued");
            return Ok(false);
        }

        let level = self.backpressure();
        metrics::set_backpressure_level(level as u8);
        if !level.should_accept_writes() {
            warn!(depth = self.len(), %level, "Rejecting submission under backpressure");
            return Err(EngineError::Backpressure(level.description().to_string()));
        }

        if !self.log.append(&op).await? {
            debug!("Op already in durable log");
            return Ok(false);
        }

        self.push_back(op);
        Ok(true)
    }

    /// Re-queue ops recovered from the durable log, without appending them again.
    pub fn restore_pending(&self, ops: Vec<MutationOp>) -> usize {
        let mut restored = 0;
        for op in ops {
            if self.known.contains(&op.op_id) {
                continue;
            }
            self.push_back(op);
            restored += 1;
        }
        if restored > 0 {
            info!(restored, "Re-queued pending ops from mutation log");
        }
        restored
    }

    fn push_back(&self, op: MutationOp) {
        self.known.insert(op.op_id.clone());
        let component = op.component;
        self.lanes.lock().entry(component).or_default().ops.push_back(Queued {
            op,
            not_before: Instant::now(),
        });
        let depth = self.depth.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::set_queue_depth(depth);
        self.ready.notify_one();
    }

    /// Up to `max` ready ops, oldest first, at most one per component.
    ///
    /// Returns nothing while the queue is paused.
    pub fn dequeue_batch(&self, max: usize) -> Vec<MutationOp> {
        if self.is_paused() || max == 0 {
            return Vec::new();
        }
        let now = Instant::now();
        let mut lanes = self.lanes.lock();

        let mut ready: Vec<(i64, StateComponent)> = lanes
            .iter()
            .filter(|(_, lane)| !lane.in_flight)
            .filter_map(|(c, lane)| {
                lane.ops
                    .front()
                    .filter(|q| q.not_before <= now)
                    .map(|q| (q.op.enqueued_at, *c))
            })
            .collect();
        ready.sort();
        ready.truncate(max);

        let mut batch = Vec::with_capacity(ready.len());
        for (_, component) in ready {
            if let Some(lane) = lanes.get_mut(&component) {
                if let Some(queued) = lane.ops.pop_front() {
                    lane.in_flight = true;
                    self.in_flight.fetch_add(1, Ordering::AcqRel);
                    batch.push(queued.op);
                }
            }
        }
        batch
    }

    /// Earliest time a backed-off op becomes ready, if any lane is waiting.
    #[must_use]
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.lanes
            .lock()
            .values()
            .filter(|l| !l.in_flight)
            .filter_map(|l| l.ops.front().map(|q| q.not_before))
            .min()
    }

    /// The op applied at `version`.
    pub async fn complete(&self, op: &MutationOp, version: u64) {
        if let Err(e) = self.log.mark_committed(&op.op_id, version).await {
            // Apply already happened; a restart may re-queue it and the CAS check rejects the duplicate
            warn!(op_id = %op.op_id, error = %e, "Failed to mark op committed");
            metrics::record_log_error("mark_committed");
        }
        self.record_outcome(true);
        self.finish(op);
    }

    /// The op lost a CAS race against `actual`. Rebase and back off, or give up.
    pub async fn retry(&self, op: &MutationOp, actual: u64) -> RetryOutcome {
        let next = op.rebased(actual);
        self.record_outcome(false);
        metrics::record_mutation_retry(op.component);

        let retry = self.retry.read().clone();
        let exhausted = retry
            .max_retries
            .is_some_and(|max| next.retries as usize > max);

        if exhausted {
            if let Err(e) = self.log.mark_escalated(&op.op_id).await {
                warn!(op_id = %op.op_id, error = %e, "Failed to mark op escalated");
                metrics::record_log_error("mark_escalated");
            }
            metrics::record_mutation_escalated(op.component);
            warn!(
                op_id = %op.op_id,
                component = %op.component,
                retries = op.retries,
                "Op exhausted its retries"
            );
            self.finish(op);
            return RetryOutcome::Exhausted(next);
        }

        if let Err(e) = self.log.record_retry(&next).await {
            warn!(op_id = %op.op_id, error = %e, "Failed to persist retry");
            metrics::record_log_error("record_retry");
        }

        let delay = retry.delay_for(next.retries);
        let outcome = RetryOutcome::Requeued {
            base_version: next.base_version,
            retries: next.retries,
            delay,
        };
        debug!(op_id = %op.op_id, base = actual, retries = next.retries, ?delay, "Requeued op after conflict");

        {
            let mut lanes = self.lanes.lock();
            let lane = lanes.entry(op.component).or_default();
            lane.ops.push_front(Queued {
                op: next,
                not_before: Instant::now() + delay,
            });
            lane.in_flight = false;
        }
        self.release_in_flight();
        outcome
    }

    /// The op can never apply (bad payload). Drop it and mark it in the log.
    pub async fn reject(&self, op: &MutationOp, reason: &EngineError) {
        warn!(op_id = %op.op_id, component = %op.component, error = %reason, "Rejected op");
        if let Err(e) = self.log.mark_rejected(&op.op_id).await {
            warn!(op_id = %op.op_id, error = %e, "Failed to mark op rejected");
            metrics::record_log_error("mark_rejected");
        }
        self.record_outcome(false);
        self.finish(op);
    }

    fn finish(&self, op: &MutationOp) {
        self.known.remove(&op.op_id);
        if let Some(lane) = self.lanes.lock().get_mut(&op.component) {
            lane.in_flight = false;
        }
        let depth = self
            .depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| Some(d.saturating_sub(1)))
            .unwrap_or(0)
            .saturating_sub(1);
        metrics::set_queue_depth(depth);
        self.release_in_flight();
    }

    fn release_in_flight(&self) {
        let prev = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if prev <= 1 {
            self.idle.notify_waiters();
        }
        self.ready.notify_one();
    }

    fn record_outcome(&self, success: bool) {
        let now = Instant::now();
        let mut outcomes = self.outcomes.lock();
        outcomes.push_back((now, success));
        while outcomes
            .front()
            .is_some_and(|(t, _)| now.duration_since(*t) > THROUGHPUT_WINDOW)
        {
            outcomes.pop_front();
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // QUIESCE
    // ═══════════════════════════════════════════════════════════════════════

    /// Stop handing out ops until the guard drops. Enqueue is unaffected.
    pub fn pause(&self) -> PauseGuard<'_> {
        self.pause_depth.fetch_add(1, Ordering::AcqRel);
        PauseGuard { queue: self }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.pause_depth.load(Ordering::Acquire) > 0
    }

    /// Wait for in-flight ops to finish, up to `budget`.
    pub async fn wait_idle(&self, budget: Duration) -> Result<()> {
        let deadline = Instant::now() + budget;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(EngineError::SnapshotPauseTimeout {
                    budget_ms: budget.as_millis() as u64,
                    in_flight: self.in_flight(),
                });
            }
        }
    }

    /// Resolves when new work may be ready.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }

    // ═══════════════════════════════════════════════════════════════════════
    // STATS
    // ═══════════════════════════════════════════════════════════════════════

    /// Accepted ops not yet committed, escalated or rejected.
    #[must_use]
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn pending_for(&self, component: StateComponent) -> usize {
        self.lanes
            .lock()
            .get(&component)
            .map(|lane| lane.ops.len() + usize::from(lane.in_flight))
            .unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let now = Instant::now();
        let (applied, total) = {
            let outcomes = self.outcomes.lock();
            outcomes
                .iter()
                .filter(|(t, _)| now.duration_since(*t) <= THROUGHPUT_WINDOW)
                .fold((0usize, 0usize), |(ok, all), (_, s)| (ok + usize::from(*s), all + 1))
        };
        let depth = self.len();
        let throughput = applied as f64;
        let backlog_minutes = depth as f64 / throughput.max(1.0);
        metrics::set_backlog_minutes(backlog_minutes);

        QueueStats {
            depth,
            in_flight: self.in_flight(),
            throughput_per_minute: throughput,
            backlog_minutes,
            success_rate: if total == 0 { 1.0 } else { applied as f64 / total as f64 },
            paused: self.is_paused(),
            backpressure: self.backpressure(),
        }
    }
}

/// Resumes dequeue when dropped.
pub struct PauseGuard<'a> {
    queue: &'a MutationQueue,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        self.queue.pause_depth.fetch_sub(1, Ordering::AcqRel);
        self.queue.ready.notify_one();
    }
}
