// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # World Sync Engine
//!
//! Keeps the shared state of a live game world consistent across replicas
//! while realtime instances host zones and move players between them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Ingest Layer                         │
//! │  • submit_mutation(): CAS ops against one component        │
//! │  • Durable mutation log before Ok is returned              │
//! │  • Backpressure from queue depth                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    (drainer, one op per component)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   StateStore (canonical)                    │
//! │  • Six components, versioned, SHA-256 digests              │
//! │  • Typed handlers per mutation kind                        │
//! │  • Stale base version → retry with backoff → conflict      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    (StateChanged → replication)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 SyncCoordinator + replicas                  │
//! │  • Heartbeats, eviction, per-node circuit breakers         │
//! │  • Drift detection → ConflictResolver → AlertBus           │
//! └─────────────────────────────────────────────────────────────┘
//!
//!  SnapshotManager: quiesce, capture, retention, rollback
//!  ZoneManager:     tick SLA monitoring, transfers, evacuations
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tokio::sync::watch;
//! use world_sync::{
//!     InMemoryTransport, MutationPayload, StateComponent, WorldSyncConfig, WorldSyncEngine,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = WorldSyncConfig {
//!         storage_path: Some("/var/lib/world-sync/engine.db".into()),
//!         ..Default::default()
//!     };
//!     let (_tx, rx) = watch::channel(config.clone());
//!     let engine = WorldSyncEngine::open(config, rx, Arc::new(InMemoryTransport::new()))
//!         .await
//!         .expect("Failed to open stores");
//!
//!     engine.start().await.expect("Failed to start");
//!
//!     let version = engine.get_component_status(StateComponent::World).version;
//!     engine
//!         .submit_mutation(
//!             StateComponent::World,
//!             version,
//!             MutationPayload::CasUpdate { value: json!({"weather": "storm"}) },
//!         )
//!         .await
//!         .expect("Failed to submit");
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: The [`WorldSyncEngine`] coordinating every component
//! - [`store`]: Canonical component state and mutation handlers
//! - [`queue`]: Mutation queue and durable log
//! - [`conflict`]: Drift detection and resolution
//! - [`sync`]: Replica roster, heartbeats, replication
//! - [`snapshot`]: Snapshots, retention, rollback
//! - [`zone`]: Realtime instances, zone transfers, evacuations
//! - [`resilience`]: Retry and circuit breakers
//! - [`backpressure`]: Queue pressure levels

pub mod alerts;
pub mod backpressure;
pub mod component;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod resilience;
pub mod snapshot;
pub mod store;
pub mod sync;
pub mod zone;

pub use alerts::{Alert, AlertBus, AlertSeverity};
pub use backpressure::BackpressureLevel;
pub use component::{MutationKind, MutationOp, MutationPayload, StateComponent};
pub use config::WorldSyncConfig;
pub use conflict::{ConflictRecord, ConflictStatus, ResolutionStrategy};
pub use engine::{EnginePhase, EngineState, HealthCheck, RestoreReport, SyncStatusReport, WorldSyncEngine};
pub use error::{EngineError, Result, StorageError};
pub use metrics::LatencyTimer;
pub use resilience::retry::RetryConfig;
pub use snapshot::{RollbackReport, Snapshot, SnapshotSummary};
pub use store::{ComponentState, ComponentStatus};
pub use sync::{InMemoryTransport, ReplicaTransport, SyncNode, SyncStatus};
pub use zone::plan::{EvacuationPlan, EvacuationRequest, PlanPriority, PlanStatus, TransferPlan};
pub use zone::{InstanceStatus, RealtimeInstance, TickRate, Zone, ZoneStatus};
