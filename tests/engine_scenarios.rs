// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end scenarios through the public engine API.
//!
//! Everything runs in-process: memory log, memory snapshot store and the
//! loopback replica transport. No external services needed.
//!
//! ```bash
//! cargo test --test engine_scenarios
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use world_sync::{
    ConflictStatus, EngineError, EnginePhase, EvacuationRequest, InMemoryTransport, MutationPayload,
    PlanPriority, PlanStatus, RealtimeInstance, StateComponent, TickRate, WorldSyncConfig,
    WorldSyncEngine, Zone,
};

// =============================================================================
// Helpers
// =============================================================================

fn engine_with(config: WorldSyncConfig) -> (WorldSyncEngine, Arc<InMemoryTransport>) {
    let transport = Arc::new(InMemoryTransport::new());
    let (_tx, rx) = watch::channel(config.clone());
    let engine = WorldSyncEngine::new(config, rx, transport.clone());
    (engine, transport)
}

fn engine() -> (WorldSyncEngine, Arc<InMemoryTransport>) {
    engine_with(WorldSyncConfig::default())
}

/// Submit and drain one CAS update at the current version.
async fn commit(engine: &WorldSyncEngine, component: StateComponent, payload: MutationPayload) -> u64 {
    let base = engine.get_component_status(component).version;
    engine.submit_mutation(component, base, payload).await.unwrap();
    let report = engine.drain_once().await;
    assert_eq!(report.applied, 1, "expected the op to apply at base {base}");
    engine.get_component_status(component).version
}

// =============================================================================
// Mutations
// =============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_mutations_at_same_base_both_land() {
    let (engine, _) = engine();
    for i in 0..10 {
        commit(&engine, StateComponent::World, MutationPayload::CasUpdate { value: json!({"day": i}) }).await;
    }
    assert_eq!(engine.get_component_status(StateComponent::World).version, 10);

    engine
        .submit_mutation(StateComponent::World, 10, MutationPayload::CasUpdate { value: json!({"weather": "rain"}) })
        .await
        .unwrap();
    engine
        .submit_mutation(StateComponent::World, 10, MutationPayload::CasUpdate { value: json!({"weather": "snow"}) })
        .await
        .unwrap();

    let first = engine.drain_once().await;
    assert_eq!(first.applied, 1);
    assert_eq!(engine.get_component_status(StateComponent::World).version, 11);

    // Loser hits a version conflict and is rebased onto 11
    let second = engine.drain_once().await;
    assert_eq!(second.requeued, 1);
    assert_eq!(engine.get_component_status(StateComponent::World).version, 11);

    tokio::time::advance(Duration::from_secs(1)).await;
    let third = engine.drain_once().await;
    assert_eq!(third.applied, 1);

    let status = engine.get_component_status(StateComponent::World);
    assert_eq!(status.version, 12);
    assert_eq!(status.pending_mutations, 0);
    assert_eq!(engine.get_component_value(StateComponent::World), json!({"weather": "snow"}));
    assert!(engine.list_conflicts(None).is_empty());
}

#[tokio::test]
async fn running_engine_drains_and_replicates_in_background() {
    let (engine, transport) = engine();
    let replica = transport.add_replica("replica-1");
    engine.register_node("replica-1");
    engine.start().await.unwrap();
    assert_eq!(engine.phase(), EnginePhase::Running);

    engine
        .submit_mutation(StateComponent::Economy, 0, MutationPayload::CounterAdd { key: "gold".into(), delta: 25 })
        .await
        .unwrap();

    let expected = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(state) = replica.state(StateComponent::Economy) {
                if state.version == 1 {
                    return state;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("replica never received the update");

    assert_eq!(expected.value, json!({"gold": 25}));
    assert_eq!(expected.digest, engine.get_component_status(StateComponent::Economy).digest);

    let snapshot = engine.shutdown().await.expect("final snapshot");
    assert_eq!(snapshot.component_versions.get(&StateComponent::Economy), Some(&1));
    assert_eq!(engine.phase(), EnginePhase::Stopped);
}

// =============================================================================
// Conflicts
// =============================================================================

#[tokio::test]
async fn resolved_drift_is_not_detected_again() {
    let (engine, transport) = engine();
    let replica = transport.add_replica("replica-1");
    engine.register_node("replica-1");

    for delta in 1..=3 {
        commit(&engine, StateComponent::World, MutationPayload::CounterAdd { key: "tick".into(), delta }).await;
    }
    replica.diverge(StateComponent::World, 40, json!({"tick": -1}));

    engine.heartbeat_once().await;
    let report = engine.detect_once();
    assert_eq!(report.raised.len(), 1);
    let open = engine.list_conflicts(Some(ConflictStatus::Pending));
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].component, StateComponent::World);

    let outcomes = engine.resolve_pending().await;
    assert_eq!(outcomes.len(), 1);

    engine.heartbeat_once().await;
    let report = engine.detect_once();
    assert!(report.raised.is_empty());
    assert!(!report.drift(StateComponent::World).unwrap().exceeded());

    let still_open: Vec<_> = engine
        .list_conflicts(None)
        .into_iter()
        .filter(|c| c.component == StateComponent::World && c.is_open())
        .collect();
    assert!(still_open.is_empty());
    assert_eq!(engine.list_conflicts(Some(ConflictStatus::Resolved)).len(), 1);
    assert_eq!(
        replica.state(StateComponent::World).unwrap().digest,
        engine.get_component_status(StateComponent::World).digest
    );
}

// =============================================================================
// Snapshots
// =============================================================================

#[tokio::test]
async fn rollback_twice_gives_identical_versions() {
    let (engine, _) = engine();
    commit(&engine, StateComponent::Factions, MutationPayload::CasUpdate { value: json!({"red": 1}) }).await;
    let snapshot = engine.create_snapshot(vec!["before-war".into()]).await.unwrap();
    commit(&engine, StateComponent::Factions, MutationPayload::CasUpdate { value: json!({"red": 0, "blue": 9}) }).await;

    engine.rollback(&snapshot.snapshot_id).await.unwrap();
    let first: Vec<u64> = StateComponent::ALL
        .iter()
        .map(|c| engine.get_component_status(*c).version)
        .collect();
    assert_eq!(engine.get_component_value(StateComponent::Factions), json!({"red": 1}));

    engine.rollback(&snapshot.snapshot_id).await.unwrap();
    let second: Vec<u64> = StateComponent::ALL
        .iter()
        .map(|c| engine.get_component_status(*c).version)
        .collect();
    assert_eq!(first, second);

    let err = engine.rollback("missing").await.unwrap_err();
    assert!(matches!(err, EngineError::RollbackConflict { .. }));
}

// =============================================================================
// Zones
// =============================================================================

fn seed_zones(engine: &WorldSyncEngine) {
    engine.register_instance(RealtimeInstance::new("rt-nyc-01", "us-east", TickRate::Hz20, 500, 4, &["city", "dungeon"]));
    engine.register_instance(RealtimeInstance::new("rt-nyc-02", "us-east", TickRate::Hz20, 500, 2, &["city", "dungeon"]));
    engine
        .register_zone(Zone::new("z-harbor", "Harbor", "city").with_population(120, 30))
        .unwrap();
    engine
        .register_zone(Zone::new("z-crypt", "Crypt", "dungeon").with_population(15, 40))
        .unwrap();
    engine.assign_zone("z-harbor", "rt-nyc-02").unwrap();
    engine.assign_zone("z-crypt", "rt-nyc-02").unwrap();
}

#[test]
fn assign_to_full_instance_is_refused() {
    let (engine, _) = engine();
    seed_zones(&engine);
    engine.register_zone(Zone::new("z-docks", "Docks", "city")).unwrap();

    let err = engine.assign_zone("z-docks", "rt-nyc-02").unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded { .. }));

    let on_nyc_02 = engine
        .list_zones(Some("us-east"))
        .into_iter()
        .filter(|z| z.assigned_instance_id.as_deref() == Some("rt-nyc-02"))
        .count();
    assert_eq!(on_nyc_02, 2);
}

#[tokio::test(start_paused = true)]
async fn sustained_overload_plans_exactly_one_transfer() {
    let (engine, _) = engine();
    seed_zones(&engine);

    let mut plans = Vec::new();
    for _ in 0..10 {
        plans.extend(engine.report_tick("rt-nyc-02", 58.0).unwrap());
    }
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].zone_id, "z-harbor");
    assert_eq!(plans[0].target_instance_id, "rt-nyc-01");
    assert!(plans[0].automatic);

    // Still inside the five minute window
    tokio::time::advance(Duration::from_secs(60)).await;
    for _ in 0..10 {
        assert!(engine.report_tick("rt-nyc-02", 58.0).unwrap().is_none());
    }

    let done = engine.execute_transfer(&plans[0].plan_id).await.unwrap();
    assert_eq!(done.status, PlanStatus::Completed);
    let harbor = engine
        .list_zones(None)
        .into_iter()
        .find(|z| z.zone_id == "z-harbor")
        .unwrap();
    assert_eq!(harbor.assigned_instance_id.as_deref(), Some("rt-nyc-01"));
}

#[tokio::test(start_paused = true)]
async fn evacuation_moves_everyone_and_notifies() {
    let (engine, _) = engine();
    seed_zones(&engine);
    engine.register_zone(Zone::new("z-refuge", "Refuge", "city")).unwrap();
    engine.assign_zone("z-refuge", "rt-nyc-01").unwrap();

    let plan = engine
        .plan_evacuation(EvacuationRequest {
            zone_id: "z-harbor".into(),
            target_zone_id: "z-refuge".into(),
            batch_size: 50,
            interval_ms: 200,
            notify_players: true,
            timeout_seconds: 30,
        })
        .unwrap();
    let done = engine.execute_evacuation(&plan.plan_id).await.unwrap();
    assert_eq!(done.status, PlanStatus::Completed);
    assert_eq!(done.players_moved, 120);
    assert!(!engine.alerts(None).is_empty());
}

#[tokio::test]
async fn manual_transfer_plan_is_reused_for_same_target() {
    let (engine, _) = engine();
    seed_zones(&engine);

    let first = engine
        .plan_transfer("z-crypt", "rt-nyc-01", PlanPriority::High, "maintenance")
        .unwrap();
    let again = engine
        .plan_transfer("z-crypt", "rt-nyc-01", PlanPriority::High, "maintenance")
        .unwrap();
    assert_eq!(first.plan_id, again.plan_id);
}
