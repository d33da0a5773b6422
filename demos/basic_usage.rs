// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic world-sync-engine usage example.
//!
//! Demonstrates:
//! 1. Opening the engine over a SQLite file with two loopback replicas
//! 2. Submitting mutations, including two racing at the same base version
//! 3. Forcing a replica to drift and watching it get resolved
//! 4. Snapshot + rollback
//! 5. Zone overload → automatic transfer plan
//! 6. Displaying metrics
//! 7. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! ```

use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use serde_json::json;
use tokio::sync::watch;
use world_sync::{
    ConflictStatus, InMemoryTransport, MutationPayload, RealtimeInstance, StateComponent, TickRate,
    WorldSyncConfig, WorldSyncEngine, Zone,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║         world-sync-engine: Basic Usage Example                ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    let db_path = std::env::temp_dir().join("world_sync_demo.db");
    let _ = std::fs::remove_file(&db_path);

    let config = WorldSyncConfig {
        storage_path: Some(db_path.to_string_lossy().into_owned()),
        heartbeat_interval_ms: 200,
        detector_interval_ms: 300,
        ..Default::default()
    };
    let (_config_tx, config_rx) = watch::channel(config.clone());

    let transport = Arc::new(InMemoryTransport::new());
    let replica_a = transport.add_replica("replica-a");
    transport.add_replica("replica-b");

    let engine = WorldSyncEngine::open(config, config_rx, transport.clone()).await?;
    engine.register_node("replica-a");
    engine.register_node("replica-b");

    println!("🚀 Starting engine...");
    let restored = engine.start().await?;
    println!("   ✅ Running. Restored: {:?}", restored);

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Mutations
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Submitting mutations...");
    engine
        .submit_mutation(StateComponent::Economy, 0, MutationPayload::CounterAdd { key: "gold".into(), delta: 100 })
        .await?;
    engine
        .submit_mutation(StateComponent::World, 0, MutationPayload::CasUpdate { value: json!({"weather": "clear"}) })
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Two writers race at the same base; the loser is rebased and retried
    let base = engine.get_component_status(StateComponent::World).version;
    engine
        .submit_mutation(StateComponent::World, base, MutationPayload::CasUpdate { value: json!({"weather": "rain"}) })
        .await?;
    engine
        .submit_mutation(StateComponent::World, base, MutationPayload::CasUpdate { value: json!({"weather": "storm"}) })
        .await?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    for component in [StateComponent::World, StateComponent::Economy] {
        let status = engine.get_component_status(component);
        println!(
            "   └─ {} v{} → {} (health {:.0}, pending {})",
            component,
            status.version,
            engine.get_component_value(component),
            status.health_score,
            status.pending_mutations
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Drift and resolution
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔀 Forcing replica-a to drift on WORLD...");
    replica_a.diverge(StateComponent::World, 99, json!({"weather": "???"}));
    tokio::time::sleep(Duration::from_secs(2)).await;
    let resolved = engine.list_conflicts(Some(ConflictStatus::Resolved));
    println!("   └─ Resolved conflicts: {}", resolved.len());
    println!("   └─ Sync status: {:?}", engine.get_sync_status().status);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Snapshot + rollback
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📸 Snapshot + rollback...");
    let snapshot = engine.create_snapshot(vec!["demo".into()]).await?;
    println!("   └─ Snapshot {} ({} bytes)", snapshot.snapshot_id, snapshot.size_bytes);
    let economy = engine.get_component_status(StateComponent::Economy).version;
    engine
        .submit_mutation(StateComponent::Economy, economy, MutationPayload::CounterAdd { key: "gold".into(), delta: -90 })
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("   └─ After spend: {}", engine.get_component_value(StateComponent::Economy));
    let report = engine.rollback(&snapshot.snapshot_id).await?;
    println!("   └─ Rolled back: {:?}", report.restored);
    println!("   └─ After rollback: {}", engine.get_component_value(StateComponent::Economy));

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Zones
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🗺️  Zone balancing...");
    engine.register_instance(RealtimeInstance::new("rt-nyc-01", "us-east", TickRate::Hz20, 500, 4, &["city"]));
    engine.register_instance(RealtimeInstance::new("rt-nyc-02", "us-east", TickRate::Hz20, 500, 4, &["city"]));
    engine.register_zone(Zone::new("z-harbor", "Harbor", "city").with_population(180, 40))?;
    engine.assign_zone("z-harbor", "rt-nyc-02")?;

    for _ in 0..10 {
        if let Some(plan) = engine.report_tick("rt-nyc-02", 58.0)? {
            println!("   └─ Auto plan {}: {} → {}", plan.plan_id, plan.zone_id, plan.target_instance_id);
            let done = engine.execute_transfer(&plan.plan_id).await?;
            println!("   └─ {:?}, {} players moved", done.status, done.players_moved);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Health + metrics
    // ─────────────────────────────────────────────────────────────────────────
    let health = engine.health_check().await;
    println!("\n🩺 Health: healthy={} phase={} digest={}", health.healthy, health.phase, &health.world_digest[..12]);

    println!("\n🔔 Alerts:");
    for alert in engine.alerts(None) {
        println!("   └─ [{}] {}: {}", alert.severity.as_str(), alert.source, alert.message);
    }

    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    if let Some(snapshot) = engine.shutdown().await {
        println!("   └─ Final snapshot {}", snapshot.snapshot_id);
    }
    println!("   ✅ Shutdown complete! Phase: {}", engine.phase());

    let _ = std::fs::remove_file(&db_path);

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = Vec::new();

    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        let rendered = match value {
            DebugValue::Counter(v) => format!("{} = {}", label_str, v),
            DebugValue::Gauge(v) => format!("{} = {:.2}", label_str, v.into_inner()),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                format!("{} count={} avg={:.6}s", label_str, count, avg)
            }
        };
        lines.push(format!("{}{}", key.name(), rendered));
    }

    lines.sort();
    for line in lines {
        println!("   └─ {}", line);
    }
}
