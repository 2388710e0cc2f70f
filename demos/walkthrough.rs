// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Telemetry substrate walkthrough.
//!
//! Demonstrates:
//! 1. Building the substrate from a flat config map
//! 2. Creating a SQLite schema and writing readings through the retry engine
//! 3. Cached queries and write-driven invalidation across both cache tiers
//! 4. Registering export artifacts and running daily retention
//! 5. Health snapshot and captured metrics
//! 6. Clean shutdown
//!
//! Everything runs in a temp directory; the shared cache tier is in-memory.
//!
//! # Run
//!
//! ```bash
//! cargo run --example walkthrough
//! ```

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use telemetry_substrate::pool::SqlConnectionFactory;
use telemetry_substrate::retention::{ArtifactRecord, SqlArtifactStore};
use telemetry_substrate::storage::{InMemorySharedCache, SharedCacheClient};
use telemetry_substrate::{Collaborators, Substrate, SubstrateConfig, SubstrateError};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install()?;

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║           telemetry-substrate: Walkthrough                    ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and build
    // ─────────────────────────────────────────────────────────────────────────
    let workdir = tempfile::tempdir()?;
    let exports = workdir.path().join("exports");
    std::fs::create_dir_all(&exports)?;
    let db_url = format!("sqlite://{}?mode=rwc", workdir.path().join("telemetry.db").display());

    println!("📦 Building substrate in {}", workdir.path().display());
    let config = SubstrateConfig::from_flat_map([
        ("pool.size".to_string(), "4".into()),
        ("pool.max_overflow".to_string(), "2".into()),
        ("cache.prefix".to_string(), "demo:".into()),
        ("retention.root".to_string(), exports.display().to_string().into()),
        ("retention.rules.csv".to_string(), "3".into()),
    ])?;

    let artifacts = Arc::new(SqlArtifactStore::connect(&db_url).await?);
    let shared: Arc<dyn SharedCacheClient> = Arc::new(InMemorySharedCache::new());
    let collaborators = Collaborators::new(artifacts.clone()).with_shared_cache(Some(shared));
    let substrate = Substrate::new(config, SqlConnectionFactory::new(&db_url), collaborators)?;
    substrate.start()?;
    println!("   ✅ State: {}", substrate.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Schema and writes
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📝 Writing readings...");
    substrate
        .write("create_schema", &[], |mut conn| async move {
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS reading (device_id TEXT NOT NULL, power REAL NOT NULL)",
            )
            .execute(&mut *conn)
            .await?;
            Ok::<_, SubstrateError>(())
        })
        .await?;

    for (device, power) in [("meter-1", 230.5), ("meter-2", 118.0), ("plug-7", 4.2)] {
        insert_reading(&substrate, device, power).await?;
        println!("   ✅ {device}: {power} W");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Cached queries
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🔍 Querying total power...");
    for round in 1..=2 {
        let total = total_power(&substrate).await?;
        let stats = substrate.cache().stats();
        println!(
            "   round {round}: {total:.1} W (fast hits {}, shared hits {}, misses {})",
            stats.fast_hits, stats.shared_hits, stats.misses
        );
    }

    insert_reading(&substrate, "meter-3", 61.0).await?;
    let total = total_power(&substrate).await?;
    println!("   after write: {total:.1} W (cache invalidated, re-read from SQLite)");

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Retention
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🗂️  Registering export artifacts...");
    let now = Utc::now();
    for age_days in [1, 2, 5, 9] {
        let id = uuid::Uuid::new_v4().to_string();
        let path = exports.join(format!("{id}.csv"));
        std::fs::write(&path, "device_id,power\nmeter-1,230.5\n")?;
        let record =
            ArtifactRecord::new(&id, &path, "csv", 30, now - ChronoDuration::days(age_days));
        artifacts.upsert(&record).await?;
        println!("   📄 {id} ({age_days} days old)");
    }

    let report = substrate.scheduler().force_daily_maintenance().await?;
    println!(
        "   ✅ expiry assigned {}, deleted {}, expiring soon {}",
        report.expiry_assigned, report.deleted, report.marked_expiring
    );
    let remaining = std::fs::read_dir(&exports)?.count();
    println!("   {remaining} export file(s) left on disk");

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Health and metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🩺 Health snapshot:");
    println!("{}", serde_json::to_string_pretty(&substrate.health())?);

    println!("\n📊 Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    substrate.shutdown().await;
    println!("   ✅ State: {}\n", substrate.state());
    Ok(())
}

async fn insert_reading(
    substrate: &Substrate<SqlConnectionFactory>,
    device: &str,
    power: f64,
) -> Result<(), SubstrateError> {
    substrate
        .write("insert_reading", &["query:reading:*"], |mut conn| {
            let device = device.to_string();
            async move {
                sqlx::query("INSERT INTO reading (device_id, power) VALUES (?, ?)")
                    .bind(device)
                    .bind(power)
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, SubstrateError>(())
            }
        })
        .await
}

async fn total_power(substrate: &Substrate<SqlConnectionFactory>) -> Result<f64, SubstrateError> {
    substrate
        .query("SELECT SUM(power) FROM reading", &(), |mut conn| async move {
            let row: (f64,) = sqlx::query_as("SELECT SUM(power) FROM reading")
                .fetch_one(&mut *conn)
                .await?;
            Ok::<_, SubstrateError>(row.0)
        })
        .await
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines: Vec<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, value)| {
            let (_, key) = composite_key.into_parts();
            let labels: Vec<_> =
                key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let label_str = if labels.is_empty() {
                String::new()
            } else {
                format!("{{{}}}", labels.join(","))
            };
            let rendered = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.0}", v.into_inner()),
                DebugValue::Histogram(samples) => {
                    let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                    format!("n={} sum={sum:.4}", samples.len())
                }
            };
            format!("   {}{label_str} = {rendered}", key.name())
        })
        .collect();
    lines.sort();
    for line in lines {
        println!("{line}");
    }
}
