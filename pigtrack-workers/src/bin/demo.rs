//! End-to-end demo on the in-memory store: seeds a short route and a moving
//! pig, runs one detector tick, approves the resulting row, and "delivers"
//! it by printing what the sender would post. Useful for a quick look at
//! the payload shape without a database or an ingest endpoint.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use pigtrack_core::config::{DetectorConfig, EngineConfig};
use pigtrack_core::engine::DetectionEngine;
use pigtrack_core::store::TrackStore;
use pigtrack_core::store_memory::MemoryStore;
use pigtrack_core::types::{ApprovalDecision, Poi, PosSample};
use pigtrack_workers::detector::DetectorWorker;
use tracing_subscriber::EnvFilter;

fn poi(tag: &str, kp: f64) -> Poi {
    Poi {
        tag: tag.to_string(),
        valve_type: "Mainline Valve".to_string(),
        gc: None,
        kp: Some(kp),
        legacy_route: "Route_Demo".to_string(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let store = Arc::new(MemoryStore::new());
    store
        .set_reference(
            HashMap::new(),
            vec![poi("V1", 10.0), poi("V2", 11.0), poi("END", 12.0)],
            vec![],
        )
        .await;

    let now = Utc::now();
    store
        .set_telemetry(
            "PIG_001",
            vec![
                PosSample::at_kp(now - Duration::minutes(35), 9.660),
                PosSample::at_kp(now - Duration::minutes(25), 9.900),
                PosSample::at_kp(now - Duration::minutes(12), 10.212),
                PosSample::at_kp(now - Duration::minutes(5), 10.380),
                PosSample::at_kp(now - Duration::minutes(1), 10.476),
                PosSample::at_kp(now, 10.500),
            ],
        )
        .await;

    let engine = DetectionEngine::new(store.clone(), EngineConfig::default());
    let detector = DetectorWorker::new(store.clone(), engine, DetectorConfig::default());
    let enqueued = detector.tick(now).await?;
    tracing::info!(enqueued, "detector tick finished");

    for pending in store.list_waiting_for_approval(10).await? {
        store
            .decide_approval(pending.id, &pending.token, ApprovalDecision::Approved, "demo")
            .await?;
    }

    for item in store.claim(10, "demo-sender").await? {
        println!("Idempotency-Key: {}", item.dedup_key);
        println!("{}", serde_json::to_string_pretty(&item.payload)?);
        store.ack_sent(&[item.id]).await?;
    }

    Ok(())
}
