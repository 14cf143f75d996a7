use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use pigtrack_core::config::DetectorConfig;
use pigtrack_core::dedup::make_dedup_key;
use pigtrack_core::engine::DetectionEngine;
use pigtrack_core::store::TrackStore;
use tracing::{debug, error, info};

/// Periodic scheduler: every poll it lists the pigs active in the lookback
/// window and runs the engine over each, sequentially, so per-pig state
/// writes never race. Decisions with a notification are enqueued; the
/// outbox's dedup index decides whether the row is new.
pub struct DetectorWorker {
    store: Arc<dyn TrackStore>,
    engine: DetectionEngine,
    cfg: DetectorConfig,
}

impl DetectorWorker {
    pub fn new(store: Arc<dyn TrackStore>, engine: DetectionEngine, cfg: DetectorConfig) -> Self {
        Self { store, engine, cfg }
    }

    /// One scheduling pass. Returns how many notifications were enqueued.
    pub async fn tick(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let since = now - Duration::minutes(self.cfg.active_lookback_min);
        let pig_ids = self.store.active_pigs(since).await?;
        debug!(count = pig_ids.len(), "active pigs");

        let mut enqueued = 0;
        for pig_id in pig_ids {
            let snapshot = match self.engine.process_pig(&pig_id, "", now).await {
                Ok(s) => s,
                Err(e) => {
                    error!(pig = %pig_id, error = %e, "engine tick failed");
                    continue;
                }
            };
            let Some(notif) = snapshot.notif else {
                continue;
            };
            let Some(dedup_key) = make_dedup_key(&snapshot) else {
                continue;
            };
            match self
                .store
                .enqueue(&dedup_key, &pig_id, notif.label(), &snapshot.payload())
                .await
            {
                Ok(true) => {
                    info!(pig = %pig_id, notif = notif.label(), key = %dedup_key, "enqueued");
                    enqueued += 1;
                }
                Ok(false) => {
                    debug!(pig = %pig_id, key = %dedup_key, "already enqueued");
                }
                Err(e) => {
                    error!(pig = %pig_id, error = %e, "enqueue failed");
                }
            }
        }
        Ok(enqueued)
    }

    /// Run until `shutdown` flips, one tick per poll interval.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(poll_sec = self.cfg.poll_sec, "detector worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let now = Utc::now();
            if let Err(e) = self.tick(now).await {
                error!(error = %e, "detector tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(self.cfg.poll_sec)) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("detector worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pigtrack_core::config::EngineConfig;
    use pigtrack_core::store_memory::MemoryStore;
    use pigtrack_core::types::{ApprovalStatus, OutboxStatus, PosSample, Poi};
    use std::collections::HashMap;

    fn t(hh: u32, mm: u32, ss: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 14, hh, mm, ss).unwrap()
    }

    fn poi(tag: &str, kp: f64) -> Poi {
        Poi {
            tag: tag.to_string(),
            valve_type: "Mainline Valve".to_string(),
            gc: None,
            kp: Some(kp),
            legacy_route: "R".to_string(),
        }
    }

    async fn worker_with_route() -> (Arc<MemoryStore>, DetectorWorker) {
        let store = Arc::new(MemoryStore::new());
        store
            .set_reference(
                HashMap::new(),
                vec![poi("V1", 10.0), poi("V2", 11.0), poi("END", 12.0)],
                vec![],
            )
            .await;
        let engine = DetectionEngine::new(store.clone(), EngineConfig::default());
        let worker = DetectorWorker::new(store.clone(), engine, DetectorConfig::default());
        (store, worker)
    }

    fn stopped_on_v1(now: DateTime<Utc>) -> Vec<PosSample> {
        vec![
            PosSample::at_kp(now - Duration::seconds(300), 10.000),
            PosSample::at_kp(now - Duration::seconds(180), 10.005),
            PosSample::at_kp(now - Duration::seconds(60), 10.010),
            PosSample::at_kp(now, 10.010),
        ]
    }

    #[tokio::test]
    async fn tick_enqueues_pending_rows() {
        let (store, worker) = worker_with_route().await;
        let now = t(8, 0, 0);
        store.set_telemetry("PIG_001", stopped_on_v1(now)).await;

        assert_eq!(worker.tick(now).await.unwrap(), 1);

        let items = store.outbox_items().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].notif_type, "POI Passage");
        assert_eq!(items[0].pig_id, "PIG_001");
        assert_eq!(items[0].status, OutboxStatus::New);
        assert_eq!(items[0].approval_status, ApprovalStatus::Pending);
        assert_eq!(items[0].payload["Notification Type"], "POI Passage");
    }

    #[tokio::test]
    async fn repeat_decisions_deduplicate() {
        let (store, worker) = worker_with_route().await;
        let t1 = t(8, 0, 0);
        store.set_telemetry("PIG_001", stopped_on_v1(t1)).await;
        assert_eq!(worker.tick(t1).await.unwrap(), 1);

        // One minute later the pig is still parked on the same valve: the
        // engine decides POI Passage again, the outbox refuses the repeat.
        let t2 = t1 + Duration::minutes(1);
        store.set_telemetry("PIG_001", stopped_on_v1(t2)).await;
        assert_eq!(worker.tick(t2).await.unwrap(), 0);
        assert_eq!(store.outbox_items().await.len(), 1);
    }

    #[tokio::test]
    async fn quiet_pigs_produce_nothing() {
        let (store, worker) = worker_with_route().await;
        let now = t(8, 0, 0);
        // Telemetry too old for the active window.
        store
            .set_telemetry(
                "PIG_OLD",
                vec![PosSample::at_kp(now - Duration::days(3), 10.5)],
            )
            .await;
        assert_eq!(worker.tick(now).await.unwrap(), 0);
        assert!(store.outbox_items().await.is_empty());
    }

    #[tokio::test]
    async fn each_active_pig_gets_its_own_tick() {
        let (store, worker) = worker_with_route().await;
        let now = t(8, 0, 0);
        store.set_telemetry("PIG_001", stopped_on_v1(now)).await;
        // Second pig mid-route, away from every POI: its first decision is
        // the periodic update.
        store
            .set_telemetry(
                "PIG_002",
                vec![
                    PosSample::at_kp(now - Duration::seconds(300), 10.500),
                    PosSample::at_kp(now, 10.510),
                ],
            )
            .await;

        assert_eq!(worker.tick(now).await.unwrap(), 2);
        let items = store.outbox_items().await;
        let types: Vec<&str> = items.iter().map(|i| i.notif_type.as_str()).collect();
        assert!(types.contains(&"POI Passage"));
        assert!(types.contains(&"30 Min Update"));
    }
}
