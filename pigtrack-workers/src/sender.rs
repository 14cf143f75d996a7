use std::sync::Arc;

use chrono::{Duration, Utc};
use pigtrack_core::config::SenderConfig;
use pigtrack_core::store::TrackStore;
use pigtrack_core::types::{DeadAck, RetryAck};
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::ingest::{truncate, IngestClient, MAX_ERROR_LEN};

/// Fixed retry schedule, seconds. Attempts beyond the schedule reuse the
/// last entry.
pub const BACKOFF_SCHEDULE_SEC: [i64; 6] = [10, 30, 60, 120, 300, 600];

/// Base backoff before the next attempt, given how many attempts have
/// already failed.
pub fn backoff_base_seconds(prev_attempts: i32) -> i64 {
    let idx = (prev_attempts.max(0) as usize).min(BACKOFF_SCHEDULE_SEC.len() - 1);
    BACKOFF_SCHEDULE_SEC[idx]
}

/// Base plus uniform jitter below a tenth of the base, to spread retry
/// bursts across workers.
fn backoff_with_jitter_seconds(prev_attempts: i32) -> i64 {
    let base = backoff_base_seconds(prev_attempts);
    base + rand::thread_rng().gen_range(0..(base / 10).max(1))
}

/// One sender worker: claims due APPROVED rows in batches, posts them with
/// their dedup key as the idempotency header, and acks the outcomes. Safe
/// to run in parallel with any number of siblings; the claim's row locks
/// keep their batches disjoint.
pub struct SenderWorker {
    store: Arc<dyn TrackStore>,
    client: Arc<dyn IngestClient>,
    cfg: SenderConfig,
}

impl SenderWorker {
    pub fn new(store: Arc<dyn TrackStore>, client: Arc<dyn IngestClient>, cfg: SenderConfig) -> Self {
        Self { store, client, cfg }
    }

    /// Claim and process one batch. Returns the number of items claimed, so
    /// the loop can idle when the queue is drained.
    pub async fn run_once(&self) -> anyhow::Result<usize> {
        let items = self
            .store
            .claim(self.cfg.batch_size, &self.cfg.worker_name)
            .await?;
        if items.is_empty() {
            return Ok(0);
        }
        debug!(count = items.len(), "claimed batch");

        let mut sent = Vec::new();
        let mut retries = Vec::new();
        let mut deads = Vec::new();

        for item in &items {
            match self.client.post(&item.dedup_key, &item.payload).await {
                Ok(()) => {
                    info!(id = item.id, key = %item.dedup_key, "sent");
                    sent.push(item.id);
                }
                Err(e) => {
                    let error = truncate(&e.to_string(), MAX_ERROR_LEN);
                    let attempt_count = item.attempt_count + 1;
                    if attempt_count >= self.cfg.max_attempts {
                        warn!(id = item.id, key = %item.dedup_key, error = %error, "dead-lettered");
                        deads.push(DeadAck {
                            id: item.id,
                            attempt_count,
                            error,
                        });
                    } else {
                        let backoff = backoff_with_jitter_seconds(item.attempt_count);
                        warn!(
                            id = item.id,
                            key = %item.dedup_key,
                            attempt = attempt_count,
                            backoff_sec = backoff,
                            error = %error,
                            "retry scheduled"
                        );
                        retries.push(RetryAck {
                            id: item.id,
                            attempt_count,
                            next_attempt_at: Utc::now() + Duration::seconds(backoff),
                            error,
                        });
                    }
                }
            }
        }

        if !sent.is_empty() {
            self.store.ack_sent(&sent).await?;
        }
        if !retries.is_empty() {
            self.store.ack_retry(&retries).await?;
        }
        if !deads.is_empty() {
            self.store.ack_dead(&deads).await?;
        }
        Ok(items.len())
    }

    /// Run until `shutdown` flips. The current batch is always acked before
    /// the signal is honored; rows a killed worker leaves in SENDING are
    /// recovered by the reclaim sweep of any surviving worker.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(worker = %self.cfg.worker_name, url = %self.cfg.ingest_url, "sender worker started");
        let mut loops: u64 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            loops += 1;
            if self.cfg.reclaim_every_loops > 0 && loops % self.cfg.reclaim_every_loops == 0 {
                match self
                    .store
                    .reclaim_stale(Duration::seconds(self.cfg.stale_sending_sec))
                    .await
                {
                    Ok(0) => {}
                    Ok(n) => info!(reclaimed = n, "returned stale SENDING rows to RETRY"),
                    Err(e) => error!(error = %e, "reclaim sweep failed"),
                }
            }

            let processed = match self.run_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "sender batch failed");
                    0
                }
            };

            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(self.cfg.sleep_sec)) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        info!(worker = %self.cfg.worker_name, "sender worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SendError;
    use async_trait::async_trait;
    use pigtrack_core::store_memory::MemoryStore;
    use pigtrack_core::types::{ApprovalDecision, OutboxStatus};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted client: pops one outcome per post, succeeds once the script
    /// runs out. Records every idempotency key it sees.
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<(), SendError>>>,
        seen_keys: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<(), SendError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                seen_keys: Mutex::new(Vec::new()),
            }
        }

        fn always_ok() -> Self {
            Self::new(Vec::new())
        }

        fn keys(&self) -> Vec<String> {
            self.seen_keys.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl IngestClient for ScriptedClient {
        async fn post(
            &self,
            dedup_key: &str,
            _payload: &serde_json::Value,
        ) -> Result<(), SendError> {
            self.seen_keys.lock().unwrap().push(dedup_key.to_string());
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn cfg(max_attempts: i32) -> SenderConfig {
        SenderConfig {
            ingest_url: "http://localhost:8010/ingest".to_string(),
            worker_name: "sender-test".to_string(),
            batch_size: 5,
            sleep_sec: 1,
            max_attempts,
            stale_sending_sec: 300,
            reclaim_every_loops: 10,
            request_timeout_sec: 10,
        }
    }

    fn http_err(status: u16) -> SendError {
        SendError::Status {
            status,
            body: "boom".to_string(),
        }
    }

    async fn approved_row(store: &MemoryStore, key: &str) -> i64 {
        store
            .enqueue(key, "PIG_001", "POI Passage", &json!({"Pig ID": "PIG_001"}))
            .await
            .unwrap();
        let item = store
            .outbox_items()
            .await
            .into_iter()
            .find(|i| i.dedup_key == key)
            .unwrap();
        store
            .decide_approval(item.id, &item.approval_token, ApprovalDecision::Approved, "ops")
            .await
            .unwrap();
        item.id
    }

    #[test]
    fn backoff_follows_the_schedule() {
        assert_eq!(backoff_base_seconds(0), 10);
        assert_eq!(backoff_base_seconds(1), 30);
        assert_eq!(backoff_base_seconds(2), 60);
        assert_eq!(backoff_base_seconds(3), 120);
        assert_eq!(backoff_base_seconds(4), 300);
        assert_eq!(backoff_base_seconds(5), 600);
        assert_eq!(backoff_base_seconds(12), 600);
    }

    #[test]
    fn jitter_stays_below_a_tenth_of_base() {
        for _ in 0..200 {
            let v = backoff_with_jitter_seconds(4);
            assert!((300..330).contains(&v), "jittered backoff out of range: {v}");
        }
    }

    #[tokio::test]
    async fn success_marks_sent_with_idempotency_key() {
        let store = Arc::new(MemoryStore::new());
        let id = approved_row(&store, "key-1").await;
        let client = Arc::new(ScriptedClient::always_ok());
        let worker = SenderWorker::new(store.clone(), client.clone(), cfg(5));

        assert_eq!(worker.run_once().await.unwrap(), 1);

        let item = store.outbox_items().await[0].clone();
        assert_eq!(item.id, id);
        assert_eq!(item.status, OutboxStatus::Sent);
        assert!(item.sent_at.is_some());
        assert_eq!(client.keys(), vec!["key-1".to_string()]);
    }

    #[tokio::test]
    async fn failures_walk_the_retry_schedule_then_succeed() {
        let store = Arc::new(MemoryStore::new());
        let id = approved_row(&store, "key-1").await;
        let client = Arc::new(ScriptedClient::new(vec![
            Err(http_err(500)),
            Err(http_err(502)),
        ]));
        let worker = SenderWorker::new(store.clone(), client.clone(), cfg(5));

        // First failure: attempt 1, scheduled ~10s out.
        worker.run_once().await.unwrap();
        let item = store.outbox_items().await[0].clone();
        assert_eq!(item.status, OutboxStatus::Retry);
        assert_eq!(item.attempt_count, 1);
        assert_eq!(item.last_error.as_deref(), Some("HTTP 500: boom"));
        let delay = (item.next_attempt_at - Utc::now()).num_seconds();
        assert!((8..=11).contains(&delay), "first backoff ~10s, got {delay}");

        // Second failure: attempt 2, scheduled ~30s out.
        store.set_next_attempt_at(id, Utc::now() - Duration::seconds(1)).await;
        worker.run_once().await.unwrap();
        let item = store.outbox_items().await[0].clone();
        assert_eq!(item.status, OutboxStatus::Retry);
        assert_eq!(item.attempt_count, 2);
        let delay = (item.next_attempt_at - Utc::now()).num_seconds();
        assert!((28..=33).contains(&delay), "second backoff ~30s, got {delay}");

        // Script exhausted: the third attempt lands.
        store.set_next_attempt_at(id, Utc::now() - Duration::seconds(1)).await;
        worker.run_once().await.unwrap();
        let item = store.outbox_items().await[0].clone();
        assert_eq!(item.status, OutboxStatus::Sent);
        assert_eq!(item.attempt_count, 2);
        // Every delivery attempt carried the same idempotency key.
        assert_eq!(client.keys(), vec!["key-1"; 3]);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_the_row() {
        let store = Arc::new(MemoryStore::new());
        approved_row(&store, "key-1").await;
        let client = Arc::new(ScriptedClient::new(vec![
            Err(http_err(503)),
            Err(http_err(503)),
        ]));
        let worker = SenderWorker::new(store.clone(), client, cfg(2));

        worker.run_once().await.unwrap();
        let id = store.outbox_items().await[0].id;
        store.set_next_attempt_at(id, Utc::now() - Duration::seconds(1)).await;
        worker.run_once().await.unwrap();

        let item = store.outbox_items().await[0].clone();
        assert_eq!(item.status, OutboxStatus::Dead);
        assert_eq!(item.attempt_count, 2);
        assert!(item.last_error.is_some());
        assert_eq!(item.locked_by, None);
    }

    #[tokio::test]
    async fn rejected_rows_are_invisible_to_the_sender() {
        let store = Arc::new(MemoryStore::new());
        store
            .enqueue("key-1", "PIG_001", "Gap Start", &json!({}))
            .await
            .unwrap();
        let item = store.outbox_items().await[0].clone();
        store
            .decide_approval(item.id, &item.approval_token, ApprovalDecision::Rejected, "ops")
            .await
            .unwrap();

        let client = Arc::new(ScriptedClient::always_ok());
        let worker = SenderWorker::new(store.clone(), client.clone(), cfg(5));
        assert_eq!(worker.run_once().await.unwrap(), 0);
        assert!(client.keys().is_empty());
    }

    #[tokio::test]
    async fn mixed_batch_acks_each_outcome() {
        let store = Arc::new(MemoryStore::new());
        approved_row(&store, "key-ok").await;
        approved_row(&store, "key-fail").await;
        let client = Arc::new(ScriptedClient::new(vec![Ok(()), Err(http_err(500))]));
        let worker = SenderWorker::new(store.clone(), client, cfg(5));

        assert_eq!(worker.run_once().await.unwrap(), 2);
        let items = store.outbox_items().await;
        assert_eq!(items[0].status, OutboxStatus::Sent);
        assert_eq!(items[1].status, OutboxStatus::Retry);
    }

    #[tokio::test]
    async fn oversized_error_strings_are_truncated() {
        let store = Arc::new(MemoryStore::new());
        approved_row(&store, "key-1").await;
        let client = Arc::new(ScriptedClient::new(vec![Err(SendError::Transport(
            "x".repeat(5000),
        ))]));
        let worker = SenderWorker::new(store.clone(), client, cfg(5));

        worker.run_once().await.unwrap();
        let item = store.outbox_items().await[0].clone();
        assert_eq!(item.last_error.unwrap().len(), MAX_ERROR_LEN);
    }
}
