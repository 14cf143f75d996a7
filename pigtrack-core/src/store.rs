use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Persistence trait for everything the pipeline shares: static reference
/// data, telemetry, per-pig engine state, and the notifications outbox.
///
/// The engine and both workers operate exclusively through this trait,
/// enabling pluggable backends (MemoryStore for tests and demos, Postgres
/// for production).
#[async_trait]
pub trait TrackStore: Send + Sync {
    // ── Reference data (read-only) ──

    /// Static channel → kilometer-point mapping.
    async fn gc_to_kp(&self) -> Result<HashMap<GlobalChannel, f64>>;
    async fn pois(&self) -> Result<Vec<Poi>>;
    async fn gaps(&self) -> Result<Vec<GapPoint>>;

    // ── Telemetry (read-only) ──

    /// Position samples for a pig since `since`, ordered by timestamp ascending.
    async fn recent_positions(&self, pig_id: &str, since: DateTime<Utc>)
        -> Result<Vec<PosSample>>;
    /// Pigs that produced telemetry at or after `since`.
    async fn active_pigs(&self, since: DateTime<Utc>) -> Result<Vec<String>>;

    // ── Pig state ──

    /// State for a pig; a fresh default on first reference.
    async fn get_state(&self, pig_id: &str) -> Result<PigState>;
    /// Atomically replace the pig's state row.
    async fn upsert_state(&self, pig_id: &str, state: &PigState) -> Result<()>;

    // ── Outbox ──

    /// Atomic insert keyed by `dedup_key`. Returns false when a row with the
    /// same fingerprint already exists; the existing row is left untouched.
    async fn enqueue(
        &self,
        dedup_key: &str,
        pig_id: &str,
        notif_type: &str,
        payload: &serde_json::Value,
    ) -> Result<bool>;

    /// Claim up to `batch_size` due APPROVED rows for `worker_name`, moving
    /// them to SENDING under a row lock that skips rows other workers hold.
    async fn claim(&self, batch_size: usize, worker_name: &str) -> Result<Vec<OutboxItem>>;

    /// Successful deliveries → SENT (terminal), lock cleared.
    async fn ack_sent(&self, ids: &[i64]) -> Result<()>;
    /// Failed deliveries with retries left → RETRY with the given schedule.
    async fn ack_retry(&self, acks: &[RetryAck]) -> Result<()>;
    /// Failed deliveries out of retries → DEAD (terminal).
    async fn ack_dead(&self, acks: &[DeadAck]) -> Result<()>;

    /// Return SENDING rows locked longer than `stale` to RETRY, due
    /// immediately. Absorbs worker crashes; returns the number of rows moved.
    async fn reclaim_stale(&self, stale: Duration) -> Result<u64>;

    // ── Approval gate ──

    /// Record an approval decision. Idempotent: false when the row was
    /// already decided or the token does not match.
    async fn decide_approval(
        &self,
        outbox_id: i64,
        token: &str,
        decision: ApprovalDecision,
        actor: &str,
    ) -> Result<bool>;

    /// Rows still awaiting a decision, oldest first.
    async fn list_waiting_for_approval(&self, limit: usize) -> Result<Vec<PendingApproval>>;
}
