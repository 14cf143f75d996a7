use crate::store::TrackStore;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

struct Inner {
    gc_to_kp: HashMap<GlobalChannel, f64>,
    pois: Vec<Poi>,
    gaps: Vec<GapPoint>,
    telemetry: HashMap<String, Vec<PosSample>>,
    states: HashMap<String, PigState>,
    /// Ascending by id; ids are assigned from `next_id`.
    outbox: Vec<OutboxItem>,
    next_id: i64,
}

/// In-memory implementation of `TrackStore` for tests and demo runs.
///
/// The skip-locked claim is emulated by a compare-and-set of
/// `(status, locked_by, locked_at)` under the single write guard: a row in
/// SENDING is simply not a candidate, so concurrent claimers always see
/// disjoint subsets.
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                gc_to_kp: HashMap::new(),
                pois: Vec::new(),
                gaps: Vec::new(),
                telemetry: HashMap::new(),
                states: HashMap::new(),
                outbox: Vec::new(),
                next_id: 1,
            }),
        }
    }

    // ── Seeding (tests / demo) ──

    pub async fn set_reference(
        &self,
        gc_to_kp: HashMap<GlobalChannel, f64>,
        pois: Vec<Poi>,
        gaps: Vec<GapPoint>,
    ) {
        let mut w = self.inner.write().await;
        w.gc_to_kp = gc_to_kp;
        w.pois = pois;
        w.gaps = gaps;
    }

    /// Replace a pig's telemetry series. Samples are kept ordered by
    /// timestamp, as the read contract promises.
    pub async fn set_telemetry(&self, pig_id: &str, mut samples: Vec<PosSample>) {
        samples.sort_by_key(|s| s.ts);
        let mut w = self.inner.write().await;
        w.telemetry.insert(pig_id.to_string(), samples);
    }

    // ── Inspection (tests) ──

    pub async fn outbox_items(&self) -> Vec<OutboxItem> {
        let r = self.inner.read().await;
        r.outbox.clone()
    }

    /// Test hook: reschedule a row so a claim sees it as due.
    pub async fn set_next_attempt_at(&self, id: i64, at: DateTime<Utc>) {
        let mut w = self.inner.write().await;
        if let Some(item) = w.outbox.iter_mut().find(|i| i.id == id) {
            item.next_attempt_at = at;
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrackStore for MemoryStore {
    // ── Reference data ──

    async fn gc_to_kp(&self) -> Result<HashMap<GlobalChannel, f64>> {
        let r = self.inner.read().await;
        Ok(r.gc_to_kp.clone())
    }

    async fn pois(&self) -> Result<Vec<Poi>> {
        let r = self.inner.read().await;
        Ok(r.pois.clone())
    }

    async fn gaps(&self) -> Result<Vec<GapPoint>> {
        let r = self.inner.read().await;
        Ok(r.gaps.clone())
    }

    // ── Telemetry ──

    async fn recent_positions(
        &self,
        pig_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<PosSample>> {
        let r = self.inner.read().await;
        Ok(r.telemetry
            .get(pig_id)
            .map(|samples| samples.iter().filter(|s| s.ts >= since).cloned().collect())
            .unwrap_or_default())
    }

    async fn active_pigs(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        let r = self.inner.read().await;
        let mut ids: Vec<String> = r
            .telemetry
            .iter()
            .filter(|(_, samples)| samples.iter().any(|s| s.ts >= since))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    // ── Pig state ──

    async fn get_state(&self, pig_id: &str) -> Result<PigState> {
        let r = self.inner.read().await;
        Ok(r.states.get(pig_id).cloned().unwrap_or_default())
    }

    async fn upsert_state(&self, pig_id: &str, state: &PigState) -> Result<()> {
        let mut w = self.inner.write().await;
        w.states.insert(pig_id.to_string(), state.clone());
        Ok(())
    }

    // ── Outbox ──

    async fn enqueue(
        &self,
        dedup_key: &str,
        pig_id: &str,
        notif_type: &str,
        payload: &serde_json::Value,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        if w.outbox.iter().any(|i| i.dedup_key == dedup_key) {
            return Ok(false);
        }
        let now = Utc::now();
        let id = w.next_id;
        w.next_id += 1;
        w.outbox.push(OutboxItem {
            id,
            dedup_key: dedup_key.to_string(),
            pig_id: pig_id.to_string(),
            notif_type: notif_type.to_string(),
            payload: payload.clone(),
            status: OutboxStatus::New,
            approval_status: ApprovalStatus::Pending,
            approval_token: Uuid::new_v4().to_string(),
            decided_by: None,
            decided_at: None,
            attempt_count: 0,
            next_attempt_at: now,
            locked_by: None,
            locked_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            sent_at: None,
        });
        Ok(true)
    }

    async fn claim(&self, batch_size: usize, worker_name: &str) -> Result<Vec<OutboxItem>> {
        let mut w = self.inner.write().await;
        let now = Utc::now();
        let mut claimed = Vec::new();
        for item in w.outbox.iter_mut() {
            if claimed.len() >= batch_size {
                break;
            }
            let claimable = matches!(item.status, OutboxStatus::New | OutboxStatus::Retry)
                && item.approval_status == ApprovalStatus::Approved
                && item.next_attempt_at <= now;
            if !claimable {
                continue;
            }
            item.status = OutboxStatus::Sending;
            item.locked_by = Some(worker_name.to_string());
            item.locked_at = Some(now);
            item.updated_at = now;
            claimed.push(item.clone());
        }
        Ok(claimed)
    }

    async fn ack_sent(&self, ids: &[i64]) -> Result<()> {
        let mut w = self.inner.write().await;
        let now = Utc::now();
        for item in w.outbox.iter_mut() {
            if ids.contains(&item.id) && item.status == OutboxStatus::Sending {
                item.status = OutboxStatus::Sent;
                item.sent_at = Some(now);
                item.updated_at = now;
                item.locked_by = None;
                item.locked_at = None;
            }
        }
        Ok(())
    }

    async fn ack_retry(&self, acks: &[RetryAck]) -> Result<()> {
        let mut w = self.inner.write().await;
        let now = Utc::now();
        for ack in acks {
            if let Some(item) = w
                .outbox
                .iter_mut()
                .find(|i| i.id == ack.id && i.status == OutboxStatus::Sending)
            {
                item.status = OutboxStatus::Retry;
                item.attempt_count = ack.attempt_count;
                item.next_attempt_at = ack.next_attempt_at;
                item.last_error = Some(ack.error.clone());
                item.updated_at = now;
                item.locked_by = None;
                item.locked_at = None;
            }
        }
        Ok(())
    }

    async fn ack_dead(&self, acks: &[DeadAck]) -> Result<()> {
        let mut w = self.inner.write().await;
        let now = Utc::now();
        for ack in acks {
            if let Some(item) = w
                .outbox
                .iter_mut()
                .find(|i| i.id == ack.id && i.status == OutboxStatus::Sending)
            {
                item.status = OutboxStatus::Dead;
                item.attempt_count = ack.attempt_count;
                item.last_error = Some(ack.error.clone());
                item.updated_at = now;
                item.locked_by = None;
                item.locked_at = None;
            }
        }
        Ok(())
    }

    async fn reclaim_stale(&self, stale: Duration) -> Result<u64> {
        let mut w = self.inner.write().await;
        let now = Utc::now();
        let cutoff = now - stale;
        let mut moved = 0;
        for item in w.outbox.iter_mut() {
            let abandoned = item.status == OutboxStatus::Sending
                && item.locked_at.map(|at| at < cutoff).unwrap_or(false);
            if !abandoned {
                continue;
            }
            item.status = OutboxStatus::Retry;
            item.next_attempt_at = now;
            item.locked_by = None;
            item.locked_at = None;
            item.updated_at = now;
            moved += 1;
        }
        Ok(moved)
    }

    // ── Approval gate ──

    async fn decide_approval(
        &self,
        outbox_id: i64,
        token: &str,
        decision: ApprovalDecision,
        actor: &str,
    ) -> Result<bool> {
        let mut w = self.inner.write().await;
        let Some(item) = w.outbox.iter_mut().find(|i| i.id == outbox_id) else {
            return Ok(false);
        };
        if item.approval_status != ApprovalStatus::Pending || item.approval_token != token {
            return Ok(false);
        }
        let now = Utc::now();
        item.approval_status = decision.as_approval_status();
        item.decided_by = Some(actor.to_string());
        item.decided_at = Some(now);
        item.updated_at = now;
        Ok(true)
    }

    async fn list_waiting_for_approval(&self, limit: usize) -> Result<Vec<PendingApproval>> {
        let r = self.inner.read().await;
        Ok(r.outbox
            .iter()
            .filter(|i| i.approval_status == ApprovalStatus::Pending)
            .take(limit)
            .map(|i| PendingApproval {
                id: i.id,
                token: i.approval_token.clone(),
                payload: i.payload.clone(),
            })
            .collect())
    }
}
