use crate::store::TrackStore;
use crate::types::*;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use std::collections::HashMap;
use uuid::Uuid;

/// PostgreSQL-backed implementation of `TrackStore`.
///
/// Claims rely on `FOR UPDATE SKIP LOCKED`, so parallel sender workers see
/// disjoint batches without blocking each other. Everything else is plain
/// row updates inside short transactions.
pub struct PostgresStore {
    pool: sqlx::PgPool,
}

impl PostgresStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run pigtrack migrations")?;
        Ok(())
    }
}

const OUTBOX_COLUMNS: &str = "id, dedup_key, pig_id, notif_type, payload, status, \
     approval_status, approval_token, decided_by, decided_at, attempt_count, \
     next_attempt_at, locked_by, locked_at, last_error, created_at, updated_at, sent_at";

fn item_from_row(row: &PgRow) -> Result<OutboxItem> {
    let status_s: String = row.get("status");
    let approval_s: String = row.get("approval_status");
    Ok(OutboxItem {
        id: row.get("id"),
        dedup_key: row.get("dedup_key"),
        pig_id: row.get("pig_id"),
        notif_type: row.get("notif_type"),
        payload: row.get("payload"),
        status: OutboxStatus::parse(&status_s)
            .ok_or_else(|| anyhow!("unknown outbox status: {status_s}"))?,
        approval_status: ApprovalStatus::parse(&approval_s)
            .ok_or_else(|| anyhow!("unknown approval status: {approval_s}"))?,
        approval_token: row.get("approval_token"),
        decided_by: row.get("decided_by"),
        decided_at: row.get("decided_at"),
        attempt_count: row.get("attempt_count"),
        next_attempt_at: row.get("next_attempt_at"),
        locked_by: row.get("locked_by"),
        locked_at: row.get("locked_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        sent_at: row.get("sent_at"),
    })
}

#[async_trait]
impl TrackStore for PostgresStore {
    // ── Reference data ──

    async fn gc_to_kp(&self) -> Result<HashMap<GlobalChannel, f64>> {
        let rows = sqlx::query("SELECT gc, kp FROM gc_to_kp")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<i32, _>("gc"), r.get::<f64, _>("kp")))
            .collect())
    }

    async fn pois(&self) -> Result<Vec<Poi>> {
        let rows = sqlx::query(
            r#"
            SELECT tag, valve_type, gc, kp, legacy_route
            FROM pois
            ORDER BY legacy_route, kp NULLS LAST, gc NULLS LAST, tag
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| Poi {
                tag: r.get("tag"),
                valve_type: r.get("valve_type"),
                gc: r.get("gc"),
                kp: r.get("kp"),
                legacy_route: r.get("legacy_route"),
            })
            .collect())
    }

    async fn gaps(&self) -> Result<Vec<GapPoint>> {
        let rows = sqlx::query(
            "SELECT legacy_route, kind, kp FROM gap_points ORDER BY legacy_route, kp",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|r| {
                let kind_s: String = r.get("kind");
                let kind = match kind_s.as_str() {
                    "start" => GapKind::Start,
                    "end" => GapKind::End,
                    other => return Err(anyhow!("unknown gap kind: {other}")),
                };
                Ok(GapPoint {
                    legacy_route: r.get("legacy_route"),
                    kind,
                    kp: r.get("kp"),
                })
            })
            .collect()
    }

    // ── Telemetry ──

    async fn recent_positions(
        &self,
        pig_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<PosSample>> {
        let rows = sqlx::query(
            r#"
            SELECT ts, gc, kp
            FROM pig_positions
            WHERE pig_id = $1 AND ts >= $2
            ORDER BY ts, id
            "#,
        )
        .bind(pig_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| PosSample {
                ts: r.get("ts"),
                gc: r.get("gc"),
                kp: r.get("kp"),
            })
            .collect())
    }

    async fn active_pigs(&self, since: DateTime<Utc>) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT pig_id FROM pig_positions WHERE ts >= $1 ORDER BY pig_id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|r| r.get("pig_id")).collect())
    }

    // ── Pig state ──

    async fn get_state(&self, pig_id: &str) -> Result<PigState> {
        let row = sqlx::query(
            r#"
            SELECT sticky_route, first_notif_at, last_notif_at,
                   fired_pre30_for_tag, fired_pre15_for_tag,
                   last_event, last_event_at, moving_started_at
            FROM pig_state
            WHERE pig_id = $1
            "#,
        )
        .bind(pig_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(PigState::default());
        };
        let last_event: Option<String> = row.get("last_event");
        Ok(PigState {
            sticky_route: row.get("sticky_route"),
            first_notif_at: row.get("first_notif_at"),
            last_notif_at: row.get("last_notif_at"),
            fired_pre30_for_tag: row.get("fired_pre30_for_tag"),
            fired_pre15_for_tag: row.get("fired_pre15_for_tag"),
            last_event: last_event.as_deref().and_then(PigEvent::from_label),
            last_event_at: row.get("last_event_at"),
            moving_started_at: row.get("moving_started_at"),
        })
    }

    async fn upsert_state(&self, pig_id: &str, state: &PigState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pig_state (
                pig_id, sticky_route, first_notif_at, last_notif_at,
                fired_pre30_for_tag, fired_pre15_for_tag,
                last_event, last_event_at, moving_started_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
            ON CONFLICT (pig_id) DO UPDATE SET
                sticky_route = EXCLUDED.sticky_route,
                first_notif_at = EXCLUDED.first_notif_at,
                last_notif_at = EXCLUDED.last_notif_at,
                fired_pre30_for_tag = EXCLUDED.fired_pre30_for_tag,
                fired_pre15_for_tag = EXCLUDED.fired_pre15_for_tag,
                last_event = EXCLUDED.last_event,
                last_event_at = EXCLUDED.last_event_at,
                moving_started_at = EXCLUDED.moving_started_at,
                updated_at = now()
            "#,
        )
        .bind(pig_id)
        .bind(&state.sticky_route)
        .bind(state.first_notif_at)
        .bind(state.last_notif_at)
        .bind(&state.fired_pre30_for_tag)
        .bind(&state.fired_pre15_for_tag)
        .bind(state.last_event.map(PigEvent::label))
        .bind(state.last_event_at)
        .bind(state.moving_started_at)
        .execute(&self.pool)
        .await?;
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
        let token = Uuid::new_v4().to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO notifications_outbox
                (dedup_key, pig_id, notif_type, payload, approval_token)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (dedup_key) DO NOTHING
            "#,
        )
        .bind(dedup_key)
        .bind(pig_id)
        .bind(notif_type)
        .bind(payload)
        .bind(&token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim(&self, batch_size: usize, worker_name: &str) -> Result<Vec<OutboxItem>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT id FROM notifications_outbox
            WHERE status IN ('NEW', 'RETRY')
              AND approval_status = 'APPROVED'
              AND next_attempt_at <= now()
            ORDER BY id
            FOR UPDATE SKIP LOCKED
            LIMIT $1
            "#,
        )
        .bind(batch_size as i64)
        .fetch_all(&mut *tx)
        .await?;
        let ids: Vec<i64> = rows.iter().map(|r| r.get("id")).collect();
        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            r#"
            UPDATE notifications_outbox
            SET status = 'SENDING', locked_by = $2, locked_at = now(), updated_at = now()
            WHERE id = ANY($1)
            RETURNING {OUTBOX_COLUMNS}
            "#
        ))
        .bind(&ids)
        .bind(worker_name)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut items = rows.iter().map(item_from_row).collect::<Result<Vec<_>>>()?;
        items.sort_by_key(|i| i.id);
        Ok(items)
    }

    async fn ack_sent(&self, ids: &[i64]) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE notifications_outbox
            SET status = 'SENT', sent_at = now(), updated_at = now(),
                locked_by = NULL, locked_at = NULL
            WHERE id = ANY($1) AND status = 'SENDING'
            "#,
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ack_retry(&self, acks: &[RetryAck]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for ack in acks {
            sqlx::query(
                r#"
                UPDATE notifications_outbox
                SET status = 'RETRY', attempt_count = $2, next_attempt_at = $3,
                    last_error = $4, updated_at = now(),
                    locked_by = NULL, locked_at = NULL
                WHERE id = $1 AND status = 'SENDING'
                "#,
            )
            .bind(ack.id)
            .bind(ack.attempt_count)
            .bind(ack.next_attempt_at)
            .bind(&ack.error)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn ack_dead(&self, acks: &[DeadAck]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for ack in acks {
            sqlx::query(
                r#"
                UPDATE notifications_outbox
                SET status = 'DEAD', attempt_count = $2, last_error = $3,
                    updated_at = now(), locked_by = NULL, locked_at = NULL
                WHERE id = $1 AND status = 'SENDING'
                "#,
            )
            .bind(ack.id)
            .bind(ack.attempt_count)
            .bind(&ack.error)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn reclaim_stale(&self, stale: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notifications_outbox
            SET status = 'RETRY', next_attempt_at = now(), updated_at = now(),
                locked_by = NULL, locked_at = NULL
            WHERE status = 'SENDING'
              AND locked_at IS NOT NULL
              AND locked_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(stale.num_seconds() as f64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ── Approval gate ──

    async fn decide_approval(
        &self,
        outbox_id: i64,
        token: &str,
        decision: ApprovalDecision,
        actor: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE notifications_outbox
            SET approval_status = $3, decided_by = $4, decided_at = now(), updated_at = now()
            WHERE id = $1 AND approval_token = $2 AND approval_status = 'PENDING'
            "#,
        )
        .bind(outbox_id)
        .bind(token)
        .bind(decision.as_approval_status().as_str())
        .bind(actor)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_waiting_for_approval(&self, limit: usize) -> Result<Vec<PendingApproval>> {
        let rows = sqlx::query(
            r#"
            SELECT id, approval_token, payload
            FROM notifications_outbox
            WHERE approval_status = 'PENDING'
            ORDER BY id
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| PendingApproval {
                id: r.get("id"),
                token: r.get("approval_token"),
                payload: r.get("payload"),
            })
            .collect())
    }
}
