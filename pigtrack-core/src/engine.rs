use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use crate::config::EngineConfig;
use crate::snapshot::Snapshot;
use crate::store::TrackStore;
use crate::types::*;

/// Minimum spacing of the periodic "30 Min Update", seconds.
const UPDATE_CADENCE_SEC: i64 = 1800;

// ─── Position fusion ──────────────────────────────────────────

/// Fused position in meters: an explicit kp wins, then the channel map,
/// then the linear channel fallback. `None` when neither field is usable.
pub fn position_m(
    gc: Option<GlobalChannel>,
    kp: Option<f64>,
    gc_to_kp: &HashMap<GlobalChannel, f64>,
    meters_per_channel: f64,
) -> Option<Meters> {
    if let Some(kp) = kp {
        return Some(kp * 1000.0);
    }
    let gc = gc?;
    match gc_to_kp.get(&gc) {
        Some(kp) => Some(kp * 1000.0),
        None => Some(f64::from(gc) * meters_per_channel),
    }
}

fn sample_position(
    s: &PosSample,
    gc_to_kp: &HashMap<GlobalChannel, f64>,
    meters_per_channel: f64,
) -> Option<Meters> {
    position_m(s.gc, s.kp, gc_to_kp, meters_per_channel)
}

fn poi_position(
    p: &Poi,
    gc_to_kp: &HashMap<GlobalChannel, f64>,
    meters_per_channel: f64,
) -> Option<Meters> {
    position_m(p.gc, p.kp, gc_to_kp, meters_per_channel)
}

// ─── Sample selection ─────────────────────────────────────────

/// Newest sample with a usable position. A timestamp tie goes to the later
/// element of the slice (later insertion).
fn current_sample<'a>(
    samples: &'a [PosSample],
    gc_to_kp: &HashMap<GlobalChannel, f64>,
    meters_per_channel: f64,
) -> Option<(&'a PosSample, Meters)> {
    let mut best: Option<(&PosSample, Meters)> = None;
    for s in samples {
        let Some(pos) = sample_position(s, gc_to_kp, meters_per_channel) else {
            continue;
        };
        match best {
            Some((b, _)) if s.ts < b.ts => {}
            _ => best = Some((s, pos)),
        }
    }
    best
}

/// Reference sample for a target instant: the closest sample at or before
/// the target, else the sample closest to it in absolute time.
fn ref_sample_at_or_before<'a>(
    pool: &[(&'a PosSample, Meters)],
    target: DateTime<Utc>,
) -> Option<(&'a PosSample, Meters)> {
    let mut best_left: Option<(&PosSample, Meters)> = None;
    for &(s, pos) in pool {
        if s.ts > target {
            continue;
        }
        match best_left {
            Some((b, _)) if s.ts < b.ts => {}
            _ => best_left = Some((s, pos)),
        }
    }
    if best_left.is_some() {
        return best_left;
    }
    pool.iter()
        .copied()
        .min_by_key(|(s, _)| (s.ts - target).num_milliseconds().abs())
}

// ─── Speed ────────────────────────────────────────────────────

/// Speed in m/s over an adaptive reference window, absolute. Right after a
/// Moving transition the short window applies and the candidate pool is
/// restricted to samples taken since the transition. Zero when the
/// reference sits too close in time for a stable estimate.
fn speed_mps(
    positioned: &[(&PosSample, Meters)],
    cur: (&PosSample, Meters),
    state: &PigState,
    now: DateTime<Utc>,
    cfg: &EngineConfig,
) -> f64 {
    let boosted = state
        .moving_started_at
        .map(|t0| now - t0 <= Duration::seconds(cfg.moving_boost_sec))
        .unwrap_or(false);
    let (window_sec, floor) = if boosted {
        (cfg.speed_short_window_sec, state.moving_started_at)
    } else {
        (cfg.speed_window_sec, None)
    };

    let pool: Vec<(&PosSample, Meters)> = positioned
        .iter()
        .copied()
        .filter(|(s, _)| floor.map_or(true, |t0| s.ts >= t0))
        .collect();

    let target = now - Duration::seconds(window_sec);
    let Some((r, r_pos)) = ref_sample_at_or_before(&pool, target) else {
        return 0.0;
    };
    let dt = (cur.0.ts - r.ts).num_seconds();
    if dt < cfg.min_speed_dt_sec {
        return 0.0;
    }
    (cur.1 - r_pos).abs() / dt as f64
}

// ─── Route binding ────────────────────────────────────────────

/// Group POIs by route name and sort each group along the line: kp
/// ascending, then channel, then tag, with position-less entries last.
pub fn build_routes(pois: &[Poi]) -> HashMap<String, Vec<Poi>> {
    let mut routes: HashMap<String, Vec<Poi>> = HashMap::new();
    for p in pois {
        routes
            .entry(p.legacy_route.clone())
            .or_default()
            .push(p.clone());
    }
    for group in routes.values_mut() {
        group.sort_by(|a, b| {
            let ka = a.kp.unwrap_or(f64::INFINITY);
            let kb = b.kp.unwrap_or(f64::INFINITY);
            ka.total_cmp(&kb)
                .then_with(|| {
                    a.gc.unwrap_or(GlobalChannel::MAX)
                        .cmp(&b.gc.unwrap_or(GlobalChannel::MAX))
                })
                .then_with(|| a.tag.cmp(&b.tag))
        });
    }
    routes
}

/// Meter range covered by a route's positioned POIs.
fn route_span(
    route_pois: &[Poi],
    gc_to_kp: &HashMap<GlobalChannel, f64>,
    meters_per_channel: f64,
) -> Option<(Meters, Meters)> {
    let mut lo: Option<f64> = None;
    let mut hi: Option<f64> = None;
    for p in route_pois {
        let Some(m) = poi_position(p, gc_to_kp, meters_per_channel) else {
            continue;
        };
        lo = Some(lo.map_or(m, |v| v.min(m)));
        hi = Some(hi.map_or(m, |v| v.max(m)));
    }
    Some((lo?, hi?))
}

/// Bind a route for the current position. The sticky route wins while set;
/// otherwise the narrowest route whose tolerance-padded range contains the
/// position, falling back to the route of the nearest POI. Name order
/// breaks exact ties so the pick is stable across runs.
fn bind_route(
    state: &PigState,
    routes: &HashMap<String, Vec<Poi>>,
    cur_pos: Meters,
    gc_to_kp: &HashMap<GlobalChannel, f64>,
    cfg: &EngineConfig,
) -> String {
    if let Some(r) = &state.sticky_route {
        if r != ROUTE_UNKNOWN {
            return r.clone();
        }
    }

    let tol = cfg.poi_tol_meters;
    let mut best: Option<(f64, &str)> = None;
    for (name, group) in routes {
        let Some((lo, hi)) = route_span(group, gc_to_kp, cfg.meters_per_channel) else {
            continue;
        };
        if cur_pos < lo - tol || cur_pos > hi + tol {
            continue;
        }
        let span = hi - lo;
        match best {
            Some((s, n)) if s < span || (s == span && n <= name.as_str()) => {}
            _ => best = Some((span, name.as_str())),
        }
    }
    if let Some((_, name)) = best {
        return name.to_string();
    }

    let mut nearest: Option<(f64, &str)> = None;
    for (name, group) in routes {
        for p in group {
            let Some(m) = poi_position(p, gc_to_kp, cfg.meters_per_channel) else {
                continue;
            };
            let d = (m - cur_pos).abs();
            match nearest {
                Some((bd, bn)) if bd < d || (bd == d && bn <= name.as_str()) => {}
                _ => nearest = Some((d, name.as_str())),
            }
        }
    }
    nearest
        .map(|(_, n)| n.to_string())
        .unwrap_or_else(|| ROUTE_UNKNOWN.to_string())
}

/// Walk the ordered route around the current position: `end` is the last
/// POI with a defined position, `prev` the last at or before the
/// tolerance-padded position, `next` the first beyond it.
fn find_prev_next_end(
    route_pois: &[Poi],
    cur_pos: Meters,
    gc_to_kp: &HashMap<GlobalChannel, f64>,
    cfg: &EngineConfig,
) -> (Option<Poi>, Option<Poi>, Option<Poi>) {
    let tol = cfg.poi_tol_meters;
    let mut prev: Option<Poi> = None;
    let mut next: Option<Poi> = None;
    let mut end: Option<Poi> = None;
    for p in route_pois {
        let Some(m) = poi_position(p, gc_to_kp, cfg.meters_per_channel) else {
            continue;
        };
        end = Some(p.clone());
        if m <= cur_pos + tol {
            prev = Some(p.clone());
        } else if next.is_none() {
            next = Some(p.clone());
        }
    }
    (prev, next, end)
}

// ─── Motion classification ────────────────────────────────────

/// Raw motion classification over the stopped-window samples. Reaching the
/// end POI dominates everything else.
fn classify_motion(
    window: &[(&PosSample, Meters)],
    cur_pos: Meters,
    end_poi: Option<&Poi>,
    gc_to_kp: &HashMap<GlobalChannel, f64>,
    cfg: &EngineConfig,
) -> PigEvent {
    if let Some(end) = end_poi {
        if let Some(end_pos) = poi_position(end, gc_to_kp, cfg.meters_per_channel) {
            if (cur_pos - end_pos).abs() <= cfg.poi_tol_meters {
                return PigEvent::Completed;
            }
        }
    }
    if window.len() < 2 {
        return PigEvent::NotDetected;
    }
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for &(_, m) in window {
        lo = lo.min(m);
        hi = hi.max(m);
    }
    if hi - lo <= cfg.poi_tol_meters {
        PigEvent::Stopped
    } else {
        PigEvent::Moving
    }
}

// ─── ETA ──────────────────────────────────────────────────────

/// Arrival estimate at `target_pos`: defined only for positive speed and a
/// target at or beyond the current position. A target exactly at the
/// current position yields the current sample's timestamp.
fn eta_from_to(
    cur_ts: DateTime<Utc>,
    cur_pos: Meters,
    target_pos: Meters,
    speed_mps: f64,
) -> Option<DateTime<Utc>> {
    if speed_mps <= 0.0 || target_pos < cur_pos {
        return None;
    }
    let secs = (target_pos - cur_pos) / speed_mps;
    Some(cur_ts + Duration::milliseconds((secs * 1000.0).round() as i64))
}

// ─── Notification selection ───────────────────────────────────

/// What the priority dispatch picked, with the entities that identify the
/// logical event for fingerprinting.
struct Decision {
    notif: Option<NotifType>,
    passed_poi: Option<Poi>,
    gap: Option<GapPoint>,
}

impl Decision {
    fn none() -> Self {
        Self {
            notif: None,
            passed_poi: None,
            gap: None,
        }
    }

    fn of(notif: NotifType) -> Self {
        Self {
            notif: Some(notif),
            passed_poi: None,
            gap: None,
        }
    }
}

/// Pick at most one notification for this tick, in strict priority order:
/// run completion, POI passage, gap edge, 30-minute warning, 15-minute
/// warning, periodic update. Per-target dedup flags and cadence anchors are
/// recorded on the state as a side effect of firing.
#[allow(clippy::too_many_arguments)]
fn select_notification(
    state: &mut PigState,
    event: PigEvent,
    cur_pos: Meters,
    route: &str,
    route_pois: Option<&[Poi]>,
    next_poi: Option<&Poi>,
    end_poi: Option<&Poi>,
    gaps: &[GapPoint],
    eta_next: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    gc_to_kp: &HashMap<GlobalChannel, f64>,
    cfg: &EngineConfig,
) -> Decision {
    let tol = cfg.poi_tol_meters;

    let at_end = end_poi
        .and_then(|p| poi_position(p, gc_to_kp, cfg.meters_per_channel))
        .map(|m| (m - cur_pos).abs() <= tol)
        .unwrap_or(false);
    if event == PigEvent::Completed || at_end {
        return Decision::of(NotifType::RunCompletion);
    }

    if let Some(pois) = route_pois {
        for p in pois {
            let Some(m) = poi_position(p, gc_to_kp, cfg.meters_per_channel) else {
                continue;
            };
            if (m - cur_pos).abs() <= tol {
                return Decision {
                    notif: Some(NotifType::PoiPassage),
                    passed_poi: Some(p.clone()),
                    gap: None,
                };
            }
        }
    }

    for g in gaps.iter().filter(|g| g.legacy_route == route) {
        if (g.kp * 1000.0 - cur_pos).abs() <= tol {
            let notif = match g.kind {
                GapKind::Start => NotifType::GapStart,
                GapKind::End => NotifType::GapEnd,
            };
            return Decision {
                notif: Some(notif),
                passed_poi: None,
                gap: Some(g.clone()),
            };
        }
    }

    if let (Some(next), Some(eta)) = (next_poi, eta_next) {
        let window = Duration::seconds(cfg.prepoi_time_window_sec);
        let t30 = eta - Duration::minutes(30);
        if (now - t30).abs() <= window
            && state.fired_pre30_for_tag.as_deref() != Some(next.tag.as_str())
        {
            state.fired_pre30_for_tag = Some(next.tag.clone());
            return Decision::of(NotifType::Upstream30);
        }
        let t15 = eta - Duration::minutes(15);
        if (now - t15).abs() <= window
            && state.fired_pre15_for_tag.as_deref() != Some(next.tag.as_str())
        {
            state.fired_pre15_for_tag = Some(next.tag.clone());
            return Decision::of(NotifType::Upstream15);
        }
    }

    if state.first_notif_at.is_none() {
        state.first_notif_at = Some(now);
        state.last_notif_at = Some(now);
        return Decision::of(NotifType::PeriodicUpdate);
    }
    if let Some(last) = state.last_notif_at {
        if now - last >= Duration::seconds(UPDATE_CADENCE_SEC) {
            state.last_notif_at = Some(now);
            return Decision::of(NotifType::PeriodicUpdate);
        }
    }

    Decision::none()
}

// ─── Engine ───────────────────────────────────────────────────

/// The per-tick detection engine. Fuses telemetry into a position, derives
/// speed, binds a route, classifies motion, and picks at most one
/// notification per invocation. All persistence goes through the store.
pub struct DetectionEngine {
    store: Arc<dyn TrackStore>,
    cfg: EngineConfig,
}

impl DetectionEngine {
    pub fn new(store: Arc<dyn TrackStore>, cfg: EngineConfig) -> Self {
        Self { store, cfg }
    }

    /// One tick for one pig. `now` is captured once by the caller; no clock
    /// is re-sampled inside the tick.
    pub async fn process_pig(
        &self,
        pig_id: &str,
        tool_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Snapshot> {
        let cfg = &self.cfg;
        let tool_type = if tool_type.trim().is_empty() {
            cfg.default_tool_type.as_str()
        } else {
            tool_type
        };

        let mut state = self.store.get_state(pig_id).await?;
        let since = now - Duration::seconds(cfg.speed_search_sec);
        let samples = self.store.recent_positions(pig_id, since).await?;
        let gc_to_kp = self.store.gc_to_kp().await?;

        let Some((cur, cur_pos)) = current_sample(&samples, &gc_to_kp, cfg.meters_per_channel)
        else {
            // Nothing to work with; leave the state untouched so a later
            // Stopped→Moving transition still reads as a resumption.
            return Ok(Snapshot::not_detected(
                pig_id,
                tool_type,
                state.sticky_route.clone(),
                now,
            ));
        };

        let positioned: Vec<(&PosSample, Meters)> = samples
            .iter()
            .filter_map(|s| sample_position(s, &gc_to_kp, cfg.meters_per_channel).map(|m| (s, m)))
            .collect();

        let pois = self.store.pois().await?;
        let gaps = self.store.gaps().await?;
        let routes = build_routes(&pois);
        let route = bind_route(&state, &routes, cur_pos, &gc_to_kp, cfg);

        let (prev_poi, next_poi, end_poi) = match routes.get(route.as_str()) {
            Some(group) => find_prev_next_end(group, cur_pos, &gc_to_kp, cfg),
            None => (None, None, None),
        };

        let window_floor = now - Duration::seconds(cfg.stopped_window_sec);
        let window: Vec<(&PosSample, Meters)> = positioned
            .iter()
            .copied()
            .filter(|(s, _)| s.ts >= window_floor)
            .collect();
        let raw_event = classify_motion(&window, cur_pos, end_poi.as_ref(), &gc_to_kp, cfg);

        let event = if state.last_event == Some(PigEvent::Stopped) && raw_event == PigEvent::Moving
        {
            PigEvent::Resumption
        } else {
            raw_event
        };
        if event == PigEvent::Resumption {
            state.moving_started_at = Some(cur.ts);
        }
        if matches!(raw_event, PigEvent::Stopped | PigEvent::Completed) {
            state.moving_started_at = None;
        }

        // Speed comes after the overlay: on a resumption tick the reference
        // pool is already restricted to samples at or after the transition.
        let raw_speed = speed_mps(&positioned, (cur, cur_pos), &state, now, cfg);

        // A pig that is not in motion reports 0.00 regardless of what the
        // window math produced.
        let speed = match raw_event {
            PigEvent::Stopped | PigEvent::NotDetected => 0.0,
            _ => raw_speed,
        };

        let eta_next = next_poi.as_ref().and_then(|p| {
            poi_position(p, &gc_to_kp, cfg.meters_per_channel)
                .and_then(|m| eta_from_to(cur.ts, cur_pos, m, speed))
        });
        let eta_end = end_poi.as_ref().and_then(|p| {
            poi_position(p, &gc_to_kp, cfg.meters_per_channel)
                .and_then(|m| eta_from_to(cur.ts, cur_pos, m, speed))
        });

        let decision = select_notification(
            &mut state,
            event,
            cur_pos,
            &route,
            routes.get(route.as_str()).map(|v| v.as_slice()),
            next_poi.as_ref(),
            end_poi.as_ref(),
            &gaps,
            eta_next,
            now,
            &gc_to_kp,
            cfg,
        );

        state.last_event = Some(raw_event);
        state.last_event_at = Some(now);

        if raw_event == PigEvent::Completed {
            state.reset_run();
        } else if route != ROUTE_UNKNOWN {
            state.sticky_route = Some(route.clone());
        }

        self.store.upsert_state(pig_id, &state).await?;

        tracing::debug!(
            pig = pig_id,
            event = event.label(),
            notif = decision.notif.map(NotifType::label).unwrap_or(""),
            route = %route,
            speed = speed,
            "tick"
        );

        Ok(Snapshot {
            pig_id: pig_id.to_string(),
            tool_type: tool_type.to_string(),
            event,
            notif: decision.notif,
            speed_mps: speed,
            legacy_route: route,
            prev_poi,
            next_poi,
            end_poi,
            passed_poi: decision.passed_poi,
            gap: decision.gap,
            eta_next,
            eta_end,
            gc: cur.gc,
            position_m: Some(cur_pos),
            now,
        })
    }
}
