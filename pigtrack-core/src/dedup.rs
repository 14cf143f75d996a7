use sha2::{Digest, Sha256};

use crate::snapshot::Snapshot;
use crate::types::{GapKind, NotifType};

/// Width of the periodic-update dedup window, seconds. Updates landing in
/// the same wall-clock bucket collapse to one outbox row; the next bucket
/// produces a fresh key.
const PERIODIC_BUCKET_SEC: i64 = 1800;

/// Deterministic fingerprint of a logical notification.
///
/// Repeat emissions of the same logical event (the same pig on the same
/// valve, the same gap edge, the same cadence window) hash to the same key,
/// which the outbox unique index turns into at-most-once enqueue. Distinct
/// logical events must never collide, so each kind hashes its own
/// discriminator. Returns `None` when the snapshot carries no notification.
pub fn make_dedup_key(snap: &Snapshot) -> Option<String> {
    let notif = snap.notif?;
    let discriminator = match notif {
        NotifType::RunCompletion => format!(
            "{}|{}",
            snap.legacy_route,
            snap.end_poi.as_ref().map(|p| p.tag.as_str()).unwrap_or("")
        ),
        NotifType::PoiPassage => format!(
            "{}|{}",
            snap.legacy_route,
            snap.passed_poi
                .as_ref()
                .map(|p| p.tag.as_str())
                .unwrap_or("")
        ),
        NotifType::GapStart | NotifType::GapEnd => {
            let (kind, kp) = snap
                .gap
                .as_ref()
                .map(|g| {
                    (
                        match g.kind {
                            GapKind::Start => "start",
                            GapKind::End => "end",
                        },
                        g.kp,
                    )
                })
                .unwrap_or(("", 0.0));
            format!("{}|{}|{:.3}", snap.legacy_route, kind, kp)
        }
        NotifType::Upstream30 | NotifType::Upstream15 => format!(
            "{}|{}",
            snap.legacy_route,
            snap.next_poi.as_ref().map(|p| p.tag.as_str()).unwrap_or("")
        ),
        NotifType::PeriodicUpdate => snap
            .now
            .timestamp()
            .div_euclid(PERIODIC_BUCKET_SEC)
            .to_string(),
    };

    let mut hasher = Sha256::new();
    hasher.update(snap.pig_id.as_bytes());
    hasher.update(b"|");
    hasher.update(notif.label().as_bytes());
    hasher.update(b"|");
    hasher.update(discriminator.as_bytes());
    Some(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GapPoint, PigEvent, Poi};
    use chrono::{Duration, TimeZone, Utc};

    fn base_snapshot() -> Snapshot {
        let now = Utc.with_ymd_and_hms(2026, 1, 14, 8, 0, 0).unwrap();
        let mut snap = Snapshot::not_detected("PIG_001", "Cleaning Tool", None, now);
        snap.event = PigEvent::Moving;
        snap.legacy_route = "R".to_string();
        snap
    }

    fn poi(tag: &str, kp: f64) -> Poi {
        Poi {
            tag: tag.to_string(),
            valve_type: "Mainline".to_string(),
            gc: None,
            kp: Some(kp),
            legacy_route: "R".to_string(),
        }
    }

    #[test]
    fn no_notification_no_key() {
        assert_eq!(make_dedup_key(&base_snapshot()), None);
    }

    #[test]
    fn same_passage_same_key() {
        let mut a = base_snapshot();
        a.notif = Some(NotifType::PoiPassage);
        a.passed_poi = Some(poi("V1", 10.0));
        let mut b = a.clone();
        b.now = a.now + Duration::minutes(3);
        b.speed_mps = 1.5;
        assert_eq!(make_dedup_key(&a), make_dedup_key(&b));
    }

    #[test]
    fn different_poi_different_key() {
        let mut a = base_snapshot();
        a.notif = Some(NotifType::PoiPassage);
        a.passed_poi = Some(poi("V1", 10.0));
        let mut b = a.clone();
        b.passed_poi = Some(poi("V2", 11.0));
        assert_ne!(make_dedup_key(&a), make_dedup_key(&b));
    }

    #[test]
    fn passage_and_pre15_on_same_tag_do_not_collide() {
        let mut a = base_snapshot();
        a.notif = Some(NotifType::PoiPassage);
        a.passed_poi = Some(poi("V1", 10.0));
        let mut b = base_snapshot();
        b.notif = Some(NotifType::Upstream15);
        b.next_poi = Some(poi("V1", 10.0));
        assert_ne!(make_dedup_key(&a), make_dedup_key(&b));
    }

    #[test]
    fn gap_edges_are_distinct() {
        let mut a = base_snapshot();
        a.notif = Some(NotifType::GapStart);
        a.gap = Some(GapPoint {
            legacy_route: "R".to_string(),
            kind: GapKind::Start,
            kp: 10.5,
        });
        let mut b = base_snapshot();
        b.notif = Some(NotifType::GapEnd);
        b.gap = Some(GapPoint {
            legacy_route: "R".to_string(),
            kind: GapKind::End,
            kp: 10.5,
        });
        assert_ne!(make_dedup_key(&a), make_dedup_key(&b));
    }

    #[test]
    fn periodic_update_collapses_within_window_and_rolls_over() {
        let mut a = base_snapshot();
        a.notif = Some(NotifType::PeriodicUpdate);
        let mut b = a.clone();
        b.now = a.now + Duration::minutes(10);
        // 08:00 and 08:10 share the half-hour bucket
        assert_eq!(make_dedup_key(&a), make_dedup_key(&b));

        let mut c = a.clone();
        c.now = a.now + Duration::minutes(30);
        assert_ne!(make_dedup_key(&a), make_dedup_key(&c));
    }

    #[test]
    fn different_pigs_never_collide() {
        let mut a = base_snapshot();
        a.notif = Some(NotifType::PeriodicUpdate);
        let mut b = a.clone();
        b.pig_id = "PIG_002".to_string();
        assert_ne!(make_dedup_key(&a), make_dedup_key(&b));
    }
}
