use chrono::{DateTime, Utc};
use serde_json::json;

use crate::types::{GapPoint, NotifType, PigEvent, Poi, ROUTE_UNKNOWN};

/// What one engine tick observed and decided for a pig. The payload posted
/// to the ingest endpoint is a rendering of this; the dedup fingerprint is
/// computed from the typed fields rather than the rendered strings.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub pig_id: String,
    pub tool_type: String,
    pub event: PigEvent,
    pub notif: Option<NotifType>,
    pub speed_mps: f64,
    pub legacy_route: String,
    pub prev_poi: Option<Poi>,
    pub next_poi: Option<Poi>,
    pub end_poi: Option<Poi>,
    /// POI the pig is on top of, when the decision is a passage.
    pub passed_poi: Option<Poi>,
    /// Gap point matched, when the decision is Gap Start / Gap End.
    pub gap: Option<GapPoint>,
    pub eta_next: Option<DateTime<Utc>>,
    pub eta_end: Option<DateTime<Utc>>,
    /// Channel of the current sample, if it carried one.
    pub gc: Option<i32>,
    /// Fused position in meters; `None` when the pig was not detected.
    pub position_m: Option<f64>,
    /// The tick's clock, captured once by the caller.
    pub now: DateTime<Utc>,
}

impl Snapshot {
    /// Snapshot for a tick with no usable telemetry.
    pub fn not_detected(
        pig_id: &str,
        tool_type: &str,
        legacy_route: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            pig_id: pig_id.to_string(),
            tool_type: tool_type.to_string(),
            event: PigEvent::NotDetected,
            notif: None,
            speed_mps: 0.0,
            legacy_route: legacy_route.unwrap_or_else(|| ROUTE_UNKNOWN.to_string()),
            prev_poi: None,
            next_poi: None,
            end_poi: None,
            passed_poi: None,
            gap: None,
            eta_next: None,
            eta_end: None,
            gc: None,
            position_m: None,
            now,
        }
    }

    /// Render the notification payload. Key names and formats are part of
    /// the ingest contract; absent values render as empty strings.
    pub fn payload(&self) -> serde_json::Value {
        json!({
            "Pig ID": self.pig_id,
            "Tool Type": self.tool_type,
            "Pig Event": self.event.label(),
            "Notification Type": self.notif.map(NotifType::label).unwrap_or(""),
            "Speed": format!("{:.2}", self.speed_mps),
            "Previous Valve Type": poi_valve_type(&self.prev_poi),
            "Previous Valve Tag": poi_tag(&self.prev_poi),
            "Next Valve Type": poi_valve_type(&self.next_poi),
            "Next Valve Tag": poi_tag(&self.next_poi),
            "ETA to the Next Valve": fmt_eta(self.eta_next),
            "ETA to the End": fmt_eta(self.eta_end),
            "Legacy Route": self.legacy_route,
            "Current Global Channel": self.gc.map(|gc| gc.to_string()).unwrap_or_default(),
            "Current KP": fmt_kp(self.position_m),
            "Timestamp": self.now.to_rfc3339(),
        })
    }
}

/// ETAs travel as `DD-MM-YY HHMMSS`, or empty when undefined.
fn fmt_eta(eta: Option<DateTime<Utc>>) -> String {
    eta.map(|dt| dt.format("%d-%m-%y %H%M%S").to_string())
        .unwrap_or_default()
}

/// Kilometer point with three decimals, or empty when the position is unknown.
fn fmt_kp(position_m: Option<f64>) -> String {
    position_m
        .map(|m| format!("{:.3}", m / 1000.0))
        .unwrap_or_default()
}

fn poi_tag(poi: &Option<Poi>) -> String {
    poi.as_ref().map(|p| p.tag.clone()).unwrap_or_default()
}

fn poi_valve_type(poi: &Option<Poi>) -> String {
    poi.as_ref().map(|p| p.valve_type.clone()).unwrap_or_default()
}
