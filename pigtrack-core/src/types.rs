use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Scalar aliases ───────────────────────────────────────────

/// Integer sensor channel identifier, roughly proportional to along-line distance.
pub type GlobalChannel = i32;

/// Position along the line in meters.
pub type Meters = f64;

/// Route label used when no legacy route can be bound.
pub const ROUTE_UNKNOWN: &str = "Unknown";

// ─── Telemetry ────────────────────────────────────────────────

/// One telemetry point for a pig. At least one of `gc`/`kp` must be present
/// for the sample to carry a usable position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PosSample {
    pub ts: DateTime<Utc>,
    /// Global channel.
    pub gc: Option<GlobalChannel>,
    /// Kilometer point.
    pub kp: Option<f64>,
}

impl PosSample {
    pub fn at_kp(ts: DateTime<Utc>, kp: f64) -> Self {
        Self {
            ts,
            gc: None,
            kp: Some(kp),
        }
    }

    pub fn at_gc(ts: DateTime<Utc>, gc: GlobalChannel) -> Self {
        Self {
            ts,
            gc: Some(gc),
            kp: None,
        }
    }
}

// ─── Reference data ───────────────────────────────────────────

/// Point of interest, typically a valve. `tag` is unique within a route.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Poi {
    pub tag: String,
    pub valve_type: String,
    pub gc: Option<GlobalChannel>,
    pub kp: Option<f64>,
    pub legacy_route: String,
}

/// Which edge of a low-detectability segment a gap point marks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GapKind {
    Start,
    End,
}

/// Boundary of a segment where detection is known to be unreliable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GapPoint {
    pub legacy_route: String,
    pub kind: GapKind,
    pub kp: f64,
}

// ─── Pig events ───────────────────────────────────────────────

/// Motion classification for one tick. `Resumption` is an overlay on a
/// Stopped→Moving transition and is never stored as the raw event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PigEvent {
    NotDetected,
    Stopped,
    Moving,
    Resumption,
    Completed,
}

impl PigEvent {
    pub fn label(self) -> &'static str {
        match self {
            PigEvent::NotDetected => "Not Detected",
            PigEvent::Stopped => "Stopped",
            PigEvent::Moving => "Moving",
            PigEvent::Resumption => "Resumption",
            PigEvent::Completed => "Completed",
        }
    }

    pub fn from_label(s: &str) -> Option<Self> {
        match s {
            "Not Detected" => Some(PigEvent::NotDetected),
            "Stopped" => Some(PigEvent::Stopped),
            "Moving" => Some(PigEvent::Moving),
            "Resumption" => Some(PigEvent::Resumption),
            "Completed" => Some(PigEvent::Completed),
            _ => None,
        }
    }
}

// ─── Notification types ───────────────────────────────────────

/// The closed set of notification kinds, in descending selection priority.
/// The engine picks at most one per tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifType {
    RunCompletion,
    PoiPassage,
    GapStart,
    GapEnd,
    Upstream30,
    Upstream15,
    PeriodicUpdate,
}

impl NotifType {
    /// Wire label carried in the payload and the outbox `notif_type` column.
    pub fn label(self) -> &'static str {
        match self {
            NotifType::RunCompletion => "Run Completion",
            NotifType::PoiPassage => "POI Passage",
            NotifType::GapStart => "Gap Start",
            NotifType::GapEnd => "Gap End",
            NotifType::Upstream30 => "30 Min Upstream - Station",
            NotifType::Upstream15 => "15 Min Upstream - Station",
            NotifType::PeriodicUpdate => "30 Min Update",
        }
    }
}

// ─── Pig state ────────────────────────────────────────────────

/// Persisted per pig id so decisions stay consistent across ticks and across
/// detector restarts. Mutated only by the engine; written back whole.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PigState {
    /// Sticky route: kept until a Completed decision clears it.
    pub sticky_route: Option<String>,

    /// Periodic-update cadence anchors.
    pub first_notif_at: Option<DateTime<Utc>>,
    pub last_notif_at: Option<DateTime<Utc>>,

    /// Pre-POI dedup: the tag the warning last fired for.
    pub fired_pre30_for_tag: Option<String>,
    pub fired_pre15_for_tag: Option<String>,

    /// Raw (pre-overlay) classification of the previous tick.
    pub last_event: Option<PigEvent>,
    pub last_event_at: Option<DateTime<Utc>>,

    /// When the pig last transitioned into motion; drives the short speed window.
    pub moving_started_at: Option<DateTime<Utc>>,
}

impl PigState {
    /// Clear everything tied to the current run. Applied after a Completed
    /// decision so the next run starts with a fresh route and cadence.
    pub fn reset_run(&mut self) {
        self.sticky_route = None;
        self.first_notif_at = None;
        self.last_notif_at = None;
        self.fired_pre30_for_tag = None;
        self.fired_pre15_for_tag = None;
        self.moving_started_at = None;
    }
}

// ─── Outbox ───────────────────────────────────────────────────

/// Delivery status of an outbox row. `Sent` and `Dead` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboxStatus {
    New,
    Retry,
    Sending,
    Sent,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxStatus::New => "NEW",
            OutboxStatus::Retry => "RETRY",
            OutboxStatus::Sending => "SENDING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Dead => "DEAD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(OutboxStatus::New),
            "RETRY" => Some(OutboxStatus::Retry),
            "SENDING" => Some(OutboxStatus::Sending),
            "SENT" => Some(OutboxStatus::Sent),
            "DEAD" => Some(OutboxStatus::Dead),
            _ => None,
        }
    }

    /// Terminal rows never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Sent | OutboxStatus::Dead)
    }
}

/// Approval gate state of an outbox row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ApprovalStatus::Pending),
            "APPROVED" => Some(ApprovalStatus::Approved),
            "REJECTED" => Some(ApprovalStatus::Rejected),
            _ => None,
        }
    }
}

/// Decision recorded by the external approval channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl ApprovalDecision {
    pub fn as_approval_status(self) -> ApprovalStatus {
        match self {
            ApprovalDecision::Approved => ApprovalStatus::Approved,
            ApprovalDecision::Rejected => ApprovalStatus::Rejected,
        }
    }
}

/// One durable candidate notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxItem {
    pub id: i64,
    /// Deterministic fingerprint of the logical notification; globally unique.
    pub dedup_key: String,
    pub pig_id: String,
    pub notif_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub approval_status: ApprovalStatus,
    /// Opaque one-time token handed to the approval channel at enqueue time.
    pub approval_token: String,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub attempt_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

/// Ack for a failed attempt that still has retries left.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryAck {
    pub id: i64,
    /// Attempt count after this failure.
    pub attempt_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub error: String,
}

/// Ack for a failed attempt that exhausted its retries.
#[derive(Clone, Debug, PartialEq)]
pub struct DeadAck {
    pub id: i64,
    pub attempt_count: i32,
    pub error: String,
}

/// Row awaiting an approval decision, as handed to the approval channel.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingApproval {
    pub id: i64,
    pub token: String,
    pub payload: serde_json::Value,
}
