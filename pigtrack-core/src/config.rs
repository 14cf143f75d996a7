use anyhow::{Context, Result};
use std::str::FromStr;

/// Read `PIGTRACK_<name>` from the environment, falling back to `default`
/// when unset or unparsable.
fn env_or<T: FromStr + Copy>(name: &str, default: T) -> T {
    std::env::var(format!("PIGTRACK_{name}"))
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(format!("PIGTRACK_{name}")).unwrap_or_else(|_| default.to_string())
}

// ─── Engine ───────────────────────────────────────────────────

/// Tunables of the detection engine. Defaults match the field-calibrated
/// values the detector runs with in production.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineConfig {
    /// Linear fallback for channels absent from the channel→kp map.
    pub meters_per_channel: f64,
    /// Closed-interval tolerance around POIs, gap points and route ranges.
    pub poi_tol_meters: f64,
    /// Window over which motion is classified.
    pub stopped_window_sec: i64,
    /// Half-width of the window in which a pre-POI warning may fire.
    pub prepoi_time_window_sec: i64,
    /// Long speed window.
    pub speed_window_sec: i64,
    /// Short speed window used right after a pig starts moving.
    pub speed_short_window_sec: i64,
    /// How long after a Moving transition the short window applies.
    pub moving_boost_sec: i64,
    /// Minimum time between current and reference sample for a speed estimate.
    pub min_speed_dt_sec: i64,
    /// How far back telemetry is pulled per tick.
    pub speed_search_sec: i64,
    /// Tool type used when the caller provides none.
    pub default_tool_type: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            meters_per_channel: 25.0,
            poi_tol_meters: 50.0,
            stopped_window_sec: 300,
            prepoi_time_window_sec: 60,
            speed_window_sec: 1500,
            speed_short_window_sec: 300,
            moving_boost_sec: 600,
            min_speed_dt_sec: 120,
            speed_search_sec: 2100,
            default_tool_type: "Cleaning Tool".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            meters_per_channel: env_or("METERS_PER_CHANNEL", d.meters_per_channel),
            poi_tol_meters: env_or("POI_TOL_METERS", d.poi_tol_meters),
            stopped_window_sec: env_or("STOPPED_WINDOW_SEC", d.stopped_window_sec),
            prepoi_time_window_sec: env_or("PREPOI_TIME_WINDOW_SEC", d.prepoi_time_window_sec),
            speed_window_sec: env_or("SPEED_WINDOW_SEC", d.speed_window_sec),
            speed_short_window_sec: env_or("SPEED_SHORT_WINDOW_SEC", d.speed_short_window_sec),
            moving_boost_sec: env_or("MOVING_BOOST_SEC", d.moving_boost_sec),
            min_speed_dt_sec: env_or("MIN_SPEED_DT_SEC", d.min_speed_dt_sec),
            speed_search_sec: env_or("SPEED_SEARCH_SEC", d.speed_search_sec),
            default_tool_type: env_string("DEFAULT_TOOL_TYPE", &d.default_tool_type),
        }
    }
}

// ─── Detector ─────────────────────────────────────────────────

/// Knobs of the periodic detector scheduler.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectorConfig {
    /// Seconds between ticks.
    pub poll_sec: u64,
    /// A pig is active if it produced telemetry within this many minutes.
    pub active_lookback_min: i64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_sec: 10,
            active_lookback_min: 1440,
        }
    }
}

impl DetectorConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_sec: env_or("DETECTOR_POLL_SEC", d.poll_sec),
            active_lookback_min: env_or("ACTIVE_LOOKBACK_MIN", d.active_lookback_min),
        }
    }
}

// ─── Sender ───────────────────────────────────────────────────

/// Knobs of one sender worker.
#[derive(Clone, Debug, PartialEq)]
pub struct SenderConfig {
    /// Ingest endpoint URL. Mandatory; startup fails without it.
    pub ingest_url: String,
    /// Identity recorded in `locked_by` while a row is claimed.
    pub worker_name: String,
    pub batch_size: usize,
    /// Idle sleep between empty claim rounds.
    pub sleep_sec: u64,
    pub max_attempts: i32,
    /// SENDING rows locked longer than this are considered abandoned.
    pub stale_sending_sec: i64,
    /// Reclaim sweep cadence, in loop iterations.
    pub reclaim_every_loops: u64,
    /// Wall-clock timeout of one outbound POST.
    pub request_timeout_sec: u64,
}

impl SenderConfig {
    /// Build from the environment. `PIGTRACK_INGEST_URL` is required.
    pub fn from_env() -> Result<Self> {
        let ingest_url = std::env::var("PIGTRACK_INGEST_URL")
            .context("PIGTRACK_INGEST_URL is not set; the sender has no endpoint to post to")?;
        Ok(Self {
            ingest_url,
            worker_name: env_string("WORKER_NAME", "sender-1"),
            batch_size: env_or("SENDER_BATCH", 5),
            sleep_sec: env_or("SENDER_SLEEP", 2),
            max_attempts: env_or("MAX_ATTEMPTS", 5),
            stale_sending_sec: env_or("STALE_SENDING_SEC", 300),
            reclaim_every_loops: env_or("RECLAIM_EVERY_LOOPS", 10),
            request_timeout_sec: env_or("REQUEST_TIMEOUT_SEC", 10),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_defaults_match_field_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.meters_per_channel, 25.0);
        assert_eq!(cfg.poi_tol_meters, 50.0);
        assert_eq!(cfg.speed_window_sec, 1500);
        assert_eq!(cfg.speed_short_window_sec, 300);
        assert_eq!(cfg.min_speed_dt_sec, 120);
        assert_eq!(cfg.default_tool_type, "Cleaning Tool");
    }

    #[test]
    fn detector_defaults() {
        let cfg = DetectorConfig::default();
        assert_eq!(cfg.poll_sec, 10);
        assert_eq!(cfg.active_lookback_min, 1440);
    }
}
