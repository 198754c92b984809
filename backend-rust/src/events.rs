//! events.rs — Typed status events broadcast to every subscriber

use codless_types::{CalibrationResult, CalibrationStep, Command, Pose};
use serde::Serialize;

use crate::dispatcher::LatencyStats;
use crate::playback::PlaybackMode;

// ─── Connection ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Where commands currently go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Simulator,
    Hardware,
}

// ─── Logging ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogCategory {
    System,
    Connection,
    Motion,
    Calibration,
    Recording,
    Playback,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub id: String,
    pub timestamp: i64,
    pub level: LogLevel,
    pub category: LogCategory,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, category: LogCategory, message: impl Into<String>) -> Self {
        let timestamp = chrono::Utc::now().timestamp_millis();
        Self {
            id: format!("log-{timestamp}-{}", uuid::Uuid::new_v4().simple()),
            timestamp,
            level,
            category,
            message: message.into(),
        }
    }
}

// ─── Playback ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Playing,
    Paused,
    Stopped,
    Finished,
}

// ─── Status Events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    Connection {
        state: ConnectionState,
    },
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    Log(LogEntry),
    Battery {
        level: u8,
    },
    HubInfo {
        info: serde_json::Value,
    },
    CommandSent {
        command: Command,
        route: Route,
    },
    Latency(LatencyStats),
    EmergencyStop,
    CalibrationProgress {
        step: Option<CalibrationStep>,
        progress: u8,
    },
    CalibrationStep {
        result: CalibrationResult,
    },
    CalibrationFinished {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        quality: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Recording {
        active: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    RunSaved {
        id: String,
        name: String,
    },
    Playback {
        state: PlaybackState,
        run: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        mode: Option<PlaybackMode>,
    },
    Telemetry {
        pose: Pose,
        speed: f64,
        turn_rate: f64,
        route: Option<Route>,
    },
    Simulation {
        enabled: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_a_tag() {
        let json = serde_json::to_value(StatusEvent::Battery { level: 80 }).unwrap();
        assert_eq!(json, serde_json::json!({"event": "battery", "level": 80}));

        let log = LogEntry::new(LogLevel::Warning, LogCategory::Motion, "slow");
        let json = serde_json::to_value(StatusEvent::Log(log)).unwrap();
        assert_eq!(json["event"], "log");
        assert_eq!(json["level"], "warning");
        assert_eq!(json["category"], "MOTION");
    }
}
