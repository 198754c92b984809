//! # codless-types
//!
//! Shared value types for the CodLess teleoperation stack.
//!
//! These types are used by:
//! - `codless-sim`: the motion model consumes [`Command`] targets and reports [`Pose`]
//! - `codless-backend`: dispatch, calibration, recording and playback
//! - the hub firmware bridge: [`wire`] framing on the radio link
//!
//! ## Coordinate Conventions
//!
//! - Units are device units (millimetres for position, degrees for angles),
//!   never screen pixels.
//! - Heading 0° points along +x, positive headings turn toward +y.
//! - The origin is chosen by the session's [`StartCorner`] and stays fixed
//!   for the whole session.

pub mod config;
pub mod wire;

use serde::{Deserialize, Serialize};

pub use config::{
    CalibrationData, CalibrationResult, CalibrationStep, Compensation, RobotConfig, TurnTrim,
    TRUST_THRESHOLD,
};

/// Largest magnitude any speed or turn-rate target may carry.
pub const MAX_COMMAND_MAGNITUDE: f64 = 1000.0;

// ── Validation ────────────────────────────────────────────────────────────────

/// Rejected at the boundary (enqueue / apply), never inside the integrator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} must be finite, got {value}")]
    NotFinite { field: &'static str, value: f64 },

    #[error("{field} out of range: {value} (limit ±{limit})")]
    OutOfRange {
        field: &'static str,
        value: f64,
        limit: f64,
    },

    #[error("{field} must be positive, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn check_magnitude(field: &'static str, value: f64) -> Result<(), ValidationError> {
    if !value.is_finite() {
        return Err(ValidationError::NotFinite { field, value });
    }
    if value.abs() > MAX_COMMAND_MAGNITUDE {
        return Err(ValidationError::OutOfRange {
            field,
            value,
            limit: MAX_COMMAND_MAGNITUDE,
        });
    }
    Ok(())
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// Auxiliary arm motor selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmChannel {
    Arm1,
    Arm2,
}

impl ArmChannel {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Arm1 => "ARM1",
            Self::Arm2 => "ARM2",
        }
    }
}

/// One operator intent. Immutable once built; every field is explicit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Differential drive target: forward speed and turn rate.
    Drive { speed: f64, turn_rate: f64 },
    /// Arm motor speed target.
    Arm { channel: ArmChannel, speed: f64 },
    /// Halt everything. Always wins priority.
    EmergencyStop,
}

impl Command {
    pub fn drive(speed: f64, turn_rate: f64) -> Self {
        Self::Drive { speed, turn_rate }
    }

    pub fn arm(channel: ArmChannel, speed: f64) -> Self {
        Self::Arm { channel, speed }
    }

    /// Zero drive targets.
    pub fn stop() -> Self {
        Self::Drive {
            speed: 0.0,
            turn_rate: 0.0,
        }
    }

    pub fn is_emergency(&self) -> bool {
        matches!(self, Self::EmergencyStop)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match *self {
            Self::Drive { speed, turn_rate } => {
                check_magnitude("speed", speed)?;
                check_magnitude("turn_rate", turn_rate)
            }
            Self::Arm { speed, .. } => check_magnitude("arm speed", speed),
            Self::EmergencyStop => Ok(()),
        }
    }

    /// Operator-facing one-line description, e.g. `Drive: Forward + Turn Right (speed=200, turn=100)`.
    pub fn describe(&self) -> String {
        match *self {
            Self::Drive { speed, turn_rate } => {
                let mut moves = Vec::new();
                if speed > 0.0 {
                    moves.push("Forward");
                } else if speed < 0.0 {
                    moves.push("Backward");
                }
                if turn_rate > 0.0 {
                    moves.push("Turn Right");
                } else if turn_rate < 0.0 {
                    moves.push("Turn Left");
                }
                if moves.is_empty() {
                    return "Drive: Stopped".to_string();
                }
                format!(
                    "Drive: {} (speed={speed}, turn={turn_rate})",
                    moves.join(" + ")
                )
            }
            Self::Arm { channel, speed } => {
                let dir = if speed > 0.0 {
                    "Up"
                } else if speed < 0.0 {
                    "Down"
                } else {
                    "Stop"
                };
                format!("{}: {dir} (speed={speed})", channel.label())
            }
            Self::EmergencyStop => "EMERGENCY STOP".to_string(),
        }
    }
}

// ── Pose ──────────────────────────────────────────────────────────────────────

/// Normalize an angle in degrees to (−180, 180].
pub fn normalize_angle_deg(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    if wrapped > 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}

/// Planar robot pose in device units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    /// Stored in [0, 360).
    pub heading_deg: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, heading_deg: f64) -> Self {
        Self {
            x,
            y,
            heading_deg: heading_deg.rem_euclid(360.0),
        }
    }

    /// Heading in (−180, 180], for error math.
    pub fn heading_signed(&self) -> f64 {
        normalize_angle_deg(self.heading_deg)
    }

    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        (x - self.x).hypot(y - self.y)
    }
}

/// One point of a recorded path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseSample {
    pub time_offset_ms: u64,
    pub x: f64,
    pub y: f64,
    pub heading_deg: f64,
}

impl PoseSample {
    pub fn from_pose(time_offset_ms: u64, pose: &Pose) -> Self {
        Self {
            time_offset_ms,
            x: pose.x,
            y: pose.y,
            heading_deg: pose.heading_deg,
        }
    }

    pub fn pose(&self) -> Pose {
        Pose::new(self.x, self.y, self.heading_deg)
    }
}

/// Field corner the robot starts from; fixes origin and axis orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartCorner {
    #[default]
    BottomLeft,
    BottomRight,
    TopLeft,
    TopRight,
}

// ── Recording ─────────────────────────────────────────────────────────────────

/// A raw operator key transition, as captured before resolution to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInputEvent {
    pub key: char,
    pub pressed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RecordedPayload {
    Command(Command),
    Input(RawInputEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub timestamp_offset_ms: u64,
    pub payload: RecordedPayload,
}

/// A captured run. Immutable once saved; re-recording creates a new run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    pub name: String,
    pub events: Vec<RecordedEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<PoseSample>>,
    #[serde(default)]
    pub start_corner: StartCorner,
    /// Unix milliseconds.
    pub created_at: i64,
}

impl Run {
    /// Path-pursuit is only possible with at least one waypoint.
    pub fn has_path(&self) -> bool {
        self.path.as_ref().is_some_and(|p| !p.is_empty())
    }

    /// Offset of the last event, in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.events
            .last()
            .map(|e| e.timestamp_offset_ms)
            .unwrap_or(0)
    }

    pub fn command_count(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e.payload, RecordedPayload::Command(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_finite_and_oversized_targets() {
        assert!(Command::drive(200.0, 0.0).validate().is_ok());
        assert!(matches!(
            Command::drive(f64::NAN, 0.0).validate(),
            Err(ValidationError::NotFinite { field: "speed", .. })
        ));
        assert!(matches!(
            Command::drive(0.0, f64::INFINITY).validate(),
            Err(ValidationError::NotFinite { field: "turn_rate", .. })
        ));
        assert!(matches!(
            Command::arm(ArmChannel::Arm2, -1500.0).validate(),
            Err(ValidationError::OutOfRange { .. })
        ));
        assert!(Command::EmergencyStop.validate().is_ok());
    }

    #[test]
    fn describes_commands_for_the_operator() {
        assert_eq!(Command::stop().describe(), "Drive: Stopped");
        assert_eq!(
            Command::drive(200.0, 100.0).describe(),
            "Drive: Forward + Turn Right (speed=200, turn=100)"
        );
        assert_eq!(
            Command::arm(ArmChannel::Arm1, -200.0).describe(),
            "ARM1: Down (speed=-200)"
        );
    }

    #[test]
    fn command_json_is_tagged() {
        let json = serde_json::to_value(Command::drive(200.0, -50.0)).unwrap();
        assert_eq!(json["type"], "drive");
        assert_eq!(json["turn_rate"], -50.0);

        let back: Command = serde_json::from_str(r#"{"type":"emergency_stop"}"#).unwrap();
        assert!(back.is_emergency());

        let arm: Command =
            serde_json::from_str(r#"{"type":"arm","channel":"arm2","speed":120.0}"#).unwrap();
        assert_eq!(arm, Command::arm(ArmChannel::Arm2, 120.0));
    }

    #[test]
    fn heading_normalization() {
        assert_eq!(normalize_angle_deg(190.0), -170.0);
        assert_eq!(normalize_angle_deg(-180.0), 180.0);
        assert_eq!(normalize_angle_deg(720.0), 0.0);
        assert_eq!(Pose::new(0.0, 0.0, -90.0).heading_deg, 270.0);
        assert_eq!(Pose::new(0.0, 0.0, 270.0).heading_signed(), -90.0);
    }

    #[test]
    fn run_reports_path_and_duration() {
        let run = Run {
            id: "r1".into(),
            name: "mission 1".into(),
            events: vec![
                RecordedEvent {
                    timestamp_offset_ms: 0,
                    payload: RecordedPayload::Command(Command::drive(200.0, 0.0)),
                },
                RecordedEvent {
                    timestamp_offset_ms: 750,
                    payload: RecordedPayload::Input(RawInputEvent {
                        key: 'w',
                        pressed: false,
                    }),
                },
            ],
            path: Some(vec![]),
            start_corner: StartCorner::BottomLeft,
            created_at: 0,
        };
        assert!(!run.has_path());
        assert_eq!(run.duration_ms(), 750);
        assert_eq!(run.command_count(), 1);
    }
}
