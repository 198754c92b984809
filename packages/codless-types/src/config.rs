//! Robot configuration and calibration compensation.
//!
//! The calibration sequencer is the only writer of [`CalibrationData`]; everyone
//! else reads a whole [`RobotConfig`] snapshot. Compensations are only applied
//! once their confidence is above [`TRUST_THRESHOLD`].

use serde::{Deserialize, Serialize};

use crate::{Command, ValidationError, MAX_COMMAND_MAGNITUDE};

/// Compensations with confidence at or below this stay inert.
pub const TRUST_THRESHOLD: f64 = 0.5;

/// Turn-rate units added per unit of speed for each unit of measured balance difference.
const BALANCE_GAIN: f64 = 0.05;
/// Largest additive turn correction any trim may produce.
const MAX_TURN_CORRECTION: f64 = 50.0;
const MIN_TURN_GAIN: f64 = 0.5;
const MAX_TURN_GAIN: f64 = 1.5;

// ── Compensation ──────────────────────────────────────────────────────────────

/// A measured correction and how much the measurement is trusted (0–1).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Compensation {
    pub value: f64,
    pub confidence: f64,
}

impl Compensation {
    pub fn new(value: f64, confidence: f64) -> Self {
        Self {
            value,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.confidence > TRUST_THRESHOLD && self.value.is_finite()
    }

    /// The value, or `None` while the measurement is not yet trusted.
    pub fn trusted(&self) -> Option<f64> {
        self.is_trusted().then_some(self.value)
    }
}

// ── Calibration bookkeeping ───────────────────────────────────────────────────

/// The five measurement steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalibrationStep {
    MotorResponseTime,
    StraightTracking,
    TurnAccuracy,
    GyroscopeCalibration,
    MotorBalance,
}

impl CalibrationStep {
    pub const ALL: [CalibrationStep; 5] = [
        Self::MotorResponseTime,
        Self::StraightTracking,
        Self::TurnAccuracy,
        Self::GyroscopeCalibration,
        Self::MotorBalance,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::MotorResponseTime => "Motor Response Time",
            Self::StraightTracking => "Straight Tracking",
            Self::TurnAccuracy => "Turn Accuracy",
            Self::GyroscopeCalibration => "Gyroscope Drift",
            Self::MotorBalance => "Motor Balance",
        }
    }

    pub fn units(&self) -> &'static str {
        match self {
            Self::MotorResponseTime => "ms",
            Self::StraightTracking => "°",
            Self::TurnAccuracy => "factor",
            Self::GyroscopeCalibration => "°/s",
            Self::MotorBalance => "ratio",
        }
    }

    /// Progress percentage reported when the step begins.
    pub fn progress_pct(&self) -> u8 {
        match self {
            Self::MotorResponseTime => 10,
            Self::StraightTracking => 30,
            Self::TurnAccuracy => 50,
            Self::GyroscopeCalibration => 70,
            Self::MotorBalance => 85,
        }
    }

    pub fn next(&self) -> Option<CalibrationStep> {
        match self {
            Self::MotorResponseTime => Some(Self::StraightTracking),
            Self::StraightTracking => Some(Self::TurnAccuracy),
            Self::TurnAccuracy => Some(Self::GyroscopeCalibration),
            Self::GyroscopeCalibration => Some(Self::MotorBalance),
            Self::MotorBalance => None,
        }
    }
}

/// Outcome of one calibration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationResult {
    pub step_name: String,
    pub success: bool,
    pub measured_value: f64,
    pub confidence: f64,
    pub units: String,
    pub description: String,
}

impl CalibrationResult {
    pub fn success(step: CalibrationStep, measured_value: f64, confidence: f64, description: impl Into<String>) -> Self {
        Self {
            step_name: step.label().to_string(),
            success: true,
            measured_value,
            confidence: confidence.clamp(0.0, 1.0),
            units: step.units().to_string(),
            description: description.into(),
        }
    }

    pub fn failure(step: CalibrationStep, description: impl Into<String>) -> Self {
        Self {
            step_name: step.label().to_string(),
            success: false,
            measured_value: 0.0,
            confidence: 0.0,
            units: step.units().to_string(),
            description: description.into(),
        }
    }
}

/// Mean confidence of successful results × 100; 0 when nothing succeeded.
pub fn quality_score(results: &[CalibrationResult]) -> f64 {
    let ok: Vec<f64> = results
        .iter()
        .filter(|r| r.success)
        .map(|r| r.confidence)
        .collect();
    if ok.is_empty() {
        return 0.0;
    }
    ok.iter().sum::<f64>() / ok.len() as f64 * 100.0
}

/// Fields written by the calibration sequencer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CalibrationData {
    /// Milliseconds between command and observed motion.
    pub motor_delay: Compensation,
    /// Heading drift rate per unit of forward speed while driving straight.
    pub straight_tracking_bias: Compensation,
    /// Relative turn-rate error; commanded turns are scaled by `1 + value`.
    pub turn_bias: Compensation,
    /// Signed cross-track ratio while driving straight.
    pub motor_balance: Compensation,
    /// Reported-heading drift while stationary, °/s. A sensor error: it
    /// corrects heading readings and never reaches the turn channel.
    pub gyro_drift: Compensation,
    pub is_calibrated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibrated_at: Option<String>,
    pub quality: f64,
}

// ── Robot configuration ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorPorts {
    pub left: String,
    pub right: String,
    pub arm1: String,
    pub arm2: String,
}

impl Default for MotorPorts {
    fn default() -> Self {
        Self {
            left: "A".into(),
            right: "B".into(),
            arm1: "C".into(),
            arm2: "D".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RobotConfig {
    /// Wheel-to-wheel distance, mm.
    pub axle_track: f64,
    /// mm
    pub wheel_diameter: f64,
    pub ports: MotorPorts,
    pub straight_speed: f64,
    pub straight_acceleration: f64,
    pub turn_rate: f64,
    pub turn_acceleration: f64,
    pub calibration: CalibrationData,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self {
            axle_track: 112.0,
            wheel_diameter: 56.0,
            ports: MotorPorts::default(),
            straight_speed: 500.0,
            straight_acceleration: 250.0,
            turn_rate: 200.0,
            turn_acceleration: 300.0,
            calibration: CalibrationData::default(),
        }
    }
}

impl RobotConfig {
    /// Reject configurations outside physical bounds.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let positive = [
            ("axle_track", self.axle_track),
            ("wheel_diameter", self.wheel_diameter),
            ("straight_speed", self.straight_speed),
            ("straight_acceleration", self.straight_acceleration),
            ("turn_rate", self.turn_rate),
            ("turn_acceleration", self.turn_acceleration),
        ];
        for (field, value) in positive {
            if !value.is_finite() {
                return Err(ValidationError::NotFinite { field, value });
            }
            if value <= 0.0 {
                return Err(ValidationError::NotPositive { field, value });
            }
        }
        for (field, value) in [("straight_speed", self.straight_speed), ("turn_rate", self.turn_rate)] {
            if value > MAX_COMMAND_MAGNITUDE {
                return Err(ValidationError::OutOfRange {
                    field,
                    value,
                    limit: MAX_COMMAND_MAGNITUDE,
                });
            }
        }

        let ports = [
            &self.ports.left,
            &self.ports.right,
            &self.ports.arm1,
            &self.ports.arm2,
        ];
        for port in ports {
            let valid = port.len() == 1 && matches!(port.as_bytes()[0], b'A'..=b'F');
            if !valid {
                return Err(ValidationError::Invalid {
                    field: "ports",
                    reason: format!("'{port}' is not a hub port (A–F)"),
                });
            }
        }
        for (i, a) in ports.iter().enumerate() {
            if ports[i + 1..].contains(a) {
                return Err(ValidationError::Invalid {
                    field: "ports",
                    reason: format!("port {a} assigned twice"),
                });
            }
        }
        Ok(())
    }

    pub fn clear_calibration(&mut self) {
        self.calibration = CalibrationData::default();
    }

    pub fn has_valid_calibration(&self) -> bool {
        let c = &self.calibration;
        c.is_calibrated && c.calibrated_at.is_some() && c.quality > 0.0
    }

    /// Apply trusted calibration compensation to a command.
    pub fn compensate(&self, command: &Command) -> Command {
        if !self.calibration.is_calibrated {
            return *command;
        }
        match *command {
            Command::Drive { speed, turn_rate } => Command::Drive {
                speed,
                turn_rate: TurnTrim::from_config(self).apply(speed, turn_rate),
            },
            other => other,
        }
    }

    pub fn calibration_summary(&self) -> String {
        if !self.has_valid_calibration() {
            return "Robot not calibrated".to_string();
        }
        let c = &self.calibration;
        let trust = |comp: &Compensation| if comp.is_trusted() { "" } else { " (untrusted)" };
        let mut lines = vec![
            format!("Calibrated on {}", c.calibrated_at.as_deref().unwrap_or("-")),
            format!("Quality Score: {:.1}/100", c.quality),
        ];
        lines.push(format!("Motor Response Time: {:.1}ms{}", c.motor_delay.value, trust(&c.motor_delay)));
        lines.push(format!(
            "Straight Tracking Bias: {:.4}{}",
            c.straight_tracking_bias.value,
            trust(&c.straight_tracking_bias)
        ));
        lines.push(format!("Turn Bias: {:+.3}{}", c.turn_bias.value, trust(&c.turn_bias)));
        lines.push(format!("Motor Balance: {:+.4}{}", c.motor_balance.value, trust(&c.motor_balance)));
        lines.push(format!("Gyroscope Drift: {:.3}°/s{}", c.gyro_drift.value, trust(&c.gyro_drift)));
        lines.join("\n")
    }
}

// ── Turn trim ─────────────────────────────────────────────────────────────────

/// The turn-channel perturbation derived from trusted calibration fields.
///
/// Every term vanishes when both speed and turn targets are zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnTrim {
    pub straight_bias: f64,
    pub turn_gain: f64,
    pub balance: f64,
}

impl Default for TurnTrim {
    fn default() -> Self {
        Self {
            straight_bias: 0.0,
            turn_gain: 1.0,
            balance: 0.0,
        }
    }
}

impl TurnTrim {
    pub fn from_config(config: &RobotConfig) -> Self {
        let c = &config.calibration;
        Self {
            straight_bias: c.straight_tracking_bias.trusted().unwrap_or(0.0),
            turn_gain: c
                .turn_bias
                .trusted()
                .map(|b| (1.0 + b).clamp(MIN_TURN_GAIN, MAX_TURN_GAIN))
                .unwrap_or(1.0),
            balance: c.motor_balance.trusted().unwrap_or(0.0),
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, speed: f64, turn_rate: f64) -> f64 {
        if speed == 0.0 && turn_rate == 0.0 {
            return 0.0;
        }
        let mut correction = 0.0;
        let mut turn = turn_rate;
        if turn_rate == 0.0 {
            correction -= self.straight_bias * speed;
        } else {
            turn *= self.turn_gain;
        }
        correction += self.balance * speed * BALANCE_GAIN;
        turn + correction.clamp(-MAX_TURN_CORRECTION, MAX_TURN_CORRECTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calibrated(confidence: f64) -> RobotConfig {
        let mut cfg = RobotConfig::default();
        cfg.calibration = CalibrationData {
            motor_delay: Compensation::new(25.0, confidence),
            straight_tracking_bias: Compensation::new(0.02, confidence),
            turn_bias: Compensation::new(0.05, confidence),
            motor_balance: Compensation::new(-0.02, confidence),
            gyro_drift: Compensation::new(0.5, confidence),
            is_calibrated: true,
            calibrated_at: Some("2026-01-01 00:00:00".into()),
            quality: confidence * 100.0,
        };
        cfg
    }

    #[test]
    fn low_confidence_compensation_is_inert() {
        let cfg = calibrated(0.4);
        for cmd in [
            Command::drive(200.0, 0.0),
            Command::drive(200.0, 100.0),
            Command::drive(0.0, -80.0),
        ] {
            assert_eq!(cfg.compensate(&cmd), cmd);
        }
    }

    #[test]
    fn trusted_compensation_is_measurable_and_bounded() {
        let cfg = calibrated(0.9);
        let Command::Drive { turn_rate, .. } = cfg.compensate(&Command::drive(200.0, 0.0)) else {
            panic!("drive expected");
        };
        assert!(turn_rate.abs() > 1.0, "straight drive should be trimmed, got {turn_rate}");
        assert!(turn_rate.abs() <= MAX_TURN_CORRECTION);

        let Command::Drive { turn_rate, .. } = cfg.compensate(&Command::drive(0.0, 100.0)) else {
            panic!("drive expected");
        };
        assert!((turn_rate - 105.0).abs() < 1e-9);
    }

    #[test]
    fn gyro_drift_never_reaches_the_turn_channel() {
        let mut cfg = calibrated(0.9);
        let straight = cfg.compensate(&Command::drive(150.0, 0.0));
        cfg.calibration.gyro_drift = Compensation::new(0.0, 0.9);
        assert_eq!(cfg.compensate(&Command::drive(150.0, 0.0)), straight);
    }

    #[test]
    fn trim_vanishes_at_rest() {
        let trim = TurnTrim::from_config(&calibrated(0.95));
        assert_eq!(trim.apply(0.0, 0.0), 0.0);
        assert!(TurnTrim::from_config(&calibrated(0.5)).is_identity());
    }

    #[test]
    fn arm_commands_pass_through() {
        let cfg = calibrated(0.9);
        let cmd = Command::arm(crate::ArmChannel::Arm1, 200.0);
        assert_eq!(cfg.compensate(&cmd), cmd);
    }

    #[test]
    fn validate_rejects_bad_geometry_and_ports() {
        assert!(RobotConfig::default().validate().is_ok());

        let mut cfg = RobotConfig::default();
        cfg.axle_track = 0.0;
        assert!(matches!(cfg.validate(), Err(ValidationError::NotPositive { field: "axle_track", .. })));

        let mut cfg = RobotConfig::default();
        cfg.wheel_diameter = f64::NAN;
        assert!(matches!(cfg.validate(), Err(ValidationError::NotFinite { .. })));

        let mut cfg = RobotConfig::default();
        cfg.ports.arm2 = "A".into();
        assert!(matches!(cfg.validate(), Err(ValidationError::Invalid { field: "ports", .. })));
    }

    #[test]
    fn quality_uses_successful_steps_only() {
        let results = vec![
            CalibrationResult::success(CalibrationStep::MotorResponseTime, 25.0, 0.9, "ok"),
            CalibrationResult::failure(CalibrationStep::StraightTracking, "timed out"),
            CalibrationResult::success(CalibrationStep::StraightTracking, 0.3, 0.7, "ok"),
        ];
        assert!((quality_score(&results) - 80.0).abs() < 1e-9);
        assert_eq!(quality_score(&[]), 0.0);
    }

    #[test]
    fn summary_marks_untrusted_fields() {
        assert_eq!(RobotConfig::default().calibration_summary(), "Robot not calibrated");
        let mut cfg = calibrated(0.9);
        cfg.calibration.gyro_drift.confidence = 0.3;
        let summary = cfg.calibration_summary();
        assert!(summary.contains("Quality Score: 90.0/100"));
        assert!(summary.contains("Gyroscope Drift: 0.500°/s (untrusted)"));
    }
}
