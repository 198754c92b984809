//! scenarios.rs — Injectable drivetrain imperfections for the simulator
//!
//! Each scenario gives the calibration sequencer a specific fault to find.
//! Scenarios are toggleable at runtime via the WebSocket control API.

use serde::{Deserialize, Serialize};

use crate::robot_sim::MechanicalBias;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScenarioType {
    /// Straight runs curve: one motor is stronger than the other
    Drift,
    /// Turns come up short and straight runs curve slightly
    Imbalance,
    /// Heading sensor creeps while the robot is still
    GyroDrift,
    /// Reported heading is noisy
    NoisyHeading,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScenarioConfig {
    pub active: Vec<ScenarioType>,
    pub turn_drift_per_speed: f64,
    pub turn_scale_error: f64,
    pub gyro_drift_deg_s: f64,
    /// Standard deviation of the virtual hub's heading noise, degrees.
    pub heading_noise_deg: f64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            active: vec![],
            turn_drift_per_speed: 0.02,
            turn_scale_error: -0.1,
            gyro_drift_deg_s: 0.4,
            heading_noise_deg: 0.5,
        }
    }
}

impl ScenarioConfig {
    pub fn has(&self, s: ScenarioType) -> bool {
        self.active.contains(&s)
    }

    /// The mechanical bias the active scenarios add up to.
    pub fn bias(&self) -> MechanicalBias {
        let mut bias = MechanicalBias::default();
        if self.has(ScenarioType::Drift) {
            bias.turn_drift_per_speed += self.turn_drift_per_speed;
        }
        if self.has(ScenarioType::Imbalance) {
            bias.turn_scale_error += self.turn_scale_error;
            bias.turn_drift_per_speed += self.turn_drift_per_speed / 2.0;
        }
        if self.has(ScenarioType::GyroDrift) {
            bias.gyro_drift_deg_s += self.gyro_drift_deg_s;
        }
        bias
    }

    pub fn heading_noise(&self) -> f64 {
        if self.has(ScenarioType::NoisyHeading) {
            self.heading_noise_deg
        } else {
            0.0
        }
    }
}

/// Predefined scenario presets that can be selected from the control panel.
pub fn preset(name: &str) -> Option<ScenarioConfig> {
    let active = match name {
        "default" => vec![],
        "drift" => vec![ScenarioType::Drift],
        "imbalance" => vec![ScenarioType::Imbalance],
        "gyro_drift" => vec![ScenarioType::GyroDrift],
        "worn_robot" => vec![
            ScenarioType::Drift,
            ScenarioType::GyroDrift,
            ScenarioType::NoisyHeading,
        ],
        _ => return None,
    };
    Some(ScenarioConfig {
        active,
        ..Default::default()
    })
}
