//! odometry.rs — Dead reckoning from issued drive commands
//!
//! With no encoders on the link, the pose estimate integrates the last drive
//! command over elapsed wall time using the same speed/heading factors as the
//! motion model. Accumulates error; only meant to steer short path replays.

use codless_sim::MotionParams;
use codless_types::{Command, Pose};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct DeadReckoning {
    pose: Pose,
    speed: f64,
    turn_rate: f64,
    heading_factor: f64,
    momentum_factor: f64,
    last_update: Option<Instant>,
}

impl DeadReckoning {
    pub fn new(params: &MotionParams, pose: Pose) -> Self {
        Self {
            pose,
            speed: 0.0,
            turn_rate: 0.0,
            heading_factor: params.heading_factor(),
            momentum_factor: params.momentum_factor(),
            last_update: None,
        }
    }

    /// Restart from a known pose with the robot at rest.
    pub fn reset(&mut self, pose: Pose) {
        self.pose = pose;
        self.speed = 0.0;
        self.turn_rate = 0.0;
        self.last_update = None;
    }

    /// Integrate up to `now`, then switch to the new command's velocities.
    pub fn on_command(&mut self, command: &Command, now: Instant) {
        self.update(now);
        match *command {
            Command::Drive { speed, turn_rate } => {
                self.speed = speed;
                self.turn_rate = turn_rate;
            }
            Command::EmergencyStop => {
                self.speed = 0.0;
                self.turn_rate = 0.0;
            }
            Command::Arm { .. } => {}
        }
    }

    pub fn update(&mut self, now: Instant) -> Pose {
        let Some(last) = self.last_update.replace(now) else {
            return self.pose;
        };
        let dt = now.saturating_duration_since(last).as_secs_f64();
        if dt <= 0.0 || (self.speed == 0.0 && self.turn_rate == 0.0) {
            return self.pose;
        }

        // Midpoint heading keeps constant-rate arcs close to the true chord.
        let dtheta = self.turn_rate * self.heading_factor * dt;
        let mid = (self.pose.heading_deg + dtheta / 2.0).to_radians();
        let dist = self.speed * self.momentum_factor * dt;
        self.pose = Pose::new(
            self.pose.x + dist * mid.cos(),
            self.pose.y + dist * mid.sin(),
            self.pose.heading_deg + dtheta,
        );
        self.pose
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }
}
