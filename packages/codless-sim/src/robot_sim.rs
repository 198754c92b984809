//! robot_sim.rs — Fixed-step robot motion model
//!
//! Integrates four scalar channels (linear speed, turn rate, arm 1, arm 2)
//! toward their commanded targets with an S-curve acceleration profile, then
//! moves the pose. Pure state machine: no clocks, no I/O. Callers feed wall
//! time through [`MotionModel::advance`], which only ever runs whole steps.
//!
//! Units are device units: mm, mm/s, degrees, °/s.

use std::time::Duration;

use codless_types::{normalize_angle_deg, ArmChannel, Command, Pose, StartCorner, TurnTrim};
use serde::{Deserialize, Serialize};

/// Speeds below this are treated as stationary for pose integration.
const DRIVE_DEADBAND: f64 = 0.01;
const ARM_DEADBAND: f64 = 0.1;
const ARM_LIMIT_DEG: f64 = 90.0;
/// Tolerance so float drift in the accumulator never drops a due step.
const STEP_EPSILON: f64 = 1e-9;

// ── Parameters ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionParams {
    /// Fixed integration step, seconds.
    pub dt: f64,
    /// Acceleration commanded per unit of velocity error.
    pub accel_gain: f64,
    /// Jerk limit as a multiple of each channel's max acceleration.
    pub jerk_factor: f64,
    pub friction: f64,
    pub motor_lag: f64,
    /// Per-step velocity retention.
    pub inertial_damping: f64,
    pub mass: f64,
    pub inertia: f64,
    pub arm_inertia: f64,
    pub max_drive_accel: f64,
    pub max_turn_accel: f64,
    pub max_arm_accel: f64,
    /// Arm angle change, degrees per speed unit per second.
    pub arm_rate: f64,
}

impl Default for MotionParams {
    fn default() -> Self {
        Self {
            dt: 1.0 / 60.0,
            accel_gain: 15.0,
            jerk_factor: 8.0,
            friction: 0.05,
            motor_lag: 0.03,
            inertial_damping: 0.995,
            mass: 2.5,
            inertia: 0.12,
            arm_inertia: 0.05,
            max_drive_accel: 800.0,
            max_turn_accel: 600.0,
            max_arm_accel: 1000.0,
            arm_rate: 0.3,
        }
    }
}

impl MotionParams {
    /// Fraction of the turn rate that becomes heading change.
    pub fn heading_factor(&self) -> f64 {
        1.0 / (1.0 + 2.0 * self.inertia)
    }

    /// Fraction of the linear speed that becomes displacement.
    pub fn momentum_factor(&self) -> f64 {
        1.0 / (1.0 + 0.1 * self.mass)
    }

    pub fn arm_momentum(&self) -> f64 {
        1.0 / (1.0 + 0.8 * self.arm_inertia)
    }
}

/// Field rectangle the simulated robot is confined to, mm.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceBounds {
    pub width: f64,
    pub height: f64,
    /// Distance from each wall the robot's centre may not cross.
    pub margin: f64,
    /// Distance from the walls of the start corner poses.
    pub start_inset: f64,
}

impl Default for WorkspaceBounds {
    fn default() -> Self {
        Self {
            width: 2362.0,
            height: 1143.0,
            margin: 30.0,
            start_inset: 150.0,
        }
    }
}

impl WorkspaceBounds {
    pub fn clamp(&self, x: f64, y: f64) -> (f64, f64) {
        (
            x.clamp(self.margin, (self.width - self.margin).max(self.margin)),
            y.clamp(self.margin, (self.height - self.margin).max(self.margin)),
        )
    }

    /// Initial pose for a start corner. Right-hand corners face −x.
    pub fn start_pose(&self, corner: StartCorner) -> Pose {
        let (left, right) = (self.start_inset, self.width - self.start_inset);
        let (bottom, top) = (self.start_inset, self.height - self.start_inset);
        match corner {
            StartCorner::BottomLeft => Pose::new(left, bottom, 0.0),
            StartCorner::BottomRight => Pose::new(right, bottom, 180.0),
            StartCorner::TopLeft => Pose::new(left, top, 0.0),
            StartCorner::TopRight => Pose::new(right, top, 180.0),
        }
    }
}

/// Imperfections injected into the simulated drivetrain so calibration has
/// something to measure without hardware.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MechanicalBias {
    /// Extra turn rate per unit of commanded speed (uneven motors).
    pub turn_drift_per_speed: f64,
    /// Relative error of the achieved turn rate (−0.1 = turns 10% short).
    pub turn_scale_error: f64,
    /// Heading sensor drift, °/s. Affects the reported heading only.
    pub gyro_drift_deg_s: f64,
}

impl MechanicalBias {
    pub fn is_none(&self) -> bool {
        *self == Self::default()
    }
}

// ── Channels ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Channel {
    pub target: f64,
    pub actual: f64,
    pub accel: f64,
}

impl Channel {
    fn reset(&mut self) {
        *self = Self::default();
    }

    /// One S-curve step toward `target`.
    fn step(&mut self, target: f64, max_accel: f64, p: &MotionParams) {
        let error = target - self.actual;
        let desired = (error * p.accel_gain).clamp(-max_accel, max_accel);
        let max_jerk_step = max_accel * p.jerk_factor * p.dt;
        let delta = desired - self.accel;
        let shaped = if delta.abs() > max_jerk_step {
            self.accel + max_jerk_step.copysign(delta)
        } else {
            desired
        };
        let friction = 1.0 - p.friction * p.dt;
        let damping = 0.92 + 0.08 * (-error.abs() * 0.1).exp();
        self.accel = shaped * friction * damping;

        self.actual += self.accel * p.dt * (1.0 - p.motor_lag);
        self.actual *= p.inertial_damping;
    }
}

// ── Model ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MotionSnapshot {
    pub pose: Pose,
    pub reported_heading_deg: f64,
    pub speed: f64,
    pub turn_rate: f64,
    pub arm1_deg: f64,
    pub arm2_deg: f64,
    pub sim_time_s: f64,
}

#[derive(Debug, Clone)]
pub struct MotionModel {
    params: MotionParams,
    /// `Some` for the simulator; `None` never clamps.
    bounds: Option<WorkspaceBounds>,
    trim: TurnTrim,
    bias: MechanicalBias,
    speed: Channel,
    turn: Channel,
    arm1: Channel,
    arm2: Channel,
    pose: Pose,
    arm1_deg: f64,
    arm2_deg: f64,
    gyro_offset_deg: f64,
    accumulator: f64,
    sim_time_s: f64,
}

impl MotionModel {
    /// A simulator confined to `bounds`, placed at the start corner.
    pub fn simulator(params: MotionParams, bounds: WorkspaceBounds, corner: StartCorner) -> Self {
        let pose = bounds.start_pose(corner);
        Self::build(params, Some(bounds), pose)
    }

    /// An unconfined model starting at `pose`.
    pub fn unbounded(params: MotionParams, pose: Pose) -> Self {
        Self::build(params, None, pose)
    }

    fn build(params: MotionParams, bounds: Option<WorkspaceBounds>, pose: Pose) -> Self {
        Self {
            params,
            bounds,
            trim: TurnTrim::default(),
            bias: MechanicalBias::default(),
            speed: Channel::default(),
            turn: Channel::default(),
            arm1: Channel::default(),
            arm2: Channel::default(),
            pose,
            arm1_deg: 0.0,
            arm2_deg: 0.0,
            gyro_offset_deg: 0.0,
            accumulator: 0.0,
            sim_time_s: 0.0,
        }
    }

    pub fn params(&self) -> &MotionParams {
        &self.params
    }

    pub fn is_simulator(&self) -> bool {
        self.bounds.is_some()
    }

    pub fn set_turn_trim(&mut self, trim: TurnTrim) {
        self.trim = trim;
    }

    pub fn set_bias(&mut self, bias: MechanicalBias) {
        self.bias = bias;
    }

    pub fn bias(&self) -> MechanicalBias {
        self.bias
    }

    /// Set targets from a command. Validation is the caller's job.
    pub fn apply(&mut self, cmd: &Command) {
        match *cmd {
            Command::Drive { speed, turn_rate } => {
                self.speed.target = speed;
                self.turn.target = turn_rate;
            }
            Command::Arm {
                channel: ArmChannel::Arm1,
                speed,
            } => self.arm1.target = speed,
            Command::Arm {
                channel: ArmChannel::Arm2,
                speed,
            } => self.arm2.target = speed,
            Command::EmergencyStop => self.stop_all(),
        }
    }

    /// Zero every target. Velocities decay through the normal dynamics.
    pub fn stop_all(&mut self) {
        self.speed.target = 0.0;
        self.turn.target = 0.0;
        self.arm1.target = 0.0;
        self.arm2.target = 0.0;
    }

    /// Return to a start corner with every channel at rest.
    pub fn reset(&mut self, corner: StartCorner) {
        for ch in [&mut self.speed, &mut self.turn, &mut self.arm1, &mut self.arm2] {
            ch.reset();
        }
        self.pose = self
            .bounds
            .map(|b| b.start_pose(corner))
            .unwrap_or_default();
        self.arm1_deg = 0.0;
        self.arm2_deg = 0.0;
        self.gyro_offset_deg = 0.0;
        self.accumulator = 0.0;
    }

    pub fn set_pose(&mut self, pose: Pose) {
        self.pose = pose;
    }

    /// Feed elapsed wall time; runs as many whole steps as fit. Returns the step count.
    pub fn advance(&mut self, elapsed: Duration) -> u32 {
        self.accumulator += elapsed.as_secs_f64();
        let mut steps = 0;
        while self.accumulator + STEP_EPSILON >= self.params.dt {
            self.accumulator -= self.params.dt;
            self.step();
            steps += 1;
        }
        if self.accumulator < 0.0 {
            self.accumulator = 0.0;
        }
        steps
    }

    /// Exactly one fixed step.
    pub fn step(&mut self) {
        let p = &self.params;
        let turn_target = self.effective_turn_target();
        self.speed.step(self.speed.target, p.max_drive_accel, p);
        self.turn.step(turn_target, p.max_turn_accel, p);
        self.arm1.step(self.arm1.target, p.max_arm_accel, p);
        self.arm2.step(self.arm2.target, p.max_arm_accel, p);

        self.integrate_pose();
        self.integrate_arms();

        self.gyro_offset_deg += self.bias.gyro_drift_deg_s * self.params.dt;
        self.sim_time_s += self.params.dt;
    }

    fn effective_turn_target(&self) -> f64 {
        let (speed, turn) = (self.speed.target, self.turn.target);
        if speed == 0.0 && turn == 0.0 {
            return 0.0;
        }
        let trimmed = self.trim.apply(speed, turn);
        trimmed * (1.0 + self.bias.turn_scale_error) + self.bias.turn_drift_per_speed * speed
    }

    fn integrate_pose(&mut self) {
        let (v, w) = (self.speed.actual, self.turn.actual);
        if v.abs() <= DRIVE_DEADBAND && w.abs() <= DRIVE_DEADBAND {
            return;
        }
        let p = &self.params;
        let heading = self.pose.heading_deg + w * p.dt * p.heading_factor();
        let rad = heading.to_radians();
        let step = v * p.dt * p.momentum_factor();
        let mut x = self.pose.x + step * rad.cos();
        let mut y = self.pose.y + step * rad.sin();
        if let Some(bounds) = &self.bounds {
            (x, y) = bounds.clamp(x, y);
        }
        self.pose = Pose::new(x, y, heading);
    }

    fn integrate_arms(&mut self) {
        let p = &self.params;
        let gain = p.arm_rate * p.dt * p.arm_momentum();
        for (ch, angle) in [(&self.arm1, &mut self.arm1_deg), (&self.arm2, &mut self.arm2_deg)] {
            if ch.actual.abs() > ARM_DEADBAND {
                *angle = (*angle + ch.actual * gain).clamp(-ARM_LIMIT_DEG, ARM_LIMIT_DEG);
            }
        }
    }

    // ── Readouts ──────────────────────────────────────────────────────────────

    pub fn pose(&self) -> Pose {
        self.pose
    }

    /// Heading as a gyro would report it, including injected sensor drift.
    pub fn reported_heading(&self) -> f64 {
        (self.pose.heading_deg + self.gyro_offset_deg).rem_euclid(360.0)
    }

    /// Actual (speed, turn rate).
    pub fn velocity(&self) -> (f64, f64) {
        (self.speed.actual, self.turn.actual)
    }

    /// Commanded (speed, turn rate).
    pub fn drive_targets(&self) -> (f64, f64) {
        (self.speed.target, self.turn.target)
    }

    pub fn arm_targets(&self) -> (f64, f64) {
        (self.arm1.target, self.arm2.target)
    }

    pub fn arm_angles(&self) -> (f64, f64) {
        (self.arm1_deg, self.arm2_deg)
    }

    pub fn has_zero_targets(&self) -> bool {
        [self.speed.target, self.turn.target, self.arm1.target, self.arm2.target]
            .iter()
            .all(|t| *t == 0.0)
    }

    pub fn is_moving(&self) -> bool {
        let (v, w) = self.velocity();
        v.abs() > DRIVE_DEADBAND || w.abs() > DRIVE_DEADBAND
    }

    pub fn snapshot(&self) -> MotionSnapshot {
        MotionSnapshot {
            pose: self.pose,
            reported_heading_deg: self.reported_heading(),
            speed: self.speed.actual,
            turn_rate: self.turn.actual,
            arm1_deg: self.arm1_deg,
            arm2_deg: self.arm2_deg,
            sim_time_s: self.sim_time_s,
        }
    }
}

/// Signed heading change from `from` to `to`, degrees in (−180, 180].
pub fn heading_delta(from: f64, to: f64) -> f64 {
    normalize_angle_deg(to - from)
}
