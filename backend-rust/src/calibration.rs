//! calibration.rs — Multi-step calibration sequencer
//!
//! Tick-driven like a procedure graph: the owner calls [`CalibrationSequencer::resume`]
//! whenever a `WakeAt` it was given comes due, passing what the robot (or the
//! simulator) currently reports. The sequencer never touches a transport or a
//! clock; it answers with [`CalibrationEvent`]s: commands to issue, progress,
//! the next wake time, and finally a whole new [`RobotConfig`].
//!
//! Each step runs one attempt as
//! `Pending → Running (maneuver) → Settling → Measuring`. A measurement that
//! does not arrive within the step timeout fails the attempt; the step is
//! retried after a fixed delay up to `max_attempts` times.
//!
//! Gyro drift is a sensor error. Once the gyroscope step has a trusted rate,
//! every heading the sequencer reads is corrected by `rate × elapsed`, and the
//! heading-based steps measured before it are re-derived.

use std::time::Duration;

use codless_sim::robot_sim::heading_delta;
use codless_sim::{MotionModel, MotionParams};
use codless_types::config::quality_score;
use codless_types::{CalibrationResult, CalibrationStep, Command, Compensation, Pose, RobotConfig};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CalibrationConfig;
use crate::error::StateError;

pub const CANCELLED_REASON: &str = "Calibration cancelled by user";

/// Deviation at which each step's confidence reaches zero.
const MOTOR_RESPONSE_RANGE_MS: f64 = 500.0;
const STRAIGHT_DRIFT_RANGE_DEG: f64 = 10.0;
const TURN_RATIO_RANGE: f64 = 0.5;
const GYRO_RANGE_DEG_S: f64 = 1.0;
const BALANCE_RANGE: f64 = 0.2;

/// Below this along-track distance a balance run is unusable, mm.
const MIN_BALANCE_TRAVEL: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "step", rename_all = "snake_case")]
pub enum CalibrationState {
    NotStarted,
    Running(CalibrationStep),
    Finalization,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationEvent {
    /// Send this command to the robot (or simulator).
    Issue(Command),
    StepStarted { step: CalibrationStep, attempt: u32 },
    StepCompleted(CalibrationResult),
    StepRetry { step: CalibrationStep, attempt: u32, reason: String },
    Progress(u8),
    /// Call `resume` again at this instant.
    WakeAt(Instant),
    Completed { config: RobotConfig, quality: f64 },
    Failed { step: Option<CalibrationStep>, reason: String },
}

/// What the robot reports right now. Fields the route cannot provide stay `None`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Observation {
    pub heading_deg: Option<f64>,
    pub position: Option<(f64, f64)>,
    pub moving: Option<bool>,
    pub last_ack_at: Option<Instant>,
    /// When heading/position were last refreshed.
    pub updated_at: Option<Instant>,
}

impl Observation {
    /// Everything a simulator knows, fresh as of `now`.
    pub fn from_model(model: &MotionModel, now: Instant) -> Self {
        let pose = model.pose();
        Self {
            heading_deg: Some(model.reported_heading()),
            position: Some((pose.x, pose.y)),
            moving: Some(model.is_moving()),
            last_ack_at: None,
            updated_at: Some(now),
        }
    }
}

// ── Step plans ────────────────────────────────────────────────────────────────

struct StepPlan {
    command: Option<Command>,
    run: Duration,
    settle: Duration,
}

fn plan(step: CalibrationStep, cfg: &CalibrationConfig) -> StepPlan {
    let ms = Duration::from_millis;
    let straight = Command::drive(cfg.test_speed, 0.0);
    match step {
        CalibrationStep::MotorResponseTime => StepPlan {
            command: Some(straight),
            run: ms(200),
            settle: ms(100),
        },
        CalibrationStep::StraightTracking => StepPlan {
            command: Some(straight),
            run: ms(2000),
            settle: ms(100),
        },
        CalibrationStep::TurnAccuracy => StepPlan {
            command: Some(Command::drive(0.0, cfg.test_turn_rate)),
            run: ms(1500),
            settle: ms(300),
        },
        CalibrationStep::GyroscopeCalibration => StepPlan {
            command: None,
            run: ms(1000),
            settle: Duration::ZERO,
        },
        CalibrationStep::MotorBalance => StepPlan {
            command: Some(straight),
            run: ms(1000),
            settle: ms(100),
        },
    }
}

fn confidence(deviation: f64, range: f64) -> f64 {
    (1.0 - deviation.abs() / range).clamp(0.0, 1.0)
}

// ── Attempt state ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum Stage {
    Pending { start_at: Instant },
    Running { stop_at: Instant },
    Settling { until: Instant },
    Measuring { since: Instant, deadline: Instant },
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    heading: Option<f64>,
    position: Option<(f64, f64)>,
    /// When the baseline reading was taken.
    at: Option<Instant>,
}

/// Raw heading change of a step that ran before the gyro rate was known.
#[derive(Debug, Clone, Copy)]
struct HeadingSample {
    step: CalibrationStep,
    change: f64,
    elapsed_s: f64,
    run_s: f64,
}

struct Active {
    step: CalibrationStep,
    attempt: u32,
    stage: Stage,
    command_at: Option<Instant>,
    baseline: Baseline,
    response: Option<Duration>,
}

impl Active {
    fn pending(step: CalibrationStep, attempt: u32, start_at: Instant) -> Self {
        Self {
            step,
            attempt,
            stage: Stage::Pending { start_at },
            command_at: None,
            baseline: Baseline {
                heading: None,
                position: None,
                at: None,
            },
            response: None,
        }
    }
}

enum Measurement {
    Ready(CalibrationResult, Compensation),
    NotYet,
    Invalid(String),
}

// ── Sequencer ─────────────────────────────────────────────────────────────────

pub struct CalibrationSequencer {
    cfg: CalibrationConfig,
    state: CalibrationState,
    active: Option<Active>,
    results: Vec<CalibrationResult>,
    working: RobotConfig,
    simulated: bool,
    /// Heading change per unit of turn command per second.
    heading_gain: f64,
    expected_turn_deg: f64,
    progress: u8,
    started_at: Option<Instant>,
    /// Trusted gyro drift, °/s; zero until the gyroscope step measures it.
    gyro_rate: f64,
    heading_samples: Vec<HeadingSample>,
}

impl CalibrationSequencer {
    pub fn new(cfg: CalibrationConfig) -> Self {
        Self {
            cfg,
            state: CalibrationState::NotStarted,
            active: None,
            results: Vec::new(),
            working: RobotConfig::default(),
            simulated: false,
            heading_gain: 1.0,
            expected_turn_deg: 0.0,
            progress: 0,
            started_at: None,
            gyro_rate: 0.0,
            heading_samples: Vec::new(),
        }
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    pub fn results(&self) -> &[CalibrationResult] {
        &self.results
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn current_step(&self) -> Option<CalibrationStep> {
        self.active.as_ref().map(|a| a.step)
    }

    /// Begin a run against the simulator (`simulation` given) or the connected robot.
    pub fn start(
        &mut self,
        now: Instant,
        base: &RobotConfig,
        connected: bool,
        simulation: Option<&MotionParams>,
    ) -> Result<Vec<CalibrationEvent>, StateError> {
        if self.is_running() {
            return Err(StateError::CalibrationRunning);
        }
        if !connected && simulation.is_none() {
            return Err(StateError::NoRoute);
        }

        self.working = base.clone();
        self.working.clear_calibration();
        self.results.clear();
        self.simulated = simulation.is_some();
        self.started_at = Some(now);
        self.gyro_rate = 0.0;
        self.heading_samples.clear();

        let turn_plan = plan(CalibrationStep::TurnAccuracy, &self.cfg);
        match simulation {
            Some(params) => {
                self.heading_gain = params.heading_factor();
                self.expected_turn_deg = reference_turn(params, &turn_plan);
            }
            None => {
                self.heading_gain = 1.0;
                self.expected_turn_deg = self.cfg.test_turn_rate * turn_plan.run.as_secs_f64();
            }
        }

        let first = CalibrationStep::MotorResponseTime;
        let start_at = now + Duration::from_millis(self.cfg.first_step_delay_ms);
        self.active = Some(Active::pending(first, 1, start_at));
        self.state = CalibrationState::Running(first);
        self.progress = 0;

        info!(
            "🎯 Calibration started ({}), expected turn {:.1}°",
            if self.simulated { "simulation" } else { "hardware" },
            self.expected_turn_deg
        );
        Ok(vec![CalibrationEvent::Progress(0), CalibrationEvent::WakeAt(start_at)])
    }

    /// User cancellation. Stops the robot and fails the run.
    pub fn cancel(&mut self) -> Result<Vec<CalibrationEvent>, StateError> {
        if !self.is_running() {
            return Err(StateError::CalibrationIdle);
        }
        Ok(self.abort(CANCELLED_REASON))
    }

    /// Fail the run if one is active (emergency stop, disconnect). No-op otherwise.
    pub fn abort(&mut self, reason: &str) -> Vec<CalibrationEvent> {
        let Some(active) = self.active.take() else {
            return vec![];
        };
        warn!("Calibration aborted during {}: {reason}", active.step.label());
        self.state = CalibrationState::Failed;
        vec![
            CalibrationEvent::Issue(Command::stop()),
            CalibrationEvent::Failed {
                step: Some(active.step),
                reason: reason.to_string(),
            },
        ]
    }

    pub fn resume(&mut self, now: Instant, obs: &Observation) -> Vec<CalibrationEvent> {
        let mut events = Vec::new();
        let Some(mut active) = self.active.take() else {
            return events;
        };
        let plan = plan(active.step, &self.cfg);
        let poll = Duration::from_millis(self.cfg.poll_ms.max(1));

        loop {
            match active.stage {
                Stage::Pending { start_at } => {
                    if now < start_at {
                        events.push(CalibrationEvent::WakeAt(start_at));
                        break;
                    }
                    if active.attempt == 1 {
                        self.progress = active.step.progress_pct();
                        events.push(CalibrationEvent::Progress(self.progress));
                    }
                    info!("Calibration step {} (attempt {})", active.step.label(), active.attempt);
                    events.push(CalibrationEvent::StepStarted {
                        step: active.step,
                        attempt: active.attempt,
                    });
                    active.baseline = Baseline {
                        heading: obs.heading_deg,
                        position: obs.position,
                        at: Some(obs.updated_at.unwrap_or(now)),
                    };
                    active.response = None;
                    active.command_at = plan.command.map(|cmd| {
                        events.push(CalibrationEvent::Issue(cmd));
                        now
                    });
                    active.stage = Stage::Running {
                        stop_at: now + plan.run,
                    };
                }
                Stage::Running { stop_at } => {
                    self.detect_response(&mut active, obs, now);
                    if now < stop_at {
                        let wake = if active.step == CalibrationStep::MotorResponseTime
                            && active.response.is_none()
                        {
                            (now + poll).min(stop_at)
                        } else {
                            stop_at
                        };
                        events.push(CalibrationEvent::WakeAt(wake));
                        break;
                    }
                    if plan.command.is_some() {
                        events.push(CalibrationEvent::Issue(Command::stop()));
                    }
                    active.stage = Stage::Settling {
                        until: now + plan.settle,
                    };
                }
                Stage::Settling { until } => {
                    if now < until {
                        events.push(CalibrationEvent::WakeAt(until));
                        break;
                    }
                    active.stage = Stage::Measuring {
                        since: now,
                        deadline: now + self.step_timeout(),
                    };
                }
                Stage::Measuring { since, deadline } => {
                    self.detect_response(&mut active, obs, now);
                    match self.measure(&active, obs, since, &plan) {
                        Measurement::Ready(result, compensation) => {
                            self.record(active.step, compensation);
                            if active.step == CalibrationStep::GyroscopeCalibration {
                                self.apply_gyro_rate(compensation);
                            }
                            info!("✅ {}", result.description);
                            self.results.push(result.clone());
                            events.push(CalibrationEvent::StepCompleted(result));
                            match active.step.next() {
                                Some(next) => {
                                    let start_at = now + Duration::from_millis(self.cfg.step_gap_ms);
                                    self.state = CalibrationState::Running(next);
                                    active = Active::pending(next, 1, start_at);
                                }
                                None => {
                                    events.extend(self.finalize());
                                    return events;
                                }
                            }
                        }
                        Measurement::NotYet if now < deadline => {
                            events.push(CalibrationEvent::WakeAt((now + poll).min(deadline)));
                            break;
                        }
                        Measurement::NotYet => {
                            let reason = format!(
                                "{} timed out after {}ms",
                                active.step.label(),
                                self.step_timeout().as_millis()
                            );
                            match self.fail_attempt(active, reason, now, &mut events) {
                                Some(retry) => active = retry,
                                None => return events,
                            }
                        }
                        Measurement::Invalid(reason) => {
                            match self.fail_attempt(active, reason, now, &mut events) {
                                Some(retry) => active = retry,
                                None => return events,
                            }
                        }
                    }
                }
            }
        }

        self.active = Some(active);
        events
    }

    fn step_timeout(&self) -> Duration {
        Duration::from_millis(if self.simulated {
            self.cfg.sim_step_timeout_ms
        } else {
            self.cfg.step_timeout_ms
        })
    }

    fn detect_response(&self, active: &mut Active, obs: &Observation, now: Instant) {
        if active.step != CalibrationStep::MotorResponseTime || active.response.is_some() {
            return;
        }
        let Some(command_at) = active.command_at else {
            return;
        };
        let moved = if self.simulated {
            obs.moving == Some(true)
        } else {
            obs.last_ack_at.is_some_and(|t| t > command_at) || obs.moving == Some(true)
        };
        if moved {
            active.response = Some(now.saturating_duration_since(command_at));
        }
    }

    /// Record a failed attempt; returns the retry attempt, or `None` once the run has failed.
    fn fail_attempt(
        &mut self,
        active: Active,
        reason: String,
        now: Instant,
        events: &mut Vec<CalibrationEvent>,
    ) -> Option<Active> {
        warn!("Calibration attempt {} of {} failed: {reason}", active.attempt, active.step.label());
        self.results
            .push(CalibrationResult::failure(active.step, reason.clone()));
        if active.attempt < self.cfg.max_attempts {
            let start_at = now + Duration::from_millis(self.cfg.retry_delay_ms);
            events.push(CalibrationEvent::StepRetry {
                step: active.step,
                attempt: active.attempt + 1,
                reason,
            });
            return Some(Active::pending(active.step, active.attempt + 1, start_at));
        }
        self.state = CalibrationState::Failed;
        events.push(CalibrationEvent::Issue(Command::stop()));
        events.push(CalibrationEvent::Failed {
            step: Some(active.step),
            reason: format!(
                "{} failed after {} attempts: {reason}",
                active.step.label(),
                active.attempt
            ),
        });
        None
    }

    fn measure(&mut self, active: &Active, obs: &Observation, since: Instant, plan: &StepPlan) -> Measurement {
        let step = active.step;
        if step == CalibrationStep::MotorResponseTime {
            return match active.response {
                Some(rt) => {
                    let ms = rt.as_secs_f64() * 1000.0;
                    Measurement::Ready(
                        CalibrationResult::success(
                            step,
                            ms,
                            confidence(ms, MOTOR_RESPONSE_RANGE_MS),
                            format!("Motor response time: {ms:.0}ms"),
                        ),
                        Compensation::new(ms, confidence(ms, MOTOR_RESPONSE_RANGE_MS)),
                    )
                }
                None => Measurement::NotYet,
            };
        }

        // Heading/position must have been refreshed after the robot settled.
        let fresh = obs.updated_at.is_some_and(|t| t >= since);
        let (Some(heading), true) = (obs.heading_deg, fresh) else {
            return Measurement::NotYet;
        };
        let Some(base_heading) = active.baseline.heading else {
            return Measurement::Invalid("no heading reported before the maneuver".into());
        };
        let raw_change = heading_delta(base_heading, heading);
        let run_s = plan.run.as_secs_f64();
        let elapsed_s = match (active.baseline.at, obs.updated_at) {
            (Some(from), Some(to)) => to.saturating_duration_since(from).as_secs_f64(),
            _ => run_s,
        };
        let change = raw_change - self.gyro_rate * elapsed_s;

        match step {
            CalibrationStep::StraightTracking | CalibrationStep::TurnAccuracy => {
                let measured = self.heading_step(step, change, run_s);
                if matches!(measured, Measurement::Ready(..)) {
                    self.heading_samples.push(HeadingSample {
                        step,
                        change: raw_change,
                        elapsed_s,
                        run_s,
                    });
                }
                measured
            }
            CalibrationStep::GyroscopeCalibration => {
                let rate = raw_change / elapsed_s.max(run_s);
                let conf = confidence(rate, GYRO_RANGE_DEG_S);
                Measurement::Ready(
                    CalibrationResult::success(step, rate, conf, format!("Gyro drift rate: {rate:.2}°/s")),
                    Compensation::new(rate, conf),
                )
            }
            CalibrationStep::MotorBalance => {
                let ratio = match (active.baseline.position, obs.position) {
                    (Some((x0, y0)), Some((x1, y1))) => {
                        let h = self.true_heading(base_heading, active.baseline.at).to_radians();
                        let (dx, dy) = (x1 - x0, y1 - y0);
                        let along = dx * h.cos() + dy * h.sin();
                        let cross = -dx * h.sin() + dy * h.cos();
                        if along.abs() < MIN_BALANCE_TRAVEL {
                            return Measurement::Invalid("robot did not move".into());
                        }
                        cross / along
                    }
                    // Constant-curvature arc: chord deviates by half the heading change.
                    _ => (change.to_radians() / 2.0).tan(),
                };
                let conf = confidence(ratio, BALANCE_RANGE);
                Measurement::Ready(
                    CalibrationResult::success(
                        step,
                        ratio,
                        conf,
                        format!("Motor balance difference: {:+.1}%", ratio * 100.0),
                    ),
                    Compensation::new(-ratio, conf),
                )
            }
            CalibrationStep::MotorResponseTime => Measurement::NotYet,
        }
    }

    /// Straight tracking and turn accuracy from a drift-corrected heading change.
    fn heading_step(&self, step: CalibrationStep, change: f64, run_s: f64) -> Measurement {
        match step {
            CalibrationStep::StraightTracking => {
                let rate = change / run_s;
                let speed = self.cfg.test_speed;
                let bias = rate / self.heading_gain / speed;
                let conf = confidence(change, STRAIGHT_DRIFT_RANGE_DEG);
                Measurement::Ready(
                    CalibrationResult::success(
                        step,
                        change,
                        conf,
                        format!("Straight tracking drift: {change:+.2}° over {run_s:.1}s"),
                    ),
                    Compensation::new(bias, conf),
                )
            }
            CalibrationStep::TurnAccuracy => {
                if self.expected_turn_deg.abs() < f64::EPSILON {
                    return Measurement::Invalid("no expected turn".into());
                }
                let ratio = change / self.expected_turn_deg;
                if ratio <= 0.05 {
                    return Measurement::Invalid(format!("robot barely turned ({change:+.1}°)"));
                }
                let conf = confidence(ratio - 1.0, TURN_RATIO_RANGE);
                Measurement::Ready(
                    CalibrationResult::success(
                        step,
                        ratio,
                        conf,
                        format!("Turn accuracy: {:+.1}% ({change:.1}° of {:.1}°)", (ratio - 1.0) * 100.0, self.expected_turn_deg),
                    ),
                    Compensation::new(1.0 / ratio - 1.0, conf),
                )
            }
            _ => Measurement::NotYet,
        }
    }

    /// Reported heading minus the sensor drift accumulated since the run started.
    fn true_heading(&self, reported: f64, at: Option<Instant>) -> f64 {
        match (self.started_at, at) {
            (Some(start), Some(at)) => {
                reported - self.gyro_rate * at.saturating_duration_since(start).as_secs_f64()
            }
            _ => reported,
        }
    }

    /// Adopt a trusted gyro rate and re-derive the heading steps measured before it.
    fn apply_gyro_rate(&mut self, gyro: Compensation) {
        let Some(rate) = gyro.trusted() else {
            return;
        };
        self.gyro_rate = rate;
        for sample in std::mem::take(&mut self.heading_samples) {
            let change = sample.change - rate * sample.elapsed_s;
            let Measurement::Ready(result, compensation) = self.heading_step(sample.step, change, sample.run_s) else {
                continue;
            };
            info!("{} corrected for gyro drift: {}", sample.step.label(), result.description);
            self.record(sample.step, compensation);
            if let Some(slot) = self
                .results
                .iter_mut()
                .rev()
                .find(|r| r.success && r.step_name == sample.step.label())
            {
                *slot = result;
            }
        }
    }

    fn record(&mut self, step: CalibrationStep, compensation: Compensation) {
        let c = &mut self.working.calibration;
        match step {
            CalibrationStep::MotorResponseTime => c.motor_delay = compensation,
            CalibrationStep::StraightTracking => c.straight_tracking_bias = compensation,
            CalibrationStep::TurnAccuracy => c.turn_bias = compensation,
            CalibrationStep::GyroscopeCalibration => c.gyro_drift = compensation,
            CalibrationStep::MotorBalance => c.motor_balance = compensation,
        }
    }

    fn finalize(&mut self) -> Vec<CalibrationEvent> {
        self.state = CalibrationState::Finalization;
        self.progress = 95;
        let mut events = vec![CalibrationEvent::Progress(95)];

        let quality = quality_score(&self.results);
        if quality < self.cfg.quality_threshold {
            self.state = CalibrationState::Failed;
            let reason = format!(
                "Calibration quality too low: {quality:.1}% (threshold {:.1}%)",
                self.cfg.quality_threshold
            );
            warn!("{reason}");
            events.push(CalibrationEvent::Failed { step: None, reason });
            return events;
        }

        let c = &mut self.working.calibration;
        c.is_calibrated = true;
        c.calibrated_at = Some(chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string());
        c.quality = quality;

        self.state = CalibrationState::Completed;
        self.progress = 100;
        info!("🎯 Calibration complete, quality {quality:.1}%");
        events.push(CalibrationEvent::Progress(100));
        events.push(CalibrationEvent::Completed {
            config: self.working.clone(),
            quality,
        });
        events
    }
}

/// Heading change an unbiased model produces for the turn maneuver.
fn reference_turn(params: &MotionParams, plan: &StepPlan) -> f64 {
    let mut model = MotionModel::unbounded(params.clone(), Pose::default());
    if let Some(cmd) = plan.command {
        model.apply(&cmd);
    }
    model.advance(plan.run);
    model.apply(&Command::stop());
    model.advance(plan.settle);
    model.pose().heading_signed()
}
