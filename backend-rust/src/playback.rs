//! playback.rs — Replays a recorded Run
//!
//! Two modes. Command timing re-emits every recorded event at its original
//! offset; path pursuit steers toward each recorded pose sample in turn,
//! advancing one waypoint per pursuit tick whether or not it was reached.
//!
//! Like the calibration sequencer this is sans-IO: the controller schedules
//! the returned [`PlaybackWake`]s and feeds them back in.

use std::time::Duration;

use codless_types::{normalize_angle_deg, Command, Pose, PoseSample, RecordedPayload, Run};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::PlaybackConfig;
use crate::error::StateError;
use crate::input::InputMapper;

/// Waypoints closer than this are treated as reached; no steering toward them.
const ARRIVAL_EPSILON: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    #[serde(alias = "timing")]
    CommandTiming,
    #[serde(alias = "pursuit")]
    PathPursuit,
}

impl PlaybackMode {
    /// Pursuit whenever the run carries a path.
    pub fn for_run(run: &Run) -> Self {
        if run.has_path() {
            Self::PathPursuit
        } else {
            Self::CommandTiming
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackWake {
    Emit { index: usize, at: Instant },
    PursuitTick { at: Instant },
}

/// Output of one playback step.
#[derive(Debug, Default, PartialEq)]
pub struct PlaybackStep {
    pub commands: Vec<Command>,
    pub next: Option<PlaybackWake>,
    pub finished: bool,
}

/// Pursuit gains and output limits.
#[derive(Debug, Clone, Copy)]
pub struct PursuitGains {
    pub kp_linear: f64,
    pub kp_angular: f64,
    pub max_speed: f64,
    pub max_turn: f64,
    pub tick: Duration,
}

impl PursuitGains {
    pub fn new(cfg: &PlaybackConfig, max_speed: f64, max_turn: f64) -> Self {
        Self {
            kp_linear: cfg.kp_linear,
            kp_angular: cfg.kp_angular,
            max_speed,
            max_turn,
            tick: Duration::from_millis(cfg.pursuit_tick_ms.max(1)),
        }
    }

    /// Drive command steering from `pose` toward `target`.
    pub fn steer(&self, pose: &Pose, target: &PoseSample) -> Command {
        let (dx, dy) = (target.x - pose.x, target.y - pose.y);
        let distance = dx.hypot(dy);
        if distance < ARRIVAL_EPSILON {
            return Command::stop();
        }
        let target_heading = dy.atan2(dx).to_degrees();
        let error = normalize_angle_deg(target_heading - pose.heading_deg);
        Command::drive(
            (distance * self.kp_linear).clamp(-self.max_speed, self.max_speed),
            (error * self.kp_angular).clamp(-self.max_turn, self.max_turn),
        )
    }
}

pub struct Playback {
    run: Run,
    mode: PlaybackMode,
    gains: PursuitGains,
    /// Virtual start; shifted forward by every pause.
    origin: Instant,
    paused_at: Option<Instant>,
    next_index: usize,
    last_drive: Option<Command>,
    mapper: InputMapper,
}

impl Playback {
    /// Begin playing `run`. `mode` overrides the automatic choice.
    pub fn start(
        run: Run,
        mode: Option<PlaybackMode>,
        gains: PursuitGains,
        now: Instant,
    ) -> Result<(Self, PlaybackWake), StateError> {
        let mode = mode.unwrap_or_else(|| PlaybackMode::for_run(&run));
        let first = match mode {
            PlaybackMode::CommandTiming => {
                let first = run
                    .events
                    .first()
                    .ok_or_else(|| StateError::EmptyRun(run.name.clone()))?;
                PlaybackWake::Emit {
                    index: 0,
                    at: now + Duration::from_millis(first.timestamp_offset_ms),
                }
            }
            PlaybackMode::PathPursuit => {
                if !run.has_path() {
                    return Err(StateError::NoPath(run.name.clone()));
                }
                PlaybackWake::PursuitTick { at: now }
            }
        };
        info!("▶ Playing '{}' ({mode:?})", run.name);
        Ok((
            Self {
                run,
                mode,
                gains,
                origin: now,
                paused_at: None,
                next_index: 0,
                last_drive: None,
                mapper: InputMapper::new(),
            },
            first,
        ))
    }

    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn run_name(&self) -> &str {
        &self.run.name
    }

    pub fn run_id(&self) -> &str {
        &self.run.id
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    /// Items already played and total items (events or waypoints).
    pub fn progress(&self) -> (usize, usize) {
        let total = match self.mode {
            PlaybackMode::CommandTiming => self.run.events.len(),
            PlaybackMode::PathPursuit => self.run.path.as_ref().map_or(0, Vec::len),
        };
        (self.next_index.min(total), total)
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        self.paused_at
            .unwrap_or(now)
            .saturating_duration_since(self.origin)
    }

    /// Emit the event at `index` plus any later events already due.
    pub fn emit(&mut self, index: usize, now: Instant) -> PlaybackStep {
        if self.mode != PlaybackMode::CommandTiming || self.is_paused() || index != self.next_index {
            return PlaybackStep::default();
        }
        let mut step = PlaybackStep::default();
        let elapsed_ms = self.elapsed(now).as_millis() as u64;

        while let Some(event) = self.run.events.get(self.next_index) {
            if self.next_index != index && event.timestamp_offset_ms > elapsed_ms {
                step.next = Some(PlaybackWake::Emit {
                    index: self.next_index,
                    at: self.origin + Duration::from_millis(event.timestamp_offset_ms),
                });
                return step;
            }
            let command = match &event.payload {
                RecordedPayload::Command(cmd) => Some(*cmd),
                RecordedPayload::Input(raw) => self.mapper.resolve(raw),
            };
            if let Some(cmd) = command {
                debug!("↺ +{}ms {}", event.timestamp_offset_ms, cmd.describe());
                if matches!(cmd, Command::Drive { .. }) {
                    self.last_drive = Some(cmd);
                }
                step.commands.push(cmd);
            }
            self.next_index += 1;
        }

        step.finished = true;
        info!("Playback of '{}' finished", self.run.name);
        step
    }

    /// One pursuit tick: steer toward the next waypoint, or stop after the last.
    pub fn pursuit_tick(&mut self, now: Instant, pose: &Pose) -> PlaybackStep {
        if self.mode != PlaybackMode::PathPursuit || self.is_paused() {
            return PlaybackStep::default();
        }
        let path = self.run.path.as_deref().unwrap_or_default();
        let Some(target) = path.get(self.next_index) else {
            info!("Path pursuit of '{}' finished", self.run.name);
            return PlaybackStep {
                commands: vec![Command::stop()],
                next: None,
                finished: true,
            };
        };
        let cmd = self.gains.steer(pose, target);
        self.next_index += 1;
        self.last_drive = Some(cmd);
        PlaybackStep {
            commands: vec![cmd],
            next: Some(PlaybackWake::PursuitTick {
                at: now + self.gains.tick,
            }),
            finished: false,
        }
    }

    pub fn pause(&mut self, now: Instant) -> Result<(), StateError> {
        if self.is_paused() {
            return Err(StateError::Playback("playing"));
        }
        self.paused_at = Some(now);
        info!("⏸ Playback of '{}' paused", self.run.name);
        Ok(())
    }

    /// Resume with elapsed time preserved. Returns the drive command to
    /// restore (pause halts the robot) and the next wake.
    pub fn resume(&mut self, now: Instant) -> Result<(Option<Command>, Option<PlaybackWake>), StateError> {
        let paused_at = self.paused_at.take().ok_or(StateError::Playback("paused"))?;
        self.origin += now.saturating_duration_since(paused_at);
        info!("▶ Playback of '{}' resumed", self.run.name);

        let next = match self.mode {
            PlaybackMode::CommandTiming => self.run.events.get(self.next_index).map(|e| {
                PlaybackWake::Emit {
                    index: self.next_index,
                    at: (self.origin + Duration::from_millis(e.timestamp_offset_ms)).max(now),
                }
            }),
            PlaybackMode::PathPursuit => Some(PlaybackWake::PursuitTick { at: now }),
        };
        let restore = match self.mode {
            PlaybackMode::CommandTiming => self.last_drive,
            PlaybackMode::PathPursuit => None,
        };
        Ok((restore, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codless_types::{RawInputEvent, RecordedEvent, StartCorner};

    fn gains() -> PursuitGains {
        PursuitGains::new(&PlaybackConfig::default(), 500.0, 200.0)
    }

    fn run(events: Vec<(u64, RecordedPayload)>, path: Option<Vec<PoseSample>>) -> Run {
        Run {
            id: "r".into(),
            name: "test".into(),
            events: events
                .into_iter()
                .map(|(timestamp_offset_ms, payload)| RecordedEvent {
                    timestamp_offset_ms,
                    payload,
                })
                .collect(),
            path,
            start_corner: StartCorner::BottomLeft,
            created_at: 0,
        }
    }

    fn sample(t: u64, x: f64, y: f64) -> PoseSample {
        PoseSample {
            time_offset_ms: t,
            x,
            y,
            heading_deg: 0.0,
        }
    }

    #[test]
    fn mode_follows_path_presence() {
        assert_eq!(PlaybackMode::for_run(&run(vec![], None)), PlaybackMode::CommandTiming);
        assert_eq!(PlaybackMode::for_run(&run(vec![], Some(vec![]))), PlaybackMode::CommandTiming);
        assert_eq!(
            PlaybackMode::for_run(&run(vec![], Some(vec![sample(0, 0.0, 0.0)]))),
            PlaybackMode::PathPursuit
        );
    }

    #[test]
    fn empty_runs_and_missing_paths_are_refused() {
        let now = Instant::now();
        assert!(matches!(
            Playback::start(run(vec![], None), None, gains(), now),
            Err(StateError::EmptyRun(_))
        ));
        let r = run(vec![(0, RecordedPayload::Command(Command::stop()))], None);
        assert!(matches!(
            Playback::start(r, Some(PlaybackMode::PathPursuit), gains(), now),
            Err(StateError::NoPath(_))
        ));
    }

    #[test]
    fn timing_mode_emits_at_offsets_and_resolves_raw_input() {
        let t0 = Instant::now();
        let r = run(
            vec![
                (0, RecordedPayload::Command(Command::drive(200.0, 0.0))),
                (0, RecordedPayload::Command(Command::arm(codless_types::ArmChannel::Arm1, 200.0))),
                (300, RecordedPayload::Input(RawInputEvent { key: 'd', pressed: true })),
            ],
            None,
        );
        let (mut pb, first) = Playback::start(r, None, gains(), t0).unwrap();
        assert_eq!(first, PlaybackWake::Emit { index: 0, at: t0 });

        let step = pb.emit(0, t0);
        assert_eq!(step.commands.len(), 2);
        assert_eq!(
            step.next,
            Some(PlaybackWake::Emit {
                index: 2,
                at: t0 + Duration::from_millis(300)
            })
        );

        // Stale wakes are ignored.
        assert_eq!(pb.emit(0, t0), PlaybackStep::default());

        let step = pb.emit(2, t0 + Duration::from_millis(300));
        assert_eq!(step.commands, vec![Command::drive(0.0, 100.0)]);
        assert!(step.finished);
    }

    #[test]
    fn pause_preserves_elapsed_time() {
        let t0 = Instant::now();
        let r = run(
            vec![
                (0, RecordedPayload::Command(Command::drive(200.0, 0.0))),
                (1000, RecordedPayload::Command(Command::stop())),
            ],
            None,
        );
        let (mut pb, _) = Playback::start(r, None, gains(), t0).unwrap();
        pb.emit(0, t0);

        pb.pause(t0 + Duration::from_millis(400)).unwrap();
        assert!(pb.pause(t0 + Duration::from_millis(400)).is_err());
        assert_eq!(pb.elapsed(t0 + Duration::from_secs(5)), Duration::from_millis(400));

        let (restore, next) = pb.resume(t0 + Duration::from_millis(2400)).unwrap();
        assert_eq!(restore, Some(Command::drive(200.0, 0.0)));
        assert_eq!(
            next,
            Some(PlaybackWake::Emit {
                index: 1,
                at: t0 + Duration::from_millis(3000)
            })
        );
        assert_eq!(pb.resume(t0).unwrap_err(), StateError::Playback("paused"));
    }

    #[test]
    fn straight_two_point_pursuit_drives_full_speed_ahead() {
        let t0 = Instant::now();
        let r = run(vec![], Some(vec![sample(0, 0.0, 0.0), sample(100, 2000.0, 0.0)]));
        let (mut pb, first) = Playback::start(r, None, gains(), t0).unwrap();
        assert_eq!(first, PlaybackWake::PursuitTick { at: t0 });

        let pose = Pose::new(0.0, 0.0, 0.0);
        // First waypoint is where the robot already is.
        assert_eq!(pb.pursuit_tick(t0, &pose).commands, vec![Command::stop()]);

        let step = pb.pursuit_tick(t0 + Duration::from_millis(100), &pose);
        let Command::Drive { speed, turn_rate } = step.commands[0] else {
            panic!("expected drive");
        };
        assert_eq!(speed, 500.0);
        assert!(turn_rate.abs() < 1e-9);

        let last = pb.pursuit_tick(t0 + Duration::from_millis(200), &pose);
        assert_eq!(last.commands, vec![Command::stop()]);
        assert!(last.finished);
    }

    #[test]
    fn steering_wraps_and_clamps() {
        let g = gains();
        // Target behind-left of a robot facing +x: error wraps to +135°.
        let cmd = g.steer(&Pose::new(0.0, 0.0, 0.0), &sample(0, -100.0, 100.0));
        assert_eq!(cmd, Command::drive((100.0f64.hypot(100.0)) * 0.5, 200.0));

        let cmd = g.steer(&Pose::new(0.0, 0.0, 350.0), &sample(0, 100.0, 0.0));
        let Command::Drive { turn_rate, .. } = cmd else { unreachable!() };
        assert!((turn_rate - 20.0).abs() < 1e-9);
    }
}
