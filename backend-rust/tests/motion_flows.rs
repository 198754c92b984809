//! End-to-end flows through the controller: dispatch pacing, calibration,
//! record/replay, path pursuit, emergency stop and link loss.
//!
//! Every test drives simulated time by hand: `now` advances in 5 ms ticks and
//! each tick's status events are stamped with the tick time.

use std::sync::Arc;
use std::time::Duration;

use codless_backend::config::AppConfig;
use codless_backend::controller::Controller;
use codless_backend::error::{CoreError, StateError};
use codless_backend::events::{ConnectionState, PlaybackState, StatusEvent};
use codless_backend::playback::PlaybackMode;
use codless_backend::store::{self, KeyValueStore, MemoryStore};
use codless_backend::transport::MockTransport;
use codless_sim::robot_sim::heading_delta;
use codless_types::{ArmChannel, Command, RawInputEvent, RobotConfig};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::Instant;

const TICK: Duration = Duration::from_millis(5);

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

struct Rig {
    ctl: Controller<MockTransport, Arc<MemoryStore>>,
    mock: MockTransport,
    store: Arc<MemoryStore>,
    events: broadcast::Receiver<StatusEvent>,
    seen: Vec<(Instant, StatusEvent)>,
    now: Instant,
}

impl Rig {
    fn new(simulation: bool) -> Self {
        let mut cfg = AppConfig::default();
        cfg.simulation.enabled = simulation;
        Self::with_config(cfg)
    }

    fn with_config(cfg: AppConfig) -> Self {
        let mock = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let now = Instant::now();
        let ctl = Controller::new(cfg, mock.clone(), store.clone(), now);
        let events = ctl.subscribe();
        Self {
            ctl,
            mock,
            store,
            events,
            seen: Vec::new(),
            now,
        }
    }

    fn collect(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.seen.push((self.now, event)),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    async fn tick(&mut self) {
        self.ctl.tick(self.now).await;
        self.collect();
    }

    async fn advance(&mut self, by: Duration) {
        let until = self.now + by;
        while self.now < until {
            self.now += TICK;
            self.tick().await;
        }
    }

    /// Commands that went out at or after `from`, with their offset from it.
    fn sent_since(&self, from: Instant) -> Vec<(Duration, Command)> {
        self.seen
            .iter()
            .filter(|(at, _)| *at >= from)
            .filter_map(|(at, e)| match e {
                StatusEvent::CommandSent { command, .. } => Some((*at - from, *command)),
                _ => None,
            })
            .collect()
    }

    fn calibration_outcome(&self) -> Option<(bool, Option<f64>, Option<String>)> {
        self.seen.iter().find_map(|(_, e)| match e {
            StatusEvent::CalibrationFinished {
                success,
                quality,
                reason,
            } => Some((*success, *quality, reason.clone())),
            _ => None,
        })
    }

    /// Run a calibration to its end and return the outcome.
    async fn calibrate(&mut self) -> (bool, Option<f64>, Option<String>) {
        self.ctl.start_calibration(self.now).unwrap();
        self.collect();
        for _ in 0..4000 {
            self.advance(TICK).await;
            if let Some(outcome) = self.calibration_outcome() {
                return outcome;
            }
        }
        panic!("calibration never finished");
    }

    /// True heading change of the simulated robot over a straight drive.
    async fn straight_drive_heading_change(&mut self, speed: f64, duration: Duration) -> f64 {
        let before = self.ctl.model().pose().heading_deg;
        self.ctl.enqueue_command(Command::drive(speed, 0.0), self.now).unwrap();
        self.tick().await;
        self.advance(duration).await;
        self.ctl.enqueue_command(Command::stop(), self.now).unwrap();
        self.tick().await;
        self.advance(ms(1000)).await;
        heading_delta(before, self.ctl.model().pose().heading_deg)
    }

    fn playback_states(&self) -> Vec<PlaybackState> {
        self.seen
            .iter()
            .filter_map(|(_, e)| match e {
                StatusEvent::Playback { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }
}

fn key(k: char, pressed: bool) -> RawInputEvent {
    RawInputEvent { key: k, pressed }
}

// ── Dispatch ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn queued_commands_go_out_at_the_minimum_interval() {
    let mut rig = Rig::new(true);
    let t0 = rig.now;
    for speed in [100.0, 150.0, 200.0] {
        rig.ctl.enqueue_command(Command::drive(speed, 0.0), t0).unwrap();
    }
    rig.tick().await;
    rig.advance(ms(200)).await;

    let sent = rig.sent_since(t0);
    let offsets: Vec<u64> = sent.iter().map(|(d, _)| d.as_millis() as u64).collect();
    assert_eq!(offsets, vec![0, 50, 100]);
    assert_eq!(sent[2].1, Command::drive(200.0, 0.0));
    assert_eq!(rig.ctl.model().drive_targets(), (200.0, 0.0));
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_jumps_the_queue_and_drops_pending_commands() {
    let mut rig = Rig::new(true);
    let t0 = rig.now;
    for speed in [100.0, 150.0, 200.0] {
        rig.ctl.enqueue_command(Command::drive(speed, 0.0), t0).unwrap();
    }
    rig.tick().await;
    rig.ctl.emergency_stop(t0);
    rig.collect();
    rig.advance(ms(300)).await;

    let sent: Vec<Command> = rig.sent_since(t0).into_iter().map(|(_, c)| c).collect();
    assert_eq!(sent, vec![Command::drive(100.0, 0.0), Command::EmergencyStop]);
    assert!(rig.ctl.model().has_zero_targets());
    assert!(rig.seen.iter().any(|(_, e)| matches!(e, StatusEvent::EmergencyStop)));
}

// ── Calibration ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn simulated_calibration_completes_and_is_persisted() {
    let mut rig = Rig::new(true);
    rig.ctl.start_calibration(rig.now).unwrap();
    rig.collect();

    for _ in 0..4000 {
        rig.advance(TICK).await;
        if rig.calibration_outcome().is_some() {
            break;
        }
    }
    let (success, quality, reason) = rig.calibration_outcome().expect("calibration never finished");
    assert!(success, "calibration failed: {reason:?}");
    let quality = quality.unwrap();
    assert!(quality >= 60.0, "quality {quality}");

    let steps = rig
        .seen
        .iter()
        .filter(|(_, e)| matches!(e, StatusEvent::CalibrationStep { .. }))
        .count();
    assert_eq!(steps, 5);

    let active = rig.ctl.active_config();
    assert!(active.has_valid_calibration());
    assert!((active.calibration.quality - quality).abs() < 1e-9);

    let saved: RobotConfig = store::load(rig.store.as_ref(), store::KEY_ACTIVE_CONFIG)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(saved, *active);
    assert!(rig.store.get(store::KEY_CALIBRATION).await.unwrap().is_some());
}

#[tokio::test(start_paused = true)]
async fn low_quality_calibration_fails_and_keeps_the_old_config() {
    let mut cfg = AppConfig::default();
    cfg.simulation.enabled = true;
    cfg.calibration.quality_threshold = 99.9;
    let mut rig = Rig::with_config(cfg);
    let before = rig.ctl.active_config();

    let (success, quality, reason) = rig.calibrate().await;
    assert!(!success);
    assert_eq!(quality, None);
    let reason = reason.unwrap();
    assert!(reason.starts_with("Calibration quality too low"), "{reason}");
    assert!(reason.contains("(threshold 99.9%)"), "{reason}");

    let completed: Vec<bool> = rig
        .seen
        .iter()
        .filter_map(|(_, e)| match e {
            StatusEvent::CalibrationStep { result } => Some(result.success),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![true; 5]);
    assert!(!rig.ctl.active_config().has_valid_calibration());
    assert_eq!(*rig.ctl.active_config(), *before);
    assert!(rig.store.get(store::KEY_ACTIVE_CONFIG).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn calibrating_a_gyro_fault_does_not_bend_straight_runs() {
    let mut cfg = AppConfig::default();
    cfg.simulation.enabled = true;
    cfg.simulation.scenario = Some("gyro_drift".into());

    let mut plain = Rig::with_config(cfg.clone());
    let uncalibrated = plain.straight_drive_heading_change(150.0, ms(5000)).await;

    let mut rig = Rig::with_config(cfg);
    let (success, _, reason) = rig.calibrate().await;
    assert!(success, "calibration failed: {reason:?}");

    let active = rig.ctl.active_config();
    let data = &active.calibration;
    assert!(data.gyro_drift.is_trusted());
    assert!((data.gyro_drift.value - 0.4).abs() < 0.02, "gyro {}", data.gyro_drift.value);
    assert!(data.motor_balance.value.abs() < 0.01, "balance {}", data.motor_balance.value);
    assert!(
        data.straight_tracking_bias.value.abs() < 3e-4,
        "straight bias {}",
        data.straight_tracking_bias.value
    );

    let calibrated = rig.straight_drive_heading_change(150.0, ms(5000)).await;
    assert!(
        calibrated.abs() <= uncalibrated.abs() + 0.25,
        "calibrated {calibrated:+.2}° vs uncalibrated {uncalibrated:+.2}°"
    );
}

#[tokio::test(start_paused = true)]
async fn manual_control_is_refused_while_calibrating() {
    let mut rig = Rig::new(true);
    rig.ctl.start_calibration(rig.now).unwrap();
    rig.advance(ms(50)).await;

    let err = rig.ctl.input(key('w', true), rig.now).unwrap_err();
    assert!(matches!(
        err,
        CoreError::State(StateError::Busy {
            active: "calibration",
            ..
        })
    ));

    rig.ctl.cancel_calibration(rig.now).unwrap();
    rig.advance(ms(100)).await;
    let (success, _, reason) = rig.calibration_outcome().unwrap();
    assert!(!success);
    assert_eq!(reason.as_deref(), Some("Calibration cancelled by user"));
    assert!(rig.ctl.input(key('w', true), rig.now).is_ok());
}

// ── Record and replay ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn recorded_run_replays_with_original_timing() {
    let mut rig = Rig::new(true);
    let t0 = rig.now;
    rig.ctl.start_recording("figure", None, t0).unwrap();

    rig.ctl.input(key('w', true), rig.now).unwrap();
    rig.tick().await;
    rig.advance(ms(400)).await;
    rig.ctl.input(key('d', true), rig.now).unwrap();
    rig.tick().await;
    rig.advance(ms(300)).await;
    rig.ctl
        .enqueue_command(Command::arm(ArmChannel::Arm1, 150.0), rig.now)
        .unwrap();
    rig.tick().await;
    rig.advance(ms(500)).await;
    rig.ctl.input(key('d', false), rig.now).unwrap();
    rig.ctl.input(key('w', false), rig.now).unwrap();
    rig.tick().await;
    rig.advance(ms(200)).await;

    let live = rig.sent_since(t0);
    assert_eq!(live.len(), 5);

    let recording = rig.ctl.status().recording.unwrap();
    assert_eq!(recording.name, "figure");
    assert_eq!(recording.events, 5);
    assert_eq!(recording.elapsed_ms, 1400);

    let summary = rig.ctl.stop_recording(rig.now).unwrap();
    assert_eq!(summary.events, 5);
    let saved = rig.ctl.save_run(None).await.unwrap();
    assert_eq!(saved.name, "figure");

    let p0 = rig.now;
    rig.ctl
        .play_run(&saved.id, Some(PlaybackMode::CommandTiming), p0)
        .await
        .unwrap();
    assert_eq!(rig.ctl.status().playback.unwrap().run_id, saved.id);
    rig.tick().await;
    rig.advance(ms(2000)).await;

    let replay = rig.sent_since(p0);
    assert_eq!(replay.len(), live.len());
    for ((live_at, live_cmd), (replay_at, replay_cmd)) in live.iter().zip(&replay) {
        assert_eq!(live_cmd, replay_cmd);
        let skew = live_at.as_millis() as i64 - replay_at.as_millis() as i64;
        assert!(skew.abs() <= 20, "{live_cmd:?} skewed by {skew}ms");
    }
    assert_eq!(
        rig.playback_states(),
        vec![PlaybackState::Playing, PlaybackState::Finished]
    );
}

#[tokio::test(start_paused = true)]
async fn pause_halts_and_resume_restores_the_drive() {
    let mut rig = Rig::new(true);
    rig.ctl.start_recording("pause", None, rig.now).unwrap();
    rig.ctl.enqueue_command(Command::drive(200.0, 0.0), rig.now).unwrap();
    rig.tick().await;
    rig.advance(ms(1000)).await;
    rig.ctl.enqueue_command(Command::stop(), rig.now).unwrap();
    rig.tick().await;
    rig.ctl.stop_recording(rig.now).unwrap();
    let run = rig.ctl.save_run(None).await.unwrap();

    let p0 = rig.now;
    rig.ctl
        .play_run(&run.id, Some(PlaybackMode::CommandTiming), p0)
        .await
        .unwrap();
    rig.tick().await;
    rig.advance(ms(300)).await;

    rig.ctl.pause_playback(rig.now).unwrap();
    assert!(matches!(
        rig.ctl.pause_playback(rig.now),
        Err(CoreError::State(StateError::Playback("playing")))
    ));
    rig.tick().await;
    assert_eq!(rig.ctl.model().drive_targets(), (0.0, 0.0));

    // Paused time does not count toward the recorded offsets.
    rig.advance(ms(2000)).await;
    let resumed_at = rig.now;
    rig.ctl.resume_playback(resumed_at).unwrap();
    rig.tick().await;
    assert_eq!(rig.ctl.model().drive_targets(), (200.0, 0.0));

    rig.advance(ms(1000)).await;
    let after: Vec<(u64, Command)> = rig
        .sent_since(resumed_at)
        .into_iter()
        .map(|(d, c)| (d.as_millis() as u64, c))
        .collect();
    assert_eq!(
        after,
        vec![(0, Command::drive(200.0, 0.0)), (700, Command::stop())]
    );
    assert_eq!(rig.playback_states().last(), Some(&PlaybackState::Finished));
}

#[tokio::test(start_paused = true)]
async fn path_pursuit_follows_a_straight_recording() {
    let mut rig = Rig::new(true);
    let start = rig.ctl.model().pose();
    rig.ctl.start_recording("line", None, rig.now).unwrap();
    rig.ctl.enqueue_command(Command::drive(200.0, 0.0), rig.now).unwrap();
    rig.tick().await;
    rig.advance(ms(2000)).await;
    rig.ctl.enqueue_command(Command::stop(), rig.now).unwrap();
    rig.tick().await;
    rig.advance(ms(500)).await;
    let recorded_end = rig.ctl.model().pose();
    rig.ctl.stop_recording(rig.now).unwrap();
    let run = rig.ctl.save_run(Some("line".into())).await.unwrap();
    assert!(run.has_path);

    // Mode defaults to pursuit when the run carries a path.
    let p0 = rig.now;
    rig.ctl.play_run(&run.id, None, p0).await.unwrap();
    rig.tick().await;
    rig.advance(ms(6000)).await;

    assert_eq!(rig.playback_states().last(), Some(&PlaybackState::Finished));
    let sent = rig.sent_since(p0);
    assert_eq!(sent.last().map(|(_, c)| *c), Some(Command::stop()));

    let end = rig.ctl.model().pose();
    assert!(end.x > start.x + 30.0, "barely moved: {end:?}");
    assert!(end.x <= recorded_end.x + 5.0, "overshot: {end:?} vs {recorded_end:?}");
    assert!((end.y - start.y).abs() < 10.0, "drifted sideways: {end:?}");
    assert!(end.heading_signed().abs() < 5.0, "heading {:.1}", end.heading_signed());
}

// ── Emergency stop from any activity ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn emergency_stop_ends_calibration() {
    let mut rig = Rig::new(true);
    rig.ctl.start_calibration(rig.now).unwrap();
    rig.advance(ms(600)).await;

    rig.ctl.emergency_stop(rig.now);
    rig.collect();
    assert!(rig.ctl.model().has_zero_targets());
    assert!(!rig.ctl.calibration().is_running());
    let (success, _, reason) = rig.calibration_outcome().unwrap();
    assert!(!success);
    assert_eq!(reason.as_deref(), Some("Emergency stop"));

    // Nothing from the abandoned sequence follows the stop.
    let stop_at = rig.now;
    rig.advance(ms(3000)).await;
    let sent: Vec<Command> = rig.sent_since(stop_at).into_iter().map(|(_, c)| c).collect();
    assert_eq!(sent, vec![Command::EmergencyStop]);
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_ends_playback_and_is_recorded() {
    let mut rig = Rig::new(true);
    rig.ctl.start_recording("estop", None, rig.now).unwrap();
    rig.ctl.enqueue_command(Command::drive(150.0, 0.0), rig.now).unwrap();
    rig.tick().await;
    rig.advance(ms(500)).await;
    rig.ctl.enqueue_command(Command::EmergencyStop, rig.now).unwrap();
    rig.tick().await;
    let summary = rig.ctl.stop_recording(rig.now).unwrap();
    assert_eq!(summary.commands, 2);
    let run = rig.ctl.save_run(None).await.unwrap();

    rig.ctl
        .play_run(&run.id, Some(PlaybackMode::CommandTiming), rig.now)
        .await
        .unwrap();
    rig.tick().await;
    rig.advance(ms(100)).await;
    rig.ctl.emergency_stop(rig.now);
    rig.collect();

    assert_eq!(
        rig.playback_states(),
        vec![PlaybackState::Playing, PlaybackState::Stopped]
    );
    assert!(rig.ctl.model().has_zero_targets());
    assert!(rig.ctl.status().playback.is_none());
}

// ── Runs ─────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn runs_are_listed_renamed_and_deleted() {
    let mut rig = Rig::new(true);
    for name in ["alpha", "alpha"] {
        rig.ctl.start_recording(name, None, rig.now).unwrap();
        rig.ctl.enqueue_command(Command::drive(100.0, 0.0), rig.now).unwrap();
        rig.advance(ms(100)).await;
        rig.ctl.stop_recording(rig.now).unwrap();
        match rig.ctl.save_run(None).await {
            Ok(_) => {}
            Err(CoreError::State(StateError::DuplicateRunName(n))) => {
                assert_eq!(n, "alpha");
                assert!(matches!(
                    rig.ctl.save_run(Some("  ".into())).await,
                    Err(CoreError::State(StateError::EmptyRunName))
                ));
                rig.ctl.save_run(Some("beta".into())).await.unwrap();
            }
            Err(e) => panic!("unexpected: {e}"),
        }
    }
    assert!(matches!(
        rig.ctl.save_run(None).await,
        Err(CoreError::State(StateError::NothingToSave))
    ));

    let runs = rig.ctl.list_runs().await.unwrap();
    let names: Vec<&str> = runs.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"alpha") && names.contains(&"beta"));

    rig.ctl.delete_run(&runs[0].id).await.unwrap();
    assert!(matches!(
        rig.ctl.delete_run(&runs[0].id).await,
        Err(CoreError::State(StateError::UnknownRun(_)))
    ));
    assert_eq!(rig.ctl.list_runs().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn config_and_preferences_survive_a_restart() {
    let mut rig = Rig::new(true);
    let mut config = RobotConfig::default();
    config.straight_speed = 350.0;
    rig.ctl.set_config(config.clone()).await.unwrap();
    rig.ctl.set_simulation(false, rig.now).await.unwrap();

    let mut cfg = AppConfig::default();
    cfg.simulation.enabled = true;
    let mut fresh = Controller::new(cfg, MockTransport::new(), rig.store.clone(), rig.now);
    fresh.restore().await.unwrap();
    assert_eq!(*fresh.active_config(), config);
    assert!(!fresh.is_simulation());
}

// ── Link loss ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn lost_link_backs_off_and_reconnects() {
    let mut rig = Rig::new(false);
    rig.ctl.connect(rig.now).await.unwrap();
    assert_eq!(rig.ctl.connection(), ConnectionState::Connected);

    rig.mock.drop_link();
    rig.mock.set_fail_connect(true);
    rig.tick().await;
    assert_eq!(rig.ctl.connection(), ConnectionState::Reconnecting);
    assert!(rig.ctl.route().is_none());
    assert!(matches!(
        rig.ctl.enqueue_command(Command::drive(1.0, 0.0), rig.now),
        Err(CoreError::State(StateError::NoRoute))
    ));

    rig.advance(ms(1000)).await;
    rig.mock.set_fail_connect(false);
    rig.advance(ms(2000)).await;
    assert_eq!(rig.ctl.connection(), ConnectionState::Connected);
    assert_eq!(rig.mock.connect_calls(), 3);

    let backoff: Vec<(u32, u64)> = rig
        .seen
        .iter()
        .filter_map(|(_, e)| match e {
            StatusEvent::Reconnecting { attempt, delay_ms } => Some((*attempt, *delay_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(backoff, vec![(1, 1000), (2, 2000)]);

    // The restored link carries commands again.
    rig.mock.clear_sent();
    rig.ctl.emergency_stop(rig.now);
    rig.tick().await;
    assert!(!rig.mock.sent_frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_abandons_hardware_calibration() {
    let mut rig = Rig::new(false);
    rig.ctl.connect(rig.now).await.unwrap();
    rig.ctl.start_calibration(rig.now).unwrap();
    rig.advance(ms(150)).await;

    rig.ctl.disconnect(rig.now).await.unwrap();
    rig.collect();
    let (success, _, reason) = rig.calibration_outcome().unwrap();
    assert!(!success);
    assert!(reason.unwrap().starts_with("Connection lost"));
    assert_eq!(rig.ctl.connection(), ConnectionState::Disconnected);
    assert_eq!(rig.ctl.next_wake(), None);
}
