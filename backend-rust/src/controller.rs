//! controller.rs — The owned context behind every control operation
//!
//! One `Controller` holds the motion model, dispatcher, scheduler,
//! calibration sequencer, recorder and playback state, and is driven from a
//! single task. Operations accept or reject synchronously; everything they
//! cause afterwards shows up on the [`StatusEvent`] broadcast.
//!
//! Time is always passed in. `tick(now)` advances the simulator, drains hub
//! frames and runs every scheduler task due at `now`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use codless_sim::scenarios;
use codless_sim::MotionModel;
use codless_types::wire::{decode_inbound, HubCommand, HubStatus, InboundMessage};
use codless_types::{
    CalibrationData, CalibrationResult, Command, Pose, RawInputEvent, RobotConfig, Run, StartCorner,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::calibration::{CalibrationEvent, CalibrationSequencer, CalibrationState, Observation};
use crate::config::AppConfig;
use crate::dispatcher::{DispatchId, Dispatcher, LatencyStats, NextDispatch};
use crate::error::{CoreError, StateError, TransportError};
use crate::events::{
    ConnectionState, LogCategory, LogEntry, LogLevel, PlaybackState, Route, StatusEvent,
};
use crate::input::InputMapper;
use crate::odometry::DeadReckoning;
use crate::playback::{Playback, PlaybackMode, PlaybackStep, PlaybackWake, PursuitGains};
use crate::reconnect::ReconnectPolicy;
use crate::recorder::Recorder;
use crate::scheduler::{Scheduler, Task};
use crate::store::{self, KeyValueStore, StoreError};
use crate::transport::{CommandSink, FramedLink, Inbound, Transport};

/// Hub-reported speed above which the robot counts as moving.
const MOVING_THRESHOLD: f64 = 0.5;

// ─── Persisted Records ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prefs {
    #[serde(default)]
    pub simulation: Option<bool>,
    #[serde(default)]
    pub start_corner: Option<StartCorner>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationRecord {
    pub data: CalibrationData,
    pub results: Vec<CalibrationResult>,
}

// ─── Read Models ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: String,
    pub name: String,
    pub events: usize,
    pub commands: usize,
    pub duration_ms: u64,
    pub has_path: bool,
    pub start_corner: StartCorner,
    pub created_at: i64,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id.clone(),
            name: run.name.clone(),
            events: run.events.len(),
            commands: run.command_count(),
            duration_ms: run.duration_ms(),
            has_path: run.has_path(),
            start_corner: run.start_corner,
            created_at: run.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStatus {
    pub run_id: String,
    pub run: String,
    pub mode: PlaybackMode,
    pub paused: bool,
    pub played: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    pub name: String,
    pub events: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub connection: ConnectionState,
    pub simulation: bool,
    pub route: Option<Route>,
    pub calibrated: bool,
    pub calibration: CalibrationState,
    pub calibration_progress: u8,
    pub recording: Option<RecordingStatus>,
    pub unsaved_run: Option<String>,
    pub playback: Option<PlaybackStatus>,
    pub queue_len: usize,
    pub latency: LatencyStats,
    pub sent: u64,
    pub failed: u64,
    pub battery: Option<u8>,
}

// ─── Controller ──────────────────────────────────────────────────────────────

pub struct Controller<T: Transport, S: KeyValueStore> {
    cfg: AppConfig,
    transport: T,
    inbound: Option<Inbound>,
    store: S,
    connection: ConnectionState,
    simulation: bool,
    start_corner: StartCorner,
    model: MotionModel,
    odometry: DeadReckoning,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    calibration: CalibrationSequencer,
    recorder: Recorder,
    unsaved: Option<Run>,
    playback: Option<Playback>,
    mapper: InputMapper,
    reconnect: ReconnectPolicy,
    active_config: Arc<RobotConfig>,
    events: broadcast::Sender<StatusEvent>,
    logs: VecDeque<LogEntry>,
    hub_status: Option<(HubStatus, Instant)>,
    last_ack_at: Option<Instant>,
    battery: Option<u8>,
    last_tick: Instant,
}

impl<T: Transport, S: KeyValueStore> Controller<T, S> {
    pub fn new(cfg: AppConfig, transport: T, store: S, now: Instant) -> Self {
        let sim = &cfg.simulation;
        let mut model = MotionModel::simulator(sim.motion.clone(), sim.workspace, sim.start_corner);
        if let Some(name) = &sim.scenario {
            match scenarios::preset(name) {
                Some(preset) => {
                    info!("Simulated robot uses the '{name}' fault preset");
                    model.set_bias(preset.bias());
                }
                None => warn!("Unknown simulation scenario '{name}', ignoring"),
            }
        }
        let odometry = DeadReckoning::new(model.params(), model.pose());
        let (events, _) = broadcast::channel(cfg.server.event_buffer.max(16));

        Self {
            dispatcher: Dispatcher::new(cfg.dispatch.min_interval()),
            calibration: CalibrationSequencer::new(cfg.calibration.clone()),
            recorder: Recorder::new(cfg.recording.capture_path),
            reconnect: ReconnectPolicy::new(&cfg.reconnect),
            simulation: sim.enabled,
            start_corner: sim.start_corner,
            transport,
            inbound: None,
            store,
            connection: ConnectionState::Disconnected,
            model,
            odometry,
            scheduler: Scheduler::new(),
            unsaved: None,
            playback: None,
            mapper: InputMapper::new(),
            active_config: Arc::new(RobotConfig::default()),
            events,
            logs: VecDeque::new(),
            hub_status: None,
            last_ack_at: None,
            battery: None,
            last_tick: now,
            cfg,
        }
    }

    /// Load the persisted robot config and preferences.
    pub async fn restore(&mut self) -> Result<(), CoreError> {
        if let Some(config) = store::load::<RobotConfig, _>(&self.store, store::KEY_ACTIVE_CONFIG).await? {
            match config.validate() {
                Ok(()) => {
                    info!("Restored robot config ({})", config.calibration_summary());
                    self.active_config = Arc::new(config);
                }
                Err(e) => warn!("Stored robot config rejected: {e}"),
            }
        }
        if let Some(prefs) = store::load::<Prefs, _>(&self.store, store::KEY_PREFS).await? {
            if let Some(sim) = prefs.simulation {
                self.simulation = sim;
            }
            if let Some(corner) = prefs.start_corner {
                self.start_corner = corner;
                self.model.reset(corner);
            }
        }
        Ok(())
    }

    // ── Read side ────────────────────────────────────────────────────────────

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<StatusEvent> {
        self.events.clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.cfg
    }

    pub fn recent_logs(&self) -> Vec<LogEntry> {
        self.logs.iter().cloned().collect()
    }

    pub fn active_config(&self) -> Arc<RobotConfig> {
        self.active_config.clone()
    }

    pub fn model(&self) -> &MotionModel {
        &self.model
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn calibration(&self) -> &CalibrationSequencer {
        &self.calibration
    }

    pub fn is_simulation(&self) -> bool {
        self.simulation
    }

    pub fn is_connected(&self) -> bool {
        self.connection == ConnectionState::Connected && self.transport.is_connected()
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    /// Simulation wins over a live link.
    pub fn route(&self) -> Option<Route> {
        if self.simulation {
            Some(Route::Simulator)
        } else if self.is_connected() {
            Some(Route::Hardware)
        } else {
            None
        }
    }

    /// Earliest pending scheduler task.
    pub fn next_wake(&self) -> Option<Instant> {
        self.scheduler.next_due()
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            connection: self.connection,
            simulation: self.simulation,
            route: self.route(),
            calibrated: self.active_config.has_valid_calibration(),
            calibration: self.calibration.state().clone(),
            calibration_progress: self.calibration.progress(),
            recording: self.recorder.name().map(|name| RecordingStatus {
                name: name.to_string(),
                events: self.recorder.event_count(),
                elapsed_ms: self.recorder.elapsed_ms(self.last_tick),
            }),
            unsaved_run: self.unsaved.as_ref().map(|r| r.name.clone()),
            playback: self.playback.as_ref().map(|pb| {
                let (played, total) = pb.progress();
                PlaybackStatus {
                    run_id: pb.run_id().to_string(),
                    run: pb.run_name().to_string(),
                    mode: pb.mode(),
                    paused: pb.is_paused(),
                    played,
                    total,
                }
            }),
            queue_len: self.dispatcher.queue_len(),
            latency: self.dispatcher.latency(),
            sent: self.dispatcher.sent_count(),
            failed: self.dispatcher.failed_count(),
            battery: self.battery,
        }
    }

    /// Pose and velocity as best known on the current route.
    pub fn telemetry(&mut self, now: Instant) -> StatusEvent {
        let pose = self.current_pose(now);
        let (speed, turn_rate) = if self.simulation {
            self.model.velocity()
        } else {
            let speed = self.hub_status.and_then(|(s, _)| s.speed).unwrap_or(0.0);
            (speed, 0.0)
        };
        StatusEvent::Telemetry {
            pose,
            speed,
            turn_rate,
            route: self.route(),
        }
    }

    pub fn publish_telemetry(&mut self, now: Instant) {
        let event = self.telemetry(now);
        self.emit(event);
    }

    // ── Event plumbing ───────────────────────────────────────────────────────

    fn emit(&self, event: StatusEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn log(&mut self, level: LogLevel, category: LogCategory, message: impl Into<String>) {
        let entry = LogEntry::new(level, category, message);
        match level {
            LogLevel::Info | LogLevel::Success => info!("[{:?}] {}", category, entry.message),
            LogLevel::Warning => warn!("[{:?}] {}", category, entry.message),
            LogLevel::Error => error!("[{:?}] {}", category, entry.message),
        }
        self.logs.push_back(entry.clone());
        while self.logs.len() > self.cfg.server.event_buffer.max(1) {
            self.logs.pop_front();
        }
        self.emit(StatusEvent::Log(entry));
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if self.connection != state {
            self.connection = state;
            self.emit(StatusEvent::Connection { state });
        }
    }

    // ── Guards ───────────────────────────────────────────────────────────────

    fn activity(&self) -> Option<&'static str> {
        if self.calibration.is_running() {
            Some("calibration")
        } else if self.playback.is_some() {
            Some("playback")
        } else if self.recorder.is_recording() {
            Some("recording")
        } else {
            None
        }
    }

    fn require_idle(&self, requested: &'static str) -> Result<(), StateError> {
        match self.activity() {
            Some(active) => Err(StateError::Busy { requested, active }),
            None => Ok(()),
        }
    }

    fn require_route(&self) -> Result<Route, StateError> {
        self.route().ok_or(StateError::NoRoute)
    }

    /// Manual control is allowed while recording, never during calibration or playback.
    fn check_teleop(&self) -> Result<Route, StateError> {
        if self.calibration.is_running() {
            return Err(StateError::Busy {
                requested: "manual control",
                active: "calibration",
            });
        }
        if self.playback.is_some() {
            return Err(StateError::Busy {
                requested: "manual control",
                active: "playback",
            });
        }
        let route = self.require_route()?;
        if route == Route::Hardware
            && self.cfg.dispatch.require_calibration
            && !self.active_config.has_valid_calibration()
        {
            return Err(StateError::NotCalibrated);
        }
        Ok(route)
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// Operator command: validated, recorded if capturing, compensated and queued.
    pub fn enqueue_command(&mut self, command: Command, now: Instant) -> Result<DispatchId, CoreError> {
        command.validate()?;
        if command.is_emergency() {
            return Ok(self.emergency_stop(now));
        }
        self.check_teleop()?;
        self.recorder.record_command(command, now);
        Ok(self.queue(command, false, true, now)?)
    }

    /// Raw key transition from the operator. Returns the queued command, if the key produced one.
    pub fn input(&mut self, event: RawInputEvent, now: Instant) -> Result<Option<DispatchId>, CoreError> {
        self.check_teleop()?;
        self.recorder.record_input(event.clone(), now);
        match self.mapper.resolve(&event) {
            Some(command) => Ok(Some(self.queue(command, false, true, now)?)),
            None => Ok(None),
        }
    }

    fn queue(
        &mut self,
        command: Command,
        priority: bool,
        compensate: bool,
        now: Instant,
    ) -> Result<DispatchId, CoreError> {
        let command = if compensate {
            self.active_config.compensate(&command)
        } else {
            command
        };
        let id = self.dispatcher.enqueue(command, priority, now)?;
        self.scheduler.schedule_once(now, Task::DispatchNext);
        Ok(id)
    }

    fn queue_or_log(&mut self, command: Command, priority: bool, compensate: bool, now: Instant) {
        if let Err(e) = self.queue(command, priority, compensate, now) {
            self.log(LogLevel::Error, LogCategory::Motion, format!("Dropped {}: {e}", command.describe()));
        }
    }

    /// Halt everything. Accepted in every state.
    pub fn emergency_stop(&mut self, now: Instant) -> DispatchId {
        let id = self.dispatcher.emergency_stop(now);
        self.model.stop_all();
        self.odometry.on_command(&Command::EmergencyStop, now);
        self.mapper.reset();
        self.scheduler.cancel_where(|t| {
            t.is_playback() || matches!(t, Task::CalibrationWake | Task::DispatchNext)
        });
        self.scheduler.schedule_at(now, Task::DispatchNext);

        if let Some(pb) = self.playback.take() {
            self.emit(StatusEvent::Playback {
                state: PlaybackState::Stopped,
                run: pb.run_name().to_string(),
                mode: Some(pb.mode()),
            });
        }
        let aborted: Vec<_> = self
            .calibration
            .abort("Emergency stop")
            .into_iter()
            .filter(|e| !matches!(e, CalibrationEvent::Issue(_)))
            .collect();
        self.absorb_calibration(aborted, now);
        self.recorder.record_command(Command::EmergencyStop, now);

        self.log(LogLevel::Warning, LogCategory::Motion, "🛑 Emergency stop");
        self.emit(StatusEvent::EmergencyStop);
        id
    }

    // ── Tick ─────────────────────────────────────────────────────────────────

    pub async fn tick(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        self.model.advance(elapsed);

        self.drain_inbound(now);
        while let Some((_, task)) = self.scheduler.pop_due(now) {
            self.run_task(task, now).await;
        }
    }

    /// Wait for the next hub frame. Pending forever while unconnected.
    pub async fn recv_frame(&mut self) -> Option<Bytes> {
        match self.inbound.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Feed the result of [`Self::recv_frame`] back in; `None` means the link closed.
    pub fn handle_inbound(&mut self, frame: Option<Bytes>, now: Instant) {
        match frame {
            Some(frame) => self.handle_frame(&frame, now),
            None => {
                self.inbound = None;
                self.link_lost("link closed by peer", now);
            }
        }
    }

    fn drain_inbound(&mut self, now: Instant) {
        loop {
            let Some(rx) = self.inbound.as_mut() else {
                return;
            };
            match rx.try_recv() {
                Ok(frame) => self.handle_frame(&frame, now),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.inbound = None;
                    self.link_lost("link closed by peer", now);
                    return;
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: &[u8], now: Instant) {
        match decode_inbound(frame) {
            Ok(InboundMessage::Ready) => {
                self.last_ack_at = Some(now);
                if let Some(rtt) = self.dispatcher.acknowledge(now) {
                    debug!("hub ack after {}ms", rtt.as_millis());
                    self.emit(StatusEvent::Latency(self.dispatcher.latency()));
                }
            }
            Ok(InboundMessage::Status(status)) => self.hub_status = Some((status, now)),
            Ok(InboundMessage::Text(text)) => {
                if text.starts_with("ERR") {
                    self.log(LogLevel::Warning, LogCategory::Connection, format!("Hub: {text}"));
                } else {
                    debug!("hub: {text}");
                }
            }
            Ok(InboundMessage::Battery(level)) => {
                self.battery = Some(level);
                self.emit(StatusEvent::Battery { level });
            }
            Ok(InboundMessage::HubInfo(info)) => {
                self.log(LogLevel::Info, LogCategory::Connection, format!("Hub info: {info}"));
                self.emit(StatusEvent::HubInfo { info });
            }
            Err(e) => warn!("Dropping malformed hub frame: {e}"),
        }
    }

    async fn run_task(&mut self, task: Task, now: Instant) {
        match task {
            Task::DispatchNext => self.dispatch_next(now).await,
            Task::CalibrationWake => self.calibration_wake(now).await,
            Task::PlaybackEmit { index } => {
                let Some(pb) = self.playback.as_mut() else {
                    return;
                };
                let step = pb.emit(index, now);
                self.apply_playback_step(step, now);
            }
            Task::PursuitTick => {
                let pose = self.current_pose(now);
                let Some(pb) = self.playback.as_mut() else {
                    return;
                };
                let step = pb.pursuit_tick(now, &pose);
                self.apply_playback_step(step, now);
            }
            Task::PoseSample => self.sample_pose(now),
            Task::Reconnect { attempt } => self.try_reconnect(attempt, now).await,
        }
    }

    async fn dispatch_next(&mut self, now: Instant) {
        let entry = match self.dispatcher.next(now) {
            NextDispatch::Idle => return,
            NextDispatch::WaitUntil(at) => {
                self.scheduler.schedule_once(at, Task::DispatchNext);
                return;
            }
            NextDispatch::Send(entry) => entry,
        };

        let route = self.route();
        let result = match route {
            Some(Route::Simulator) => self.model.deliver(&entry.command).await,
            Some(Route::Hardware) => {
                let delay = self.cfg.dispatch.chunk_delay();
                FramedLink::new(&mut self.transport, delay)
                    .deliver(&entry.command)
                    .await
            }
            None => Err(TransportError::NotConnected),
        };
        self.dispatcher.complete(&entry, result.as_ref().map(|_| ()), now);

        match (result, route) {
            (Ok(()), Some(route)) => {
                self.odometry.on_command(&entry.command, now);
                self.emit(StatusEvent::CommandSent {
                    command: entry.command,
                    route,
                });
            }
            (Ok(()), None) => {}
            (Err(e), route) => {
                self.log(
                    LogLevel::Error,
                    LogCategory::Motion,
                    format!("Failed to send {}: {e}", entry.command.describe()),
                );
                if route == Some(Route::Hardware)
                    && matches!(e, TransportError::Io(_) | TransportError::Closed | TransportError::NotConnected)
                {
                    self.link_lost(&e.to_string(), now);
                }
            }
        }

        if !self.dispatcher.is_idle() {
            self.scheduler.schedule_once(now, Task::DispatchNext);
        }
    }

    // ── Calibration ──────────────────────────────────────────────────────────

    pub fn start_calibration(&mut self, now: Instant) -> Result<(), CoreError> {
        if self.calibration.is_running() {
            return Err(StateError::CalibrationRunning.into());
        }
        self.require_idle("calibration")?;
        let base = (*self.active_config).clone();
        let params = self.simulation.then(|| self.model.params().clone());
        let events = self
            .calibration
            .start(now, &base, self.is_connected(), params.as_ref())?;
        if self.simulation {
            self.model.reset(self.start_corner);
        }
        self.mapper.reset();
        self.log(
            LogLevel::Info,
            LogCategory::Calibration,
            if self.simulation {
                "🎯 Calibration started on the simulator"
            } else {
                "🎯 Calibration started"
            },
        );
        self.absorb_calibration(events, now);
        Ok(())
    }

    pub fn cancel_calibration(&mut self, now: Instant) -> Result<(), CoreError> {
        let events = self.calibration.cancel()?;
        self.absorb_calibration(events, now);
        Ok(())
    }

    fn observation(&self, now: Instant) -> Observation {
        if self.simulation {
            let mut obs = Observation::from_model(&self.model, now);
            obs.last_ack_at = self.last_ack_at;
            return obs;
        }
        let mut obs = Observation {
            last_ack_at: self.last_ack_at,
            ..Observation::default()
        };
        if let Some((status, at)) = self.hub_status {
            obs.heading_deg = status.heading_deg;
            obs.position = status.x.zip(status.y);
            obs.moving = status.speed.map(|v| v.abs() > MOVING_THRESHOLD);
            obs.updated_at = Some(at);
        }
        obs
    }

    async fn calibration_wake(&mut self, now: Instant) {
        let obs = self.observation(now);
        let events = self.calibration.resume(now, &obs);
        if let Some((config, quality)) = self.absorb_calibration(events, now) {
            self.finish_calibration(config, quality).await;
        }
    }

    /// Act on sequencer output. A completed run is handed back for the async commit.
    fn absorb_calibration(&mut self, events: Vec<CalibrationEvent>, now: Instant) -> Option<(RobotConfig, f64)> {
        let mut completed = None;
        for event in events {
            match event {
                CalibrationEvent::Issue(command) => self.queue_or_log(command, true, false, now),
                CalibrationEvent::StepStarted { step, attempt } => {
                    let msg = if attempt > 1 {
                        format!("Retrying {} (attempt {attempt})", step.label())
                    } else {
                        format!("Calibrating: {}", step.label())
                    };
                    self.log(LogLevel::Info, LogCategory::Calibration, msg);
                }
                CalibrationEvent::StepCompleted(result) => {
                    self.log(LogLevel::Success, LogCategory::Calibration, result.description.clone());
                    self.emit(StatusEvent::CalibrationStep { result });
                }
                CalibrationEvent::StepRetry { step, attempt, reason } => {
                    self.log(
                        LogLevel::Warning,
                        LogCategory::Calibration,
                        format!("{} failed ({reason}), retrying as attempt {attempt}", step.label()),
                    );
                }
                CalibrationEvent::Progress(progress) => {
                    self.emit(StatusEvent::CalibrationProgress {
                        step: self.calibration.current_step(),
                        progress,
                    });
                }
                CalibrationEvent::WakeAt(at) => {
                    self.scheduler.cancel_where(|t| *t == Task::CalibrationWake);
                    self.scheduler.schedule_at(at, Task::CalibrationWake);
                }
                CalibrationEvent::Completed { config, quality } => completed = Some((config, quality)),
                CalibrationEvent::Failed { reason, .. } => {
                    self.scheduler.cancel_where(|t| *t == Task::CalibrationWake);
                    self.log(LogLevel::Error, LogCategory::Calibration, format!("❌ {reason}"));
                    self.emit(StatusEvent::CalibrationFinished {
                        success: false,
                        quality: None,
                        reason: Some(reason),
                    });
                }
            }
        }
        completed
    }

    async fn finish_calibration(&mut self, config: RobotConfig, quality: f64) {
        let record = CalibrationRecord {
            data: config.calibration.clone(),
            results: self.calibration.results().to_vec(),
        };
        let summary = config.calibration_summary();
        if let Err(e) = self.commit_config(config).await {
            self.log(LogLevel::Warning, LogCategory::System, format!("Calibration not persisted: {e}"));
        }
        if let Err(e) = store::save(&self.store, store::KEY_CALIBRATION, &record).await {
            warn!("Could not save calibration record: {e}");
        }
        self.log(
            LogLevel::Success,
            LogCategory::Calibration,
            format!("✅ Calibration complete, quality {quality:.1}% ({summary})"),
        );
        self.emit(StatusEvent::CalibrationFinished {
            success: true,
            quality: Some(quality),
            reason: None,
        });
    }

    /// Swap in a new active config, then persist it.
    async fn commit_config(&mut self, config: RobotConfig) -> Result<(), StoreError> {
        self.active_config = Arc::new(config);
        store::save(&self.store, store::KEY_ACTIVE_CONFIG, self.active_config.as_ref()).await
    }

    /// Replace the robot config (geometry, ports, limits and any calibration it carries).
    pub async fn set_config(&mut self, config: RobotConfig) -> Result<(), CoreError> {
        if self.calibration.is_running() {
            return Err(StateError::CalibrationRunning.into());
        }
        config.validate()?;
        self.commit_config(config).await?;
        if self.is_connected() {
            self.push_config_to_hub().await;
        }
        self.log(LogLevel::Info, LogCategory::System, "Robot config updated");
        Ok(())
    }

    async fn push_config_to_hub(&mut self) {
        let msg = HubCommand::from_config(&self.active_config);
        let delay = self.cfg.dispatch.chunk_delay();
        if let Err(e) = FramedLink::new(&mut self.transport, delay).send_message(&msg).await {
            warn!("Could not send robot config to hub: {e}");
        }
    }

    // ── Recording ────────────────────────────────────────────────────────────

    fn start_pose(&self, corner: StartCorner) -> Pose {
        self.cfg.simulation.workspace.start_pose(corner)
    }

    /// Pose source for path capture and pursuit: the simulator, or dead reckoning on hardware.
    fn current_pose(&mut self, now: Instant) -> Pose {
        if self.simulation {
            self.model.pose()
        } else {
            self.odometry.update(now)
        }
    }

    pub fn start_recording(
        &mut self,
        name: &str,
        corner: Option<StartCorner>,
        now: Instant,
    ) -> Result<(), CoreError> {
        if let Some(active) = self.recorder.name() {
            return Err(StateError::AlreadyRecording(active.to_string()).into());
        }
        self.require_idle("recording")?;
        let route = self.require_route()?;
        let corner = corner.unwrap_or(self.start_corner);
        self.recorder.start(name, corner, now)?;

        if route == Route::Simulator {
            self.model.reset(corner);
        }
        self.odometry.reset(self.start_pose(corner));
        self.mapper.reset();
        self.unsaved = None;
        if self.recorder.captures_path() {
            self.scheduler.schedule_once(now, Task::PoseSample);
        }
        let name = name.trim().to_string();
        self.log(LogLevel::Info, LogCategory::Recording, format!("⏺ Recording '{name}'"));
        self.emit(StatusEvent::Recording {
            active: true,
            name: Some(name),
        });
        Ok(())
    }

    pub fn stop_recording(&mut self, now: Instant) -> Result<RunSummary, CoreError> {
        let run = self.recorder.stop(now)?;
        self.scheduler.cancel_where(|t| *t == Task::PoseSample);
        let summary = RunSummary::from(&run);
        self.log(
            LogLevel::Info,
            LogCategory::Recording,
            format!("⏹ Recorded '{}' ({} events); save it to keep it", run.name, run.events.len()),
        );
        self.unsaved = Some(run);
        self.emit(StatusEvent::Recording {
            active: false,
            name: None,
        });
        Ok(summary)
    }

    fn sample_pose(&mut self, now: Instant) {
        if !self.recorder.is_recording() {
            return;
        }
        let pose = self.current_pose(now);
        self.recorder.sample_pose(&pose, now);
        let every = Duration::from_millis(self.cfg.recording.pose_sample_ms.max(1));
        self.scheduler.schedule_at(now + every, Task::PoseSample);
    }

    /// Persist the last stopped recording, optionally renamed.
    pub async fn save_run(&mut self, name: Option<String>) -> Result<RunSummary, CoreError> {
        let mut run = self.unsaved.take().ok_or(StateError::NothingToSave)?;
        if let Some(name) = name {
            let name = name.trim();
            if name.is_empty() {
                self.unsaved = Some(run);
                return Err(StateError::EmptyRunName.into());
            }
            run.name = name.to_string();
        }
        let existing = match self.list_runs().await {
            Ok(existing) => existing,
            Err(e) => {
                self.unsaved = Some(run);
                return Err(e);
            }
        };
        if existing.iter().any(|r| r.name == run.name) {
            let name = run.name.clone();
            self.unsaved = Some(run);
            return Err(StateError::DuplicateRunName(name).into());
        }
        if let Err(e) = store::save(&self.store, &store::run_key(&run.id), &run).await {
            self.unsaved = Some(run);
            return Err(e.into());
        }

        let summary = RunSummary::from(&run);
        self.log(LogLevel::Success, LogCategory::Recording, format!("💾 Saved run '{}'", run.name));
        self.emit(StatusEvent::RunSaved {
            id: run.id,
            name: run.name,
        });
        Ok(summary)
    }

    pub async fn list_runs(&self) -> Result<Vec<RunSummary>, CoreError> {
        let mut runs = Vec::new();
        for key in self.store.keys(store::RUNS_PREFIX).await? {
            if let Some(run) = store::load::<Run, _>(&self.store, &key).await? {
                runs.push(RunSummary::from(&run));
            }
        }
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    pub async fn delete_run(&mut self, id: &str) -> Result<(), CoreError> {
        if !self.store.delete(&store::run_key(id)).await? {
            return Err(StateError::UnknownRun(id.to_string()).into());
        }
        self.log(LogLevel::Info, LogCategory::Recording, format!("Deleted run {id}"));
        Ok(())
    }

    // ── Playback ─────────────────────────────────────────────────────────────

    pub async fn play_run(
        &mut self,
        id: &str,
        mode: Option<PlaybackMode>,
        now: Instant,
    ) -> Result<(), CoreError> {
        self.require_idle("playback")?;
        let route = self.require_route()?;
        let run: Run = store::load(&self.store, &store::run_key(id))
            .await?
            .ok_or_else(|| StateError::UnknownRun(id.to_string()))?;

        let corner = run.start_corner;
        let start = run
            .path
            .as_ref()
            .and_then(|p| p.first())
            .map(|s| s.pose())
            .unwrap_or_else(|| self.start_pose(corner));
        let gains = PursuitGains::new(
            &self.cfg.playback,
            self.active_config.straight_speed,
            self.active_config.turn_rate,
        );
        let (playback, wake) = Playback::start(run, mode, gains, now)?;

        if route == Route::Simulator {
            self.model.reset(corner);
        }
        self.odometry.reset(start);
        self.mapper.reset();
        self.schedule_playback(wake);

        let (name, mode) = (playback.run_name().to_string(), playback.mode());
        self.playback = Some(playback);
        self.log(LogLevel::Info, LogCategory::Playback, format!("▶ Playing '{name}' ({mode:?})"));
        self.emit(StatusEvent::Playback {
            state: PlaybackState::Playing,
            run: name,
            mode: Some(mode),
        });
        Ok(())
    }

    fn schedule_playback(&mut self, wake: PlaybackWake) {
        match wake {
            PlaybackWake::Emit { index, at } => self.scheduler.schedule_at(at, Task::PlaybackEmit { index }),
            PlaybackWake::PursuitTick { at } => self.scheduler.schedule_at(at, Task::PursuitTick),
        };
    }

    fn apply_playback_step(&mut self, step: PlaybackStep, now: Instant) {
        for command in step.commands {
            self.queue_or_log(command, false, true, now);
        }
        if let Some(wake) = step.next {
            self.schedule_playback(wake);
        }
        if step.finished {
            if let Some(pb) = self.playback.take() {
                self.log(
                    LogLevel::Success,
                    LogCategory::Playback,
                    format!("Playback of '{}' complete", pb.run_name()),
                );
                self.emit(StatusEvent::Playback {
                    state: PlaybackState::Finished,
                    run: pb.run_name().to_string(),
                    mode: Some(pb.mode()),
                });
            }
        }
    }

    pub fn pause_playback(&mut self, now: Instant) -> Result<(), CoreError> {
        let pb = self.playback.as_mut().ok_or(StateError::Playback("active"))?;
        pb.pause(now)?;
        let (run, mode) = (pb.run_name().to_string(), pb.mode());
        self.scheduler.cancel_where(Task::is_playback);
        self.queue_or_log(Command::stop(), true, false, now);
        self.emit(StatusEvent::Playback {
            state: PlaybackState::Paused,
            run,
            mode: Some(mode),
        });
        Ok(())
    }

    pub fn resume_playback(&mut self, now: Instant) -> Result<(), CoreError> {
        let pb = self.playback.as_mut().ok_or(StateError::Playback("active"))?;
        let (restore, next) = pb.resume(now)?;
        let (run, mode) = (pb.run_name().to_string(), pb.mode());
        if let Some(command) = restore {
            self.queue_or_log(command, false, true, now);
        }
        if let Some(wake) = next {
            self.schedule_playback(wake);
        }
        self.emit(StatusEvent::Playback {
            state: PlaybackState::Playing,
            run,
            mode: Some(mode),
        });
        Ok(())
    }

    pub fn stop_playback(&mut self, now: Instant) -> Result<(), CoreError> {
        let pb = self.playback.take().ok_or(StateError::Playback("active"))?;
        self.scheduler.cancel_where(Task::is_playback);
        self.queue_or_log(Command::stop(), true, false, now);
        self.log(LogLevel::Info, LogCategory::Playback, format!("⏹ Stopped '{}'", pb.run_name()));
        self.emit(StatusEvent::Playback {
            state: PlaybackState::Stopped,
            run: pb.run_name().to_string(),
            mode: Some(pb.mode()),
        });
        Ok(())
    }

    // ── Connection ───────────────────────────────────────────────────────────

    pub async fn connect(&mut self, now: Instant) -> Result<(), CoreError> {
        if self.is_connected() {
            return Err(StateError::AlreadyConnected.into());
        }
        self.scheduler.cancel_where(|t| matches!(t, Task::Reconnect { .. }));
        self.set_connection(ConnectionState::Connecting);
        match self.open_link(now).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.set_connection(ConnectionState::Disconnected);
                self.log(LogLevel::Error, LogCategory::Connection, format!("Connection failed: {e}"));
                Err(e.into())
            }
        }
    }

    async fn open_link(&mut self, now: Instant) -> Result<(), TransportError> {
        let inbound = self.transport.connect().await?;
        self.inbound = Some(inbound);
        self.hub_status = None;
        self.set_connection(ConnectionState::Connected);
        self.push_config_to_hub().await;
        if !self.simulation {
            self.odometry.reset(self.start_pose(self.start_corner));
        }
        self.last_tick = self.last_tick.max(now);
        self.log(LogLevel::Success, LogCategory::Connection, "🔗 Connected to hub");
        Ok(())
    }

    pub async fn disconnect(&mut self, now: Instant) -> Result<(), CoreError> {
        if self.connection == ConnectionState::Disconnected {
            return Err(TransportError::NotConnected.into());
        }
        self.scheduler.cancel_where(|t| matches!(t, Task::Reconnect { .. }));
        if let Err(e) = self.transport.disconnect().await {
            warn!("Transport disconnect failed: {e}");
        }
        self.inbound = None;
        self.abandon_hardware_activity("disconnected", now);
        self.set_connection(ConnectionState::Disconnected);
        self.log(LogLevel::Info, LogCategory::Connection, "Disconnected from hub");
        Ok(())
    }

    /// The link went away under us: drop what depended on it and start backing off.
    fn link_lost(&mut self, reason: &str, now: Instant) {
        if self.connection != ConnectionState::Connected {
            return;
        }
        self.inbound = None;
        self.log(LogLevel::Error, LogCategory::Connection, format!("Connection lost: {reason}"));
        self.abandon_hardware_activity(reason, now);
        self.schedule_reconnect(1, now);
    }

    /// Activities running against real hardware cannot survive losing it.
    fn abandon_hardware_activity(&mut self, reason: &str, now: Instant) {
        if self.simulation {
            return;
        }
        let dropped = self.dispatcher.clear();
        if dropped > 0 {
            debug!("Dropped {dropped} queued command(s) for the lost link");
        }
        if let Some(name) = self.recorder.cancel() {
            self.scheduler.cancel_where(|t| *t == Task::PoseSample);
            self.log(
                LogLevel::Warning,
                LogCategory::Recording,
                format!("Recording '{name}' discarded: {reason}"),
            );
            self.emit(StatusEvent::Recording {
                active: false,
                name: None,
            });
        }
        if let Some(pb) = self.playback.take() {
            self.scheduler.cancel_where(Task::is_playback);
            self.log(
                LogLevel::Warning,
                LogCategory::Playback,
                format!("Playback of '{}' stopped: {reason}", pb.run_name()),
            );
            self.emit(StatusEvent::Playback {
                state: PlaybackState::Stopped,
                run: pb.run_name().to_string(),
                mode: Some(pb.mode()),
            });
        }
        let aborted: Vec<_> = self
            .calibration
            .abort(&format!("Connection lost: {reason}"))
            .into_iter()
            .filter(|e| !matches!(e, CalibrationEvent::Issue(_)))
            .collect();
        self.absorb_calibration(aborted, now);
    }

    fn schedule_reconnect(&mut self, attempt: u32, now: Instant) {
        match self.reconnect.delay(attempt) {
            Some(delay) => {
                self.set_connection(ConnectionState::Reconnecting);
                self.scheduler.schedule_at(now + delay, Task::Reconnect { attempt });
                self.emit(StatusEvent::Reconnecting {
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            None => {
                self.set_connection(ConnectionState::Disconnected);
                self.log(
                    LogLevel::Error,
                    LogCategory::Connection,
                    format!("Giving up after {} reconnect attempts", self.reconnect.max_attempts()),
                );
            }
        }
    }

    async fn try_reconnect(&mut self, attempt: u32, now: Instant) {
        if self.is_connected() {
            return;
        }
        match self.open_link(now).await {
            Ok(()) => self.log(
                LogLevel::Success,
                LogCategory::Connection,
                format!("Reconnected on attempt {attempt}"),
            ),
            Err(e) => {
                warn!("Reconnect attempt {attempt} failed: {e}");
                self.schedule_reconnect(attempt + 1, now);
            }
        }
    }

    // ── Simulation ───────────────────────────────────────────────────────────

    pub async fn set_simulation(&mut self, enabled: bool, now: Instant) -> Result<(), CoreError> {
        if self.simulation == enabled {
            return Ok(());
        }
        self.require_idle("simulation switch")?;
        self.simulation = enabled;
        self.dispatcher.clear();
        self.mapper.reset();
        if enabled {
            self.model.reset(self.start_corner);
        } else {
            self.model.stop_all();
            self.odometry.reset(self.start_pose(self.start_corner));
        }
        self.last_tick = self.last_tick.max(now);

        let prefs = Prefs {
            simulation: Some(enabled),
            start_corner: Some(self.start_corner),
        };
        if let Err(e) = store::save(&self.store, store::KEY_PREFS, &prefs).await {
            warn!("Could not save preferences: {e}");
        }
        self.log(
            LogLevel::Info,
            LogCategory::System,
            if enabled {
                "Simulation mode enabled"
            } else {
                "Simulation mode disabled"
            },
        );
        self.emit(StatusEvent::Simulation { enabled });
        Ok(())
    }
}
