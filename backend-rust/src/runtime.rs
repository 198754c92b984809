//! runtime.rs — The single task that owns the controller
//!
//! Everything that touches the controller funnels through one loop: operator
//! requests arrive over an mpsc channel, hub frames over the transport's
//! inbound stream, and timers come from the scheduler's next wake-up or the
//! simulator tick. No locks; the loop is the only owner.

use std::time::Duration;

use bytes::Bytes;
use codless_types::{Command, RawInputEvent, RobotConfig, StartCorner};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::controller::Controller;
use crate::error::CoreError;
use crate::events::StatusEvent;
use crate::playback::PlaybackMode;
use crate::store::KeyValueStore;
use crate::transport::Transport;

const TELEMETRY_EVERY: Duration = Duration::from_millis(100);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Requests ────────────────────────────────────────────────────────────────

/// Operator requests, as sent over the control socket:
/// `{"cmd": "play_run", "args": {"id": "...", "mode": "pursuit"}}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", content = "args", rename_all = "snake_case")]
pub enum ControlRequest {
    Command(Command),
    Input(RawInputEvent),
    EmergencyStop,
    Connect,
    Disconnect,
    SetSimulation {
        enabled: bool,
    },
    StartCalibration,
    CancelCalibration,
    StartRecording {
        name: String,
        #[serde(default)]
        corner: Option<StartCorner>,
    },
    StopRecording,
    SaveRun {
        #[serde(default)]
        name: Option<String>,
    },
    ListRuns,
    DeleteRun {
        id: String,
    },
    PlayRun {
        id: String,
        #[serde(default)]
        mode: Option<PlaybackMode>,
    },
    PausePlayback,
    ResumePlayback,
    StopPlayback,
    Status,
    Logs,
    GetConfig,
    SetConfig(RobotConfig),
}

type Reply = oneshot::Sender<Result<Value, CoreError>>;

// ─── Handle ──────────────────────────────────────────────────────────────────

/// Cloneable front door to the control loop.
#[derive(Clone)]
pub struct ControlHandle {
    requests: mpsc::Sender<(ControlRequest, Reply)>,
    events: broadcast::Sender<StatusEvent>,
}

impl ControlHandle {
    pub async fn request(&self, request: ControlRequest) -> Result<Value, CoreError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send((request, tx))
            .await
            .map_err(|_| CoreError::Stopped)?;
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::Stopped),
            Err(_) => Err(CoreError::Timeout {
                what: "control request".into(),
                after: REQUEST_TIMEOUT,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }
}

/// Move the controller onto its own task.
pub fn spawn<T, S>(controller: Controller<T, S>) -> (ControlHandle, JoinHandle<()>)
where
    T: Transport + 'static,
    S: KeyValueStore + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    let handle = ControlHandle {
        requests: tx,
        events: controller.event_sender(),
    };
    let task = tokio::spawn(run(controller, rx));
    (handle, task)
}

// ─── Loop ────────────────────────────────────────────────────────────────────

enum Wake {
    Frame(Option<Bytes>),
    Request(Option<(ControlRequest, Reply)>),
    Timer,
}

/// Runs until every [`ControlHandle`] is dropped.
pub async fn run<T, S>(mut ctl: Controller<T, S>, mut requests: mpsc::Receiver<(ControlRequest, Reply)>)
where
    T: Transport,
    S: KeyValueStore,
{
    let tick_every = Duration::from_secs_f64(1.0 / ctl.config().simulation.tick_hz.max(1.0));
    let mut next_telemetry = Instant::now();
    info!("Control loop running ({} Hz tick)", ctl.config().simulation.tick_hz);

    loop {
        let mut deadline = Instant::now() + tick_every;
        if let Some(wake) = ctl.next_wake() {
            deadline = deadline.min(wake);
        }

        let wake = tokio::select! {
            frame = ctl.recv_frame() => Wake::Frame(frame),
            request = requests.recv() => Wake::Request(request),
            _ = sleep_until(deadline) => Wake::Timer,
        };

        match wake {
            Wake::Frame(frame) => ctl.handle_inbound(frame, Instant::now()),
            Wake::Request(Some((request, reply))) => {
                debug!("request {request:?}");
                let result = apply(&mut ctl, request, Instant::now()).await;
                // The caller may have timed out and gone away.
                let _ = reply.send(result);
            }
            Wake::Request(None) => break,
            Wake::Timer => {}
        }

        let now = Instant::now();
        ctl.tick(now).await;
        if now >= next_telemetry {
            ctl.publish_telemetry(now);
            next_telemetry = now + TELEMETRY_EVERY;
        }
    }

    // Nobody left to steer; leave the robot stopped.
    let now = Instant::now();
    ctl.emergency_stop(now);
    ctl.tick(now).await;
    info!("Control loop stopped");
}

async fn apply<T, S>(ctl: &mut Controller<T, S>, request: ControlRequest, now: Instant) -> Result<Value, CoreError>
where
    T: Transport,
    S: KeyValueStore,
{
    let ok = || -> Result<Value, CoreError> { Ok(Value::Null) };
    match request {
        ControlRequest::Command(command) => {
            let id = ctl.enqueue_command(command, now)?;
            Ok(json!({ "id": id }))
        }
        ControlRequest::Input(event) => {
            let id = ctl.input(event, now)?;
            Ok(json!({ "id": id }))
        }
        ControlRequest::EmergencyStop => {
            let id = ctl.emergency_stop(now);
            Ok(json!({ "id": id }))
        }
        ControlRequest::Connect => ctl.connect(now).await.and_then(|_| ok()),
        ControlRequest::Disconnect => ctl.disconnect(now).await.and_then(|_| ok()),
        ControlRequest::SetSimulation { enabled } => {
            ctl.set_simulation(enabled, now).await.and_then(|_| ok())
        }
        ControlRequest::StartCalibration => ctl.start_calibration(now).and_then(|_| ok()),
        ControlRequest::CancelCalibration => ctl.cancel_calibration(now).and_then(|_| ok()),
        ControlRequest::StartRecording { name, corner } => {
            ctl.start_recording(&name, corner, now).and_then(|_| ok())
        }
        ControlRequest::StopRecording => to_value(ctl.stop_recording(now)?),
        ControlRequest::SaveRun { name } => to_value(ctl.save_run(name).await?),
        ControlRequest::ListRuns => to_value(ctl.list_runs().await?),
        ControlRequest::DeleteRun { id } => ctl.delete_run(&id).await.and_then(|_| ok()),
        ControlRequest::PlayRun { id, mode } => ctl.play_run(&id, mode, now).await.and_then(|_| ok()),
        ControlRequest::PausePlayback => ctl.pause_playback(now).and_then(|_| ok()),
        ControlRequest::ResumePlayback => ctl.resume_playback(now).and_then(|_| ok()),
        ControlRequest::StopPlayback => ctl.stop_playback(now).and_then(|_| ok()),
        ControlRequest::Status => to_value(ctl.status()),
        ControlRequest::Logs => to_value(ctl.recent_logs()),
        ControlRequest::GetConfig => to_value(ctl.active_config().as_ref()),
        ControlRequest::SetConfig(config) => ctl.set_config(config).await.and_then(|_| ok()),
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, CoreError> {
    // Our read models are plain structs; serialization cannot fail on them.
    Ok(serde_json::to_value(value).unwrap_or(Value::Null))
}
