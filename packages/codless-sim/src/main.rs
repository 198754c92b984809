//! main.rs — CodLess robot simulator entry point
//!
//! Runs three concurrent loops:
//!   1. Physics loop: advances the motion model at update_rate_hz
//!   2. Virtual hub: answers radio frames from the backend over UDP
//!   3. WebSocket server: control panel on port 9090 (pause/resume, scenario
//!      inject, direct commands, pose telemetry)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use clap::Parser;
use codless_types::{Command, StartCorner, TurnTrim};
use serde::Deserialize;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::{interval, Instant};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use codless_sim::hub::{self, HubSession, SharedModel};
use codless_sim::scenarios::{self, ScenarioConfig};
use codless_sim::{MotionModel, MotionParams, WorkspaceBounds};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "codless-sim", about = "CodLess robot simulator and virtual hub")]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    /// UDP address the virtual hub binds
    #[arg(long)]
    hub_addr: Option<String>,
    /// Simulation speed multiplier (1.0 = real-time)
    #[arg(long)]
    speed: Option<f64>,
    /// Pre-load a scenario preset on startup
    #[arg(long)]
    preset: Option<String>,
    /// Control panel WebSocket port
    #[arg(long)]
    ctrl_port: Option<u16>,
}

// ── Shared state ──────────────────────────────────────────────────────────────

struct SimState {
    scenario: ScenarioConfig,
    start_corner: StartCorner,
    paused: bool,
    speed: f64,
    epoch_counter: u64,
    /// Pose telemetry snapshot, broadcast to the control panel
    last_telemetry: Option<serde_json::Value>,
}

#[derive(Clone)]
struct AppState {
    sim: Arc<RwLock<SimState>>,
    model: SharedModel,
    telem: broadcast::Sender<String>,
    noise: Arc<watch::Sender<f64>>,
}

// ── Main ──────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "codless_sim=info".into()),
        )
        .init();

    let args = Args::parse();

    let config_str = std::fs::read_to_string(&args.config)
        .unwrap_or_else(|_| include_str!("../config.toml").to_string());
    let cfg: FullConfig = toml::from_str(&config_str).context("invalid config.toml")?;

    let scenario = match args.preset.as_deref() {
        Some(name) => scenarios::preset(name)
            .with_context(|| format!("unknown scenario preset '{name}'"))?,
        None => cfg.scenarios.clone(),
    };

    let mut model = MotionModel::simulator(
        cfg.motion.clone(),
        cfg.workspace,
        cfg.simulation.start_corner,
    );
    model.set_turn_trim(cfg.calibration.trim());
    model.set_bias(scenario.bias());
    let model: SharedModel = Arc::new(RwLock::new(model));

    info!(
        "🤖 Simulator starting: {:.0}×{:.0} mm field, {} Hz, scenarios {:?}",
        cfg.workspace.width, cfg.workspace.height, cfg.simulation.update_rate_hz, scenario.active
    );

    let (noise_tx, noise_rx) = watch::channel(scenario.heading_noise());
    let (telem_tx, _) = broadcast::channel::<String>(64);

    let state = AppState {
        sim: Arc::new(RwLock::new(SimState {
            scenario,
            start_corner: cfg.simulation.start_corner,
            paused: false,
            speed: args.speed.unwrap_or(cfg.simulation.sim_speed),
            epoch_counter: 0,
            last_telemetry: None,
        })),
        model: model.clone(),
        telem: telem_tx,
        noise: Arc::new(noise_tx),
    };

    // Virtual hub
    let hub_addr = args.hub_addr.unwrap_or(cfg.hub.bind_addr.clone());
    let session = HubSession::new(cfg.hub.noise_seed);
    let battery_every = Duration::from_secs_f64(cfg.hub.battery_interval_s.max(0.1));
    let hub_model = model.clone();
    tokio::spawn(async move {
        if let Err(e) = hub::run_hub(&hub_addr, hub_model, session, noise_rx, battery_every).await {
            warn!("Virtual hub stopped: {e}");
        }
    });

    // Physics loop
    let loop_state = state.clone();
    let update_rate = cfg.simulation.update_rate_hz;
    let telemetry_every = cfg.simulation.telemetry_every.max(1);
    tokio::spawn(async move {
        sim_loop(loop_state, update_rate, telemetry_every).await;
    });

    // Control WebSocket server
    let ctrl_addr = format!("0.0.0.0:{}", args.ctrl_port.unwrap_or(cfg.simulation.ctrl_port));
    info!("🖥  Control panel WebSocket at ws://{ctrl_addr}/ws");

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "codless-sim ok" }))
        .with_state(state)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let listener = tokio::net::TcpListener::bind(&ctrl_addr)
        .await
        .with_context(|| format!("binding {ctrl_addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ── Physics loop ──────────────────────────────────────────────────────────────

async fn sim_loop(state: AppState, update_rate_hz: f64, telemetry_every: u64) {
    let period = Duration::from_secs_f64(1.0 / update_rate_hz.max(1.0));
    let mut ticker = interval(period);
    let mut last = Instant::now();

    info!("⚙ Sim loop running at {update_rate_hz} Hz");

    loop {
        ticker.tick().await;
        let now = Instant::now();
        let elapsed = now - last;
        last = now;

        let (paused, speed, epoch) = {
            let mut s = state.sim.write().await;
            if !s.paused {
                s.epoch_counter += 1;
            }
            (s.paused, s.speed, s.epoch_counter)
        };
        if paused {
            continue;
        }

        let snapshot = {
            let mut m = state.model.write().await;
            m.advance(elapsed.mul_f64(speed));
            m.snapshot()
        };

        if epoch % telemetry_every != 0 {
            continue;
        }
        let telem = serde_json::json!({
            "type": "telemetry",
            "epoch": epoch,
            "state": snapshot,
        });
        state.sim.write().await.last_telemetry = Some(telem.clone());
        let _ = state.telem.send(telem.to_string());

        if epoch % (telemetry_every * 100) == 0 {
            info!(
                "⏱ t={:.1}s | pose=({:.0}, {:.0}) {:.1}°",
                snapshot.sim_time_s, snapshot.pose.x, snapshot.pose.y, snapshot.pose.heading_deg
            );
        }
    }
}

// ── WebSocket control handler ─────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: AppState) {
    let mut telem_rx = state.telem.subscribe();

    // Send current state immediately on connect
    let (telem, scenario) = {
        let s = state.sim.read().await;
        (s.last_telemetry.clone(), serde_json::to_value(&s.scenario).unwrap_or_default())
    };
    if let Some(telem) = telem {
        let _ = socket.send(Message::Text(telem.to_string())).await;
    }
    let _ = socket
        .send(Message::Text(
            serde_json::json!({"type": "scenario", "data": scenario}).to_string(),
        ))
        .await;

    loop {
        tokio::select! {
            // Relay telemetry to client
            Ok(msg) = telem_rx.recv() => {
                if socket.send(Message::Text(msg)).await.is_err() { break; }
            }
            // Handle commands from the control panel
            Some(Ok(Message::Text(cmd))) = socket.recv() => {
                handle_command(&state, &cmd).await;
            }
            else => break,
        }
    }
}

/// Handle commands from the control panel.
/// Commands are JSON: { "cmd": "...", "args": {...} }
async fn handle_command(state: &AppState, raw: &str) {
    let v: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return,
    };
    let cmd = v["cmd"].as_str().unwrap_or("");
    match cmd {
        "pause" => {
            state.sim.write().await.paused = true;
            info!("⏸ Sim paused");
        }
        "resume" => {
            state.sim.write().await.paused = false;
            info!("▶ Sim resumed");
        }
        "reset" => {
            let corner = match serde_json::from_value::<StartCorner>(v["args"]["corner"].clone()) {
                Ok(c) => {
                    state.sim.write().await.start_corner = c;
                    c
                }
                Err(_) => state.sim.read().await.start_corner,
            };
            state.model.write().await.reset(corner);
            info!("↺ Sim reset to {corner:?}");
        }
        "set_speed" => {
            if let Some(sp) = v["args"]["speed"].as_f64() {
                let sp = sp.clamp(0.1, 20.0);
                state.sim.write().await.speed = sp;
                info!("⚡ Sim speed set to {sp}×");
            }
        }
        "command" => match serde_json::from_value::<Command>(v["args"].clone()) {
            Ok(c) => match c.validate() {
                Ok(()) => state.model.write().await.apply(&c),
                Err(e) => warn!("Rejected command: {e}"),
            },
            Err(e) => warn!("Malformed command: {e}"),
        },
        "set_scenario" => match serde_json::from_value::<ScenarioConfig>(v["args"].clone()) {
            Ok(sc) => {
                apply_scenario(state, sc).await;
                info!("🎭 Scenario updated");
            }
            Err(e) => warn!("Malformed scenario: {e}"),
        },
        "preset" => {
            let name = v["args"]["name"].as_str().unwrap_or("");
            match scenarios::preset(name) {
                Some(sc) => {
                    apply_scenario(state, sc).await;
                    info!("🎭 Preset '{name}' loaded");
                }
                None => warn!("Unknown preset: {name}"),
            }
        }
        _ => warn!("Unknown control command: {cmd}"),
    }
}

async fn apply_scenario(state: &AppState, sc: ScenarioConfig) {
    state.model.write().await.set_bias(sc.bias());
    let _ = state.noise.send(sc.heading_noise());
    state.sim.write().await.scenario = sc;
}

// ── Config structs ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FullConfig {
    simulation: SimulationConfig,
    hub: HubConfig,
    #[serde(default)]
    motion: MotionParams,
    #[serde(default)]
    workspace: WorkspaceBounds,
    #[serde(default)]
    calibration: TrimConfig,
    #[serde(default)]
    scenarios: ScenarioConfig,
}

#[derive(Debug, Deserialize)]
struct SimulationConfig {
    update_rate_hz: f64,
    sim_speed: f64,
    ctrl_port: u16,
    telemetry_every: u64,
    #[serde(default)]
    start_corner: StartCorner,
}

#[derive(Debug, Deserialize)]
struct HubConfig {
    bind_addr: String,
    battery_interval_s: f64,
    noise_seed: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TrimConfig {
    straight_bias: f64,
    turn_gain: f64,
    balance: f64,
}

impl Default for TrimConfig {
    fn default() -> Self {
        let t = TurnTrim::default();
        Self {
            straight_bias: t.straight_bias,
            turn_gain: t.turn_gain,
            balance: t.balance,
        }
    }
}

impl TrimConfig {
    fn trim(&self) -> TurnTrim {
        TurnTrim {
            straight_bias: self.straight_bias,
            turn_gain: self.turn_gain,
            balance: self.balance,
        }
    }
}
