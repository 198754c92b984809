//! config.rs — Backend configuration
//!
//! Loaded from a TOML file (falls back to the embedded `config.toml`), every
//! section optional with defaults. `CODLESS_PORT` overrides the server port.

use std::time::Duration;

use codless_sim::{MotionParams, WorkspaceBounds};
use codless_types::StartCorner;
use serde::Deserialize;
use tracing::{info, warn};

const EMBEDDED: &str = include_str!("../config.toml");

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub dispatch: DispatchConfig,
    pub calibration: CalibrationConfig,
    pub recording: RecordingConfig,
    pub playback: PlaybackConfig,
    pub reconnect: ReconnectConfig,
    pub transport: TransportConfig,
    pub store: StoreConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Status events retained for late WebSocket subscribers.
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub min_interval_ms: u64,
    pub chunk_delay_ms: u64,
    /// Teleop commands are refused until the robot is calibrated (simulation exempt).
    pub require_calibration: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 50,
            chunk_delay_ms: 5,
            require_calibration: true,
        }
    }
}

impl DispatchConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub step_timeout_ms: u64,
    pub sim_step_timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub first_step_delay_ms: u64,
    pub step_gap_ms: u64,
    pub quality_threshold: f64,
    /// Poll cadence while waiting for motion or fresh telemetry.
    pub poll_ms: u64,
    pub test_speed: f64,
    pub test_turn_rate: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: 5000,
            sim_step_timeout_ms: 2000,
            max_attempts: 3,
            retry_delay_ms: 1000,
            first_step_delay_ms: 100,
            step_gap_ms: 500,
            quality_threshold: 60.0,
            poll_ms: 10,
            test_speed: 150.0,
            test_turn_rate: 100.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub pose_sample_ms: u64,
    /// Record a pose path alongside the events.
    pub capture_path: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            pose_sample_ms: 100,
            capture_path: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub pursuit_tick_ms: u64,
    pub kp_linear: f64,
    pub kp_angular: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            pursuit_tick_ms: 100,
            kp_linear: 0.5,
            kp_angular: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            factor: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Hub (or virtual hub) UDP address.
    pub hub_addr: String,
    pub bind_addr: String,
    pub max_payload: usize,
    /// Connect at startup.
    pub auto_connect: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            hub_addr: "127.0.0.1:5560".into(),
            bind_addr: "0.0.0.0:0".into(),
            max_payload: 20,
            auto_connect: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { dir: "data".into() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub enabled: bool,
    pub tick_hz: f64,
    pub start_corner: StartCorner,
    /// Named mechanical-fault preset applied to the simulated robot.
    pub scenario: Option<String>,
    pub motion: MotionParams,
    pub workspace: WorkspaceBounds,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_hz: 60.0,
            start_corner: StartCorner::default(),
            scenario: None,
            motion: MotionParams::default(),
            workspace: WorkspaceBounds::default(),
        }
    }
}

impl AppConfig {
    /// Read `path`, falling back to the embedded defaults, then apply env overrides.
    pub fn load(path: &str) -> Result<Self, toml::de::Error> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => {
                info!("Loaded config from {path}");
                text
            }
            Err(e) => {
                warn!("Config {path} unreadable ({e}), using embedded defaults");
                EMBEDDED.to_string()
            }
        };
        let mut cfg: AppConfig = toml::from_str(&text)?;
        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Some(port) = std::env::var("CODLESS_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.server.port = port;
        }
    }
}
