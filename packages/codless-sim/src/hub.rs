//! hub.rs — Virtual hub on UDP
//!
//! Speaks the robot's radio framing so the backend's network transport can
//! drive the simulator as if it were the robot:
//!   - inbound 0x06 command frames (possibly chunked) set model targets
//!   - every command is answered with an ack text, a JSON status carrying the
//!     (noisy) gyro heading and pose, then `rdy`
//!   - battery level is pushed periodically to the last peer
//!
//! Send errors are logged, never fatal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use codless_types::wire::{self, CommandAssembler, HubCommand, HubStatus, MessageType};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::robot_sim::MotionModel;

pub type SharedModel = Arc<RwLock<MotionModel>>;

/// Battery percent lost per minute while driving.
const DRAIN_MOVING_PER_MIN: f64 = 1.5;
const DRAIN_IDLE_PER_MIN: f64 = 0.2;

/// Per-peer protocol state, free of sockets so it can be tested directly.
pub struct HubSession {
    assembler: CommandAssembler,
    rng: StdRng,
    heading_noise_deg: f64,
    battery_pct: f64,
    commands_applied: u64,
}

impl HubSession {
    pub fn new(seed: u64) -> Self {
        Self {
            assembler: CommandAssembler::default(),
            rng: StdRng::seed_from_u64(seed),
            heading_noise_deg: 0.0,
            battery_pct: 100.0,
            commands_applied: 0,
        }
    }

    pub fn set_heading_noise(&mut self, std_dev_deg: f64) {
        self.heading_noise_deg = std_dev_deg.max(0.0);
    }

    pub fn commands_applied(&self) -> u64 {
        self.commands_applied
    }

    /// Handle one inbound frame; returns the frames to send back.
    pub fn handle_frame(&mut self, frame: &[u8], model: &mut MotionModel) -> Vec<Vec<u8>> {
        let cmd = match self.assembler.push(frame) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => return vec![],
            Err(e) => {
                warn!("Hub: dropped frame: {e}");
                return vec![
                    wire::encode_frame(MessageType::Status, format!("ERR {e}").as_bytes()),
                    wire::encode_ready(),
                ];
            }
        };

        let ack = self.apply(&cmd, model);
        let mut replies = vec![wire::encode_frame(MessageType::Status, ack.as_bytes())];
        match wire::encode_status(&self.status(model)) {
            Ok(frame) => replies.push(frame),
            Err(e) => warn!("Hub: status encode failed: {e}"),
        }
        replies.push(wire::encode_ready());
        replies
    }

    fn apply(&mut self, cmd: &HubCommand, model: &mut MotionModel) -> &'static str {
        self.commands_applied += 1;
        debug!("Hub ← {cmd:?}");
        match cmd.to_command() {
            Some(motion) => {
                model.apply(&motion);
                match cmd {
                    HubCommand::Drive { .. } => "DRIVE_OK",
                    HubCommand::StopAll => "STOP_OK",
                    _ => "ARM_OK",
                }
            }
            None => {
                info!("Hub: drive base reconfigured");
                "CONFIG_OK"
            }
        }
    }

    /// Current status as the hub's sensors report it.
    pub fn status(&mut self, model: &MotionModel) -> HubStatus {
        let noise = Normal::new(0.0, self.heading_noise_deg)
            .ok()
            .filter(|_| self.heading_noise_deg > 0.0)
            .map(|n| n.sample(&mut self.rng))
            .unwrap_or(0.0);
        let pose = model.pose();
        HubStatus {
            heading_deg: Some((model.reported_heading() + noise).rem_euclid(360.0)),
            x: Some(pose.x),
            y: Some(pose.y),
            speed: Some(model.velocity().0),
        }
    }

    pub fn drain_battery(&mut self, elapsed: Duration, moving: bool) {
        let per_min = if moving { DRAIN_MOVING_PER_MIN } else { DRAIN_IDLE_PER_MIN };
        self.battery_pct = (self.battery_pct - per_min * elapsed.as_secs_f64() / 60.0).max(0.0);
    }

    pub fn battery_frame(&self) -> Vec<u8> {
        wire::encode_battery(self.battery_pct.round() as u8)
    }

    pub fn hub_info_frame(&self) -> Vec<u8> {
        let info = serde_json::json!({
            "name": "CodLess Virtual Hub",
            "firmware": "sim",
            "version": env!("CARGO_PKG_VERSION"),
        });
        wire::encode_frame(MessageType::HubInfo, info.to_string().as_bytes())
    }
}

/// Serve the virtual hub until the socket fails to bind.
pub async fn run_hub(
    bind_addr: &str,
    model: SharedModel,
    mut session: HubSession,
    mut heading_noise: watch::Receiver<f64>,
    battery_every: Duration,
) -> std::io::Result<()> {
    let socket = UdpSocket::bind(bind_addr).await?;
    info!("📡 Virtual hub listening on udp://{}", socket.local_addr()?);

    let mut buf = vec![0u8; 2048];
    let mut peer: Option<SocketAddr> = None;
    let mut battery_tick = tokio::time::interval(battery_every);

    loop {
        tokio::select! {
            recv = socket.recv_from(&mut buf) => {
                let (n, from) = match recv {
                    Ok(r) => r,
                    Err(e) => { warn!("Hub: recv failed: {e}"); continue; }
                };
                if peer != Some(from) {
                    info!("📡 Hub peer {from}");
                    peer = Some(from);
                    send(&socket, &session.hub_info_frame(), from).await;
                }
                let replies = {
                    let mut m = model.write().await;
                    session.handle_frame(&buf[..n], &mut m)
                };
                for reply in replies {
                    send(&socket, &reply, from).await;
                }
            }
            Ok(()) = heading_noise.changed() => {
                let std_dev = *heading_noise.borrow();
                session.set_heading_noise(std_dev);
                info!("Hub heading noise σ={std_dev:.2}°");
            }
            _ = battery_tick.tick() => {
                let moving = model.read().await.is_moving();
                session.drain_battery(battery_every, moving);
                if let Some(to) = peer {
                    send(&socket, &session.battery_frame(), to).await;
                }
            }
        }
    }
}

async fn send(socket: &UdpSocket, frame: &[u8], to: SocketAddr) {
    if let Err(e) = socket.send_to(frame, to).await {
        warn!("Hub: send to {to} failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::robot_sim::{MotionParams, WorkspaceBounds};
    use codless_types::wire::{decode_inbound, InboundMessage};
    use codless_types::{Command, StartCorner};

    fn model() -> MotionModel {
        MotionModel::simulator(
            MotionParams::default(),
            WorkspaceBounds::default(),
            StartCorner::BottomLeft,
        )
    }

    fn command_frames(cmd: &Command, mtu: usize) -> Vec<Vec<u8>> {
        let payload = wire::command_payload(&HubCommand::from(cmd)).unwrap();
        wire::chunk_command(&payload, mtu).unwrap()
    }

    #[test]
    fn chunked_drive_sets_targets_and_acks() {
        let mut model = model();
        let mut session = HubSession::new(7);
        let frames = command_frames(&Command::drive(200.0, -40.0), 8);
        let mut replies = vec![];
        for frame in &frames {
            replies = session.handle_frame(frame, &mut model);
        }
        assert_eq!(model.drive_targets(), (200.0, -40.0));
        assert_eq!(session.commands_applied(), 1);

        let decoded: Vec<_> = replies.iter().map(|r| decode_inbound(r).unwrap()).collect();
        assert_eq!(decoded[0], InboundMessage::Text("DRIVE_OK".into()));
        assert!(matches!(decoded[1], InboundMessage::Status(s) if s.heading_deg == Some(0.0)));
        assert_eq!(decoded[2], InboundMessage::Ready);
    }

    #[test]
    fn stop_all_zeroes_targets() {
        let mut model = model();
        let mut session = HubSession::new(7);
        for frame in command_frames(&Command::drive(300.0, 0.0), 64) {
            session.handle_frame(&frame, &mut model);
        }
        for frame in command_frames(&Command::EmergencyStop, 64) {
            session.handle_frame(&frame, &mut model);
        }
        assert!(model.has_zero_targets());
    }

    #[test]
    fn heading_noise_is_seeded() {
        let model = model();
        let mut a = HubSession::new(42);
        let mut b = HubSession::new(42);
        a.set_heading_noise(2.0);
        b.set_heading_noise(2.0);
        let ha = a.status(&model).heading_deg;
        assert_eq!(ha, b.status(&model).heading_deg);
        assert_ne!(ha, Some(0.0));
    }

    #[test]
    fn garbage_frame_is_answered_not_applied() {
        let mut model = model();
        let mut session = HubSession::new(1);
        let replies = session.handle_frame(b"\x06}", &mut model);
        assert_eq!(replies.len(), 2);
        assert_eq!(session.commands_applied(), 0);
    }

    #[test]
    fn battery_drains_faster_when_moving() {
        let mut idle = HubSession::new(1);
        let mut moving = HubSession::new(1);
        idle.drain_battery(Duration::from_secs(600), false);
        moving.drain_battery(Duration::from_secs(600), true);
        assert_eq!(decode_inbound(&idle.battery_frame()).unwrap(), InboundMessage::Battery(98));
        assert_eq!(decode_inbound(&moving.battery_frame()).unwrap(), InboundMessage::Battery(85));
    }
}
