//! wire.rs — Hub radio framing
//!
//! Every frame is one tag byte followed by a UTF-8 payload:
//!
//! | tag  | direction | payload                                   |
//! |------|-----------|-------------------------------------------|
//! | 0x01 | hub → us  | `rdy`, free text, or a JSON status object |
//! | 0x02 | hub → us  | battery percentage (JSON number / object) |
//! | 0x03 | hub → us  | JSON hub info                             |
//! | 0x06 | us → hub  | JSON [`HubCommand`]                       |
//!
//! Outbound commands longer than the link MTU are split into several 0x06
//! frames; the hub reads them as one stdin stream.

use serde::{Deserialize, Serialize};

use crate::{ArmChannel, Command, RobotConfig};

pub const READY_TOKEN: &str = "rdy";

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("empty frame")]
    Empty,
    #[error("unknown frame tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("frame tag 0x{0:02x} is not valid in this direction")]
    UnexpectedTag(u8),
    #[error("payload is not UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("max payload {0} leaves no room for data")]
    PayloadTooSmall(usize),
    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Status = 0x01,
    Battery = 0x02,
    HubInfo = 0x03,
    Command = 0x06,
}

impl MessageType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0x01 => Some(Self::Status),
            0x02 => Some(Self::Battery),
            0x03 => Some(Self::HubInfo),
            0x06 => Some(Self::Command),
            _ => None,
        }
    }
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// The JSON vocabulary understood by the hub program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubCommand {
    Drive { speed: f64, turn_rate: f64 },
    Arm1 { speed: f64 },
    Arm2 { speed: f64 },
    StopAll,
    Config {
        axle_track: f64,
        wheel_diameter: f64,
        straight_speed: f64,
        straight_acceleration: f64,
        turn_rate: f64,
        turn_acceleration: f64,
    },
}

impl From<&Command> for HubCommand {
    fn from(cmd: &Command) -> Self {
        match *cmd {
            Command::Drive { speed, turn_rate } => Self::Drive { speed, turn_rate },
            Command::Arm {
                channel: ArmChannel::Arm1,
                speed,
            } => Self::Arm1 { speed },
            Command::Arm {
                channel: ArmChannel::Arm2,
                speed,
            } => Self::Arm2 { speed },
            Command::EmergencyStop => Self::StopAll,
        }
    }
}

impl HubCommand {
    pub fn from_config(cfg: &RobotConfig) -> Self {
        Self::Config {
            axle_track: cfg.axle_track,
            wheel_diameter: cfg.wheel_diameter,
            straight_speed: cfg.straight_speed,
            straight_acceleration: cfg.straight_acceleration,
            turn_rate: cfg.turn_rate,
            turn_acceleration: cfg.turn_acceleration,
        }
    }

    /// Motion command carried by this message; `None` for configuration.
    pub fn to_command(&self) -> Option<Command> {
        match *self {
            Self::Drive { speed, turn_rate } => Some(Command::drive(speed, turn_rate)),
            Self::Arm1 { speed } => Some(Command::arm(ArmChannel::Arm1, speed)),
            Self::Arm2 { speed } => Some(Command::arm(ArmChannel::Arm2, speed)),
            Self::StopAll => Some(Command::EmergencyStop),
            Self::Config { .. } => None,
        }
    }
}

pub fn encode_frame(tag: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(tag as u8);
    frame.extend_from_slice(payload);
    frame
}

/// Serialize a command into its JSON payload (no tag).
pub fn command_payload(cmd: &HubCommand) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(cmd)?)
}

/// Split a command payload into tagged frames no longer than `max_payload` bytes.
pub fn chunk_command(payload: &[u8], max_payload: usize) -> Result<Vec<Vec<u8>>, WireError> {
    if max_payload < 2 {
        return Err(WireError::PayloadTooSmall(max_payload));
    }
    if payload.is_empty() {
        return Ok(vec![encode_frame(MessageType::Command, payload)]);
    }
    Ok(payload
        .chunks(max_payload - 1)
        .map(|part| encode_frame(MessageType::Command, part))
        .collect())
}

// ── Inbound ───────────────────────────────────────────────────────────────────

/// Telemetry a status frame may carry. Real hubs only send text; the virtual
/// hub reports its pose.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HubStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading_deg: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Hub is ready for the next command.
    Ready,
    Status(HubStatus),
    Text(String),
    Battery(u8),
    HubInfo(serde_json::Value),
}

pub fn decode_inbound(frame: &[u8]) -> Result<InboundMessage, WireError> {
    let (&tag, payload) = frame.split_first().ok_or(WireError::Empty)?;
    let kind = MessageType::from_u8(tag).ok_or(WireError::UnknownTag(tag))?;
    let text = std::str::from_utf8(payload)?.trim();
    match kind {
        MessageType::Status => {
            if text == READY_TOKEN {
                Ok(InboundMessage::Ready)
            } else if text.starts_with('{') {
                Ok(InboundMessage::Status(serde_json::from_str(text)?))
            } else {
                Ok(InboundMessage::Text(text.to_string()))
            }
        }
        MessageType::Battery => decode_battery(text).map(InboundMessage::Battery),
        MessageType::HubInfo => Ok(InboundMessage::HubInfo(serde_json::from_str(text)?)),
        MessageType::Command => Err(WireError::UnexpectedTag(tag)),
    }
}

fn decode_battery(text: &str) -> Result<u8, WireError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let level = value
        .as_f64()
        .or_else(|| value.get("level").and_then(|v| v.as_f64()))
        .ok_or_else(|| WireError::Malformed {
            what: "battery",
            detail: text.to_string(),
        })?;
    Ok(level.clamp(0.0, 100.0).round() as u8)
}

pub fn encode_ready() -> Vec<u8> {
    encode_frame(MessageType::Status, READY_TOKEN.as_bytes())
}

pub fn encode_status(status: &HubStatus) -> Result<Vec<u8>, WireError> {
    Ok(encode_frame(MessageType::Status, &serde_json::to_vec(status)?))
}

pub fn encode_battery(level: u8) -> Vec<u8> {
    encode_frame(MessageType::Battery, level.min(100).to_string().as_bytes())
}

/// Reassembles chunked 0x06 frames on the hub side.
#[derive(Debug, Default)]
pub struct CommandAssembler {
    buffer: Vec<u8>,
}

impl CommandAssembler {
    /// Feed one frame; returns a command once the buffered JSON is complete.
    pub fn push(&mut self, frame: &[u8]) -> Result<Option<HubCommand>, WireError> {
        let (&tag, payload) = frame.split_first().ok_or(WireError::Empty)?;
        if MessageType::from_u8(tag) != Some(MessageType::Command) {
            return Err(WireError::UnexpectedTag(tag));
        }
        self.buffer.extend_from_slice(payload);
        match serde_json::from_slice::<HubCommand>(&self.buffer) {
            Ok(cmd) => {
                self.buffer.clear();
                Ok(Some(cmd))
            }
            Err(e) if e.is_eof() => Ok(None),
            Err(e) => {
                self.buffer.clear();
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_hub_vocabulary() {
        let json = serde_json::to_value(HubCommand::from(&Command::drive(200.0, -50.0))).unwrap();
        assert_eq!(json, serde_json::json!({"type": "drive", "speed": 200.0, "turn_rate": -50.0}));

        let json = serde_json::to_value(HubCommand::from(&Command::arm(ArmChannel::Arm2, 120.0))).unwrap();
        assert_eq!(json["type"], "arm2");

        let json = serde_json::to_value(HubCommand::from(&Command::EmergencyStop)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "stop_all"}));
    }

    #[test]
    fn chunks_respect_max_payload_and_reassemble() {
        let payload = command_payload(&HubCommand::from_config(&RobotConfig::default())).unwrap();
        let frames = chunk_command(&payload, 20).unwrap();
        assert!(frames.len() > 1);
        assert!(frames.iter().all(|f| f.len() <= 20 && f[0] == 0x06));

        let mut assembler = CommandAssembler::default();
        let mut decoded = None;
        for (i, frame) in frames.iter().enumerate() {
            let out = assembler.push(frame).unwrap();
            if i + 1 < frames.len() {
                assert!(out.is_none());
            } else {
                decoded = out;
            }
        }
        assert_eq!(decoded, Some(HubCommand::from_config(&RobotConfig::default())));
    }

    #[test]
    fn chunking_rejects_degenerate_mtu() {
        assert!(matches!(chunk_command(b"{}", 1), Err(WireError::PayloadTooSmall(1))));
    }

    #[test]
    fn decodes_inbound_frames() {
        assert_eq!(decode_inbound(&encode_ready()).unwrap(), InboundMessage::Ready);
        assert_eq!(
            decode_inbound(b"\x01DRIVE_OK").unwrap(),
            InboundMessage::Text("DRIVE_OK".into())
        );
        assert_eq!(decode_inbound(&encode_battery(87)).unwrap(), InboundMessage::Battery(87));
        assert_eq!(decode_inbound(b"\x02{\"level\": 42.4}").unwrap(), InboundMessage::Battery(42));

        let status = HubStatus {
            heading_deg: Some(12.5),
            ..Default::default()
        };
        assert_eq!(
            decode_inbound(&encode_status(&status).unwrap()).unwrap(),
            InboundMessage::Status(status)
        );
    }

    #[test]
    fn rejects_bad_frames() {
        assert!(matches!(decode_inbound(&[]), Err(WireError::Empty)));
        assert!(matches!(decode_inbound(&[0x09, b'x']), Err(WireError::UnknownTag(0x09))));
        assert!(matches!(decode_inbound(b"\x06{}"), Err(WireError::UnexpectedTag(0x06))));
        assert!(matches!(decode_inbound(b"\x02\"full\""), Err(WireError::Malformed { .. })));
    }
}
