//! Transport layer: the robot link and the command sinks built on it

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use codless_sim::MotionModel;
use codless_types::wire::{self, HubCommand};
use codless_types::Command;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;

mod mock;
mod udp;
pub use mock::MockTransport;
pub use udp::UdpTransport;

/// Inbound frames, one `Bytes` per notification. Closes when the link drops.
pub type Inbound = mpsc::Receiver<Bytes>;

/// Byte link to the hub. Pairing/discovery happens behind `connect`.
///
/// `Sync` because the control loop awaits on `&Controller` borrows.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link and hand back its inbound frame stream.
    async fn connect(&mut self) -> Result<Inbound, TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Send one frame, at most `max_payload` bytes.
    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Largest frame the link accepts.
    fn max_payload(&self) -> usize;
}

/// Where a dispatched command ends up.
#[async_trait]
pub trait CommandSink: Send {
    async fn deliver(&mut self, cmd: &Command) -> Result<(), TransportError>;
}

/// Frames commands for the hub and writes them to a transport.
pub struct FramedLink<'a, T: Transport> {
    transport: &'a mut T,
    chunk_delay: Duration,
}

impl<'a, T: Transport> FramedLink<'a, T> {
    pub fn new(transport: &'a mut T, chunk_delay: Duration) -> Self {
        Self {
            transport,
            chunk_delay,
        }
    }
}

impl<T: Transport> FramedLink<'_, T> {
    /// Encode, chunk and write one hub message. Returns the frame count.
    pub async fn send_message(&mut self, msg: &HubCommand) -> Result<usize, TransportError> {
        if !self.transport.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let payload = wire::command_payload(msg)?;
        let frames = wire::chunk_command(&payload, self.transport.max_payload())?;
        for (i, frame) in frames.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.chunk_delay).await;
            }
            self.transport.send(frame).await?;
        }
        Ok(frames.len())
    }
}

#[async_trait]
impl<T: Transport> CommandSink for FramedLink<'_, T> {
    async fn deliver(&mut self, cmd: &Command) -> Result<(), TransportError> {
        let count = self.send_message(&HubCommand::from(cmd)).await?;
        debug!("→ hub {} ({} frame(s))", cmd.describe(), count);
        Ok(())
    }
}

/// The simulator route: commands set model targets directly.
#[async_trait]
impl CommandSink for MotionModel {
    async fn deliver(&mut self, cmd: &Command) -> Result<(), TransportError> {
        self.apply(cmd);
        debug!("→ sim {}", cmd.describe());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codless_types::wire::CommandAssembler;

    #[tokio::test(start_paused = true)]
    async fn framed_link_chunks_with_inter_chunk_delay() {
        let mut transport = MockTransport::with_max_payload(16);
        let _inbound = transport.connect().await.unwrap();

        let started = tokio::time::Instant::now();
        let mut link = FramedLink::new(&mut transport, Duration::from_millis(5));
        link.deliver(&Command::drive(200.0, -100.0)).await.unwrap();

        let sent = transport.sent_frames();
        assert!(sent.len() > 1);
        assert!(sent.iter().all(|f| f.len() <= 16));
        assert_eq!(
            started.elapsed(),
            Duration::from_millis(5 * (sent.len() as u64 - 1))
        );

        let mut assembler = CommandAssembler::default();
        let decoded = sent
            .iter()
            .filter_map(|f| assembler.push(f).unwrap())
            .next();
        assert_eq!(decoded, Some(HubCommand::Drive { speed: 200.0, turn_rate: -100.0 }));
    }

    #[tokio::test]
    async fn framed_link_refuses_when_disconnected() {
        let mut transport = MockTransport::new();
        let mut link = FramedLink::new(&mut transport, Duration::ZERO);
        let err = link.deliver(&Command::stop()).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
    }
}
