//! UDP link to a hub bridge or the simulator's virtual hub.
//!
//! One datagram per frame. A reader task forwards inbound datagrams to the
//! [`Inbound`] channel and closes it when the socket errors.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{Inbound, Transport};
use crate::error::TransportError;

pub struct UdpTransport {
    hub_addr: String,
    bind_addr: String,
    max_payload: usize,
    socket: Option<Arc<UdpSocket>>,
    reader: Option<JoinHandle<()>>,
}

impl UdpTransport {
    pub fn new(hub_addr: impl Into<String>, bind_addr: impl Into<String>, max_payload: usize) -> Self {
        Self {
            hub_addr: hub_addr.into(),
            bind_addr: bind_addr.into(),
            max_payload,
            socket: None,
            reader: None,
        }
    }

    fn teardown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.socket = None;
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn connect(&mut self) -> Result<Inbound, TransportError> {
        self.teardown();
        let socket = UdpSocket::bind(&self.bind_addr).await?;
        socket
            .connect(&self.hub_addr)
            .await
            .map_err(|e| TransportError::ConnectFailed(format!("{}: {e}", self.hub_addr)))?;
        let socket = Arc::new(socket);
        info!("📡 UDP link {} → {}", socket.local_addr()?, self.hub_addr);

        let (tx, rx) = mpsc::channel(128);
        let read_socket = socket.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            loop {
                match read_socket.recv(&mut buf).await {
                    Ok(n) => {
                        if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("UDP link read failed: {e}");
                        break;
                    }
                }
            }
        }));
        self.socket = Some(socket);
        Ok(rx)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.teardown();
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotConnected)?;
        socket.send(frame).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_datagrams_with_a_peer() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let mut link = UdpTransport::new(peer_addr.to_string(), "127.0.0.1:0", 20);
        let mut inbound = link.connect().await.unwrap();
        assert!(link.is_connected());

        link.send(b"\x06{}").await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x06{}");

        peer.send_to(b"\x01rdy", from).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap().as_ref(), b"\x01rdy");

        link.disconnect().await.unwrap();
        assert!(!link.is_connected());
        assert!(matches!(link.send(b"x").await, Err(TransportError::NotConnected)));
    }
}
