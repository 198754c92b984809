//! Mock transport for testing

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{Inbound, Transport};
use crate::error::TransportError;

const DEFAULT_MAX_PAYLOAD: usize = 20;

/// In-memory link. Clones share state, so a test keeps one handle while the
/// controller owns another.
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

struct MockTransportInner {
    connected: bool,
    max_payload: usize,
    sent: Vec<Vec<u8>>,
    inbound: Option<mpsc::Sender<Bytes>>,
    fail_connect: bool,
    fail_sends: bool,
    connect_calls: u32,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        MockTransport {
            inner: Arc::new(Mutex::new(MockTransportInner {
                connected: false,
                max_payload,
                sent: Vec::new(),
                inbound: None,
                fail_connect: false,
                fail_sends: false,
                connect_calls: 0,
            })),
        }
    }

    // A poisoned lock only means another test thread panicked; keep going.
    fn lock(&self) -> MutexGuard<'_, MockTransportInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Deliver a frame as if the hub had sent it.
    pub fn inject(&self, frame: &[u8]) -> bool {
        let inner = self.lock();
        match &inner.inbound {
            Some(tx) => tx.try_send(Bytes::copy_from_slice(frame)).is_ok(),
            None => false,
        }
    }

    /// Every frame written so far.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        self.lock().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.lock().sent.clear();
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.lock().fail_sends = fail;
    }

    pub fn connect_calls(&self) -> u32 {
        self.lock().connect_calls
    }

    /// Simulate the hub vanishing: inbound stream closes, sends fail.
    pub fn drop_link(&self) {
        let mut inner = self.lock();
        inner.connected = false;
        inner.inbound = None;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<Inbound, TransportError> {
        let mut inner = self.lock();
        inner.connect_calls += 1;
        if inner.fail_connect {
            return Err(TransportError::ConnectFailed("mock hub unreachable".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        inner.inbound = Some(tx);
        inner.connected = true;
        Ok(rx)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.drop_link();
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        if inner.fail_sends {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock send failure",
            )));
        }
        inner.sent.push(frame.to_vec());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.lock().connected
    }

    fn max_payload(&self) -> usize {
        self.lock().max_payload
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}
