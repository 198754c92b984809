//! dispatcher.rs — Outbound command queue
//!
//! Two FIFO classes (priority, normal); priority always drains first. At most
//! one send per `min_interval`, except emergency stop, which clears both
//! queues and goes out immediately. The pacing decision is exposed sans-IO
//! through [`Dispatcher::next`] so the runtime can drive it from the
//! scheduler; [`Dispatcher::flush`] is the blocking-free async drain built on it.

use std::collections::VecDeque;
use std::time::Duration;

use codless_types::{Command, ValidationError};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::CommandSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DispatchId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEntry {
    pub id: DispatchId,
    pub command: Command,
    pub enqueued_at: Instant,
    pub priority: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NextDispatch {
    Send(DispatchEntry),
    /// Something is queued but the rate limit holds it until then.
    WaitUntil(Instant),
    Idle,
}

/// Round-trip between a send and the next hub acknowledgement.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyStats {
    pub last_ms: Option<f64>,
    pub mean_ms: f64,
    pub samples: u64,
}

impl LatencyStats {
    fn record(&mut self, sample: Duration) {
        let ms = sample.as_secs_f64() * 1000.0;
        self.samples += 1;
        self.mean_ms += (ms - self.mean_ms) / self.samples as f64;
        self.last_ms = Some(ms);
    }
}

#[derive(Debug, Default)]
pub struct FlushReport {
    pub sent: usize,
    pub failures: Vec<(DispatchEntry, TransportError)>,
}

pub struct Dispatcher {
    min_interval: Duration,
    priority: VecDeque<DispatchEntry>,
    normal: VecDeque<DispatchEntry>,
    pending_stop: Option<DispatchEntry>,
    next_id: u64,
    last_send_at: Option<Instant>,
    awaiting_ack_since: Option<Instant>,
    latency: LatencyStats,
    sent_count: u64,
    failed_count: u64,
}

impl Dispatcher {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            priority: VecDeque::new(),
            normal: VecDeque::new(),
            pending_stop: None,
            next_id: 1,
            last_send_at: None,
            awaiting_ack_since: None,
            latency: LatencyStats::default(),
            sent_count: 0,
            failed_count: 0,
        }
    }

    fn entry(&mut self, command: Command, priority: bool, now: Instant) -> DispatchEntry {
        let id = DispatchId(self.next_id);
        self.next_id += 1;
        DispatchEntry {
            id,
            command,
            enqueued_at: now,
            priority,
        }
    }

    /// Queue a command. Emergency stop is routed to [`Self::emergency_stop`].
    pub fn enqueue(
        &mut self,
        command: Command,
        priority: bool,
        now: Instant,
    ) -> Result<DispatchId, ValidationError> {
        command.validate()?;
        if command.is_emergency() {
            return Ok(self.emergency_stop(now));
        }
        let entry = self.entry(command, priority, now);
        let id = entry.id;
        debug!("queued #{} {}{}", id.0, command.describe(), if priority { " [priority]" } else { "" });
        if priority {
            self.priority.push_back(entry);
        } else {
            self.normal.push_back(entry);
        }
        Ok(id)
    }

    /// Drop everything queued; the stop goes out on the next `next` call.
    pub fn emergency_stop(&mut self, now: Instant) -> DispatchId {
        let dropped = self.clear();
        if dropped > 0 {
            info!("🛑 Emergency stop: dropped {dropped} queued command(s)");
        }
        let entry = self.entry(Command::EmergencyStop, true, now);
        let id = entry.id;
        self.pending_stop = Some(entry);
        id
    }

    /// Remove every queued command (not a pending emergency stop). Returns the count.
    pub fn clear(&mut self) -> usize {
        let n = self.priority.len() + self.normal.len();
        self.priority.clear();
        self.normal.clear();
        n
    }

    pub fn next(&mut self, now: Instant) -> NextDispatch {
        if let Some(stop) = self.pending_stop.take() {
            return NextDispatch::Send(stop);
        }
        if self.priority.is_empty() && self.normal.is_empty() {
            return NextDispatch::Idle;
        }
        if let Some(last) = self.last_send_at {
            let ready_at = last + self.min_interval;
            if now < ready_at {
                return NextDispatch::WaitUntil(ready_at);
            }
        }
        let entry = self
            .priority
            .pop_front()
            .or_else(|| self.normal.pop_front());
        match entry {
            Some(e) => NextDispatch::Send(e),
            None => NextDispatch::Idle,
        }
    }

    /// Report the outcome of a send handed out by `next`. Failed commands are not requeued.
    pub fn complete(&mut self, entry: &DispatchEntry, result: Result<(), &TransportError>, now: Instant) {
        match result {
            Ok(()) => {
                self.sent_count += 1;
                self.last_send_at = Some(now);
                self.awaiting_ack_since = Some(now);
            }
            Err(e) => {
                self.failed_count += 1;
                warn!("send #{} ({}) failed: {e}", entry.id.0, entry.command.describe());
            }
        }
    }

    /// The hub reported ready; returns the round-trip if a send was waiting on it.
    pub fn acknowledge(&mut self, now: Instant) -> Option<Duration> {
        let sent_at = self.awaiting_ack_since.take()?;
        let rtt = now.saturating_duration_since(sent_at);
        self.latency.record(rtt);
        Some(rtt)
    }

    /// Drain the queue into `sink`, sleeping out the rate limit between sends.
    pub async fn flush<S: CommandSink + ?Sized>(&mut self, sink: &mut S) -> FlushReport {
        let mut report = FlushReport::default();
        loop {
            match self.next(Instant::now()) {
                NextDispatch::Send(entry) => {
                    let result = sink.deliver(&entry.command).await;
                    self.complete(&entry, result.as_ref().map(|_| ()), Instant::now());
                    match result {
                        Ok(()) => report.sent += 1,
                        Err(e) => report.failures.push((entry, e)),
                    }
                }
                NextDispatch::WaitUntil(at) => tokio::time::sleep_until(at).await,
                NextDispatch::Idle => break,
            }
        }
        report
    }

    pub fn queue_len(&self) -> usize {
        self.priority.len() + self.normal.len() + usize::from(self.pending_stop.is_some())
    }

    pub fn is_idle(&self) -> bool {
        self.queue_len() == 0
    }

    pub fn latency(&self) -> LatencyStats {
        self.latency
    }

    pub fn sent_count(&self) -> u64 {
        self.sent_count
    }

    pub fn failed_count(&self) -> u64 {
        self.failed_count
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}
