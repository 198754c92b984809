//! recorder.rs — Captures commands, raw input and pose samples into a Run

use codless_types::{
    Command, Pose, PoseSample, RawInputEvent, RecordedEvent, RecordedPayload, Run, StartCorner,
};
use tokio::time::Instant;
use tracing::info;

use crate::error::StateError;

struct Capture {
    name: String,
    corner: StartCorner,
    started_at: Instant,
    events: Vec<RecordedEvent>,
    path: Vec<PoseSample>,
}

impl Capture {
    fn offset_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.started_at).as_millis() as u64
    }
}

pub struct Recorder {
    capture_path: bool,
    active: Option<Capture>,
}

impl Recorder {
    pub fn new(capture_path: bool) -> Self {
        Self {
            capture_path,
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn name(&self) -> Option<&str> {
        self.active.as_ref().map(|c| c.name.as_str())
    }

    pub fn event_count(&self) -> usize {
        self.active.as_ref().map_or(0, |c| c.events.len())
    }

    pub fn elapsed_ms(&self, now: Instant) -> u64 {
        self.active.as_ref().map_or(0, |c| c.offset_ms(now))
    }

    pub fn captures_path(&self) -> bool {
        self.capture_path
    }

    pub fn start(&mut self, name: &str, corner: StartCorner, now: Instant) -> Result<(), StateError> {
        if let Some(active) = &self.active {
            return Err(StateError::AlreadyRecording(active.name.clone()));
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(StateError::EmptyRunName);
        }
        info!("⏺ Recording '{name}'");
        self.active = Some(Capture {
            name: name.to_string(),
            corner,
            started_at: now,
            events: Vec::new(),
            path: Vec::new(),
        });
        Ok(())
    }

    /// Returns false when not recording.
    pub fn record_command(&mut self, command: Command, now: Instant) -> bool {
        self.push(RecordedPayload::Command(command), now)
    }

    pub fn record_input(&mut self, event: RawInputEvent, now: Instant) -> bool {
        self.push(RecordedPayload::Input(event), now)
    }

    fn push(&mut self, payload: RecordedPayload, now: Instant) -> bool {
        let Some(capture) = self.active.as_mut() else {
            return false;
        };
        let timestamp_offset_ms = capture.offset_ms(now);
        capture.events.push(RecordedEvent {
            timestamp_offset_ms,
            payload,
        });
        true
    }

    pub fn sample_pose(&mut self, pose: &Pose, now: Instant) {
        if !self.capture_path {
            return;
        }
        if let Some(capture) = self.active.as_mut() {
            let offset = capture.offset_ms(now);
            capture.path.push(PoseSample::from_pose(offset, pose));
        }
    }

    /// Freeze the capture into a Run with a fresh id.
    pub fn stop(&mut self, now: Instant) -> Result<Run, StateError> {
        let capture = self.active.take().ok_or(StateError::NotRecording)?;
        let duration = capture.offset_ms(now);
        let run = Run {
            id: uuid::Uuid::new_v4().to_string(),
            name: capture.name,
            events: capture.events,
            path: (!capture.path.is_empty()).then_some(capture.path),
            start_corner: capture.corner,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        info!(
            "⏹ Recorded '{}': {} events, {} path samples over {duration}ms",
            run.name,
            run.events.len(),
            run.path.as_ref().map_or(0, Vec::len)
        );
        Ok(run)
    }

    /// Discard the capture without producing a Run. Returns its name.
    pub fn cancel(&mut self) -> Option<String> {
        self.active.take().map(|c| c.name)
    }
}
