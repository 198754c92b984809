//! Error types for the CodLess backend

use std::time::Duration;

use codless_types::wire::WireError;
use codless_types::ValidationError;

use crate::store::StoreError;

/// Result type alias
pub type Result<T> = std::result::Result<T, CoreError>;

/// Link-level failures. Surfaced on the event stream; never retried per command.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Wire(#[from] WireError),

    #[error("link closed by peer")]
    Closed,
}

/// An operation refused because of what the system is currently doing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateError {
    #[error("cannot start {requested}: {active} in progress")]
    Busy {
        requested: &'static str,
        active: &'static str,
    },

    #[error("robot not connected and simulation mode disabled; connect to the hub or enable simulation")]
    NoRoute,

    #[error("robot must be calibrated before manual control")]
    NotCalibrated,

    #[error("calibration is already running")]
    CalibrationRunning,

    #[error("no calibration is running")]
    CalibrationIdle,

    #[error("already recording '{0}'")]
    AlreadyRecording(String),

    #[error("not recording")]
    NotRecording,

    #[error("no finished recording to save")]
    NothingToSave,

    #[error("run name must not be empty")]
    EmptyRunName,

    #[error("a run named '{0}' already exists")]
    DuplicateRunName(String),

    #[error("unknown run '{0}'")]
    UnknownRun(String),

    #[error("run '{0}' has no events to play")]
    EmptyRun(String),

    #[error("run '{0}' has no recorded path")]
    NoPath(String),

    #[error("playback is not {0}")]
    Playback(&'static str),

    #[error("already connected")]
    AlreadyConnected,
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{what} timed out after {}ms", after.as_millis())]
    Timeout { what: String, after: Duration },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("control loop is not running")]
    Stopped,
}
