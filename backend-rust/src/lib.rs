//! CodLess backend: motion dispatch, calibration, recording and playback for
//! a two-motor teleop robot, routed to a radio hub or to the built-in simulator.

pub mod calibration;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod input;
pub mod odometry;
pub mod playback;
pub mod reconnect;
pub mod recorder;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use controller::Controller;
pub use error::{CoreError, Result};
pub use runtime::{ControlHandle, ControlRequest};
