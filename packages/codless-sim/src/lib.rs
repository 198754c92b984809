//! # codless-sim
//!
//! Robot motion simulator for CodLess development:
//! - [`robot_sim`]: the fixed-step motion model shared with the backend
//! - [`scenarios`]: injectable drivetrain imperfections
//! - [`hub`]: a virtual hub speaking the robot's radio framing over UDP

pub mod hub;
pub mod robot_sim;
pub mod scenarios;

pub use robot_sim::{MechanicalBias, MotionModel, MotionParams, MotionSnapshot, WorkspaceBounds};
