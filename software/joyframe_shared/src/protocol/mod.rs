//! Wire formats for each relay backend.
//!
//! The serial relay receives full fixed-size binary reports; the TCP relay
//! receives line commands describing only what changed.

pub mod serial;
#[cfg(feature = "std")]
pub mod text;

pub use serial::{JoystickCalibration, ReportAck, StateReport};
