//! Transports that carry controller states to the relay hardware.
//!
//! Each backend is a [`Connection`] owned by exactly one dispatch thread.
//! Backends are configured through serde and selected by their `type` tag,
//! so a connection can be described in a config file and built at runtime.

pub mod recording;
pub mod serial;
pub mod tcp;

use std::time::Duration;

use joyframe_shared::{ControllerState, StateDiff};

use crate::error::TransportError;

pub use recording::{Recorded, RecordingConnection, RecordingControl};
pub use serial::{SerialLink, SerialRelay, SerialRelayConfig};
pub use tcp::{TcpRelay, TcpRelayConfig};

/// What the dispatch thread asks a backend to put on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transmission<'a> {
    /// The complete state
    Full(&'a ControllerState),
    /// Move the relay from `from` to `to`
    Diff {
        from: &'a ControllerState,
        to: &'a ControllerState,
    },
}

impl Transmission<'_> {
    /// The state the relay should be in after this transmission
    pub fn target(&self) -> &ControllerState {
        match self {
            Self::Full(state) => state,
            Self::Diff { to, .. } => to,
        }
    }

    pub fn diff(&self) -> Option<StateDiff> {
        match self {
            Self::Full(_) => None,
            Self::Diff { from, to } => Some(from.diff(to)),
        }
    }
}

/// Pluggable transport to a controller relay.
#[typetag::serde(tag = "type")]
pub trait Connection: Send {
    /// Check whether the link is already open
    fn is_open(&self) -> bool;

    /// Do any required stateful one-time setup
    fn open(&mut self) -> Result<(), TransportError>;

    /// Release the link and any helper threads
    fn close(&mut self);

    /// Scheduling unit of the relay. Zero means the relay paces itself.
    fn ticksize(&self) -> Duration;

    /// Minimum spacing the relay needs between two state changes
    fn cooldown(&self) -> Duration {
        Duration::ZERO
    }

    /// Whether the relay accepts [`Transmission::Diff`]
    fn supports_diff(&self) -> bool {
        false
    }

    /// Append the wire bytes for a transmission held for `ticks`.
    fn encode(
        &mut self,
        tx: &Transmission<'_>,
        ticks: u32,
        out: &mut Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Encode and transmit, blocking until the relay has accepted it.
    fn send(&mut self, tx: Transmission<'_>, ticks: u32) -> Result<(), TransportError>;

    /// False once the link has failed. A failed link is never reused.
    fn is_ready(&self) -> bool;

    /// Why the link failed, if the backend knows
    fn error_string(&self) -> Option<String> {
        None
    }
}
