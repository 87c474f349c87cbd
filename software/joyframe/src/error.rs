//! Error taxonomy for command issuing and transport.

use std::fmt;

use thiserror::Error;

/// Why a cancellation scope was cancelled
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// Cancelled on request, e.g. the user stopped the run
    Requested,
    /// Aborted because of a failure elsewhere
    Aborted(String),
    /// An enclosing scope was cancelled
    ParentCancelled,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "cancellation requested"),
            Self::Aborted(msg) => write!(f, "aborted: {msg}"),
            Self::ParentCancelled => write!(f, "parent scope cancelled"),
        }
    }
}

/// A blocking wait returned early because its scope was cancelled
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("operation cancelled ({0})")]
pub struct Cancelled(pub CancelReason);

/// Non-blocking push into a full command queue
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("command queue is full")]
pub struct QueueFull;

/// Failure on the link to the relay hardware.
/// Not recoverable for the current connection.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection is not open")]
    NotOpen,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed: {0}")]
    Closed(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error(transparent)]
    QueueFull(#[from] QueueFull),

    /// The dispatch thread lost its link; carries the backend's error string
    #[error("controller link failed: {0}")]
    LinkFailed(String),

    #[error("dispatch thread has stopped")]
    Stopped,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to spawn dispatch thread: {0}")]
    Spawn(std::io::Error),
}

impl SchedulerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
