#![doc = include_str!("../README.md")]

pub mod cancel;
pub mod clock;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod queue;
pub mod scheduler;

pub use cancel::Cancellable;
pub use clock::TickClock;
pub use connection::{Connection, RecordingConnection, SerialRelay, TcpRelay, Transmission};
pub use context::{ControllerContext, RunInfo};
pub use error::{CancelReason, Cancelled, QueueFull, SchedulerError, TransportError};
pub use queue::{CommandQueue, DispatchPhase, NextStateChange, TimedFrame};
pub use scheduler::{Joystick, Scheduler, SchedulerConfig, ScrollDirection};

pub use joyframe_shared::{Buttons, ControllerState, DpadPosition, Gyro, GyroAxis, StateDiff, Stick};
