//! In-process backend that records transmissions instead of driving hardware.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, unbounded};
use joyframe_shared::protocol::serial::{REPORT_FRAME_LEN, StateReport};
use joyframe_shared::protocol::text::encode_diff;
use joyframe_shared::protocol::JoystickCalibration;
use joyframe_shared::{ControllerState, StateDiff};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Connection, Transmission};
use crate::error::TransportError;

/// One transmission as seen by the recording backend
#[derive(Clone, Debug)]
pub struct Recorded {
    pub state: ControllerState,
    /// Present when the dispatch thread sent a diff
    pub diff: Option<StateDiff>,
    pub ticks: u32,
    pub at: Instant,
    /// What a real relay would have received
    pub wire: Vec<u8>,
}

/// Remote control for a [`RecordingConnection`] owned by a dispatch thread
#[derive(Clone, Debug, Default)]
pub struct RecordingControl {
    fail_next: Arc<AtomicBool>,
}

impl RecordingControl {
    /// Make the next send fail as if the link dropped
    pub fn fail_next_send(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

/// Hardware-out-of-the-loop backend.
///
/// With `diff_only` it behaves like the TCP relay (diffs, no tick), otherwise
/// like the serial relay (full states on a fixed tick).
#[derive(Serialize, Deserialize, Default)]
pub struct RecordingConnection {
    ticksize_ms: u64,
    diff_only: bool,
    cooldown_ms: u64,
    #[serde(skip)]
    tx: Option<Sender<Recorded>>,
    #[serde(skip)]
    control: RecordingControl,
    #[serde(skip)]
    open: bool,
    #[serde(skip)]
    failure: Option<String>,
}

impl RecordingConnection {
    pub fn new(ticksize: Duration, diff_only: bool) -> (Self, Receiver<Recorded>, RecordingControl) {
        let (tx, rx) = unbounded();
        let control = RecordingControl::default();
        let conn = Self {
            ticksize_ms: ticksize.as_millis() as u64,
            diff_only,
            cooldown_ms: 0,
            tx: Some(tx),
            control: control.clone(),
            open: false,
            failure: None,
        };
        (conn, rx, control)
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_ms = cooldown.as_millis() as u64;
        self
    }
}

#[typetag::serde]
impl Connection for RecordingConnection {
    fn is_open(&self) -> bool {
        self.open
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.open = true;
        self.failure = None;
        debug!("Opened recording connection");
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn ticksize(&self) -> Duration {
        Duration::from_millis(self.ticksize_ms)
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    fn supports_diff(&self) -> bool {
        self.diff_only
    }

    fn encode(
        &mut self,
        tx: &Transmission<'_>,
        ticks: u32,
        out: &mut Vec<u8>,
    ) -> Result<(), TransportError> {
        match tx.diff() {
            Some(diff) if self.diff_only => {
                let mut lines = String::new();
                encode_diff(&diff, &mut lines);
                out.extend_from_slice(lines.as_bytes());
            }
            _ => {
                let ticks = ticks.min(u16::MAX as u32) as u16;
                let report =
                    StateReport::from_state(0, ticks, tx.target(), &JoystickCalibration::default());
                let mut frame = [0_u8; REPORT_FRAME_LEN];
                report.write_frame(&mut frame);
                out.extend_from_slice(&frame);
            }
        }
        Ok(())
    }

    fn send(&mut self, tx: Transmission<'_>, ticks: u32) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if let Some(reason) = &self.failure {
            return Err(TransportError::Closed(reason.clone()));
        }
        if self.control.fail_next.swap(false, Ordering::SeqCst) {
            let e = io::Error::new(io::ErrorKind::BrokenPipe, "injected link failure");
            self.failure = Some(e.to_string());
            return Err(TransportError::Io(e));
        }

        let mut wire = Vec::new();
        self.encode(&tx, ticks, &mut wire)?;
        let record = Recorded {
            state: *tx.target(),
            diff: tx.diff(),
            ticks,
            at: Instant::now(),
            wire,
        };
        if let Some(sink) = &self.tx {
            if sink.send(record).is_err() {
                warn!("Recording receiver dropped");
                self.tx = None;
            }
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.open && self.failure.is_none()
    }

    fn error_string(&self) -> Option<String> {
        self.failure.clone()
    }
}

#[cfg(test)]
mod test {
    use joyframe_shared::Buttons;

    use super::*;

    #[test]
    fn test_records_and_fails_on_demand() {
        let (mut conn, rx, control) = RecordingConnection::new(Duration::from_millis(8), false);
        let state = ControllerState::default().with_buttons(Buttons::PLUS);
        assert!(matches!(
            conn.send(Transmission::Full(&state), 2),
            Err(TransportError::NotOpen)
        ));

        conn.open().unwrap();
        conn.send(Transmission::Full(&state), 2).unwrap();
        let rec = rx.try_recv().unwrap();
        assert_eq!(rec.state, state);
        assert_eq!(rec.ticks, 2);
        assert!(rec.diff.is_none());
        let report = StateReport::read_frame(&rec.wire).unwrap();
        assert_eq!(report.to_state(&JoystickCalibration::default()), state);

        control.fail_next_send();
        assert!(conn.send(Transmission::Full(&state), 1).is_err());
        assert!(!conn.is_ready());
        assert!(conn.send(Transmission::Full(&state), 1).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_diff_mode_records_lines() {
        let (mut conn, rx, _control) = RecordingConnection::new(Duration::ZERO, true);
        conn.open().unwrap();
        let to = ControllerState::default().with_buttons(Buttons::A);
        conn.send(
            Transmission::Diff {
                from: &ControllerState::NEUTRAL,
                to: &to,
            },
            0,
        )
        .unwrap();
        let rec = rx.try_recv().unwrap();
        assert_eq!(rec.diff, Some(ControllerState::NEUTRAL.diff(&to)));
        assert_eq!(rec.wire, b"press A\r\n");
    }
}
