//! USB-serial relay backend.
//!
//! Every transmission is a full [`StateReport`] frame. The relay queues
//! reports and holds each one for its tick count, so the host only has to
//! stay a little ahead of the relay rather than hit each deadline exactly.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use joyframe_shared::protocol::serial::{
    ACK_TAG, AckStatus, ByteStruct, ByteStructLen, REPORT_FRAME_LEN, ReportAck, StateReport,
};
use joyframe_shared::protocol::JoystickCalibration;
use joyframe_shared::{SERIAL_BAUD_RATE, WIRED_TICK_MS};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Connection, Transmission};
use crate::error::TransportError;

/// Byte stream to the relay microcontroller.
///
/// Implemented for anything readable and writable, including the boxed
/// port returned by `serialport`.
pub trait SerialLink: Read + Write + Send {}

impl<T: Read + Write + Send> SerialLink for T {}

#[derive(Serialize, Deserialize)]
#[serde(remote = "JoystickCalibration")]
struct CalibrationDef {
    neutral: u16,
    deadzone_edge: u16,
    max_deflection: u16,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialRelayConfig {
    /// OS name of the port, e.g. `/dev/ttyUSB0` or `COM3`
    pub port_name: String,
    pub baud_rate: u32,
    /// Relay tick; 8ms for wired relays, 15ms for wireless ones
    pub ticksize_ms: u64,
    /// How long to wait for an acknowledgement
    pub read_timeout_ms: u64,
    /// Wait for the relay to acknowledge each report
    pub require_ack: bool,
    /// Resends allowed while the relay reports its own queue as full
    pub busy_retries: u32,
    #[serde(with = "CalibrationDef")]
    pub calibration: JoystickCalibration,
}

impl Default for SerialRelayConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: SERIAL_BAUD_RATE,
            ticksize_ms: WIRED_TICK_MS,
            read_timeout_ms: 100,
            require_ack: true,
            busy_retries: 16,
            calibration: JoystickCalibration::default(),
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct SerialRelay {
    config: SerialRelayConfig,
    #[serde(skip)]
    link: Option<Box<dyn SerialLink>>,
    #[serde(skip)]
    seqnum: u32,
    #[serde(skip)]
    failed: bool,
    #[serde(skip)]
    txbuf: Vec<u8>,
}

impl SerialRelay {
    pub fn new(config: SerialRelayConfig) -> Self {
        Self {
            config,
            link: None,
            seqnum: 0,
            failed: false,
            txbuf: Vec::with_capacity(REPORT_FRAME_LEN),
        }
    }

    /// Use an already-open byte stream instead of opening `port_name`.
    pub fn with_link(config: SerialRelayConfig, link: Box<dyn SerialLink>) -> Self {
        let mut relay = Self::new(config);
        relay.link = Some(link);
        relay
    }

    pub fn config(&self) -> &SerialRelayConfig {
        &self.config
    }

    fn transmit(&mut self, tx: &Transmission<'_>, ticks: u32) -> Result<(), TransportError> {
        let mut txbuf = std::mem::take(&mut self.txbuf);
        txbuf.clear();
        let first = self.seqnum.wrapping_add(1);
        self.encode(tx, ticks, &mut txbuf)?;

        let link = self.link.as_mut().ok_or(TransportError::NotOpen)?;
        for (i, frame) in txbuf.chunks(REPORT_FRAME_LEN).enumerate() {
            let seqnum = first.wrapping_add(i as u32);
            exchange(&mut **link, frame, seqnum, &self.config)?;
        }

        self.txbuf = txbuf;
        Ok(())
    }
}

/// Write one framed report and, if required, wait for its acknowledgement.
fn exchange(
    link: &mut dyn SerialLink,
    frame: &[u8],
    seqnum: u32,
    config: &SerialRelayConfig,
) -> Result<(), TransportError> {
    let mut retries = 0;
    loop {
        link.write_all(frame)?;
        link.flush()?;
        if !config.require_ack {
            return Ok(());
        }

        let mut buf = [0_u8; ReportAck::BYTE_LEN];
        link.read_exact(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                TransportError::Timeout("relay acknowledgement")
            }
            _ => TransportError::Io(e),
        })?;
        let ack = ReportAck::read_bytes(&buf);
        if ack.tag != ACK_TAG {
            return Err(TransportError::Protocol(format!(
                "bad acknowledgement tag {:#04x}",
                ack.tag
            )));
        }
        if ack.seqnum != seqnum {
            return Err(TransportError::Protocol(format!(
                "acknowledged report {} while waiting on {seqnum}",
                ack.seqnum
            )));
        }

        match ack.status {
            AckStatus::Ok => return Ok(()),
            AckStatus::QueueFull if retries < config.busy_retries => {
                retries += 1;
                debug!("Relay queue full, resending report {seqnum}");
                thread::sleep(Duration::from_millis(config.ticksize_ms.max(1)));
            }
            AckStatus::QueueFull => return Err(TransportError::Timeout("relay queue space")),
            status => {
                return Err(TransportError::Protocol(format!(
                    "relay rejected report {seqnum}: {status:?}"
                )));
            }
        }
    }
}

#[typetag::serde]
impl Connection for SerialRelay {
    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        if self.link.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.config.port_name, self.config.baud_rate)
            .timeout(Duration::from_millis(self.config.read_timeout_ms))
            .open()?;
        info!(
            "Opened serial relay on {} at {} baud",
            self.config.port_name, self.config.baud_rate
        );
        self.link = Some(Box::new(port));
        self.failed = false;
        self.seqnum = 0;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.flush() {
                warn!("Failed to flush serial relay on close: {e}");
            }
        }
    }

    fn ticksize(&self) -> Duration {
        Duration::from_millis(self.config.ticksize_ms)
    }

    /// One report per `u16::MAX` ticks. Zero ticks means "hold until the
    /// next report".
    fn encode(
        &mut self,
        tx: &Transmission<'_>,
        ticks: u32,
        out: &mut Vec<u8>,
    ) -> Result<(), TransportError> {
        let state = tx.target();
        let mut remaining = ticks;
        loop {
            let chunk = remaining.min(u16::MAX as u32);
            remaining -= chunk;
            self.seqnum = self.seqnum.wrapping_add(1);

            let report =
                StateReport::from_state(self.seqnum, chunk as u16, state, &self.config.calibration);
            let mut frame = [0_u8; REPORT_FRAME_LEN];
            report.write_frame(&mut frame);
            out.extend_from_slice(&frame);

            if remaining == 0 {
                return Ok(());
            }
        }
    }

    fn send(&mut self, tx: Transmission<'_>, ticks: u32) -> Result<(), TransportError> {
        if self.failed {
            return Err(TransportError::Closed("serial relay link has failed".into()));
        }
        let result = self.transmit(&tx, ticks);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn is_ready(&self) -> bool {
        self.link.is_some() && !self.failed
    }
}

#[cfg(test)]
mod test {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use joyframe_shared::{Buttons, ControllerState, DpadPosition, GyroAxis};

    use super::*;

    #[derive(Default)]
    struct FakeRelayState {
        pending: Vec<u8>,
        reports: Vec<StateReport>,
        replies: VecDeque<u8>,
        busy_once: bool,
        silent: bool,
    }

    /// Relay firmware stand-in that acknowledges whatever it parses
    #[derive(Clone, Default)]
    struct FakeRelay(Arc<Mutex<FakeRelayState>>);

    impl FakeRelay {
        fn reports(&self) -> Vec<StateReport> {
            self.0.lock().unwrap().reports.clone()
        }
    }

    impl Write for FakeRelay {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut s = self.0.lock().unwrap();
            s.pending.extend_from_slice(buf);
            while s.pending.len() >= REPORT_FRAME_LEN {
                let frame: Vec<u8> = s.pending.drain(..REPORT_FRAME_LEN).collect();
                let (seqnum, status) = match StateReport::read_frame(&frame) {
                    Ok(report) => {
                        s.reports.push(report);
                        let status = if s.busy_once {
                            s.busy_once = false;
                            AckStatus::QueueFull
                        } else {
                            AckStatus::Ok
                        };
                        (report.seqnum, status)
                    }
                    Err(_) => (0, AckStatus::BadFrame),
                };
                if !s.silent {
                    let mut ack = [0_u8; ReportAck::BYTE_LEN];
                    ReportAck::new(seqnum, status).write_bytes(&mut ack);
                    s.replies.extend(ack);
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for FakeRelay {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut s = self.0.lock().unwrap();
            if s.replies.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply"));
            }
            let n = buf.len().min(s.replies.len());
            for (dst, src) in buf.iter_mut().zip(s.replies.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }
    }

    fn relay(fake: &FakeRelay) -> SerialRelay {
        SerialRelay::with_link(SerialRelayConfig::default(), Box::new(fake.clone()))
    }

    #[test]
    fn test_send_full_state_with_ack() {
        let fake = FakeRelay::default();
        let mut conn = relay(&fake);
        assert!(conn.is_open());
        assert!(conn.is_ready());

        let state = ControllerState::default()
            .with_buttons(Buttons::A | Buttons::ZL | Buttons::HOME)
            .with_dpad(DpadPosition::DownRight)
            .with_left(0, 255)
            .with_gyro(GyroAxis::RotateY, -1200);
        conn.send(Transmission::Full(&state), 12).unwrap();

        // A diff request still goes out as the full target state
        let prev = state;
        let next = ControllerState::default().with_buttons(Buttons::B);
        conn.send(Transmission::Diff { from: &prev, to: &next }, 3)
            .unwrap();

        let reports = fake.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].seqnum, 1);
        assert_eq!(reports[0].ticks, 12);
        assert_eq!(reports[1].seqnum, 2);

        let cal = JoystickCalibration::default();
        let decoded = reports[0].to_state(&cal);
        assert_eq!(decoded.buttons, state.buttons);
        assert_eq!(decoded.dpad, state.dpad);
        assert_eq!(decoded.gyro, state.gyro);
        assert!(decoded.left.x <= 1 && decoded.left.y >= 254);
        assert_eq!(reports[1].to_state(&cal), next);
    }

    #[test]
    fn test_long_hold_splits_reports() {
        let fake = FakeRelay::default();
        let mut conn = relay(&fake);
        let state = ControllerState::default().with_buttons(Buttons::X);
        conn.send(Transmission::Full(&state), 70_000).unwrap();

        let ticks: Vec<u16> = fake.reports().iter().map(|r| r.ticks).collect();
        assert_eq!(ticks, vec![u16::MAX, (70_000 - u16::MAX as u32) as u16]);

        let mut out = Vec::new();
        conn.encode(&Transmission::Full(&state), 0, &mut out).unwrap();
        assert_eq!(out.len(), REPORT_FRAME_LEN);
    }

    #[test]
    fn test_busy_relay_gets_resend() {
        let fake = FakeRelay::default();
        fake.0.lock().unwrap().busy_once = true;
        let mut conn = relay(&fake);
        conn.send(Transmission::Full(&ControllerState::NEUTRAL), 1)
            .unwrap();

        let reports = fake.reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0], reports[1]);
    }

    #[test]
    fn test_missing_ack_fails_link() {
        let fake = FakeRelay::default();
        fake.0.lock().unwrap().silent = true;
        let mut conn = relay(&fake);

        let err = conn
            .send(Transmission::Full(&ControllerState::NEUTRAL), 1)
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(!conn.is_ready());

        fake.0.lock().unwrap().silent = false;
        assert!(matches!(
            conn.send(Transmission::Full(&ControllerState::NEUTRAL), 1),
            Err(TransportError::Closed(_))
        ));
        assert_eq!(fake.reports().len(), 1);
    }

    #[test]
    fn test_serde_selects_backend_by_tag() {
        let config = SerialRelayConfig {
            port_name: "/dev/ttyACM0".into(),
            ticksize_ms: 15,
            ..Default::default()
        };
        let conn: Box<dyn Connection> = Box::new(SerialRelay::new(config.clone()));
        let json = serde_json::to_string(&conn).unwrap();
        assert!(json.contains(r#""type":"SerialRelay""#));

        let back: Box<dyn Connection> = serde_json::from_str(&json).unwrap();
        assert!(!back.is_open());
        assert!(!back.is_ready());
        assert_eq!(back.ticksize(), Duration::from_millis(15));

        let partial: SerialRelayConfig =
            serde_json::from_str(r#"{"port_name": "COM3"}"#).unwrap();
        assert_eq!(partial.baud_rate, SERIAL_BAUD_RATE);
        assert_eq!(partial.calibration, JoystickCalibration::default());
    }
}
