//! Binary report format for the USB-serial relay microcontroller.
//!
//! Each frame is a little-endian [`StateReport`] followed by a CRC32 of the
//! report bytes. The relay queues reports and holds each one for
//! `ticks` of its own tick clock, answering with a [`ReportAck`].
//!
//! ```text
//! | magic | seqnum | ticks | buttons[3] | left[3] | right[3] | gyro[6] | crc32 |
//! |  u8   |  u32   |  u16  |  bit mask  | 12-bit x/y packed  |  i16    |  u32  |
//! ```

use byte_struct::*;
pub use byte_struct::{ByteStruct, ByteStructLen};
use thiserror::Error;

use crate::enum_with_unknown;
use crate::state::{Buttons, ControllerState, DpadPosition, Gyro, Stick};

/// First byte of every state report
pub const REPORT_MAGIC: u8 = 0xA5;

/// First byte of every acknowledgement
pub const ACK_TAG: u8 = 0xAC;

/// Length of a report plus its CRC trailer
pub const REPORT_FRAME_LEN: usize = StateReport::BYTE_LEN + 4;

/// Controller state as transmitted to the serial relay
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[byte_struct_le]
pub struct StateReport {
    pub magic: u8,

    /// Host-side sequence number, echoed in the acknowledgement
    pub seqnum: u32,

    /// How many relay ticks to hold this state for
    pub ticks: u16,

    /// Button and dpad switches in the console's native report layout
    pub buttons: [u8; 3],

    /// Calibrated 12-bit x/y, packed
    pub left_stick: [u8; 3],
    pub right_stick: [u8; 3],

    /// Accel xyz then rotate xyz
    pub gyro: [i16; 6],
}

impl StateReport {
    pub fn from_state(
        seqnum: u32,
        ticks: u16,
        state: &ControllerState,
        calibration: &JoystickCalibration,
    ) -> Self {
        Self {
            magic: REPORT_MAGIC,
            seqnum,
            ticks,
            buttons: encode_buttons(state.buttons, state.dpad),
            left_stick: calibration.encode_stick(state.left),
            right_stick: calibration.encode_stick(state.right),
            gyro: state.gyro.to_array(),
        }
    }

    /// Recover the controller state, subject to calibration rounding
    /// of at most one unit per stick axis.
    pub fn to_state(&self, calibration: &JoystickCalibration) -> ControllerState {
        let (buttons, dpad) = decode_buttons(self.buttons);
        ControllerState {
            buttons,
            dpad,
            left: calibration.decode_stick(self.left_stick),
            right: calibration.decode_stick(self.right_stick),
            gyro: Gyro::from_array(self.gyro),
        }
    }

    /// Write the report and its CRC trailer to `frame`.
    pub fn write_frame(&self, frame: &mut [u8; REPORT_FRAME_LEN]) {
        let (body, crc) = frame.split_at_mut(StateReport::BYTE_LEN);
        self.write_bytes(body);
        crc.copy_from_slice(&crc32fast::hash(body).to_le_bytes());
    }

    /// Parse and check a framed report.
    pub fn read_frame(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() != REPORT_FRAME_LEN {
            return Err(FrameError::WrongLength(frame.len()));
        }
        let (body, crc) = frame.split_at(StateReport::BYTE_LEN);
        let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
        if crc32fast::hash(body) != expected {
            return Err(FrameError::BadCrc);
        }
        let report = Self::read_bytes(body);
        if report.magic != REPORT_MAGIC {
            return Err(FrameError::BadMagic(report.magic));
        }
        Ok(report)
    }
}

/// Relay response to a state report
#[derive(ByteStruct, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[byte_struct_le]
pub struct ReportAck {
    pub tag: u8,
    pub seqnum: u32,
    pub status: AckStatus,
}

impl ReportAck {
    pub fn new(seqnum: u32, status: AckStatus) -> Self {
        Self {
            tag: ACK_TAG,
            seqnum,
            status,
        }
    }
}

enum_with_unknown!(
    /// Outcome of a report as seen by the relay
    #[derive(Default)]
    #[non_exhaustive]
    pub enum AckStatus(u8) {
        #[default]
        Ok = 0,
        QueueFull = 1,
        BadFrame = 2,
    }
);

impl ByteStructLen for AckStatus {
    const BYTE_LEN: usize = 1;
}

impl ByteStruct for AckStatus {
    fn read_bytes(bytes: &[u8]) -> Self {
        Self::from(bytes[0])
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0] = u8::from(*self);
    }
}

/// Reasons a received frame is rejected
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("expected {REPORT_FRAME_LEN} byte frame, got {0}")]
    WrongLength(usize),
    #[error("bad report magic {0:#04x}")]
    BadMagic(u8),
    #[error("report CRC mismatch")]
    BadCrc,
}

// Native report layout
const BYTE0: [(Buttons, u8); 6] = [
    (Buttons::Y, 0x01),
    (Buttons::X, 0x02),
    (Buttons::B, 0x04),
    (Buttons::A, 0x08),
    (Buttons::R, 0x40),
    (Buttons::ZR, 0x80),
];
const BYTE1: [(Buttons, u8); 6] = [
    (Buttons::MINUS, 0x01),
    (Buttons::PLUS, 0x02),
    (Buttons::RCLICK, 0x04),
    (Buttons::LCLICK, 0x08),
    (Buttons::HOME, 0x10),
    (Buttons::CAPTURE, 0x20),
];
const BYTE2: [(Buttons, u8); 2] = [(Buttons::L, 0x40), (Buttons::ZL, 0x80)];
const DPAD_DOWN: u8 = 0x01;
const DPAD_UP: u8 = 0x02;
const DPAD_RIGHT: u8 = 0x04;
const DPAD_LEFT: u8 = 0x08;

fn pack(buttons: Buttons, table: &[(Buttons, u8)]) -> u8 {
    table
        .iter()
        .filter(|(b, _)| buttons.contains(*b))
        .fold(0, |acc, (_, bit)| acc | bit)
}

fn unpack(byte: u8, table: &[(Buttons, u8)]) -> Buttons {
    table
        .iter()
        .filter(|(_, bit)| byte & bit != 0)
        .fold(Buttons::NONE, |acc, (b, _)| acc | *b)
}

/// Pack buttons and dpad into the three native button bytes.
pub fn encode_buttons(buttons: Buttons, dpad: DpadPosition) -> [u8; 3] {
    let (up, right, down, left) = dpad.directions();
    let mut byte2 = pack(buttons, &BYTE2);
    if down {
        byte2 |= DPAD_DOWN;
    }
    if up {
        byte2 |= DPAD_UP;
    }
    if right {
        byte2 |= DPAD_RIGHT;
    }
    if left {
        byte2 |= DPAD_LEFT;
    }
    [pack(buttons, &BYTE0), pack(buttons, &BYTE1), byte2]
}

pub fn decode_buttons(bytes: [u8; 3]) -> (Buttons, DpadPosition) {
    let buttons = unpack(bytes[0], &BYTE0) | unpack(bytes[1], &BYTE1) | unpack(bytes[2], &BYTE2);
    let dpad = DpadPosition::from_directions(
        bytes[2] & DPAD_UP != 0,
        bytes[2] & DPAD_RIGHT != 0,
        bytes[2] & DPAD_DOWN != 0,
        bytes[2] & DPAD_LEFT != 0,
    );
    (buttons, dpad)
}

/// Mapping from full-range stick bytes to the relay's 12-bit axis values.
///
/// The console only registers a deflection once the raw value moves past
/// `deadzone_edge`, and saturates at `max_deflection`. Byte deflections are
/// interpolated linearly between those two points on either side of
/// `neutral`. Raw values are measured below neutral; the same distances
/// apply above it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JoystickCalibration {
    pub neutral: u16,
    pub deadzone_edge: u16,
    pub max_deflection: u16,
}

impl Default for JoystickCalibration {
    fn default() -> Self {
        Self {
            neutral: 2048,
            deadzone_edge: 1897,
            max_deflection: 320,
        }
    }
}

const AXIS_MAX: f64 = 4095.0;

fn round(v: f64) -> i32 {
    if v >= 0.0 {
        (v + 0.5) as i32
    } else {
        (v - 0.5) as i32
    }
}

impl JoystickCalibration {
    /// Raw units skipped over when leaving the dead zone
    fn shift(&self) -> f64 {
        self.neutral as f64 - self.deadzone_edge as f64
    }

    /// Raw units per byte of deflection
    fn ratio(&self) -> f64 {
        (self.deadzone_edge as f64 - self.max_deflection as f64) / 127.0
    }

    /// Map a stick byte to a raw axis value. `invert` flips the direction,
    /// as the console's y axis points up.
    pub fn encode_axis(&self, v: u8, invert: bool) -> u16 {
        let mut d = (v as f64 - Stick::CENTER as f64) * self.ratio();
        if d > 0.0 {
            d += self.shift();
        } else if d < 0.0 {
            d -= self.shift();
        }
        let raw = if invert {
            self.neutral as f64 - d
        } else {
            self.neutral as f64 + d
        } + 0.5;
        raw.clamp(0.0, AXIS_MAX) as u16
    }

    /// Inverse of [`Self::encode_axis`], as applied by the relay test harness.
    pub fn decode_axis(&self, raw: u16, invert: bool) -> u8 {
        let ratio = self.ratio();
        if ratio <= 0.0 {
            return Stick::CENTER;
        }
        let d = if invert {
            self.neutral as f64 - raw as f64
        } else {
            raw as f64 - self.neutral as f64
        };
        let magnitude = if d < 0.0 { -d } else { d } - self.shift();
        if magnitude <= 0.0 {
            return Stick::CENTER;
        }
        let units = round(magnitude / ratio);
        let units = if d < 0.0 { -units } else { units };
        (Stick::CENTER as i32 + units).clamp(0, 255) as u8
    }

    /// Pack a stick into three bytes as two 12-bit values, x first.
    pub fn encode_stick(&self, stick: Stick) -> [u8; 3] {
        let wx = self.encode_axis(stick.x, false);
        let wy = self.encode_axis(stick.y, true);
        [wx as u8, ((wx >> 8) | (wy << 4)) as u8, (wy >> 4) as u8]
    }

    pub fn decode_stick(&self, data: [u8; 3]) -> Stick {
        let wx = data[0] as u16 | ((data[1] as u16 & 0x0F) << 8);
        let wy = (data[1] as u16 >> 4) | ((data[2] as u16) << 4);
        Stick::new(self.decode_axis(wx, false), self.decode_axis(wy, true))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::state::GyroAxis;

    fn assert_stick_close(a: Stick, b: Stick) {
        assert!((a.x as i32 - b.x as i32).abs() <= 1, "{a:?} vs {b:?}");
        assert!((a.y as i32 - b.y as i32).abs() <= 1, "{a:?} vs {b:?}");
    }

    #[test]
    fn test_report_frame_roundtrip() {
        let cal = JoystickCalibration::default();
        let state = ControllerState::default()
            .with_buttons(Buttons::A | Buttons::ZL | Buttons::HOME)
            .with_dpad(DpadPosition::DownLeft)
            .with_left(0, 255)
            .with_right(200, 17)
            .with_gyro(GyroAxis::AccelZ, -1234)
            .with_gyro(GyroAxis::RotateX, i16::MAX);

        let report = StateReport::from_state(42, 3, &state, &cal);
        let mut frame = [0_u8; REPORT_FRAME_LEN];
        report.write_frame(&mut frame);
        let parsed = StateReport::read_frame(&frame).unwrap();
        assert_eq!(parsed, report);

        let decoded = parsed.to_state(&cal);
        assert_eq!(decoded.buttons, state.buttons);
        assert_eq!(decoded.dpad, state.dpad);
        assert_eq!(decoded.gyro, state.gyro);
        assert_stick_close(decoded.left, state.left);
        assert_stick_close(decoded.right, state.right);
    }

    #[test]
    fn test_every_axis_value_within_one_unit() {
        let cal = JoystickCalibration::default();
        for v in 0..=255_u8 {
            for invert in [false, true] {
                let back = cal.decode_axis(cal.encode_axis(v, invert), invert);
                assert!((back as i32 - v as i32).abs() <= 1, "{v} -> {back}");
            }
        }
        assert_eq!(cal.encode_axis(128, false), 2048);
        assert_eq!(cal.decode_stick(cal.encode_stick(Stick::NEUTRAL)), Stick::NEUTRAL);
    }

    #[test]
    fn test_first_deflection_clears_dead_zone() {
        let cal = JoystickCalibration::default();
        // One unit left of center must already be past the dead zone edge
        assert!(cal.encode_axis(127, false) < cal.deadzone_edge);
        // Full up on y maps to the high end after inversion
        assert!(cal.encode_axis(0, true) > cal.neutral + cal.shift() as u16);
    }

    #[test]
    fn test_corrupt_frames_rejected() {
        let cal = JoystickCalibration::default();
        let mut frame = [0_u8; REPORT_FRAME_LEN];
        StateReport::from_state(1, 1, &ControllerState::default(), &cal).write_frame(&mut frame);

        let mut flipped = frame;
        flipped[7] ^= 0x10;
        assert_eq!(StateReport::read_frame(&flipped), Err(FrameError::BadCrc));
        assert_eq!(
            StateReport::read_frame(&frame[..10]),
            Err(FrameError::WrongLength(10))
        );
        assert_eq!(
            FrameError::WrongLength(10).to_string(),
            format!("expected {REPORT_FRAME_LEN} byte frame, got 10")
        );
        assert_eq!(FrameError::BadMagic(0x5A).to_string(), "bad report magic 0x5a");
    }

    #[test]
    fn test_ack_status_unknown_passthrough() {
        let mut bytes = [0_u8; ReportAck::BYTE_LEN];
        ReportAck::new(9, AckStatus::QueueFull).write_bytes(&mut bytes);
        let ack = ReportAck::read_bytes(&bytes);
        assert_eq!(ack.tag, ACK_TAG);
        assert_eq!(ack.seqnum, 9);
        assert_eq!(ack.status, AckStatus::QueueFull);
        assert_eq!(AckStatus::from(77), AckStatus::Unknown(77));
    }
}
