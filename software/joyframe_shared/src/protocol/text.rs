//! Line commands for the TCP relay.
//!
//! The relay keeps its own copy of the controller state and is told only
//! what changed, one `\r\n`-terminated command per change:
//!
//! ```text
//! release B
//! press A
//! press DUP
//! setStick LEFT 0x7FFF -0x8000
//! ```
//!
//! Stick axes are signed 16-bit with up positive. Gyro is not part of the
//! line protocol.

use std::fmt::{self, Write};

use thiserror::Error;

use crate::state::{Buttons, ControllerState, DpadPosition, StateDiff, Stick};

/// Line terminator expected by the relay
pub const LINE_END: &str = "\r\n";

/// Harmless request used to keep an idle connection alive
pub const KEEPALIVE_LINE: &str = "getVersion";

/// Relay names for each button
pub const BUTTON_NAMES: [(Buttons, &str); 14] = [
    (Buttons::Y, "Y"),
    (Buttons::B, "B"),
    (Buttons::A, "A"),
    (Buttons::X, "X"),
    (Buttons::L, "L"),
    (Buttons::R, "R"),
    (Buttons::ZL, "ZL"),
    (Buttons::ZR, "ZR"),
    (Buttons::MINUS, "MINUS"),
    (Buttons::PLUS, "PLUS"),
    (Buttons::LCLICK, "LSTICK"),
    (Buttons::RCLICK, "RSTICK"),
    (Buttons::HOME, "HOME"),
    (Buttons::CAPTURE, "CAPTURE"),
];

/// Dpad switch names in `(up, right, down, left)` order
pub const DPAD_NAMES: [&str; 4] = ["DUP", "DRIGHT", "DDOWN", "DLEFT"];

/// A key the relay can press or release
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Key {
    Button(Buttons),
    /// Index into [`DPAD_NAMES`]
    Dpad(usize),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StickSide {
    Left,
    Right,
}

impl StickSide {
    fn name(self) -> &'static str {
        match self {
            Self::Left => "LEFT",
            Self::Right => "RIGHT",
        }
    }
}

/// One parsed line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineCommand {
    Press(Key),
    Release(Key),
    SetStick { side: StickSide, x: i16, y: i16 },
    GetVersion,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum LineError {
    #[error("empty line")]
    Empty,
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("unknown key `{0}`")]
    UnknownKey(String),
    #[error("bad argument `{0}`")]
    BadArgument(String),
}

/// Stick byte to relay axis value, centered at zero.
pub fn axis_to_i16(v: u8) -> i16 {
    let d = v as i32 - Stick::CENTER as i32;
    if d >= 0 {
        (d * i16::MAX as i32 / 127) as i16
    } else {
        (d * 256) as i16
    }
}

/// Relay axis value back to a stick byte.
pub fn i16_to_axis(v: i16) -> u8 {
    let d = if v >= 0 {
        (v as f32 * 127.0 / i16::MAX as f32).round()
    } else {
        (v as f32 / 256.0).round()
    };
    (Stick::CENTER as f32 + d).clamp(0.0, 255.0) as u8
}

/// Relay (x, y) for a stick, flipping y so that up is positive
pub fn stick_to_relay(stick: Stick) -> (i16, i16) {
    (axis_to_i16(stick.x), axis_to_i16(stick.y).saturating_neg())
}

pub fn stick_from_relay(x: i16, y: i16) -> Stick {
    Stick::new(i16_to_axis(x), i16_to_axis(y.saturating_neg()))
}

fn hex(v: i16) -> String {
    if v < 0 {
        format!("-{:#06X}", v.unsigned_abs()).replace("-0X", "-0x")
    } else {
        format!("{v:#06X}").replace("0X", "0x")
    }
}

fn push_line(out: &mut String, args: fmt::Arguments) {
    // Writing to a String cannot fail
    let _ = out.write_fmt(args);
    out.push_str(LINE_END);
}

fn push_stick(out: &mut String, side: StickSide, stick: Stick) {
    let (x, y) = stick_to_relay(stick);
    push_line(
        out,
        format_args!("setStick {} {} {}", side.name(), hex(x), hex(y)),
    );
}

/// Append the commands that move the relay through `diff`.
///
/// Releases are emitted before presses so that a changed chord never
/// passes through the union of both chords. Returns the number of lines.
pub fn encode_diff(diff: &StateDiff, out: &mut String) -> usize {
    let start = out.matches(LINE_END).count();

    for (b, name) in BUTTON_NAMES.iter() {
        if diff.released.contains(*b) {
            push_line(out, format_args!("release {name}"));
        }
    }
    if let Some((before, after)) = diff.dpad {
        let before = dirs(before);
        let after = dirs(after);
        for i in 0..4 {
            if before[i] && !after[i] {
                push_line(out, format_args!("release {}", DPAD_NAMES[i]));
            }
        }
        for i in 0..4 {
            if !before[i] && after[i] {
                push_line(out, format_args!("press {}", DPAD_NAMES[i]));
            }
        }
    }
    for (b, name) in BUTTON_NAMES.iter() {
        if diff.pressed.contains(*b) {
            push_line(out, format_args!("press {name}"));
        }
    }
    if let Some(left) = diff.left {
        push_stick(out, StickSide::Left, left);
    }
    if let Some(right) = diff.right {
        push_stick(out, StickSide::Right, right);
    }

    out.matches(LINE_END).count() - start
}

fn dirs(dpad: DpadPosition) -> [bool; 4] {
    let (u, r, d, l) = dpad.directions();
    [u, r, d, l]
}

fn parse_key(name: &str) -> Result<Key, LineError> {
    if let Some((b, _)) = BUTTON_NAMES.iter().find(|(_, n)| *n == name) {
        return Ok(Key::Button(*b));
    }
    DPAD_NAMES
        .iter()
        .position(|n| *n == name)
        .map(Key::Dpad)
        .ok_or_else(|| LineError::UnknownKey(name.to_owned()))
}

fn parse_axis(arg: &str) -> Result<i16, LineError> {
    let bad = || LineError::BadArgument(arg.to_owned());
    let (negative, digits) = match arg.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, arg),
    };
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .ok_or_else(bad)?;
    let magnitude = i32::from_str_radix(digits, 16).map_err(|_| bad())?;
    let value = if negative { -magnitude } else { magnitude };
    i16::try_from(value).map_err(|_| bad())
}

/// Parse one line, with or without its terminator.
pub fn parse_line(line: &str) -> Result<LineCommand, LineError> {
    let mut words = line.split_whitespace();
    let command = words.next().ok_or(LineError::Empty)?;
    let mut arg = || {
        words
            .next()
            .ok_or_else(|| LineError::BadArgument(line.trim().to_owned()))
    };

    match command {
        "press" => Ok(LineCommand::Press(parse_key(arg()?)?)),
        "release" => Ok(LineCommand::Release(parse_key(arg()?)?)),
        "setStick" => {
            let side = match arg()? {
                "LEFT" => StickSide::Left,
                "RIGHT" => StickSide::Right,
                other => return Err(LineError::BadArgument(other.to_owned())),
            };
            let x = parse_axis(arg()?)?;
            let y = parse_axis(arg()?)?;
            Ok(LineCommand::SetStick { side, x, y })
        }
        "getVersion" => Ok(LineCommand::GetVersion),
        other => Err(LineError::UnknownCommand(other.to_owned())),
    }
}

/// Apply a command to a relay-side copy of the controller state.
pub fn apply_line(state: &mut ControllerState, command: &LineCommand) {
    let set_key = |state: &mut ControllerState, key: Key, held: bool| match key {
        Key::Button(b) => {
            state.buttons = if held {
                state.buttons | b
            } else {
                state.buttons.difference(b)
            };
        }
        Key::Dpad(i) => {
            let mut d = dirs(state.dpad);
            d[i] = held;
            state.dpad = DpadPosition::from_directions(d[0], d[1], d[2], d[3]);
        }
    };

    match *command {
        LineCommand::Press(key) => set_key(state, key, true),
        LineCommand::Release(key) => set_key(state, key, false),
        LineCommand::SetStick { side, x, y } => {
            let stick = stick_from_relay(x, y);
            match side {
                StickSide::Left => state.left = stick,
                StickSide::Right => state.right = stick,
            }
        }
        LineCommand::GetVersion => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn replay(start: ControllerState, text: &str) -> ControllerState {
        let mut state = start;
        for line in text.split(LINE_END).filter(|l| !l.is_empty()) {
            apply_line(&mut state, &parse_line(line).unwrap());
        }
        state
    }

    #[test]
    fn test_diff_lines_reproduce_state() {
        let old = ControllerState::default()
            .with_buttons(Buttons::B)
            .with_dpad(DpadPosition::UpLeft);
        let new = ControllerState::default()
            .with_buttons(Buttons::A | Buttons::ZR)
            .with_dpad(DpadPosition::Up)
            .with_left(0, 255)
            .with_right(128, 0);

        let mut out = String::new();
        let n = encode_diff(&old.diff(&new), &mut out);
        assert_eq!(n, 6);
        assert!(out.starts_with("release B\r\n"));
        assert!(out.contains("release DLEFT\r\n"));
        assert!(!out.contains("DUP"));
        assert!(out.contains("setStick LEFT -0x8000 -0x7FFF\r\n"));
        assert!(out.contains("setStick RIGHT 0x0000 0x7FFF\r\n"));

        assert_eq!(replay(old, &out), new);
    }

    #[test]
    fn test_unchanged_state_sends_nothing() {
        let s = ControllerState::default().with_buttons(Buttons::X);
        let mut out = String::new();
        assert_eq!(encode_diff(&s.diff(&s), &mut out), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_axis_mapping_endpoints() {
        assert_eq!(axis_to_i16(128), 0);
        assert_eq!(axis_to_i16(255), i16::MAX);
        assert_eq!(axis_to_i16(0), i16::MIN);
        for v in 0..=255_u8 {
            assert_eq!(i16_to_axis(axis_to_i16(v)), v);
        }
        let s = Stick::new(3, 250);
        let (x, y) = stick_to_relay(s);
        assert_eq!(stick_from_relay(x, y), s);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_line("   "), Err(LineError::Empty));
        assert!(matches!(parse_line("jump A"), Err(LineError::UnknownCommand(_))));
        assert!(matches!(parse_line("press Q"), Err(LineError::UnknownKey(_))));
        assert!(matches!(
            parse_line("setStick LEFT 12 0x0"),
            Err(LineError::BadArgument(_))
        ));
        assert!(matches!(
            parse_line("setStick LEFT 0x8000 0x0"),
            Err(LineError::BadArgument(_))
        ));
        assert_eq!(parse_line("getVersion\r\n"), Ok(LineCommand::GetVersion));

        let err: Box<dyn std::error::Error> = Box::new(parse_line("press Q").unwrap_err());
        assert_eq!(err.to_string(), "unknown key `Q`");
    }
}
