//! Button bitmask and dpad hat position.

use bitflags::bitflags;

bitflags! {
    /// Set of held face, shoulder, stick-click and system buttons.
    ///
    /// The dpad is not part of this mask; see [`DpadPosition`]. Bit order is
    /// also the order in which [`Buttons::iter`] yields single buttons.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct Buttons: u16 {
        const Y = 1 << 0;
        const B = 1 << 1;
        const A = 1 << 2;
        const X = 1 << 3;
        const L = 1 << 4;
        const R = 1 << 5;
        const ZL = 1 << 6;
        const ZR = 1 << 7;
        const MINUS = 1 << 8;
        const PLUS = 1 << 9;
        const LCLICK = 1 << 10;
        const RCLICK = 1 << 11;
        const HOME = 1 << 12;
        const CAPTURE = 1 << 13;
    }
}

impl Buttons {
    pub const NONE: Self = Self::empty();

    /// Number of defined buttons
    pub const COUNT: usize = Self::all().bits().count_ones() as usize;
}

impl Default for Buttons {
    fn default() -> Self {
        Self::NONE
    }
}

/// 9-way dpad hat position.
///
/// Discriminants follow the HID hat-switch convention, clockwise from up,
/// with 8 meaning released.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DpadPosition {
    Up = 0,
    UpRight = 1,
    Right = 2,
    DownRight = 3,
    Down = 4,
    DownLeft = 5,
    Left = 6,
    UpLeft = 7,
    #[default]
    Neutral = 8,
}

impl DpadPosition {
    /// Hat value; out-of-range values decode as released.
    pub const fn from_hat(value: u8) -> Self {
        match value {
            0 => Self::Up,
            1 => Self::UpRight,
            2 => Self::Right,
            3 => Self::DownRight,
            4 => Self::Down,
            5 => Self::DownLeft,
            6 => Self::Left,
            7 => Self::UpLeft,
            _ => Self::Neutral,
        }
    }

    pub const fn hat(self) -> u8 {
        self as u8
    }

    pub const fn is_neutral(self) -> bool {
        matches!(self, Self::Neutral)
    }

    /// Combine four direction switches into a hat position.
    ///
    /// Opposing directions cancel each other out.
    pub const fn from_directions(up: bool, right: bool, down: bool, left: bool) -> Self {
        let vertical = up as i8 - down as i8;
        let horizontal = right as i8 - left as i8;
        match (vertical, horizontal) {
            (1, 0) => Self::Up,
            (1, 1) => Self::UpRight,
            (0, 1) => Self::Right,
            (-1, 1) => Self::DownRight,
            (-1, 0) => Self::Down,
            (-1, -1) => Self::DownLeft,
            (0, -1) => Self::Left,
            (1, -1) => Self::UpLeft,
            _ => Self::Neutral,
        }
    }

    /// Direction switches `(up, right, down, left)` held by this position
    pub const fn directions(self) -> (bool, bool, bool, bool) {
        match self {
            Self::Up => (true, false, false, false),
            Self::UpRight => (true, true, false, false),
            Self::Right => (false, true, false, false),
            Self::DownRight => (false, true, true, false),
            Self::Down => (false, false, true, false),
            Self::DownLeft => (false, false, true, true),
            Self::Left => (false, false, false, true),
            Self::UpLeft => (true, false, false, true),
            Self::Neutral => (false, false, false, false),
        }
    }
}
