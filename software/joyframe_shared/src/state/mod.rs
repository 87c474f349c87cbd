//! One frame of controller input.
//!
//! A default-constructed [`ControllerState`] is the neutral state:
//! nothing held, both sticks centered, gyro at rest.

mod buttons;
mod diff;

pub use buttons::{Buttons, DpadPosition};
pub use diff::StateDiff;

/// Joystick deflection as a full-range byte pair, 128 being centered.
/// `y == 0` is fully up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Stick {
    pub x: u8,
    pub y: u8,
}

impl Stick {
    pub const CENTER: u8 = 128;
    pub const NEUTRAL: Self = Self::new(Self::CENTER, Self::CENTER);

    pub const fn new(x: u8, y: u8) -> Self {
        Self { x, y }
    }

    pub const fn is_neutral(&self) -> bool {
        self.x == Self::CENTER && self.y == Self::CENTER
    }
}

impl Default for Stick {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

/// Gyro axis addressed by a single-axis command
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GyroAxis {
    AccelX,
    AccelY,
    AccelZ,
    RotateX,
    RotateY,
    RotateZ,
}

impl GyroAxis {
    pub const ALL: [Self; 6] = [
        Self::AccelX,
        Self::AccelY,
        Self::AccelZ,
        Self::RotateX,
        Self::RotateY,
        Self::RotateZ,
    ];

    /// Position in the flattened `[accel xyz, rotate xyz]` layout
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Raw accelerometer and gyroscope readings
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Gyro {
    pub accel: [i16; 3],
    pub rotate: [i16; 3],
}

impl Gyro {
    pub const fn is_neutral(&self) -> bool {
        let mut i = 0;
        while i < 3 {
            if self.accel[i] != 0 || self.rotate[i] != 0 {
                return false;
            }
            i += 1;
        }
        true
    }

    pub const fn get(&self, axis: GyroAxis) -> i16 {
        let i = axis.index();
        if i < 3 {
            self.accel[i]
        } else {
            self.rotate[i - 3]
        }
    }

    pub fn set(&mut self, axis: GyroAxis, value: i16) {
        let i = axis.index();
        if i < 3 {
            self.accel[i] = value;
        } else {
            self.rotate[i - 3] = value;
        }
    }

    /// Flattened `[accel xyz, rotate xyz]`
    pub const fn to_array(&self) -> [i16; 6] {
        [
            self.accel[0],
            self.accel[1],
            self.accel[2],
            self.rotate[0],
            self.rotate[1],
            self.rotate[2],
        ]
    }

    pub const fn from_array(v: [i16; 6]) -> Self {
        Self {
            accel: [v[0], v[1], v[2]],
            rotate: [v[3], v[4], v[5]],
        }
    }
}

/// Complete controller input for one frame
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ControllerState {
    pub buttons: Buttons,
    pub dpad: DpadPosition,
    pub left: Stick,
    pub right: Stick,
    pub gyro: Gyro,
}

impl ControllerState {
    /// The released state, identical to `ControllerState::default()`
    pub const NEUTRAL: Self = Self {
        buttons: Buttons::NONE,
        dpad: DpadPosition::Neutral,
        left: Stick::NEUTRAL,
        right: Stick::NEUTRAL,
        gyro: Gyro {
            accel: [0; 3],
            rotate: [0; 3],
        },
    };

    pub fn is_neutral(&self) -> bool {
        *self == Self::NEUTRAL
    }

    pub fn with_buttons(mut self, buttons: Buttons) -> Self {
        self.buttons = buttons;
        self
    }

    pub fn with_dpad(mut self, dpad: DpadPosition) -> Self {
        self.dpad = dpad;
        self
    }

    pub fn with_left(mut self, x: u8, y: u8) -> Self {
        self.left = Stick::new(x, y);
        self
    }

    pub fn with_right(mut self, x: u8, y: u8) -> Self {
        self.right = Stick::new(x, y);
        self
    }

    pub fn with_gyro(mut self, axis: GyroAxis, value: i16) -> Self {
        self.gyro.set(axis, value);
        self
    }

    /// Fields that differ when moving from `self` to `next`
    pub fn diff(&self, next: &Self) -> StateDiff {
        StateDiff::between(self, next)
    }

    /// True if a receiver could tell the two frames apart
    pub fn is_distinguishable(&self, other: &Self) -> bool {
        self != other
    }
}
