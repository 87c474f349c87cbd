use super::{Buttons, ControllerState, DpadPosition, Gyro, Stick};

/// Fields that changed between two frames.
///
/// Unchanged fields are `None` (or empty masks), so a diff between
/// identical frames is empty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StateDiff {
    /// Buttons held in the new frame but not the old
    pub pressed: Buttons,
    /// Buttons held in the old frame but not the new
    pub released: Buttons,
    /// `(before, after)` when the hat moved
    pub dpad: Option<(DpadPosition, DpadPosition)>,
    pub left: Option<Stick>,
    pub right: Option<Stick>,
    pub gyro: Option<Gyro>,
}

impl StateDiff {
    pub fn between(old: &ControllerState, new: &ControllerState) -> Self {
        let changed = |a, b| if a != b { Some(b) } else { None };
        Self {
            pressed: new.buttons.difference(old.buttons),
            released: old.buttons.difference(new.buttons),
            dpad: if old.dpad != new.dpad {
                Some((old.dpad, new.dpad))
            } else {
                None
            },
            left: changed(old.left, new.left),
            right: changed(old.right, new.right),
            gyro: if old.gyro != new.gyro {
                Some(new.gyro)
            } else {
                None
            },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pressed.is_empty()
            && self.released.is_empty()
            && self.dpad.is_none()
            && self.left.is_none()
            && self.right.is_none()
            && self.gyro.is_none()
    }

    /// Apply this diff on top of `state` in place.
    pub fn apply(&self, state: &mut ControllerState) {
        state.buttons = state.buttons.difference(self.released) | self.pressed;
        if let Some((_, after)) = self.dpad {
            state.dpad = after;
        }
        if let Some(left) = self.left {
            state.left = left;
        }
        if let Some(right) = self.right {
            state.right = right;
        }
        if let Some(gyro) = self.gyro {
            state.gyro = gyro;
        }
    }
}
