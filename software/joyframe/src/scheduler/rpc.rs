//! High-speed macro commands expanded into precomputed frame sequences.
//!
//! These bypass the superscalar channels: they wait for everything issued
//! earlier and then queue a dense press/release pattern at a fixed cadence.

use std::time::Duration;

use joyframe_shared::{Buttons, ControllerState, DpadPosition};
use serde::{Deserialize, Serialize};

use super::{Scheduler, pbf_frames};
use crate::cancel::Cancellable;
use crate::error::SchedulerError;
use crate::queue::TimedFrame;

/// Scroll direction for system menus. Menus ignore diagonals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScrollDirection {
    Up,
    Right,
    Down,
    Left,
}

impl From<ScrollDirection> for DpadPosition {
    fn from(value: ScrollDirection) -> Self {
        match value {
            ScrollDirection::Up => DpadPosition::Up,
            ScrollDirection::Right => DpadPosition::Right,
            ScrollDirection::Down => DpadPosition::Down,
            ScrollDirection::Left => DpadPosition::Left,
        }
    }
}

/// Alternate presses of `cycle` with releases, each lasting `half_period`
/// ticks, until `total` ticks are covered.
pub fn mash_frames(total: u32, half_period: u32, cycle: &[Buttons]) -> Vec<TimedFrame> {
    let half_period = half_period.max(1);
    let mut frames = Vec::new();
    if cycle.is_empty() {
        return frames;
    }

    let mut elapsed = 0;
    for buttons in cycle.iter().cycle() {
        if elapsed >= total {
            break;
        }
        let press = half_period.min(total - elapsed);
        frames.push(TimedFrame::new(
            ControllerState::default().with_buttons(*buttons),
            press,
        ));
        elapsed += press;

        if elapsed >= total {
            break;
        }
        let release = half_period.min(total - elapsed);
        frames.push(TimedFrame::neutral(release));
        elapsed += release;
    }
    frames
}

impl Scheduler {
    /// Ticks for one press or one release while mashing
    pub fn mash_half_period(&self) -> u32 {
        self.clock
            .ticks(self.mash_period.max(self.cooldown))
            .max(1)
    }

    fn issue_mash(
        &self,
        cancel: &Cancellable,
        duration: Duration,
        cycle: &[Buttons],
    ) -> Result<(), SchedulerError> {
        let frames = mash_frames(self.clock.ticks(duration), self.mash_half_period(), cycle);
        self.issue_sequential(cancel, frames)
    }

    /// Press and release `button` as fast as the connection allows for
    /// `duration`.
    pub fn issue_mash_button(
        &self,
        cancel: &Cancellable,
        duration: Duration,
        button: Buttons,
    ) -> Result<(), SchedulerError> {
        self.issue_mash(cancel, duration, &[button])
    }

    /// Mash two buttons, alternating between them.
    pub fn issue_mash_buttons(
        &self,
        cancel: &Cancellable,
        duration: Duration,
        button0: Buttons,
        button1: Buttons,
    ) -> Result<(), SchedulerError> {
        self.issue_mash(cancel, duration, &[button0, button1])
    }

    /// Mash A, ZL and ZR in turn. Advances dialogue whether or not the
    /// game maps confirm to A.
    pub fn issue_mash_azs(&self, cancel: &Cancellable, duration: Duration) -> Result<(), SchedulerError> {
        self.issue_mash(cancel, duration, &[Buttons::A, Buttons::ZL, Buttons::ZR])
    }

    /// Scroll a system menu one step. Hold and cooldown are stretched to at
    /// least one mash half-period so the menu registers every step.
    pub fn issue_system_scroll(
        &self,
        cancel: &Cancellable,
        delay: Duration,
        hold: Duration,
        cooldown: Duration,
        direction: ScrollDirection,
    ) -> Result<(), SchedulerError> {
        let minimum = self.clock.duration(self.mash_half_period());
        let state = ControllerState::default().with_dpad(direction.into());
        let frames = pbf_frames(
            &self.clock,
            delay,
            hold.max(minimum),
            cooldown.max(minimum),
            state,
        );
        self.issue_sequential(cancel, frames)
    }
}
