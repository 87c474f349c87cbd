//! Superscalar timeline that merges overlapping per-channel commands into
//! a strictly ordered sequence of frames.
//!
//! Each command is issued at the current issue time and sets one input
//! channel for `hold` ticks, then holds that channel released for
//! `cooldown` ticks. Issuing advances the issue time by `delay`, which may
//! be shorter than `hold + cooldown`, so commands on independent channels
//! overlap. Everything before the issue time can no longer change and is
//! flushed as frames.
//!
//! Channels are: each button, the dpad, each joystick, and each gyro axis.
//! Overlapping commands on different channels are superimposed into the
//! same frame. On the same channel the later command wins for the window
//! where the two overlap.

use joyframe_shared::{Buttons, ControllerState, DpadPosition, GyroAxis, Stick};

use crate::queue::TimedFrame;

const DPAD_CHANNEL: usize = Buttons::COUNT;
const LEFT_CHANNEL: usize = DPAD_CHANNEL + 1;
const RIGHT_CHANNEL: usize = DPAD_CHANNEL + 2;
const GYRO_CHANNEL: usize = DPAD_CHANNEL + 3;

/// Number of independent input channels
pub const CHANNEL_COUNT: usize = GYRO_CHANNEL + GyroAxis::ALL.len();

/// A value for one or more channels
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelValue {
    /// Presses every button in the mask, one channel per button
    Buttons(Buttons),
    Dpad(DpadPosition),
    LeftJoystick(Stick),
    RightJoystick(Stick),
    Gyro(GyroAxis, i16),
}

impl ChannelValue {
    fn channels(&self) -> impl Iterator<Item = usize> {
        let (mask, single) = match *self {
            Self::Buttons(b) => (b, None),
            Self::Dpad(_) => (Buttons::NONE, Some(DPAD_CHANNEL)),
            Self::LeftJoystick(_) => (Buttons::NONE, Some(LEFT_CHANNEL)),
            Self::RightJoystick(_) => (Buttons::NONE, Some(RIGHT_CHANNEL)),
            Self::Gyro(axis, _) => (Buttons::NONE, Some(GYRO_CHANNEL + axis.index())),
        };
        mask.iter()
            .map(|b| b.bits().trailing_zeros() as usize)
            .chain(single)
    }

    /// Write this value, or this channel's released value, into `state`
    fn apply(&self, state: &mut ControllerState, active: bool) {
        match *self {
            Self::Buttons(b) if active => state.buttons |= b,
            Self::Buttons(b) => state.buttons = state.buttons.difference(b),
            Self::Dpad(d) => state.dpad = if active { d } else { DpadPosition::Neutral },
            Self::LeftJoystick(s) => state.left = if active { s } else { Stick::NEUTRAL },
            Self::RightJoystick(s) => state.right = if active { s } else { Stick::NEUTRAL },
            Self::Gyro(axis, v) => state.gyro.set(axis, if active { v } else { 0 }),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Segment {
    start: u64,
    end: u64,
    value: ChannelValue,
    /// False for the cooldown after a hold
    active: bool,
}

/// Pending superscalar commands, in ticks relative to the last flush
#[derive(Clone, Debug)]
pub struct Timeline {
    now: u64,
    segments: Vec<Segment>,
    busy_until: [u64; CHANNEL_COUNT],
}

impl Default for Timeline {
    fn default() -> Self {
        Self {
            now: 0,
            segments: Vec::new(),
            busy_until: [0; CHANNEL_COUNT],
        }
    }
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if nothing is waiting to be flushed
    pub fn is_idle(&self) -> bool {
        self.segments.is_empty() && self.now == 0
    }

    /// Ticks until every channel is free, from the current issue time
    pub fn pending(&self) -> u64 {
        self.busy_until
            .iter()
            .copied()
            .max()
            .unwrap_or(0)
            .saturating_sub(self.now)
    }

    /// Drop everything not yet flushed.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Schedule a command at the current issue time, then advance the issue
    /// time by `delay`. Returns the frames that became final.
    pub fn issue(
        &mut self,
        value: ChannelValue,
        delay: u32,
        hold: u32,
        cooldown: u32,
    ) -> Vec<TimedFrame> {
        let start = self.now;
        let release = start + hold as u64;
        let end = release + cooldown as u64;
        if hold > 0 {
            self.segments.push(Segment {
                start,
                end: release,
                value,
                active: true,
            });
        }
        if cooldown > 0 {
            self.segments.push(Segment {
                start: release,
                end,
                value,
                active: false,
            });
        }
        for ch in value.channels() {
            self.busy_until[ch] = self.busy_until[ch].max(end);
        }

        self.now += delay as u64;
        self.flush()
    }

    /// Wait for every channel to finish, then flush everything.
    pub fn barrier(&mut self) -> Vec<TimedFrame> {
        self.now = self.now.max(self.busy_until.iter().copied().max().unwrap_or(0));
        self.flush()
    }

    /// Advance the issue time without issuing anything.
    pub fn nop(&mut self, duration: u32) -> Vec<TimedFrame> {
        self.now += duration as u64;
        self.flush()
    }

    /// Emit frames for everything before the issue time and rebase on it.
    fn flush(&mut self) -> Vec<TimedFrame> {
        let until = self.now;
        if until == 0 {
            return Vec::new();
        }

        let mut cuts = vec![0, until];
        for s in &self.segments {
            cuts.extend([s.start, s.end].into_iter().filter(|&t| t > 0 && t < until));
        }
        cuts.sort_unstable();
        cuts.dedup();

        let mut runs: Vec<(ControllerState, u64)> = Vec::new();
        for w in cuts.windows(2) {
            let (a, b) = (w[0], w[1]);
            let mut state = ControllerState::NEUTRAL;
            // Issue order, so later commands overwrite earlier ones
            for s in self.segments.iter().filter(|s| s.start < b && s.end > a) {
                s.value.apply(&mut state, s.active);
            }
            match runs.last_mut() {
                Some((last, ticks)) if *last == state => *ticks += b - a,
                _ => runs.push((state, b - a)),
            }
        }

        self.segments.retain_mut(|s| {
            if s.end <= until {
                return false;
            }
            s.start = s.start.saturating_sub(until);
            s.end -= until;
            true
        });
        for t in self.busy_until.iter_mut() {
            *t = t.saturating_sub(until);
        }
        self.now = 0;

        let mut frames = Vec::with_capacity(runs.len());
        for (state, mut ticks) in runs {
            while ticks > 0 {
                let chunk = ticks.min(u32::MAX as u64);
                frames.push(TimedFrame::new(state, chunk as u32));
                ticks -= chunk;
            }
        }
        frames
    }
}
