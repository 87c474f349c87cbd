//! Command-issuing interface used by automation scripts.
//!
//! Two styles of command share one queue:
//!
//! * Sequential ("pbf") commands wait for every earlier command and then
//!   queue neutral for `delay`, the input for `hold`, and neutral for
//!   `cooldown` (omitted when zero).
//! * Superscalar ("ssf") commands go through a [`Timeline`] that lets
//!   independent channels overlap and merges them into frames.
//!
//! Issuing only blocks on queue backpressure, never for the real-world
//! duration of a command, so scripts can run ahead of the hardware.
//! Each scheduler expects a single script thread issuing commands.

pub mod rpc;
pub mod ssf;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use joyframe_shared::{Buttons, ControllerState, DpadPosition, GyroAxis, Stick};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::cancel::Cancellable;
use crate::clock::TickClock;
use crate::connection::Connection;
use crate::dispatch::DispatchHandle;
use crate::error::SchedulerError;
use crate::queue::{
    CommandQueue, DEFAULT_QUEUE_CAPACITY, DispatchPhase, NextStateChange, TimedFrame,
};

pub use rpc::ScrollDirection;
pub use ssf::{ChannelValue, Timeline};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Used in thread names and logs
    pub name: String,
    pub queue_capacity: usize,
    /// Half-period of button mashing. Rounded up to whole ticks, and never
    /// shorter than the connection's cooldown.
    pub mash_period_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "controller".into(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            mash_period_ms: 40,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Joystick {
    Left,
    Right,
}

/// Frames for one sequential command
pub fn pbf_frames(
    clock: &TickClock,
    delay: Duration,
    hold: Duration,
    cooldown: Duration,
    state: ControllerState,
) -> Vec<TimedFrame> {
    let mut frames = vec![
        TimedFrame::neutral(clock.ticks(delay)),
        TimedFrame::new(state, clock.ticks(hold)),
    ];
    if !cooldown.is_zero() {
        frames.push(TimedFrame::neutral(clock.ticks(cooldown)));
    }
    frames
}

/// Scheduler bound to one connection and its dispatch thread
pub struct Scheduler {
    name: String,
    clock: TickClock,
    cooldown: Duration,
    mash_period: Duration,
    queue: Arc<CommandQueue>,
    timeline: Mutex<Timeline>,
    /// Held while computing and queueing one command so frames of
    /// concurrent callers never interleave
    issuing: Mutex<()>,
    dispatch: Mutex<Option<DispatchHandle>>,
}

impl Scheduler {
    /// Open the connection if needed and start its dispatch thread.
    pub fn new(
        mut connection: Box<dyn Connection>,
        config: SchedulerConfig,
    ) -> Result<Self, SchedulerError> {
        if !connection.is_open() {
            connection.open()?;
        }
        let clock = TickClock::new(connection.ticksize());
        let cooldown = connection.cooldown();
        let queue = Arc::new(CommandQueue::new(config.queue_capacity, clock));
        let dispatch = DispatchHandle::spawn(&config.name, queue.clone(), connection)?;
        info!(
            "Scheduler `{}` started with {:?} ticks",
            config.name,
            clock.ticksize()
        );

        Ok(Self {
            name: config.name,
            clock,
            cooldown,
            mash_period: Duration::from_millis(config.mash_period_ms),
            queue,
            timeline: Mutex::new(Timeline::new()),
            issuing: Mutex::new(()),
            dispatch: Mutex::new(Some(dispatch)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> TickClock {
        self.clock
    }

    /// Recommended spacing between state changes on this connection
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// False once the link has failed or the dispatch thread has stopped
    pub fn is_ready(&self) -> bool {
        !self.queue.is_failed() && self.queue.phase() != DispatchPhase::Terminated
    }

    /// The transport error that took the link down, if any
    pub fn error_string(&self) -> Option<String> {
        self.queue.error_string()
    }

    pub fn dispatch_phase(&self) -> DispatchPhase {
        self.queue.phase()
    }

    pub fn next_state_change(&self) -> NextStateChange {
        self.queue.next_state_change()
    }

    /// Last state the dispatch thread put on the wire
    pub fn last_sent_state(&self) -> ControllerState {
        self.queue.last_sent()
    }

    /// Frames queued but not yet handed to the dispatch thread
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn lock_timeline(&self) -> MutexGuard<'_, Timeline> {
        self.timeline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_issuing(&self) -> MutexGuard<'_, ()> {
        self.issuing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_all(
        &self,
        frames: impl IntoIterator<Item = TimedFrame>,
        cancel: &Cancellable,
    ) -> Result<(), SchedulerError> {
        for frame in frames {
            self.queue.push(frame, cancel)?;
        }
        Ok(())
    }

    /// Queue frames after everything already issued has been flushed.
    pub(crate) fn issue_sequential(
        &self,
        cancel: &Cancellable,
        frames: Vec<TimedFrame>,
    ) -> Result<(), SchedulerError> {
        cancel.check()?;
        let _issuing = self.lock_issuing();
        let pending = self.lock_timeline().barrier();
        self.push_all(pending, cancel)?;
        self.push_all(frames, cancel)
    }

    fn issue_pbf(
        &self,
        cancel: &Cancellable,
        delay: Duration,
        hold: Duration,
        cooldown: Duration,
        state: ControllerState,
    ) -> Result<(), SchedulerError> {
        let frames = pbf_frames(&self.clock, delay, hold, cooldown, state);
        self.issue_sequential(cancel, frames)
    }

    fn issue_ssf(
        &self,
        cancel: &Cancellable,
        value: ChannelValue,
        delay: Duration,
        hold: Duration,
        cooldown: Duration,
    ) -> Result<(), SchedulerError> {
        cancel.check()?;
        let _issuing = self.lock_issuing();
        let frames = self.lock_timeline().issue(
            value,
            self.clock.ticks(delay),
            self.clock.ticks(hold),
            self.clock.ticks(cooldown),
        );
        self.push_all(frames, cancel)
    }

    //  Sequential commands

    pub fn issue_buttons(
        &self,
        cancel: &Cancellable,
        delay: Duration,
        hold: Duration,
        cooldown: Duration,
        buttons: Buttons,
    ) -> Result<(), SchedulerError> {
        let state = ControllerState::default().with_buttons(buttons);
        self.issue_pbf(cancel, delay, hold, cooldown, state)
    }

    pub fn issue_dpad(
        &self,
        cancel: &Cancellable,
        delay: Duration,
        hold: Duration,
        cooldown: Duration,
        position: DpadPosition,
    ) -> Result<(), SchedulerError> {
        let state = ControllerState::default().with_dpad(position);
        self.issue_pbf(cancel, delay, hold, cooldown, state)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn issue_joystick(
        &self,
        cancel: &Cancellable,
        stick: Joystick,
        delay: Duration,
        hold: Duration,
        cooldown: Duration,
        x: u8,
        y: u8,
    ) -> Result<(), SchedulerError> {
        let state = match stick {
            Joystick::Left => ControllerState::default().with_left(x, y),
            Joystick::Right => ControllerState::default().with_right(x, y),
        };
        self.issue_pbf(cancel, delay, hold, cooldown, state)
    }

    /// Hold a complete state, gyro included, for `hold`.
    pub fn issue_full_controller_state(
        &self,
        cancel: &Cancellable,
        hold: Duration,
        state: ControllerState,
    ) -> Result<(), SchedulerError> {
        let frame = TimedFrame::new(state, self.clock.ticks(hold));
        self.issue_sequential(cancel, vec![frame])
    }

    //  Superscalar commands

    /// Make every channel finish before anything issued later starts.
    pub fn issue_barrier(&self, cancel: &Cancellable) -> Result<(), SchedulerError> {
        cancel.check()?;
        let _issuing = self.lock_issuing();
        let frames = self.lock_timeline().barrier();
        self.push_all(frames, cancel)
    }

    /// Advance the issue time without touching any channel.
    pub fn issue_nop(&self, cancel: &Cancellable, duration: Duration) -> Result<(), SchedulerError> {
        cancel.check()?;
        let _issuing = self.lock_issuing();
        let frames = self.lock_timeline().nop(self.clock.ticks(duration));
        self.push_all(frames, cancel)
    }

    pub fn issue_ssf_buttons(
        &self,
        cancel: &Cancellable,
        delay: Duration,
        hold: Duration,
        cooldown: Duration,
        buttons: Buttons,
    ) -> Result<(), SchedulerError> {
        self.issue_ssf(cancel, ChannelValue::Buttons(buttons), delay, hold, cooldown)
    }

    pub fn issue_ssf_dpad(
        &self,
        cancel: &Cancellable,
        delay: Duration,
        hold: Duration,
        cooldown: Duration,
        position: DpadPosition,
    ) -> Result<(), SchedulerError> {
        self.issue_ssf(cancel, ChannelValue::Dpad(position), delay, hold, cooldown)
    }

    pub fn issue_left_joystick(
        &self,
        cancel: &Cancellable,
        delay: Duration,
        hold: Duration,
        cooldown: Duration,
        x: u8,
        y: u8,
    ) -> Result<(), SchedulerError> {
        let value = ChannelValue::LeftJoystick(Stick::new(x, y));
        self.issue_ssf(cancel, value, delay, hold, cooldown)
    }

    pub fn issue_right_joystick(
        &self,
        cancel: &Cancellable,
        delay: Duration,
        hold: Duration,
        cooldown: Duration,
        x: u8,
        y: u8,
    ) -> Result<(), SchedulerError> {
        let value = ChannelValue::RightJoystick(Stick::new(x, y));
        self.issue_ssf(cancel, value, delay, hold, cooldown)
    }

    pub fn issue_gyro(
        &self,
        cancel: &Cancellable,
        axis: GyroAxis,
        delay: Duration,
        hold: Duration,
        cooldown: Duration,
        value: i16,
    ) -> Result<(), SchedulerError> {
        self.issue_ssf(cancel, ChannelValue::Gyro(axis, value), delay, hold, cooldown)
    }

    //  Flow control

    /// Block until everything issued so far has run on the hardware.
    pub fn wait_for_all(&self, cancel: &Cancellable) -> Result<(), SchedulerError> {
        self.issue_barrier(cancel)?;
        self.queue.wait_until_idle(cancel)
    }

    /// Drop everything queued and put the relay back to neutral right away.
    pub fn cancel_all_commands(&self) {
        self.lock_timeline().reset();
        self.queue.cancel_all();
        debug!("Scheduler `{}` cancelled all commands", self.name);
    }

    /// Make the next issued command replace whatever is queued or running.
    pub fn replace_on_next_command(&self) {
        self.lock_timeline().reset();
        self.queue.set_replace_on_next();
    }

    /// Stop the dispatch thread and hand back the connection.
    pub fn stop(&self) -> Result<Option<Box<dyn Connection>>, SchedulerError> {
        let handle = self
            .dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle.stop().map(Some),
            None => Ok(None),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Failed to stop scheduler `{}`: {e}", self.name);
        }
    }
}

#[cfg(test)]
mod test {
    use std::thread;
    use std::time::Instant;

    use crossbeam::channel::Receiver;

    use super::*;
    use crate::connection::{Recorded, RecordingConnection, RecordingControl};
    use crate::error::{CancelReason, Cancelled};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn scheduler(tick_ms: u64, diff_only: bool) -> (Scheduler, Receiver<Recorded>, RecordingControl) {
        let (conn, rx, control) = RecordingConnection::new(ms(tick_ms), diff_only);
        let config = SchedulerConfig {
            name: "test".into(),
            ..Default::default()
        };
        (Scheduler::new(Box::new(conn), config).unwrap(), rx, control)
    }

    #[test]
    fn test_pbf_triple_is_exact() {
        let clock = TickClock::from_millis(8);
        let a = ControllerState::default().with_buttons(Buttons::A);
        let frames = pbf_frames(&clock, ms(16), ms(50), ms(24), a);
        assert_eq!(
            frames,
            vec![
                TimedFrame::neutral(2),
                TimedFrame::new(a, 7),
                TimedFrame::neutral(3)
            ]
        );

        let frames = pbf_frames(&clock, ms(0), ms(8), ms(0), a);
        assert_eq!(frames, vec![TimedFrame::neutral(0), TimedFrame::new(a, 1)]);
    }

    #[test]
    fn test_pbf_reaches_the_wire_in_order() {
        let (s, rx, _control) = scheduler(8, false);
        let cancel = Cancellable::new();
        s.issue_buttons(&cancel, ms(16), ms(24), ms(8), Buttons::B)
            .unwrap();
        s.issue_dpad(&cancel, ms(0), ms(8), ms(0), DpadPosition::Up)
            .unwrap();
        s.wait_for_all(&cancel).unwrap();

        let sent: Vec<_> = rx.try_iter().map(|r| (r.state, r.ticks)).collect();
        let b = ControllerState::default().with_buttons(Buttons::B);
        let up = ControllerState::default().with_dpad(DpadPosition::Up);
        assert_eq!(
            sent,
            vec![
                (ControllerState::NEUTRAL, 2),
                (b, 3),
                (ControllerState::NEUTRAL, 1),
                (up, 1),
                (ControllerState::NEUTRAL, 0),
            ]
        );
        assert_eq!(s.dispatch_phase(), DispatchPhase::Idle);
        assert!(s.last_sent_state().is_neutral());
    }

    #[test]
    fn test_ssf_joysticks_merge_into_one_frame() {
        let (s, rx, _control) = scheduler(8, false);
        let cancel = Cancellable::new();
        s.issue_left_joystick(&cancel, ms(0), ms(80), ms(0), 0, 128)
            .unwrap();
        s.issue_right_joystick(&cancel, ms(80), ms(80), ms(0), 128, 255)
            .unwrap();
        s.wait_for_all(&cancel).unwrap();

        let sent: Vec<Recorded> = rx.try_iter().collect();
        let both = ControllerState::default()
            .with_left(0, 128)
            .with_right(128, 255);
        assert_eq!(sent[0].state, both);
        assert_eq!(sent[0].ticks, 10);
        assert!(sent[1..].iter().all(|r| r.state.is_neutral()));
    }

    #[test]
    fn test_cancelled_scope_rejects_commands() {
        let (s, rx, _control) = scheduler(8, false);
        let cancel = Cancellable::new();
        cancel.cancel();
        let err = s
            .issue_buttons(&cancel, ms(0), ms(8), ms(0), Buttons::A)
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(matches!(
            s.issue_gyro(&cancel, GyroAxis::AccelX, ms(0), ms(8), ms(0), 1),
            Err(SchedulerError::Cancelled(Cancelled(CancelReason::Requested)))
        ));
        assert_eq!(s.queued(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_cancel_all_returns_to_neutral() {
        let (s, rx, _control) = scheduler(8, false);
        let s = Arc::new(s);
        let cancel = Cancellable::new();

        let producer = {
            let s = s.clone();
            let cancel = cancel.clone();
            thread::spawn(move || {
                let mut result = Ok(());
                for _ in 0..20 {
                    result = s.issue_buttons(&cancel, ms(0), ms(1000), ms(0), Buttons::ZR);
                    if result.is_err() {
                        break;
                    }
                }
                result
            })
        };

        let first = rx.recv_timeout(ms(1000)).unwrap();
        assert!(first.state.is_neutral() || first.state.buttons == Buttons::ZR);
        cancel.cancel();
        s.cancel_all_commands();
        assert!(producer.join().unwrap().unwrap_err().is_cancelled());

        s.wait_for_all(&Cancellable::new()).unwrap();
        let after: Vec<_> = rx.try_iter().collect();
        // At most the in-flight frame, then neutral
        assert!(after.len() <= 2, "{after:?}");
        assert!(after.last().is_none_or(|r| r.state.is_neutral()));
        assert!(s.last_sent_state().is_neutral());
        assert_eq!(s.dispatch_phase(), DispatchPhase::Idle);
    }

    #[test]
    fn test_replace_on_next_preempts_queue() {
        let (s, rx, _control) = scheduler(8, false);
        let cancel = Cancellable::new();
        let old = ControllerState::default().with_buttons(Buttons::L);
        for _ in 0..4 {
            s.issue_full_controller_state(&cancel, ms(800), old).unwrap();
        }
        assert_eq!(rx.recv_timeout(ms(1000)).unwrap().state, old);

        let start = Instant::now();
        s.replace_on_next_command();
        let new = ControllerState::default().with_buttons(Buttons::R);
        s.issue_full_controller_state(&cancel, ms(8), new).unwrap();
        s.wait_for_all(&cancel).unwrap();
        assert!(start.elapsed() < ms(800));

        let after: Vec<_> = rx.try_iter().map(|r| r.state).collect();
        assert_eq!(after, vec![new, ControllerState::NEUTRAL]);
    }

    #[test]
    fn test_link_failure_is_surfaced() {
        let (s, rx, control) = scheduler(1, true);
        let cancel = Cancellable::new();
        assert!(s.is_ready());

        control.fail_next_send();
        s.issue_buttons(&cancel, ms(0), ms(5), ms(5), Buttons::Y)
            .unwrap();
        let err = s.wait_for_all(&cancel).unwrap_err();
        assert!(matches!(err, SchedulerError::LinkFailed(_)));
        assert!(!s.is_ready());
        assert!(s.error_string().is_some());

        // Still accepted locally, never transmitted
        s.issue_buttons(&cancel, ms(0), ms(5), ms(5), Buttons::Y)
            .unwrap();
        thread::sleep(ms(30));
        assert!(rx.try_recv().is_err());

        let conn = s.stop().unwrap().unwrap();
        assert!(!conn.is_ready());
        assert!(s.stop().unwrap().is_none());
        assert_eq!(s.dispatch_phase(), DispatchPhase::Terminated);
    }

    #[test]
    fn test_issue_after_stop_fails_fast() {
        let (s, _rx, _control) = scheduler(8, false);
        let s = Arc::new(s);
        let cancel = Cancellable::new();
        // One held in flight, two more fill the queue
        for _ in 0..3 {
            s.issue_buttons(&cancel, ms(0), ms(1000), ms(0), Buttons::A)
                .unwrap();
        }

        // Blocked on a full queue when the scheduler stops
        let producer = {
            let s = s.clone();
            let cancel = cancel.clone();
            thread::spawn(move || s.issue_buttons(&cancel, ms(0), ms(1000), ms(0), Buttons::B))
        };
        thread::sleep(ms(30));
        s.stop().unwrap();
        assert!(matches!(producer.join().unwrap(), Err(SchedulerError::Stopped)));

        assert!(!s.is_ready());
        for _ in 0..3 {
            assert!(matches!(
                s.issue_buttons(&cancel, ms(0), ms(8), ms(0), Buttons::A),
                Err(SchedulerError::Stopped)
            ));
        }
        assert!(matches!(
            s.issue_ssf_buttons(&cancel, ms(8), ms(8), ms(0), Buttons::A),
            Err(SchedulerError::Stopped)
        ));
        assert!(matches!(s.wait_for_all(&cancel), Err(SchedulerError::Stopped)));
    }
}
