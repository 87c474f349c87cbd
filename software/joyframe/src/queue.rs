//! Bounded frame queue shared by command producers and the dispatch thread.
//!
//! All mutable state, including the next-state-change marker, lives behind
//! one mutex with one condvar. Producers wait on it for space, the dispatch
//! thread waits on it for frames and deadlines, and `wait_until_idle` waits
//! on it for the drain.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use joyframe_shared::ControllerState;
use tracing::debug;

use crate::cancel::{CancelListener, Cancellable};
use crate::clock::TickClock;
use crate::error::{CancelReason, QueueFull, SchedulerError};

/// Small on purpose so producers feel backpressure instead of building latency
pub const DEFAULT_QUEUE_CAPACITY: usize = 4;

/// One controller state held for a number of ticks
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimedFrame {
    pub state: ControllerState,
    pub ticks: u32,
}

impl TimedFrame {
    pub const fn new(state: ControllerState, ticks: u32) -> Self {
        Self { state, ticks }
    }

    pub const fn neutral(ticks: u32) -> Self {
        Self::new(ControllerState::NEUTRAL, ticks)
    }
}

/// When the dispatch thread next needs to act, and why
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextStateChange {
    /// Nothing queued and nothing in flight
    Empty,
    /// Queue contents changed out of band; re-evaluate now
    Changed,
    /// The in-flight frame ends at this instant
    At(Instant),
}

/// Observable state of a dispatch thread
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchPhase {
    #[default]
    Idle,
    Draining,
    Sending,
    Waiting,
    Stopping,
    Terminated,
}

/// What the dispatch thread should do next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchEvent {
    /// Transmit this frame and hold it
    Frame(TimedFrame),
    /// Every queued frame has run its course
    Drained,
    /// Nothing to do yet; the wait was cut short so the caller can check on
    /// its link
    Poll,
}

#[derive(Debug)]
struct QueueState {
    frames: VecDeque<TimedFrame>,
    next_state_change: NextStateChange,
    replace_on_next: bool,
    stopping: bool,
    busy: bool,
    phase: DispatchPhase,
    last_sent: ControllerState,
    link_error: Option<String>,
}

#[derive(Debug)]
pub struct CommandQueue {
    capacity: usize,
    clock: TickClock,
    state: Mutex<QueueState>,
    cvar: Condvar,
}

impl CommandQueue {
    pub fn new(capacity: usize, clock: TickClock) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            clock,
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                next_state_change: NextStateChange::Empty,
                replace_on_next: false,
                stopping: false,
                busy: false,
                phase: DispatchPhase::Idle,
                last_sent: ControllerState::NEUTRAL,
                link_error: None,
            }),
            cvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, QueueState>) -> MutexGuard<'a, QueueState> {
        self.cvar
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clock(&self) -> TickClock {
        self.clock
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    /// Copy of the frames not yet handed to the dispatch thread
    pub fn snapshot(&self) -> Vec<TimedFrame> {
        self.lock().frames.iter().copied().collect()
    }

    pub fn next_state_change(&self) -> NextStateChange {
        self.lock().next_state_change
    }

    pub fn phase(&self) -> DispatchPhase {
        self.lock().phase
    }

    /// The state most recently put on the wire
    pub fn last_sent(&self) -> ControllerState {
        self.lock().last_sent
    }

    /// Error string of the transport failure, if the link has failed
    pub fn error_string(&self) -> Option<String> {
        self.lock().link_error.clone()
    }

    pub fn is_failed(&self) -> bool {
        self.lock().link_error.is_some()
    }

    pub fn is_stopping(&self) -> bool {
        self.lock().stopping
    }

    pub fn replace_pending(&self) -> bool {
        self.lock().replace_on_next
    }

    fn push_locked(&self, state: &mut QueueState, frame: TimedFrame) {
        state.frames.push_back(frame);
        state.busy = true;
        if state.next_state_change == NextStateChange::Empty {
            state.next_state_change = NextStateChange::Changed;
        }
        self.cvar.notify_all();
    }

    fn replace_locked(&self, state: &mut QueueState, frame: TimedFrame) {
        let dropped = state.frames.len();
        state.frames.clear();
        state.frames.push_back(frame);
        state.busy = true;
        state.next_state_change = NextStateChange::Changed;
        self.cvar.notify_all();
        debug!("Replaced {dropped} queued frames");
    }

    /// Enqueue without blocking.
    ///
    /// Consumes a pending replace request like [`push`](Self::push) does.
    pub fn try_push(&self, frame: TimedFrame) -> Result<(), SchedulerError> {
        let mut state = self.lock();
        if state.stopping {
            return Err(SchedulerError::Stopped);
        }
        if state.replace_on_next {
            state.replace_on_next = false;
            self.replace_locked(&mut state, frame);
            return Ok(());
        }
        if state.frames.len() >= self.capacity {
            return Err(QueueFull.into());
        }
        self.push_locked(&mut state, frame);
        Ok(())
    }

    /// Enqueue, waiting for space while the queue is full.
    ///
    /// If a replace was requested, the queue is cleared and the frame takes
    /// effect immediately instead. Fails with [`SchedulerError::Stopped`]
    /// once the dispatch thread is stopping, including for producers already
    /// blocked on a full queue.
    pub fn push(
        self: &Arc<Self>,
        frame: TimedFrame,
        cancel: &Cancellable,
    ) -> Result<(), SchedulerError> {
        let _wake = cancel.attach(self);
        let mut state = self.lock();
        loop {
            cancel.check()?;
            if state.stopping {
                return Err(SchedulerError::Stopped);
            }
            if state.replace_on_next {
                state.replace_on_next = false;
                self.replace_locked(&mut state, frame);
                return Ok(());
            }
            if state.frames.len() < self.capacity {
                self.push_locked(&mut state, frame);
                return Ok(());
            }
            state = self.wait(state);
        }
    }

    /// Discard everything queued, enqueue `frame` and cut the in-flight
    /// frame short.
    pub fn clear_and_replace(&self, frame: TimedFrame) {
        let mut state = self.lock();
        state.replace_on_next = false;
        self.replace_locked(&mut state, frame);
    }

    /// Make the next push behave like [`clear_and_replace`](Self::clear_and_replace).
    pub fn set_replace_on_next(&self) {
        self.lock().replace_on_next = true;
    }

    /// Drop all queued frames and cut the in-flight frame short.
    /// The dispatch thread falls back to neutral.
    pub fn cancel_all(&self) {
        let mut state = self.lock();
        let dropped = state.frames.len();
        state.replace_on_next = false;
        state.frames.clear();
        if state.next_state_change != NextStateChange::Empty || state.busy {
            state.next_state_change = NextStateChange::Changed;
        }
        self.cvar.notify_all();
        debug!("Cancelled {dropped} queued frames");
    }

    /// Next thing for the dispatch thread to do.
    ///
    /// Blocks until the in-flight frame's deadline passes, something is
    /// queued, or the queue is cut short. Returns `None` once stopping.
    /// A popped frame starts where the previous one ended, so back-to-back
    /// frames do not accumulate wake-up latency.
    pub fn pop_blocking(&self) -> Option<DispatchEvent> {
        self.next_event(None)
    }

    /// Like [`pop_blocking`](Self::pop_blocking), but never waits longer than
    /// `poll`. Returns [`DispatchEvent::Poll`] when that limit is hit first.
    pub fn pop_or_poll(&self, poll: Duration) -> Option<DispatchEvent> {
        self.next_event(Some(poll))
    }

    fn next_event(&self, poll: Option<Duration>) -> Option<DispatchEvent> {
        let mut state = self.lock();
        loop {
            if state.stopping {
                return None;
            }
            let now = Instant::now();
            let wait = match state.next_state_change {
                NextStateChange::At(deadline) if now < deadline => Some(deadline - now),
                NextStateChange::Empty if state.frames.is_empty() => None,
                _ => {
                    return Some(self.take_next(&mut state, now));
                }
            };

            state = match (wait, poll) {
                (Some(wait), Some(poll)) if poll < wait => {
                    let (state, timeout) = self.wait_for(state, poll);
                    if timeout {
                        return Some(DispatchEvent::Poll);
                    }
                    state
                }
                (Some(wait), _) => self.wait_for(state, wait).0,
                (None, Some(poll)) => {
                    let (state, timeout) = self.wait_for(state, poll);
                    if timeout {
                        return Some(DispatchEvent::Poll);
                    }
                    state
                }
                (None, None) => self.wait(state),
            };
        }
    }

    fn wait_for<'a>(
        &self,
        guard: MutexGuard<'a, QueueState>,
        timeout: Duration,
    ) -> (MutexGuard<'a, QueueState>, bool) {
        let (guard, result) = self
            .cvar
            .wait_timeout(guard, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        (guard, result.timed_out())
    }

    fn take_next(&self, state: &mut QueueState, now: Instant) -> DispatchEvent {
        let start = match state.next_state_change {
            NextStateChange::At(deadline) => deadline,
            _ => now,
        };
        match state.frames.pop_front() {
            Some(frame) => {
                state.next_state_change =
                    NextStateChange::At(start + self.clock.duration(frame.ticks));
                state.phase = DispatchPhase::Draining;
                self.cvar.notify_all();
                DispatchEvent::Frame(frame)
            }
            None => {
                state.next_state_change = NextStateChange::Empty;
                DispatchEvent::Drained
            }
        }
    }

    /// Mark the drain finished unless more work arrived meanwhile.
    pub fn mark_idle(&self) {
        let mut state = self.lock();
        if state.frames.is_empty() && state.next_state_change == NextStateChange::Empty {
            state.busy = false;
            state.phase = DispatchPhase::Idle;
            self.cvar.notify_all();
        }
    }

    pub fn set_phase(&self, phase: DispatchPhase) {
        let mut state = self.lock();
        if state.phase != phase {
            state.phase = phase;
            self.cvar.notify_all();
        }
    }

    pub fn record_sent(&self, sent: ControllerState) {
        self.lock().last_sent = sent;
    }

    /// Record a transport failure. Further sends are skipped.
    pub fn fail(&self, message: String) {
        let mut state = self.lock();
        if state.link_error.is_none() {
            state.link_error = Some(message);
        }
        self.cvar.notify_all();
    }

    /// Ask the dispatch thread to exit at its next wake-up.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.stopping = true;
        self.cvar.notify_all();
    }

    /// Block until every queued frame has been dispatched and the dispatch
    /// thread is idle.
    pub fn wait_until_idle(self: &Arc<Self>, cancel: &Cancellable) -> Result<(), SchedulerError> {
        let _wake = cancel.attach(self);
        let mut state = self.lock();
        loop {
            cancel.check()?;
            if let Some(e) = &state.link_error {
                return Err(SchedulerError::LinkFailed(e.clone()));
            }
            if state.stopping || state.phase == DispatchPhase::Terminated {
                return Err(SchedulerError::Stopped);
            }
            if !state.busy {
                return Ok(());
            }
            state = self.wait(state);
        }
    }
}

impl CancelListener for CommandQueue {
    fn on_cancel(&self, _reason: &CancelReason) {
        // Take the lock so a waiter between its check and its wait sees this
        let _state = self.lock();
        self.cvar.notify_all();
    }
}
