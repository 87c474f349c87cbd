//! Dispatch thread that moves frames from the queue onto the wire.
//!
//! The thread exclusively owns the connection. It pops frames at their
//! deadlines, transmits the full state or only the diff depending on the
//! backend, and falls back to neutral whenever the queue runs dry. When the
//! link fails it keeps draining the queue without transmitting, so producers
//! never deadlock, and reports the failure through the queue.

use std::sync::Arc;
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use joyframe_shared::ControllerState;
use tracing::{debug, error, info, trace};

use crate::connection::{Connection, Transmission};
use crate::error::SchedulerError;
use crate::queue::{CommandQueue, DispatchEvent, DispatchPhase};

/// Longest the dispatch thread sleeps before checking on its connection
const LINK_POLL: Duration = Duration::from_millis(50);

/// Dispatch loop state, moved onto its own thread by [`DispatchHandle::spawn`]
pub struct DispatchThread {
    name: String,
    queue: Arc<CommandQueue>,
    connection: Box<dyn Connection>,
    /// Last state the relay accepted
    current: ControllerState,
}

impl DispatchThread {
    pub fn new(name: String, queue: Arc<CommandQueue>, connection: Box<dyn Connection>) -> Self {
        Self {
            name,
            queue,
            connection,
            current: ControllerState::NEUTRAL,
        }
    }

    /// Run until the queue is stopped, returning the owned connection.
    pub fn run(mut self) -> Box<dyn Connection> {
        #[cfg(feature = "affinity")]
        prepare_thread();

        info!("Dispatch thread `{}` started", self.name);
        while let Some(event) = self.queue.pop_or_poll(LINK_POLL) {
            match event {
                DispatchEvent::Frame(frame) => {
                    // Zero-length frames only keep the queue's shape exact
                    if frame.ticks == 0 {
                        continue;
                    }
                    self.transmit(frame.state, frame.ticks);
                    self.queue.set_phase(DispatchPhase::Waiting);
                }
                DispatchEvent::Drained => {
                    if !self.current.is_neutral() {
                        self.transmit(ControllerState::NEUTRAL, 0);
                    }
                    self.queue.mark_idle();
                    trace!("Dispatch thread `{}` idle", self.name);
                }
                DispatchEvent::Poll => self.check_link(),
            }
        }

        // Never leave the hardware mid-gesture
        self.queue.set_phase(DispatchPhase::Stopping);
        if !self.current.is_neutral() {
            self.transmit(ControllerState::NEUTRAL, 0);
        }
        self.connection.close();
        self.queue.set_phase(DispatchPhase::Terminated);
        info!("Dispatch thread `{}` stopped", self.name);

        self.connection
    }

    /// Surface failures the backend noticed on its own, e.g. the relay
    /// hanging up while nothing was being sent.
    fn check_link(&mut self) {
        if self.queue.is_failed() || self.connection.is_ready() {
            return;
        }
        let reason = self
            .connection
            .error_string()
            .unwrap_or_else(|| "connection is no longer ready".to_owned());
        error!(connection = %self.name, error = %reason, "Link lost while idle, no further frames will be sent");
        self.queue.fail(reason);
    }

    fn transmit(&mut self, state: ControllerState, ticks: u32) {
        if self.queue.is_failed() {
            return;
        }

        let result = if self.connection.supports_diff() {
            if !self.current.is_distinguishable(&state) {
                return;
            }
            self.queue.set_phase(DispatchPhase::Sending);
            self.connection.send(
                Transmission::Diff {
                    from: &self.current,
                    to: &state,
                },
                ticks,
            )
        } else {
            self.queue.set_phase(DispatchPhase::Sending);
            self.connection.send(Transmission::Full(&state), ticks)
        };

        match result {
            Ok(()) => {
                trace!(ticks, "Sent {state:?}");
                self.current = state;
                self.queue.record_sent(state);
            }
            Err(e) => {
                error!(connection = %self.name, error = %e, "Transport failure, no further frames will be sent");
                if !self.current.is_neutral() {
                    if let Err(e) = self.connection.send(Transmission::Full(&ControllerState::NEUTRAL), 0) {
                        debug!("Neutral after failure not delivered: {e}");
                    }
                }
                self.queue.fail(e.to_string());
            }
        }
    }
}

/// Pin the dispatch thread to the first core, which is more likely to be a
/// high-performance core on a heterogeneous device, and raise its priority.
/// Not available on every platform, so failures are ignored.
#[cfg(feature = "affinity")]
fn prepare_thread() {
    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    if let Some(core) = core_ids.first() {
        core_affinity::set_for_current(*core);
    }
    if thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max).is_err()
    {
        debug!("Unable to raise dispatch thread priority");
    }
}

/// Marks the queue stopping when the dispatch thread exits for any reason,
/// panics included, so producers are never left waiting on a dead thread.
struct StopOnExit(Arc<CommandQueue>);

impl Drop for StopOnExit {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Join handle for a running dispatch thread.
pub struct DispatchHandle {
    queue: Arc<CommandQueue>,
    thread: JoinHandle<Box<dyn Connection>>,
}

impl DispatchHandle {
    /// Spin up a dispatch thread for an open connection.
    pub fn spawn(
        name: &str,
        queue: Arc<CommandQueue>,
        connection: Box<dyn Connection>,
    ) -> Result<Self, SchedulerError> {
        let worker = DispatchThread::new(name.to_owned(), queue.clone(), connection);
        let on_exit = StopOnExit(queue.clone());
        let thread = Builder::new()
            .name(format!("dispatch-{name}"))
            .spawn(move || {
                let _on_exit = on_exit;
                worker.run()
            })
            .map_err(SchedulerError::Spawn)?;
        Ok(Self { queue, thread })
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Stop the thread after it returns the relay to neutral, and take back
    /// the connection.
    pub fn stop(self) -> Result<Box<dyn Connection>, SchedulerError> {
        self.queue.stop();
        self.thread.join().map_err(|_| {
            error!("Dispatch thread panicked");
            SchedulerError::Stopped
        })
    }
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use joyframe_shared::Buttons;

    use super::*;
    use crate::cancel::Cancellable;
    use crate::clock::TickClock;
    use crate::connection::RecordingConnection;
    use crate::queue::TimedFrame;

    fn setup(
        tick_ms: u64,
        diff_only: bool,
    ) -> (
        Arc<CommandQueue>,
        DispatchHandle,
        crossbeam::channel::Receiver<crate::connection::Recorded>,
        crate::connection::RecordingControl,
    ) {
        let (mut conn, rx, control) =
            RecordingConnection::new(Duration::from_millis(tick_ms), diff_only);
        conn.open().unwrap();
        let queue = Arc::new(CommandQueue::new(4, TickClock::from_millis(tick_ms)));
        let handle = DispatchHandle::spawn("test", queue.clone(), Box::new(conn)).unwrap();
        (queue, handle, rx, control)
    }

    #[test]
    fn test_frames_are_held_for_their_ticks() {
        let (queue, handle, rx, _control) = setup(8, false);
        let cancel = Cancellable::new();
        let a = ControllerState::default().with_buttons(Buttons::A);
        queue.push(TimedFrame::new(a, 5), &cancel).unwrap();
        queue.push(TimedFrame::neutral(0), &cancel).unwrap();
        queue.push(TimedFrame::neutral(2), &cancel).unwrap();
        queue.wait_until_idle(&cancel).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!((first.state, first.ticks), (a, 5));
        assert_eq!((second.state, second.ticks), (ControllerState::NEUTRAL, 2));
        // The zero-length frame is skipped, neutral follows after 40ms
        assert!(second.at.duration_since(first.at) >= Duration::from_millis(39));
        assert!(rx.try_recv().is_err());

        assert_eq!(queue.phase(), DispatchPhase::Idle);
        handle.stop().unwrap();
        assert_eq!(queue.phase(), DispatchPhase::Terminated);
    }

    #[test]
    fn test_diff_backend_skips_repeats_and_returns_to_neutral() {
        let (queue, handle, rx, _control) = setup(0, true);
        let cancel = Cancellable::new();
        let a = ControllerState::default().with_buttons(Buttons::A);
        queue.push(TimedFrame::new(a, 10), &cancel).unwrap();
        queue.push(TimedFrame::new(a, 10), &cancel).unwrap();
        queue.wait_until_idle(&cancel).unwrap();

        let sent: Vec<_> = rx.try_iter().collect();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].state, a);
        assert!(sent[0].diff.is_some());
        assert!(sent[1].state.is_neutral());
        assert_eq!(queue.last_sent(), ControllerState::NEUTRAL);
        handle.stop().unwrap();
    }

    #[test]
    fn test_stop_mid_hold_sends_neutral() {
        let (queue, handle, rx, _control) = setup(8, false);
        let a = ControllerState::default().with_buttons(Buttons::B);
        queue.try_push(TimedFrame::new(a, 10_000)).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap().state, a);

        let start = Instant::now();
        let conn = handle.stop().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!conn.is_open());
        let last = rx.try_recv().unwrap();
        assert!(last.state.is_neutral());
    }

    #[test]
    fn test_transport_failure_stops_transmission() {
        let (queue, handle, rx, control) = setup(1, false);
        let cancel = Cancellable::new();
        control.fail_next_send();

        let a = ControllerState::default().with_buttons(Buttons::X);
        for _ in 0..6 {
            queue.push(TimedFrame::new(a, 1), &cancel).unwrap();
        }
        let err = queue.wait_until_idle(&cancel).unwrap_err();
        assert!(matches!(err, SchedulerError::LinkFailed(_)));
        assert!(queue.error_string().unwrap().contains("injected"));

        // Local queue mutation continues, nothing reaches the wire
        for _ in 0..6 {
            queue.push(TimedFrame::new(a, 1), &cancel).unwrap();
        }
        let start = Instant::now();
        while !queue.is_empty() && start.elapsed() < Duration::from_secs(1) {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(queue.is_empty());
        assert!(rx.try_recv().is_err());
        handle.stop().unwrap();
    }
}
