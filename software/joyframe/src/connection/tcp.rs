//! TCP relay backend.
//!
//! The console-side relay keeps its own controller state and is sent line
//! commands for only the fields that changed. It paces itself, so the
//! backend has no tick; instead consecutive messages are spaced by at least
//! `cooldown_ms`. The relay drops a connection that stays silent, so a
//! keepalive thread sends a harmless request whenever the link has been idle
//! for `keepalive_ms` and drains whatever the relay sends back.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};

use joyframe_shared::protocol::text::{KEEPALIVE_LINE, LINE_END, encode_diff};
use joyframe_shared::{ControllerState, StateDiff, TCP_RELAY_PORT};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use super::{Connection, Transmission};
use crate::error::TransportError;

/// How often the keepalive thread wakes to drain replies
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpRelayConfig {
    /// `host:port` of the relay
    pub address: String,
    /// Minimum spacing between two messages
    pub cooldown_ms: u64,
    /// Idle time after which a keepalive is sent. Zero disables it.
    pub keepalive_ms: u64,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for TcpRelayConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{TCP_RELAY_PORT}"),
            cooldown_ms: 150,
            keepalive_ms: 2000,
            connect_timeout_ms: 3000,
            write_timeout_ms: 1000,
        }
    }
}

struct TcpIo {
    stream: TcpStream,
    last_tx: Instant,
}

#[derive(Default)]
struct LinkStatus {
    stopping: bool,
    failure: Option<String>,
}

/// Socket state shared between the dispatch thread and the keepalive thread
struct TcpLink {
    io: Mutex<TcpIo>,
    status: Mutex<LinkStatus>,
    /// Signalled on stop and on failure
    wake: Condvar,
}

impl TcpLink {
    fn io(&self) -> MutexGuard<'_, TcpIo> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> MutexGuard<'_, LinkStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failure(&self) -> Option<String> {
        self.status().failure.clone()
    }

    fn fail(&self, reason: String) {
        let mut status = self.status();
        if status.failure.is_none() {
            error!(error = %reason, "TCP relay link failed");
            status.failure = Some(reason);
            self.wake.notify_all();
        }
    }

    /// Sleep up to `timeout`; true once asked to stop
    fn wait_stop(&self, timeout: Duration) -> bool {
        let status = self.status();
        if status.stopping {
            return true;
        }
        let (status, _) = self
            .wake
            .wait_timeout_while(status, timeout, |s| !s.stopping)
            .unwrap_or_else(PoisonError::into_inner);
        status.stopping
    }

    /// Sleep up to `timeout` unless the link fails or is closed first.
    fn wait_quiet(&self, timeout: Duration) -> Result<(), TransportError> {
        let status = self.status();
        let (status, _) = self
            .wake
            .wait_timeout_while(status, timeout, |s| !s.stopping && s.failure.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match (&status.failure, status.stopping) {
            (Some(reason), _) => Err(TransportError::Closed(reason.clone())),
            (None, true) => Err(TransportError::Closed("relay link is closing".into())),
            (None, false) => Ok(()),
        }
    }

    fn request_stop(&self) {
        self.status().stopping = true;
        self.wake.notify_all();
    }

    fn write_line(&self, io: &mut TcpIo, bytes: &[u8]) -> Result<(), TransportError> {
        if let Err(e) = io.stream.write_all(bytes).and_then(|_| io.stream.flush()) {
            self.fail(e.to_string());
            return Err(TransportError::Io(e));
        }
        io.last_tx = Instant::now();
        Ok(())
    }
}

fn keepalive_loop(link: Arc<TcpLink>, mut reader: TcpStream, interval: Option<Duration>) {
    let mut rxbuf = [0_u8; 256];
    let keepalive = format!("{KEEPALIVE_LINE}{LINE_END}");

    while !link.wait_stop(POLL_INTERVAL) {
        // Drain replies so the relay never blocks on a full send buffer
        loop {
            match reader.read(&mut rxbuf) {
                Ok(0) => {
                    link.fail("relay closed the connection".into());
                    return;
                }
                Ok(n) => trace!("Relay replied with {n} bytes"),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    break;
                }
                Err(e) => {
                    link.fail(e.to_string());
                    return;
                }
            }
        }

        let Some(interval) = interval else {
            continue;
        };
        let mut io = link.io();
        if io.last_tx.elapsed() >= interval {
            debug!("Sending TCP relay keepalive");
            if link.write_line(&mut io, keepalive.as_bytes()).is_err() {
                return;
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct TcpRelay {
    config: TcpRelayConfig,
    #[serde(skip)]
    link: Option<Arc<TcpLink>>,
    #[serde(skip)]
    keepalive: Option<JoinHandle<()>>,
    /// What the relay currently holds, as far as this side knows
    #[serde(skip)]
    relay_state: ControllerState,
    #[serde(skip)]
    txbuf: String,
}

impl TcpRelay {
    pub fn new(config: TcpRelayConfig) -> Self {
        Self {
            config,
            link: None,
            keepalive: None,
            relay_state: ControllerState::NEUTRAL,
            txbuf: String::new(),
        }
    }

    pub fn config(&self) -> &TcpRelayConfig {
        &self.config
    }

    fn diff_for(&self, tx: &Transmission<'_>) -> StateDiff {
        match tx {
            Transmission::Diff { from, to } => from.diff(to),
            Transmission::Full(state) => self.relay_state.diff(state),
        }
    }

    fn connect(&self) -> Result<TcpStream, TransportError> {
        let addr = self
            .config
            .address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                TransportError::Protocol(format!("no address for `{}`", self.config.address))
            })?;
        let stream =
            TcpStream::connect_timeout(&addr, Duration::from_millis(self.config.connect_timeout_ms))?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(Duration::from_millis(
            self.config.write_timeout_ms.max(1),
        )))?;
        // Only the keepalive thread reads
        stream.set_read_timeout(Some(Duration::from_millis(1)))?;
        Ok(stream)
    }
}

#[typetag::serde]
impl Connection for TcpRelay {
    fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.close();

        let stream = self.connect()?;
        let reader = stream.try_clone()?;
        let link = Arc::new(TcpLink {
            io: Mutex::new(TcpIo {
                stream,
                last_tx: Instant::now(),
            }),
            status: Mutex::new(LinkStatus::default()),
            wake: Condvar::new(),
        });

        let interval =
            (self.config.keepalive_ms > 0).then(|| Duration::from_millis(self.config.keepalive_ms));
        let thread_link = link.clone();
        let keepalive = Builder::new()
            .name("tcp-keepalive".into())
            .spawn(move || keepalive_loop(thread_link, reader, interval))?;

        info!("Connected to TCP relay at {}", self.config.address);
        self.link = Some(link);
        self.keepalive = Some(keepalive);
        self.relay_state = ControllerState::NEUTRAL;
        Ok(())
    }

    fn close(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        link.request_stop();
        if let Some(handle) = self.keepalive.take() {
            if handle.join().is_err() {
                warn!("TCP relay keepalive thread panicked");
            }
        }
        if let Err(e) = link.io().stream.shutdown(Shutdown::Both) {
            debug!("TCP relay shutdown: {e}");
        }
        info!("Closed TCP relay at {}", self.config.address);
    }

    fn ticksize(&self) -> Duration {
        Duration::ZERO
    }

    fn cooldown(&self) -> Duration {
        Duration::from_millis(self.config.cooldown_ms)
    }

    fn supports_diff(&self) -> bool {
        true
    }

    /// Gyro fields have no line command and are left out.
    fn encode(
        &mut self,
        tx: &Transmission<'_>,
        _ticks: u32,
        out: &mut Vec<u8>,
    ) -> Result<(), TransportError> {
        let mut lines = String::new();
        encode_diff(&self.diff_for(tx), &mut lines);
        out.extend_from_slice(lines.as_bytes());
        Ok(())
    }

    fn send(&mut self, tx: Transmission<'_>, _ticks: u32) -> Result<(), TransportError> {
        let link = self.link.clone().ok_or(TransportError::NotOpen)?;
        if let Some(reason) = link.failure() {
            return Err(TransportError::Closed(reason));
        }

        let diff = self.diff_for(&tx);
        self.txbuf.clear();
        let n = encode_diff(&diff, &mut self.txbuf);
        if n > 0 {
            // Keep the socket free for the keepalive thread while pacing
            let since = link.io().last_tx.elapsed();
            link.wait_quiet(self.cooldown().saturating_sub(since))?;
            let mut io = link.io();
            link.write_line(&mut io, self.txbuf.as_bytes())?;
            trace!("Sent {n} relay commands");
        }
        self.relay_state = *tx.target();
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.link
            .as_ref()
            .is_some_and(|link| link.failure().is_none())
    }

    fn error_string(&self) -> Option<String> {
        self.link.as_ref().and_then(|link| link.failure())
    }
}

impl Drop for TcpRelay {
    fn drop(&mut self) {
        self.close();
    }
}
