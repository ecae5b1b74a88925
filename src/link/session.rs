//! Link protocol state machine and its threaded session
//!
//! [`LinkDriver`] owns the port and signal line and implements the protocol
//! as blocking calls (`handshake`, `tick`, `run`) so it can be driven directly
//! in tests. [`SerialLinkSession`] wraps a driver in a background thread and
//! exposes the thread-safe `set_payload` the postprocessor writes into.
//!
//! ```text
//! Disconnected ──▶ Handshaking ──▶ Ready ◀──▶ Transferring
//!                       ▲            │
//!                       └─ 50 heartbeat errors
//! ```

use super::port::{LinkPort, SignalLine};
use super::protocol::{
    CONFIG, CONFIG_LEN, HEARTBEAT, HandshakeWindow, HeartbeatMonitor, MESSAGE, PROBE,
    PayloadFormat,
};
use super::LinkError;
use crate::runtime::clock::{SharedClock, system_clock};
use crate::runtime::errors::{WorkError, WorkResult};
use crate::runtime::pipeline::{PayloadSink, Transport};
use crate::StreamError;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Protocol state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Handshaking,
    Ready,
    Transferring,
}

/// Protocol timings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct LinkSettings {
    /// How long the ready line is polled after each probe
    pub handshake_window_ms: u64,
    /// Poll step inside the handshake window
    pub handshake_poll_ms: u64,
    /// Poll interval while waiting for the first data request
    pub ready_poll_ms: u64,
    /// Pause between the config header and the format message
    pub format_settle_ms: u64,
    /// Steady-state heartbeat cadence
    pub tick_interval_ms: u64,
    /// Consecutive heartbeat errors that force a new handshake
    pub max_error_count: u32,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            handshake_window_ms: 100,
            handshake_poll_ms: 1,
            ready_poll_ms: 100,
            format_settle_ms: 1000,
            tick_interval_ms: 10,
            max_error_count: 50,
        }
    }
}

impl LinkSettings {
    pub fn handshake_window(&self) -> Duration {
        Duration::from_millis(self.handshake_window_ms)
    }

    pub fn handshake_poll(&self) -> Duration {
        Duration::from_millis(self.handshake_poll_ms)
    }

    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms)
    }

    pub fn format_settle(&self) -> Duration {
        Duration::from_millis(self.format_settle_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.handshake_poll_ms == 0 || self.ready_poll_ms == 0 {
            return Err(StreamError::InvalidConfig("link poll intervals must be positive".into()));
        }
        if self.handshake_window_ms < self.handshake_poll_ms {
            return Err(StreamError::InvalidConfig(
                "link.handshake_window_ms must be at least handshake_poll_ms".into(),
            ));
        }
        if self.max_error_count == 0 {
            return Err(StreamError::InvalidConfig("link.max_error_count must be at least 1".into()));
        }
        Ok(())
    }
}

/// Snapshot of a link's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    pub handshakes: u64,
    pub payloads_sent: u64,
    pub heartbeat_errors: u64,
    pub consecutive_errors: u32,
    pub last_heartbeat: u8,
}

/// Result of one steady-state tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// Error threshold reached; the caller must handshake again
    Resync,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared between the protocol thread and payload writers
struct LinkShared {
    format: PayloadFormat,
    payload: Mutex<Vec<u8>>,
    status: Mutex<LinkStatus>,
}

impl LinkShared {
    fn new(format: PayloadFormat) -> Self {
        Self {
            format,
            payload: Mutex::new(vec![0; format.payload_len()]),
            status: Mutex::new(LinkStatus::default()),
        }
    }

    fn set_payload(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let expected = self.format.payload_len();
        if bytes.len() != expected {
            return Err(LinkError::PayloadLength {
                expected,
                actual: bytes.len(),
            });
        }
        lock(&self.payload).copy_from_slice(bytes);
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut LinkStatus)) {
        f(&mut lock(&self.status));
    }
}

impl PayloadSink for LinkShared {
    fn deliver(&self, payload: &[u8]) -> WorkResult<()> {
        self.set_payload(payload)
            .map_err(|e| WorkError::NodeError(format!("serial link: {}", e)))
    }
}

/// Blocking protocol driver over a port and a ready line
pub struct LinkDriver<P, S> {
    name: String,
    port: P,
    signal: S,
    settings: LinkSettings,
    clock: SharedClock,
    heartbeat: HeartbeatMonitor,
    shared: Arc<LinkShared>,
}

impl<P: LinkPort, S: SignalLine> LinkDriver<P, S> {
    pub fn new(port: P, signal: S, format: PayloadFormat, settings: LinkSettings) -> Self {
        Self::with_shared(port, signal, settings, Arc::new(LinkShared::new(format)))
    }

    fn with_shared(port: P, signal: S, settings: LinkSettings, shared: Arc<LinkShared>) -> Self {
        Self {
            name: "serial_link".to_string(),
            port,
            signal,
            heartbeat: HeartbeatMonitor::new(settings.max_error_count),
            settings,
            clock: system_clock(),
            shared,
        }
    }

    /// Clock used for every poll and pause
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> LinkState {
        lock(&self.shared.status).state
    }

    pub fn status(&self) -> LinkStatus {
        lock(&self.shared.status).clone()
    }

    pub fn format(&self) -> PayloadFormat {
        self.shared.format
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    /// Replace the outgoing payload (must be exactly the negotiated length)
    pub fn set_payload(&self, bytes: &[u8]) -> Result<(), LinkError> {
        self.shared.set_payload(bytes)
    }

    fn set_state(&self, state: LinkState) {
        self.shared.update(|status| status.state = state);
    }

    fn transfer(&mut self, tx: &[u8]) -> Result<Vec<u8>, LinkError> {
        let rx = self.port.transfer(tx)?;
        if rx.len() != tx.len() {
            return Err(LinkError::ShortTransfer {
                expected: tx.len(),
                actual: rx.len(),
            });
        }
        Ok(rx)
    }

    fn transfer_byte(&mut self, byte: u8) -> Result<u8, LinkError> {
        Ok(self.transfer(&[byte])?[0])
    }

    /// Probe until the remote answers, then seed the heartbeat and send the format
    ///
    /// Never gives up on a silent or misbehaving remote; only I/O errors return.
    pub fn handshake(&mut self) -> Result<(), LinkError> {
        self.set_state(LinkState::Handshaking);
        info!("[{}] Starting handshake", self.name);

        let window_len = self.settings.handshake_window();
        let poll = self.settings.handshake_poll();
        let mut window = HandshakeWindow::new();
        let mut probes = 0u64;

        'probe: loop {
            window.push(self.transfer_byte(PROBE)?);
            probes += 1;

            let started = self.clock.now();
            loop {
                if self.signal.is_high()? && window.matches() {
                    break 'probe;
                }
                self.clock.sleep(poll);
                if self.clock.now().saturating_duration_since(started) >= window_len {
                    break;
                }
            }

            if probes % 100 == 0 {
                debug!(
                    "[{}] Still probing after {} attempts (window {:02X?})",
                    self.name,
                    probes,
                    window.bytes()
                );
            }
        }
        info!("[{}] Remote answered after {} probes", self.name, probes);

        self.transfer_byte(CONFIG)?;
        let seed = self.transfer(&[0; CONFIG_LEN])?;
        self.heartbeat.seed(seed[2], seed[3]);
        debug!("[{}] Heartbeat seeded with {} -> {}", self.name, seed[2], seed[3]);

        while !self.signal.is_high()? {
            self.clock.sleep(self.settings.ready_poll());
        }

        self.transfer_byte(CONFIG)?;
        self.clock.sleep(self.settings.format_settle());
        let message = self.shared.format.message();
        self.transfer(&message)?;
        info!(
            "[{}] Link ready, {} elements ({} bytes) per payload",
            self.name,
            self.shared.format.elements(),
            self.shared.format.payload_len()
        );

        let current = self.heartbeat.current();
        self.shared.update(|status| {
            status.state = LinkState::Ready;
            status.handshakes += 1;
            status.consecutive_errors = 0;
            status.last_heartbeat = current;
        });
        Ok(())
    }

    /// One steady-state step: heartbeat check, then payload if requested
    pub fn tick(&mut self) -> Result<TickOutcome, LinkError> {
        let beat = self.transfer_byte(HEARTBEAT)?;
        let errors = self.heartbeat.observe(beat);
        if errors > 0 {
            debug!(
                "[{}] Heartbeat did not advance (got {}), {} consecutive errors",
                self.name, beat, errors
            );
        }

        if self.signal.is_high()? {
            self.set_state(LinkState::Transferring);
            let sent = self.send_payload();
            self.set_state(LinkState::Ready);
            sent?;
        }

        let total = self.heartbeat.total_errors();
        self.shared.update(|status| {
            status.heartbeat_errors = total;
            status.consecutive_errors = errors;
            status.last_heartbeat = beat;
        });

        if self.heartbeat.exceeded() {
            warn!(
                "[{}] {} consecutive heartbeat errors, re-initialising link",
                self.name, errors
            );
            self.set_state(LinkState::Handshaking);
            return Ok(TickOutcome::Resync);
        }
        Ok(TickOutcome::Continue)
    }

    /// Header and payload go out under the payload lock so a concurrent
    /// `set_payload` can never produce a torn transfer.
    fn send_payload(&mut self) -> Result<(), LinkError> {
        let shared = Arc::clone(&self.shared);
        let payload = lock(&shared.payload);
        self.transfer_byte(MESSAGE)?;
        self.transfer(&payload)?;
        drop(payload);

        self.shared.update(|status| status.payloads_sent += 1);
        trace!("[{}] Payload sent", self.name);
        Ok(())
    }

    /// Handshake, tick until the error threshold, repeat. Returns only on I/O failure.
    pub fn run(&mut self) -> Result<(), LinkError> {
        loop {
            self.handshake()?;
            while self.tick()? == TickOutcome::Continue {
                self.clock.sleep(self.settings.tick_interval());
            }
        }
    }
}

/// Driver over type-erased hardware, as held by a session
pub type BoxedDriver = LinkDriver<Box<dyn LinkPort>, Box<dyn SignalLine>>;

/// Serial link transport running the protocol on its own thread
///
/// Cheap to clone; clones share the same link.
#[derive(Clone)]
pub struct SerialLinkSession {
    shared: Arc<LinkShared>,
    driver: Arc<Mutex<Option<BoxedDriver>>>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SerialLinkSession {
    pub fn new(
        port: impl LinkPort + 'static,
        signal: impl SignalLine + 'static,
        format: PayloadFormat,
        settings: LinkSettings,
    ) -> Self {
        let shared = Arc::new(LinkShared::new(format));
        let port: Box<dyn LinkPort> = Box::new(port);
        let signal: Box<dyn SignalLine> = Box::new(signal);
        let driver = LinkDriver::with_shared(port, signal, settings, Arc::clone(&shared));
        Self {
            shared,
            driver: Arc::new(Mutex::new(Some(driver))),
            thread: Arc::new(Mutex::new(None)),
        }
    }

    /// Clock used by the protocol thread (before `start`)
    pub fn with_clock(self, clock: SharedClock) -> Self {
        {
            let mut driver = lock(&self.driver);
            if let Some(d) = driver.take() {
                *driver = Some(d.with_clock(clock));
            }
        }
        self
    }

    pub fn format(&self) -> PayloadFormat {
        self.shared.format
    }

    /// Replace the outgoing payload; safe to call from any thread
    pub fn set_payload(&self, bytes: &[u8]) -> Result<(), LinkError> {
        self.shared.set_payload(bytes)
    }

    pub fn status(&self) -> LinkStatus {
        lock(&self.shared.status).clone()
    }

    /// Spawn the protocol thread. Idempotent.
    pub fn start(&self) -> crate::Result<()> {
        let mut thread = lock(&self.thread);
        if thread.is_some() {
            return Ok(());
        }

        let mut driver = self.take_driver()?;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("serial_link".to_string())
            .spawn(move || {
                if let Err(e) = driver.run() {
                    error!("[serial_link] Link stopped: {}", e);
                }
                shared.update(|status| status.state = LinkState::Disconnected);
            })
            .map_err(|e| StreamError::Spawn(format!("serial link: {}", e)))?;
        *thread = Some(handle);
        info!("[serial_link] Protocol thread started");
        Ok(())
    }

    /// Detach the driver to run the protocol on the caller's thread
    pub fn take_driver(&self) -> Result<BoxedDriver, LinkError> {
        lock(&self.driver).take().ok_or(LinkError::AlreadyStarted)
    }

    /// Whether the protocol thread is alive
    pub fn is_running(&self) -> bool {
        lock(&self.thread).as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Transport for SerialLinkSession {
    fn name(&self) -> &str {
        "serial_link"
    }

    fn start(&self) -> crate::Result<()> {
        SerialLinkSession::start(self)
    }

    fn payload_sink(&self) -> Option<Arc<dyn PayloadSink>> {
        Some(Arc::clone(&self.shared) as Arc<dyn PayloadSink>)
    }

    fn expected_payload_len(&self) -> Option<usize> {
        Some(self.shared.format.payload_len())
    }
}
