//! In-process emulation of the remote microcontroller
//!
//! Reproduces the firmware side of the protocol byte by byte: every byte
//! shifted in returns the byte loaded into the shift register after the
//! previous one (the heartbeat counter), headers switch the receive state, and
//! the ready line is raised whenever the firmware waits for data.
//!
//! While in its init state the firmware counts the heartbeat *down* from
//! `0xFF`, which is what produces the `FF FE FD` handshake pattern.

use super::port::{LinkPort, SignalLine};
use super::protocol::{CONFIG, CONFIG_LEN, HEARTBEAT, MESSAGE, PROBE, PayloadFormat};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Receive state of the firmware's byte handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommState {
    Init,
    WaitingForHeader,
    ReceivingConfig,
    ReceivingMessage,
}

/// Main-program phase of the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralPhase {
    /// Waiting for four probe bytes
    AwaitingProbes,
    /// Ready line high, waiting for the heartbeat seed exchange
    AwaitingSeed,
    /// Ready line high, waiting for the format message
    AwaitingFormat,
    /// Requesting payloads
    Streaming,
}

struct Firmware {
    comm: CommState,
    phase: PeripheralPhase,
    buffer: Vec<u8>,
    pos: usize,
    shift_register: u8,
    heartbeat: u8,
    ready: bool,
    frozen: bool,
    format: Option<PayloadFormat>,
    received: Vec<Vec<f32>>,
}

impl Firmware {
    fn new() -> Self {
        Self {
            comm: CommState::Init,
            phase: PeripheralPhase::AwaitingProbes,
            buffer: vec![0; CONFIG_LEN],
            pos: 0,
            shift_register: 0x00,
            heartbeat: 0xFF,
            ready: false,
            frozen: false,
            format: None,
            received: Vec::new(),
        }
    }

    fn exchange(&mut self, byte: u8) -> u8 {
        let out = self.shift_register;
        let mut packet_complete = false;

        match self.comm {
            CommState::WaitingForHeader => match byte {
                HEARTBEAT => {}
                MESSAGE => self.comm = CommState::ReceivingMessage,
                CONFIG => self.comm = CommState::ReceivingConfig,
                _ => {}
            },
            CommState::Init | CommState::ReceivingConfig | CommState::ReceivingMessage => {
                self.buffer[self.pos] = byte;
                self.pos += 1;
                if self.pos == self.buffer.len() {
                    self.pos = 0;
                    self.comm = CommState::WaitingForHeader;
                    packet_complete = true;
                }
            }
        }

        self.shift_register = self.heartbeat;
        if !self.frozen {
            self.heartbeat = if self.comm == CommState::Init {
                self.heartbeat.wrapping_sub(1)
            } else {
                self.heartbeat.wrapping_add(1)
            };
        }

        if packet_complete {
            self.on_packet();
        }
        out
    }

    fn on_packet(&mut self) {
        match self.phase {
            PeripheralPhase::AwaitingProbes => {
                if self.buffer.iter().all(|b| *b == PROBE) {
                    debug!("[peripheral] Start message received");
                    self.phase = PeripheralPhase::AwaitingSeed;
                    self.ready = true;
                } else {
                    self.buffer.fill(0);
                    self.comm = CommState::Init;
                }
            }
            PeripheralPhase::AwaitingSeed => {
                self.ready = false;
                if self.buffer.iter().all(|b| *b == 0) {
                    debug!("[peripheral] Init exchange complete");
                    self.phase = PeripheralPhase::AwaitingFormat;
                    self.ready = true;
                } else {
                    warn!("[peripheral] Unexpected init exchange {:02X?}", self.buffer);
                    self.restart_init();
                }
            }
            PeripheralPhase::AwaitingFormat => {
                let message = [self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]];
                match PayloadFormat::from_message(message) {
                    Ok(format) => {
                        info!(
                            "[peripheral] Streaming {} elements per payload",
                            format.elements()
                        );
                        self.buffer = vec![0; format.payload_len()];
                        self.format = Some(format);
                        self.phase = PeripheralPhase::Streaming;
                        self.ready = true;
                    }
                    Err(e) => {
                        warn!("[peripheral] Bad format message: {}", e);
                        self.restart_init();
                    }
                }
            }
            PeripheralPhase::Streaming => {
                let values = self
                    .buffer
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                self.received.push(values);
            }
        }
    }

    fn restart_init(&mut self) {
        self.phase = PeripheralPhase::AwaitingProbes;
        self.comm = CommState::Init;
        self.buffer = vec![0; CONFIG_LEN];
        self.pos = 0;
        self.ready = false;
    }
}

/// Emulated microcontroller on the far end of the link
///
/// Cheap to clone; [`port`](Self::port) and [`signal`](Self::signal) hand out
/// the two collaborator halves that a [`SerialLinkSession`](super::SerialLinkSession) needs.
#[derive(Clone)]
pub struct SimulatedPeripheral {
    firmware: Arc<Mutex<Firmware>>,
}

impl SimulatedPeripheral {
    pub fn new() -> Self {
        Self {
            firmware: Arc::new(Mutex::new(Firmware::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Firmware> {
        self.firmware.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bus side of the device
    pub fn port(&self) -> SimulatedPort {
        SimulatedPort {
            peripheral: self.clone(),
        }
    }

    /// Ready line of the device
    pub fn signal(&self) -> SimulatedSignal {
        SimulatedSignal {
            peripheral: self.clone(),
        }
    }

    pub fn phase(&self) -> PeripheralPhase {
        self.lock().phase
    }

    /// Negotiated format, once the handshake has completed
    pub fn format(&self) -> Option<PayloadFormat> {
        self.lock().format
    }

    /// Payloads received so far, decoded as `f32` values
    pub fn received(&self) -> Vec<Vec<f32>> {
        self.lock().received.clone()
    }

    pub fn received_count(&self) -> usize {
        self.lock().received.len()
    }

    pub fn last_received(&self) -> Option<Vec<f32>> {
        self.lock().received.last().cloned()
    }

    /// Stop (or resume) advancing the heartbeat counter, as a hung firmware would
    pub fn freeze_heartbeat(&self, frozen: bool) {
        self.lock().frozen = frozen;
    }

    /// Power-cycle the device; received payloads are kept
    pub fn reset(&self) {
        let mut firmware = self.lock();
        let received = std::mem::take(&mut firmware.received);
        *firmware = Firmware::new();
        firmware.received = received;
        info!("[peripheral] Reset");
    }
}

impl Default for SimulatedPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

/// [`LinkPort`] half of a [`SimulatedPeripheral`]
pub struct SimulatedPort {
    peripheral: SimulatedPeripheral,
}

impl LinkPort for SimulatedPort {
    fn transfer(&mut self, tx: &[u8]) -> io::Result<Vec<u8>> {
        let mut firmware = self.peripheral.lock();
        Ok(tx.iter().map(|byte| firmware.exchange(*byte)).collect())
    }
}

/// [`SignalLine`] half of a [`SimulatedPeripheral`]
pub struct SimulatedSignal {
    peripheral: SimulatedPeripheral,
}

impl SignalLine for SimulatedSignal {
    fn is_high(&mut self) -> io::Result<bool> {
        Ok(self.peripheral.lock().ready)
    }
}
