//! Wire constants and protocol bookkeeping

use super::LinkError;

/// Heartbeat request; the remote answers with its counter
pub const HEARTBEAT: u8 = 0x10;
/// Payload follows
pub const MESSAGE: u8 = 0x20;
/// Config exchange follows (heartbeat seed or format message)
pub const CONFIG: u8 = 0x30;
/// Handshake probe byte
pub const PROBE: u8 = 0xFF;
/// Responses to the last three probes once the remote is listening
pub const HANDSHAKE_PATTERN: [u8; 3] = [0xFF, 0xFE, 0xFD];
/// Format message data type for little-endian `f32` payloads
pub const DATA_TYPE_F32: u8 = 0;
/// Length of the config exchanges
pub const CONFIG_LEN: usize = 4;

/// Negotiated payload layout, sent once per handshake as `[data_type, elements, 0, 0]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadFormat {
    data_type: u8,
    elements: u8,
}

impl PayloadFormat {
    /// Payload of `elements` little-endian `f32` values
    pub fn float32(elements: usize) -> Result<Self, LinkError> {
        if elements == 0 {
            return Err(LinkError::EmptyPayload);
        }
        let elements = u8::try_from(elements).map_err(|_| LinkError::PayloadTooLong(elements))?;
        Ok(Self {
            data_type: DATA_TYPE_F32,
            elements,
        })
    }

    /// Payload format for a fixed byte length (must be a whole number of `f32`s)
    pub fn for_payload_len(bytes: usize) -> Result<Self, LinkError> {
        if bytes % 4 != 0 {
            return Err(LinkError::PayloadLength {
                expected: bytes.next_multiple_of(4),
                actual: bytes,
            });
        }
        Self::float32(bytes / 4)
    }

    /// Decode a received format message
    pub fn from_message(message: [u8; CONFIG_LEN]) -> Result<Self, LinkError> {
        if message[0] != DATA_TYPE_F32 {
            return Err(LinkError::UnsupportedDataType(message[0]));
        }
        Self::float32(message[1] as usize)
    }

    pub fn message(&self) -> [u8; CONFIG_LEN] {
        [self.data_type, self.elements, 0, 0]
    }

    pub fn elements(&self) -> usize {
        self.elements as usize
    }

    /// Bytes per payload transfer
    pub fn payload_len(&self) -> usize {
        self.elements as usize * std::mem::size_of::<f32>()
    }
}

/// Sliding window over the last three probe responses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeWindow {
    bytes: [u8; 3],
}

impl HandshakeWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, response: u8) {
        self.bytes.rotate_left(1);
        self.bytes[2] = response;
    }

    pub fn matches(&self) -> bool {
        self.bytes == HANDSHAKE_PATTERN
    }

    pub fn bytes(&self) -> [u8; 3] {
        self.bytes
    }
}

/// Tracks the remote heartbeat counter
///
/// Each reading must be strictly greater than the previous one; otherwise the
/// consecutive-error count goes up. A good reading resets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatMonitor {
    previous: u8,
    current: u8,
    consecutive: u32,
    total: u64,
    max_errors: u32,
}

impl HeartbeatMonitor {
    pub fn new(max_errors: u32) -> Self {
        Self {
            previous: 0,
            current: 0,
            consecutive: 0,
            total: 0,
            max_errors,
        }
    }

    /// Start over from two counter values read during the handshake
    pub fn seed(&mut self, previous: u8, current: u8) {
        self.previous = previous;
        self.current = current;
        self.consecutive = 0;
    }

    /// Record a reading and return the consecutive-error count
    pub fn observe(&mut self, value: u8) -> u32 {
        self.previous = self.current;
        self.current = value;
        if self.current <= self.previous {
            self.consecutive += 1;
            self.total += 1;
        } else {
            self.consecutive = 0;
        }
        self.consecutive
    }

    /// Whether the error threshold has been reached
    pub fn exceeded(&self) -> bool {
        self.consecutive >= self.max_errors
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive
    }

    pub fn total_errors(&self) -> u64 {
        self.total
    }

    pub fn current(&self) -> u8 {
        self.current
    }
}
