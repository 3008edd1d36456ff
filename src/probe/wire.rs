//! Fixed-layout binary payload for the probe/echo wire protocol.
//!
//! Layout (big-endian):
//!
//! ```text
//! offset  size  field
//!      0     4  magic "CLAB"
//!      4     1  version
//!      5     1  kind (0 = probe, 1 = echo)
//!      6     4  sequence (u32)
//!     10     8  send_timestamp (i64, nanoseconds since session anchor)
//!     18     4  receive_count (u32, responder's per-flow counter; 0 on probes)
//!     22     1  test_id length
//!     23     n  test_id bytes (n <= 32)
//! ```
//!
//! Worst case 55 bytes, far below any sane MTU. Anything that fails to parse
//! the fixed header is dropped by both sides, never treated as an error.

use serde::{Deserialize, Serialize};

pub const MAGIC: [u8; 4] = *b"CLAB";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 23;
pub const MAX_TEST_ID_LEN: usize = 32;
pub const MAX_PACKET_LEN: usize = HEADER_LEN + MAX_TEST_ID_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketKind {
    Probe,
    Echo,
}

impl PacketKind {
    fn to_byte(self) -> u8 {
        match self {
            PacketKind::Probe => 0,
            PacketKind::Echo => 1,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(PacketKind::Probe),
            1 => Some(PacketKind::Echo),
            _ => None,
        }
    }
}

/// One probe or echo payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePacket {
    pub kind: PacketKind,
    /// Starts at 0, increments by 1 per probe, never resets mid-session
    pub sequence: u32,
    /// Monotonic nanoseconds since the client's session anchor; echoed back
    /// unmodified so the client can compute RTT without trusting any clock
    /// on the responder
    pub send_timestamp: i64,
    /// Responder's receive counter for this flow at echo time (0 on probes)
    pub receive_count: u32,
    /// Session test id for payload-level correlation
    pub test_id: String,
}

impl WirePacket {
    pub fn probe(sequence: u32, send_timestamp: i64, test_id: &str) -> Self {
        Self {
            kind: PacketKind::Probe,
            sequence,
            send_timestamp,
            receive_count: 0,
            test_id: test_id.to_string(),
        }
    }

    /// Build the echo reply for a received probe
    pub fn into_echo(mut self, receive_count: u32) -> Self {
        self.kind = PacketKind::Echo;
        self.receive_count = receive_count;
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let id_bytes = self.test_id.as_bytes();
        let id_len = id_bytes.len().min(MAX_TEST_ID_LEN);
        let mut buf = Vec::with_capacity(HEADER_LEN + id_len);

        buf.extend_from_slice(&MAGIC);
        buf.push(VERSION);
        buf.push(self.kind.to_byte());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.send_timestamp.to_be_bytes());
        buf.extend_from_slice(&self.receive_count.to_be_bytes());
        buf.push(id_len as u8);
        buf.extend_from_slice(&id_bytes[..id_len]);

        buf
    }

    /// Parse a datagram. Returns None for anything malformed; garbage on the
    /// probe port must never crash either side.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        if data[0..4] != MAGIC || data[4] != VERSION {
            return None;
        }

        let kind = PacketKind::from_byte(data[5])?;
        let sequence = u32::from_be_bytes(data[6..10].try_into().ok()?);
        let send_timestamp = i64::from_be_bytes(data[10..18].try_into().ok()?);
        let receive_count = u32::from_be_bytes(data[18..22].try_into().ok()?);

        let id_len = data[22] as usize;
        if id_len > MAX_TEST_ID_LEN || data.len() < HEADER_LEN + id_len {
            return None;
        }
        let test_id = std::str::from_utf8(&data[HEADER_LEN..HEADER_LEN + id_len])
            .ok()?
            .to_string();

        Some(Self {
            kind,
            sequence,
            send_timestamp,
            receive_count,
            test_id,
        })
    }
}
