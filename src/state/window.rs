//! Bounded retention of outbound probe records.
//!
//! The sender records every probe here before it leaves; the tracker takes
//! the record back out when the echo arrives to get an RTT measured entirely
//! on the local monotonic clock. Records are ephemeral: once the window is
//! full the oldest is evicted, and a late echo simply falls back to the
//! timestamp carried in the payload.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// How many outbound records to retain
pub const SEND_WINDOW_LEN: usize = 100;

/// One outbound probe awaiting its echo; keyed by sequence in the window
#[derive(Debug, Clone, Copy)]
pub struct PacketRecord {
    pub sent_at: Instant,
}

/// Fixed-capacity window of recent sends, keyed by sequence
#[derive(Debug, Default)]
pub struct SendWindow {
    order: VecDeque<u32>,
    records: HashMap<u32, PacketRecord>,
}

impl SendWindow {
    pub fn new() -> Self {
        Self {
            order: VecDeque::with_capacity(SEND_WINDOW_LEN),
            records: HashMap::with_capacity(SEND_WINDOW_LEN),
        }
    }

    /// Record an outbound probe, evicting the oldest entry when full
    pub fn record(&mut self, sequence: u32, sent_at: Instant) {
        if self.order.len() >= SEND_WINDOW_LEN {
            if let Some(old) = self.order.pop_front() {
                self.records.remove(&old);
            }
        }
        self.order.push_back(sequence);
        self.records.insert(sequence, PacketRecord { sent_at });
    }

    /// Remove and return the record for an echoed sequence
    pub fn take(&mut self, sequence: u32) -> Option<PacketRecord> {
        // The stale entry in `order` is harmless; it is skipped on eviction.
        self.records.remove(&sequence)
    }

    /// Peek without consuming (used by the live history snapshot)
    pub fn get(&self, sequence: u32) -> Option<&PacketRecord> {
        self.records.get(&sequence)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
