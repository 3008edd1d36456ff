pub mod controller;
pub mod registry;
pub mod sender;
pub mod tracker;

pub use controller::*;
pub use registry::*;
pub use sender::*;
pub use tracker::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Lifecycle state of a probe session.
///
/// Owned exclusively by the session controller; the sender and tracker only
/// mutate counters, never lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    Pending,
    Running,
    Stopping,
    Completed,
    Failed,
}

/// One running or completed probe test
#[derive(Debug, Clone)]
pub struct ProbeSession {
    pub test_id: String,
    pub label: Option<String>,
    pub target: SocketAddr,
    /// The port actually bound, deterministic candidate or fallback
    pub source_port: u16,
    pub rate_pps: u32,
    pub warmup: Duration,
    /// Wall clock, for the persisted record only
    pub started_at: DateTime<Utc>,
    /// Monotonic anchor all timestamps are measured against
    pub anchor: Instant,
    pub state: SessionState,
}
