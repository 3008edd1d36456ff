//! The finalized result record, the one artifact a session persists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::{ProbeSession, SessionState};
use crate::state::{Totals, Verdict};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub label: Option<String>,
    pub target: String,
    /// The port actually bound, for correlating flows in external flow logs
    pub source_port: u16,
    pub rate_pps: u32,
    pub duration_s: f64,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,

    pub sent_count: u64,
    /// Highest per-flow receive count the responder reported back
    pub echoed_count: u64,
    pub received_count: u64,
    pub send_errors: u64,

    pub tx_loss_pct: f64,
    pub rx_loss_pct: f64,
    pub max_blackout_ms: u64,
    /// Largest gap inside the warmup window, excluded from the max
    pub warmup_blackout_ms: u64,
    pub verdict: Verdict,
    pub avg_latency_ms: f64,
    pub jitter_ms: f64,

    pub started_at: DateTime<Utc>,
    /// Attached after the fact by the flow-log enricher, if at all
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub egress_path: Option<String>,
}

impl TestResult {
    pub fn from_totals(session: &ProbeSession, totals: &Totals, error: Option<String>) -> Self {
        Self {
            test_id: session.test_id.clone(),
            label: session.label.clone(),
            target: session.target.to_string(),
            source_port: session.source_port,
            rate_pps: session.rate_pps,
            duration_s: round2(totals.duration_s),
            state: session.state,
            error,
            sent_count: totals.sent,
            echoed_count: totals.echoed,
            received_count: totals.received,
            send_errors: totals.send_errors,
            tx_loss_pct: round2(totals.tx_loss_pct),
            rx_loss_pct: round2(totals.rx_loss_pct),
            max_blackout_ms: totals.max_blackout_ms,
            warmup_blackout_ms: totals.warmup_blackout_ms,
            verdict: totals.verdict,
            avg_latency_ms: round2(totals.avg_latency_ms),
            jitter_ms: round2(totals.jitter_ms),
            started_at: session.started_at,
            egress_path: None,
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
