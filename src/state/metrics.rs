//! Per-session counters and the blackout/verdict analyzer.
//!
//! The sender and tracker tasks share one `SessionMetrics` behind a mutex;
//! every update is O(1) so neither task can fall behind at the configured
//! rate. All time arithmetic is anchored to a monotonic `Instant` taken at
//! session start; wall-clock never enters the math, so NTP steps cannot
//! fabricate blackouts.
//!
//! Every method takes `now` explicitly, which keeps the whole analyzer
//! deterministic under test.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};

use super::window::SendWindow;

/// Categorical quality label derived from the maximum blackout.
///
/// Thresholds are fixed so verdicts stay comparable across tests: 0 is
/// EXCELLENT, under 1s GOOD, 1s through 5s DEGRADED, beyond that CRITICAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Excellent,
    Good,
    Degraded,
    Critical,
}

impl Verdict {
    pub fn from_blackout_ms(ms: u64) -> Self {
        if ms == 0 {
            Verdict::Excellent
        } else if ms < 1000 {
            Verdict::Good
        } else if ms <= 5000 {
            Verdict::Degraded
        } else {
            Verdict::Critical
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verdict::Excellent => "EXCELLENT",
            Verdict::Good => "GOOD",
            Verdict::Degraded => "DEGRADED",
            Verdict::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// Finalized counters for one session, computed once at session end
#[derive(Debug, Clone)]
pub struct Totals {
    pub sent: u64,
    pub received: u64,
    /// Highest per-flow receive count the responder reported back
    pub echoed: u64,
    pub send_errors: u64,
    pub tx_loss_pct: f64,
    pub rx_loss_pct: f64,
    pub max_blackout_ms: u64,
    /// Largest gap that fell inside the warmup window (excluded from the max)
    pub warmup_blackout_ms: u64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub jitter_ms: f64,
    pub verdict: Verdict,
    pub duration_s: f64,
    /// Sequences sent but never echoed back
    pub missed: Vec<u32>,
}

/// Point-in-time view of a running session, written to the stats file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveStats {
    pub test_id: String,
    pub status: String,
    pub sent: u64,
    pub received: u64,
    pub loss_pct: f64,
    pub tx_loss_pct: f64,
    pub rx_loss_pct: f64,
    pub max_blackout_ms: u64,
    pub current_blackout_ms: u64,
    pub avg_rtt_ms: f64,
    pub jitter_ms: f64,
    pub rate_pps: u32,
    pub duration_s: f64,
    /// Per-sequence fidelity of the last 100 probes: 1 = echoed or still
    /// plausibly in flight, 0 = confirmed missing
    pub history: Vec<u8>,
}

/// Shared counters and gap analysis for one probe session
#[derive(Debug)]
pub struct SessionMetrics {
    rate_pps: u32,
    warmup: Duration,
    anchor: Instant,

    sent_count: u64,
    send_errors: u64,

    received_count: u64,
    received_seqs: HashSet<u32>,
    /// High-water mark; late echoes below it never rewind the gap baseline
    last_seen_seq: Option<u32>,
    max_reported_receive_count: u32,
    last_receive_at: Option<Instant>,

    max_blackout_ms: u64,
    warmup_blackout_ms: u64,

    rtt_sum_ms: f64,
    rtt_count: u64,
    min_rtt_ms: f64,
    max_rtt_ms: f64,
    jitter_ms: f64,
    last_rtt_ms: Option<f64>,

    window: SendWindow,
}

impl SessionMetrics {
    pub fn new(rate_pps: u32, warmup: Duration, anchor: Instant) -> Self {
        Self {
            rate_pps,
            warmup,
            anchor,
            sent_count: 0,
            send_errors: 0,
            received_count: 0,
            received_seqs: HashSet::new(),
            last_seen_seq: None,
            max_reported_receive_count: 0,
            last_receive_at: None,
            max_blackout_ms: 0,
            warmup_blackout_ms: 0,
            rtt_sum_ms: 0.0,
            rtt_count: 0,
            min_rtt_ms: f64::MAX,
            max_rtt_ms: 0.0,
            jitter_ms: 0.0,
            last_rtt_ms: None,
            window: SendWindow::new(),
        }
    }

    /// Inter-probe interval in milliseconds
    fn interval_ms(&self) -> f64 {
        1000.0 / self.rate_pps as f64
    }

    /// Monotonic nanoseconds since the session anchor, as carried on the wire
    pub fn timestamp_ns(&self, now: Instant) -> i64 {
        now.duration_since(self.anchor).as_nanos() as i64
    }

    pub fn sent_count(&self) -> u64 {
        self.sent_count
    }

    pub fn received_count(&self) -> u64 {
        self.received_count
    }

    /// Record an outbound probe
    pub fn record_send(&mut self, sequence: u32, now: Instant) {
        self.sent_count = self.sent_count.max(sequence as u64 + 1);
        self.window.record(sequence, now);
    }

    /// Record a probe the OS refused to send. It still counts as sent so it
    /// shows up as TX loss; it is never retried.
    pub fn record_send_error(&mut self, sequence: u32, now: Instant) {
        self.record_send(sequence, now);
        self.send_errors += 1;
    }

    /// Record one echoed packet. Duplicates are ignored entirely; late
    /// echoes below the high-water mark update counters but never rewind
    /// the gap baseline, so an already-detected blackout cannot be erased.
    pub fn record_echo(
        &mut self,
        sequence: u32,
        send_timestamp: i64,
        reported_count: u32,
        now: Instant,
    ) {
        if !self.received_seqs.insert(sequence) {
            return;
        }
        self.received_count += 1;
        self.last_receive_at = Some(now);

        if reported_count > self.max_reported_receive_count {
            self.max_reported_receive_count = reported_count;
        }

        // RTT: prefer the locally recorded send instant; fall back to the
        // timestamp echoed in the payload when the record has been evicted.
        let rtt_ms = match self.window.take(sequence) {
            Some(record) => Some(now.duration_since(record.sent_at).as_secs_f64() * 1000.0),
            None => {
                let delta_ns = self.timestamp_ns(now) - send_timestamp;
                if delta_ns >= 0 {
                    Some(delta_ns as f64 / 1_000_000.0)
                } else {
                    None
                }
            }
        };
        if let Some(rtt) = rtt_ms {
            self.record_rtt(rtt);
        }

        match self.last_seen_seq {
            None => {
                if sequence > 0 {
                    self.apply_gap(0, sequence as u64);
                }
                self.last_seen_seq = Some(sequence);
            }
            Some(hwm) if sequence > hwm => {
                let gap = (sequence - hwm - 1) as u64;
                if gap > 0 {
                    self.apply_gap(hwm + 1, gap);
                }
                self.last_seen_seq = Some(sequence);
            }
            Some(_) => {}
        }
    }

    fn record_rtt(&mut self, rtt_ms: f64) {
        self.rtt_sum_ms += rtt_ms;
        self.rtt_count += 1;
        if rtt_ms < self.min_rtt_ms {
            self.min_rtt_ms = rtt_ms;
        }
        if rtt_ms > self.max_rtt_ms {
            self.max_rtt_ms = rtt_ms;
        }

        // RFC 3550 smoothed jitter over consecutive RTT deltas
        if let Some(last) = self.last_rtt_ms {
            let diff = (rtt_ms - last).abs();
            self.jitter_ms += (diff - self.jitter_ms) / 16.0;
        }
        self.last_rtt_ms = Some(rtt_ms);
    }

    /// Convert a sequence gap into a blackout duration and fold it into the
    /// running maximum. A gap whose last missing sequence was nominally sent
    /// inside the warmup window is recorded separately and excluded from the
    /// maximum; gaps straddling the warmup boundary count in full.
    fn apply_gap(&mut self, first_missing: u32, gap: u64) {
        let blackout_ms = gap * 1000 / self.rate_pps as u64;
        let last_missing = first_missing as u64 + gap - 1;
        let nominal_send_ms = last_missing * 1000 / self.rate_pps as u64;

        if nominal_send_ms < self.warmup.as_millis() as u64 {
            self.warmup_blackout_ms = self.warmup_blackout_ms.max(blackout_ms);
        } else {
            self.max_blackout_ms = self.max_blackout_ms.max(blackout_ms);
        }
    }

    /// Finalize the session. Sequences beyond the high-water mark that were
    /// sent but never echoed form a terminal gap; without it a session that
    /// goes dark and stays dark (including 100% loss) would read as clean.
    pub fn finalize(&mut self, now: Instant) -> Totals {
        let next_expected = self.last_seen_seq.map(|s| s as u64 + 1).unwrap_or(0);
        if self.sent_count > next_expected {
            let gap = self.sent_count - next_expected;
            self.apply_gap(next_expected as u32, gap);
        }

        let sent = self.sent_count;
        let received = self.received_count;
        let echoed = self.max_reported_receive_count as u64;

        let tx_loss_pct = if sent == 0 {
            0.0
        } else {
            clamp_pct(sent.saturating_sub(echoed) as f64 / sent as f64 * 100.0)
        };
        let rx_loss_pct = if echoed == 0 {
            0.0
        } else {
            clamp_pct(echoed.saturating_sub(received) as f64 / echoed as f64 * 100.0)
        };

        let avg_latency_ms = if self.rtt_count == 0 {
            0.0
        } else {
            self.rtt_sum_ms / self.rtt_count as f64
        };

        let missed: Vec<u32> = (0..sent as u32)
            .filter(|s| !self.received_seqs.contains(s))
            .collect();

        Totals {
            sent,
            received,
            echoed,
            send_errors: self.send_errors,
            tx_loss_pct,
            rx_loss_pct,
            max_blackout_ms: self.max_blackout_ms,
            warmup_blackout_ms: self.warmup_blackout_ms,
            avg_latency_ms,
            min_latency_ms: if self.rtt_count == 0 { 0.0 } else { self.min_rtt_ms },
            max_latency_ms: self.max_rtt_ms,
            jitter_ms: self.jitter_ms,
            verdict: Verdict::from_blackout_ms(self.max_blackout_ms),
            duration_s: now.duration_since(self.anchor).as_secs_f64(),
            missed,
        }
    }

    /// Point-in-time view for the live stats file
    pub fn snapshot(&self, test_id: &str, running: bool, now: Instant) -> LiveStats {
        let sent = self.sent_count;
        let received = self.received_count;

        let outage_base = self.last_receive_at.unwrap_or(self.anchor);
        let outage_ms = now.duration_since(outage_base).as_secs_f64() * 1000.0;
        let blackout_floor_ms = (self.interval_ms() * 1.5).max(100.0);
        let in_blackout = running && sent > received && outage_ms > blackout_floor_ms;

        let echoed = self.max_reported_receive_count as u64;
        let loss_pct = if sent == 0 {
            0.0
        } else {
            clamp_pct((sent.saturating_sub(received)) as f64 / sent as f64 * 100.0)
        };
        let tx_loss_pct = if sent == 0 {
            0.0
        } else {
            clamp_pct(sent.saturating_sub(echoed) as f64 / sent as f64 * 100.0)
        };
        let rx_loss_pct = if echoed == 0 {
            0.0
        } else {
            clamp_pct(echoed.saturating_sub(received) as f64 / echoed as f64 * 100.0)
        };

        LiveStats {
            test_id: test_id.to_string(),
            status: if running { "running" } else { "stopped" }.to_string(),
            sent,
            received,
            loss_pct,
            tx_loss_pct,
            rx_loss_pct,
            max_blackout_ms: self.max_blackout_ms,
            current_blackout_ms: if in_blackout { outage_ms as u64 } else { 0 },
            avg_rtt_ms: if self.rtt_count == 0 {
                0.0
            } else {
                self.rtt_sum_ms / self.rtt_count as f64
            },
            jitter_ms: self.jitter_ms,
            rate_pps: self.rate_pps,
            duration_s: now.duration_since(self.anchor).as_secs_f64(),
            history: self.history(now, blackout_floor_ms),
        }
    }

    /// Fidelity of the last 100 sent sequences. A missing sequence only
    /// flips to 0 once it is older than the blackout floor, so packets
    /// legitimately in flight stay green.
    fn history(&self, now: Instant, floor_ms: f64) -> Vec<u8> {
        let sent = self.sent_count as u32;
        let start = sent.saturating_sub(100);

        let mut history = Vec::with_capacity(100);
        // Pad to a full bar while the test is young
        for _ in 0..(100 - (sent - start) as usize) {
            history.push(1);
        }
        for seq in start..sent {
            if self.received_seqs.contains(&seq) {
                history.push(1);
            } else if let Some(record) = self.window.get(seq) {
                let age_ms = now.duration_since(record.sent_at).as_secs_f64() * 1000.0;
                history.push(if age_ms > floor_ms { 0 } else { 1 });
            } else {
                history.push(0);
            }
        }
        history
    }
}

fn clamp_pct(v: f64) -> f64 {
    v.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(rate: u32, warmup_ms: u64) -> (SessionMetrics, Instant) {
        let anchor = Instant::now();
        (
            SessionMetrics::new(rate, Duration::from_millis(warmup_ms), anchor),
            anchor,
        )
    }

    /// Send `count` sequences and echo them all back with perfect counters
    fn run_clean(m: &mut SessionMetrics, anchor: Instant, rate: u32, count: u32) {
        let interval = Duration::from_secs_f64(1.0 / rate as f64);
        for seq in 0..count {
            let at = anchor + interval * seq;
            m.record_send(seq, at);
            m.record_echo(seq, m.timestamp_ns(at), seq + 1, at + Duration::from_millis(2));
        }
    }

    #[test]
    fn zero_loss_is_excellent() {
        let (mut m, anchor) = metrics(50, 0);
        run_clean(&mut m, anchor, 50, 200);
        let totals = m.finalize(anchor + Duration::from_secs(4));

        assert_eq!(totals.sent, 200);
        assert_eq!(totals.received, 200);
        assert_eq!(totals.max_blackout_ms, 0);
        assert_eq!(totals.verdict, Verdict::Excellent);
        assert_eq!(totals.tx_loss_pct, 0.0);
        assert_eq!(totals.rx_loss_pct, 0.0);
        assert!(totals.missed.is_empty());
    }

    #[test]
    fn gap_to_blackout_conversion_is_exact() {
        // rate 50pps, 5 missing sequences => 100ms
        let (mut m, anchor) = metrics(50, 0);
        let at = |ms: u64| anchor + Duration::from_millis(ms);

        for seq in 0..10u32 {
            m.record_send(seq, at(seq as u64 * 20));
        }
        m.record_echo(0, 0, 1, at(5));
        // Sequences 1-5 lost, 6 arrives
        m.record_echo(6, 0, 2, at(130));

        let totals = m.finalize(at(200));
        assert_eq!(totals.max_blackout_ms, 100);
        assert_eq!(totals.verdict, Verdict::Good);
    }

    #[test]
    fn warmup_gap_excluded_from_max_but_not_loss() {
        // 5s warmup at 50pps: sequences below 250 are inside warmup.
        // A 3s blackout at t=1s (seqs 50..199) must not raise the max;
        // the same blackout at t=6s (seqs 300..449) must.
        let (mut m, anchor) = metrics(50, 5000);
        let at = |ms: u64| anchor + Duration::from_millis(ms);

        for seq in 0..500u32 {
            m.record_send(seq, at(seq as u64 * 20));
        }
        m.record_echo(49, 0, 50, at(985));
        m.record_echo(200, 0, 51, at(4005)); // gap 50..199 inside warmup
        // Echo the tail so no terminal gap is added
        for seq in 201..500u32 {
            m.record_echo(seq, 0, seq + 1 - 150, at(seq as u64 * 20 + 5));
        }
        let totals_inside = m.finalize(at(10_100));
        assert_eq!(totals_inside.max_blackout_ms, 0);
        assert_eq!(totals_inside.warmup_blackout_ms, 3000);
        assert_eq!(totals_inside.verdict, Verdict::Excellent);
        // The lost sequences still count toward loss
        assert!(totals_inside.rx_loss_pct > 0.0 || totals_inside.tx_loss_pct > 0.0);

        let (mut m2, anchor2) = metrics(50, 5000);
        let at2 = |ms: u64| anchor2 + Duration::from_millis(ms);
        for seq in 0..500u32 {
            m2.record_send(seq, at2(seq as u64 * 20));
        }
        for seq in 0..300u32 {
            m2.record_echo(seq, 0, seq + 1, at2(seq as u64 * 20 + 5));
        }
        // 3s blackout at t=6s: 300..449 lost
        for seq in 450..500u32 {
            m2.record_echo(seq, 0, seq + 1 - 150, at2(seq as u64 * 20 + 5));
        }
        let totals = m2.finalize(at2(10_100));
        assert_eq!(totals.max_blackout_ms, 3000);
        assert_eq!(totals.verdict, Verdict::Degraded);
    }

    #[test]
    fn duplicate_echo_is_idempotent() {
        let (mut m, anchor) = metrics(50, 0);
        let at = anchor + Duration::from_millis(20);

        m.record_send(0, anchor);
        m.record_echo(0, 0, 1, at);
        m.record_echo(0, 0, 1, at + Duration::from_millis(1));
        m.record_echo(0, 0, 1, at + Duration::from_millis(2));

        assert_eq!(m.received_count(), 1);
        assert_eq!(m.last_seen_seq, Some(0));
    }

    #[test]
    fn late_echo_never_rewinds_gap_baseline() {
        let (mut m, anchor) = metrics(50, 0);
        let at = |ms: u64| anchor + Duration::from_millis(ms);

        for seq in 0..20u32 {
            m.record_send(seq, at(seq as u64 * 20));
        }
        m.record_echo(0, 0, 1, at(5));
        m.record_echo(10, 0, 2, at(210)); // gap of 9 detected

        // Sequence 3 arrives late: counted, baseline stays at 10
        m.record_echo(3, 0, 3, at(220));
        assert_eq!(m.last_seen_seq, Some(10));
        assert_eq!(m.received_count(), 3);

        // Remaining tail echoes cleanly
        for seq in 11..20u32 {
            m.record_echo(seq, 0, seq + 1, at(seq as u64 * 20 + 5));
        }
        let totals = m.finalize(at(500));
        // Gap of 9 at 50pps = 180ms, unchanged by the late arrival
        assert_eq!(totals.max_blackout_ms, 180);
    }

    #[test]
    fn total_silence_is_critical_not_clean() {
        let (mut m, anchor) = metrics(50, 1000);
        let at = |ms: u64| anchor + Duration::from_millis(ms);

        for seq in 0..500u32 {
            m.record_send(seq, at(seq as u64 * 20));
        }
        let totals = m.finalize(at(10_200));

        assert_eq!(totals.received, 0);
        assert_eq!(totals.tx_loss_pct, 100.0);
        // 500 lost at 50pps = 10s terminal gap
        assert_eq!(totals.max_blackout_ms, 10_000);
        assert_eq!(totals.verdict, Verdict::Critical);
        assert_eq!(totals.missed.len(), 500);
    }

    #[test]
    fn loss_percentages_always_clamped() {
        // Responder claims more receives than we sent (restart/confusion)
        let (mut m, anchor) = metrics(10, 0);
        m.record_send(0, anchor);
        m.record_echo(0, 0, 5000, anchor + Duration::from_millis(10));
        let totals = m.finalize(anchor + Duration::from_millis(200));

        assert!((0.0..=100.0).contains(&totals.tx_loss_pct));
        assert!((0.0..=100.0).contains(&totals.rx_loss_pct));
    }

    #[test]
    fn e2e_scenario_one_second_rx_gap() {
        // 1000 packets at 50pps; echoes 100-149 dropped (1s RX gap after
        // warmup), responder receives everything. Expect rx ~5%, tx 0%,
        // blackout exactly 1000ms => DEGRADED per the fixed thresholds;
        // one fewer missing echo lands at 980ms => GOOD.
        let (mut m, anchor) = metrics(50, 1000);
        let at = |ms: u64| anchor + Duration::from_millis(ms);

        for seq in 0..1000u32 {
            m.record_send(seq, at(seq as u64 * 20));
        }
        for seq in 0..1000u32 {
            if (100..150).contains(&seq) {
                continue;
            }
            m.record_echo(seq, 0, seq + 1, at(seq as u64 * 20 + 8));
        }
        let totals = m.finalize(at(20_400));

        assert_eq!(totals.sent, 1000);
        assert_eq!(totals.received, 950);
        assert_eq!(totals.echoed, 1000);
        assert_eq!(totals.tx_loss_pct, 0.0);
        assert!((totals.rx_loss_pct - 5.0).abs() < 0.01);
        assert_eq!(totals.max_blackout_ms, 1000);
        assert_eq!(totals.verdict, Verdict::Degraded);

        assert_eq!(Verdict::from_blackout_ms(980), Verdict::Good);
        assert_eq!(Verdict::from_blackout_ms(5000), Verdict::Degraded);
        assert_eq!(Verdict::from_blackout_ms(5001), Verdict::Critical);
    }

    #[test]
    fn rtt_prefers_local_send_record() {
        let (mut m, anchor) = metrics(50, 0);
        let sent_at = anchor + Duration::from_millis(100);
        m.record_send(0, sent_at);

        // Payload timestamp is bogus; the local record wins
        m.record_echo(0, 999_999_999, 1, sent_at + Duration::from_millis(30));
        let totals = m.finalize(anchor + Duration::from_millis(200));
        assert!((totals.avg_latency_ms - 30.0).abs() < 1.0);
    }

    #[test]
    fn history_marks_confirmed_missing_only() {
        let (mut m, anchor) = metrics(50, 0);
        let at = |ms: u64| anchor + Duration::from_millis(ms);

        for seq in 0..10u32 {
            m.record_send(seq, at(seq as u64 * 20));
        }
        for seq in 0..5u32 {
            m.record_echo(seq, 0, seq + 1, at(seq as u64 * 20 + 5));
        }

        // Shortly after the last send: 5..9 unechoed but still in flight
        let snap = m.snapshot("T", true, at(200));
        assert_eq!(snap.history.len(), 100);
        assert!(snap.history.iter().all(|&b| b == 1));

        // Much later: 5..9 are confirmed missing
        let snap = m.snapshot("T", true, at(2000));
        let tail = &snap.history[95..];
        assert!(tail.iter().all(|&b| b == 0));
        assert!(snap.current_blackout_ms > 0);
    }
}
