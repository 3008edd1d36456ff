//! Session controller: owns the ProbeSession lifecycle from bind to the
//! finalized result record.
//!
//! One controller per session; concurrent sessions share nothing but the
//! registry that tracks them. The controller binds the flow socket, runs
//! the sender and tracker as separate tasks over shared metrics, and on
//! stop (explicit or duration expiry) halts the sender first, drains
//! in-flight echoes for a short grace window, then finalizes.

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::export::{write_live_stats, ResultWriter, TestResult};
use crate::probe::bind_flow_socket;
use crate::session::{ProbeSession, SessionState};
use crate::state::{SessionMetrics, Totals};

use super::sender::ProbeSender;
use super::tracker::ReceiveTracker;

pub struct SessionController {
    session: ProbeSession,
    config: SessionConfig,
    socket: Arc<UdpSocket>,
    metrics: Arc<Mutex<SessionMetrics>>,
    cancel: CancellationToken,
    results: Option<Arc<ResultWriter>>,
}

impl SessionController {
    /// Bind the flow socket and prepare the session. Bind failure (after the
    /// one-shot fallback) is fatal and surfaces here, synchronously.
    pub fn new(
        test_id: String,
        config: SessionConfig,
        candidate_port: u16,
        cancel: CancellationToken,
        results: Option<Arc<ResultWriter>>,
    ) -> Result<Self> {
        config.validate()?;

        let (socket, source_port) = bind_flow_socket(config.target.is_ipv6(), candidate_port)
            .with_context(|| format!("[{}] session failed to bind a flow socket", test_id))?;

        let anchor = Instant::now();
        let session = ProbeSession {
            test_id,
            label: config.label.clone(),
            target: config.target,
            source_port,
            rate_pps: config.rate_pps,
            warmup: config.warmup,
            started_at: Utc::now(),
            anchor,
            state: SessionState::Pending,
        };
        let metrics = Arc::new(Mutex::new(SessionMetrics::new(
            config.rate_pps,
            config.warmup,
            anchor,
        )));

        Ok(Self {
            session,
            config,
            socket: Arc::new(socket),
            metrics,
            cancel,
            results,
        })
    }

    /// The port actually bound (candidate or fallback)
    pub fn source_port(&self) -> u16 {
        self.session.source_port
    }

    /// Run the session to completion and emit the result record
    pub async fn run(mut self) -> TestResult {
        let id = self.session.test_id.clone();
        let label = self
            .session
            .label
            .clone()
            .unwrap_or_else(|| "Convergence".to_string());

        println!(
            "[{}] {} - CONVERGENCE STARTED: {} | rate: {}pps",
            id, label, self.session.target, self.session.rate_pps
        );
        println!("[{}] source port: {}", id, self.session.source_port);

        let deadline = self.config.duration.map(|d| self.session.anchor + d);
        let (first_tx, mut first_rx) = oneshot::channel();

        // The tracker outlives the sender by the grace window, so it gets
        // its own token
        let tracker_cancel = CancellationToken::new();
        let tracker = ReceiveTracker::new(
            self.socket.clone(),
            id.clone(),
            self.metrics.clone(),
            tracker_cancel.clone(),
        );
        let tracker_handle = tokio::spawn(tracker.run());

        let sender = ProbeSender::new(
            self.socket.clone(),
            self.session.target,
            id.clone(),
            self.session.rate_pps,
            deadline,
            self.metrics.clone(),
            self.cancel.clone(),
            first_tx,
        );
        let mut sender_handle = tokio::spawn(sender.run());

        let stats_handle = self.config.stats_file.clone().map(|path| {
            let metrics = self.metrics.clone();
            let test_id = id.clone();
            let token = tracker_cancel.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(200));
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let stats = metrics.lock().snapshot(&test_id, true, Instant::now());
                            if let Err(e) = write_live_stats(&path, &stats) {
                                eprintln!("[{}] stats write failed: {}", test_id, e);
                            }
                        }
                    }
                }
            })
        });

        // PENDING -> RUNNING once the first packet has actually left
        let mut sender_result = None;
        tokio::select! {
            res = &mut sender_handle => {
                sender_result = Some(res);
            }
            first = &mut first_rx => {
                if first.is_ok() {
                    self.session.state = SessionState::Running;
                }
            }
        }
        if sender_result.is_none() {
            sender_result = Some((&mut sender_handle).await);
        }
        if let Some(Err(e)) = &sender_result {
            eprintln!("[{}] sender task failed: {}", id, e);
        }

        // Sender is down; drain echoes still in flight before closing out
        self.session.state = SessionState::Stopping;
        tokio::time::sleep(self.config.grace).await;
        tracker_cancel.cancel();

        let tracker_result = tracker_handle.await;
        if let Some(handle) = stats_handle {
            let _ = handle.await;
        }

        let ended = Instant::now();
        let totals = self.metrics.lock().finalize(ended);

        let error = match tracker_result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(format!("tracker task panicked: {}", e)),
        };
        self.session.state = if error.is_some() {
            SessionState::Failed
        } else {
            SessionState::Completed
        };

        let result = TestResult::from_totals(&self.session, &totals, error);

        if let Some(ref writer) = self.results {
            if let Err(e) = writer.append(&result) {
                eprintln!("[{}] failed to append result record: {}", id, e);
            }
        }
        if let Some(ref path) = self.config.stats_file {
            let stats = self.metrics.lock().snapshot(&id, false, ended);
            if let Err(e) = write_live_stats(path, &stats) {
                eprintln!("[{}] final stats write failed: {}", id, e);
            }
        }

        self.print_summary(&label, &totals, &result);
        result
    }

    fn print_summary(&self, label: &str, totals: &Totals, result: &TestResult) {
        let id = &self.session.test_id;
        println!("[{}] {} - CONVERGENCE STOPPED:", id, label);
        println!(
            "[{}]     duration: {:.1}s | rate: {}pps | state: {:?}",
            id, totals.duration_s, self.session.rate_pps, self.session.state
        );
        println!(
            "[{}]     tx sent: {} | reached responder: {} | rx rcvd: {}",
            id, totals.sent, totals.echoed, totals.received
        );
        println!(
            "[{}]     tx loss: {:.1}% | rx loss: {:.1}%",
            id, result.tx_loss_pct, result.rx_loss_pct
        );
        println!(
            "[{}]     max blackout: {}ms | verdict: {}",
            id, totals.max_blackout_ms, totals.verdict
        );
        println!("[{}]     missed seqs: {}", id, format_missed(&totals.missed));
    }
}

/// Compact rendering of the missed-sequence list; long runs are elided
fn format_missed(missed: &[u32]) -> String {
    if missed.is_empty() {
        return "none".to_string();
    }
    let join = |seqs: &[u32]| {
        seqs.iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    if missed.len() > 50 {
        format!(
            "[{} ... {}] (total: {})",
            join(&missed[..25]),
            join(&missed[missed.len() - 25..]),
            missed.len()
        )
    } else {
        format!("[{}]", join(missed))
    }
}
