//! Fixed-rate probe sender.
//!
//! Strictly time-driven: one packet per interval tick, independent of
//! whether any echo has arrived. Loss is detected entirely on the receive
//! side, so the sender never waits on anything but its timer. A failed
//! send counts as a dropped packet and is not retried; retrying would
//! perturb the cadence the gap analysis depends on.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::probe::WirePacket;
use crate::state::SessionMetrics;

pub struct ProbeSender {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    test_id: String,
    rate_pps: u32,
    /// Sender exits on its own once the deadline passes (None = until stopped)
    deadline: Option<Instant>,
    metrics: Arc<Mutex<SessionMetrics>>,
    cancel: CancellationToken,
    /// Fired after the first packet leaves, so the controller can flip the
    /// session to RUNNING
    first_send: Option<oneshot::Sender<()>>,
}

impl ProbeSender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        socket: Arc<UdpSocket>,
        target: SocketAddr,
        test_id: String,
        rate_pps: u32,
        deadline: Option<Instant>,
        metrics: Arc<Mutex<SessionMetrics>>,
        cancel: CancellationToken,
        first_send: oneshot::Sender<()>,
    ) -> Self {
        Self {
            socket,
            target,
            test_id,
            rate_pps,
            deadline,
            metrics,
            cancel,
            first_send: Some(first_send),
        }
    }

    /// Run the send loop until the deadline passes or the session is stopped.
    /// All counters live in the shared metrics, so there is nothing to return.
    pub async fn run(mut self) {
        let interval = std::time::Duration::from_secs_f64(1.0 / self.rate_pps as f64);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut sequence: u32 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    break;
                }
                _ = ticker.tick() => {
                    if let Some(deadline) = self.deadline {
                        if Instant::now() >= deadline {
                            break;
                        }
                    }

                    let now = Instant::now();
                    let payload = {
                        let metrics = self.metrics.lock();
                        WirePacket::probe(sequence, metrics.timestamp_ns(now), &self.test_id)
                            .encode()
                    };

                    // try_send_to keeps the loop non-blocking; a full socket
                    // buffer (EAGAIN) is just a lost packet
                    match self.socket.try_send_to(&payload, self.target) {
                        Ok(_) => {
                            self.metrics.lock().record_send(sequence, now);
                            if let Some(tx) = self.first_send.take() {
                                let _ = tx.send(());
                            }
                        }
                        Err(_) => {
                            self.metrics.lock().record_send_error(sequence, now);
                        }
                    }

                    sequence = sequence.wrapping_add(1);
                }
            }
        }
    }
}
