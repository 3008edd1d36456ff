//! Client-side receive tracker.
//!
//! Blocks only on socket readiness; each echoed packet is a constant-time
//! metrics update, so the loop cannot fall behind at the design rate of
//! 100pps. Garbage and foreign traffic are dropped silently. There is no
//! response timeout here: an echo that never arrives is the condition being
//! measured, not an error.

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::probe::{PacketKind, WirePacket};
use crate::state::SessionMetrics;

/// Maximum consecutive receive errors before the tracker gives up
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

pub struct ReceiveTracker {
    socket: Arc<UdpSocket>,
    test_id: String,
    metrics: Arc<Mutex<SessionMetrics>>,
    cancel: CancellationToken,
}

impl ReceiveTracker {
    pub fn new(
        socket: Arc<UdpSocket>,
        test_id: String,
        metrics: Arc<Mutex<SessionMetrics>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            socket,
            test_id,
            metrics,
            cancel,
        }
    }

    /// Run until cancelled (the controller cancels after the drain grace
    /// window). Returns Err only on persistent socket failure.
    pub async fn run(self) -> Result<()> {
        let mut buf = [0u8; 2048];
        let mut consecutive_errors: u32 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    break;
                }
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, _from)) => {
                            consecutive_errors = 0;

                            let Some(packet) = WirePacket::decode(&buf[..len]) else {
                                continue;
                            };
                            // Only echoes for this session; the test_id check
                            // guards against cross-talk between concurrent
                            // sessions or a stale responder flow
                            if packet.kind != PacketKind::Echo
                                || packet.test_id != self.test_id
                            {
                                continue;
                            }

                            self.metrics.lock().record_echo(
                                packet.sequence,
                                packet.send_timestamp,
                                packet.receive_count,
                                Instant::now(),
                            );
                        }
                        Err(e) => {
                            consecutive_errors += 1;
                            if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                                return Err(anyhow::anyhow!(
                                    "receive tracker stopped: {} consecutive errors (last: {})",
                                    consecutive_errors,
                                    e
                                ));
                            }
                            // Avoid a tight error spin on a broken socket
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
