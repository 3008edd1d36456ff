//! Echo responder: a dumb per-flow reflector plus counter.
//!
//! Each inbound probe bumps the flow's receive counter and is echoed back
//! with that counter attached, which is all the client needs to split loss
//! into TX and RX legs. The responder does no gap analysis and keeps no
//! state beyond the flow table, so it scales horizontally and a restart
//! only degrades TX-loss accounting for sessions in flight, never the
//! client's RX accounting.
//!
//! Flow lifecycle: UNSEEN -> ACTIVE on first packet, refreshed on every
//! packet, RETIRED by the reaper after the idle timeout.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::config::EchoConfig;
use crate::probe::{PacketKind, WirePacket};

/// One observed remote flow, keyed by the client's source address
#[derive(Debug, Clone)]
pub struct FlowState {
    pub test_id: String,
    pub receive_count: u32,
    pub first_seen: Instant,
    pub last_seen: Instant,
    /// Listen port the flow arrived on, for logging only
    pub local_port: u16,
}

/// Shard count for the flow table
const FLOW_SHARDS: usize = 16;

/// Flow table hash-sharded by source address. Each inbound packet takes one
/// shard's write lock, so flows on different shards never serialize.
pub struct FlowTable {
    shards: Vec<RwLock<HashMap<SocketAddr, FlowState>>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self {
            shards: (0..FLOW_SHARDS)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, src: &SocketAddr) -> &RwLock<HashMap<SocketAddr, FlowState>> {
        let mut hasher = DefaultHasher::new();
        src.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % FLOW_SHARDS]
    }

    /// Bump the flow's receive counter, creating the flow on its first
    /// packet. Returns the new count and whether the flow is new.
    pub fn record(
        &self,
        src: SocketAddr,
        test_id: &str,
        local_port: u16,
        now: Instant,
    ) -> (u32, bool) {
        let mut shard = self.shard(&src).write();
        let entry = shard.entry(src).or_insert_with(|| FlowState {
            test_id: test_id.to_string(),
            receive_count: 0,
            first_seen: now,
            last_seen: now,
            local_port,
        });
        let is_new = entry.receive_count == 0;
        entry.receive_count += 1;
        entry.last_seen = now;
        (entry.receive_count, is_new)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    /// Remove and return flows idle past the timeout
    pub fn retire_idle(&self, now: Instant, idle_timeout: Duration) -> Vec<(SocketAddr, FlowState)> {
        let mut retired = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.write();
            shard.retain(|addr, flow| {
                if now.duration_since(flow.last_seen) > idle_timeout {
                    retired.push((*addr, flow.clone()));
                    false
                } else {
                    true
                }
            });
        }
        retired
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EchoResponder {
    sockets: Vec<Arc<UdpSocket>>,
    flows: Arc<FlowTable>,
    idle_timeout: Duration,
    cancel: CancellationToken,
}

impl EchoResponder {
    /// Bind all listen ports up front so startup failures are immediate
    pub async fn bind(config: &EchoConfig, cancel: CancellationToken) -> Result<Self> {
        config.validate()?;

        let mut sockets = Vec::with_capacity(config.ports.len());
        for port in &config.ports {
            let addr = SocketAddr::new(config.listen_ip, *port);
            let socket = UdpSocket::bind(addr)
                .await
                .with_context(|| format!("failed to bind echo listener on {}", addr))?;
            sockets.push(Arc::new(socket));
        }

        Ok(Self {
            sockets,
            flows: Arc::new(FlowTable::new()),
            idle_timeout: config.idle_timeout,
            cancel,
        })
    }

    /// Addresses actually bound (relevant when a port 0 was requested)
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.sockets
            .iter()
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    /// Shared view of the flow table
    pub fn flows(&self) -> Arc<FlowTable> {
        self.flows.clone()
    }

    /// Run the per-port echo loops and the idle reaper until cancelled
    pub async fn run(self) -> Result<()> {
        let mut handles = Vec::with_capacity(self.sockets.len() + 1);

        for socket in &self.sockets {
            if let Ok(addr) = socket.local_addr() {
                println!("[SYSTEM] listening on {}", addr);
            }
            handles.push(tokio::spawn(port_loop(
                socket.clone(),
                self.flows.clone(),
                self.cancel.clone(),
            )));
        }
        handles.push(tokio::spawn(reaper(
            self.flows.clone(),
            self.idle_timeout,
            self.cancel.clone(),
        )));

        for handle in handles {
            handle.await?;
        }
        Ok(())
    }
}

async fn port_loop(socket: Arc<UdpSocket>, flows: Arc<FlowTable>, cancel: CancellationToken) {
    let local_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
    let mut buf = [0u8; 2048];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                let (len, src) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        eprintln!("[SYSTEM] receive error on port {}: {}", local_port, e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                };

                // Garbage or echoes looped back to us: drop silently
                let Some(packet) = WirePacket::decode(&buf[..len]) else {
                    continue;
                };
                if packet.kind != PacketKind::Probe {
                    continue;
                }

                let now = Instant::now();
                let (count, is_new) = flows.record(src, &packet.test_id, local_port, now);

                if is_new {
                    println!(
                        "[{}] RECEIVED ON PORT {}: {}",
                        packet.test_id, local_port, src
                    );
                }

                let echo = packet.into_echo(count).encode();
                if let Err(e) = socket.send_to(&echo, src).await {
                    eprintln!("[SYSTEM] echo send to {} failed: {}", src, e);
                }
            }
        }
    }
}

/// Retire flows that have gone quiet for longer than the idle timeout
async fn reaper(flows: Arc<FlowTable>, idle_timeout: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let retired = flows.retire_idle(Instant::now(), idle_timeout);

                for (addr, flow) in retired {
                    let active = flow
                        .last_seen
                        .duration_since(flow.first_seen)
                        .as_secs_f64();
                    println!(
                        "[{}] COMPLETED ON PORT {}: {} | duration: {:.1}s | packets: {}",
                        flow.test_id, flow.local_port, addr, active, flow.receive_count
                    );
                }
            }
        }
    }
}
