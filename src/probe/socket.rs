//! Flow socket layer: one UDP socket per probe session.
//!
//! Each session binds its own socket so flows stay distinguishable in
//! external flow logs. The candidate source port is deterministic (derived
//! from the session counter) so operators can predict it; if it is already
//! taken we retry exactly once with a random port from a wide fallback range
//! and report whichever port actually stuck. A second failure is fatal to
//! the session and surfaces synchronously from start().

use anyhow::{Context, Result};
use rand::Rng;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;

/// Base of the deterministic source port window
pub const SOURCE_PORT_BASE: u16 = 52000;
/// Width of the deterministic window (ports wrap back to the base)
pub const SOURCE_PORT_SPAN: u16 = 2000;

/// Fallback range when the deterministic candidate is taken
pub const FALLBACK_PORT_MIN: u16 = 40000;
pub const FALLBACK_PORT_MAX: u16 = 60000;

/// Derive the candidate source port for the nth session of this process
pub fn derive_source_port(session_seq: u64) -> u16 {
    SOURCE_PORT_BASE + (session_seq % SOURCE_PORT_SPAN as u64) as u16
}

/// Create a non-blocking UDP socket bound to the given source port,
/// matching the target's IP family
fn bind_udp(ipv6: bool, src_port: u16) -> Result<Socket> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;

    let bind_addr = if ipv6 {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), src_port)
    } else {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), src_port)
    };
    socket.bind(&SockAddr::from(bind_addr))?;

    Ok(socket)
}

/// Bind the session's flow socket.
///
/// Tries the candidate port, then exactly one random fallback from
/// 40000-60000. Returns the async socket and the port actually bound.
pub fn bind_flow_socket(ipv6: bool, candidate: u16) -> Result<(UdpSocket, u16)> {
    let (socket, port) = match bind_udp(ipv6, candidate) {
        Ok(socket) => (socket, candidate),
        Err(first_err) => {
            let fallback = rand::thread_rng().gen_range(FALLBACK_PORT_MIN..FALLBACK_PORT_MAX);
            let socket = bind_udp(ipv6, fallback).with_context(|| {
                format!(
                    "failed to bind source port {} ({}) and fallback {}",
                    candidate, first_err, fallback
                )
            })?;
            (socket, fallback)
        }
    };

    let socket = UdpSocket::from_std(socket.into())
        .context("failed to register flow socket with the runtime")?;
    Ok((socket, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ports_stay_in_window() {
        for seq in [0u64, 1, 1999, 2000, 123_456_789] {
            let port = derive_source_port(seq);
            assert!((SOURCE_PORT_BASE..SOURCE_PORT_BASE + SOURCE_PORT_SPAN).contains(&port));
        }
        assert_eq!(derive_source_port(0), derive_source_port(2000));
    }

    #[tokio::test]
    async fn fallback_port_is_reported_accurately() {
        // Occupy a port, then ask for the same one; the layer must fall back
        // and report the port it actually got.
        let holder = bind_udp(false, 0).unwrap();
        let held_port = holder.local_addr().unwrap().as_socket().unwrap().port();

        let (socket, bound_port) = bind_flow_socket(false, held_port).unwrap();
        assert_ne!(bound_port, held_port);
        assert!((FALLBACK_PORT_MIN..FALLBACK_PORT_MAX).contains(&bound_port));
        assert_eq!(socket.local_addr().unwrap().port(), bound_port);
    }

    #[tokio::test]
    async fn deterministic_port_used_when_free() {
        let candidate = derive_source_port(1500);
        if let Ok((socket, bound_port)) = bind_flow_socket(false, candidate) {
            assert_eq!(bound_port, candidate);
            assert_eq!(socket.local_addr().unwrap().port(), candidate);
        }
        // If another process holds the candidate the fallback path is
        // exercised instead, which is covered above.
    }
}
