//! Integration tests for the probe->echo->analyze pipeline over loopback.
//!
//! These run real sessions against a real (or deliberately lossy) responder
//! on 127.0.0.1, so they cover the socket layer, wire protocol, lifecycle,
//! and analyzer together without needing any network privileges.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use convlab::config::{EchoConfig, SessionConfig};
use convlab::echo::EchoResponder;
use convlab::probe::{PacketKind, WirePacket, FALLBACK_PORT_MAX, FALLBACK_PORT_MIN};
use convlab::session::{SessionRegistry, SessionState};
use convlab::state::Verdict;

/// Spin up a clean responder on an ephemeral loopback port
async fn start_responder() -> (std::net::SocketAddr, CancellationToken) {
    let cancel = CancellationToken::new();
    let config = EchoConfig {
        listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        ports: vec![0],
        idle_timeout: Duration::from_secs(5),
    };
    let responder = EchoResponder::bind(&config, cancel.clone()).await.unwrap();
    let addr = responder.local_addrs()[0];
    tokio::spawn(responder.run());
    (addr, cancel)
}

/// A responder that counts every probe but refuses to echo a sequence range,
/// simulating an RX-direction blackout
async fn start_lossy_responder(drop: std::ops::Range<u32>) -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        let mut count: u32 = 0;
        loop {
            let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let Some(packet) = WirePacket::decode(&buf[..len]) else {
                continue;
            };
            if packet.kind != PacketKind::Probe {
                continue;
            }
            count += 1;
            if drop.contains(&packet.sequence) {
                continue;
            }
            let _ = socket.send_to(&packet.into_echo(count).encode(), src).await;
        }
    });

    addr
}

fn session_config(target: std::net::SocketAddr, rate: u32, duration: Option<Duration>) -> SessionConfig {
    SessionConfig {
        target,
        rate_pps: rate,
        duration,
        warmup: Duration::ZERO,
        ..Default::default()
    }
}

#[tokio::test]
async fn clean_loopback_run_is_excellent() {
    let (target, cancel) = start_responder().await;
    let registry = SessionRegistry::new(None);

    let config = session_config(target, 20, Some(Duration::from_secs(1)));
    let info = registry.start(config).unwrap();
    let result = registry.wait(&info.test_id).await.unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert!(result.error.is_none());
    assert!(result.sent_count > 0);
    assert_eq!(result.received_count, result.sent_count);
    assert_eq!(result.echoed_count, result.sent_count);
    assert_eq!(result.tx_loss_pct, 0.0);
    assert_eq!(result.rx_loss_pct, 0.0);
    assert_eq!(result.max_blackout_ms, 0);
    assert_eq!(result.verdict, Verdict::Excellent);

    cancel.cancel();
}

#[tokio::test]
async fn rx_drop_window_produces_exact_blackout() {
    // Echoes for sequences 5..10 dropped at 20pps: a 5-packet gap is a
    // 250ms blackout, detected when sequence 10 arrives
    let target = start_lossy_responder(5..10).await;
    let registry = SessionRegistry::new(None);

    let config = session_config(target, 20, Some(Duration::from_secs(1)));
    let info = registry.start(config).unwrap();
    let result = registry.wait(&info.test_id).await.unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert_eq!(result.tx_loss_pct, 0.0);
    assert!(result.rx_loss_pct > 0.0);
    assert_eq!(result.received_count, result.sent_count - 5);
    assert_eq!(result.max_blackout_ms, 250);
    assert_eq!(result.verdict, Verdict::Good);
}

#[tokio::test]
async fn total_silence_is_a_measurement_not_an_error() {
    // Target never answers: 100% TX loss is a valid, completed result
    let black_hole = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = black_hole.local_addr().unwrap();

    let registry = SessionRegistry::new(None);
    let config = session_config(target, 20, Some(Duration::from_secs(1)));
    let info = registry.start(config).unwrap();
    let result = registry.wait(&info.test_id).await.unwrap();

    assert_eq!(result.state, SessionState::Completed);
    assert!(result.error.is_none());
    assert_eq!(result.received_count, 0);
    assert_eq!(result.tx_loss_pct, 100.0);
    // The whole session is one terminal gap
    assert!(result.max_blackout_ms >= 900);
    assert!(result.verdict != Verdict::Excellent);
}

#[tokio::test]
async fn concurrent_sessions_do_not_share_counters() {
    let (target, cancel) = start_responder().await;
    let registry = SessionRegistry::new(None);

    let a = registry
        .start(session_config(target, 20, None))
        .unwrap();
    let b = registry
        .start(session_config(target, 20, None))
        .unwrap();

    assert_ne!(a.test_id, b.test_id);
    assert_ne!(a.source_port, b.source_port);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let result_a = registry.stop(&a.test_id).await.unwrap();

    // B keeps running and accumulating after A is gone
    assert_eq!(registry.active_ids(), vec![b.test_id.clone()]);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let result_b = registry.stop(&b.test_id).await.unwrap();

    assert_eq!(result_a.state, SessionState::Completed);
    assert_eq!(result_b.state, SessionState::Completed);
    assert!(result_b.sent_count > result_a.sent_count);
    assert_eq!(result_a.rx_loss_pct, 0.0);
    assert_eq!(result_b.rx_loss_pct, 0.0);

    cancel.cancel();
}

#[tokio::test]
async fn requested_port_conflict_falls_back_and_reports_truthfully() {
    let (target, cancel) = start_responder().await;

    // Occupy a port, then ask a session for exactly that port
    let holder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let held_port = holder.local_addr().unwrap().port();

    let registry = SessionRegistry::new(None);
    let mut config = session_config(target, 10, Some(Duration::from_millis(300)));
    config.source_port = Some(held_port);

    let info = registry.start(config).unwrap();
    assert_ne!(info.source_port, held_port);
    assert!((FALLBACK_PORT_MIN..FALLBACK_PORT_MAX).contains(&info.source_port));

    let result = registry.wait(&info.test_id).await.unwrap();
    assert_eq!(result.source_port, info.source_port);

    cancel.cancel();
}

#[tokio::test]
async fn stopping_unknown_session_is_an_error() {
    let registry = SessionRegistry::new(None);
    assert!(registry.stop("CONV-999").await.is_err());
    assert!(registry.is_empty());
}
