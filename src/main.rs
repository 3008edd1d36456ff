use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use tokio_util::sync::CancellationToken;

use convlab::cli::{Cli, Command, EchoArgs, ProbeArgs};
use convlab::config::{EchoConfig, SessionConfig};
use convlab::echo::EchoResponder;
use convlab::export::ResultWriter;
use convlab::session::SessionRegistry;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Probe(args) => run_probe(args).await,
        Command::Echo(args) => run_echo(args).await,
    }
}

async fn run_probe(args: ProbeArgs) -> Result<()> {
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Resolve every target up front; duplicates get their own sessions on
    // purpose (distinct sockets probing the same responder are distinct flows)
    let mut targets: Vec<SocketAddr> = Vec::new();
    for target_str in &args.targets {
        let addr = resolve_target(target_str, args.port, args.ipv4, args.ipv6)
            .with_context(|| format!("failed to resolve target: {}", target_str))?;
        targets.push(addr);
    }

    let registry = SessionRegistry::new(Some(ResultWriter::new(&args.results_file)));

    let mut started = Vec::new();
    for target in targets {
        let config = SessionConfig::for_target(&args, target);
        let info = registry.start(config)?;
        started.push(info);
    }

    // Ctrl-C stops every session cooperatively; duration expiry is handled
    // inside each session
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            shutdown.cancel();
        });
    }

    let registry = std::sync::Arc::new(registry);
    {
        let registry = registry.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            registry.shutdown();
        });
    }

    let mut failures = 0usize;
    for info in started {
        let result = registry.wait(&info.test_id).await?;
        if result.error.is_some() {
            failures += 1;
        }
        if args.json {
            println!("{}", serde_json::to_string(&result)?);
        }
    }

    if failures > 0 {
        anyhow::bail!("{} session(s) failed", failures);
    }
    Ok(())
}

async fn run_echo(args: EchoArgs) -> Result<()> {
    let config = EchoConfig::from(&args);
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            cancel.cancel();
        });
    }

    println!("[SYSTEM] convergence echo responder starting");
    let responder = EchoResponder::bind(&config, cancel).await?;
    responder.run().await
}

/// Resolve a target host to a socket address, preferring IPv4 unless told
/// otherwise
fn resolve_target(target: &str, port: u16, force_ipv4: bool, force_ipv6: bool) -> Result<SocketAddr> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    let addrs: Vec<IpAddr> = format!("{}:{}", target, port)
        .to_socket_addrs()?
        .map(|s| s.ip())
        .collect();

    let filtered: Vec<IpAddr> = addrs
        .iter()
        .filter(|ip| {
            if force_ipv4 {
                ip.is_ipv4()
            } else if force_ipv6 {
                ip.is_ipv6()
            } else {
                true
            }
        })
        .cloned()
        .collect();

    if filtered.is_empty() {
        anyhow::bail!(
            "no {} addresses found for {}",
            if force_ipv4 { "IPv4" } else if force_ipv6 { "IPv6" } else { "usable" },
            target
        );
    }

    // Prefer IPv4 when there is no explicit preference
    let ip = if !force_ipv6 {
        filtered
            .iter()
            .find(|ip| ip.is_ipv4())
            .copied()
            .unwrap_or(filtered[0])
    } else {
        filtered[0]
    };

    Ok(SocketAddr::new(ip, port))
}
