use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::time::Duration;

/// UDP convergence probing for SD-WAN failover labs: blackout detection and
/// directional loss measurement between a probe client and an echo responder
#[derive(Parser, Debug, Clone)]
#[command(name = "convlab")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run probe sessions against one or more echo responders
    Probe(ProbeArgs),
    /// Run the echo responder service
    Echo(EchoArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    /// Target hosts to probe (IP address or hostname)
    #[arg(required = true)]
    pub targets: Vec<String>,

    /// Destination UDP port on the responder
    #[arg(short = 'p', long = "port", default_value = "6200")]
    pub port: u16,

    /// Probe rate in packets per second
    #[arg(short = 'r', long = "rate", default_value = "50")]
    pub rate: u32,

    /// Test duration in seconds (0 = run until Ctrl-C)
    #[arg(short = 'd', long = "duration", default_value = "20")]
    pub duration: f64,

    /// Warmup window in milliseconds (gaps inside it don't count as blackout)
    #[arg(long = "warmup-ms", default_value = "5000")]
    pub warmup_ms: u64,

    /// Echo drain window after the sender stops, in milliseconds
    #[arg(long = "grace-ms", default_value = "200")]
    pub grace_ms: u64,

    /// Requested source port (falls back to a random 40000-60000 port if taken)
    #[arg(long = "source-port")]
    pub source_port: Option<u16>,

    /// Human label attached to the test id in logs and results
    #[arg(short = 'l', long = "label")]
    pub label: Option<String>,

    /// Append-only JSONL file for finalized results
    #[arg(long = "results-file", default_value = "convergence_results.jsonl")]
    pub results_file: String,

    /// Write a live stats snapshot to this path every 200ms
    #[arg(long = "stats-file")]
    pub stats_file: Option<String>,

    /// Print finalized results as JSON instead of a text summary
    #[arg(long = "json")]
    pub json: bool,

    /// Force IPv4 resolution
    #[arg(short = '4', long = "ipv4")]
    pub ipv4: bool,

    /// Force IPv6 resolution
    #[arg(short = '6', long = "ipv6")]
    pub ipv6: bool,
}

impl ProbeArgs {
    /// Session duration, None when 0 (run until stopped)
    pub fn duration_opt(&self) -> Option<Duration> {
        if self.duration <= 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(self.duration))
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ipv4 && self.ipv6 {
            return Err("cannot force both IPv4 and IPv6".to_string());
        }
        if self.duration < 0.0 {
            return Err("duration cannot be negative".to_string());
        }
        Ok(())
    }
}

#[derive(Args, Debug, Clone)]
pub struct EchoArgs {
    /// IP address to listen on
    #[arg(long = "ip", default_value = "0.0.0.0")]
    pub ip: IpAddr,

    /// UDP ports to answer on
    #[arg(long = "ports", value_delimiter = ',', default_value = "6100,6200")]
    pub ports: Vec<u16>,

    /// Seconds of silence before a flow is retired
    #[arg(long = "idle-timeout", default_value = "5")]
    pub idle_timeout: f64,
}
