use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::{EchoArgs, ProbeArgs};

/// Packet rates outside this range defeat the gap-detection granularity,
/// so they are rejected up front rather than clamped.
pub const MIN_RATE_PPS: u32 = 1;
pub const MAX_RATE_PPS: u32 = 100;

/// Default UDP port the echo responder answers on
pub const DEFAULT_TARGET_PORT: u16 = 6200;

/// Runtime configuration for a single probe session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Destination of the UDP probe stream
    pub target: SocketAddr,
    /// Packets per second (1-100)
    pub rate_pps: u32,
    /// Session length (None = run until stopped)
    #[serde(with = "opt_duration_serde")]
    pub duration: Option<Duration>,
    /// Gaps inside this window are excluded from the blackout maximum
    #[serde(with = "duration_serde")]
    pub warmup: Duration,
    /// Echo drain window after the sender stops
    #[serde(with = "duration_serde")]
    pub grace: Duration,
    /// Requested source port (None = derive from the session counter)
    pub source_port: Option<u16>,
    /// Human label carried alongside the test id in logs and results
    pub label: Option<String>,
    /// Path for 200ms live stats snapshots (None = disabled)
    pub stats_file: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_TARGET_PORT),
            rate_pps: 50,
            duration: Some(Duration::from_secs(20)),
            warmup: Duration::from_millis(5000),
            grace: Duration::from_millis(200),
            source_port: None,
            label: None,
            stats_file: None,
        }
    }
}

impl SessionConfig {
    /// Build a session config from probe CLI args for one resolved target
    pub fn for_target(args: &ProbeArgs, target: SocketAddr) -> Self {
        Self {
            target,
            rate_pps: args.rate,
            duration: args.duration_opt(),
            warmup: Duration::from_millis(args.warmup_ms),
            grace: Duration::from_millis(args.grace_ms),
            source_port: args.source_port,
            label: args.label.clone(),
            stats_file: args.stats_file.clone().map(PathBuf::from),
        }
    }

    /// Interval between probes at the configured rate
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_pps as f64)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_RATE_PPS..=MAX_RATE_PPS).contains(&self.rate_pps) {
            bail!(
                "rate must be between {} and {} pps (got {})",
                MIN_RATE_PPS,
                MAX_RATE_PPS,
                self.rate_pps
            );
        }
        if let Some(d) = self.duration {
            if d.is_zero() {
                bail!("duration must be positive (omit it to run until stopped)");
            }
        }
        Ok(())
    }
}

/// Runtime configuration for the echo responder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoConfig {
    /// Address to listen on
    pub listen_ip: IpAddr,
    /// UDP ports to answer on
    pub ports: Vec<u16>,
    /// Flows with no packets for this long are retired
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ports: vec![6100, 6200],
            idle_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&EchoArgs> for EchoConfig {
    fn from(args: &EchoArgs) -> Self {
        Self {
            listen_ip: args.ip,
            ports: args.ports.clone(),
            idle_timeout: Duration::from_secs_f64(args.idle_timeout),
        }
    }
}

impl EchoConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            bail!("at least one listen port is required");
        }
        if self.idle_timeout.is_zero() {
            bail!("idle timeout must be positive");
        }
        Ok(())
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Serde helper for Option<Duration>
mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}
