//! Command-line configuration.
//!
//! Every flag except `--verbose` can also be set through an `IPKEEP_*`
//! environment variable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use ipkeep_networking::SubnetSet;

use crate::proxy::{DialConfig, RelayConfig};

/// Which listener to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// ipkeep - relay PROXY protocol connections while keeping the client address.
#[derive(Debug, Clone, Parser)]
#[command(name = "ipkeep")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Protocol to listen on.
    #[arg(short, long, value_enum, default_value = "tcp", env = "IPKEEP_PROTOCOL")]
    pub protocol: Protocol,

    /// Address the proxy listens on.
    #[arg(short, long, default_value = "0.0.0.0:8443", env = "IPKEEP_LISTEN_ADDR")]
    pub listen_addr: SocketAddr,

    /// Upstream address for IPv4 clients.
    #[arg(short = '4', long, default_value = "127.0.0.1:443", env = "IPKEEP_TARGET_ADDR4")]
    pub target_addr4: SocketAddr,

    /// Upstream address for IPv6 clients.
    #[arg(short = '6', long, default_value = "[::1]:443", env = "IPKEEP_TARGET_ADDR6")]
    pub target_addr6: SocketAddr,

    /// Routing mark for upstream sockets (0 leaves it unset).
    #[arg(long, default_value_t = 0, env = "IPKEEP_MARK")]
    pub mark: u32,

    /// Increase verbosity (-v debug, -vv per-connection steps).
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// File of CIDRs allowed to send PROXY headers; all origins when unset.
    #[arg(long, env = "IPKEEP_ALLOWED_SUBNETS")]
    pub allowed_subnets: Option<PathBuf>,

    /// Seconds of inactivity before a UDP flow is closed.
    #[arg(long, default_value_t = 60, env = "IPKEEP_CLOSE_AFTER")]
    pub close_after: u64,

    /// Seconds allowed for the PROXY header to arrive (0 disables).
    #[arg(long, default_value_t = 10, env = "IPKEEP_HEADER_TIMEOUT")]
    pub header_timeout: u64,

    /// Seconds of read inactivity before a TCP relay is closed (0 disables).
    #[arg(long, default_value_t = 0, env = "IPKEEP_IDLE_TIMEOUT")]
    pub idle_timeout: u64,

    /// Log output format.
    #[arg(long, value_enum, default_value = "json", env = "IPKEEP_LOG_FORMAT")]
    pub log_format: LogFormat,
}

impl Cli {
    /// Check values that clap cannot check on its own.
    pub fn validate(&self) -> Result<()> {
        if !self.target_addr4.is_ipv4() {
            bail!("--target-addr4 must be an IPv4 address, got {}", self.target_addr4);
        }
        if !self.target_addr6.is_ipv6() {
            bail!("--target-addr6 must be an IPv6 address, got {}", self.target_addr6);
        }
        if self.close_after == 0 {
            bail!("--close-after must be greater than 0");
        }
        Ok(())
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            target_addr4: self.target_addr4,
            target_addr6: self.target_addr6,
            verbose: self.verbose,
            header_timeout: seconds(self.header_timeout),
            idle_timeout: seconds(self.idle_timeout),
            udp_close_after: Duration::from_secs(self.close_after),
        }
    }

    pub fn dial_config(&self) -> DialConfig {
        DialConfig { mark: self.mark }
    }

    /// Load the allowed subnets, or allow everything when no file is given.
    pub fn load_subnets(&self) -> Result<SubnetSet> {
        match &self.allowed_subnets {
            Some(path) => SubnetSet::load(path)
                .with_context(|| format!("failed to load allowed subnets from {}", path.display())),
            None => Ok(SubnetSet::allow_all()),
        }
    }

    /// Default log filter when `RUST_LOG` is not set.
    pub fn log_level(&self) -> &'static str {
        if self.verbose == 0 {
            "info"
        } else {
            "debug"
        }
    }
}

/// 0 means disabled.
fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
