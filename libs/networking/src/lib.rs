//! Networking utilities for the relay.
//!
//! This library provides helpers for:
//! - CIDR prefixes for IPv4 and IPv6
//! - The allowed-subnet set used for origin admission
//! - Loading subnet lists from files

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// A line of a subnet list could not be parsed.
    #[error("{path}:{line}: {source}")]
    SubnetList {
        path: PathBuf,
        line: usize,
        #[source]
        source: Box<NetworkError>,
    },

    /// Subnet list could not be read.
    #[error("failed to read subnet list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// CIDR prefixes
// ============================================================================

/// An IPv4 or IPv6 prefix in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpCidr {
    /// Base address of the prefix, masked to `prefix_len`.
    address: IpAddr,

    /// Prefix length (e.g., 24 for /24).
    prefix_len: u8,
}

impl IpCidr {
    /// Create a new prefix. Host bits of `address` are cleared.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        let max = max_prefix_len(address);
        if prefix_len > max {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max
            )));
        }

        Ok(Self {
            address: mask(address, prefix_len),
            prefix_len,
        })
    }

    /// A prefix covering exactly one address.
    pub fn host(address: IpAddr) -> Self {
        Self {
            address,
            prefix_len: max_prefix_len(address),
        }
    }

    /// Base address of the prefix.
    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Prefix length.
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Check if an address is within this prefix.
    ///
    /// Addresses of the other family never match.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.address, addr) {
            (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_)) => {
                mask(addr, self.prefix_len) == self.address
            }
            _ => false,
        }
    }
}

impl FromStr for IpCidr {
    type Err = NetworkError;

    /// Parse from CIDR notation (e.g., "10.0.0.0/8", "2001:db8::/32").
    ///
    /// A bare address is accepted as a host prefix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            let address = IpAddr::from_str(s)
                .map_err(|_| NetworkError::InvalidAddress(s.to_string()))?;
            return Ok(Self::host(address));
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        if prefix_str.is_empty() || !prefix_str.bytes().all(|b| b.is_ascii_digit()) {
            return Err(NetworkError::InvalidPrefix(prefix_str.to_string()));
        }
        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }
}

impl std::fmt::Display for IpCidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn max_prefix_len(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Mask an address to a prefix length.
fn mask(addr: IpAddr, prefix_len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from_be_bytes(v4.octets());
            let mask = if prefix_len == 0 {
                0
            } else {
                u32::MAX << (32 - u32::from(prefix_len.min(32)))
            };
            IpAddr::V4(Ipv4Addr::from(bits & mask))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from_be_bytes(v6.octets());
            let mask = if prefix_len == 0 {
                0
            } else {
                u128::MAX << (128 - u32::from(prefix_len.min(128)))
            };
            IpAddr::V6(Ipv6Addr::from(bits & mask))
        }
    }
}

// ============================================================================
// Allowed subnets
// ============================================================================

/// Ordered set of prefixes that may originate connections.
///
/// Built once at startup and shared read-only between connection tasks.
/// An empty set admits every address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubnetSet {
    prefixes: Vec<IpCidr>,
}

impl SubnetSet {
    /// Create a set from prefixes, keeping their order.
    pub fn new(prefixes: Vec<IpCidr>) -> Self {
        Self { prefixes }
    }

    /// The set that admits everything.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Test whether `ip` is admitted.
    ///
    /// IPv4-mapped IPv6 addresses are matched as IPv4.
    pub fn allowed(&self, ip: IpAddr) -> bool {
        if self.prefixes.is_empty() {
            return true;
        }

        let ip = ip.to_canonical();
        self.prefixes.iter().any(|prefix| prefix.contains(ip))
    }

    /// Configured prefixes in match order.
    pub fn prefixes(&self) -> &[IpCidr] {
        &self.prefixes
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Parse a subnet list: one prefix per line, `#` starts a comment.
    ///
    /// `path` is only used for error messages.
    pub fn parse_list(contents: &str, path: &Path) -> Result<Self, NetworkError> {
        let mut prefixes = Vec::new();

        for (idx, raw) in contents.lines().enumerate() {
            let line = match raw.split_once('#') {
                Some((before, _)) => before,
                None => raw,
            }
            .trim();

            if line.is_empty() {
                continue;
            }

            let prefix = line.parse::<IpCidr>().map_err(|e| NetworkError::SubnetList {
                path: path.to_path_buf(),
                line: idx + 1,
                source: Box::new(e),
            })?;
            prefixes.push(prefix);
        }

        Ok(Self::new(prefixes))
    }

    /// Load a subnet list from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, NetworkError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| NetworkError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse_list(&contents, path)
    }
}

impl FromIterator<IpCidr> for SubnetSet {
    fn from_iter<T: IntoIterator<Item = IpCidr>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
