//! Upstream dialing with spoofed source addresses.
//!
//! A spoofed dial binds the outbound socket to the client address decoded
//! from the PROXY header. On Linux this needs `IP_TRANSPARENT` (and
//! `CAP_NET_ADMIN`), and the socket is tagged with `SO_MARK` so that policy
//! routing can send the replies back to this host instead of the internet
//! or back into the listener. Options are applied between socket creation
//! and `bind`, which is the only point where the kernel accepts them.
//!
//! The option set lives behind [`SocketControl`] so that the dial sequence
//! does not depend on the platform. Any option failure aborts the dial; a
//! spoofed dial never falls back to the proxy's own address.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use thiserror::Error;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tracing::debug;

use super::proxy_protocol::Transport;

/// Dial failures. The connection or datagram is dropped on any of them.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to create socket: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to set {option}: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("transparent binds are not supported on this platform")]
    Unsupported,
}

/// Prepares a socket that is about to be bound to a spoofed source.
pub trait SocketControl: Send + Sync + fmt::Debug {
    /// Apply socket options before `bind(source)` and `connect`.
    fn prepare(
        &self,
        socket: SockRef<'_>,
        source: SocketAddr,
        transport: Transport,
    ) -> Result<(), DialError>;
}

/// Dial settings taken from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialConfig {
    /// Routing mark for spoofed sockets; 0 leaves it unset.
    pub mark: u32,
}

/// Routing mark and transparent-bind options for spoofed dials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransparentControl {
    /// `SO_MARK` value; 0 leaves the mark unset.
    pub mark: u32,
}

impl TransparentControl {
    pub fn new(mark: u32) -> Self {
        Self { mark }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::mem;
    use std::os::unix::io::AsRawFd;

    use socket2::SockRef;

    use super::DialError;

    pub fn set_int(
        socket: &SockRef<'_>,
        level: libc::c_int,
        name: libc::c_int,
        value: libc::c_int,
        option: &'static str,
    ) -> Result<(), DialError> {
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                level,
                name,
                std::ptr::addr_of!(value).cast::<libc::c_void>(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };

        if ret != 0 {
            return Err(DialError::SocketOption {
                option,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl SocketControl for TransparentControl {
    fn prepare(
        &self,
        socket: SockRef<'_>,
        source: SocketAddr,
        transport: Transport,
    ) -> Result<(), DialError> {
        if transport == Transport::Stream {
            // Fail fast on unreachable upstreams.
            linux::set_int(&socket, libc::IPPROTO_TCP, libc::TCP_SYNCNT, 2, "TCP_SYNCNT")?;
        }

        match source {
            SocketAddr::V4(_) => linux::set_int(
                &socket,
                libc::SOL_IP,
                libc::IP_TRANSPARENT,
                1,
                "IP_TRANSPARENT",
            )?,
            SocketAddr::V6(_) => linux::set_int(
                &socket,
                libc::SOL_IPV6,
                libc::IPV6_TRANSPARENT,
                1,
                "IPV6_TRANSPARENT",
            )?,
        }

        socket
            .set_reuse_address(true)
            .map_err(|source| DialError::SocketOption {
                option: "SO_REUSEADDR",
                source,
            })?;

        if source.port() == 0 {
            linux::set_int(
                &socket,
                libc::SOL_IP,
                libc::IP_BIND_ADDRESS_NO_PORT,
                1,
                "IP_BIND_ADDRESS_NO_PORT",
            )?;
        }

        if self.mark != 0 {
            socket
                .set_mark(self.mark)
                .map_err(|source| DialError::SocketOption {
                    option: "SO_MARK",
                    source,
                })?;
        }

        if source.is_ipv6() {
            socket
                .set_only_v6(false)
                .map_err(|source| DialError::SocketOption {
                    option: "IPV6_V6ONLY",
                    source,
                })?;
        }

        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl SocketControl for TransparentControl {
    fn prepare(
        &self,
        _socket: SockRef<'_>,
        _source: SocketAddr,
        _transport: Transport,
    ) -> Result<(), DialError> {
        Err(DialError::Unsupported)
    }
}

/// Binds the source with only `SO_REUSEADDR`.
///
/// Only works for sources that are local to the host, e.g. loopback aliases.
#[derive(Debug, Clone, Copy, Default)]
pub struct BindOnly;

impl SocketControl for BindOnly {
    fn prepare(
        &self,
        socket: SockRef<'_>,
        _source: SocketAddr,
        _transport: Transport,
    ) -> Result<(), DialError> {
        socket
            .set_reuse_address(true)
            .map_err(|source| DialError::SocketOption {
                option: "SO_REUSEADDR",
                source,
            })
    }
}

/// Opens upstream sockets, spoofed when a source address is known.
#[derive(Debug, Clone)]
pub struct Dialer {
    control: Arc<dyn SocketControl>,
}

impl Dialer {
    pub fn new(control: Arc<dyn SocketControl>) -> Self {
        Self { control }
    }

    /// Dialer applying transparent-bind options with the given mark.
    pub fn transparent(mark: u32) -> Self {
        Self::new(Arc::new(TransparentControl::new(mark)))
    }

    pub fn from_config(config: &DialConfig) -> Self {
        Self::transparent(config.mark)
    }

    /// Connect to `target`, bound to `source` when present.
    pub async fn connect_tcp(
        &self,
        source: Option<SocketAddr>,
        target: SocketAddr,
    ) -> Result<TcpStream, DialError> {
        let Some(source) = source else {
            return TcpStream::connect(target)
                .await
                .map_err(|source| DialError::Connect {
                    addr: target,
                    source,
                });
        };

        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(DialError::Socket)?;

        self.control
            .prepare(SockRef::from(&socket), source, Transport::Stream)?;

        socket.bind(source).map_err(|e| DialError::Bind {
            addr: source,
            source: e,
        })?;

        debug!(source = %source, target = %target, "Dialing upstream from spoofed source");

        socket
            .connect(target)
            .await
            .map_err(|source| DialError::Connect {
                addr: target,
                source,
            })
    }

    /// Open a UDP socket connected to `target`, bound to `source` when present.
    pub fn bind_udp(
        &self,
        source: Option<SocketAddr>,
        target: SocketAddr,
    ) -> Result<UdpSocket, DialError> {
        let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))
            .map_err(DialError::Socket)?;

        let bind_addr = match source {
            Some(source) => {
                self.control
                    .prepare(SockRef::from(&socket), source, Transport::Datagram)?;
                source
            }
            None => unspecified(target),
        };

        socket.bind(&bind_addr.into()).map_err(|e| DialError::Bind {
            addr: bind_addr,
            source: e,
        })?;

        socket
            .connect(&target.into())
            .map_err(|source| DialError::Connect {
                addr: target,
                source,
            })?;

        socket
            .set_nonblocking(true)
            .map_err(|source| DialError::SocketOption {
                option: "O_NONBLOCK",
                source,
            })?;

        UdpSocket::from_std(socket.into()).map_err(DialError::Socket)
    }
}

fn unspecified(like: SocketAddr) -> SocketAddr {
    match like {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}
