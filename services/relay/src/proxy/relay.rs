//! Per-connection relay engine.
//!
//! A connection moves through admission, a single header read, decoding,
//! the upstream dial, a flush of the bytes that arrived behind the header,
//! and finally two copy tasks, one per direction. The first copy task to
//! finish ends the connection: both sockets are closed and the other task
//! is cancelled. Any earlier failure drops the connection; nothing is
//! reported back to the downstream peer beyond the close.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ipkeep_networking::SubnetSet;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, Span};

use super::buffer::{BufferPool, PooledBuffer};
use super::dial::{DialError, Dialer};
use super::proxy_protocol::{self, HeaderError, Transport};

/// Default time allowed for the PROXY header to arrive.
pub const DEFAULT_HEADER_TIMEOUT: Option<Duration> = Some(Duration::from_secs(10));

/// Default idle timeout (none for raw TCP).
pub const DEFAULT_IDLE_TIMEOUT: Option<Duration> = None;

/// Default inactivity period after which a UDP flow is closed.
pub const DEFAULT_UDP_CLOSE_AFTER: Duration = Duration::from_secs(60);

/// Copy buffer size per direction.
const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Relay settings shared by every connection.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upstream for IPv4 clients.
    pub target_addr4: SocketAddr,
    /// Upstream for IPv6 clients.
    pub target_addr6: SocketAddr,
    /// Verbosity; above 1 every connection step is logged.
    pub verbose: u8,
    /// Deadline for the header read.
    pub header_timeout: Option<Duration>,
    /// Per-direction read inactivity limit while relaying.
    pub idle_timeout: Option<Duration>,
    /// Inactivity period after which a UDP flow is closed.
    pub udp_close_after: Duration,
}

impl RelayConfig {
    /// Create a configuration with default timeouts.
    pub fn new(target_addr4: SocketAddr, target_addr6: SocketAddr) -> Self {
        Self {
            target_addr4,
            target_addr6,
            verbose: 0,
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            udp_close_after: DEFAULT_UDP_CLOSE_AFTER,
        }
    }

    /// Pick the upstream by the family of the decoded source, or of the real
    /// peer when the header carried no address.
    pub fn target_for(&self, source: Option<SocketAddr>, peer_addr: SocketAddr) -> SocketAddr {
        let ipv6 = match source {
            Some(source) => source.is_ipv6(),
            None => peer_addr.ip().to_canonical().is_ipv6(),
        };

        if ipv6 {
            self.target_addr6
        } else {
            self.target_addr4
        }
    }
}

/// Reasons a connection was dropped before relaying started.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to read PROXY header: {0}")]
    ReadHeader(#[source] io::Error),

    #[error("connection closed before PROXY header")]
    EmptyHeader,

    #[error("timed out waiting for PROXY header")]
    HeaderTimeout,

    #[error("failed to parse PROXY header: {0}")]
    Decode(#[from] HeaderError),

    #[error("failed to establish upstream connection: {0}")]
    Dial(#[from] DialError),

    #[error("failed to write data to upstream connection: {0}")]
    Flush(#[source] io::Error),
}

/// Shared state for relaying connections.
#[derive(Debug)]
pub struct Relay {
    config: RelayConfig,
    subnets: Arc<SubnetSet>,
    pool: Arc<BufferPool>,
    dialer: Dialer,
}

impl Relay {
    pub fn new(config: RelayConfig, subnets: Arc<SubnetSet>, dialer: Dialer) -> Self {
        Self {
            config,
            subnets,
            pool: Arc::new(BufferPool::default()),
            dialer,
        }
    }

    /// Use a specific buffer pool.
    pub fn with_pool(mut self, pool: Arc<BufferPool>) -> Self {
        self.pool = pool;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    /// Whether `peer_addr` may send PROXY headers at all.
    pub fn admits(&self, peer_addr: SocketAddr) -> bool {
        self.subnets.allowed(peer_addr.ip())
    }

    /// Handle a single accepted connection until it closes.
    ///
    /// Connections from peers outside the allowed subnets are dropped
    /// without reading from them.
    pub async fn handle_connection(
        &self,
        mut downstream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), RelayError> {
        let verbose = self.config.verbose > 1;

        if !self.admits(peer_addr) {
            debug!(drop_connection = true, "Connection origin not in allowed subnets");
            return Ok(());
        }

        if verbose {
            debug!("New connection");
        }

        let mut buffer = self.pool.acquire();
        let n = self.read_header(&mut downstream, &mut buffer).await?;

        let header = proxy_protocol::decode(&buffer[..n], Transport::Stream)?;
        let source = header.source;
        let target = self.config.target_for(source, peer_addr);

        let span = Span::current();
        match source {
            Some(source) => span.record("client_addr", tracing::field::display(source)),
            None => span.record("client_addr", "UNKNOWN"),
        };
        span.record("target_addr", tracing::field::display(target));

        if verbose {
            debug!("Successfully parsed PROXY header");
        }

        let mut upstream = self.dialer.connect_tcp(source, target).await?;

        if verbose {
            debug!("Successfully established upstream connection");
        }

        if let Err(e) = downstream.set_nodelay(true) {
            debug!(error = %e, "Failed to set nodelay on downstream connection");
        }
        if let Err(e) = upstream.set_nodelay(true) {
            debug!(error = %e, "Failed to set nodelay on upstream connection");
        }

        upstream
            .write_all(header.trailing)
            .await
            .map_err(RelayError::Flush)?;
        drop(buffer);

        self.relay(downstream, upstream).await;
        Ok(())
    }

    /// One bounded read; the header must arrive in it.
    async fn read_header(
        &self,
        downstream: &mut TcpStream,
        buffer: &mut PooledBuffer,
    ) -> Result<usize, RelayError> {
        let read = downstream.read(&mut buffer[..]);

        let n = match self.config.header_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| RelayError::HeaderTimeout)?,
            None => read.await,
        }
        .map_err(RelayError::ReadHeader)?;

        if n == 0 {
            return Err(RelayError::EmptyHeader);
        }
        Ok(n)
    }

    /// Copy both directions until the first one finishes, then close both.
    async fn relay(&self, downstream: TcpStream, upstream: TcpStream) {
        let (down_read, down_write) = downstream.into_split();
        let (up_read, up_write) = upstream.into_split();

        // Room for both results so a late finisher never waits on the send.
        let (tx, mut rx) = mpsc::channel(2);
        let idle_timeout = self.config.idle_timeout;

        let to_upstream = tokio::spawn(copy_half(
            down_read,
            up_write,
            idle_timeout,
            "downstream->upstream",
            tx.clone(),
        ));
        let to_downstream = tokio::spawn(copy_half(
            up_read,
            down_write,
            idle_timeout,
            "upstream->downstream",
            tx,
        ));

        let first = rx.recv().await;

        to_upstream.abort();
        to_downstream.abort();
        let _ = to_upstream.await;
        let _ = to_downstream.await;

        match first {
            Some((direction, Err(e))) => {
                debug!(direction, error = %e, drop_connection = true, "Connection broken");
            }
            Some((direction, Ok(bytes))) => {
                if self.config.verbose > 1 {
                    debug!(direction, bytes, "Connection closing");
                }
            }
            None => {}
        }
    }
}

async fn copy_half(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    idle_timeout: Option<Duration>,
    direction: &'static str,
    done: mpsc::Sender<(&'static str, io::Result<u64>)>,
) {
    let result = pipe(&mut reader, &mut writer, idle_timeout).await;
    let _ = done.send((direction, result)).await;
}

/// Returns the number of bytes copied before EOF.
async fn pipe<R, W>(reader: &mut R, writer: &mut W, idle_timeout: Option<Duration>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    loop {
        let n = match idle_timeout {
            Some(limit) => tokio::time::timeout(limit, reader.read(&mut buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "idle timeout"))??,
            None => reader.read(&mut buf).await?,
        };

        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::proxy::dial::BindOnly;

    fn config() -> RelayConfig {
        RelayConfig::new(
            "127.0.0.1:4000".parse().unwrap(),
            "[::1]:6000".parse().unwrap(),
        )
    }

    #[test]
    fn test_config_defaults() {
        let config = config();
        assert_eq!(config.header_timeout, Some(Duration::from_secs(10)));
        assert!(config.idle_timeout.is_none());
        assert_eq!(config.udp_close_after, Duration::from_secs(60));
    }

    #[test]
    fn test_target_follows_source_family() {
        let config = config();
        let peer4: SocketAddr = "192.0.2.1:5000".parse().unwrap();
        let peer6: SocketAddr = "[2001:db8::1]:5000".parse().unwrap();

        let src6: SocketAddr = "[2001:db8::9]:1".parse().unwrap();
        let src4: SocketAddr = "10.0.0.5:1".parse().unwrap();

        assert_eq!(config.target_for(Some(src6), peer4), config.target_addr6);
        assert_eq!(config.target_for(Some(src4), peer6), config.target_addr4);
    }

    #[test]
    fn test_target_without_source_follows_peer() {
        let config = config();
        let peer6: SocketAddr = "[2001:db8::1]:5000".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:192.0.2.1]:5000".parse().unwrap();

        assert_eq!(config.target_for(None, peer6), config.target_addr6);
        assert_eq!(config.target_for(None, mapped), config.target_addr4);
    }

    async fn connected_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server, peer)
    }

    #[tokio::test]
    async fn test_pipe_copies_until_eof() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"hello ")
            .read(b"world")
            .build();
        let mut writer = tokio_test::io::Builder::new()
            .write(b"hello ")
            .write(b"world")
            .build();

        let copied = pipe(&mut reader, &mut writer, None).await.unwrap();
        assert_eq!(copied, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipe_idle_timeout() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"ping")
            .wait(Duration::from_secs(30))
            .build();
        let mut writer = tokio_test::io::Builder::new().write(b"ping").build();

        let err = pipe(&mut reader, &mut writer, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_garbage_header_releases_buffer() {
        let relay = Relay::new(config(), Arc::new(SubnetSet::allow_all()), Dialer::new(Arc::new(BindOnly)));
        let (mut client, server, peer) = connected_pair().await;

        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let err = relay.handle_connection(server, peer).await.unwrap_err();

        assert!(matches!(err, RelayError::Decode(HeaderError::InvalidSignature)));
        assert_eq!(relay.buffer_pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_immediate_eof_is_error() {
        let relay = Relay::new(config(), Arc::new(SubnetSet::allow_all()), Dialer::new(Arc::new(BindOnly)));
        let (client, server, peer) = connected_pair().await;

        drop(client);
        let err = relay.handle_connection(server, peer).await.unwrap_err();

        assert!(matches!(err, RelayError::EmptyHeader));
        assert_eq!(relay.buffer_pool().outstanding(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_header_timeout() {
        let mut config = config();
        config.header_timeout = Some(Duration::from_secs(2));
        let relay = Relay::new(config, Arc::new(SubnetSet::allow_all()), Dialer::new(Arc::new(BindOnly)));
        let (_client, server, peer) = connected_pair().await;

        let err = relay.handle_connection(server, peer).await.unwrap_err();

        assert!(matches!(err, RelayError::HeaderTimeout));
        assert_eq!(relay.buffer_pool().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_denied_peer_is_not_read() {
        let subnets = SubnetSet::new(vec!["10.0.0.0/8".parse().unwrap()]);
        let relay = Relay::new(config(), Arc::new(subnets), Dialer::new(Arc::new(BindOnly)));
        let (mut client, server, peer) = connected_pair().await;

        client.write_all(b"PROXY UNKNOWN\r\n").await.unwrap();
        relay.handle_connection(server, peer).await.unwrap();

        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(relay.buffer_pool().outstanding(), 0);
    }
}
