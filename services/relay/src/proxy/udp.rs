//! UDP relay.
//!
//! Every datagram on the listening socket carries its own PROXY v2 header.
//! Datagrams are grouped into flows keyed by the sender and the decoded
//! client address. Each flow owns an upstream socket bound to the client
//! address and connected to the target, plus a task that forwards replies
//! back to the sender with the flow's header in front of them. A flow that
//! sees no traffic in either direction for `udp_close_after` is closed.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info};

use super::dial::DialError;
use super::listener::{ListenerConfig, ListenerError};
use super::proxy_protocol::{self, Transport};
use super::relay::Relay;

/// Largest UDP payload.
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Identifies a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Sender of the datagrams on the listening socket.
    pub downstream: SocketAddr,
    /// Client address from the PROXY header, if any.
    pub source: Option<SocketAddr>,
}

#[derive(Debug)]
struct Flow {
    upstream: UdpSocket,
    /// Header bytes placed in front of every reply.
    header: Vec<u8>,
    created: Instant,
    /// Milliseconds after `created` of the last datagram in either direction.
    last_seen: AtomicU64,
    /// Set once the reply task has given up on the flow.
    closed: AtomicBool,
}

impl Flow {
    fn new(upstream: UdpSocket, header: &[u8]) -> Self {
        Self {
            upstream,
            header: header.to_vec(),
            created: Instant::now(),
            last_seen: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    // `touch`/`is_closed` on the receive side pair with `idle_for`/`close` on
    // the reply side; SeqCst guarantees at least one side sees the other.
    fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_seen.store(elapsed, Ordering::SeqCst);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_seen.load(Ordering::SeqCst));
        self.created.elapsed().saturating_sub(last)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

type FlowTable = Arc<RwLock<HashMap<FlowKey, Arc<Flow>>>>;

/// A UDP listener feeding per-flow upstream sockets.
pub struct UdpListener {
    config: ListenerConfig,
    socket: Arc<UdpSocket>,
    relay: Arc<Relay>,
    flows: FlowTable,
}

impl UdpListener {
    /// Bind the listening socket.
    pub async fn bind(config: ListenerConfig, relay: Arc<Relay>) -> Result<Self, ListenerError> {
        let socket = UdpSocket::bind(config.bind_addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: config.bind_addr,
                source,
            })?;

        Ok(Self {
            config,
            socket: Arc::new(socket),
            relay,
            flows: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive datagrams until the listening socket fails.
    ///
    /// The failure is sent on `errors` before returning.
    pub async fn run(self, errors: mpsc::Sender<ListenerError>) {
        let local_addr = self.local_addr().unwrap_or(self.config.bind_addr);
        info!(bind_addr = %local_addr, "Listening");

        let pool = Arc::clone(self.relay.buffer_pool());

        loop {
            let mut buffer = pool.acquire();

            let (n, peer_addr) = match self.socket.recv_from(&mut buffer[..]).await {
                Ok(received) => received,
                Err(source) => {
                    error!(bind_addr = %local_addr, error = %source, "Failed to receive datagram");
                    let _ = errors
                        .send(ListenerError::Receive {
                            addr: local_addr,
                            source,
                        })
                        .await;
                    return;
                }
            };

            if !self.relay.admits(peer_addr) {
                debug!(peer = %peer_addr, drop_datagram = true, "Datagram origin not in allowed subnets");
                continue;
            }

            let header = match proxy_protocol::decode(&buffer[..n], Transport::Datagram) {
                Ok(header) => header,
                Err(e) => {
                    debug!(peer = %peer_addr, error = %e, drop_datagram = true, "Failed to parse PROXY header");
                    continue;
                }
            };

            let key = FlowKey {
                downstream: peer_addr,
                source: header.source,
            };

            let flow = match self.active_flow(key, &buffer[..header.header_len]).await {
                Ok(flow) => flow,
                Err(e) => {
                    debug!(peer = %peer_addr, error = %e, drop_datagram = true, "Failed to open upstream socket");
                    continue;
                }
            };

            if let Err(e) = flow.upstream.send(header.trailing).await {
                debug!(peer = %peer_addr, error = %e, "Failed to send datagram upstream");
            }
        }
    }

    /// Look up or open the flow for `key` and mark it active.
    ///
    /// A flow that closes between lookup and `touch` is replaced, so the
    /// datagram never goes out on a socket whose replies are no longer read.
    async fn active_flow(&self, key: FlowKey, header: &[u8]) -> Result<Arc<Flow>, DialError> {
        loop {
            let flow = self.flow_for(key, header).await?;
            flow.touch();
            if !flow.is_closed() {
                return Ok(flow);
            }
        }
    }

    async fn flow_for(&self, key: FlowKey, header: &[u8]) -> Result<Arc<Flow>, DialError> {
        if let Some(flow) = self.flows.read().await.get(&key) {
            if !flow.is_closed() {
                return Ok(Arc::clone(flow));
            }
        }

        let mut flows = self.flows.write().await;
        if let Some(flow) = flows.get(&key) {
            if !flow.is_closed() {
                return Ok(Arc::clone(flow));
            }
        }

        let target = self
            .relay
            .config()
            .target_for(key.source, key.downstream);
        let upstream = self.relay.dialer().bind_udp(key.source, target)?;

        let flow = Arc::new(Flow::new(upstream, header));
        flows.insert(key, Arc::clone(&flow));

        if self.relay.config().verbose > 1 {
            debug!(peer = %key.downstream, target_addr = %target, "New UDP flow");
        }

        tokio::spawn(pump_replies(
            key,
            Arc::clone(&flow),
            Arc::clone(&self.socket),
            Arc::clone(&self.flows),
            self.relay.config().udp_close_after,
        ));

        Ok(flow)
    }
}

/// Forward upstream replies to the downstream sender until the flow idles out.
async fn pump_replies(
    key: FlowKey,
    flow: Arc<Flow>,
    downstream: Arc<UdpSocket>,
    flows: FlowTable,
    close_after: Duration,
) {
    let header_len = flow.header.len();
    let mut buf = vec![0u8; header_len + MAX_DATAGRAM_SIZE];
    buf[..header_len].copy_from_slice(&flow.header);

    loop {
        let idle_for = flow.idle_for();
        if idle_for >= close_after {
            let _table = flows.write().await;
            if flow.idle_for() < close_after {
                continue;
            }
            flow.close();
            break;
        }

        match tokio::time::timeout(close_after - idle_for, flow.upstream.recv(&mut buf[header_len..]))
            .await
        {
            Err(_) => continue,
            Ok(Ok(n)) => {
                flow.touch();
                if let Err(e) = downstream.send_to(&buf[..header_len + n], key.downstream).await {
                    debug!(peer = %key.downstream, error = %e, "Failed to send reply downstream");
                }
            }
            Ok(Err(e)) => {
                debug!(peer = %key.downstream, error = %e, "Failed to receive from upstream");
                flow.close();
                break;
            }
        }
    }

    let mut table = flows.write().await;
    if table.get(&key).is_some_and(|current| Arc::ptr_eq(current, &flow)) {
        table.remove(&key);
    }
    debug!(peer = %key.downstream, "UDP flow closed");
}
