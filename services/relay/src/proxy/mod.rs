//! Transparent PROXY protocol relay.
//!
//! This module provides:
//! - PROXY protocol v1/v2 decoding (and encoding for tests and tooling)
//! - Origin admission against allowed subnets
//! - Upstream dialing bound to the decoded client address
//! - Bidirectional TCP relaying and per-flow UDP relaying
//! - Pooled buffers for the header read
//!
//! ## Architecture
//!
//! ```text
//! Load balancer -> Listener -> admission -> header decode -> Dialer -> Upstream
//!                                                              |
//!                                         bind(client addr) + IP_TRANSPARENT + SO_MARK
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Dialer, Listener, ListenerConfig, Relay, RelayConfig};
//!
//! let config = RelayConfig::new("127.0.0.1:443".parse()?, "[::1]:443".parse()?);
//! let relay = Arc::new(Relay::new(config, Arc::new(subnets), Dialer::transparent(123)));
//!
//! let listener = Listener::bind(ListenerConfig::new("0.0.0.0:8443".parse()?), relay).await?;
//! listener.run(errors_tx).await;
//! ```

mod buffer;
mod dial;
mod listener;
pub mod proxy_protocol;
mod relay;
mod udp;

pub use buffer::{BufferPool, PooledBuffer, DEFAULT_BUFFER_SIZE};
pub use dial::{BindOnly, DialConfig, DialError, Dialer, SocketControl, TransparentControl};
pub use listener::{Listener, ListenerConfig, ListenerError};
pub use proxy_protocol::{HeaderError, ProxyHeader, ProxyProtocolV2, Transport};
pub use relay::{
    Relay, RelayConfig, RelayError, DEFAULT_HEADER_TIMEOUT, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_UDP_CLOSE_AFTER,
};
pub use udp::{FlowKey, UdpListener};
