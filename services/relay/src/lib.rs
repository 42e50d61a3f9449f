//! ipkeep relay library.
//!
//! Accepts connections that start with a PROXY protocol header, dials the
//! upstream from the client address carried in the header and relays bytes
//! in both directions. The binary in `main.rs` wires this to the command
//! line; the integration tests drive it directly.

pub mod config;
pub mod proxy;

pub use proxy::{
    BindOnly, BufferPool, DialConfig, DialError, Dialer, Listener, ListenerConfig, ListenerError,
    ProxyProtocolV2, Relay, RelayConfig, RelayError, SocketControl, TransparentControl,
    UdpListener,
};
