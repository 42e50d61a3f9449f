//! TCP listener.
//!
//! Accepts connections and hands each one to the relay engine on its own
//! task. Per-connection failures are logged and never reach the listener,
//! including a client that resets before `accept` returns. A failure of the listening socket itself is reported once on the fatal
//! channel and ends the accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, field, info, Instrument};

use super::relay::Relay;

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self { bind_addr }
    }
}

/// Failures of a listening socket. Each one stops its listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept on {addr}: {source}")]
    Accept {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to receive on {addr}: {source}")]
    Receive {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// A TCP listener feeding the relay engine.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    relay: Arc<Relay>,
}

impl Listener {
    /// Bind the listening socket.
    pub async fn bind(config: ListenerConfig, relay: Arc<Relay>) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: config.bind_addr,
                source,
            })?;

        Ok(Self {
            config,
            listener,
            relay,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listening socket fails.
    ///
    /// The failure is sent on `errors` before returning.
    pub async fn run(self, errors: mpsc::Sender<ListenerError>) {
        let local_addr = self.local_addr().unwrap_or(self.config.bind_addr);
        info!(bind_addr = %local_addr, "Listening");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let relay = Arc::clone(&self.relay);

                    tokio::spawn(
                        async move {
                            if let Err(e) = relay.handle_connection(stream, peer_addr).await {
                                debug!(error = %e, drop_connection = true, "Connection error");
                            }
                        }
                        .instrument(tracing::info_span!(
                            "connection",
                            peer = %peer_addr,
                            client_addr = field::Empty,
                            target_addr = field::Empty,
                        )),
                    );
                }
                Err(source) if is_aborted_handshake(&source) => {
                    debug!(bind_addr = %local_addr, error = %source, "Connection aborted before accept");
                }
                Err(source) => {
                    error!(bind_addr = %local_addr, error = %source, "Failed to accept new connection");
                    let _ = errors
                        .send(ListenerError::Accept {
                            addr: local_addr,
                            source,
                        })
                        .await;
                    return;
                }
            }
        }
    }
}

/// The pending connection went away before `accept`; the socket is fine.
fn is_aborted_handshake(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::ConnectionAborted
}
