//! ipkeep
//!
//! Transparent relay for connections carrying a PROXY protocol header.
//!
//! This service:
//! - Accepts TCP connections or UDP datagrams from a load balancer
//! - Admits only origins from the allowed subnets
//! - Decodes the PROXY v1/v2 header to recover the client address
//! - Dials the upstream from that address using IP_TRANSPARENT and SO_MARK
//! - Relays traffic until either side closes

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ipkeep_relay::config::{Cli, LogFormat, Protocol};
use ipkeep_relay::{Dialer, Listener, ListenerConfig, Relay, UdpListener};

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level().into());

    let fmt_layer = match cli.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);
    cli.validate()?;

    let subnets = cli.load_subnets()?;
    let relay_config = cli.relay_config();
    let dial_config = cli.dial_config();

    info!(
        protocol = ?cli.protocol,
        listen_addr = %cli.listen_addr,
        target_addr4 = %relay_config.target_addr4,
        target_addr6 = %relay_config.target_addr6,
        mark = dial_config.mark,
        allowed_subnets = subnets.len(),
        "Configuration loaded"
    );

    let relay = Arc::new(Relay::new(
        relay_config,
        Arc::new(subnets),
        Dialer::from_config(&dial_config),
    ));
    let listener_config = ListenerConfig::new(cli.listen_addr);
    let (errors_tx, mut errors_rx) = mpsc::channel(1);

    match cli.protocol {
        Protocol::Tcp => {
            let listener = Listener::bind(listener_config, relay).await?;
            tokio::spawn(listener.run(errors_tx));
        }
        Protocol::Udp => {
            let listener = UdpListener::bind(listener_config, relay).await?;
            tokio::spawn(listener.run(errors_tx));
        }
    }

    match errors_rx.recv().await {
        Some(e) => {
            error!(error = %e, "Listener failed");
            Err(e.into())
        }
        None => bail!("listener stopped without reporting an error"),
    }
}
