//! Tunnel Server
//!
//! Accepts client connections over TCP and relays their IPv4/TCP packets
//! through a local TUN device:
//! - Rewrites each packet's source to the internal address
//! - Writes it to the TUN device and waits for the reply to its port
//! - Sends the reply back on the connection the request came from
//!
//! SIGINT/SIGTERM stops accepting and drains open connections.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use tunnel_core::config::{
    DEFAULT_DRAIN_TIMEOUT, DEFAULT_INTERNAL_ADDR, DEFAULT_MAX_PACKET, DEFAULT_REPLY_TIMEOUT,
};
use tunnel_core::{CorrelationTable, Framing, Metrics, Server, ServerConfig, TunnelEndpoint, TunnelError};

// ============================================================================
// Command Line
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "tunnel-server", version, about = "TCP-over-TUN tunnel server")]
struct Cli {
    /// Local address to listen for connections (e.g. 0.0.0.0:1194)
    #[arg(long)]
    listen: String,

    /// TUN interface for routing decapsulated traffic (e.g. tun0)
    #[arg(long)]
    tun: String,

    /// Source address written into forwarded packets
    #[arg(long, default_value_t = DEFAULT_INTERNAL_ADDR)]
    internal_addr: Ipv4Addr,

    /// How long to wait for a reply to each packet
    #[arg(long, default_value_t = DEFAULT_REPLY_TIMEOUT.as_millis() as u64)]
    reply_timeout_ms: u64,

    /// How long shutdown waits for connections to close
    #[arg(long, default_value_t = DEFAULT_DRAIN_TIMEOUT.as_millis() as u64)]
    drain_timeout_ms: u64,

    /// Largest packet accepted from a client
    #[arg(long, default_value_t = DEFAULT_MAX_PACKET)]
    max_packet: usize,

    /// Packet framing on client connections: raw | length-prefixed
    #[arg(long, default_value_t = Framing::default())]
    framing: Framing,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        ServerConfig::new(self.listen, self.tun)
            .with_internal_addr(self.internal_addr)
            .with_reply_timeout(Duration::from_millis(self.reply_timeout_ms))
            .with_drain_timeout(Duration::from_millis(self.drain_timeout_ms))
            .with_max_packet(self.max_packet)
            .with_framing(self.framing)
    }
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config();
    config.validate()?;

    log::info!("Tunnel Server starting...");
    log::info!("  Listen: {}", config.listen_addr);
    log::info!("  TUN: {}", config.tun_name);
    log::info!("  Internal address: {}", config.internal_addr);
    log::info!("  Framing: {}", config.framing);

    let device = tunnel_core::tun::open(&config.tun_name)?;
    let endpoint = Arc::new(
        TunnelEndpoint::new(device, CorrelationTable::new(), Arc::new(Metrics::new()))
            .with_read_buffer(config.max_packet)
            .with_read_backoff(config.read_backoff),
    );
    // Left detached: it sits in a blocking device read until the process exits
    endpoint.spawn_reader()?;

    let server = Server::bind(config, Arc::clone(&endpoint))?;

    let accept = {
        let server = Arc::clone(&server);
        thread::Builder::new().name("accept".into()).spawn(move || {
            if let Err(e) = server.serve() {
                log::error!("Server was closed with error: {}", e);
            }
        })?
    };

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    if let Some(signal) = signals.forever().next() {
        log::info!("Received signal {}, shutting down", signal);
    }

    match server.shutdown() {
        Ok(()) => {}
        Err(TunnelError::ShutdownTimeout(waited)) => {
            log::error!("Connections still open after {:?}, closing them", waited);
            server.close_connections();
        }
        Err(e) => log::error!("Server shutdown error: {}", e),
    }

    endpoint.stop();
    if accept.join().is_err() {
        log::error!("Accept thread panicked");
    }

    log::info!("Server stopped");
    Ok(())
}
