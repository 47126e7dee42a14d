//! Tunnel Client
//!
//! Reads IPv4/TCP packets from a local TUN device, sends them to the tunnel
//! server, and writes the server's replies back into the TUN device with
//! their destination rewritten to the client address.

use std::net::Ipv4Addr;

use clap::Parser;

use tunnel_core::config::DEFAULT_CLIENT_ADDR;
use tunnel_core::{client, ClientConfig, Framing};

#[derive(Debug, Parser)]
#[command(name = "tunnel-client", version, about = "TCP-over-TUN tunnel client")]
struct Cli {
    /// Server address (e.g. vpn.example.com:1194)
    #[arg(long)]
    proxy: String,

    /// TUN interface to read traffic from (e.g. tun0)
    #[arg(long)]
    tun: String,

    /// Network interface for connecting to the server (e.g. eth0, wlan0)
    #[arg(long)]
    outbound_iface: Option<String>,

    /// Destination address written into packets delivered to the TUN device
    #[arg(long, default_value_t = DEFAULT_CLIENT_ADDR)]
    client_addr: Ipv4Addr,

    /// Packet framing on the server connection: raw | length-prefixed
    #[arg(long, default_value_t = Framing::default())]
    framing: Framing,
}

impl Cli {
    fn into_config(self) -> ClientConfig {
        let mut config = ClientConfig::new(self.proxy, self.tun)
            .with_client_addr(self.client_addr)
            .with_framing(self.framing);
        if let Some(iface) = self.outbound_iface {
            config = config.with_outbound_iface(iface);
        }
        config
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config();
    config.validate()?;

    log::info!("Tunnel Client starting...");
    log::info!("  Server: {}", config.server_addr);
    log::info!("  TUN: {}", config.tun_name);
    if let Some(iface) = &config.outbound_iface {
        log::info!("  Outbound interface: {}", iface);
    }

    let device = tunnel_core::tun::open(&config.tun_name)?;

    log::info!("Connecting to the server");
    client::run(&config, device)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_minimal() {
        let cli = Cli::try_parse_from(["tunnel-client", "--proxy", "10.0.0.1:1194", "--tun", "tun0"]).unwrap();
        let config = cli.into_config();
        assert_eq!(config.server_addr, "10.0.0.1:1194");
        assert_eq!(config.client_addr, Ipv4Addr::new(192, 168, 99, 1));
        assert!(config.outbound_iface.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_outbound_iface() {
        let cli = Cli::try_parse_from([
            "tunnel-client",
            "--proxy",
            "10.0.0.1:1194",
            "--tun",
            "tun0",
            "--outbound-iface",
            "eth0",
            "--framing",
            "raw",
        ])
        .unwrap();
        let config = cli.into_config();
        assert_eq!(config.outbound_iface.as_deref(), Some("eth0"));
        assert_eq!(config.framing, Framing::Raw);
    }

    #[test]
    fn test_empty_proxy_rejected() {
        let cli = Cli::try_parse_from(["tunnel-client", "--proxy", "", "--tun", "tun0"]).unwrap();
        assert!(cli.into_config().validate().is_err());
    }
}
