//! Tunnel configuration
//!
//! Typed configuration for both process roles. The binaries fill these from
//! command-line flags; anything left unset keeps the default below.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::{Result, TunnelError};
use crate::framing::Framing;

// ============================================================================
// Defaults
// ============================================================================

/// Address the server rewrites outbound sources to
pub const DEFAULT_INTERNAL_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 69, 1);

/// Address the client rewrites inbound destinations to
pub const DEFAULT_CLIENT_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 99, 1);

/// How long a handler waits for a correlated reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(4);

/// How long shutdown waits for connections to close
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest packet accepted from the transport or the device
pub const DEFAULT_MAX_PACKET: usize = 4000;

/// Pause after a failed TUN read
pub const DEFAULT_READ_BACKOFF: Duration = Duration::from_secs(1);

/// Client dial timeout
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Client TUN read size
pub const DEFAULT_MTU: usize = 1500;

// ============================================================================
// Server
// ============================================================================

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Transport listen address, e.g. "0.0.0.0:8080"
    pub listen_addr: String,
    /// TUN interface name
    pub tun_name: String,
    /// Source address written into forwarded packets
    pub internal_addr: Ipv4Addr,
    pub reply_timeout: Duration,
    pub drain_timeout: Duration,
    pub max_packet: usize,
    pub read_backoff: Duration,
    pub framing: Framing,
}

impl ServerConfig {
    pub fn new(listen_addr: impl Into<String>, tun_name: impl Into<String>) -> Self {
        ServerConfig {
            listen_addr: listen_addr.into(),
            tun_name: tun_name.into(),
            ..Default::default()
        }
    }

    pub fn with_internal_addr(mut self, addr: Ipv4Addr) -> Self {
        self.internal_addr = addr;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_max_packet(mut self, max_packet: usize) -> Self {
        self.max_packet = max_packet;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    /// Reject configurations the server cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.trim().is_empty() {
            return Err(TunnelError::Config("listen address can't be empty".into()));
        }
        if self.tun_name.trim().is_empty() {
            return Err(TunnelError::Config("device can't be empty".into()));
        }
        validate_max_packet(self.max_packet)?;
        if self.reply_timeout.is_zero() {
            return Err(TunnelError::Config("reply timeout must be positive".into()));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: String::new(),
            tun_name: String::new(),
            internal_addr: DEFAULT_INTERNAL_ADDR,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            max_packet: DEFAULT_MAX_PACKET,
            read_backoff: DEFAULT_READ_BACKOFF,
            framing: Framing::default(),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server transport address, e.g. "203.0.113.7:8080"
    pub server_addr: String,
    pub tun_name: String,
    /// Interface the transport socket is bound to (`SO_BINDTODEVICE`)
    pub outbound_iface: Option<String>,
    /// Destination address written into packets delivered to the TUN device
    pub client_addr: Ipv4Addr,
    pub dial_timeout: Duration,
    pub mtu: usize,
    pub max_packet: usize,
    pub read_backoff: Duration,
    pub framing: Framing,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>, tun_name: impl Into<String>) -> Self {
        ClientConfig {
            server_addr: server_addr.into(),
            tun_name: tun_name.into(),
            ..Default::default()
        }
    }

    pub fn with_outbound_iface(mut self, iface: impl Into<String>) -> Self {
        self.outbound_iface = Some(iface.into());
        self
    }

    pub fn with_client_addr(mut self, addr: Ipv4Addr) -> Self {
        self.client_addr = addr;
        self
    }

    pub fn with_framing(mut self, framing: Framing) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_read_backoff(mut self, backoff: Duration) -> Self {
        self.read_backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_addr.trim().is_empty() {
            return Err(TunnelError::Config("proxy address can't be empty".into()));
        }
        if self.tun_name.trim().is_empty() {
            return Err(TunnelError::Config("device can't be empty".into()));
        }
        if matches!(&self.outbound_iface, Some(iface) if iface.trim().is_empty()) {
            return Err(TunnelError::Config("outbound interface can't be empty".into()));
        }
        if self.mtu == 0 {
            return Err(TunnelError::Config("MTU must be positive".into()));
        }
        validate_max_packet(self.max_packet)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_addr: String::new(),
            tun_name: String::new(),
            outbound_iface: None,
            client_addr: DEFAULT_CLIENT_ADDR,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            mtu: DEFAULT_MTU,
            max_packet: DEFAULT_MAX_PACKET,
            read_backoff: DEFAULT_READ_BACKOFF,
            framing: Framing::default(),
        }
    }
}

fn validate_max_packet(max_packet: usize) -> Result<()> {
    // Anything smaller can't hold an IPv4 header plus a TCP header
    if max_packet < 40 {
        return Err(TunnelError::Config(format!(
            "max packet size {} too small",
            max_packet
        )));
    }
    Ok(())
}
