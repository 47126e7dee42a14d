//! Tunnel Core
//!
//! User-space IPv4/TCP tunnel over a TUN device. This crate provides:
//! - IPv4/TCP header decoding and checksum recomputation
//! - Source/destination address rewriting (NAT-like translation)
//! - Correlation of replies read from the TUN device to waiting connections
//! - The server accept loop with bounded graceful shutdown
//! - The client's TUN <-> transport forwarders
//!
//! Only IPv4 without options carrying TCP is forwarded; everything else is
//! dropped.

// ============================================================================
// Modules
// ============================================================================

pub mod checksum;
pub mod client;
pub mod config;
pub mod connections;
pub mod correlation;
pub mod endpoint;
pub mod error;
pub mod framing;
pub mod handler;
pub mod metrics;
pub mod packet;
pub mod server;
pub mod translate;
pub mod tun;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ClientConfig, ServerConfig};
pub use connections::{ConnectionGuard, ConnectionSet};
pub use correlation::{CorrelationTable, PendingReply};
pub use endpoint::TunnelEndpoint;
pub use error::{PacketError, Result, TunnelError};
pub use framing::Framing;
pub use handler::{ConnectionHandler, Exchange};
pub use metrics::Metrics;
pub use packet::{Ipv4Header, Ipv4Packet, TcpFlags, TcpHeader};
pub use server::Server;
pub use translate::{AddressTranslator, Direction};
pub use tun::{MemoryTun, TunDevice};
