//! Error types for the tunnel data path
//!
//! Two layers:
//! - `PacketError`: a buffer that cannot be treated as an IPv4/TCP packet.
//!   These are dropped silently by the connection handler.
//! - `TunnelError`: everything that can go wrong while moving a packet
//!   through the tunnel (correlation, device, transport, shutdown).

use std::io;
use std::time::Duration;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

// ============================================================================
// Packet Errors
// ============================================================================

/// Reasons a buffer is not a usable IPv4/TCP packet
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the fixed 20-byte IPv4 header
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    /// Version nibble is not 4
    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),

    /// IHL below 5 words or past the end of the buffer
    #[error("invalid IPv4 header length {0} bytes")]
    BadHeaderLength(usize),

    /// Total length field disagrees with the buffer
    #[error("invalid IPv4 total length {total} (buffer {actual} bytes)")]
    BadTotalLength {
        /// Value of the total length field
        total: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// Protocol field is not TCP
    #[error("not a TCP packet (protocol {0})")]
    NotTcp(u8),

    /// TCP payload shorter than the fixed 20-byte TCP header
    #[error("TCP header truncated: {0} bytes")]
    TcpTooShort(usize),

    /// TCP data offset below 5 words or past the end of the segment
    #[error("invalid TCP data offset {0} bytes")]
    BadDataOffset(usize),

    /// IPv4 options present; only the fixed header is supported
    #[error("IPv4 options are not supported (header {0} bytes)")]
    OptionsUnsupported(usize),
}

// ============================================================================
// Tunnel Errors
// ============================================================================

/// Errors surfaced by the tunnel components
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Malformed or non-TCP packet
    #[error("malformed packet: {0}")]
    Packet(#[from] PacketError),

    /// A reply is already pending for this source port
    #[error("duplicate port {0} in correlation table")]
    DuplicatePort(u16),

    /// No pending request for this port (stale or duplicate reply)
    #[error("no pending reply for port {0}")]
    NoPendingReply(u16),

    /// No correlated reply before the deadline
    #[error("no reply for port {port} within {waited:?}")]
    Timeout {
        /// Source port of the abandoned request
        port: u16,
        /// How long the waiter was blocked
        waited: Duration,
    },

    /// Read/write failure on a client connection or the listener
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// Read/write failure on the TUN device
    #[error("device error: {0}")]
    Device(#[source] io::Error),

    /// Length-prefixed frame larger than the configured maximum
    #[error("frame of {len} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Announced frame length
        len: usize,
        /// Configured maximum packet size
        max: usize,
    },

    /// Connections did not drain within the bound
    #[error("shutdown timed out after {0:?} with connections still open")]
    ShutdownTimeout(Duration),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TunnelError {
    /// Whether the error ends the connection that produced it
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(self, TunnelError::Transport(_) | TunnelError::FrameTooLarge { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_error_converts() {
        let err: TunnelError = PacketError::NotTcp(17).into();
        assert!(matches!(err, TunnelError::Packet(PacketError::NotTcp(17))));
        assert_eq!(err.to_string(), "malformed packet: not a TCP packet (protocol 17)");
    }

    #[test]
    fn test_fatal_classification() {
        let transport = TunnelError::Transport(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(transport.is_fatal_for_connection());

        let timeout = TunnelError::Timeout {
            port: 5000,
            waited: Duration::from_secs(4),
        };
        assert!(!timeout.is_fatal_for_connection());
        assert!(!TunnelError::DuplicatePort(5000).is_fatal_for_connection());
    }
}
