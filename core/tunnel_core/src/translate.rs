//! NAT-like address rewriting with checksum fix-up
//!
//! The server rewrites the *source* of client requests to its internal
//! address before they enter the TUN device; the client rewrites the
//! *destination* of replies back to its own TUN address. Both legs are the
//! same operation on a different header field.

use std::net::Ipv4Addr;

use crate::checksum::{ipv4_checksum, tcp_checksum, IPV4_CHECKSUM_OFFSET, TCP_CHECKSUM_OFFSET};
use crate::error::PacketError;
use crate::packet::{parse_ipv4_tcp, DESTINATION_ADDR_OFFSET, IPV4_HEADER_LEN, SOURCE_ADDR_OFFSET};

// ============================================================================
// Direction
// ============================================================================

/// Which address field a translation rewrites
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Rewrite the source address (client -> server leg)
    Source,
    /// Rewrite the destination address (server -> client leg)
    Destination,
}

impl Direction {
    fn offset(self) -> usize {
        match self {
            Direction::Source => SOURCE_ADDR_OFFSET,
            Direction::Destination => DESTINATION_ADDR_OFFSET,
        }
    }
}

// ============================================================================
// Translation
// ============================================================================

/// Rewrite one address of an IPv4/TCP packet in place and recompute both
/// checksums (IP header first, then TCP over the updated addresses).
///
/// Non-TCP packets, packets with IPv4 options and malformed packets are
/// left untouched and reported as an error.
pub fn translate(packet: &mut [u8], address: Ipv4Addr, direction: Direction) -> Result<(), PacketError> {
    let (header, _) = parse_ipv4_tcp(packet)?;
    if header.header_len != IPV4_HEADER_LEN {
        return Err(PacketError::OptionsUnsupported(header.header_len));
    }

    let offset = direction.offset();
    packet[offset..offset + 4].copy_from_slice(&address.octets());

    let ip_sum = ipv4_checksum(&packet[..IPV4_HEADER_LEN]);
    packet[IPV4_CHECKSUM_OFFSET..IPV4_CHECKSUM_OFFSET + 2].copy_from_slice(&ip_sum.to_be_bytes());

    let (src, dst) = match direction {
        Direction::Source => (address, header.destination),
        Direction::Destination => (header.source, address),
    };
    let segment = &mut packet[IPV4_HEADER_LEN..usize::from(header.total_length)];
    let tcp_sum = tcp_checksum(segment, src, dst);
    segment[TCP_CHECKSUM_OFFSET..TCP_CHECKSUM_OFFSET + 2].copy_from_slice(&tcp_sum.to_be_bytes());

    Ok(())
}

/// A fixed rewrite applied to owned packet buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressTranslator {
    address: Ipv4Addr,
    direction: Direction,
}

impl AddressTranslator {
    pub fn new(address: Ipv4Addr, direction: Direction) -> Self {
        AddressTranslator { address, direction }
    }

    /// Server leg: requests leave the tunnel from `address`
    pub fn source(address: Ipv4Addr) -> Self {
        Self::new(address, Direction::Source)
    }

    /// Client leg: replies are delivered to `address`
    pub fn destination(address: Ipv4Addr) -> Self {
        Self::new(address, Direction::Destination)
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Translate `packet`, handing the buffer back on success
    pub fn apply(&self, mut packet: Vec<u8>) -> Result<Vec<u8>, PacketError> {
        translate(&mut packet, self.address, self.direction)?;
        Ok(packet)
    }
}

// ============================================================================
// Tests
// ============================================================================
