//! IPv4 / TCP header parsing
//!
//! Zero-copy views over a raw packet buffer as read from a TUN device or a
//! client connection.
//!
//! # IPv4 header (RFC 791)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Version|  IHL  |Type of Service|          Total Length         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Identification        |Flags|      Fragment Offset    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Time to Live |    Protocol   |         Header Checksum       |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Source Address                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Destination Address                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::PacketError;

// ============================================================================
// Constants
// ============================================================================

/// Size of the fixed IPv4 header (IHL = 5)
pub const IPV4_HEADER_LEN: usize = 20;

/// Size of the fixed TCP header (data offset = 5)
pub const TCP_HEADER_LEN: usize = 20;

/// IP protocol number for TCP
pub const PROTOCOL_TCP: u8 = 6;

/// Offset of the source address in the IPv4 header
pub const SOURCE_ADDR_OFFSET: usize = 12;

/// Offset of the destination address in the IPv4 header
pub const DESTINATION_ADDR_OFFSET: usize = 16;

// ============================================================================
// IPv4 Header
// ============================================================================

/// Decoded IPv4 header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    /// Header length in bytes (IHL * 4)
    pub header_len: usize,
    pub type_of_service: u8,
    pub total_length: u16,
    pub identification: u16,
    /// Reserved flag bit (must be zero on the wire)
    pub reserved: bool,
    pub dont_fragment: bool,
    pub more_fragments: bool,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

// ============================================================================
// TCP Header
// ============================================================================

/// TCP control bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub cwr: bool,
    pub ece: bool,
    pub urg: bool,
    pub ack: bool,
    pub psh: bool,
    pub rst: bool,
    pub syn: bool,
    pub fin: bool,
}

impl TcpFlags {
    fn from_byte(b: u8) -> Self {
        TcpFlags {
            cwr: b & 0x80 != 0,
            ece: b & 0x40 != 0,
            urg: b & 0x20 != 0,
            ack: b & 0x10 != 0,
            psh: b & 0x08 != 0,
            rst: b & 0x04 != 0,
            syn: b & 0x02 != 0,
            fin: b & 0x01 != 0,
        }
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.cwr, "CWR"),
            (self.ece, "ECE"),
            (self.urg, "URG"),
            (self.ack, "ACK"),
            (self.psh, "PSH"),
            (self.rst, "RST"),
            (self.syn, "SYN"),
            (self.fin, "FIN"),
        ];
        let set: Vec<&str> = names.iter().filter(|(on, _)| *on).map(|(_, n)| *n).collect();
        write!(f, "[{}]", set.join(","))
    }
}

/// Decoded fixed TCP header (options are skipped)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgment_number: u32,
    /// Header length in bytes (data offset * 4)
    pub header_len: usize,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_pointer: u16,
}

// ============================================================================
// Packet View
// ============================================================================

/// A parsed IPv4 packet borrowing its buffer
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Packet<'a> {
    pub header: Ipv4Header,
    /// Present when the protocol is TCP
    pub tcp: Option<TcpHeader>,
    /// Everything after the IPv4 header, bounded by the total length
    pub payload: &'a [u8],
}

impl Ipv4Packet<'_> {
    /// Whether the packet carries TCP
    pub fn is_tcp(&self) -> bool {
        self.tcp.is_some()
    }

    /// (source port, destination port) for TCP packets
    pub fn ports(&self) -> Option<(u16, u16)> {
        self.tcp.map(|t| (t.source_port, t.destination_port))
    }
}

impl fmt::Display for Ipv4Packet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tcp {
            Some(tcp) => write!(
                f,
                "{}:{} -> {}:{} {} ({} bytes)",
                self.header.source,
                tcp.source_port,
                self.header.destination,
                tcp.destination_port,
                tcp.flags,
                self.header.total_length
            ),
            None => write!(
                f,
                "{} -> {} (proto:{}, {} bytes)",
                self.header.source,
                self.header.destination,
                self.header.protocol,
                self.header.total_length
            ),
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse an IPv4 packet, and its TCP header when the protocol is TCP.
pub fn parse_ipv4(buf: &[u8]) -> Result<Ipv4Packet<'_>, PacketError> {
    if buf.len() < IPV4_HEADER_LEN {
        return Err(PacketError::TooShort(buf.len()));
    }

    let version = buf[0] >> 4;
    if version != 4 {
        return Err(PacketError::UnsupportedVersion(version));
    }

    let header_len = usize::from(buf[0] & 0x0F) * 4;
    if header_len < IPV4_HEADER_LEN || header_len > buf.len() {
        return Err(PacketError::BadHeaderLength(header_len));
    }

    let total_length = u16::from_be_bytes([buf[2], buf[3]]);
    let total = usize::from(total_length);
    if total < header_len || total > buf.len() {
        return Err(PacketError::BadTotalLength {
            total,
            actual: buf.len(),
        });
    }

    let header = Ipv4Header {
        version,
        header_len,
        type_of_service: buf[1],
        total_length,
        identification: u16::from_be_bytes([buf[4], buf[5]]),
        reserved: buf[6] & 0x80 != 0,
        dont_fragment: buf[6] & 0x40 != 0,
        more_fragments: buf[6] & 0x20 != 0,
        fragment_offset: u16::from_be_bytes([buf[6] & 0x1F, buf[7]]),
        ttl: buf[8],
        protocol: buf[9],
        checksum: u16::from_be_bytes([buf[10], buf[11]]),
        source: Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]),
        destination: Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]),
    };

    let payload = &buf[header_len..total];
    let tcp = if header.protocol == PROTOCOL_TCP {
        Some(parse_tcp(payload)?)
    } else {
        None
    };

    Ok(Ipv4Packet {
        header,
        tcp,
        payload,
    })
}

/// Parse the fixed TCP header at the start of `segment`.
///
/// Ports and sequence numbers live in the first 12 bytes, but the whole
/// 20-byte fixed header is required so flags and checksum are always known.
pub fn parse_tcp(segment: &[u8]) -> Result<TcpHeader, PacketError> {
    if segment.len() < TCP_HEADER_LEN {
        return Err(PacketError::TcpTooShort(segment.len()));
    }

    let header_len = usize::from(segment[12] >> 4) * 4;
    if header_len < TCP_HEADER_LEN || header_len > segment.len() {
        return Err(PacketError::BadDataOffset(header_len));
    }

    Ok(TcpHeader {
        source_port: u16::from_be_bytes([segment[0], segment[1]]),
        destination_port: u16::from_be_bytes([segment[2], segment[3]]),
        sequence_number: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
        acknowledgment_number: u32::from_be_bytes([
            segment[8],
            segment[9],
            segment[10],
            segment[11],
        ]),
        header_len,
        flags: TcpFlags::from_byte(segment[13]),
        window_size: u16::from_be_bytes([segment[14], segment[15]]),
        checksum: u16::from_be_bytes([segment[16], segment[17]]),
        urgent_pointer: u16::from_be_bytes([segment[18], segment[19]]),
    })
}

/// Parse and require TCP, returning the packet's TCP header
pub fn parse_ipv4_tcp(buf: &[u8]) -> Result<(Ipv4Header, TcpHeader), PacketError> {
    let packet = parse_ipv4(buf)?;
    match packet.tcp {
        Some(tcp) => Ok((packet.header, tcp)),
        None => Err(PacketError::NotTcp(packet.header.protocol)),
    }
}

/// Cheap protocol filter: a well-formed IPv4 packet carrying TCP
pub fn is_ipv4_tcp(buf: &[u8]) -> bool {
    parse_ipv4(buf).map(|p| p.is_tcp()).unwrap_or(false)
}

// ============================================================================
// Tests
// ============================================================================
