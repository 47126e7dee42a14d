//! Internet checksums (RFC 1071) for IPv4 headers and TCP segments
//!
//! Both routines read around the stored checksum field instead of zeroing
//! it, so the caller's buffer is never modified.

use std::net::Ipv4Addr;

use crate::packet::{IPV4_HEADER_LEN, PROTOCOL_TCP};

// ============================================================================
// Constants
// ============================================================================

/// Offset of the checksum field inside the IPv4 header
pub const IPV4_CHECKSUM_OFFSET: usize = 10;

/// Offset of the checksum field inside the TCP header
pub const TCP_CHECKSUM_OFFSET: usize = 16;

// ============================================================================
// One's Complement Arithmetic
// ============================================================================

/// Add big-endian 16-bit words of `data` to `sum`, skipping the word at
/// `skip` (a checksum field). A trailing odd byte is padded with zero.
fn sum_words(data: &[u8], skip: Option<usize>, mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for (i, word) in (&mut chunks).enumerate() {
        if Some(i * 2) == skip {
            continue;
        }
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
    }

    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(*last) << 8);
    }

    sum
}

/// Fold carries back into the low 16 bits and complement
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

// ============================================================================
// IPv4
// ============================================================================

/// Checksum of the fixed 20-byte IPv4 header.
///
/// Only the first 20 bytes are covered (options are unsupported); the stored
/// checksum field is treated as zero.
///
/// # Panics
///
/// Panics if `header` is shorter than 20 bytes.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    fold(sum_words(
        &header[..IPV4_HEADER_LEN],
        Some(IPV4_CHECKSUM_OFFSET),
        0,
    ))
}

/// Whether the stored IPv4 header checksum is correct
pub fn verify_ipv4_checksum(header: &[u8]) -> bool {
    header.len() >= IPV4_HEADER_LEN
        && ipv4_checksum(header)
            == u16::from_be_bytes([
                header[IPV4_CHECKSUM_OFFSET],
                header[IPV4_CHECKSUM_OFFSET + 1],
            ])
}

// ============================================================================
// TCP
// ============================================================================

/// Checksum of a TCP segment (header + payload) over the IPv4 pseudo header.
///
/// # Pseudo header
///
/// ```text
/// +--------+--------+--------+--------+
/// |           Source Address          |
/// +--------+--------+--------+--------+
/// |        Destination Address        |
/// +--------+--------+--------+--------+
/// |  zero  |  PTCL  |    TCP Length   |
/// +--------+--------+--------+--------+
/// ```
///
/// # Panics
///
/// Panics if `segment` is shorter than the checksum field (18 bytes).
pub fn tcp_checksum(segment: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> u16 {
    assert!(
        segment.len() >= TCP_CHECKSUM_OFFSET + 2,
        "TCP segment too short for checksum: {} bytes",
        segment.len()
    );

    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = PROTOCOL_TCP;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    let sum = sum_words(&pseudo, None, 0);
    fold(sum_words(segment, Some(TCP_CHECKSUM_OFFSET), sum))
}

/// Whether the stored TCP checksum is correct for the given addresses
pub fn verify_tcp_checksum(segment: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> bool {
    segment.len() >= TCP_CHECKSUM_OFFSET + 2
        && tcp_checksum(segment, src, dst)
            == u16::from_be_bytes([
                segment[TCP_CHECKSUM_OFFSET],
                segment[TCP_CHECKSUM_OFFSET + 1],
            ])
}

// ============================================================================
// Tests
// ============================================================================
