//! Packet framing on the TCP transport
//!
//! Two wire formats:
//!
//! - `Raw`: one `read()` is taken to be one packet. This is what existing
//!   peers speak, but it relies on the stream never coalescing or splitting
//!   packets, which TCP does not promise.
//! - `LengthPrefixed`: `[len: u32 BE][packet: len bytes]`. Survives any
//!   segmentation of the byte stream.

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use crate::error::{Result, TunnelError};

/// Length of the frame header (4 bytes, big-endian packet length)
pub const HEADER_LEN: usize = 4;

/// Wire format for packets on a transport connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// One transport read is one packet
    Raw,
    /// 4-byte big-endian length before every packet
    #[default]
    LengthPrefixed,
}

impl Framing {
    /// Read the next packet, at most `max_packet` bytes long.
    ///
    /// Returns `Ok(None)` when the peer closed the stream between packets.
    pub fn read_packet<R: Read>(&self, reader: &mut R, max_packet: usize) -> Result<Option<Vec<u8>>> {
        match self {
            Framing::Raw => read_raw(reader, max_packet),
            Framing::LengthPrefixed => read_length_prefixed(reader, max_packet),
        }
    }

    /// Write one packet in this framing
    pub fn write_packet<W: Write>(&self, writer: &mut W, packet: &[u8]) -> Result<()> {
        match self {
            Framing::Raw => writer.write_all(packet).map_err(TunnelError::Transport),
            Framing::LengthPrefixed => {
                let len = u32::try_from(packet.len()).map_err(|_| TunnelError::FrameTooLarge {
                    len: packet.len(),
                    max: u32::MAX as usize,
                })?;
                let mut buf = Vec::with_capacity(HEADER_LEN + packet.len());
                buf.extend_from_slice(&len.to_be_bytes());
                buf.extend_from_slice(packet);
                writer.write_all(&buf).map_err(TunnelError::Transport)
            }
        }
    }
}

fn read_raw<R: Read>(reader: &mut R, max_packet: usize) -> Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; max_packet];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(n) => {
                buf.truncate(n);
                return Ok(Some(buf));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TunnelError::Transport(e)),
        }
    }
}

fn read_length_prefixed<R: Read>(reader: &mut R, max_packet: usize) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(TunnelError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside frame header",
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TunnelError::Transport(e)),
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_packet {
        return Err(TunnelError::FrameTooLarge { len, max: max_packet });
    }

    let mut packet = vec![0u8; len];
    reader.read_exact(&mut packet).map_err(TunnelError::Transport)?;
    Ok(Some(packet))
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::Raw => write!(f, "raw"),
            Framing::LengthPrefixed => write!(f, "length-prefixed"),
        }
    }
}

impl FromStr for Framing {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(Framing::Raw),
            "length-prefixed" => Ok(Framing::LengthPrefixed),
            other => Err(TunnelError::Config(format!(
                "unknown framing {:?} (expected \"raw\" or \"length-prefixed\")",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Hands out at most `chunk` bytes per read
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_length_prefixed_wire_format() {
        let mut out = Vec::new();
        Framing::LengthPrefixed.write_packet(&mut out, b"abc").unwrap();
        assert_eq!(out, vec![0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_length_prefixed_reassembles_split_stream() {
        let mut wire = Vec::new();
        Framing::LengthPrefixed.write_packet(&mut wire, b"first").unwrap();
        Framing::LengthPrefixed.write_packet(&mut wire, b"second").unwrap();

        let mut reader = Trickle { data: wire, pos: 0, chunk: 3 };
        let framing = Framing::LengthPrefixed;
        assert_eq!(framing.read_packet(&mut reader, 100).unwrap().unwrap(), b"first");
        assert_eq!(framing.read_packet(&mut reader, 100).unwrap().unwrap(), b"second");
        assert!(framing.read_packet(&mut reader, 100).unwrap().is_none());
    }

    #[test]
    fn test_length_prefixed_rejects_oversized() {
        let mut reader = Cursor::new(vec![0, 0, 0x10, 0]);
        let err = Framing::LengthPrefixed.read_packet(&mut reader, 4000).unwrap_err();
        assert!(matches!(err, TunnelError::FrameTooLarge { len: 4096, max: 4000 }));
        assert!(err.is_fatal_for_connection());
    }

    #[test]
    fn test_length_prefixed_truncated_is_transport_error() {
        let mut reader = Cursor::new(vec![0, 0]);
        let err = Framing::LengthPrefixed.read_packet(&mut reader, 100).unwrap_err();
        assert!(matches!(err, TunnelError::Transport(_)));

        let mut reader = Cursor::new(vec![0, 0, 0, 5, 1, 2]);
        let err = Framing::LengthPrefixed.read_packet(&mut reader, 100).unwrap_err();
        assert!(matches!(err, TunnelError::Transport(_)));
    }

    #[test]
    fn test_raw_one_read_one_packet() {
        let mut reader = Cursor::new(b"hello".to_vec());
        assert_eq!(Framing::Raw.read_packet(&mut reader, 3).unwrap().unwrap(), b"hel");
        assert_eq!(Framing::Raw.read_packet(&mut reader, 3).unwrap().unwrap(), b"lo");
        assert!(Framing::Raw.read_packet(&mut reader, 3).unwrap().is_none());

        let mut out = Vec::new();
        Framing::Raw.write_packet(&mut out, b"xyz").unwrap();
        assert_eq!(out, b"xyz");
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("raw".parse::<Framing>().unwrap(), Framing::Raw);
        assert_eq!("length-prefixed".parse::<Framing>().unwrap(), Framing::LengthPrefixed);
        assert!("json".parse::<Framing>().is_err());
        assert_eq!(Framing::default().to_string(), "length-prefixed");
        assert_eq!(Framing::Raw.to_string(), "raw");
    }
}
