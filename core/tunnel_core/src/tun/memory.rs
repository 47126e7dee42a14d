//! In-memory TUN device
//!
//! Packets injected with `inject` are returned by `read`; packets passed to
//! `write` are captured and can be taken with `recv_written`. Needs no
//! privileges, so the whole tunnel can run inside a test process.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::TunDevice;

/// How often a blocked `read` re-checks the closed flag
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// In-process stand-in for a TUN interface
pub struct MemoryTun {
    name: String,
    inbound_tx: Sender<Vec<u8>>,
    inbound_rx: Receiver<Vec<u8>>,
    outbound_tx: Sender<Vec<u8>>,
    outbound_rx: Receiver<Vec<u8>>,
    /// Error returned by every `write` while set
    write_error: Mutex<Option<io::ErrorKind>>,
    closed: AtomicBool,
}

impl MemoryTun {
    pub fn new(name: impl Into<String>) -> Self {
        let (inbound_tx, inbound_rx) = unbounded();
        let (outbound_tx, outbound_rx) = unbounded();
        MemoryTun {
            name: name.into(),
            inbound_tx,
            inbound_rx,
            outbound_tx,
            outbound_rx,
            write_error: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a packet for the next `read` (as if the kernel routed it to us)
    pub fn inject(&self, packet: Vec<u8>) {
        // Both channel ends live in `self`, so the send can't fail
        let _ = self.inbound_tx.send(packet);
    }

    /// Wait up to `timeout` for the next packet written to the device
    pub fn recv_written(&self, timeout: Duration) -> Option<Vec<u8>> {
        self.outbound_rx.recv_timeout(timeout).ok()
    }

    /// Drain every packet written so far
    pub fn take_written(&self) -> Vec<Vec<u8>> {
        self.outbound_rx.try_iter().collect()
    }

    /// Number of written packets not yet taken
    pub fn written_count(&self) -> usize {
        self.outbound_rx.len()
    }

    /// Make every subsequent `write` fail with `kind` (or succeed again with `None`)
    pub fn set_write_error(&self, kind: Option<io::ErrorKind>) {
        *self.write_error.lock() = kind;
    }

    /// Fail all further reads and writes; wakes a blocked reader
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "device closed")
    }
}

impl TunDevice for MemoryTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Self::closed_error());
            }
            match self.inbound_rx.recv_timeout(CLOSE_POLL_INTERVAL) {
                Ok(packet) => {
                    let len = packet.len().min(buf.len());
                    buf[..len].copy_from_slice(&packet[..len]);
                    return Ok(len);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(Self::closed_error()),
            }
        }
    }

    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Self::closed_error());
        }
        if let Some(kind) = *self.write_error.lock() {
            return Err(io::Error::new(kind, "injected write failure"));
        }
        let _ = self.outbound_tx.send(packet.to_vec());
        Ok(packet.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_inject_then_read() {
        let tun = MemoryTun::new("mem0");
        tun.inject(b"packet".to_vec());

        let mut buf = [0u8; 64];
        let n = tun.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"packet");
    }

    #[test]
    fn test_read_truncates_to_buffer() {
        let tun = MemoryTun::new("mem0");
        tun.inject(vec![7u8; 100]);

        let mut buf = [0u8; 10];
        assert_eq!(tun.read(&mut buf).unwrap(), 10);
    }

    #[test]
    fn test_write_is_captured() {
        let tun = MemoryTun::new("mem0");
        assert_eq!(tun.write(b"abc").unwrap(), 3);
        assert_eq!(tun.written_count(), 1);
        assert_eq!(tun.recv_written(Duration::from_millis(10)), Some(b"abc".to_vec()));
        assert!(tun.take_written().is_empty());
    }

    #[test]
    fn test_injected_write_error() {
        let tun = MemoryTun::new("mem0");
        tun.set_write_error(Some(io::ErrorKind::Other));
        assert!(tun.write(b"x").is_err());
        tun.set_write_error(None);
        assert!(tun.write(b"x").is_ok());
    }

    #[test]
    fn test_close_wakes_reader() {
        let tun = Arc::new(MemoryTun::new("mem0"));
        let reader = Arc::clone(&tun);
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 16];
            reader.read(&mut buf)
        });

        thread::sleep(Duration::from_millis(20));
        tun.close();
        let err = handle.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(tun.write(b"x").is_err());
    }
}
