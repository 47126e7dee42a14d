//! Tunnel endpoint: the TUN device plus reply correlation
//!
//! ```text
//!   handler thread                      reader thread
//!   ──────────────                      ─────────────
//!   send_and_await(pkt)                 loop {
//!     register(src_port) ──┐              read(tun)
//!     write(tun, pkt)      │ table        dst_port of reply
//!     wait(deadline) ◄─────┴───────────── resolve(dst_port, reply)
//!                                       }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::correlation::CorrelationTable;
use crate::error::{Result, TunnelError};
use crate::metrics::Metrics;
use crate::packet::{parse_ipv4, parse_ipv4_tcp};
use crate::tun::TunDevice;

// ============================================================================
// Constants
// ============================================================================

/// Reader buffer size (larger than any MTU the device is configured with)
pub const DEFAULT_READ_BUFFER: usize = 4000;

/// Pause after a failed device read
pub const DEFAULT_READ_BACKOFF: Duration = Duration::from_secs(1);

// ============================================================================
// Tunnel Endpoint
// ============================================================================

/// Owns the TUN device and the table correlating replies to requests
pub struct TunnelEndpoint {
    device: Arc<dyn TunDevice>,
    table: Arc<CorrelationTable>,
    metrics: Arc<Metrics>,
    read_buffer: usize,
    read_backoff: Duration,
    running: AtomicBool,
}

impl TunnelEndpoint {
    pub fn new(device: Arc<dyn TunDevice>, table: Arc<CorrelationTable>, metrics: Arc<Metrics>) -> Self {
        TunnelEndpoint {
            device,
            table,
            metrics,
            read_buffer: DEFAULT_READ_BUFFER,
            read_backoff: DEFAULT_READ_BACKOFF,
            running: AtomicBool::new(true),
        }
    }

    pub fn with_read_buffer(mut self, size: usize) -> Self {
        self.read_buffer = size;
        self
    }

    pub fn with_read_backoff(mut self, backoff: Duration) -> Self {
        self.read_backoff = backoff;
        self
    }

    pub fn table(&self) -> &Arc<CorrelationTable> {
        &self.table
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Write `packet` into the tunnel and block for the reply addressed to
    /// its TCP source port.
    ///
    /// Errors:
    /// - `Packet`: not an IPv4/TCP packet (nothing is sent)
    /// - `DuplicatePort`: a request from this port is still pending (nothing is sent)
    /// - `Device`: the write failed
    /// - `Timeout`: no reply before `deadline`
    pub fn send_and_await(&self, packet: Vec<u8>, deadline: Instant) -> Result<Vec<u8>> {
        let (_, tcp) = parse_ipv4_tcp(&packet)?;
        let port = tcp.source_port;

        let pending = self.table.register(port, deadline).map_err(|e| {
            Metrics::incr(&self.metrics.duplicate_ports_total);
            e
        })?;

        // On error `pending` is dropped here, which evicts the entry
        self.device.write(&packet).map_err(TunnelError::Device)?;
        Metrics::incr(&self.metrics.packets_forwarded_total);
        log::trace!("Sent {} bytes from port {} into {}", packet.len(), port, self.device.name());

        match pending.wait() {
            Ok(reply) => {
                Metrics::incr(&self.metrics.replies_delivered_total);
                Ok(reply)
            }
            Err(e) => {
                Metrics::incr(&self.metrics.reply_timeouts_total);
                Err(e)
            }
        }
    }

    /// Start the dedicated reader thread
    pub fn spawn_reader(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let endpoint = Arc::clone(self);
        thread::Builder::new()
            .name(format!("tun-reader-{}", self.device.name()))
            .spawn(move || endpoint.run_reader())
    }

    /// Read packets from the device until `stop` is called, delivering each
    /// to the handler waiting on its TCP destination port.
    pub fn run_reader(&self) {
        let mut buf = vec![0u8; self.read_buffer];
        log::info!("TUN reader started on {}", self.device.name());

        while self.running.load(Ordering::SeqCst) {
            let n = match self.device.read(&mut buf) {
                Ok(n) => n,
                Err(e) => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }
                    log::warn!("Error reading packet from {}: {}", self.device.name(), e);
                    thread::sleep(self.read_backoff);
                    continue;
                }
            };

            if n > 0 {
                self.dispatch(buf[..n].to_vec());
            }
        }

        log::info!("TUN reader on {} stopped", self.device.name());
    }

    /// Route one packet read from the device to its waiter
    fn dispatch(&self, packet: Vec<u8>) {
        let port = match parse_ipv4(&packet) {
            Ok(parsed) => match parsed.tcp {
                Some(tcp) => {
                    log::debug!("[<-] TUN: {}", parsed);
                    tcp.destination_port
                }
                None => {
                    log::trace!("Ignoring non-TCP packet from TUN: {}", parsed);
                    Metrics::incr(&self.metrics.packets_dropped_total);
                    return;
                }
            },
            Err(e) => {
                log::debug!("Failed to get the destination port: {}", e);
                Metrics::incr(&self.metrics.packets_dropped_total);
                return;
            }
        };

        if let Err(e) = self.table.resolve(port, packet) {
            log::debug!("Dropping reply: {}", e);
            Metrics::incr(&self.metrics.stale_replies_total);
        }
    }

    /// Ask the reader loop to exit at its next wake-up
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Tests
// ============================================================================
