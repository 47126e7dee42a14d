//! Per-connection request/reply loop
//!
//! ```text
//!   Reading ──► Translating ──► AwaitingReply ──► Writing ──┐
//!      ▲                                                    │
//!      └────────────────────────────────────────────────────┘
//!   any transport error or EOF ──► Closed
//! ```

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::endpoint::TunnelEndpoint;
use crate::error::{Result, TunnelError};
use crate::framing::Framing;
use crate::metrics::Metrics;
use crate::packet::is_ipv4_tcp;
use crate::translate::AddressTranslator;

/// Outcome of submitting one client packet to the tunnel
#[derive(Debug)]
pub enum Exchange {
    /// Correlated reply, to be written back to the client
    Replied(Vec<u8>),
    /// Not an IPv4/TCP packet we can translate; never sent
    Dropped,
    /// Sent, but no reply before the deadline
    TimedOut,
    /// Not sent or not answerable (duplicate port, device failure)
    Rejected(TunnelError),
}

/// Serves one client connection against the shared endpoint
pub struct ConnectionHandler {
    endpoint: Arc<TunnelEndpoint>,
    translator: AddressTranslator,
    framing: Framing,
    max_packet: usize,
    reply_timeout: Duration,
}

impl ConnectionHandler {
    pub fn new(endpoint: Arc<TunnelEndpoint>, config: &ServerConfig) -> Self {
        ConnectionHandler {
            endpoint,
            translator: AddressTranslator::source(config.internal_addr),
            framing: config.framing,
            max_packet: config.max_packet,
            reply_timeout: config.reply_timeout,
        }
    }

    /// Filter, translate and forward one packet, waiting for its reply
    pub fn exchange(&self, packet: Vec<u8>) -> Exchange {
        if !is_ipv4_tcp(&packet) {
            log::trace!("Dropping non IPv4/TCP packet ({} bytes)", packet.len());
            Metrics::incr(&self.endpoint.metrics().packets_dropped_total);
            return Exchange::Dropped;
        }

        let packet = match self.translator.apply(packet) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("Dropping untranslatable packet: {}", e);
                Metrics::incr(&self.endpoint.metrics().packets_dropped_total);
                return Exchange::Dropped;
            }
        };

        let deadline = Instant::now() + self.reply_timeout;
        match self.endpoint.send_and_await(packet, deadline) {
            Ok(reply) => Exchange::Replied(reply),
            Err(TunnelError::Timeout { port, waited }) => {
                log::debug!("Timeout waiting for reply on port {} after {:?}", port, waited);
                Exchange::TimedOut
            }
            Err(e) => {
                log::warn!("Failed to forward packet: {}", e);
                Exchange::Rejected(e)
            }
        }
    }

    /// Run until the client disconnects or the transport fails.
    ///
    /// Returns `Ok(())` on a clean close.
    pub fn run<S: Read + Write>(&self, stream: &mut S) -> Result<()> {
        loop {
            let packet = match self.framing.read_packet(stream, self.max_packet)? {
                Some(packet) => packet,
                None => return Ok(()),
            };

            if let Exchange::Replied(reply) = self.exchange(packet) {
                self.framing.write_packet(stream, &reply)?;
                stream.flush().map_err(TunnelError::Transport)?;
            }
        }
    }
}
