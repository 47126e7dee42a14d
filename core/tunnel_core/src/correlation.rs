//! Reply correlation for packets sent into the TUN device
//!
//! The table maps the TCP source port of an outbound request to a waiter.
//! The TUN reader looks up the *destination* port of every reply and hands
//! the packet to whoever registered that port.
//!
//! Invariants:
//! - At most one live entry per port. A second registration is rejected,
//!   never overwritten.
//! - Every entry is consumed exactly once: delivered by `resolve`, or
//!   evicted by its `PendingReply` on timeout / drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::error::{Result, TunnelError};

// ============================================================================
// Entry
// ============================================================================

/// A registered waiter
struct Entry {
    /// Identifies this registration so a stale eviction can't remove a newer one
    ticket: u64,
    deadline: Instant,
    reply_tx: Sender<Vec<u8>>,
}

// ============================================================================
// Correlation Table
// ============================================================================

/// Registry of in-flight requests keyed by TCP source port
pub struct CorrelationTable {
    entries: Mutex<HashMap<u16, Entry>>,
    next_ticket: AtomicU64,
}

impl CorrelationTable {
    /// Create an empty table, shared between the endpoint and its reader
    pub fn new() -> Arc<Self> {
        Arc::new(CorrelationTable {
            entries: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
        })
    }

    /// Register a waiter for replies addressed to `port`.
    ///
    /// Fails with `DuplicatePort` while another request from the same port
    /// is still pending.
    pub fn register(self: &Arc<Self>, port: u16, deadline: Instant) -> Result<PendingReply> {
        let (reply_tx, reply_rx) = bounded(1);
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        {
            let mut entries = self.entries.lock();
            if entries.contains_key(&port) {
                return Err(TunnelError::DuplicatePort(port));
            }
            entries.insert(
                port,
                Entry {
                    ticket,
                    deadline,
                    reply_tx,
                },
            );
        }

        log::trace!("Registered port {} (ticket {})", port, ticket);

        Ok(PendingReply {
            table: Arc::clone(self),
            port,
            ticket,
            registered_at: Instant::now(),
            deadline,
            reply_rx,
        })
    }

    /// Deliver `packet` to the waiter registered for `port` and remove it.
    ///
    /// Returns `NoPendingReply` if nobody is waiting; the table is unchanged.
    pub fn resolve(&self, port: u16, packet: Vec<u8>) -> Result<()> {
        let entry = self
            .entries
            .lock()
            .remove(&port)
            .ok_or(TunnelError::NoPendingReply(port))?;

        if entry.deadline < Instant::now() {
            log::debug!("Reply for port {} arrived after its deadline", port);
        }

        // Capacity 1 and a single delivery per entry: only fails if the
        // waiter is gone, which means it already gave up.
        entry
            .reply_tx
            .try_send(packet)
            .map_err(|_| TunnelError::NoPendingReply(port))
    }

    /// Remove the entry for `port` if it still belongs to `ticket`
    fn evict(&self, port: u16, ticket: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(&port) {
            Some(entry) if entry.ticket == ticket => {
                entries.remove(&port);
                true
            }
            _ => false,
        }
    }

    /// Whether a request from `port` is pending
    pub fn contains(&self, port: u16) -> bool {
        self.entries.lock().contains_key(&port)
    }

    /// Number of pending requests
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// ============================================================================
// Pending Reply
// ============================================================================

/// Receiving side of a registration.
///
/// Dropping it evicts the entry, so an abandoned request can never be
/// matched by a later reply to a reused port.
pub struct PendingReply {
    table: Arc<CorrelationTable>,
    port: u16,
    ticket: u64,
    registered_at: Instant,
    deadline: Instant,
    reply_rx: Receiver<Vec<u8>>,
}

impl PendingReply {
    /// Port the reply is expected on
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Block until the reply arrives or the deadline passes
    pub fn wait(self) -> Result<Vec<u8>> {
        match self.reply_rx.recv_deadline(self.deadline) {
            Ok(packet) => Ok(packet),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                // The reader may have resolved us between the timeout and now
                if !self.table.evict(self.port, self.ticket) {
                    if let Ok(packet) = self.reply_rx.try_recv() {
                        return Ok(packet);
                    }
                }
                Err(TunnelError::Timeout {
                    port: self.port,
                    waited: self.registered_at.elapsed(),
                })
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.table.evict(self.port, self.ticket) {
            log::trace!("Evicted port {} (ticket {})", self.port, self.ticket);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
