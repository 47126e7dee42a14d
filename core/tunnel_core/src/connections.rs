//! Active connection tracking for shutdown draining
//!
//! Every accepted connection is registered here for the lifetime of its
//! handler through a `ConnectionGuard`. Shutdown blocks on `wait_empty`, and
//! `close_all` is the hard-cancel escape hatch.

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::metrics::Metrics;

struct Tracked {
    stream: TcpStream,
    peer: Option<SocketAddr>,
}

/// Set of open client connections
pub struct ConnectionSet {
    connections: Mutex<HashMap<u64, Tracked>>,
    emptied: Condvar,
    next_id: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl ConnectionSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Like `new`, also maintaining the active-connection gauge
    pub fn with_metrics(metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self::build(Some(metrics)))
    }

    fn build(metrics: Option<Arc<Metrics>>) -> Self {
        ConnectionSet {
            connections: Mutex::new(HashMap::new()),
            emptied: Condvar::new(),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Register a connection. `stream` should be a clone of the handle the
    /// handler uses; it is only kept for `close_all`.
    pub fn track(self: &Arc<Self>, stream: TcpStream) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let peer = stream.peer_addr().ok();
        self.connections.lock().insert(id, Tracked { stream, peer });

        if let Some(metrics) = &self.metrics {
            Metrics::incr(&metrics.connections_total);
            Metrics::incr(&metrics.active_connections);
        }

        ConnectionGuard {
            set: Arc::clone(self),
            id,
        }
    }

    fn release(&self, id: u64) {
        let mut connections = self.connections.lock();
        if connections.remove(&id).is_some() {
            if let Some(metrics) = &self.metrics {
                metrics.active_connections.fetch_sub(1, Ordering::Relaxed);
            }
        }
        if connections.is_empty() {
            self.emptied.notify_all();
        }
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Block until no connection is tracked or `timeout` elapses.
    /// Returns whether the set is empty.
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut connections = self.connections.lock();
        while !connections.is_empty() {
            if self.emptied.wait_until(&mut connections, deadline).timed_out() {
                return connections.is_empty();
            }
        }
        true
    }

    /// Shut down both directions of every tracked socket.
    ///
    /// Handlers see EOF or an error on their next transport operation and
    /// exit, releasing their guards.
    pub fn close_all(&self) -> usize {
        let connections = self.connections.lock();
        for tracked in connections.values() {
            if let Err(e) = tracked.stream.shutdown(Shutdown::Both) {
                log::debug!("Failed to close connection {:?}: {}", tracked.peer, e);
            }
        }
        connections.len()
    }
}

/// Keeps a connection in its set until dropped
pub struct ConnectionGuard {
    set: Arc<ConnectionSet>,
    id: u64,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.set.release(self.id);
    }
}
