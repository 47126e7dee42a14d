//! Lightweight Prometheus-compatible counters for the tunnel.
//!
//! Atomic counters for lock-free instrumentation from every handler thread
//! and the TUN reader. `render` produces Prometheus text exposition format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Tunnel-wide counters
pub struct Metrics {
    /// Client connections currently open (gauge)
    pub active_connections: AtomicU64,
    /// Client connections accepted since start (counter)
    pub connections_total: AtomicU64,
    /// Packets written into the TUN device (counter)
    pub packets_forwarded_total: AtomicU64,
    /// Correlated replies delivered to a waiting handler (counter)
    pub replies_delivered_total: AtomicU64,
    /// Requests abandoned without a reply (counter)
    pub reply_timeouts_total: AtomicU64,
    /// Malformed or non-TCP packets dropped (counter)
    pub packets_dropped_total: AtomicU64,
    /// Replies read from the TUN device that nobody was waiting for (counter)
    pub stale_replies_total: AtomicU64,
    /// Sends rejected because the source port was already pending (counter)
    pub duplicate_ports_total: AtomicU64,
    /// Start time (for uptime calculation)
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            active_connections: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            packets_forwarded_total: AtomicU64::new(0),
            replies_delivered_total: AtomicU64::new(0),
            reply_timeouts_total: AtomicU64::new(0),
            packets_dropped_total: AtomicU64::new(0),
            stale_replies_total: AtomicU64::new(0),
            duplicate_ports_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Increment a counter by one
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP tunnel_active_connections Client connections currently open\n\
             # TYPE tunnel_active_connections gauge\n\
             tunnel_active_connections {}\n\
             # HELP tunnel_connections_total Client connections accepted\n\
             # TYPE tunnel_connections_total counter\n\
             tunnel_connections_total {}\n\
             # HELP tunnel_packets_forwarded_total Packets written into the TUN device\n\
             # TYPE tunnel_packets_forwarded_total counter\n\
             tunnel_packets_forwarded_total {}\n\
             # HELP tunnel_replies_delivered_total Correlated replies delivered\n\
             # TYPE tunnel_replies_delivered_total counter\n\
             tunnel_replies_delivered_total {}\n\
             # HELP tunnel_reply_timeouts_total Requests abandoned without a reply\n\
             # TYPE tunnel_reply_timeouts_total counter\n\
             tunnel_reply_timeouts_total {}\n\
             # HELP tunnel_packets_dropped_total Malformed or non-TCP packets dropped\n\
             # TYPE tunnel_packets_dropped_total counter\n\
             tunnel_packets_dropped_total {}\n\
             # HELP tunnel_stale_replies_total Replies with no pending request\n\
             # TYPE tunnel_stale_replies_total counter\n\
             tunnel_stale_replies_total {}\n\
             # HELP tunnel_duplicate_ports_total Sends rejected for a busy source port\n\
             # TYPE tunnel_duplicate_ports_total counter\n\
             tunnel_duplicate_ports_total {}\n\
             # HELP tunnel_uptime_seconds Uptime in seconds\n\
             # TYPE tunnel_uptime_seconds gauge\n\
             tunnel_uptime_seconds {}\n",
            self.active_connections.load(Ordering::Relaxed),
            self.connections_total.load(Ordering::Relaxed),
            self.packets_forwarded_total.load(Ordering::Relaxed),
            self.replies_delivered_total.load(Ordering::Relaxed),
            self.reply_timeouts_total.load(Ordering::Relaxed),
            self.packets_dropped_total.load(Ordering::Relaxed),
            self.stale_replies_total.load(Ordering::Relaxed),
            self.duplicate_ports_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_default_zero() {
        let m = Metrics::new();
        assert_eq!(m.active_connections.load(Ordering::Relaxed), 0);
        assert_eq!(m.packets_forwarded_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.reply_timeouts_total.load(Ordering::Relaxed), 0);
        assert_eq!(m.stale_replies_total.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_metrics_render_format() {
        let m = Metrics::new();
        Metrics::incr(&m.packets_forwarded_total);
        Metrics::incr(&m.packets_forwarded_total);
        m.replies_delivered_total.fetch_add(5, Ordering::Relaxed);
        let output = m.render();
        assert!(output.contains("tunnel_packets_forwarded_total 2"));
        assert!(output.contains("tunnel_replies_delivered_total 5"));
        assert!(output.contains("tunnel_active_connections 0"));
        assert!(output.contains("# TYPE tunnel_active_connections gauge"));
        assert!(output.contains("# TYPE tunnel_reply_timeouts_total counter"));
        assert!(output.contains("tunnel_uptime_seconds 0"));
    }
}
