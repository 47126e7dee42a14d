//! Integration tests for the tunnel server and client
//!
//! The real `Server` runs over loopback TCP against a `MemoryTun`; a peer
//! thread plays the remote host by answering every packet written to it.

use std::io::Write;
use std::net::{Ipv4Addr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tunnel_core::checksum::{verify_ipv4_checksum, verify_tcp_checksum};
use tunnel_core::client;
use tunnel_core::packet::{parse_ipv4, IPV4_HEADER_LEN};
use tunnel_core::{
    ClientConfig, CorrelationTable, Framing, MemoryTun, Metrics, Server, ServerConfig, TunnelEndpoint,
    TunnelError,
};

/// Client-side address of the test host
const CLIENT_HOST: [u8; 4] = [10, 8, 0, 2];

/// Remote host the client talks to
const REMOTE_HOST: [u8; 4] = [93, 184, 216, 34];

fn tcp(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let builder = etherparse::PacketBuilder::ipv4(src, dst, 64).tcp(sport, dport, 1, 1024);
    let mut packet = Vec::new();
    builder.write(&mut packet, payload).unwrap();
    packet
}

fn udp(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let builder = etherparse::PacketBuilder::ipv4(src, dst, 64).udp(5353, 53);
    let mut packet = Vec::new();
    builder.write(&mut packet, payload).unwrap();
    packet
}

fn assert_checksums_valid(packet: &[u8]) {
    let parsed = parse_ipv4(packet).unwrap();
    assert!(verify_ipv4_checksum(&packet[..IPV4_HEADER_LEN]));
    assert!(verify_tcp_checksum(
        &packet[IPV4_HEADER_LEN..],
        parsed.header.source,
        parsed.header.destination
    ));
}

// ============================================================================
// Harness
// ============================================================================

/// Plays the remote side of the TUN device
struct Peer {
    stop: Arc<AtomicBool>,
    seen: Arc<AtomicUsize>,
    handle: JoinHandle<Vec<Vec<u8>>>,
}

impl Peer {
    /// Answer each packet written to `tun` unless `answer` returns false
    fn spawn(tun: Arc<MemoryTun>, answer: impl Fn(usize) -> bool + Send + 'static) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(AtomicUsize::new(0));
        let handle = {
            let stop = Arc::clone(&stop);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                let mut packets = Vec::new();
                while !stop.load(Ordering::SeqCst) {
                    let Some(sent) = tun.recv_written(Duration::from_millis(20)) else { continue };
                    let index = seen.fetch_add(1, Ordering::SeqCst);
                    if answer(index) {
                        let parsed = parse_ipv4(&sent).unwrap();
                        let (sport, dport) = parsed.ports().unwrap();
                        tun.inject(tcp(
                            parsed.header.destination.octets(),
                            parsed.header.source.octets(),
                            dport,
                            sport,
                            b"pong",
                        ));
                    }
                    packets.push(sent);
                }
                packets
            })
        };
        Peer { stop, seen, handle }
    }

    fn finish(self) -> Vec<Vec<u8>> {
        self.stop.store(true, Ordering::SeqCst);
        self.handle.join().unwrap()
    }
}

struct Harness {
    tun: Arc<MemoryTun>,
    endpoint: Arc<TunnelEndpoint>,
    server: Arc<Server>,
    serve: JoinHandle<tunnel_core::Result<()>>,
    reader: JoinHandle<()>,
}

impl Harness {
    fn start(config: ServerConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let tun = Arc::new(MemoryTun::new("mem0"));
        let endpoint = Arc::new(
            TunnelEndpoint::new(tun.clone(), CorrelationTable::new(), Arc::new(Metrics::new()))
                .with_read_backoff(Duration::from_millis(10)),
        );
        let reader = endpoint.spawn_reader().unwrap();
        let server = Server::bind(config, endpoint.clone()).unwrap();
        let serve = {
            let server = Arc::clone(&server);
            thread::spawn(move || server.serve())
        };

        Harness { tun, endpoint, server, serve, reader }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.server.local_addr()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
        stream
    }

    /// Wait until the server has registered `n` connections
    fn wait_for_connections(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.server.connections().len() < n {
            assert!(Instant::now() < deadline, "server never tracked {} connections", n);
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn finish(self) {
        self.server.close_connections();
        let _ = self.server.shutdown();
        self.serve.join().unwrap().unwrap();
        self.endpoint.stop();
        self.tun.close();
        self.reader.join().unwrap();
    }
}

fn server_config() -> ServerConfig {
    ServerConfig::new("127.0.0.1:0", "mem0")
        .with_reply_timeout(Duration::from_secs(2))
        .with_drain_timeout(Duration::from_secs(5))
}

// ============================================================================
// Round trips
// ============================================================================

#[test]
fn test_round_trip_through_server() {
    let harness = Harness::start(server_config());
    let peer = Peer::spawn(harness.tun.clone(), |_| true);
    let framing = Framing::LengthPrefixed;

    let mut stream = harness.connect();
    framing
        .write_packet(&mut stream, &tcp(CLIENT_HOST, REMOTE_HOST, 5000, 80, b"ping"))
        .unwrap();
    let reply = framing.read_packet(&mut stream, 4000).unwrap().unwrap();

    // Reply is addressed to the rewritten source, on the original port
    let parsed = parse_ipv4(&reply).unwrap();
    assert_eq!(parsed.header.destination, Ipv4Addr::new(192, 168, 69, 1));
    assert_eq!(parsed.ports(), Some((80, 5000)));

    let forwarded = peer.finish();
    assert_eq!(forwarded.len(), 1);
    let sent = parse_ipv4(&forwarded[0]).unwrap();
    assert_eq!(sent.header.source, Ipv4Addr::new(192, 168, 69, 1));
    assert_eq!(sent.header.destination, Ipv4Addr::from(REMOTE_HOST));
    assert_checksums_valid(&forwarded[0]);

    assert!(harness.endpoint.table().is_empty());
    drop(stream);
    harness.finish();
}

#[test]
fn test_raw_framing_round_trip() {
    let harness = Harness::start(server_config().with_framing(Framing::Raw));
    let peer = Peer::spawn(harness.tun.clone(), |_| true);

    let mut stream = harness.connect();
    stream.write_all(&tcp(CLIENT_HOST, REMOTE_HOST, 5100, 443, b"hello")).unwrap();
    let reply = Framing::Raw.read_packet(&mut stream, 4000).unwrap().unwrap();
    assert_eq!(parse_ipv4(&reply).unwrap().ports(), Some((443, 5100)));

    peer.finish();
    drop(stream);
    harness.finish();
}

#[test]
fn test_replies_reach_their_own_connection() {
    let harness = Harness::start(server_config());
    let peer = Peer::spawn(harness.tun.clone(), |_| true);
    let framing = Framing::LengthPrefixed;

    let workers: Vec<_> = (0..4u16)
        .map(|i| {
            let mut stream = harness.connect();
            thread::spawn(move || {
                let port = 7000 + i;
                for _ in 0..3 {
                    framing
                        .write_packet(&mut stream, &tcp(CLIENT_HOST, REMOTE_HOST, port, 80, b"x"))
                        .unwrap();
                    let reply = framing.read_packet(&mut stream, 4000).unwrap().unwrap();
                    assert_eq!(parse_ipv4(&reply).unwrap().ports(), Some((80, port)));
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(peer.finish().len(), 12);
    harness.finish();
}

#[test]
fn test_non_tcp_packet_never_reaches_tun() {
    let harness = Harness::start(server_config());
    let peer = Peer::spawn(harness.tun.clone(), |_| true);
    let framing = Framing::LengthPrefixed;

    let mut stream = harness.connect();
    framing.write_packet(&mut stream, &udp(CLIENT_HOST, REMOTE_HOST, b"dns")).unwrap();
    framing
        .write_packet(&mut stream, &tcp(CLIENT_HOST, REMOTE_HOST, 5200, 80, b"after"))
        .unwrap();

    // The TCP packet is answered; the UDP one was dropped without a reply
    let reply = framing.read_packet(&mut stream, 4000).unwrap().unwrap();
    assert_eq!(parse_ipv4(&reply).unwrap().ports(), Some((80, 5200)));

    let forwarded = peer.finish();
    assert_eq!(forwarded.len(), 1);
    assert!(parse_ipv4(&forwarded[0]).unwrap().is_tcp());
    assert_eq!(harness.endpoint.metrics().packets_dropped_total.load(Ordering::Relaxed), 1);

    drop(stream);
    harness.finish();
}

#[test]
fn test_reply_timeout_keeps_connection_open() {
    let harness = Harness::start(server_config().with_reply_timeout(Duration::from_millis(100)));
    // First packet goes unanswered
    let peer = Peer::spawn(harness.tun.clone(), |index| index > 0);
    let framing = Framing::LengthPrefixed;

    let mut stream = harness.connect();
    framing
        .write_packet(&mut stream, &tcp(CLIENT_HOST, REMOTE_HOST, 5300, 80, b"lost"))
        .unwrap();
    framing
        .write_packet(&mut stream, &tcp(CLIENT_HOST, REMOTE_HOST, 5300, 80, b"again"))
        .unwrap();

    let reply = framing.read_packet(&mut stream, 4000).unwrap().unwrap();
    assert_eq!(parse_ipv4(&reply).unwrap().ports(), Some((80, 5300)));
    assert_eq!(peer.seen.load(Ordering::SeqCst), 2);
    assert_eq!(harness.endpoint.metrics().reply_timeouts_total.load(Ordering::Relaxed), 1);

    peer.finish();
    drop(stream);
    harness.finish();
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn test_shutdown_drains_closing_connection() {
    let harness = Harness::start(server_config());
    let stream = harness.connect();
    harness.wait_for_connections(1);

    let closer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        drop(stream);
    });

    let start = Instant::now();
    harness.server.shutdown().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(harness.server.connections().is_empty());
    closer.join().unwrap();

    harness.finish();
}

#[test]
fn test_shutdown_times_out_with_open_connection() {
    let harness = Harness::start(server_config().with_drain_timeout(Duration::from_millis(200)));
    let _stream = harness.connect();
    harness.wait_for_connections(1);

    let start = Instant::now();
    let err = harness.server.shutdown().unwrap_err();
    assert!(matches!(err, TunnelError::ShutdownTimeout(d) if d == Duration::from_millis(200)));
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert_eq!(harness.server.connections().len(), 1);

    // Hard cancel lets the handler exit
    assert_eq!(harness.server.close_connections(), 1);
    assert!(harness.server.connections().wait_empty(Duration::from_secs(2)));

    harness.finish();
}

#[test]
fn test_shutdown_stops_accepting() {
    let harness = Harness::start(server_config());
    let addr = harness.server.local_addr();

    harness.server.shutdown().unwrap();
    assert!(harness.server.is_shutting_down());
    assert!(TcpStream::connect_timeout(&addr, Duration::from_secs(1)).is_err());

    harness.finish();
}

// ============================================================================
// Client and server together
// ============================================================================

#[test]
fn test_client_and_server_end_to_end() {
    let harness = Harness::start(server_config());
    let peer = Peer::spawn(harness.tun.clone(), |_| true);

    let client_tun = Arc::new(MemoryTun::new("client0"));
    let client_config = ClientConfig::new(harness.server.local_addr().to_string(), "client0")
        .with_read_backoff(Duration::from_millis(10));

    let client = {
        let config = client_config.clone();
        let device = client_tun.clone();
        thread::spawn(move || client::run(&config, device))
    };

    // Local traffic the kernel routed into the client's TUN device
    client_tun.inject(udp(CLIENT_HOST, REMOTE_HOST, b"ignored"));
    client_tun.inject(tcp(CLIENT_HOST, REMOTE_HOST, 5400, 80, b"ping"));

    let delivered = client_tun
        .recv_written(Duration::from_secs(3))
        .expect("reply delivered to client TUN");
    let parsed = parse_ipv4(&delivered).unwrap();
    assert_eq!(parsed.header.source, Ipv4Addr::from(REMOTE_HOST));
    assert_eq!(parsed.header.destination, Ipv4Addr::new(192, 168, 99, 1));
    assert_eq!(parsed.ports(), Some((80, 5400)));
    assert_checksums_valid(&delivered);

    // Server closing the transport ends the client cleanly
    harness.server.close_connections();
    client.join().unwrap().unwrap();
    client_tun.close();

    assert_eq!(peer.finish().len(), 1);
    harness.finish();
}
