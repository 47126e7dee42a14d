//! Client side of the tunnel
//!
//! Two independent pumps share one transport connection:
//!
//! ```text
//!   TUN ──(IPv4/TCP only)──────────────────────────► transport
//!   TUN ◄──(destination rewritten to client addr)─── transport
//! ```

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::bounded;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::ClientConfig;
use crate::error::{Result, TunnelError};
use crate::packet::{is_ipv4_tcp, parse_ipv4};
use crate::translate::AddressTranslator;
use crate::tun::TunDevice;

/// Dial the server, optionally from a specific outbound interface
pub fn connect(config: &ClientConfig) -> Result<TcpStream> {
    let addr = config
        .server_addr
        .to_socket_addrs()
        .map_err(TunnelError::Transport)?
        .next()
        .ok_or_else(|| TunnelError::Config(format!("{} did not resolve", config.server_addr)))?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(TunnelError::Transport)?;

    if let Some(iface) = &config.outbound_iface {
        bind_to_interface(&socket, iface)?;
    }

    socket
        .connect_timeout(&addr.into(), config.dial_timeout)
        .map_err(TunnelError::Transport)?;
    socket.set_nodelay(true).map_err(TunnelError::Transport)?;

    log::info!("Connected to {}", addr);
    Ok(socket.into())
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_to_interface(socket: &Socket, iface: &str) -> Result<()> {
    socket
        .bind_device(Some(iface.as_bytes()))
        .map_err(TunnelError::Transport)?;
    log::info!("Transport bound to interface {}", iface);
    Ok(())
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_to_interface(_socket: &Socket, iface: &str) -> Result<()> {
    Err(TunnelError::Config(format!(
        "binding to interface {} is not supported on this platform",
        iface
    )))
}

/// Pump IPv4/TCP packets from the TUN device into the transport.
///
/// TUN read errors are retried after the configured backoff. Returns when
/// `stop` is set or a transport write fails.
pub fn forward_tun_to_transport<W: Write>(
    device: &dyn TunDevice,
    writer: &mut W,
    config: &ClientConfig,
    stop: &AtomicBool,
) -> Result<()> {
    let mut buf = vec![0u8; config.mtu];

    while !stop.load(Ordering::SeqCst) {
        let n = match device.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!("Error reading packet from {}: {}", device.name(), e);
                thread::sleep(config.read_backoff);
                continue;
            }
        };

        let packet = &buf[..n];
        if !is_ipv4_tcp(packet) {
            continue;
        }
        if log::log_enabled!(log::Level::Debug) {
            if let Ok(parsed) = parse_ipv4(packet) {
                log::debug!("[->] {}", parsed);
            }
        }

        config.framing.write_packet(writer, packet)?;
    }
    Ok(())
}

/// Pump packets from the transport into the TUN device, rewriting their
/// destination to the client address.
///
/// Returns `Ok(())` when the server closes the connection.
pub fn forward_transport_to_tun<R: Read>(
    reader: &mut R,
    device: &dyn TunDevice,
    config: &ClientConfig,
) -> Result<()> {
    let translator = AddressTranslator::destination(config.client_addr);

    while let Some(packet) = config.framing.read_packet(reader, config.max_packet)? {
        let packet = match translator.apply(packet) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("Dropping packet from server: {}", e);
                continue;
            }
        };

        if log::log_enabled!(log::Level::Debug) {
            if let Ok(parsed) = parse_ipv4(&packet) {
                log::debug!("[<-] {}", parsed);
            }
        }

        if let Err(e) = device.write(&packet) {
            log::warn!("Failed to write packet to {}: {}", device.name(), e);
        }
    }

    log::info!("Server closed the connection");
    Ok(())
}

/// Connect and run both directions until either one ends
pub fn run(config: &ClientConfig, device: Arc<dyn TunDevice>) -> Result<()> {
    config.validate()?;
    let stream = connect(config)?;
    let result = run_with_stream(config, device, stream);
    log::info!("Client stopped");
    result
}

/// Like `run`, over an already-established transport connection
pub fn run_with_stream(config: &ClientConfig, device: Arc<dyn TunDevice>, stream: TcpStream) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = bounded::<Result<()>>(2);

    let mut outbound = stream.try_clone().map_err(TunnelError::Transport)?;
    let mut inbound = stream.try_clone().map_err(TunnelError::Transport)?;

    {
        let device = Arc::clone(&device);
        let config = config.clone();
        let stop = Arc::clone(&stop);
        let done_tx = done_tx.clone();
        thread::Builder::new()
            .name("tun-to-transport".into())
            .spawn(move || {
                let result = forward_tun_to_transport(device.as_ref(), &mut outbound, &config, &stop);
                let _ = done_tx.send(result);
            })
            .map_err(TunnelError::Transport)?;
    }

    {
        let config = config.clone();
        thread::Builder::new()
            .name("transport-to-tun".into())
            .spawn(move || {
                let result = forward_transport_to_tun(&mut inbound, device.as_ref(), &config);
                let _ = done_tx.send(result);
            })
            .map_err(TunnelError::Transport)?;
    }

    let result = done_rx.recv().unwrap_or_else(|_| {
        Err(TunnelError::Transport(io::Error::new(
            io::ErrorKind::Other,
            "forwarder exited without reporting",
        )))
    });

    stop.store(true, Ordering::SeqCst);
    // Unblocks whichever pump is still inside a transport call
    let _ = stream.shutdown(std::net::Shutdown::Both);
    result
}
