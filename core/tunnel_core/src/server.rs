//! Tunnel server: accept loop and graceful shutdown
//!
//! The listener is polled with mio alongside a `Waker`, so `shutdown` can
//! interrupt a blocked accept loop from any thread. Accepted connections are
//! switched to blocking mode and served by one handler thread each.
//!
//! Shutdown order:
//! 1. stop admitting (draining flag)
//! 2. close the listening socket and wake the accept loop
//! 3. wait for tracked connections to finish, bounded by the drain timeout

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;

use crate::config::ServerConfig;
use crate::connections::ConnectionSet;
use crate::endpoint::TunnelEndpoint;
use crate::error::{Result, TunnelError};
use crate::handler::ConnectionHandler;

// ============================================================================
// Constants
// ============================================================================

/// mio token for the listening socket
const LISTENER_TOKEN: Token = Token(0);

/// mio token for the shutdown waker
const WAKER_TOKEN: Token = Token(1);

// ============================================================================
// Server
// ============================================================================

pub struct Server {
    config: ServerConfig,
    endpoint: Arc<TunnelEndpoint>,
    connections: Arc<ConnectionSet>,
    /// `None` once shutdown has closed it
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    draining: AtomicBool,
}

impl Server {
    /// Validate `config` and bind the listening socket
    pub fn bind(config: ServerConfig, endpoint: Arc<TunnelEndpoint>) -> Result<Arc<Server>> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen_addr.as_str()).map_err(TunnelError::Transport)?;
        listener.set_nonblocking(true).map_err(TunnelError::Transport)?;
        let local_addr = listener.local_addr().map_err(TunnelError::Transport)?;

        let poll = Poll::new().map_err(TunnelError::Transport)?;
        let fd = listener.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), LISTENER_TOKEN, Interest::READABLE)
            .map_err(TunnelError::Transport)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(TunnelError::Transport)?;
        let registry = poll.registry().try_clone().map_err(TunnelError::Transport)?;

        log::info!("Server listening on {}", local_addr);

        let connections = ConnectionSet::with_metrics(Arc::clone(endpoint.metrics()));
        Ok(Arc::new(Server {
            config,
            endpoint,
            connections,
            listener: Mutex::new(Some(listener)),
            local_addr,
            poll: Mutex::new(poll),
            registry,
            waker,
            draining: AtomicBool::new(false),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connections(&self) -> &Arc<ConnectionSet> {
        &self.connections
    }

    pub fn endpoint(&self) -> &Arc<TunnelEndpoint> {
        &self.endpoint
    }

    pub fn is_shutting_down(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Accept connections until `shutdown` is called.
    ///
    /// Each connection is served on its own thread. Returns once the listener
    /// has been closed; handlers may still be running.
    pub fn serve(&self) -> Result<()> {
        let mut poll = self.poll.lock();
        let mut events = Events::with_capacity(128);

        while !self.is_shutting_down() {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(TunnelError::Transport(e));
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_pending(),
                    WAKER_TOKEN => log::debug!("Accept loop woken"),
                    _ => {}
                }
            }
        }

        log::info!("Accept loop on {} stopped", self.local_addr);
        Ok(())
    }

    fn accept_pending(&self) {
        loop {
            let accepted = {
                let listener = self.listener.lock();
                match listener.as_ref() {
                    Some(listener) => listener.accept(),
                    None => return,
                }
            };

            match accepted {
                Ok((stream, peer)) => {
                    if self.is_shutting_down() {
                        log::debug!("Refusing connection from {} while draining", peer);
                        continue;
                    }
                    if let Err(e) = self.spawn_handler(stream, peer) {
                        log::error!("Failed to start handler for {}: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn spawn_handler(&self, stream: TcpStream, peer: SocketAddr) -> std::io::Result<()> {
        stream.set_nonblocking(false)?;
        let guard = self.connections.track(stream.try_clone()?);
        let handler = ConnectionHandler::new(Arc::clone(&self.endpoint), &self.config);

        log::info!("New connection from {} (id {})", peer, guard.id());

        thread::Builder::new()
            .name(format!("conn-{}", peer))
            .spawn(move || {
                let _guard = guard;
                let mut stream = stream;
                match handler.run(&mut stream) {
                    Ok(()) => log::info!("Connection from {} closed", peer),
                    Err(e) => log::warn!("Connection from {} failed: {}", peer, e),
                }
            })?;
        Ok(())
    }

    /// Stop accepting and wait for open connections to finish.
    ///
    /// Returns `ShutdownTimeout` if connections are still open after the
    /// drain timeout. They are left running; see `close_connections`.
    pub fn shutdown(&self) -> Result<()> {
        if self.draining.swap(true, Ordering::SeqCst) {
            log::debug!("Shutdown already in progress");
        } else {
            log::info!(
                "Shutting down server on {} ({} connections open)",
                self.local_addr,
                self.connections.len()
            );
        }

        if let Some(listener) = self.listener.lock().take() {
            let fd = listener.as_raw_fd();
            if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                log::debug!("Failed to deregister listener: {}", e);
            }
            drop(listener);
        }

        if let Err(e) = self.waker.wake() {
            log::warn!("Failed to wake accept loop: {}", e);
        }

        let drain_timeout = self.config.drain_timeout;
        if self.connections.wait_empty(drain_timeout) {
            log::info!("All connections drained");
            log::debug!("Final counters:\n{}", self.endpoint.metrics().render());
            Ok(())
        } else {
            log::warn!(
                "Drain timeout reached with {} connections remaining",
                self.connections.len()
            );
            Err(TunnelError::ShutdownTimeout(drain_timeout))
        }
    }

    /// Force every open connection closed; returns how many were open
    pub fn close_connections(&self) -> usize {
        let closed = self.connections.close_all();
        if closed > 0 {
            log::warn!("Force-closed {} connections", closed);
        }
        closed
    }
}
