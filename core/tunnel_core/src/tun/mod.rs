//! TUN device access
//!
//! A TUN device exchanges raw IP packets (no Ethernet header) with user
//! space. Each `read` returns exactly one packet delivered by the kernel and
//! each `write` injects one packet.
//!
//! - `linux`: `/dev/net/tun` opened with `IFF_TUN | IFF_NO_PI`
//! - `memory`: in-process queues, for tests and loopback experiments

use std::io;
use std::sync::Arc;

#[cfg(target_os = "linux")]
pub mod linux;
pub mod memory;

#[cfg(target_os = "linux")]
pub use linux::LinuxTun;
pub use memory::MemoryTun;

// ============================================================================
// Device Trait
// ============================================================================

/// A duplex packet channel backed by a TUN interface.
///
/// Implementations are shared between the reader thread and every
/// connection handler, hence `&self` I/O and `Send + Sync`.
pub trait TunDevice: Send + Sync {
    /// Interface name (e.g. "tun0")
    fn name(&self) -> &str;

    /// Block until one packet is available and copy it into `buf`
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet
    fn write(&self, packet: &[u8]) -> io::Result<usize>;
}

impl<T: TunDevice + ?Sized> TunDevice for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        (**self).write(packet)
    }
}

/// Attach to the TUN interface `name` using the platform implementation
pub fn open(name: &str) -> io::Result<Arc<dyn TunDevice>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxTun::open(name)?))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("TUN device {} requires Linux", name),
        ))
    }
}
