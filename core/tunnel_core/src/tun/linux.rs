//! Linux TUN device via `/dev/net/tun`
//!
//! Requires root or `CAP_NET_ADMIN`. The interface must already be
//! configured (address, route, link up) with `ip`; this module only attaches
//! to it.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;

use super::TunDevice;

// ============================================================================
// Constants
// ============================================================================

/// Clone device for TUN/TAP interfaces
const TUN_DEVICE_PATH: &str = "/dev/net/tun";

/// TUN device (no Ethernet headers)
const IFF_TUN: libc::c_short = 0x0001;

/// No packet information prefix
const IFF_NO_PI: libc::c_short = 0x1000;

/// `_IOW('T', 202, int)`
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

// ============================================================================
// ifreq
// ============================================================================

/// Interface request for the TUNSETIFF ioctl (40 bytes on 64-bit Linux)
#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> io::Result<Self> {
        if name.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "device can't be empty"));
        }
        if name.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("device name {:?} longer than {} bytes", name, libc::IFNAMSIZ - 1),
            ));
        }

        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }
        Ok(req)
    }

    fn name(&self) -> String {
        let bytes: Vec<u8> = self
            .name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

// ============================================================================
// LinuxTun
// ============================================================================

/// An attached Linux TUN interface
pub struct LinuxTun {
    file: File,
    name: String,
}

impl LinuxTun {
    /// Attach to TUN interface `name` (created by the kernel if missing)
    pub fn open(name: &str) -> io::Result<Self> {
        let mut req = IfReq::new(name, IFF_TUN | IFF_NO_PI)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE_PATH)
            .map_err(|e| io::Error::new(e.kind(), format!("failed to open {}: {}", TUN_DEVICE_PATH, e)))?;

        // SAFETY: `req` is a properly initialised `struct ifreq` that lives for
        // the duration of the call; the fd is owned by `file`.
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req as *mut IfReq) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            return Err(io::Error::new(err.kind(), format!("ioctl TUNSETIFF failed: {}", err)));
        }

        let name = req.name();
        log::info!("Attached to TUN device {}", name);

        Ok(LinuxTun { file, name })
    }
}

impl TunDevice for LinuxTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    fn write(&self, packet: &[u8]) -> io::Result<usize> {
        (&self.file).write(packet)
    }
}
