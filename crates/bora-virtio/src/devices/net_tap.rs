//! Linux tap backend for the virtio-net frontend.
//!
//! Opens `/dev/net/tun` in non-blocking mode with `IFF_VNET_HDR`, so the
//! kernel prepends/consumes the vnet header and scatter I/O maps directly
//! onto `readv`/`writev`. The embedder registers [`TapBackend::as_raw_fd`]
//! with its event loop and invokes the device's RX callback on readable.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use tracing::warn;

use crate::devices::net::NetBackend;

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNSETVNETHDRSZ: libc::c_ulong = 0x4004_54d8;

// Matches the kernel's struct ifreq: 16 name bytes plus a 24-byte union.
#[repr(C)]
struct IfReq {
    name: [u8; libc::IF_NAMESIZE],
    flags: libc::c_short,
    _pad: [u8; 22],
}

pub struct TapBackend {
    name: String,
    fd: OwnedFd,
}

impl TapBackend {
    /// Attach to the named tap interface.
    pub fn open(name: &str) -> io::Result<Self> {
        if name.len() >= libc::IF_NAMESIZE || name.contains('\0') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid tap interface name '{name}'"),
            ));
        }

        let path = CString::new("/dev/net/tun").map_err(|_| io::ErrorKind::InvalidInput)?;
        let raw = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut ifr = IfReq {
            name: [0; libc::IF_NAMESIZE],
            flags: (libc::IFF_TAP | libc::IFF_NO_PI | libc::IFF_VNET_HDR) as libc::c_short,
            _pad: [0; 22],
        };
        ifr.name[..name.len()].copy_from_slice(name.as_bytes());

        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            name: name.to_string(),
            fd,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tap fd, for registration with the embedder's event loop.
    pub fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn iovecs(segments: &[&[u8]]) -> Vec<libc::iovec> {
        segments
            .iter()
            .map(|s| libc::iovec {
                iov_base: s.as_ptr() as *mut libc::c_void,
                iov_len: s.len(),
            })
            .collect()
    }
}

impl NetBackend for TapBackend {
    fn apply_features(&self, _features: u64, vnet_hdr_len: usize) {
        let size = vnet_hdr_len as libc::c_int;
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), TUNSETVNETHDRSZ as _, &size) };
        if ret < 0 {
            warn!(
                tap = %self.name,
                vnet_hdr_len,
                err = %io::Error::last_os_error(),
                "failed to set vnet header size"
            );
        }
    }

    fn send(&self, segments: &[&[u8]]) -> io::Result<usize> {
        let iovs = Self::iovecs(segments);
        let n = unsafe {
            libc::writev(
                self.fd.as_raw_fd(),
                iovs.as_ptr(),
                iovs.len() as libc::c_int,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn recv(&self, segments: &mut [&mut [u8]]) -> io::Result<usize> {
        let iovs: Vec<libc::iovec> = segments
            .iter_mut()
            .map(|s| libc::iovec {
                iov_base: s.as_mut_ptr() as *mut libc::c_void,
                iov_len: s.len(),
            })
            .collect();
        let n = unsafe {
            libc::readv(
                self.fd.as_raw_fd(),
                iovs.as_ptr(),
                iovs.len() as libc::c_int,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                // Nothing queued; the event loop will call back.
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }
}
