//! Linux TUN/TAP interface handle for the virtio-net backend.
//!
//! Grounded in the rust-vmm-style `Tap` wrapper (see virt-do-lumper's
//! `devices/tap.rs`): open `/dev/net/tun`, then `TUNSETIFF` with `IFF_TAP |
//! IFF_NO_PI` to attach to (or create) a named interface.

use std::fs::File;
use std::io::{Read, Result as IoResult, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use libc::{c_char, IFF_NO_PI, IFF_TAP};
use vmm_sys_util::ioctl::ioctl_with_mut_ref;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

const TAP_FILE: &[u8] = b"/dev/net/tun\0";
const IFNAMSIZ: usize = 16;

const TUNTAP: std::os::raw::c_uint = 84; // ASCII 'T', see <linux/if_tun.h>
ioctl_iow_nr!(TUNSETIFF, TUNTAP, 202, std::os::raw::c_int);

#[repr(C)]
struct Ifreq {
    name: [u8; IFNAMSIZ],
    flags: i16,
    _pad: [u8; 22],
}

/// A TAP network interface backing a `virtio-net` device.
pub struct Tap {
    file: File,
}

impl Tap {
    /// Attach to (creating if necessary) the named TAP interface.
    pub fn open_named(if_name: &str) -> std::io::Result<Self> {
        if if_name.len() >= IFNAMSIZ {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("interface name {:?} too long (max {})", if_name, IFNAMSIZ - 1),
            ));
        }

        let fd = unsafe {
            libc::open(
                TAP_FILE.as_ptr() as *const c_char,
                libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let file = unsafe { File::from_raw_fd(fd) };

        let mut req = Ifreq {
            name: [0u8; IFNAMSIZ],
            flags: (IFF_TAP | IFF_NO_PI) as i16,
            _pad: [0u8; 22],
        };
        req.name[..if_name.len()].copy_from_slice(if_name.as_bytes());

        let ret = unsafe { ioctl_with_mut_ref(&file, TUNSETIFF(), &mut req) };
        if ret < 0 {
            return Err(std::io::Error::last_os_error());
        }

        log::info!("virtio-net: attached to tap interface {}", if_name);
        Ok(Self { file })
    }
}

impl Read for Tap {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        self.file.read(buf)
    }
}

impl Write for Tap {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}

impl AsRawFd for Tap {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
