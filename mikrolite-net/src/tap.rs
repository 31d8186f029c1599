//! Raw TAP device creation via `TUNSETIFF`/`TUNSETPERSIST`.
//!
//! Everything else about an interface (address, up/down, bridge
//! membership) goes through `rtnetlink`; only the device's initial
//! creation needs these ioctls. `TUNSETPERSIST` is what makes the device
//! outlive the fd that created it — without it the TAP vanishes the
//! moment `file` is dropped at the end of `create`.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::AsRawFd as _;

use nix::ioctl_write_int;
use nix::ioctl_write_ptr;
use nix::libc;

const TUN_PATH: &str = "/dev/net/tun";
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;

ioctl_write_ptr!(tun_set_iff, b'T', 202, libc::ifreq);
ioctl_write_int!(tun_set_persist, b'T', 203);

/// Creates a persistent TAP device named `name`. Tolerates the device
/// already existing with the same name (idempotent under retry).
pub fn create(name: &str) -> io::Result<()> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface name {name:?} too long for IFNAMSIZ"),
        ));
    }

    let mut ifr_name = [0 as libc::c_char; libc::IFNAMSIZ];
    for (dst, byte) in ifr_name.iter_mut().zip(name.bytes()) {
        *dst = byte as libc::c_char;
    }

    let file = OpenOptions::new().read(true).write(true).open(TUN_PATH)?;

    let mut req = libc::ifreq {
        ifr_name,
        // SAFETY: `ifru_flags` is the only member of the union we read or
        // write; zeroing the rest is valid for every variant of `ifr_ifru`.
        ifr_ifru: unsafe { std::mem::zeroed() },
    };
    req.ifr_ifru.ifru_flags = IFF_TAP | IFF_NO_PI;

    // SAFETY: `file` stays open for the call, and `req` is a valid
    // `ifreq` the kernel only reads `ifr_name`/`ifr_flags` from.
    unsafe {
        tun_set_iff(file.as_raw_fd(), &req)?;
    }

    // SAFETY: `file` stays open for the call; `1` is the documented
    // "set persistent" argument to `TUNSETPERSIST`.
    unsafe {
        tun_set_persist(file.as_raw_fd(), 1)?;
    }

    Ok(())
}
