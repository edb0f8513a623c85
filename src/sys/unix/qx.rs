//! The QX side channel (§5, §6.2): an in-process `socketpair(2)` used to
//! hand an accepted connection from a dispatcher reactor to a worker
//! reactor without any shared memory or lock. Each end behaves like any
//! other socket device once registered; `qx::pair` only wraps the creation
//! step.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::error::{Error, Result};

/// Create a connected pair of non-blocking, close-on-exec `SOCK_SEQPACKET`
/// endpoints. `SOCK_SEQPACKET` preserves the `{cmd, scktype, syshnd,
/// remoteaddr}` message in §6.2 as one atomic read, matching a UDP-like
/// datagram boundary without needing an actual network address family.
pub fn pair() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    syscall!(socketpair(
        libc::AF_UNIX,
        libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        0,
        fds.as_mut_ptr()
    ))
    .map_err(Error::from_io)?;
    // SAFETY: `socketpair` initialized both descriptors on success.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}
