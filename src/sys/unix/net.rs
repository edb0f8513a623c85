//! `Skad` ↔ kernel `sockaddr` conversion and raw socket creation, in the
//! same spirit as the teacher's own `sys/unix/net.rs` (which does the
//! equivalent job for `std::net::SocketAddr`).

use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use crate::error::{Error, Result};
use crate::skad::Skad;

/// Create a non-blocking, close-on-exec socket for `(domain, ty, protocol)`,
/// using `SOCK_NONBLOCK|SOCK_CLOEXEC` atomically where the target supports
/// it (every Linux/BSD target this crate builds for does).
pub fn new_ip_socket(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> Result<RawFd> {
    let fd = syscall!(socket(domain, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, protocol))
        .map_err(Error::from_io)?;
    Ok(fd)
}

pub fn set_nonblock(fd: RawFd) -> Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL)).map_err(Error::from_io)?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK)).map_err(Error::from_io)?;
    Ok(())
}

/// Fill a `sockaddr_storage` from `skad`, returning the populated length.
/// Only the IPv4/IPv6 variants have a kernel wire representation; callers
/// must route UNIX/Link/Qx addresses through their own path.
pub fn sockaddr_from_skad(
    skad: &Skad,
    storage: &mut libc::sockaddr_storage,
) -> Result<libc::socklen_t> {
    if let Some((v4, port)) = skad.ipv4_parts() {
        let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_port = port.to_be();
        sin.sin_addr.s_addr = u32::from_ne_bytes(v4.octets());
        // SAFETY: `sockaddr_in` is smaller than `sockaddr_storage`.
        unsafe {
            std::ptr::write(storage as *mut _ as *mut libc::sockaddr_in, sin);
        }
        return Ok(mem::size_of::<libc::sockaddr_in>() as libc::socklen_t);
    }
    if let Some((v6, port, scope_id)) = skad.ipv6_parts() {
        let mut sin6: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        sin6.sin6_port = port.to_be();
        sin6.sin6_addr.s6_addr = v6.octets();
        sin6.sin6_scope_id = scope_id;
        // SAFETY: `sockaddr_in6` is smaller than `sockaddr_storage`.
        unsafe {
            std::ptr::write(storage as *mut _ as *mut libc::sockaddr_in6, sin6);
        }
        return Ok(mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t);
    }
    if let Some(path) = skad.unix_path() {
        return sockaddr_un_from_path(path, storage);
    }
    Err(Error::Inval)
}

/// Fill a `sockaddr_un` in place at the head of `storage`. `sun_path` has no
/// room for a trailing NUL once the path fills it entirely, so a path at or
/// past that length is rejected up front rather than silently truncated.
fn sockaddr_un_from_path(
    path: &Path,
    storage: &mut libc::sockaddr_storage,
) -> Result<libc::socklen_t> {
    let bytes = path.as_os_str().as_bytes();
    // SAFETY: `sockaddr_storage` is zeroed by the caller before this call.
    let sun: &mut libc::sockaddr_un = unsafe { &mut *(storage as *mut _ as *mut libc::sockaddr_un) };
    if bytes.is_empty() || bytes.len() >= sun.sun_path.len() {
        return Err(Error::Inval);
    }
    sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, &b) in sun.sun_path.iter_mut().zip(bytes) {
        *dst = b as libc::c_char;
    }
    let header_len = mem::size_of::<libc::sa_family_t>();
    Ok((header_len + bytes.len() + 1) as libc::socklen_t)
}

/// Decode a kernel-filled `sockaddr_storage` (as returned by `accept`,
/// `getpeername`, `recvfrom`, ...) back into a `Skad`.
pub fn skad_from_sockaddr(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Result<Skad> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
            // SAFETY: length checked above.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let addr = Ipv4Addr::from(u32::from_ne_bytes(sin.sin_addr.s_addr.to_ne_bytes()));
            Ok(Skad::inet4(addr, u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
            // SAFETY: length checked above.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let addr = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(Skad::inet6(addr, u16::from_be(sin6.sin6_port), sin6.sin6_scope_id))
        }
        libc::AF_UNIX => {
            let header_len = mem::size_of::<libc::sa_family_t>();
            if (len as usize) <= header_len {
                // Unnamed (client-side `connect`-only) socket: no path to
                // report, but still a valid UNIX address.
                return Ok(Skad::unix(std::path::PathBuf::from("")));
            }
            // SAFETY: length checked above, `storage` outlives this slice.
            let sun = unsafe { &*(storage as *const _ as *const libc::sockaddr_un) };
            let path_len = (len as usize - header_len).min(sun.sun_path.len());
            let raw: Vec<u8> = sun.sun_path[..path_len]
                .iter()
                .take_while(|&&b| b != 0)
                .map(|&b| b as u8)
                .collect();
            Ok(Skad::unix(std::path::PathBuf::from(
                std::ffi::OsStr::from_bytes(&raw),
            )))
        }
        _ => Err(Error::Inval),
    }
}

