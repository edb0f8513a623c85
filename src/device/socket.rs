//! The socket device state machine (§4.4): connection progress, the type
//! table, bind/connect/listen/accept ioctls, and stream/stateless/SCTP/BPF
//! method dispatch.
//!
//! Progress is a tagged enum, not the original's OR-of-single-bits (§9
//! Design Note "Connection progress bitmask").

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use crate::device::{DeviceOps, Disposition, ReadOutcome, WriteOutcome};
use crate::error::{Error, Result};
use crate::skad::Skad;
use crate::sys::unix::{new_ip_socket, sockaddr_from_skad, skad_from_sockaddr};

/// The socket device's position in its connection/accept/TLS state machine
/// (§4.4 progress diagram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Listening,
    Connecting,
    ConnectingSsl,
    Connected,
    AcceptingSsl,
    Accepted,
}

/// The socket type table (§4.4). Each variant fixes `(address family,
/// socket type, protocol)`; SCTP/BPF variants are carried for completeness
/// of the type table even though SCTP's ancillary-data path and BPF's
/// device are thin (see the Open Questions in §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Tcp4,
    Tcp6,
    Udp4,
    Udp6,
    Sctp4,
    Sctp6,
    Sctp4Sp,
    Sctp6Sp,
    Icmp4,
    Icmp6,
    Unix,
    /// In-process `socketpair`-based side channel (§6.2).
    Qx,
}

impl SockType {
    fn domain_type_proto(self) -> (libc::c_int, libc::c_int, libc::c_int) {
        match self {
            SockType::Tcp4 => (libc::AF_INET, libc::SOCK_STREAM, 0),
            SockType::Tcp6 => (libc::AF_INET6, libc::SOCK_STREAM, 0),
            SockType::Udp4 => (libc::AF_INET, libc::SOCK_DGRAM, 0),
            SockType::Udp6 => (libc::AF_INET6, libc::SOCK_DGRAM, 0),
            SockType::Sctp4 => (libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_SCTP),
            SockType::Sctp6 => (libc::AF_INET6, libc::SOCK_STREAM, libc::IPPROTO_SCTP),
            SockType::Sctp4Sp => (libc::AF_INET, libc::SOCK_SEQPACKET, libc::IPPROTO_SCTP),
            SockType::Sctp6Sp => (libc::AF_INET6, libc::SOCK_SEQPACKET, libc::IPPROTO_SCTP),
            SockType::Icmp4 => (libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_ICMP),
            SockType::Icmp6 => (libc::AF_INET6, libc::SOCK_RAW, libc::IPPROTO_ICMPV6),
            SockType::Unix => (libc::AF_UNIX, libc::SOCK_STREAM, 0),
            SockType::Qx => (libc::AF_UNIX, libc::SOCK_SEQPACKET, 0),
        }
    }

    pub fn is_stream(self) -> bool {
        matches!(
            self,
            SockType::Tcp4
                | SockType::Tcp6
                | SockType::Sctp4
                | SockType::Sctp6
                | SockType::Unix
        )
    }

    pub fn is_seqpacket(self) -> bool {
        matches!(self, SockType::Sctp4Sp | SockType::Sctp6Sp | SockType::Qx)
    }

    pub fn is_connectable(self) -> bool {
        !matches!(self, SockType::Icmp4 | SockType::Icmp6)
    }

    pub fn is_listenable(self) -> bool {
        self.is_stream() || self.is_seqpacket()
    }

    /// Wire discriminant for the QX `NEWCONN` hand-off message (§6.2);
    /// order matches declaration order, not a stable ABI, since both ends
    /// of a QX pair are always the same build.
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            SockType::Tcp4 => 0,
            SockType::Tcp6 => 1,
            SockType::Udp4 => 2,
            SockType::Udp6 => 3,
            SockType::Sctp4 => 4,
            SockType::Sctp6 => 5,
            SockType::Sctp4Sp => 6,
            SockType::Sctp6Sp => 7,
            SockType::Icmp4 => 8,
            SockType::Icmp6 => 9,
            SockType::Unix => 10,
            SockType::Qx => 11,
        }
    }

    pub(crate) fn from_wire(b: u8) -> Option<SockType> {
        Some(match b {
            0 => SockType::Tcp4,
            1 => SockType::Tcp6,
            2 => SockType::Udp4,
            3 => SockType::Udp6,
            4 => SockType::Sctp4,
            5 => SockType::Sctp6,
            6 => SockType::Sctp4Sp,
            7 => SockType::Sctp6Sp,
            8 => SockType::Icmp4,
            9 => SockType::Icmp6,
            10 => SockType::Unix,
            11 => SockType::Qx,
            _ => return None,
        })
    }
}

/// Options accepted by [`SocketDevice::bind`] (§4.4 "Bind (ioctl)").
#[derive(Debug, Clone, Default)]
pub struct BindOpts {
    pub reuseaddr: bool,
    pub reuseport: bool,
    pub v6only: bool,
    pub broadcast: bool,
    pub transparent: bool,
    /// Downgrade setsockopt failures to warnings instead of erroring out.
    pub ignerr: bool,
}

/// Placeholder TLS role, wired to `rustls` when the `tls` feature is
/// enabled. Kept as a plain enum (rather than `()`) so call sites compile
/// identically with the feature on or off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    None,
    Client,
    Server,
}

/// The handshake/established connection state for the `tls` feature.
/// `rustls` has no single concrete type shared by client and server roles
/// (both merely implement the `Connection` trait), so the two are kept as
/// separate variants rather than one `Box<dyn Connection>` — avoids an
/// extra vtable indirection on every read/write for the common case where a
/// reactor only ever plays one TLS role per device.
#[cfg(feature = "tls")]
enum TlsState {
    None,
    Client(rustls::ClientConnection),
    Server(rustls::ServerConnection),
}

#[cfg(feature = "tls")]
impl std::fmt::Debug for TlsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsState::None => f.write_str("TlsState::None"),
            TlsState::Client(_) => f.write_str("TlsState::Client"),
            TlsState::Server(_) => f.write_str("TlsState::Server"),
        }
    }
}

#[cfg(feature = "tls")]
impl TlsState {
    fn connection_mut(&mut self) -> Option<&mut dyn rustls::Connection> {
        match self {
            TlsState::None => None,
            TlsState::Client(c) => Some(c),
            TlsState::Server(c) => Some(c),
        }
    }

    fn is_handshaking(&self) -> bool {
        self.connection_mut()
            .map(|c| c.is_handshaking())
            .unwrap_or(false)
    }
}

/// A socket device. Implements [`DeviceOps`] for the core; the `on_*`
/// callbacks here are the application-facing hooks the core's event vtable
/// invokes.
pub struct SocketDevice<W> {
    ty: SockType,
    fd: Option<OwnedFd>,
    progress: Progress,
    localaddr: Option<Skad>,
    remoteaddr: Option<Skad>,
    /// `SO_ORIGINAL_DST`-derived address, when the listener captured one
    /// (§4.4 "Accept path"). `intercepted` is true when it disagrees with
    /// `localaddr`.
    orgdstaddr: Option<Skad>,
    intercepted: bool,
    backlog: i32,
    #[cfg_attr(not(feature = "tls"), allow(dead_code))]
    tls_role: TlsRole,
    #[cfg(feature = "tls")]
    tls: TlsState,
    /// Set on a listener so `read` can stage each accepted `(fd, peer)`
    /// pair somewhere a [`crate::net`] dispatcher with `&mut Reactor` access
    /// can drain it from `Service::poll` (§4.4 "Accept path" — neither
    /// building a local child device nor writing a QX hand-off message can
    /// happen from inside this device's own vtable methods).
    accept_mailbox: Option<Rc<RefCell<VecDeque<(RawFd, Skad)>>>>,
    pub(crate) on_connect: Option<Box<dyn FnMut(&mut SocketDevice<W>)>>,
    on_read_cb: Option<Box<dyn FnMut(&[u8], Option<&Skad>)>>,
    on_disconnect_cb: Option<Box<dyn FnMut()>>,
    _marker: std::marker::PhantomData<W>,
}

impl<W> SocketDevice<W> {
    pub fn new(ty: SockType) -> SocketDevice<W> {
        SocketDevice {
            ty,
            fd: None,
            progress: Progress::Connecting,
            localaddr: None,
            remoteaddr: None,
            orgdstaddr: None,
            intercepted: false,
            backlog: 0,
            tls_role: TlsRole::None,
            #[cfg(feature = "tls")]
            tls: TlsState::None,
            accept_mailbox: None,
            on_connect: None,
            on_read_cb: None,
            on_disconnect_cb: None,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn local_addr(&self) -> Option<&Skad> {
        self.localaddr.as_ref()
    }

    pub fn remote_addr(&self) -> Option<&Skad> {
        self.remoteaddr.as_ref()
    }

    pub fn is_intercepted(&self) -> bool {
        self.intercepted
    }

    pub fn kind(&self) -> SockType {
        self.ty
    }

    /// Hook this listener up to a shared queue a [`crate::net`] dispatcher
    /// drains once per loop iteration (§4.4 "Accept path").
    pub fn set_accept_mailbox(&mut self, mailbox: Rc<RefCell<VecDeque<(RawFd, Skad)>>>) {
        self.accept_mailbox = Some(mailbox);
    }

    pub fn set_on_read<F>(&mut self, f: F)
    where
        F: FnMut(&[u8], Option<&Skad>) + 'static,
    {
        self.on_read_cb = Some(Box::new(f));
    }

    /// Fires exactly once, when this device is reaped (§7 "`on_disconnect`
    /// invoked exactly once"). Used by the DNS client's TCP fallback to
    /// notice a lost connection and fail its TCP-bound pending requests.
    pub fn set_on_disconnect<F>(&mut self, f: F)
    where
        F: FnMut() + 'static,
    {
        self.on_disconnect_cb = Some(Box::new(f));
    }

    /// Fires exactly once, the first time this device reaches
    /// [`Progress::Connected`] — whether `connect` returned synchronously
    /// or the completion is discovered later via `SO_ERROR` (§4.4).
    pub fn set_on_connect<F>(&mut self, f: F)
    where
        F: FnMut(&mut SocketDevice<W>) + 'static,
    {
        self.on_connect = Some(Box::new(f));
    }

    /// `getsockopt(SO_ERROR)`: 0 means the pending connect succeeded,
    /// anything else is the errno it failed with.
    fn take_socket_error(&self) -> Result<()> {
        let fd = self.raw_fd();
        let mut errval: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut errval as *mut _ as *mut libc::c_void,
            &mut len
        ))
        .map_err(Error::from_io)?;
        if errval == 0 {
            Ok(())
        } else {
            Err(Error::from_io(std::io::Error::from_raw_os_error(errval)))
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_ref().map(|fd| fd.as_raw_fd()).unwrap_or(-1)
    }

    /// `bind(2)` plus the socket options in §4.4. A bind twice fails with
    /// `Perm` ("operation in progress" in the original's wording; the Rust
    /// taxonomy's closest match is "operation not permitted").
    pub fn bind(&mut self, addr: &Skad, opts: &BindOpts) -> Result<()> {
        if self.localaddr.is_some() {
            return Err(Error::Perm);
        }
        let fd = self.raw_fd();
        if fd < 0 {
            return Err(Error::BadHnd);
        }

        self.setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, opts.reuseaddr, opts.ignerr)?;
        #[cfg(target_os = "linux")]
        self.setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, opts.reuseport, opts.ignerr)?;
        if self.ty == SockType::Tcp6 || self.ty == SockType::Udp6 {
            self.setsockopt_bool(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, opts.v6only, opts.ignerr)?;
        }
        self.setsockopt_bool(fd, libc::SOL_SOCKET, libc::SO_BROADCAST, opts.broadcast, opts.ignerr)?;
        #[cfg(target_os = "linux")]
        self.setsockopt_bool(fd, libc::SOL_IP, libc::IP_TRANSPARENT, opts.transparent, opts.ignerr)?;

        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = sockaddr_from_skad(addr, &mut storage)?;
        syscall!(bind(fd, &storage as *const _ as *const libc::sockaddr, len))
            .map_err(Error::from_io)?;

        self.localaddr = Some(addr.clone());
        Ok(())
    }

    fn setsockopt_bool(
        &self,
        fd: RawFd,
        level: libc::c_int,
        name: libc::c_int,
        value: bool,
        ignerr: bool,
    ) -> Result<()> {
        if !value {
            return Ok(());
        }
        let v: libc::c_int = 1;
        let res = syscall!(setsockopt(
            fd,
            level,
            name,
            &v as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t
        ));
        match res {
            Ok(_) => Ok(()),
            Err(e) if ignerr => {
                log::warn!("setsockopt({name}) failed, ignoring: {e}");
                Ok(())
            }
            Err(e) => Err(Error::from_io(e)),
        }
    }

    /// `listen(2)`. Stores `backlog`; `accept_tmout` is tracked by the
    /// reactor as a per-device timer, not here.
    pub fn listen(&mut self, backlog: i32) -> Result<()> {
        if self.progress == Progress::Listening {
            return Err(Error::Perm);
        }
        let fd = self.raw_fd();
        syscall!(listen(fd, backlog)).map_err(Error::from_io)?;
        self.backlog = backlog;
        self.progress = Progress::Listening;
        Ok(())
    }

    /// `connect(2)`. Returns `Ok(true)` on immediate success (the core
    /// defers firing `on_connect` to the next loop iteration, never from
    /// within this call, per §4.4), `Ok(false)` if the connect is in
    /// progress (`EINPROGRESS`).
    pub fn connect(&mut self, addr: &Skad) -> Result<bool> {
        let fd = self.raw_fd();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let len = sockaddr_from_skad(addr, &mut storage)?;
        self.remoteaddr = Some(addr.clone());

        match syscall!(connect(fd, &storage as *const _ as *const libc::sockaddr, len)) {
            Ok(_) => {
                self.progress = Progress::Connected;
                Ok(true)
            }
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                self.progress = Progress::Connecting;
                Ok(false)
            }
            Err(e) => Err(Error::from_io(e)),
        }
    }

    /// `accept4(2)` with `O_NONBLOCK|O_CLOEXEC` set atomically. One
    /// connection per call, matching the "one event per wakeup" fairness
    /// rule the stream/datagram read path follows (§4.3); the kernel queue
    /// is level-triggered, so a listener with more pending connections is
    /// simply handed another readable event next iteration.
    fn accept(&mut self) -> Result<Option<(RawFd, Skad)>> {
        let fd = self.raw_fd();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let accepted = syscall!(accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
        ));
        let child_fd = match accepted {
            Ok(fd) => fd,
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => return Ok(None),
            Err(e) => return Err(Error::from_io(e)),
        };

        let peer = skad_from_sockaddr(&storage, len).unwrap_or_else(|_| Skad::qx());
        Ok(Some((child_fd, peer)))
    }

    /// Fires `on_connect` exactly once if one is set, re-arming the slot
    /// afterwards so a later reconnect (not modeled here, but kept for
    /// symmetry with `ready`'s own take/restore dance) could fire it again.
    /// Used by [`crate::net::finish_connect`] to defer the immediate-success
    /// case (§4.4 "defers `on_connect` invocation to the next loop
    /// iteration, never fires from within the ioctl") to a zero-delay timer
    /// instead of firing from `connect` itself.
    pub(crate) fn fire_on_connect(&mut self) {
        if let Some(mut cb) = self.on_connect.take() {
            cb(self);
            self.on_connect = Some(cb);
        }
    }

    /// Wrap an already-accepted raw descriptor as a child `SocketDevice`
    /// (§4.4 "Accept path"): no `socket()` call, `make` just takes
    /// ownership of the fd it's handed.
    pub fn from_accepted_fd(
        ty: SockType,
        fd: RawFd,
        localaddr: Option<Skad>,
        remoteaddr: Skad,
    ) -> SocketDevice<W> {
        let mut dev = SocketDevice::new(ty);
        // SAFETY: caller passes a freshly `accept4`-ed fd it owns exclusively.
        dev.fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
        dev.localaddr = localaddr;
        dev.remoteaddr = Some(remoteaddr);
        dev.progress = Progress::Accepted;
        dev
    }

    /// Wrap an already-open descriptor directly, skipping `make`'s own
    /// `socket()` call — same mechanism as [`SocketDevice::from_accepted_fd`]
    /// but for a locally created fd with no peer address, namely one end of
    /// a `socketpair`-based QX side channel (§6.2).
    pub fn from_owned_fd(ty: SockType, fd: OwnedFd) -> SocketDevice<W> {
        let mut dev = SocketDevice::new(ty);
        dev.fd = Some(fd);
        dev.progress = Progress::Connected;
        dev
    }

    /// Zero-length stream write is the half-close indicator (§4.3):
    /// `shutdown(WR)`, success.
    fn half_close(&mut self) -> WriteOutcome {
        let fd = self.raw_fd();
        match syscall!(shutdown(fd, libc::SHUT_WR)) {
            Ok(_) => WriteOutcome::Wrote(0),
            Err(e) => WriteOutcome::Fatal(Error::from_io(e)),
        }
    }
}

impl<W: 'static> DeviceOps<W> for SocketDevice<W> {
    fn make(&mut self) -> Result<RawFd> {
        // `from_accepted_fd` already populated `self.fd` with an accepted
        // descriptor; the core's `make` step just needs the raw fd back to
        // register with the kernel event source, not a fresh `socket()`.
        if let Some(fd) = &self.fd {
            return Ok(fd.as_raw_fd());
        }
        let (domain, ty, proto) = self.ty.domain_type_proto();
        let fd = new_ip_socket(domain, ty, proto)?;
        // SAFETY: `new_ip_socket` returns a freshly created, owned fd.
        self.fd = Some(unsafe { OwnedFd::from_raw_fd(fd) });
        Ok(fd)
    }

    fn kill(&mut self) {
        self.fd = None; // OwnedFd::drop closes it.
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn get_syshnd(&self) -> RawFd {
        self.raw_fd()
    }

    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        if self.progress == Progress::Listening {
            return match self.accept() {
                Ok(Some((fd, peer))) => {
                    match &self.accept_mailbox {
                        Some(mailbox) => mailbox.borrow_mut().push_back((fd, peer)),
                        // Nobody installed a dispatcher on this listener;
                        // the kernel already handed the fd to us, so it's
                        // ours to close.
                        None => {
                            let _ = syscall!(close(fd));
                        }
                    }
                    ReadOutcome::Again
                }
                Ok(None) => ReadOutcome::Again,
                Err(e) => ReadOutcome::Fatal(e),
            };
        }
        let fd = self.raw_fd();
        if self.ty.is_stream() {
            match syscall!(read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())) {
                Ok(0) => ReadOutcome::Eof,
                Ok(n) => ReadOutcome::Data(n as usize),
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => ReadOutcome::Again,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => ReadOutcome::Again,
                Err(e) => ReadOutcome::Fatal(Error::from_io(e)),
            }
        } else {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            match syscall!(recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len
            )) {
                Ok(n) => {
                    self.remoteaddr = skad_from_sockaddr(&storage, len).ok();
                    ReadOutcome::Data(n as usize)
                }
                Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => ReadOutcome::Again,
                Err(e) => ReadOutcome::Fatal(Error::from_io(e)),
            }
        }
    }

    fn write(&mut self, data: &[u8], dest: Option<&Skad>) -> WriteOutcome {
        if self.ty.is_stream() && data.is_empty() {
            return self.half_close();
        }
        let fd = self.raw_fd();
        let result = if let Some(dest) = dest {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let len = match sockaddr_from_skad(dest, &mut storage) {
                Ok(len) => len,
                Err(e) => return WriteOutcome::Fatal(e),
            };
            syscall!(sendto(
                fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_NOSIGNAL,
                &storage as *const _ as *const libc::sockaddr,
                len
            ))
        } else {
            syscall!(send(
                fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_NOSIGNAL
            ))
        };
        match result {
            Ok(n) => WriteOutcome::Wrote(n as usize),
            Err(e) if e.raw_os_error() == Some(libc::EAGAIN) => WriteOutcome::Again,
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => WriteOutcome::Again,
            Err(e) => WriteOutcome::Fatal(Error::from_io(e)),
        }
    }

    fn on_read(&mut self, data: &[u8], _src: Option<&Skad>) {
        // The reactor core has no reach into `self.remoteaddr`, so a
        // datagram socket's own `read` stashes the sender there; use that
        // instead of the (always-`None`) parameter the core passes.
        let src = self.remoteaddr.as_ref();
        if let Some(cb) = self.on_read_cb.as_mut() {
            cb(data, src);
        }
    }

    fn on_write(&mut self, _result: std::result::Result<usize, Error>, _ctx: W, _dest: Option<&Skad>) {}

    fn on_disconnect(&mut self) {
        if let Some(cb) = self.on_disconnect_cb.as_mut() {
            cb();
        }
    }

    /// Catches the async-connect-completes case: a synchronous `connect`
    /// success already set `progress = Connected` in [`SocketDevice::connect`]
    /// itself, so this only needs to handle the `EINPROGRESS` case, where
    /// the first writable event means the kernel has resolved the connect
    /// one way or the other (§4.4 "Connect (ioctl)").
    fn ready(&mut self, _events_readable: bool, events_writable: bool) -> Disposition {
        if self.progress == Progress::Connecting && events_writable {
            match self.take_socket_error() {
                Ok(()) => {
                    self.progress = Progress::Connected;
                    if let Some(mut cb) = self.on_connect.take() {
                        cb(self);
                        self.on_connect = Some(cb);
                    }
                    Disposition::Proceed
                }
                Err(_) => Disposition::Fatal,
            }
        } else {
            Disposition::Proceed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_bind_fails_with_perm() {
        let mut dev: SocketDevice<()> = SocketDevice::new(SockType::Tcp4);
        dev.localaddr = Some(Skad::inet4(Ipv4Addr::new(127, 0, 0, 1), 9987));
        let err = dev
            .bind(&Skad::inet4(Ipv4Addr::new(127, 0, 0, 1), 9988), &BindOpts::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "operation not permitted");
    }

    #[test]
    fn double_listen_fails_with_perm_and_keeps_state() {
        let mut dev: SocketDevice<()> = SocketDevice::new(SockType::Tcp4);
        dev.progress = Progress::Listening;
        dev.backlog = 16;
        let err = dev.listen(32).unwrap_err();
        assert_eq!(err.to_string(), "operation not permitted");
        assert_eq!(dev.progress, Progress::Listening);
        assert_eq!(dev.backlog, 16);
    }

    #[test]
    fn sock_type_listenable_table() {
        assert!(SockType::Tcp4.is_listenable());
        assert!(SockType::Sctp6Sp.is_listenable());
        assert!(!SockType::Udp4.is_listenable());
        assert!(!SockType::Icmp4.is_connectable());
    }

    #[test]
    fn ipv6_ambient() {
        let _ = Ipv6Addr::UNSPECIFIED;
    }
}
