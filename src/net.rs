//! Public device-construction helpers (§4.4): listen/connect wiring atop the
//! device core, and the multi-reactor QX accept dispatcher (§4.4
//! "Multi-reactor load distribution", §6.2's `{cmd, scktype, syshnd,
//! remoteaddr}` hand-off message, the `t06` reference pattern).
//!
//! A listener's own `read` method cannot build a child device or write a QX
//! hand-off message by itself — neither has `&mut Reactor` (§6.4's vtable is
//! deliberately narrow) — so every accepted `(fd, peer)` pair is staged in a
//! mailbox and drained by an [`AcceptDispatch`] [`Service::poll`], the same
//! pattern [`crate::dns::client`] uses for its own UDP/TCP mailboxes.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::device::socket::{BindOpts, Progress, SockType, SocketDevice};
use crate::device::{Capability, DeviceIdx};
use crate::error::{Error, Result};
use crate::reactor::Reactor;
use crate::services::Service;
use crate::skad::{FormatFlags, Skad};
use crate::sys::unix::Interest;

/// Bind a stream/seqpacket socket and `listen(2)` it (§4.4 "Listen"). The
/// device gets [`Capability::LENIENT`] so one bad `accept` doesn't halt the
/// whole listener (§4.3 "Failure model").
pub fn listen<W: 'static>(
    reactor: &mut Reactor<W>,
    ty: SockType,
    addr: &Skad,
    backlog: i32,
    opts: &BindOpts,
) -> Result<DeviceIdx> {
    let dev: SocketDevice<W> = SocketDevice::new(ty);
    let idx = reactor.make_device(Box::new(dev), Capability::IN | Capability::LENIENT)?;
    let sd = reactor
        .device_as_mut::<SocketDevice<W>>(idx)
        .ok_or(Error::BadHnd)?;
    sd.bind(addr, opts)?;
    sd.listen(backlog)?;
    Ok(idx)
}

/// Create and `bind` a stateless (UDP-family) device. Returns the device
/// unwatched beyond the default `IN` interest `make_device` already sets.
pub fn bind_stateless<W: 'static>(
    reactor: &mut Reactor<W>,
    ty: SockType,
    addr: &Skad,
    opts: &BindOpts,
) -> Result<DeviceIdx> {
    let dev: SocketDevice<W> = SocketDevice::new(ty);
    let idx = reactor.make_device(Box::new(dev), Capability::IN)?;
    let sd = reactor
        .device_as_mut::<SocketDevice<W>>(idx)
        .ok_or(Error::BadHnd)?;
    sd.bind(addr, opts)?;
    Ok(idx)
}

/// Start a non-blocking `connect()`. On immediate success, `on_connect` is
/// deferred to the next loop iteration via a zero-delay timer rather than
/// fired from within this call (§4.4 "never fires from within the ioctl").
/// On `EINPROGRESS`, `OUT` interest is enabled and, if `connect_tmout` is
/// set, a per-device timeout is armed; [`Reactor::halt`] already cancels a
/// device's own timer, so a connect that completes before the timeout just
/// leaves a harmless no-op entry in the heap.
pub fn connect<W: 'static>(
    reactor: &mut Reactor<W>,
    idx: DeviceIdx,
    addr: &Skad,
    connect_tmout: Option<Duration>,
) -> Result<()> {
    let immediate = {
        let sd = reactor
            .device_as_mut::<SocketDevice<W>>(idx)
            .ok_or(Error::BadHnd)?;
        sd.connect(addr)?
    };
    if immediate {
        finish_connect(reactor, idx);
    } else {
        reactor.watch(idx, Interest::READABLE.add(Interest::WRITABLE))?;
        if let Some(tmout) = connect_tmout {
            let at = Instant::now() + tmout;
            let timer_idx = reactor.schedule(at, move |reactor, _now| {
                let still_pending = reactor
                    .device_as_mut::<SocketDevice<W>>(idx)
                    .map(|dev| dev.progress() != Progress::Connected)
                    .unwrap_or(false);
                if still_pending {
                    reactor.halt(idx);
                }
            });
            reactor.set_device_timer(idx, timer_idx);
        }
    }
    Ok(())
}

/// Defer `on_connect` to the next loop iteration for a device that is
/// already connected — a synchronous `connect()` success, or a freshly
/// accepted child (§4.4).
pub(crate) fn finish_connect<W: 'static>(reactor: &mut Reactor<W>, idx: DeviceIdx) {
    reactor.schedule(Instant::now(), move |reactor, _now| {
        if let Some(dev) = reactor.device_as_mut::<SocketDevice<W>>(idx) {
            dev.fire_on_connect();
        }
    });
}

/// The mailbox a listener's `read` stages accepted connections into, and
/// the service that drains it with full reactor access (§4.4 "Accept
/// path"). One instance covers exactly one listener device.
pub struct AcceptDispatch<W> {
    listener: DeviceIdx,
    mailbox: Rc<RefCell<VecDeque<(RawFd, Skad)>>>,
    on_accept: Box<dyn FnMut(&mut Reactor<W>, DeviceIdx, RawFd, Skad)>,
}

impl<W: 'static> AcceptDispatch<W> {
    /// Hook `listener` (already `listen`'d) up to `on_accept`, which fires
    /// once per accepted connection with the listener's index and the raw
    /// `(fd, peer)` pair. The caller decides what `on_accept` does with
    /// them: build a local child device with [`accept_child`], or hand the
    /// fd to another reactor with [`Dispatcher::dispatch`].
    pub fn install<F>(reactor: &mut Reactor<W>, listener: DeviceIdx, on_accept: F) -> Result<()>
    where
        F: FnMut(&mut Reactor<W>, DeviceIdx, RawFd, Skad) + 'static,
    {
        let mailbox = Rc::new(RefCell::new(VecDeque::new()));
        {
            let sd = reactor
                .device_as_mut::<SocketDevice<W>>(listener)
                .ok_or(Error::BadHnd)?;
            sd.set_accept_mailbox(mailbox.clone());
        }
        reactor.register_service(Box::new(AcceptDispatch {
            listener,
            mailbox,
            on_accept: Box::new(on_accept),
        }));
        Ok(())
    }
}

impl<W: 'static> Service<W> for AcceptDispatch<W> {
    fn stop(&mut self, reactor: &mut Reactor<W>) {
        reactor.halt(self.listener);
    }

    fn name(&self) -> &str {
        "accept-dispatch"
    }

    fn poll(&mut self, reactor: &mut Reactor<W>) {
        let pending: Vec<(RawFd, Skad)> = self.mailbox.borrow_mut().drain(..).collect();
        for (fd, peer) in pending {
            (self.on_accept)(reactor, self.listener, fd, peer);
        }
    }
}

/// Build a local child device from an already-accepted descriptor (§4.4
/// "Otherwise, a child device is created, inheriting the parent's event
/// handlers"), wiring `on_connect`/`on_read` before registering it so
/// neither callback can be missed.
pub fn accept_child<W: 'static>(
    reactor: &mut Reactor<W>,
    listener: DeviceIdx,
    fd: RawFd,
    peer: Skad,
    on_connect: impl FnMut(&mut SocketDevice<W>) + 'static,
    on_read: impl FnMut(&[u8], Option<&Skad>) + 'static,
) -> Result<DeviceIdx> {
    let (ty, localaddr) = {
        let parent = reactor
            .device_as_mut::<SocketDevice<W>>(listener)
            .ok_or(Error::BadHnd)?;
        (parent.kind(), parent.local_addr().cloned())
    };
    let mut child: SocketDevice<W> = SocketDevice::from_accepted_fd(ty, fd, localaddr, peer);
    child.set_on_connect(on_connect);
    child.set_on_read(on_read);
    let idx = reactor.make_device(Box::new(child), Capability::IN)?;
    finish_connect(reactor, idx);
    Ok(idx)
}

/// Wire discriminant for the `NEWCONN` hand-off message (§6.2).
const NEWCONN: u8 = 1;

/// Encode `{cmd = NEWCONN, scktype, syshnd, remoteaddr}` (§6.2) as a single
/// `SOCK_SEQPACKET` datagram. `fd` travels as a plain integer rather than
/// `SCM_RIGHTS`-passed ancillary data: every worker reactor runs as a
/// thread of the same process (`t06 -t N`), so the descriptor table is
/// already shared and the raw number alone is valid on the receiving end.
/// `remoteaddr` rides along as its text form (§4.2's `Skad::format`) rather
/// than a bespoke binary layout — one fewer wire format to keep in sync.
fn encode_newconn(scktype: SockType, fd: RawFd, peer: &Skad) -> Vec<u8> {
    let addr_text = peer.format(FormatFlags::ADDR_PORT);
    let addr_bytes = addr_text.as_bytes();
    let mut out = Vec::with_capacity(6 + addr_bytes.len());
    out.push(NEWCONN);
    out.push(scktype.to_wire());
    out.extend_from_slice(&fd.to_be_bytes());
    out.extend_from_slice(addr_bytes);
    out
}

fn decode_newconn(buf: &[u8]) -> Result<(SockType, RawFd, Skad)> {
    if buf.len() < 6 || buf[0] != NEWCONN {
        return Err(Error::EcErr);
    }
    let scktype = SockType::from_wire(buf[1]).ok_or(Error::EcErr)?;
    let fd = RawFd::from_be_bytes(buf[2..6].try_into().map_err(|_| Error::EcErr)?);
    let addr_text = std::str::from_utf8(&buf[6..]).map_err(|_| Error::EcErr)?;
    let peer = Skad::parse(addr_text)?;
    Ok((scktype, fd, peer))
}

/// Owned by the dispatcher reactor: round-robins accepted connections
/// across a fixed set of worker reactors' QX side-channel devices (§4.4
/// "Multi-reactor load distribution", §9 "encapsulate these ... in a
/// dispatcher struct" rather than free globals).
pub struct Dispatcher<W> {
    workers: Vec<DeviceIdx>,
    next: usize,
    _marker: std::marker::PhantomData<W>,
}

impl<W: 'static> Dispatcher<W> {
    pub fn new(workers: Vec<DeviceIdx>) -> Dispatcher<W> {
        Dispatcher {
            workers,
            next: 0,
            _marker: std::marker::PhantomData,
        }
    }

    /// Send one accepted connection to the next worker in rotation. Closes
    /// `fd` itself if there are no workers, or the side-channel write fails
    /// outright, rather than leaking the descriptor.
    pub fn dispatch(&mut self, reactor: &mut Reactor<W>, ty: SockType, fd: RawFd, peer: Skad)
    where
        W: Default,
    {
        if self.workers.is_empty() {
            log::warn!("accept dispatched with no workers registered, dropping fd {fd}");
            close_fd(fd);
            return;
        }
        let target = self.workers[self.next];
        self.next = (self.next + 1) % self.workers.len();
        let msg = encode_newconn(ty, fd, &peer);
        if let Err(e) = reactor.write(target, msg, W::default(), None, None) {
            log::warn!("qx side-channel write failed, dropping accepted fd {fd}: {e}");
            close_fd(fd);
        }
    }
}

fn close_fd(fd: RawFd) {
    // SAFETY: `fd` is a freshly `accept4`-ed descriptor this process owns
    // and nothing else has taken ownership of it yet.
    unsafe {
        libc::close(fd);
    }
}

/// Worker-side counterpart of [`Dispatcher`]: owns one QX device (its half
/// of a `qx::pair()`), decodes each `NEWCONN` message and builds a local
/// child device from it via `on_new_conn`.
pub struct QxWorker<W> {
    qx_dev: DeviceIdx,
    mailbox: Rc<RefCell<VecDeque<Vec<u8>>>>,
    on_new_conn: Box<dyn FnMut(&mut Reactor<W>, SockType, RawFd, Skad)>,
}

impl<W: 'static> QxWorker<W> {
    /// Register `qx_fd` (this worker's half of the side channel) as a
    /// device and install the service that drains it.
    pub fn install<F>(
        reactor: &mut Reactor<W>,
        qx_fd: std::os::fd::OwnedFd,
        on_new_conn: F,
    ) -> Result<DeviceIdx>
    where
        F: FnMut(&mut Reactor<W>, SockType, RawFd, Skad) + 'static,
    {
        let mailbox = Rc::new(RefCell::new(VecDeque::new()));
        let mb = mailbox.clone();
        let mut dev: SocketDevice<W> = SocketDevice::from_owned_fd(SockType::Qx, qx_fd);
        dev.set_on_read(move |data, _src| mb.borrow_mut().push_back(data.to_vec()));
        let qx_dev = reactor.make_device(Box::new(dev), Capability::IN)?;
        reactor.register_service(Box::new(QxWorker {
            qx_dev,
            mailbox,
            on_new_conn: Box::new(on_new_conn),
        }));
        Ok(qx_dev)
    }
}

impl<W: 'static> Service<W> for QxWorker<W> {
    fn stop(&mut self, reactor: &mut Reactor<W>) {
        reactor.halt(self.qx_dev);
    }

    fn name(&self) -> &str {
        "qx-worker"
    }

    fn poll(&mut self, reactor: &mut Reactor<W>) {
        let pending: Vec<Vec<u8>> = self.mailbox.borrow_mut().drain(..).collect();
        for msg in pending {
            match decode_newconn(&msg) {
                Ok((ty, fd, peer)) => (self.on_new_conn)(reactor, ty, fd, peer),
                Err(e) => log::warn!("malformed NEWCONN message, dropping: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn newconn_round_trips() {
        let peer = Skad::inet4(Ipv4Addr::new(203, 0, 113, 7), 4242);
        let msg = encode_newconn(SockType::Tcp4, 17, &peer);
        let (ty, fd, decoded) = decode_newconn(&msg).unwrap();
        assert_eq!(ty, SockType::Tcp4);
        assert_eq!(fd, 17);
        assert_eq!(decoded, peer);
    }

    #[test]
    fn decode_rejects_truncated_message() {
        assert!(decode_newconn(&[NEWCONN, 0, 1]).is_err());
    }

    #[test]
    fn decode_rejects_wrong_cmd() {
        let peer = Skad::inet4(Ipv4Addr::LOCALHOST, 1);
        let mut msg = encode_newconn(SockType::Udp4, 3, &peer);
        msg[0] = 0xff;
        assert!(decode_newconn(&msg).is_err());
    }
}
