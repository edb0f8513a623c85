//! The reactor loop of §4.8: a single-threaded, non-blocking event loop
//! owning a kernel readiness source, a timer heap, the device table, the
//! CFMB deferred-cleanup queue and the service registry.
//!
//! `Reactor<W>` is generic over the write-request context type shared by
//! every device it owns (§4.3 expansion). Applications that need more than
//! one kind of context can make `W` an enum or `Box<dyn Any + Send>`.

use std::time::{Duration, Instant};

use crate::cfmb::Cfmb;
use crate::device::{Capability, DeviceIdx, DeviceOps, DeviceTable, ReadOutcome, WriteOutcome};
use crate::error::{Error, ErrorSlot, Result};
use crate::services::{Service, ServiceList};
use crate::skad::Skad;
use crate::sys::unix::{Events, Interest, Selector, Token};
use crate::timer::{TimerHeap, TimerIdx, TimerJob};

/// Why the loop stopped (§4.8 "Stop is requested asynchronously...").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Termination,
    WatcherError,
}

/// A pending timer's payload: a one-shot closure invoked with the owning
/// reactor and the fire time. Internal timers (connect timeout, accept-SSL
/// timeout, write-request deadline, DNS reply timeout) are all expressed
/// this way rather than as a fixed enum, so each call site can close over
/// exactly the state it needs.
pub(crate) struct TimerCtx<W> {
    handler: Box<dyn FnOnce(&mut Reactor<W>, Instant)>,
}

/// Single-threaded, non-blocking I/O reactor (§3 "Reactor (Hio)").
pub struct Reactor<W = ()> {
    selector: Selector,
    events: Events,
    devices: DeviceTable<W>,
    timers: TimerHeap<TimerCtx<W>>,
    cfmb: Cfmb<()>,
    services: ServiceList<W>,
    errslot: ErrorSlot,
    stop: Option<StopReason>,
}

const DEFAULT_EVENTS_CAPACITY: usize = 1024;

impl<W> Reactor<W> {
    /// `open` (§3): create the kernel readiness source and empty
    /// collections. The loop is not running yet.
    pub fn open() -> Result<Reactor<W>> {
        let selector = Selector::new().map_err(Error::from_io)?;
        Ok(Reactor {
            selector,
            events: Events::with_capacity(DEFAULT_EVENTS_CAPACITY),
            devices: DeviceTable::new(),
            timers: TimerHeap::new(),
            cfmb: Cfmb::new(),
            services: ServiceList::new(),
            errslot: ErrorSlot::new(),
            stop: None,
        })
    }

    pub fn last_error(&self) -> Option<&str> {
        self.errslot.message()
    }

    pub fn services_mut(&mut self) -> &mut ServiceList<W> {
        &mut self.services
    }

    /// Recover the concrete device type behind `idx`, so a protocol service
    /// that made the device can call its typed ioctls (`SocketDevice::bind`,
    /// `connect`, `listen`, `accept`) after registration (§6.4).
    pub fn device_as_mut<T: 'static>(&mut self, idx: DeviceIdx) -> Option<&mut T> {
        self.devices.get_as_mut(idx)
    }

    /// Record `idx`'s per-device timer (§3 "per-device timer index") so
    /// [`Reactor::halt`] cancels it automatically if the device goes away
    /// before the timer fires — used by connect/accept-SSL timeouts, which
    /// have nowhere else to store their own cancellation handle (§4.4).
    pub(crate) fn set_device_timer(&mut self, idx: DeviceIdx, timer_idx: TimerIdx) {
        if let Some(slot) = self.devices.get_mut(idx) {
            slot.timer_idx = timer_idx;
        }
    }

    /// Register a protocol service (§3 "Service"). Stopped in LIFO order by
    /// [`Reactor::close`].
    pub fn register_service(&mut self, service: Box<dyn Service<W>>) {
        self.services.register(service);
    }

    /// Request the loop to stop after the current iteration (§4.8).
    pub fn request_stop(&mut self, reason: StopReason) {
        self.stop = Some(reason);
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop
    }

    /// `close` (§3): stop every registered service in LIFO order (§5), then
    /// halt and reap every remaining device.
    pub fn close(&mut self) {
        // SAFETY of the dance below: `ServiceList::stop_all` needs `&mut
        // Reactor`, so it cannot simultaneously borrow `self.services`;
        // take it out for the duration of the call.
        let mut services = std::mem::take(&mut self.services);
        services.stop_all(self);

        let pending: Vec<DeviceIdx> = self.devices.iter_active().map(|(idx, _)| idx).collect();
        for idx in pending {
            self.halt(idx);
        }
        self.reap_halted();
    }

    /// Allocate and register a device, enabling `IN` interest by default
    /// (§4.3 "Make").
    pub fn make_device(&mut self, ops: Box<dyn DeviceOps<W>>, cap: Capability) -> Result<DeviceIdx> {
        let (idx, fd) = self.devices.make(ops, cap)?;
        if let Err(e) = self.selector.register(fd, Token(idx.0), Interest::READABLE) {
            // Registration failed after a successful `make`: unwind by
            // killing the device immediately rather than leaking a slot
            // the selector never knows about.
            self.devices.halt(idx);
            self.devices.reap_halted();
            return Err(Error::from_io(e));
        }
        Ok(idx)
    }

    /// Update the kernel-registered interest set for a device (§4.3 "Read
    /// enable/disable"). Devices whose capability set carries
    /// `WATCH_REREG_REQUIRED` get a deregister+register cycle instead of an
    /// in-place `reregister`, mirroring the STOP→START dance some kqueue
    /// transitions need — epoll never strictly requires it, but the API
    /// honors the flag for fidelity with §4.3.
    pub fn watch(&mut self, idx: DeviceIdx, interest: Interest) -> Result<()> {
        let slot = self.devices.get(idx).ok_or(Error::BadHnd)?;
        let fd = slot.fd;
        let needs_rereg = slot.cap.contains(Capability::WATCH_REREG_REQUIRED);
        if needs_rereg {
            let _ = self.selector.deregister(fd);
            self.selector
                .register(fd, Token(idx.0), interest)
                .map_err(Error::from_io)
        } else {
            self.selector
                .reregister(fd, Token(idx.0), interest)
                .map_err(Error::from_io)
        }
    }

    /// Halt a device (§4.3 "Halt vs Kill"): cooperative, safe from
    /// callbacks, idempotent (§8). De-registers immediately; the actual
    /// `kill` runs at end-of-iteration via [`Reactor::reap_halted`].
    pub fn halt(&mut self, idx: DeviceIdx) {
        if self.devices.is_halted(idx) {
            return;
        }
        if let Some(slot) = self.devices.get(idx) {
            let _ = self.selector.deregister(slot.fd);
        }
        self.finalize_pending_writes(idx);
        if let Some(slot) = self.devices.get_mut(idx) {
            let timer_idx = slot.timer_idx;
            if timer_idx.is_valid() {
                self.timers.delete(timer_idx);
            }
        }
        self.devices.halt(idx);
    }

    /// Submit a write request. Tries the method synchronously; on partial
    /// success or `EAGAIN` the remainder is queued and `OUT` interest is
    /// enabled (§4.3 "I/O queuing"). `deadline` implements `timedwrite`.
    pub fn write(
        &mut self,
        idx: DeviceIdx,
        mut data: Vec<u8>,
        ctx: W,
        dest: Option<Skad>,
        deadline: Option<Duration>,
    ) -> Result<()>
    where
        W: 'static,
    {
        let slot = self.devices.get_mut(idx).ok_or(Error::BadHnd)?;
        if slot.is_write_pending() {
            self.queue_write(idx, data, ctx, dest, deadline);
            return Ok(());
        }

        let outcome = slot.ops.write(&data, dest.as_ref());
        match outcome {
            WriteOutcome::Wrote(n) if n >= data.len() => {
                let slot = self.devices.get_mut(idx).unwrap();
                slot.ops.on_write(Ok(n), ctx, dest.as_ref());
                Ok(())
            }
            WriteOutcome::Wrote(n) => {
                data.drain(..n);
                self.queue_write(idx, data, ctx, dest, deadline);
                self.watch(idx, Interest::READABLE.add(Interest::WRITABLE))
            }
            WriteOutcome::Again => {
                self.queue_write(idx, data, ctx, dest, deadline);
                self.watch(idx, Interest::READABLE.add(Interest::WRITABLE))
            }
            WriteOutcome::Fatal(err) => {
                let slot = self.devices.get_mut(idx).unwrap();
                slot.ops.on_write(Err(err), ctx, dest.as_ref());
                Err(err)
            }
        }
    }

    fn queue_write(
        &mut self,
        idx: DeviceIdx,
        data: Vec<u8>,
        ctx: W,
        dest: Option<Skad>,
        deadline: Option<Duration>,
    ) where
        W: 'static,
    {
        let deadline_at = deadline.map(|d| Instant::now() + d);
        let seq = self.devices.enqueue_write(idx, data, ctx, dest, deadline_at);
        if let Some(d) = deadline_at {
            let timer_idx = self.schedule(d, move |reactor, now| {
                reactor.expire_write_by_seq(idx, seq, now);
            });
            self.devices.set_write_timer(idx, seq, timer_idx);
        }
    }

    /// Fires only the single request identified by `seq` with `len = -1`
    /// (§4.3 "timedwrite... expires"), leaving every other request queued
    /// on `idx`, including ones submitted earlier, untouched.
    fn expire_write_by_seq(&mut self, idx: DeviceIdx, seq: u64, _now: Instant) {
        if self.devices.is_halted(idx) {
            return;
        }
        if let Some((ctx, dest)) = self.devices.remove_write_by_seq(idx, seq) {
            if let Some(ctx) = ctx {
                let err = self.errslot.set(Error::TmOut);
                if let Some(slot) = self.devices.get_mut(idx) {
                    slot.ops.on_write(Err(err), ctx, dest.as_ref());
                }
            }
        }
    }

    fn finalize_pending_writes(&mut self, idx: DeviceIdx) {
        for (ctx, dest) in self.devices.take_write_queue(idx) {
            if let Some(ctx) = ctx {
                if let Some(slot) = self.devices.get_mut(idx) {
                    slot.ops.on_write(Err(Error::DevHup), ctx, dest.as_ref());
                }
            }
        }
    }

    /// Schedule a one-shot internal timer (connect timeout, accept-SSL
    /// timeout, write-request deadline, DNS reply timeout, ...).
    pub(crate) fn schedule<F>(&mut self, at: Instant, handler: F) -> TimerIdx
    where
        F: FnOnce(&mut Reactor<W>, Instant) + 'static,
    {
        self.timers.insert(TimerJob::new(
            at,
            TimerCtx {
                handler: Box::new(handler),
            },
        ))
    }

    pub(crate) fn cancel_timer(&mut self, idx: TimerIdx) {
        if idx.is_valid() {
            self.timers.delete(idx);
        }
    }

    /// Register a CFMB entry (§3, §9): `poll_ready` is called once per loop
    /// iteration (never blocked on) and must perform any side effect (e.g.
    /// joining a worker thread, see [`crate::device::thread_pipe::ThrDevice`])
    /// itself at the moment it first reports ready, since it will not be
    /// called again afterwards.
    pub(crate) fn cfmb_push<F>(&mut self, mut poll_ready: F)
    where
        F: FnMut() -> bool + 'static,
    {
        self.cfmb.push((), move |_: &mut ()| poll_ready());
    }

    fn reap_halted(&mut self) -> Vec<DeviceIdx> {
        let (reaped, deferred) = self.devices.reap_halted();
        for poll in deferred {
            self.cfmb_push(poll);
        }
        reaped
    }

    /// One iteration of the six-step loop in §4.8. Returns `false` once
    /// there is nothing left to wait on (no timers, no devices) or a stop
    /// has been requested, at which point the caller should stop calling
    /// `run_once`.
    pub fn run_once(&mut self) -> Result<bool>
    where
        W: 'static,
    {
        if self.stop.is_some() {
            return Ok(false);
        }

        let now = Instant::now();
        let timeout = self.timers.next_timeout(now);
        if timeout.is_none() && self.devices.iter_active().next().is_none() {
            return Ok(false);
        }

        self.selector
            .select(&mut self.events, timeout)
            .map_err(Error::from_io)?;

        let ready: Vec<(DeviceIdx, bool, bool)> = self
            .events
            .iter()
            .map(|ev| (DeviceIdx(ev.token().0), ev.is_readable(), ev.is_writable()))
            .collect();

        for (idx, readable, writable) in ready {
            if self.devices.is_halted(idx) {
                continue;
            }
            self.dispatch_ready(idx, readable, writable);
            if self.stop.is_some() {
                return Ok(false);
            }
        }

        self.fire_due_timers();
        if self.stop.is_some() {
            return Ok(false);
        }

        self.reap_halted();

        // Each ready predicate already performed its side effect (e.g. the
        // deferred thread join) the moment it returned `true`; draining just
        // unlinks the now-finished nodes.
        self.cfmb.drain_ready();

        // A device's own `on_read`/`on_connect` callback never sees `&mut
        // Reactor` (§6.4's vtable is deliberately narrow), so a service that
        // needs reactor-level effects in response to inbound data (cancel a
        // reply timer, open a fallback TCP device, invoke an app callback)
        // stages them in its own mailbox from that callback and acts on them
        // here, once per iteration, from `Service::poll`.
        let mut services = std::mem::take(&mut self.services);
        services.poll_all(self);
        self.services = services;

        Ok(self.stop.is_none())
    }

    fn dispatch_ready(&mut self, idx: DeviceIdx, readable: bool, writable: bool) {
        use crate::device::Disposition;

        let lenient = self
            .devices
            .get(idx)
            .map(|s| s.cap.contains(Capability::LENIENT))
            .unwrap_or(false);

        let disposition = match self.devices.get_mut(idx) {
            Some(slot) => slot.ops.ready(readable, writable),
            None => return,
        };

        match disposition {
            Disposition::Fatal => {
                if !lenient {
                    self.halt(idx);
                }
                return;
            }
            Disposition::SkipRead => return,
            Disposition::Proceed => {}
        }

        if writable {
            while let Some((ctx, dest, len, timer_idx)) = self.devices.flush_one(idx) {
                self.cancel_timer(timer_idx);
                if let Some(slot) = self.devices.get_mut(idx) {
                    slot.ops.on_write(Ok(len), ctx, dest.as_ref());
                }
                if self.devices.get(idx).map(|s| !s.is_write_pending()).unwrap_or(true) {
                    break;
                }
            }
        }

        if readable {
            let mut buf = [0u8; 64 * 1024];
            let outcome = match self.devices.get_mut(idx) {
                Some(slot) => slot.ops.read(&mut buf),
                None => return,
            };
            match outcome {
                ReadOutcome::Data(n) => {
                    if let Some(slot) = self.devices.get_mut(idx) {
                        let src = None; // stateless methods stash their own src internally.
                        slot.ops.on_read(&buf[..n], src);
                    }
                }
                ReadOutcome::Again => {}
                ReadOutcome::Eof => {
                    if !lenient {
                        self.halt(idx);
                    }
                }
                ReadOutcome::Fatal(_) => {
                    if !lenient {
                        self.halt(idx);
                    }
                }
            }
        }
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let due = self.timers.fire_due(now);
        for job in due {
            // `fire_due` always hands back ownership of the job before the
            // handler runs (§4.1), so re-scheduling from within `handler`
            // cannot alias the entry it came from.
            let ctx = job.into_ctx();
            (ctx.handler)(self, now);
        }
    }
}
