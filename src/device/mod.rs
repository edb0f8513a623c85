//! The device core of §4.3: lifecycle (`make`/`halt`/`kill`), capability
//! bits, and the write request queue with per-request timeouts. A device is
//! anything with a file descriptor and the [`DeviceOps`] vtable — sockets
//! (§4.4, [`socket`]) and thread/pipe devices (§4.5, [`thread_pipe`]) are
//! the two families this crate implements; HTTP/FastCGI/DHCP devices are
//! external collaborators (§1).
//!
//! Write contexts are generic over `W` (the expansion in `SPEC_FULL.md`
//! §4.3: a typed context instead of the original's `void *`) rather than
//! type-erased, so a [`Reactor`](crate::reactor::Reactor) is parameterized
//! by one context type shared across every device it owns. Applications
//! that need more than one kind of context can use an enum or `Box<dyn
//! Any>` as `W`.

pub mod socket;
pub mod thread_pipe;

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::skad::Skad;
use crate::timer::TimerIdx;

bitflags_like! {
    /// Device capability/state bits (§3 "capability bitmask").
    pub struct Capability: u16 {
        const IN = 0b0000_0001;
        const OUT = 0b0000_0010;
        const STREAM = 0b0000_0100;
        const VIRTUAL = 0b0000_1000;
        const WATCH_REREG_REQUIRED = 0b0001_0000;
        const IN_CLOSED = 0b0010_0000;
        const OUT_CLOSED = 0b0100_0000;
        /// A fatal error on this device is logged and it keeps running
        /// (§4.3 "Failure model"); used for listeners so one bad accept
        /// doesn't kill the server.
        const LENIENT = 0b1000_0000;
    }
}

/// Result of one `read` method call (§6.4: `-1|0|1`).
pub enum ReadOutcome {
    /// Data was read; `on_read` should fire with this many bytes.
    Data(usize),
    /// No data available right now; not an error.
    Again,
    /// Peer hung up (`read` returned 0 on a stream).
    Eof,
    /// Unrecoverable; the device's failure policy decides what happens next.
    Fatal(Error),
}

/// Result of one `write`/`writev` method call.
pub enum WriteOutcome {
    /// `n` bytes accepted by the kernel (may be less than requested).
    Wrote(usize),
    Again,
    Fatal(Error),
}

/// What a device's `ready` callback wants the core to do next (§6.4).
pub enum Disposition {
    /// Fatal; halt the device.
    Fatal,
    /// Carry on without attempting a read this iteration (e.g. the
    /// callback already consumed the readiness itself).
    SkipRead,
    /// Proceed with the normal read dispatch.
    Proceed,
}

/// The per-device vtable (§6.4). A concrete device (socket, thread, pipe)
/// implements this; the core itself never downcasts it, but a protocol
/// service that made the device (DNS client, the multi-reactor dispatcher)
/// routinely needs its concrete type back to call a typed ioctl like
/// `SocketDevice::bind`/`connect`/`listen` — `as_any` exists for exactly
/// that, via [`Reactor::device_as_mut`](crate::reactor::Reactor::device_as_mut).
pub trait DeviceOps<W> {
    /// Perform the device-specific setup (`socket()`, `pipe()`, spawning a
    /// thread, ...) and return the file descriptor to register with the
    /// kernel event source.
    fn make(&mut self) -> Result<RawFd>;

    /// Release kernel resources. Called at most once, by the core's reaper.
    fn kill(&mut self);

    /// Recover the concrete type behind this vtable. Every implementor
    /// returns `self`; there is no generic way to provide this default
    /// without specialization, so each device type repeats the one-liner.
    fn as_any(&mut self) -> &mut dyn std::any::Any;

    /// Cleanup hook invoked when `make` itself fails, so a caller-passed
    /// handle is closed exactly once (§4.3).
    fn fail_before_make(&mut self) {}

    fn get_syshnd(&self) -> RawFd;

    fn read(&mut self, buf: &mut [u8]) -> ReadOutcome;

    fn write(&mut self, data: &[u8], dest: Option<&Skad>) -> WriteOutcome;

    fn writev(&mut self, bufs: &[&[u8]], dest: Option<&Skad>) -> WriteOutcome {
        let mut total = 0;
        for buf in bufs {
            match self.write(&buf[total.min(buf.len())..], dest) {
                WriteOutcome::Wrote(n) => total += n,
                other => return other,
            }
        }
        WriteOutcome::Wrote(total)
    }

    fn sendfile(&mut self, _fd: RawFd, _offset: i64, _len: usize) -> WriteOutcome {
        WriteOutcome::Fatal(Error::NotImplemented)
    }

    /// Optional deferred-cleanup hook (§9 "Deferred cleanup of thread-owned
    /// resources"). Called once, right before `kill`, on every device being
    /// reaped. A device that owns a resource outliving this call (a
    /// not-yet-joined worker thread, see
    /// [`thread_pipe::ThrDevice`](crate::device::thread_pipe::ThrDevice))
    /// returns `Some(poll)`: the core registers `poll` on the CFMB queue
    /// instead of dropping it here. `poll` must perform the actual cleanup
    /// (e.g. `join`) itself at the moment it first returns `true`, since it
    /// is never called again afterwards.
    fn cfmb_defer(&mut self) -> Option<Box<dyn FnMut() -> bool>> {
        None
    }

    /// Called once per readiness event, before any read/write dispatch.
    fn ready(&mut self, _events_readable: bool, _events_writable: bool) -> Disposition {
        Disposition::Proceed
    }

    fn on_read(&mut self, data: &[u8], src: Option<&Skad>);

    fn on_write(&mut self, result: std::result::Result<usize, Error>, ctx: W, dest: Option<&Skad>);

    /// Fires exactly once per device, regardless of how the halt was
    /// triggered (§7 "device halt... `on_disconnect` invoked exactly once").
    fn on_disconnect(&mut self) {}
}

struct WriteRequest<W> {
    data: Vec<u8>,
    written: usize,
    ctx: Option<W>,
    dest: Option<Skad>,
    deadline: Option<Instant>,
    /// Identifies this request among others on the same device's queue, so
    /// a fired per-request deadline timer (§4.3 "timedwrite") can find and
    /// finalize exactly this one, leaving the rest of the FIFO intact.
    seq: u64,
    /// The timer guarding `deadline`, if any; cancelled once the request
    /// completes normally so a stale fire is never matched against a
    /// later request that happens to reuse this queue slot.
    timer_idx: TimerIdx,
}

/// Index of a device within a [`DeviceTable`]. Stable across writes/reads;
/// invalidated only once the slot is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdx(pub usize);

pub(crate) struct DeviceSlot<W> {
    pub ops: Box<dyn DeviceOps<W>>,
    pub fd: RawFd,
    pub cap: Capability,
    pub halted: bool,
    pub serial: u64,
    pub timer_idx: TimerIdx,
    write_queue: VecDeque<WriteRequest<W>>,
    next_write_seq: u64,
}

impl<W> DeviceSlot<W> {
    pub fn is_write_pending(&self) -> bool {
        !self.write_queue.is_empty()
    }
}

/// The slab-backed "reactor exclusively owns the device struct" table
/// (§4.3 expansion). Applications only ever see a [`DeviceIdx`].
pub struct DeviceTable<W> {
    slots: Vec<Option<DeviceSlot<W>>>,
    free: Vec<usize>,
    next_serial: u64,
}

impl<W> Default for DeviceTable<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> DeviceTable<W> {
    pub fn new() -> DeviceTable<W> {
        DeviceTable {
            slots: Vec::new(),
            free: Vec::new(),
            next_serial: 0,
        }
    }

    /// Allocate a slot and run `ops.make()`. On failure, `fail_before_make`
    /// is invoked and no slot is retained (§4.3 "Make").
    pub fn make(
        &mut self,
        mut ops: Box<dyn DeviceOps<W>>,
        cap: Capability,
    ) -> Result<(DeviceIdx, RawFd)> {
        match ops.make() {
            Ok(fd) => {
                let serial = self.next_serial;
                self.next_serial += 1;
                let slot = DeviceSlot {
                    ops,
                    fd,
                    cap,
                    halted: false,
                    serial,
                    timer_idx: TimerIdx::INVALID,
                    write_queue: VecDeque::new(),
                    next_write_seq: 0,
                };
                let idx = match self.free.pop() {
                    Some(i) => {
                        self.slots[i] = Some(slot);
                        i
                    }
                    None => {
                        self.slots.push(Some(slot));
                        self.slots.len() - 1
                    }
                };
                log::debug!("device #{serial} made at slot {idx}, fd={fd}");
                Ok((DeviceIdx(idx), fd))
            }
            Err(err) => {
                ops.fail_before_make();
                Err(err)
            }
        }
    }

    pub fn get(&self, idx: DeviceIdx) -> Option<&DeviceSlot<W>> {
        self.slots.get(idx.0).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, idx: DeviceIdx) -> Option<&mut DeviceSlot<W>> {
        self.slots.get_mut(idx.0).and_then(|s| s.as_mut())
    }

    /// Recover a `&mut T` to the concrete device behind `idx`'s vtable, for
    /// the protocol services that made it in the first place (§4.4's
    /// bind/connect/listen/accept ioctls have no generic vtable slot; they
    /// are typed inherent methods on [`socket::SocketDevice`]).
    pub fn get_as_mut<T: 'static>(&mut self, idx: DeviceIdx) -> Option<&mut T> {
        self.get_mut(idx)?.ops.as_any().downcast_mut::<T>()
    }

    /// Mark a device halted. Idempotent (§8 "Halting an already-halted
    /// device is a no-op"). Actual `kill`/free happens in `reap_halted`,
    /// at the end of the loop iteration, so calling this from inside an
    /// event callback is always safe.
    pub fn halt(&mut self, idx: DeviceIdx) {
        if let Some(slot) = self.get_mut(idx) {
            if slot.halted {
                return;
            }
            slot.halted = true;
        }
    }

    pub fn is_halted(&self, idx: DeviceIdx) -> bool {
        self.get(idx).map(|s| s.halted).unwrap_or(true)
    }

    /// Every request on `idx`'s write queue, drained for finalization with
    /// `len = -1` (§4.3 "timedwrite... expires... `on_write` invoked with
    /// length = -1").
    pub(crate) fn take_write_queue(&mut self, idx: DeviceIdx) -> Vec<(Option<W>, Option<Skad>)> {
        match self.get_mut(idx) {
            Some(slot) => slot
                .write_queue
                .drain(..)
                .map(|r| (r.ctx, r.dest))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Free every slot currently marked halted, running `ops.kill()` and
    /// `on_disconnect()` on each and returning their indices (so the
    /// reactor can finalize pending writes/timers first) alongside any
    /// CFMB entries devices deferred their teardown to (§9).
    #[allow(clippy::type_complexity)]
    pub fn reap_halted(&mut self) -> (Vec<DeviceIdx>, Vec<Box<dyn FnMut() -> bool>>) {
        let mut reaped = Vec::new();
        let mut deferred = Vec::new();
        for i in 0..self.slots.len() {
            let should_reap = matches!(&self.slots[i], Some(s) if s.halted);
            if should_reap {
                if let Some(mut slot) = self.slots[i].take() {
                    slot.ops.on_disconnect();
                    if let Some(poll) = slot.ops.cfmb_defer() {
                        deferred.push(poll);
                    }
                    slot.ops.kill();
                    log::debug!("device #{} reaped at slot {i}", slot.serial);
                }
                self.free.push(i);
                reaped.push(DeviceIdx(i));
            }
        }
        (reaped, deferred)
    }

    pub fn iter_active(&self) -> impl Iterator<Item = (DeviceIdx, &DeviceSlot<W>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|s| (DeviceIdx(i), s)))
            .filter(|(_, s)| !s.halted)
    }

    /// Enqueue a write that couldn't complete synchronously. Returns the
    /// request's sequence number, so the caller can arm a per-request
    /// deadline timer and later register it against exactly this request
    /// via [`Self::set_write_timer`].
    pub(crate) fn enqueue_write(
        &mut self,
        idx: DeviceIdx,
        remaining: Vec<u8>,
        ctx: W,
        dest: Option<Skad>,
        deadline: Option<Instant>,
    ) -> u64 {
        match self.get_mut(idx) {
            Some(slot) => {
                let seq = slot.next_write_seq;
                slot.next_write_seq += 1;
                slot.write_queue.push_back(WriteRequest {
                    data: remaining,
                    written: 0,
                    ctx: Some(ctx),
                    dest,
                    deadline,
                    seq,
                    timer_idx: TimerIdx::INVALID,
                });
                slot.cap.insert(Capability::OUT);
                seq
            }
            None => 0,
        }
    }

    /// Record the timer guarding request `seq`'s deadline, once it has been
    /// scheduled (the timer can only be created after the request already
    /// has a queue slot to report itself ready/expired against).
    pub(crate) fn set_write_timer(&mut self, idx: DeviceIdx, seq: u64, timer_idx: TimerIdx) {
        if let Some(slot) = self.get_mut(idx) {
            if let Some(req) = slot.write_queue.iter_mut().find(|r| r.seq == seq) {
                req.timer_idx = timer_idx;
            }
        }
    }

    /// Remove and finalize exactly the request identified by `seq` — used
    /// when its deadline timer fires (§4.3 "timedwrite"). Other queued
    /// requests, including ones submitted earlier, are left untouched so a
    /// single timed-out request doesn't cancel the rest of the FIFO.
    pub(crate) fn remove_write_by_seq(
        &mut self,
        idx: DeviceIdx,
        seq: u64,
    ) -> Option<(Option<W>, Option<Skad>)> {
        let slot = self.get_mut(idx)?;
        let pos = slot.write_queue.iter().position(|r| r.seq == seq)?;
        let req = slot.write_queue.remove(pos)?;
        if slot.write_queue.is_empty() {
            slot.cap.remove(Capability::OUT);
        }
        Some((req.ctx, req.dest))
    }

    /// Try to flush as much of the head-of-line write request as the
    /// kernel will accept. Returns `Some((ctx, dest, total_len, timer_idx))`
    /// once the request fully drains, so the caller can fire `on_write` and
    /// cancel the now-irrelevant deadline timer, if any.
    pub(crate) fn flush_one(&mut self, idx: DeviceIdx) -> Option<(W, Option<Skad>, usize, TimerIdx)> {
        let slot = self.get_mut(idx)?;
        let req = slot.write_queue.front_mut()?;
        let outcome = slot.ops.write(&req.data[req.written..], req.dest.as_ref());
        match outcome {
            WriteOutcome::Wrote(n) => {
                req.written += n;
                if req.written >= req.data.len() {
                    let req = slot.write_queue.pop_front().unwrap();
                    if slot.write_queue.is_empty() {
                        slot.cap.remove(Capability::OUT);
                    }
                    Some((req.ctx.unwrap(), req.dest, req.written, req.timer_idx))
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy {
        fd: RawFd,
    }

    impl DeviceOps<u32> for Dummy {
        fn make(&mut self) -> Result<RawFd> {
            Ok(self.fd)
        }
        fn kill(&mut self) {}
        fn as_any(&mut self) -> &mut dyn std::any::Any {
            self
        }
        fn get_syshnd(&self) -> RawFd {
            self.fd
        }
        fn read(&mut self, _buf: &mut [u8]) -> ReadOutcome {
            ReadOutcome::Again
        }
        fn write(&mut self, data: &[u8], _dest: Option<&Skad>) -> WriteOutcome {
            WriteOutcome::Wrote(data.len())
        }
        fn on_read(&mut self, _data: &[u8], _src: Option<&Skad>) {}
        fn on_write(&mut self, _result: std::result::Result<usize, Error>, _ctx: u32, _dest: Option<&Skad>) {}
    }

    #[test]
    fn halt_is_idempotent() {
        let mut table: DeviceTable<u32> = DeviceTable::new();
        let (idx, _fd) = table.make(Box::new(Dummy { fd: 3 }), Capability::IN).unwrap();
        table.halt(idx);
        table.halt(idx);
        assert!(table.is_halted(idx));
        let (reaped, deferred) = table.reap_halted();
        assert_eq!(reaped, vec![idx]);
        assert!(deferred.is_empty());
    }

    #[test]
    fn write_flushes_synchronously_when_kernel_accepts_all() {
        let mut table: DeviceTable<u32> = DeviceTable::new();
        let (idx, _fd) = table.make(Box::new(Dummy { fd: 3 }), Capability::IN).unwrap();
        table.enqueue_write(idx, b"hello".to_vec(), 42, None, None);
        let (ctx, _dest, len, _timer_idx) = table.flush_one(idx).unwrap();
        assert_eq!(ctx, 42);
        assert_eq!(len, 5);
    }

    #[test]
    fn remove_write_by_seq_only_removes_the_matching_request() {
        let mut table: DeviceTable<u32> = DeviceTable::new();
        let (idx, _fd) = table.make(Box::new(Dummy { fd: 3 }), Capability::IN).unwrap();
        let seq1 = table.enqueue_write(idx, b"first".to_vec(), 1, None, None);
        let seq2 = table.enqueue_write(idx, b"second".to_vec(), 2, None, None);
        assert_ne!(seq1, seq2);

        // Only the request whose own deadline fired is removed; an
        // earlier-queued sibling is left in place (§4.3 per-request
        // timeout, not a whole-queue cancellation).
        let (ctx, _dest) = table.remove_write_by_seq(idx, seq1).unwrap();
        assert_eq!(ctx, Some(1));
        assert!(table.get(idx).unwrap().is_write_pending());

        let (ctx, _dest) = table.remove_write_by_seq(idx, seq2).unwrap();
        assert_eq!(ctx, Some(2));
        assert!(!table.get(idx).unwrap().is_write_pending());

        assert!(table.remove_write_by_seq(idx, seq1).is_none());
    }

    #[test]
    fn freed_slot_is_reused() {
        let mut table: DeviceTable<u32> = DeviceTable::new();
        let (idx1, _) = table.make(Box::new(Dummy { fd: 3 }), Capability::IN).unwrap();
        table.halt(idx1);
        let _ = table.reap_halted();
        let (idx2, _) = table.make(Box::new(Dummy { fd: 4 }), Capability::IN).unwrap();
        assert_eq!(idx1, idx2);
    }
}
