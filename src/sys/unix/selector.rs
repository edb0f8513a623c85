//! epoll(7) wrapper. Unlike the teacher's `sys/unix/selector/epoll.rs`, this
//! selector is level-triggered: the device core (§4.3) enables/disables
//! `OUT` interest explicitly around queued writes rather than relying on
//! edge-triggered re-arming, which matches the original's "renew with
//! `watch(dev, RENEW|UPDATE, events)`" contract more directly than mio's own
//! edge-triggered default.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

/// Readiness interests a device registers for. Mirrors the device core's
/// `IN`/`OUT` capability bits (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    readable: bool,
    writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };

    pub fn add(self, other: Interest) -> Interest {
        Interest {
            readable: self.readable || other.readable,
            writable: self.writable || other.writable,
        }
    }

    pub fn remove(self, other: Interest) -> Option<Interest> {
        let readable = self.readable && !other.readable;
        let writable = self.writable && !other.writable;
        if !readable && !writable {
            None
        } else {
            Some(Interest { readable, writable })
        }
    }

    pub fn is_readable(self) -> bool {
        self.readable
    }

    pub fn is_writable(self) -> bool {
        self.writable
    }

    fn to_epoll(self) -> u32 {
        let mut kind = 0;
        if self.readable {
            kind |= EPOLLIN | EPOLLRDHUP;
        }
        if self.writable {
            kind |= EPOLLOUT;
        }
        kind as u32
    }
}

/// Opaque registration key, round-tripped through the kernel unmodified.
/// The device core stores its slab index here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub usize);

#[derive(Debug)]
pub struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        // SAFETY: `epoll_create1` returns a valid owned fd on success.
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| {
                to.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(to)
                    .as_millis() as libc::c_int
            })
            .unwrap_or(-1);

        events.inner.clear();
        let n = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.inner.as_mut_ptr(),
            events.inner.capacity() as i32,
            timeout_ms,
        ))?;
        // SAFETY: epoll_wait just initialized the first `n` entries.
        unsafe { events.inner.set_len(n as usize) };
        Ok(())
    }

    pub fn register(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests.to_epoll(),
            u64: token.0 as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interests: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: interests.to_epoll(),
            u64: token.0 as u64,
        };
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_MOD,
            fd,
            &mut event
        ))
        .map(|_| ())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            libc::EPOLL_CTL_DEL,
            fd,
            std::ptr::null_mut()
        ))
        .map(|_| ())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

/// Readiness events returned by one `select` call. Sized once at reactor
/// open time (§4.8 allocates its event buffer on the stack in the original;
/// here it is a reusable heap buffer owned by the reactor).
#[derive(Debug)]
pub struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Event<'_>> {
        self.inner.iter().map(Event)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Event<'a>(&'a libc::epoll_event);

impl Event<'_> {
    pub fn token(&self) -> Token {
        Token(self.0.u64 as usize)
    }

    pub fn is_readable(&self) -> bool {
        (self.0.events as libc::c_int & (EPOLLIN | libc::EPOLLPRI)) != 0
    }

    pub fn is_writable(&self) -> bool {
        (self.0.events as libc::c_int & EPOLLOUT) != 0
    }

    pub fn is_error(&self) -> bool {
        (self.0.events as libc::c_int & EPOLLERR) != 0
    }

    pub fn is_read_closed(&self) -> bool {
        let events = self.0.events as libc::c_int;
        events & EPOLLHUP != 0 || (events & EPOLLIN != 0 && events & EPOLLRDHUP != 0)
    }
}
