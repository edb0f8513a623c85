//! The error taxonomy of §7: a typed [`Error`] enum plus a per-reactor
//! "last error" slot.
//!
//! System-call failures are translated from `errno` via [`Error::from_io`];
//! library-internal failures construct a variant directly. Every protocol
//! callback receives `Result<T, Error>` in-band; the loop itself never
//! panics on a protocol error.

use std::fmt;
use std::io;

/// Library-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The error kinds of §7, "Error Handling Design". Not every kind maps onto
/// a single POSIX `errno` — several (`EcErr`, `ConRf`, `ConRs`, `TmOut`,
/// `NoRsp`, `NoCapa`, `DevErr`, `DevHup`) are reactor-level conditions with
/// no direct syscall equivalent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Allocation failure. Rare in a GC-free but allocator-backed target;
    /// kept for parity with the original's `HIO_ESYSMEM`.
    #[error("out of memory")]
    SysMem,
    /// Invalid argument or malformed input (bad address text, malformed DNS
    /// name, etc).
    #[error("invalid argument")]
    Inval,
    /// Entity does not exist (ENOENT-class).
    #[error("no such entry")]
    NoEnt,
    /// Entity already exists, or an operation that must run once ran twice
    /// (e.g. binding a listener a second time).
    #[error("already exists or already in progress")]
    Exist,
    /// Invalid kernel handle.
    #[error("bad handle")]
    BadHnd,
    /// Interrupted system call that the caller must retry.
    #[error("interrupted")]
    Intr,
    /// Write to a device whose peer closed its read side.
    #[error("broken pipe")]
    Pipe,
    /// Operation would block; caller must wait for readiness.
    #[error("operation would block")]
    Again,
    /// Permission denied at the OS level.
    #[error("permission denied")]
    Acces,
    /// Operation not permitted given the device's current state (e.g.
    /// listening twice).
    #[error("operation not permitted")]
    Perm,
    /// Resource busy (e.g. bind/connect already in progress).
    #[error("device busy")]
    Busy,
    /// Generic I/O failure not covered by a more specific kind.
    #[error("I/O error")]
    Io,
    /// Encoding/decoding conversion failure (DNS wire format, address text).
    #[error("encoding error")]
    EcErr,
    /// A fixed-size buffer was too small for the data being encoded.
    #[error("buffer full")]
    BufFull,
    /// Connection refused by the peer.
    #[error("connection refused")]
    ConRf,
    /// Connection reset by the peer.
    #[error("connection reset")]
    ConRs,
    /// A request-level deadline elapsed (connect timer, accept-SSL timer,
    /// write timeout, ...).
    #[error("operation timed out")]
    TmOut,
    /// A query exhausted its retries without a matching response.
    #[error("no response")]
    NoRsp,
    /// The device does not support the requested capability (e.g. writing
    /// after half-close).
    #[error("capability not supported")]
    NoCapa,
    /// The underlying device reported a fatal error.
    #[error("device error")]
    DevErr,
    /// The underlying device hung up (EOF / peer close).
    #[error("device hang-up")]
    DevHup,
    /// A method is intentionally unimplemented (the BPF device, per the
    /// open question in the design notes).
    #[error("not implemented")]
    NotImplemented,
    /// Catch-all wrapping a raw OS error that doesn't need reclassifying.
    #[error("system error: {0}")]
    SysErr(#[from] io::Error),
}

impl Error {
    /// Translate the process's `errno` (as captured by `io::Error::last_os_error`)
    /// into the richer taxonomy above. Kinds with no natural errno mapping
    /// (`TmOut`, `NoRsp`, `EcErr`, ...) are never produced here; callers set
    /// them directly at the point a timeout or protocol condition is
    /// detected.
    pub fn from_io(err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(libc::ENOMEM) => Error::SysMem,
            Some(libc::EINVAL) => Error::Inval,
            Some(libc::ENOENT) => Error::NoEnt,
            Some(libc::EEXIST) | Some(libc::EALREADY) => Error::Exist,
            Some(libc::EBADF) => Error::BadHnd,
            Some(libc::EINTR) => Error::Intr,
            Some(libc::EPIPE) => Error::Pipe,
            Some(libc::EAGAIN) => Error::Again,
            Some(libc::EACCES) => Error::Acces,
            Some(libc::EPERM) => Error::Perm,
            Some(libc::EBUSY) | Some(libc::EINPROGRESS) => Error::Busy,
            Some(libc::ECONNREFUSED) => Error::ConRf,
            Some(libc::ECONNRESET) => Error::ConRs,
            _ => Error::SysErr(err),
        }
    }

    /// True if the error means "try again later", the `Again`/`Intr` family
    /// that device methods must never treat as fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Again | Error::Intr)
    }
}

/// The per-reactor "last error" slot described in §3/§7: library-internal
/// failures set this instead of (or alongside) returning `Err`, so that a
/// caller reached via a callback with no `Result` of its own can still
/// inspect what happened.
#[derive(Debug, Default)]
pub struct ErrorSlot {
    last: Option<ErrorRecord>,
}

#[derive(Debug, Clone)]
struct ErrorRecord {
    message: String,
}

impl ErrorSlot {
    pub fn new() -> ErrorSlot {
        ErrorSlot { last: None }
    }

    /// Record `err` (rendered via its `Display` impl) as the reactor's last
    /// error and return it unchanged, so this can be chained at a `return`
    /// site: `return Err(self.errslot.set(Error::Inval))`.
    pub fn set(&mut self, err: Error) -> Error {
        self.last = Some(ErrorRecord {
            message: err.to_string(),
        });
        err
    }

    /// The formatted message of the last error recorded, if any.
    pub fn message(&self) -> Option<&str> {
        self.last.as_ref().map(|r| r.message.as_str())
    }
}

impl fmt::Display for ErrorSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.last {
            Some(r) => f.write_str(&r.message),
            None => f.write_str("(no error)"),
        }
    }
}
