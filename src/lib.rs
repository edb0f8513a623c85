//! `hio` is a single-threaded, non-blocking I/O reactor and a small family of
//! protocol services that cooperate on top of it: a timer heap, a device
//! abstraction over sockets/pipes/threads, and a DNS client.
//!
//! A reactor ([`Reactor`]) owns a kernel readiness source, a timer heap, the
//! list of live devices, a deferred-cleanup queue (CFMB, see [`cfmb`]) and the
//! list of registered services. Nothing here is shared across threads: the
//! only cross-thread primitive is [`sys::unix::qx`], a `socketpair` used to
//! hand an accepted connection from one reactor to another.
//!
//! See `SPEC_FULL.md` in the repository root for the full design rationale.

#![warn(rust_2018_idioms)]

#[macro_use]
mod macros;

pub mod cfmb;
pub mod device;
#[cfg(feature = "dns")]
pub mod dns;
pub mod error;
pub mod net;
pub mod reactor;
pub mod services;
pub mod skad;
pub mod sys;
pub mod timer;

pub use error::{Error, Result};
pub use reactor::Reactor;
pub use skad::Skad;
pub use timer::TimerIdx;
