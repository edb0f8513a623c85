//! OS glue. Only Linux/BSD epoll-family kernel readiness sources are
//! supported — Windows IOCP is an explicit Non-goal (§1).

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use self::unix::{Events, Selector};
