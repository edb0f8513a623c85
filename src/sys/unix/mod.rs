mod net;
mod selector;

pub mod qx;

pub use self::net::{new_ip_socket, set_nonblock, sockaddr_from_skad, skad_from_sockaddr};
pub use self::selector::{Events, Interest, Selector, Token};
