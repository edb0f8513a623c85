//! Family-agnostic socket address container (§4.2, §3 "Socket Address
//! (Skad)"). Grounded on `original_source/hio/lib/skad.c`'s `hio_skad_t`
//! tagged union and its `hio_bto_skad`/`hio_skad_to_bcstr` text codec.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

bitflags_like! {
    /// Selects what [`Skad::format`] renders.
    pub struct FormatFlags: u8 {
        const ADDR = 0b01;
        const PORT = 0b10;
        const ADDR_PORT = 0b11;
    }
}

/// Kind-specific payload. The declared family determines which fields are
/// live; there is no way to construct a `Skad` whose discriminant
/// disagrees with its fields (unlike the original's raw union).
#[derive(Debug, Clone)]
enum Kind {
    Inet4 { addr: Ipv4Addr, port: u16 },
    Inet6 {
        addr: Ipv6Addr,
        port: u16,
        scope_id: u32,
    },
    Unix { path: PathBuf },
    Link { ifindex: u32, hwaddr: [u8; 6] },
    /// In-process signaling address (QX side channel); carries no wire
    /// representation at all.
    Qx,
}

/// A parsed/constructed socket address. `channel` is the SCTP stream-number
/// extension (§4.4 "SCTP seqpacket") — it rides alongside the address but is
/// explicitly not part of the wire address (§9 Open Question), so it is
/// excluded from equality and formatting.
#[derive(Debug, Clone)]
pub struct Skad {
    kind: Kind,
    channel: u16,
}

impl PartialEq for Skad {
    fn eq(&self, other: &Skad) -> bool {
        use Kind::*;
        match (&self.kind, &other.kind) {
            (Inet4 { addr: a1, port: p1 }, Inet4 { addr: a2, port: p2 }) => a1 == a2 && p1 == p2,
            (
                Inet6 {
                    addr: a1,
                    port: p1,
                    scope_id: s1,
                },
                Inet6 {
                    addr: a2,
                    port: p2,
                    scope_id: s2,
                },
            ) => a1 == a2 && p1 == p2 && s1 == s2,
            (Unix { path: p1 }, Unix { path: p2 }) => p1 == p2,
            (
                Link {
                    ifindex: i1,
                    hwaddr: h1,
                },
                Link {
                    ifindex: i2,
                    hwaddr: h2,
                },
            ) => i1 == i2 && h1 == h2,
            (Qx, Qx) => true,
            _ => false,
        }
    }
}
impl Eq for Skad {}

impl Skad {
    pub fn inet4(addr: Ipv4Addr, port: u16) -> Skad {
        Skad {
            kind: Kind::Inet4 { addr, port },
            channel: 0,
        }
    }

    pub fn inet6(addr: Ipv6Addr, port: u16, scope_id: u32) -> Skad {
        Skad {
            kind: Kind::Inet6 {
                addr,
                port,
                scope_id,
            },
            channel: 0,
        }
    }

    pub fn unix(path: PathBuf) -> Skad {
        Skad {
            kind: Kind::Unix { path },
            channel: 0,
        }
    }

    pub fn link(ifindex: u32, hwaddr: [u8; 6]) -> Skad {
        Skad {
            kind: Kind::Link { ifindex, hwaddr },
            channel: 0,
        }
    }

    pub fn qx() -> Skad {
        Skad {
            kind: Kind::Qx,
            channel: 0,
        }
    }

    pub fn port(&self) -> u16 {
        match &self.kind {
            Kind::Inet4 { port, .. } | Kind::Inet6 { port, .. } => *port,
            _ => 0,
        }
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.kind, Kind::Inet4 { .. })
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.kind, Kind::Inet6 { .. })
    }

    pub fn is_unix(&self) -> bool {
        matches!(self.kind, Kind::Unix { .. })
    }

    pub fn is_qx(&self) -> bool {
        matches!(self.kind, Kind::Qx)
    }

    /// The SCTP stream number carried alongside this address (§4.4). Not
    /// part of the wire address; see the struct doc comment.
    pub fn channel(&self) -> u16 {
        self.channel
    }

    pub fn set_channel(&mut self, channel: u16) {
        self.channel = channel;
    }

    /// The address and port if this is an IPv4 socket address.
    pub fn ipv4_parts(&self) -> Option<(Ipv4Addr, u16)> {
        match &self.kind {
            Kind::Inet4 { addr, port } => Some((*addr, *port)),
            _ => None,
        }
    }

    /// The address, port and scope-id if this is an IPv6 socket address.
    pub fn ipv6_parts(&self) -> Option<(Ipv6Addr, u16, u32)> {
        match &self.kind {
            Kind::Inet6 {
                addr,
                port,
                scope_id,
            } => Some((*addr, *port, *scope_id)),
            _ => None,
        }
    }

    /// The filesystem path if this is a UNIX domain socket address.
    pub fn unix_path(&self) -> Option<&Path> {
        match &self.kind {
            Kind::Unix { path } => Some(path.as_path()),
            _ => None,
        }
    }

    fn ipv6(&self) -> Option<(&Ipv6Addr, u16, u32)> {
        match &self.kind {
            Kind::Inet6 {
                addr,
                port,
                scope_id,
            } => Some((addr, *port, *scope_id)),
            _ => None,
        }
    }

    /// Parse one of: `<qx>`, `@<unix-path>`, `[ipv6]:port`,
    /// `[ipv6%scope]:port`, `ipv4:port`, bare `ipv4`, bare `ipv6` (§4.2).
    pub fn parse(text: &str) -> Result<Skad> {
        if text.is_empty() {
            return Err(Error::Inval);
        }
        if text == "<qx>" {
            return Ok(Skad::qx());
        }
        if let Some(path) = text.strip_prefix('@') {
            if path.is_empty() {
                return Err(Error::Inval);
            }
            return Ok(Skad::unix(PathBuf::from(path)));
        }
        if let Some(rest) = text.strip_prefix('[') {
            return Self::parse_bracketed_ipv6(rest);
        }
        if let Some((host, port)) = Self::rsplit_port(text) {
            if let Ok(addr) = host.parse::<Ipv4Addr>() {
                return Ok(Skad::inet4(addr, port));
            }
            return Err(Error::Inval);
        }
        if let Ok(addr) = text.parse::<Ipv4Addr>() {
            return Ok(Skad::inet4(addr, 0));
        }
        if let Ok(addr) = text.parse::<Ipv6Addr>() {
            return Ok(Skad::inet6(addr, 0, 0));
        }
        Err(Error::Inval)
    }

    fn rsplit_port(text: &str) -> Option<(&str, u16)> {
        let (host, port_text) = text.rsplit_once(':')?;
        if host.is_empty() || host.contains(':') {
            return None;
        }
        port_text.parse().ok().map(|port| (host, port))
    }

    fn parse_bracketed_ipv6(rest: &str) -> Result<Skad> {
        let close = rest.find(']').ok_or(Error::Inval)?;
        let (addr_part, tail) = rest.split_at(close);
        let tail = &tail[1..]; // skip ']'

        let (addr_text, scope_text) = match addr_part.split_once('%') {
            Some((a, s)) => (a, Some(s)),
            None => (addr_part, None),
        };
        let addr: Ipv6Addr = addr_text.parse().map_err(|_| Error::Inval)?;

        let scope_id = match scope_text {
            Some(s) => Self::resolve_scope(s)?,
            None => 0,
        };

        let port = if let Some(port_text) = tail.strip_prefix(':') {
            port_text.parse().map_err(|_| Error::Inval)?
        } else if tail.is_empty() {
            0
        } else {
            return Err(Error::Inval);
        };

        Ok(Skad::inet6(addr, port, scope_id))
    }

    /// A scope-id is either a decimal number or an interface name resolved
    /// via `if_nametoindex(3)`.
    fn resolve_scope(text: &str) -> Result<u32> {
        if text.bytes().all(|b| b.is_ascii_digit()) {
            return text.parse::<u32>().map_err(|_| Error::Inval);
        }
        let cstr = std::ffi::CString::new(text).map_err(|_| Error::Inval)?;
        // SAFETY: `cstr` is a valid, nul-terminated C string for the
        // duration of this call.
        let idx = unsafe { libc::if_nametoindex(cstr.as_ptr()) };
        if idx == 0 {
            Err(Error::Inval)
        } else {
            Ok(idx)
        }
    }

    /// Render per `flags` (§4.2). IPv6 zero-run compression follows RFC 5952
    /// (longest run of length ≥ 2; ties broken by leftmost run).
    pub fn format(&self, flags: FormatFlags) -> String {
        let want_addr = flags.contains(FormatFlags::ADDR);
        let want_port = flags.contains(FormatFlags::PORT);

        match &self.kind {
            Kind::Inet4 { addr, port } => {
                let mut out = String::new();
                if want_addr {
                    out.push_str(&addr.to_string());
                }
                if want_port && *port != 0 {
                    if want_addr {
                        out.push(':');
                    }
                    out.push_str(&port.to_string());
                }
                out
            }
            Kind::Inet6 { scope_id, port, .. } => {
                let mut out = String::new();
                if want_addr {
                    out.push_str(&self.format_ipv6_compressed());
                    if *scope_id != 0 {
                        out.push('%');
                        out.push_str(&scope_id.to_string());
                    }
                }
                if want_port && *port != 0 {
                    if want_addr {
                        return format!("[{out}]:{port}");
                    }
                    out.push_str(&port.to_string());
                }
                out
            }
            Kind::Unix { path } => format!("@{}", path.display()),
            Kind::Link { ifindex, hwaddr } => format!(
                "link#{ifindex}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
                hwaddr[0], hwaddr[1], hwaddr[2], hwaddr[3], hwaddr[4], hwaddr[5]
            ),
            Kind::Qx => "<qx>".to_string(),
        }
    }

    /// RFC 5952 §4.2: compress the longest run of ≥ 2 all-zero groups,
    /// falling back to the IPv4-embedded `::ffff:a.b.c.d` shorthand.
    fn format_ipv6_compressed(&self) -> String {
        let (addr, _, _) = self.ipv6().expect("format_ipv6 on non-ipv6 skad");
        let segs = addr.segments();

        if let Some(v4) = addr.to_ipv4_mapped() {
            return format!("::ffff:{v4}");
        }

        let mut best_run: Option<(usize, usize)> = None; // (start, len)
        let mut cur_start = None;
        for (i, seg) in segs.iter().enumerate() {
            if *seg == 0 {
                if cur_start.is_none() {
                    cur_start = Some(i);
                }
            } else if let Some(start) = cur_start.take() {
                let len = i - start;
                if len >= 2 && best_run.map_or(true, |(_, blen)| len > blen) {
                    best_run = Some((start, len));
                }
            }
        }
        if let Some(start) = cur_start {
            let len = 8 - start;
            if len >= 2 && best_run.map_or(true, |(_, blen)| len > blen) {
                best_run = Some((start, len));
            }
        }

        match best_run {
            None => segs
                .iter()
                .map(|s| format!("{s:x}"))
                .collect::<Vec<_>>()
                .join(":"),
            Some((start, len)) => {
                let head: Vec<String> = segs[..start].iter().map(|s| format!("{s:x}")).collect();
                let tail: Vec<String> =
                    segs[start + len..].iter().map(|s| format!("{s:x}")).collect();
                format!("{}::{}", head.join(":"), tail.join(":"))
            }
        }
    }
}

impl fmt::Display for Skad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(FormatFlags::ADDR_PORT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_ipv4() {
        let a = Skad::parse("93.184.216.34:80").unwrap();
        let text = a.format(FormatFlags::ADDR_PORT);
        assert_eq!(Skad::parse(&text).unwrap(), a);
    }

    #[test]
    fn round_trip_ipv6_with_scope() {
        let a = Skad::parse("[fe80::1%3]:22").unwrap();
        assert!(a.is_ipv6());
        assert_eq!(a.port(), 22);
    }

    #[test]
    fn scope_id_overflow_is_inval() {
        let huge = "9".repeat(30);
        let text = format!("[fe80::1%{huge}]:22");
        assert_eq!(Skad::parse(&text).unwrap_err().to_string(), "invalid argument");
    }

    #[test]
    fn missing_close_bracket_is_inval() {
        assert!(Skad::parse("[fe80::1:22").is_err());
    }

    #[test]
    fn blank_input_is_inval() {
        assert!(Skad::parse("").is_err());
    }

    #[test]
    fn zero_port_omitted_when_addr_only_requested() {
        let a = Skad::inet4(Ipv4Addr::new(127, 0, 0, 1), 0);
        assert_eq!(a.format(FormatFlags::ADDR), "127.0.0.1");
    }

    #[test]
    fn ipv4_mapped_ipv6_uses_shortcut() {
        let addr: Ipv6Addr = "::ffff:192.0.2.1".parse().unwrap();
        let a = Skad::inet6(addr, 0, 0);
        assert_eq!(a.format(FormatFlags::ADDR), "::ffff:192.0.2.1");
    }

    #[test]
    fn rfc5952_longest_run_compressed() {
        let addr: Ipv6Addr = "2001:0:0:1:0:0:0:1".parse().unwrap();
        let a = Skad::inet6(addr, 0, 0);
        assert_eq!(a.format(FormatFlags::ADDR), "2001:0:0:1::1");
    }

    #[test]
    fn unix_path_round_trip() {
        let a = Skad::parse("@/tmp/t06.sck").unwrap();
        assert!(a.is_unix());
        assert_eq!(a.format(FormatFlags::ADDR), "@/tmp/t06.sck");
    }

    #[test]
    fn channel_excluded_from_equality() {
        let mut a = Skad::inet4(Ipv4Addr::new(127, 0, 0, 1), 9);
        let b = a.clone();
        a.set_channel(5);
        assert_eq!(a, b);
    }
}
