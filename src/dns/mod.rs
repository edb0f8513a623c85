//! DNS message model (§3 "DNS Message", §4.6): the packed/parsed split
//! mirrors the original's `hio_dns_msg_t`/`hio_dns_pkt_t` plus the
//! `hio_dns_bhdr_t`/`hio_dns_brr_t` breakdown structs used to build one.
//!
//! [`DnsMsg`] owns the wire bytes; [`PktInfo`] is what `wire::decode`
//! produces from them, with every compression pointer already resolved to
//! a plain dotted name.

pub mod client;
pub mod cookie;
pub mod wire;

pub const DNS_PORT: u16 = 53;

/// `hio_dns_opcode_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Query,
    IQuery,
    Status,
    Notify,
    Update,
    Other(u8),
}

impl Opcode {
    pub fn from_u8(v: u8) -> Opcode {
        match v {
            0 => Opcode::Query,
            1 => Opcode::IQuery,
            2 => Opcode::Status,
            4 => Opcode::Notify,
            5 => Opcode::Update,
            other => Opcode::Other(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Opcode::Query => 0,
            Opcode::IQuery => 1,
            Opcode::Status => 2,
            Opcode::Notify => 4,
            Opcode::Update => 5,
            Opcode::Other(v) => v,
        }
    }
}

/// `hio_dns_rcode_t`. Values above 15 only make sense with EDNS0 (the
/// upper 8 bits ride in the OPT RR's TTL field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rcode(pub u16);

impl Rcode {
    pub const NOERROR: Rcode = Rcode(0);
    pub const FORMERR: Rcode = Rcode(1);
    pub const SERVFAIL: Rcode = Rcode(2);
    pub const NXDOMAIN: Rcode = Rcode(3);
    pub const NOTIMPL: Rcode = Rcode(4);
    pub const REFUSED: Rcode = Rcode(5);
    pub const BADCOOKIE: Rcode = Rcode(23);
}

/// `hio_dns_rrt_t`, restricted to the types §4.6 names plus a pass-through
/// for everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RrType {
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Mx,
    Txt,
    Aaaa,
    Opt,
    Other(u16),
}

impl RrType {
    pub fn from_u16(v: u16) -> RrType {
        match v {
            1 => RrType::A,
            2 => RrType::Ns,
            5 => RrType::Cname,
            6 => RrType::Soa,
            12 => RrType::Ptr,
            15 => RrType::Mx,
            16 => RrType::Txt,
            28 => RrType::Aaaa,
            41 => RrType::Opt,
            other => RrType::Other(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            RrType::A => 1,
            RrType::Ns => 2,
            RrType::Cname => 5,
            RrType::Soa => 6,
            RrType::Ptr => 12,
            RrType::Mx => 15,
            RrType::Txt => 16,
            RrType::Aaaa => 28,
            RrType::Opt => 41,
            RrType::Other(v) => v,
        }
    }

    /// Legacy mailbox query types (`MAILA`/`MAILB`) recognized only by
    /// `resolve`'s BRIEF post-processing, per §4.7.
    pub fn is_legacy_mail(self) -> bool {
        matches!(self, RrType::Other(253) | RrType::Other(254))
    }
}

pub const QTYPE_ANY: u16 = 255;
pub const QTYPE_AXFR: u16 = 252;

/// `hio_dns_rrc_t`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RrClass(pub u16);

impl RrClass {
    pub const IN: RrClass = RrClass(1);
    pub const CH: RrClass = RrClass(3);
    pub const ANY: RrClass = RrClass(255);
}

/// `hio_dns_bhdr_t`: the id/flags breakdown, excluding section counts
/// (those are derived from the section vectors when encoding).
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub id: u16,
    pub qr: bool,
    pub opcode: Opcode,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub ad: bool,
    pub cd: bool,
    pub rcode: Rcode,
}

impl Header {
    pub fn query(id: u16) -> Header {
        Header {
            id,
            qr: false,
            opcode: Opcode::Query,
            aa: false,
            tc: false,
            rd: true,
            ra: false,
            ad: false,
            cd: false,
            rcode: Rcode::NOERROR,
        }
    }
}

/// `hio_dns_bqr_t`.
#[derive(Debug, Clone)]
pub struct Question {
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// RDATA, decoded for the types §4.6 names and left as raw bytes for
/// everything else (`Other`'s name/MX/PTR style names inside RDATA, such
/// as CNAME's target, are left undecoded past the name itself — the
/// original doesn't expand those into typed structs beyond SOA either).
#[derive(Debug, Clone)]
pub enum RData {
    A(std::net::Ipv4Addr),
    Aaaa(std::net::Ipv6Addr),
    Ns(String),
    Cname(String),
    Ptr(String),
    Mx { preference: u16, exchange: String },
    Txt(Vec<u8>),
    Soa {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Raw(Vec<u8>),
}

/// `hio_dns_brr_t`: one answer/authority/additional record.
#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub name: String,
    pub rrtype: u16,
    pub rrclass: u16,
    pub ttl: u32,
    pub rdata: RData,
}

/// One EDNS0 option inside the OPT RR (§4.6's NSID/COOKIE/padding).
#[derive(Debug, Clone)]
pub struct EdnsOption {
    pub code: u16,
    pub data: Vec<u8>,
}

pub const EOPT_COOKIE: u16 = 10;

/// `hio_dns_bedns_t`: the OPT pseudo-RR's breakdown.
#[derive(Debug, Clone)]
pub struct Edns {
    pub udp_payload_size: u16,
    pub version: u8,
    pub dnssec_ok: bool,
    pub options: Vec<EdnsOption>,
}

impl Edns {
    pub fn cookie(&self) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|o| o.code == EOPT_COOKIE)
            .map(|o| o.data.as_slice())
    }
}

/// The parsed representation produced by [`wire::decode`]: every name,
/// including compressed ones, has already been resolved to a canonical
/// dotted string (§3 invariant).
#[derive(Debug, Clone)]
pub struct PktInfo {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answer: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
    pub edns: Option<Edns>,
}

impl PktInfo {
    /// The question this message is about, if any. Most of hio's
    /// single-question queries only ever look at the first one.
    pub fn question(&self) -> Option<&Question> {
        self.questions.first()
    }
}

/// Everything needed to build one wire message: a header, the question
/// section, and the three RR sections. Passed to [`wire::encode`] and
/// owned by [`DnsMsg`] afterwards.
#[derive(Debug, Clone, Default)]
pub struct MsgBuilder {
    pub header: Option<Header>,
    pub questions: Vec<Question>,
    pub answer: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
    pub edns: Option<Edns>,
}

/// A packed DNS message: the owned wire bytes plus enough bookkeeping to
/// find the EDNS0 RR without re-parsing (`ednsrrtroff` in the original).
#[derive(Debug, Clone)]
pub struct DnsMsg {
    bytes: Vec<u8>,
}

impl DnsMsg {
    pub fn from_bytes(bytes: Vec<u8>) -> DnsMsg {
        DnsMsg { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn id(&self) -> Option<u16> {
        if self.bytes.len() >= 2 {
            Some(u16::from_be_bytes([self.bytes[0], self.bytes[1]]))
        } else {
            None
        }
    }
}
