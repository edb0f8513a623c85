//! The wire codec (§4.6): name compression/decompression per RFC 1035
//! §4.1.4, the 12-byte header, question/answer records, and the EDNS0 OPT
//! pseudo-RR per RFC 6891.
//!
//! Mirrors the original's two-pass `hio_svc_dnc_make_req` / `hio_dns_make_pkt`
//! (size first, then encode in place) and `hio_dns_parse_pkt` (resolve every
//! compressed name into a canonical dotted string during the single parse
//! pass, per §3's invariant).

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::dns::{
    Edns, EdnsOption, Header, MsgBuilder, Opcode, PktInfo, Question, RData, Rcode, ResourceRecord,
    EOPT_COOKIE,
};
use crate::error::{Error, Result};

const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_JUMPS: usize = 128;

// ---------------------------------------------------------------- names

fn encode_name(out: &mut Vec<u8>, name: &str, compress: &mut HashMap<String, u16>) -> Result<()> {
    let mut rest = name.trim_end_matches('.');
    loop {
        if rest.is_empty() {
            out.push(0);
            return Ok(());
        }

        if let Some(&ptr) = compress.get(rest) {
            if ptr <= 0x3FFF {
                out.push(0xC0 | ((ptr >> 8) as u8));
                out.push((ptr & 0xFF) as u8);
                return Ok(());
            }
        }

        if out.len() <= 0x3FFF {
            compress.insert(rest.to_string(), out.len() as u16);
        }

        let (label, tail) = match rest.split_once('.') {
            Some((l, t)) => (l, t),
            None => (rest, ""),
        };
        if label.len() > MAX_LABEL_LEN {
            return Err(Error::Inval);
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
        rest = tail;
    }
}

fn decode_name(buf: &[u8], start: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut end_pos: Option<usize> = None;
    let mut jumps = 0;

    loop {
        let len = *buf.get(pos).ok_or(Error::Inval)? as usize;
        if len == 0 {
            pos += 1;
            if end_pos.is_none() {
                end_pos = Some(pos);
            }
            break;
        }
        match len >> 6 {
            0b00 => {
                let label = buf
                    .get(pos + 1..pos + 1 + len)
                    .ok_or(Error::Inval)?;
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + len;
            }
            0b11 => {
                let lo = *buf.get(pos + 1).ok_or(Error::Inval)? as usize;
                let target = ((len & 0x3F) << 8) | lo;
                if end_pos.is_none() {
                    end_pos = Some(pos + 2);
                }
                jumps += 1;
                if jumps > MAX_NAME_JUMPS || target >= pos {
                    return Err(Error::Inval);
                }
                // A pointer's target must be a label, not another pointer
                // (RFC 1035 §4.1.4): pointer-to-pointer chains are rejected
                // rather than followed, matching the original decoder.
                let target_len = *buf.get(target).ok_or(Error::Inval)?;
                if target_len >> 6 == 0b11 {
                    return Err(Error::Inval);
                }
                pos = target;
            }
            _ => return Err(Error::Inval),
        }
    }

    Ok((labels.join("."), end_pos.unwrap()))
}

// ---------------------------------------------------------------- header

fn encode_header(out: &mut Vec<u8>, h: &Header, counts: [u16; 4]) {
    out.extend_from_slice(&h.id.to_be_bytes());
    let mut flags: u16 = 0;
    if h.qr {
        flags |= 1 << 15;
    }
    flags |= (h.opcode.to_u8() as u16 & 0x0F) << 11;
    if h.aa {
        flags |= 1 << 10;
    }
    if h.tc {
        flags |= 1 << 9;
    }
    if h.rd {
        flags |= 1 << 8;
    }
    if h.ra {
        flags |= 1 << 7;
    }
    if h.ad {
        flags |= 1 << 5;
    }
    if h.cd {
        flags |= 1 << 4;
    }
    flags |= h.rcode.0 & 0x0F;
    out.extend_from_slice(&flags.to_be_bytes());
    for c in counts {
        out.extend_from_slice(&c.to_be_bytes());
    }
}

fn decode_header(buf: &[u8]) -> Result<(Header, [u16; 4])> {
    if buf.len() < HEADER_LEN {
        return Err(Error::Inval);
    }
    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    let header = Header {
        id,
        qr: flags & (1 << 15) != 0,
        opcode: Opcode::from_u8(((flags >> 11) & 0x0F) as u8),
        aa: flags & (1 << 10) != 0,
        tc: flags & (1 << 9) != 0,
        rd: flags & (1 << 8) != 0,
        ra: flags & (1 << 7) != 0,
        ad: flags & (1 << 5) != 0,
        cd: flags & (1 << 4) != 0,
        rcode: Rcode(flags & 0x0F),
    };
    let counts = [
        u16::from_be_bytes([buf[4], buf[5]]),
        u16::from_be_bytes([buf[6], buf[7]]),
        u16::from_be_bytes([buf[8], buf[9]]),
        u16::from_be_bytes([buf[10], buf[11]]),
    ];
    Ok((header, counts))
}

// ------------------------------------------------------------ resources

fn encode_rdata(out: &mut Vec<u8>, rdata: &RData, compress: &mut HashMap<String, u16>) -> Result<()> {
    match rdata {
        RData::A(addr) => out.extend_from_slice(&addr.octets()),
        RData::Aaaa(addr) => out.extend_from_slice(&addr.octets()),
        RData::Ns(name) | RData::Cname(name) | RData::Ptr(name) => {
            encode_name(out, name, compress)?
        }
        RData::Mx { preference, exchange } => {
            out.extend_from_slice(&preference.to_be_bytes());
            encode_name(out, exchange, compress)?;
        }
        RData::Txt(data) => {
            out.push(data.len().min(255) as u8);
            out.extend_from_slice(&data[..data.len().min(255)]);
        }
        RData::Soa {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => {
            encode_name(out, mname, compress)?;
            encode_name(out, rname, compress)?;
            for v in [serial, refresh, retry, expire, minimum] {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        RData::Raw(data) => out.extend_from_slice(data),
    }
    Ok(())
}

fn decode_rdata(buf: &[u8], rrtype: u16, start: usize, dlen: usize) -> Result<RData> {
    let end = start + dlen;
    let slice = buf.get(start..end).ok_or(Error::Inval)?;
    Ok(match crate::dns::RrType::from_u16(rrtype) {
        crate::dns::RrType::A => {
            if slice.len() != 4 {
                return Err(Error::Inval);
            }
            RData::A(Ipv4Addr::new(slice[0], slice[1], slice[2], slice[3]))
        }
        crate::dns::RrType::Aaaa => {
            if slice.len() != 16 {
                return Err(Error::Inval);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(slice);
            RData::Aaaa(Ipv6Addr::from(octets))
        }
        crate::dns::RrType::Ns => RData::Ns(decode_name(buf, start)?.0),
        crate::dns::RrType::Cname => RData::Cname(decode_name(buf, start)?.0),
        crate::dns::RrType::Ptr => RData::Ptr(decode_name(buf, start)?.0),
        crate::dns::RrType::Mx => {
            if slice.len() < 3 {
                return Err(Error::Inval);
            }
            let preference = u16::from_be_bytes([slice[0], slice[1]]);
            let (exchange, _) = decode_name(buf, start + 2)?;
            RData::Mx { preference, exchange }
        }
        crate::dns::RrType::Txt => {
            let n = *slice.first().ok_or(Error::Inval)? as usize;
            let text = slice.get(1..1 + n).ok_or(Error::Inval)?;
            RData::Txt(text.to_vec())
        }
        crate::dns::RrType::Soa => {
            let (mname, p1) = decode_name(buf, start)?;
            let (rname, p2) = decode_name(buf, p1)?;
            let tail = buf.get(p2..p2 + 20).ok_or(Error::Inval)?;
            let word = |i: usize| {
                u32::from_be_bytes([tail[i], tail[i + 1], tail[i + 2], tail[i + 3]])
            };
            RData::Soa {
                mname,
                rname,
                serial: word(0),
                refresh: word(4),
                retry: word(8),
                expire: word(12),
                minimum: word(16),
            }
        }
        _ => RData::Raw(slice.to_vec()),
    })
}

fn encode_rr(out: &mut Vec<u8>, rr: &ResourceRecord, compress: &mut HashMap<String, u16>) -> Result<()> {
    encode_name(out, &rr.name, compress)?;
    out.extend_from_slice(&rr.rrtype.to_be_bytes());
    out.extend_from_slice(&rr.rrclass.to_be_bytes());
    out.extend_from_slice(&rr.ttl.to_be_bytes());
    let dlen_pos = out.len();
    out.extend_from_slice(&[0, 0]);
    let rdata_start = out.len();
    encode_rdata(out, &rr.rdata, compress)?;
    let dlen = (out.len() - rdata_start) as u16;
    out[dlen_pos..dlen_pos + 2].copy_from_slice(&dlen.to_be_bytes());
    Ok(())
}

fn decode_rr(buf: &[u8], pos: usize) -> Result<(ResourceRecord, usize)> {
    let (name, p) = decode_name(buf, pos)?;
    let rest = buf.get(p..p + 10).ok_or(Error::Inval)?;
    let rrtype = u16::from_be_bytes([rest[0], rest[1]]);
    let rrclass = u16::from_be_bytes([rest[2], rest[3]]);
    let ttl = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
    let dlen = u16::from_be_bytes([rest[8], rest[9]]) as usize;
    let rdata_start = p + 10;
    let rdata = decode_rdata(buf, rrtype, rdata_start, dlen)?;
    Ok((
        ResourceRecord {
            name,
            rrtype,
            rrclass,
            ttl,
            rdata,
        },
        rdata_start + dlen,
    ))
}

fn encode_edns(out: &mut Vec<u8>, edns: &Edns, rcode_hi: u8) {
    out.push(0); // root name
    out.extend_from_slice(&crate::dns::RrType::Opt.to_u16().to_be_bytes());
    out.extend_from_slice(&edns.udp_payload_size.to_be_bytes());
    let ttl: u32 = ((rcode_hi as u32) << 24)
        | ((edns.version as u32) << 16)
        | ((edns.dnssec_ok as u32) << 15);
    out.extend_from_slice(&ttl.to_be_bytes());
    let dlen_pos = out.len();
    out.extend_from_slice(&[0, 0]);
    let opt_start = out.len();
    for opt in &edns.options {
        out.extend_from_slice(&opt.code.to_be_bytes());
        out.extend_from_slice(&(opt.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&opt.data);
    }
    let dlen = (out.len() - opt_start) as u16;
    out[dlen_pos..dlen_pos + 2].copy_from_slice(&dlen.to_be_bytes());
}

fn decode_edns(buf: &[u8], pos: usize) -> Result<(Edns, u8, usize)> {
    let (name, p) = decode_name(buf, pos)?;
    if !name.is_empty() {
        return Err(Error::Inval);
    }
    let rest = buf.get(p..p + 10).ok_or(Error::Inval)?;
    let rrtype = u16::from_be_bytes([rest[0], rest[1]]);
    if crate::dns::RrType::from_u16(rrtype) != crate::dns::RrType::Opt {
        return Err(Error::Inval);
    }
    let udp_payload_size = u16::from_be_bytes([rest[2], rest[3]]);
    let ttl = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
    let dlen = u16::from_be_bytes([rest[8], rest[9]]) as usize;
    let rcode_hi = (ttl >> 24) as u8;
    let version = ((ttl >> 16) & 0xFF) as u8;
    let dnssec_ok = (ttl >> 15) & 0x1 != 0;

    let mut options = Vec::new();
    let opt_start = p + 10;
    let opt_end = opt_start + dlen;
    let mut cur = opt_start;
    while cur + 4 <= opt_end {
        let code = u16::from_be_bytes([buf[cur], buf[cur + 1]]);
        let olen = u16::from_be_bytes([buf[cur + 2], buf[cur + 3]]) as usize;
        let data = buf
            .get(cur + 4..cur + 4 + olen)
            .ok_or(Error::Inval)?
            .to_vec();
        options.push(EdnsOption { code, data });
        cur += 4 + olen;
    }

    Ok((
        Edns {
            udp_payload_size,
            version,
            dnssec_ok,
            options,
        },
        rcode_hi,
        opt_end,
    ))
}

// -------------------------------------------------------------- message

/// Two-pass encode per §4.6: build into a growable buffer (the "sizing"
/// pass is implicit in `Vec`'s own growth, unlike the original's explicit
/// size-then-allocate split, since Rust has no use for a single fixed
/// allocation here), patch section counts once every record is placed.
pub fn encode(msg: &MsgBuilder) -> Result<Vec<u8>> {
    let header = msg.header.ok_or(Error::Inval)?;
    if header.rcode.0 > 0x0F && msg.edns.is_none() {
        return Err(Error::Inval);
    }

    let mut out = Vec::with_capacity(512);
    encode_header(
        &mut out,
        &header,
        [
            msg.questions.len() as u16,
            msg.answer.len() as u16,
            msg.authority.len() as u16,
            msg.additional.len() as u16,
        ],
    );

    let mut compress = HashMap::new();
    for q in &msg.questions {
        encode_name(&mut out, &q.qname, &mut compress)?;
        out.extend_from_slice(&q.qtype.to_be_bytes());
        out.extend_from_slice(&q.qclass.to_be_bytes());
    }
    for rr in &msg.answer {
        encode_rr(&mut out, rr, &mut compress)?;
    }
    for rr in &msg.authority {
        encode_rr(&mut out, rr, &mut compress)?;
    }
    for rr in &msg.additional {
        encode_rr(&mut out, rr, &mut compress)?;
    }
    if let Some(edns) = &msg.edns {
        let rcode_hi = (header.rcode.0 >> 4) as u8;
        encode_edns(&mut out, edns, rcode_hi);
        let arcount = msg.additional.len() as u16 + 1;
        out[10..12].copy_from_slice(&arcount.to_be_bytes());
    }

    Ok(out)
}

/// Full decode into a [`PktInfo`]. The OPT RR, if present in the
/// additional section, is pulled out into `edns` rather than left as an
/// ordinary record (§3: EDNS block is its own field).
pub fn decode(buf: &[u8]) -> Result<PktInfo> {
    let (header, counts) = decode_header(buf)?;
    let [qdcount, ancount, nscount, arcount] = counts;

    let mut pos = HEADER_LEN;
    let mut questions = Vec::with_capacity(qdcount as usize);
    for _ in 0..qdcount {
        let (qname, p) = decode_name(buf, pos)?;
        let rest = buf.get(p..p + 4).ok_or(Error::Inval)?;
        questions.push(Question {
            qname,
            qtype: u16::from_be_bytes([rest[0], rest[1]]),
            qclass: u16::from_be_bytes([rest[2], rest[3]]),
        });
        pos = p + 4;
    }

    let mut decode_section = |count: u16, pos: &mut usize| -> Result<Vec<ResourceRecord>> {
        let mut v = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (rr, next) = decode_rr(buf, *pos)?;
            *pos = next;
            v.push(rr);
        }
        Ok(v)
    };

    let answer = decode_section(ancount, &mut pos)?;
    let authority = decode_section(nscount, &mut pos)?;

    let mut additional = Vec::new();
    let mut edns = None;
    let mut header = header;
    for _ in 0..arcount {
        let peek_len = *buf.get(pos).ok_or(Error::Inval)?;
        let peek_type = if peek_len == 0 {
            buf.get(pos + 1..pos + 3)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
        } else {
            None
        };
        if peek_type == Some(crate::dns::RrType::Opt.to_u16()) {
            let (e, rcode_hi, next) = decode_edns(buf, pos)?;
            edns = Some(e);
            header.rcode = Rcode(((rcode_hi as u16) << 4) | header.rcode.0);
            pos = next;
        } else {
            let (rr, next) = decode_rr(buf, pos)?;
            additional.push(rr);
            pos = next;
        }
    }

    Ok(PktInfo {
        header,
        questions,
        answer,
        authority,
        additional,
        edns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{Header, MsgBuilder, Question, RrClass, RrType};

    fn a_query(name: &str, id: u16) -> MsgBuilder {
        MsgBuilder {
            header: Some(Header::query(id)),
            questions: vec![Question {
                qname: name.to_string(),
                qtype: RrType::A.to_u16(),
                qclass: RrClass::IN.0,
            }],
            ..Default::default()
        }
    }

    #[test]
    fn round_trip_simple_query() {
        let msg = a_query("www.example.com", 0x1234);
        let bytes = encode(&msg).unwrap();
        let parsed = decode(&bytes).unwrap();
        assert_eq!(parsed.header.id, 0x1234);
        assert!(parsed.header.rd);
        assert_eq!(parsed.questions[0].qname, "www.example.com");
    }

    #[test]
    fn name_compression_shrinks_repeated_suffix() {
        let mut msg = a_query("a.example.com", 1);
        msg.answer.push(ResourceRecord {
            name: "b.example.com".to_string(),
            rrtype: RrType::A.to_u16(),
            rrclass: RrClass::IN.0,
            ttl: 300,
            rdata: RData::A(Ipv4Addr::new(1, 2, 3, 4)),
        });
        let header = msg.header.as_mut().unwrap();
        header.qr = true;
        let bytes = encode(&msg).unwrap();
        // Two full copies of "example.com" would cost more bytes than one
        // plus a two-byte pointer.
        let naive_len = "a.example.com".len() + "b.example.com".len();
        assert!(bytes.len() < HEADER_LEN + naive_len + 40);
        let parsed = decode(&bytes).unwrap();
        assert_eq!(parsed.answer[0].name, "b.example.com");
    }

    #[test]
    fn reserved_length_octet_is_rejected() {
        // Top two bits 01 (0x40..0x7F) are neither a plain label nor a
        // compression pointer and must be rejected, per §4.6.
        let mut buf = vec![0u8; HEADER_LEN];
        buf.push(0x40);
        let r = decode_name(&buf, HEADER_LEN);
        assert!(r.is_err());
    }

    #[test]
    fn pointer_to_pointer_is_rejected() {
        // A pointer whose target is itself a pointer must be rejected (§4.6,
        // RFC 1035 §4.1.4) rather than followed, even though the target
        // address itself is otherwise a legal (backward) jump.
        let mut buf = vec![0u8; HEADER_LEN];
        let inner_ptr_at = buf.len();
        buf.push(0xC0);
        buf.push(0x00); // inner pointer, targets offset 0
        let outer_ptr_at = buf.len();
        buf.push(0xC0);
        buf.push(inner_ptr_at as u8); // outer pointer, targets the inner pointer
        let r = decode_name(&buf, outer_ptr_at);
        assert!(r.is_err());
    }

    #[test]
    fn edns_round_trip_with_cookie() {
        let mut msg = a_query("example.com", 7);
        msg.edns = Some(Edns {
            udp_payload_size: 4096,
            version: 0,
            dnssec_ok: false,
            options: vec![EdnsOption {
                code: EOPT_COOKIE,
                data: vec![1, 2, 3, 4, 5, 6, 7, 8],
            }],
        });
        let bytes = encode(&msg).unwrap();
        let parsed = decode(&bytes).unwrap();
        let edns = parsed.edns.unwrap();
        assert_eq!(edns.udp_payload_size, 4096);
        assert_eq!(edns.cookie().unwrap(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn soa_rdata_round_trips() {
        let mut msg = a_query("example.com", 9);
        msg.answer.push(ResourceRecord {
            name: "example.com".to_string(),
            rrtype: RrType::Soa.to_u16(),
            rrclass: RrClass::IN.0,
            ttl: 3600,
            rdata: RData::Soa {
                mname: "ns1.example.com".to_string(),
                rname: "hostmaster.example.com".to_string(),
                serial: 2024010100,
                refresh: 7200,
                retry: 3600,
                expire: 1209600,
                minimum: 300,
            },
        });
        let bytes = encode(&msg).unwrap();
        let parsed = decode(&bytes).unwrap();
        match &parsed.answer[0].rdata {
            RData::Soa { serial, mname, .. } => {
                assert_eq!(*serial, 2024010100);
                assert_eq!(mname, "ns1.example.com");
            }
            other => panic!("unexpected rdata: {other:?}"),
        }
    }
}
