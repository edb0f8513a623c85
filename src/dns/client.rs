//! The DNS client service (§4.7): one outstanding UDP socket per server,
//! a lazily-opened TCP fallback for truncated/AXFR-style queries, and the
//! `resolve()` convenience layer built on top of the raw transaction
//! lifecycle.
//!
//! Every inbound byte arrives through a device's `on_read`/`on_disconnect`
//! callback, none of which ever see `&mut Reactor` (§6.4's vtable is
//! deliberately narrow). So the UDP and TCP devices only stage raw bytes
//! (or a disconnect flag) into shared state, and [`ServiceHandle::poll`]
//! does the actual transaction work — matching a reply to its pending
//! request, cancelling/rearming the reply timer, opening or tearing down
//! the TCP socket, flushing queued TCP-bound queries — once per loop
//! iteration, the same pattern [`crate::net::AcceptDispatch`] uses for its
//! own accept mailbox.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::device::socket::{BindOpts, Progress, SockType, SocketDevice};
use crate::device::Capability;
use crate::device::DeviceIdx;
use crate::dns::cookie::{check_client_cookie, client_cookie, CookieCheck};
use crate::dns::wire;
use crate::dns::{
    Edns, EdnsOption, Header, MsgBuilder, PktInfo, Question, RData, ResourceRecord, RrClass,
    RrType, EOPT_COOKIE, QTYPE_ANY,
};
use crate::error::{Error, Result};
use crate::net;
use crate::reactor::Reactor;
use crate::services::Service;
use crate::skad::{FormatFlags, Skad};
use crate::timer::TimerIdx;

bitflags_like! {
    /// Flags accepted by [`DnsClient::resolve`] (§4.7).
    pub struct ResolveFlags: u8 {
        const DNSSEC_OK = 0b0001;
        const COOKIE = 0b0010;
        const BRIEF = 0b0100;
        const PREFER_TCP = 0b1000;
    }
}

/// One answer RR extracted by `resolve`'s `BRIEF` post-processing (§4.7),
/// without the surrounding header/question/other-RR noise of [`PktInfo`].
#[derive(Debug, Clone)]
pub struct BriefRr {
    pub rrtype: u16,
    pub rdata: RData,
    pub ttl: u32,
}

/// What a `resolve` callback is handed on success.
#[derive(Debug, Clone)]
pub enum Answer {
    Full(PktInfo),
    Brief(BriefRr),
}

type DoneCb = Box<dyn FnOnce(Result<Answer>)>;

struct PendingRequest {
    packet: Vec<u8>,
    tries: u32,
    max_tries: u32,
    reply_tmout: Duration,
    timer_idx: TimerIdx,
    /// Set once on `PREFER_TCP`, or later when a UDP reply comes back
    /// truncated (§4.7 "UDP -> TCP fallback").
    use_tcp: bool,
    /// Whether this request's query has already been written to the TCP
    /// device. Distinct from `use_tcp` because a request can be marked
    /// TCP-bound before the TCP device even exists yet.
    tcp_sent: bool,
    /// `Some(qtype)` when `resolve` was called with `BRIEF`; drives the
    /// answer-extraction rule in [`select_brief_rr`].
    brief_qtype: Option<u16>,
    client_cookie: Option<[u8; 8]>,
    on_done: Option<DoneCb>,
}

struct Inner<W> {
    server: Skad,
    send_tmout: Duration,
    reply_tmout: Duration,
    max_tries: u32,
    next_id: u16,
    cookie_key: [u8; 16],
    udp_dev: DeviceIdx,
    tcp_dev: Option<DeviceIdx>,
    tcp_rollbuf: Vec<u8>,
    udp_mailbox: Rc<RefCell<VecDeque<(Vec<u8>, Skad)>>>,
    tcp_mailbox: Rc<RefCell<VecDeque<Vec<u8>>>>,
    tcp_disconnected: Rc<RefCell<bool>>,
    pending: HashMap<u16, PendingRequest>,
}

/// A running DNS client (§3 "DNS Session"). Cheap to clone — every clone
/// shares the same underlying state, the way a `Reactor`-owned service and
/// the handle an application holds need to.
pub struct DnsClient<W>(Rc<RefCell<Inner<W>>>);

impl<W> Clone for DnsClient<W> {
    fn clone(&self) -> Self {
        DnsClient(self.0.clone())
    }
}

fn seed_cookie_key() -> [u8; 16] {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_le_bytes()
}

fn cookie_address_bytes(server: &Skad) -> Vec<u8> {
    if let Some((addr, _)) = server.ipv4_parts() {
        addr.octets().to_vec()
    } else if let Some((addr, _, _)) = server.ipv6_parts() {
        addr.octets().to_vec()
    } else {
        server.format(FormatFlags::ADDR).into_bytes()
    }
}

/// `resolve`'s `BRIEF` extraction rule (§4.7): `QTYPE_ANY` prefers the
/// first A/AAAA and falls back to the first answer at all; the legacy
/// `MAILA`/`MAILB` pseudo-types take the first legacy-mail RR regardless
/// of its exact type; everything else takes the first RR matching `qtype`
/// exactly.
fn select_brief_rr(pkt: &PktInfo, qtype: u16) -> Option<&ResourceRecord> {
    if qtype == QTYPE_ANY {
        pkt.answer
            .iter()
            .find(|rr| rr.rrtype == RrType::A.to_u16() || rr.rrtype == RrType::Aaaa.to_u16())
            .or_else(|| pkt.answer.first())
    } else if RrType::from_u16(qtype).is_legacy_mail() {
        pkt.answer
            .iter()
            .find(|rr| RrType::from_u16(rr.rrtype).is_legacy_mail())
    } else {
        pkt.answer.iter().find(|rr| rr.rrtype == qtype)
    }
}

fn build_answer(pkt: &PktInfo, brief_qtype: Option<u16>) -> Result<Answer> {
    match brief_qtype {
        None => Ok(Answer::Full(pkt.clone())),
        Some(qtype) => {
            let rr = select_brief_rr(pkt, qtype).ok_or(Error::NoEnt)?;
            Ok(Answer::Brief(BriefRr {
                rrtype: rr.rrtype,
                rdata: rr.rdata.clone(),
                ttl: rr.ttl,
            }))
        }
    }
}

impl<W: 'static + Default> DnsClient<W> {
    /// `start` (§4.7): open a UDP socket of `server`'s address family,
    /// optionally `bind` it, and seed the cookie key from the current
    /// time. The TCP fallback socket is not opened until a query actually
    /// needs it.
    pub fn start(
        reactor: &mut Reactor<W>,
        server: Skad,
        bind_addr: Option<&Skad>,
        send_tmout: Duration,
        reply_tmout: Duration,
        max_tries: u32,
    ) -> Result<DnsClient<W>> {
        let ty = if server.is_ipv6() { SockType::Udp6 } else { SockType::Udp4 };
        let udp_mailbox = Rc::new(RefCell::new(VecDeque::new()));
        let mb = udp_mailbox.clone();
        let mut dev: SocketDevice<W> = SocketDevice::new(ty);
        dev.set_on_read(move |data, src| {
            let src = src.cloned().unwrap_or_else(Skad::qx);
            mb.borrow_mut().push_back((data.to_vec(), src));
        });
        let udp_dev = reactor.make_device(Box::new(dev), Capability::IN)?;
        if let Some(addr) = bind_addr {
            let sd = reactor
                .device_as_mut::<SocketDevice<W>>(udp_dev)
                .ok_or(Error::BadHnd)?;
            sd.bind(addr, &BindOpts::default())?;
        }

        let inner = Rc::new(RefCell::new(Inner {
            server,
            send_tmout,
            reply_tmout,
            max_tries,
            next_id: 0,
            cookie_key: seed_cookie_key(),
            udp_dev,
            tcp_dev: None,
            tcp_rollbuf: Vec::new(),
            udp_mailbox,
            tcp_mailbox: Rc::new(RefCell::new(VecDeque::new())),
            tcp_disconnected: Rc::new(RefCell::new(false)),
            pending: HashMap::new(),
        }));

        let client = DnsClient(inner);
        reactor.register_service(Box::new(ServiceHandle(client.clone())));
        Ok(client)
    }

    /// Issue one query (§4.7 "resolve"). `on_resolve` fires exactly once,
    /// either with the answer or with the error that ended the
    /// transaction (cookie mismatch, exhausted retries, malformed reply).
    pub fn resolve(
        &self,
        reactor: &mut Reactor<W>,
        qname: &str,
        qtype: u16,
        flags: ResolveFlags,
        on_resolve: impl FnOnce(Result<Answer>) + 'static,
    ) -> Result<()> {
        let id = {
            let mut inner = self.0.borrow_mut();
            inner.next_id = inner.next_id.wrapping_add(1);
            inner.next_id
        };

        let mut builder = MsgBuilder {
            header: Some(Header::query(id)),
            questions: vec![Question {
                qname: qname.to_string(),
                qtype,
                qclass: RrClass::IN.0,
            }],
            ..Default::default()
        };

        let mut client_cookie_bytes = None;
        if flags.contains(ResolveFlags::COOKIE) || flags.contains(ResolveFlags::DNSSEC_OK) {
            let mut options = Vec::new();
            if flags.contains(ResolveFlags::COOKIE) {
                let (server, key) = {
                    let inner = self.0.borrow();
                    (inner.server.clone(), inner.cookie_key)
                };
                let cookie = client_cookie(&key, &cookie_address_bytes(&server));
                options.push(EdnsOption {
                    code: EOPT_COOKIE,
                    data: cookie.to_vec(),
                });
                client_cookie_bytes = Some(cookie);
            }
            builder.edns = Some(Edns {
                udp_payload_size: 4096,
                version: 0,
                dnssec_ok: flags.contains(ResolveFlags::DNSSEC_OK),
                options,
            });
        }

        let packet = wire::encode(&builder)?;
        let (reply_tmout, max_tries) = {
            let inner = self.0.borrow();
            (inner.reply_tmout, inner.max_tries)
        };

        let req = PendingRequest {
            packet,
            tries: 0,
            max_tries,
            reply_tmout,
            timer_idx: TimerIdx::INVALID,
            use_tcp: flags.contains(ResolveFlags::PREFER_TCP),
            tcp_sent: false,
            brief_qtype: if flags.contains(ResolveFlags::BRIEF) {
                Some(qtype)
            } else {
                None
            },
            client_cookie: client_cookie_bytes,
            on_done: Some(Box::new(on_resolve)),
        };
        self.0.borrow_mut().pending.insert(id, req);

        self.send_request(reactor, id);
        Ok(())
    }

    /// Explicit teardown (§4.7 "stop"): closes the UDP socket (and TCP, if
    /// open), fails every still-pending request with [`Error::NoRsp`].
    /// Also invoked by [`Reactor::close`] via the registered service.
    pub fn stop(&self, reactor: &mut Reactor<W>) {
        let (udp_dev, tcp_dev) = {
            let mut inner = self.0.borrow_mut();
            (inner.udp_dev, inner.tcp_dev.take())
        };
        reactor.halt(udp_dev);
        if let Some(tcp_dev) = tcp_dev {
            reactor.halt(tcp_dev);
        }
        let drained: Vec<(u16, PendingRequest)> = self.0.borrow_mut().pending.drain().collect();
        for (_, mut req) in drained {
            reactor.cancel_timer(req.timer_idx);
            if let Some(cb) = req.on_done.take() {
                cb(Err(Error::NoRsp));
            }
        }
    }

    /// Finish a transaction: remove it from the pending table, cancel its
    /// still-live reply timer and invoke its callback.
    fn complete(&self, reactor: &mut Reactor<W>, id: u16, result: Result<Answer>) {
        let req = self.0.borrow_mut().pending.remove(&id);
        if let Some(mut req) = req {
            reactor.cancel_timer(req.timer_idx);
            if let Some(cb) = req.on_done.take() {
                cb(result);
            }
        }
    }

    /// Same as [`Self::complete`] but for a request whose reply timer has
    /// already fired (and so was already removed from the heap) — calling
    /// `cancel_timer` again would delete whatever unrelated job now
    /// occupies that stale index.
    fn fail_expired(&self, id: u16) {
        let req = self.0.borrow_mut().pending.remove(&id);
        if let Some(mut req) = req {
            if let Some(cb) = req.on_done.take() {
                cb(Err(Error::TmOut));
            }
        }
    }

    fn on_reply_timeout(&self, reactor: &mut Reactor<W>, id: u16) {
        let should_retry = {
            let inner = self.0.borrow();
            match inner.pending.get(&id) {
                Some(req) => req.tries < req.max_tries,
                None => return,
            }
        };
        if should_retry {
            self.send_request(reactor, id);
        } else {
            self.fail_expired(id);
        }
    }

    /// Send (or re-send) `id`'s query and arm its reply timer. UDP sends
    /// happen inline; a TCP-bound request is only marked not-yet-sent
    /// here — [`ServiceHandle::poll_tcp_send`] writes it once the TCP
    /// device exists and is connected.
    fn send_request(&self, reactor: &mut Reactor<W>, id: u16) {
        let snapshot = {
            let inner = self.0.borrow();
            inner.pending.get(&id).map(|req| (req.use_tcp, req.packet.clone()))
        };
        let (use_tcp, packet) = match snapshot {
            Some(s) => s,
            None => return,
        };

        if use_tcp {
            if let Some(req) = self.0.borrow_mut().pending.get_mut(&id) {
                req.tcp_sent = false;
            }
            self.ensure_tcp(reactor);
        } else {
            let (udp_dev, server, send_tmout) = {
                let inner = self.0.borrow();
                (inner.udp_dev, inner.server.clone(), inner.send_tmout)
            };
            if let Err(e) = reactor.write(udp_dev, packet, W::default(), Some(server), Some(send_tmout)) {
                log::warn!("dns client: UDP send failed for id {id}: {e}");
                self.complete(reactor, id, Err(e));
                return;
            }
        }

        let (reply_tmout, max_tries) = {
            let inner = self.0.borrow();
            (inner.reply_tmout, inner.max_tries)
        };
        {
            let mut inner = self.0.borrow_mut();
            if let Some(req) = inner.pending.get_mut(&id) {
                req.tries += 1;
            }
        }
        if max_tries > 0 {
            let handle = self.clone();
            let timer_idx = reactor.schedule(Instant::now() + reply_tmout, move |reactor, _now| {
                handle.on_reply_timeout(reactor, id);
            });
            if let Some(req) = self.0.borrow_mut().pending.get_mut(&id) {
                req.timer_idx = timer_idx;
            }
        }
    }

    /// Switch a pending request to the TCP fallback on a truncated UDP
    /// reply (§4.7): rearms its reply timer fresh for the new transport
    /// and leaves it in the pending table rather than completing it.
    fn switch_to_tcp(&self, reactor: &mut Reactor<W>, id: u16, reply_tmout: Duration) {
        let old_timer = {
            let mut inner = self.0.borrow_mut();
            match inner.pending.get_mut(&id) {
                Some(req) => {
                    req.use_tcp = true;
                    req.tcp_sent = false;
                    req.timer_idx
                }
                None => return,
            }
        };
        reactor.cancel_timer(old_timer);
        let handle = self.clone();
        let timer_idx = reactor.schedule(Instant::now() + reply_tmout, move |reactor, _now| {
            handle.on_reply_timeout(reactor, id);
        });
        if let Some(req) = self.0.borrow_mut().pending.get_mut(&id) {
            req.timer_idx = timer_idx;
        }
        self.ensure_tcp(reactor);
    }

    /// Create and `connect` the TCP fallback device if it doesn't exist
    /// yet. A no-op once it's already there, whatever its connect state.
    fn ensure_tcp(&self, reactor: &mut Reactor<W>) {
        if self.0.borrow().tcp_dev.is_some() {
            return;
        }
        let (server, mailbox, disconnected) = {
            let inner = self.0.borrow();
            (
                inner.server.clone(),
                inner.tcp_mailbox.clone(),
                inner.tcp_disconnected.clone(),
            )
        };
        let ty = if server.is_ipv6() { SockType::Tcp6 } else { SockType::Tcp4 };
        let mut dev: SocketDevice<W> = SocketDevice::new(ty);
        dev.set_on_read(move |data, _src| mailbox.borrow_mut().push_back(data.to_vec()));
        dev.set_on_disconnect(move || *disconnected.borrow_mut() = true);
        let idx = match reactor.make_device(Box::new(dev), Capability::IN) {
            Ok(idx) => idx,
            Err(e) => {
                log::warn!("dns client: failed to create TCP fallback socket: {e}");
                return;
            }
        };
        if let Err(e) = net::connect(reactor, idx, &server, None) {
            log::warn!("dns client: TCP fallback connect failed: {e}");
            reactor.halt(idx);
            return;
        }
        self.0.borrow_mut().tcp_dev = Some(idx);
    }

    /// Apply a decoded reply (from either transport) to its matching
    /// pending request: cookie validation, the TC=1 fallback switch, or
    /// completion with the (possibly BRIEF-extracted) answer.
    ///
    /// `src` is the datagram's source address for UDP-delivered replies
    /// (`None` for TCP, whose byte stream is already a connected channel to
    /// the configured server and needs no separate address check). Per
    /// §4.7 step 3, UDP correlation is by id *and* peer address: a reply
    /// from anywhere other than the configured server is dropped as
    /// unmatched even if its transaction id happens to collide.
    fn handle_reply(&self, reactor: &mut Reactor<W>, pkt: PktInfo, src: Option<&Skad>) {
        let id = pkt.header.id;
        let snapshot = {
            let inner = self.0.borrow();
            inner.pending.get(&id).map(|req| {
                (
                    req.reply_tmout,
                    req.use_tcp,
                    req.client_cookie,
                    req.brief_qtype,
                )
            })
        };
        let (reply_tmout, already_tcp, client_cookie_bytes, brief_qtype) = match snapshot {
            Some(s) => s,
            None => {
                log::debug!("dns client: unmatched reply id {id}, dropping");
                return;
            }
        };

        if let Some(peer) = src {
            let server = self.0.borrow().server.clone();
            if *peer != server {
                log::debug!("dns client: reply id {id} from unexpected peer {peer}, dropping");
                return;
            }
        }

        if pkt.header.tc {
            if already_tcp {
                // A TCP reply cannot itself be truncated in any way this
                // client can recover from; treat it as a malformed reply.
                self.complete(reactor, id, Err(Error::EcErr));
                return;
            }
            self.switch_to_tcp(reactor, id, reply_tmout);
            return;
        }

        if let Some(cookie) = client_cookie_bytes {
            let resp_cookie = pkt.edns.as_ref().and_then(|e| e.cookie());
            match check_client_cookie(Some(&cookie), resp_cookie) {
                CookieCheck::Echoed | CookieCheck::NotRequested => {}
                CookieCheck::Missing | CookieCheck::Mismatch => {
                    self.complete(reactor, id, Err(Error::EcErr));
                    return;
                }
            }
        }

        let answer = build_answer(&pkt, brief_qtype);
        self.complete(reactor, id, answer);
    }
}

/// The [`Service`] registered with the reactor; wraps a [`DnsClient`]
/// handle so the two share the same underlying state.
struct ServiceHandle<W>(DnsClient<W>);

impl<W: 'static + Default> ServiceHandle<W> {
    fn poll_udp(&self, reactor: &mut Reactor<W>) {
        let drained: Vec<(Vec<u8>, Skad)> = {
            let inner = self.0 .0.borrow();
            inner.udp_mailbox.borrow_mut().drain(..).collect()
        };
        for (data, src) in drained {
            match wire::decode(&data) {
                Ok(pkt) => self.0.handle_reply(reactor, pkt, Some(&src)),
                Err(e) => log::debug!("dns client: dropping malformed UDP reply: {e}"),
            }
        }
    }

    fn poll_tcp_disconnect(&self, reactor: &mut Reactor<W>) {
        let disconnected = {
            let inner = self.0 .0.borrow();
            std::mem::take(&mut *inner.tcp_disconnected.borrow_mut())
        };
        if !disconnected {
            return;
        }
        let ids: Vec<u16> = {
            let inner = self.0 .0.borrow();
            inner
                .pending
                .iter()
                .filter(|(_, r)| r.use_tcp)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.0.complete(reactor, id, Err(Error::NoRsp));
        }
        let mut inner = self.0 .0.borrow_mut();
        inner.tcp_dev = None;
        inner.tcp_rollbuf.clear();
    }

    fn poll_tcp_read(&self, reactor: &mut Reactor<W>) {
        let chunks: Vec<Vec<u8>> = {
            let inner = self.0 .0.borrow();
            inner.tcp_mailbox.borrow_mut().drain(..).collect()
        };
        if chunks.is_empty() {
            return;
        }
        let frames = {
            let mut inner = self.0 .0.borrow_mut();
            for chunk in chunks {
                inner.tcp_rollbuf.extend_from_slice(&chunk);
            }
            let mut frames = Vec::new();
            loop {
                if inner.tcp_rollbuf.len() < 2 {
                    break;
                }
                let len = u16::from_be_bytes([inner.tcp_rollbuf[0], inner.tcp_rollbuf[1]]) as usize;
                if inner.tcp_rollbuf.len() < 2 + len {
                    break;
                }
                let frame = inner.tcp_rollbuf[2..2 + len].to_vec();
                inner.tcp_rollbuf.drain(..2 + len);
                frames.push(frame);
            }
            frames
        };
        for frame in frames {
            match wire::decode(&frame) {
                Ok(pkt) => self.0.handle_reply(reactor, pkt, None),
                Err(e) => log::debug!("dns client: dropping malformed TCP reply: {e}"),
            }
        }
    }

    fn poll_tcp_send(&self, reactor: &mut Reactor<W>) {
        let waiting: Vec<u16> = {
            let inner = self.0 .0.borrow();
            inner
                .pending
                .iter()
                .filter(|(_, r)| r.use_tcp && !r.tcp_sent)
                .map(|(id, _)| *id)
                .collect()
        };
        if waiting.is_empty() {
            return;
        }
        let tcp_dev = self.0 .0.borrow().tcp_dev;
        let tcp_dev = match tcp_dev {
            Some(idx) => idx,
            None => {
                self.0.ensure_tcp(reactor);
                return;
            }
        };
        let connected = reactor
            .device_as_mut::<SocketDevice<W>>(tcp_dev)
            .map(|d| d.progress() == Progress::Connected)
            .unwrap_or(false);
        if !connected {
            return;
        }
        let send_tmout = self.0 .0.borrow().send_tmout;
        for id in waiting {
            let packet = match self.0 .0.borrow().pending.get(&id) {
                Some(req) => req.packet.clone(),
                None => continue,
            };
            let mut framed = Vec::with_capacity(2 + packet.len());
            framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
            framed.extend_from_slice(&packet);
            match reactor.write(tcp_dev, framed, W::default(), None, Some(send_tmout)) {
                Ok(()) => {
                    if let Some(req) = self.0 .0.borrow_mut().pending.get_mut(&id) {
                        req.tcp_sent = true;
                    }
                }
                Err(e) => {
                    log::warn!("dns client: TCP send failed for id {id}: {e}");
                    self.0.complete(reactor, id, Err(e));
                }
            }
        }
    }
}

impl<W: 'static + Default> Service<W> for ServiceHandle<W> {
    fn stop(&mut self, reactor: &mut Reactor<W>) {
        self.0.stop(reactor);
    }

    fn name(&self) -> &str {
        "dns-client"
    }

    fn poll(&mut self, reactor: &mut Reactor<W>) {
        self.poll_udp(reactor);
        self.poll_tcp_disconnect(reactor);
        self.poll_tcp_read(reactor);
        self.poll_tcp_send(reactor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_pkt(answer: Vec<ResourceRecord>) -> PktInfo {
        PktInfo {
            header: Header::query(7),
            questions: vec![Question {
                qname: "example.com".to_string(),
                qtype: RrType::A.to_u16(),
                qclass: RrClass::IN.0,
            }],
            answer,
            authority: Vec::new(),
            additional: Vec::new(),
            edns: None,
        }
    }

    fn a_rr(addr: Ipv4Addr, ttl: u32) -> ResourceRecord {
        ResourceRecord {
            name: "example.com".to_string(),
            rrtype: RrType::A.to_u16(),
            rrclass: RrClass::IN.0,
            ttl,
            rdata: RData::A(addr),
        }
    }

    #[test]
    fn brief_picks_first_matching_type() {
        let pkt = sample_pkt(vec![a_rr(Ipv4Addr::new(93, 184, 216, 34), 300)]);
        let answer = build_answer(&pkt, Some(RrType::A.to_u16())).unwrap();
        match answer {
            Answer::Brief(rr) => {
                assert_eq!(rr.ttl, 300);
                assert!(matches!(rr.rdata, RData::A(a) if a == Ipv4Addr::new(93, 184, 216, 34)));
            }
            Answer::Full(_) => panic!("expected a brief answer"),
        }
    }

    #[test]
    fn brief_any_prefers_address_record() {
        let mx = ResourceRecord {
            name: "example.com".to_string(),
            rrtype: RrType::Mx.to_u16(),
            rrclass: RrClass::IN.0,
            ttl: 60,
            rdata: RData::Mx {
                preference: 10,
                exchange: "mail.example.com".to_string(),
            },
        };
        let a = a_rr(Ipv4Addr::new(1, 2, 3, 4), 60);
        let pkt = sample_pkt(vec![mx, a]);
        let answer = build_answer(&pkt, Some(QTYPE_ANY)).unwrap();
        assert!(matches!(answer, Answer::Brief(rr) if rr.rrtype == RrType::A.to_u16()));
    }

    #[test]
    fn brief_missing_type_is_no_entry() {
        let pkt = sample_pkt(Vec::new());
        let err = build_answer(&pkt, Some(RrType::A.to_u16())).unwrap_err();
        assert!(matches!(err, Error::NoEnt));
    }

    #[test]
    fn full_answer_keeps_whole_packet() {
        let pkt = sample_pkt(vec![a_rr(Ipv4Addr::new(1, 1, 1, 1), 10)]);
        let answer = build_answer(&pkt, None).unwrap();
        assert!(matches!(answer, Answer::Full(p) if p.answer.len() == 1));
    }

    #[test]
    fn cookie_key_seeding_is_nonzero() {
        assert_ne!(seed_cookie_key(), [0u8; 16]);
    }

    #[test]
    fn udp_reply_from_wrong_peer_is_dropped() {
        let mut reactor: Reactor<()> = Reactor::open().unwrap();
        let server = Skad::inet4(Ipv4Addr::new(127, 0, 0, 1), 5300);
        let client = DnsClient::start(
            &mut reactor,
            server,
            None,
            Duration::from_millis(100),
            Duration::from_millis(100),
            1,
        )
        .unwrap();

        let got: Rc<RefCell<Option<Result<Answer>>>> = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        client
            .resolve(
                &mut reactor,
                "example.com",
                RrType::A.to_u16(),
                ResolveFlags::empty(),
                move |res| *got2.borrow_mut() = Some(res),
            )
            .unwrap();

        let pkt = sample_pkt(vec![a_rr(Ipv4Addr::new(9, 9, 9, 9), 60)]);
        let spoofed_peer = Skad::inet4(Ipv4Addr::new(10, 0, 0, 1), 5300);
        client.handle_reply(&mut reactor, pkt, Some(&spoofed_peer));

        assert!(
            got.borrow().is_none(),
            "a reply from an address other than the configured server must be dropped, not completed"
        );
        reactor.close();
    }
}
