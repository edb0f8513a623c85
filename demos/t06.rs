//! Reference runner for the multi-reactor accept-dispatch pattern (§6.3): a
//! master reactor binds one or two TCP listeners (plus an optional UNIX
//! socket) and round-robins every accepted connection across `-t N` worker
//! reactors, each running on its own OS thread and reached over a QX
//! side-channel (§6.2).
//!
//! No CLI framework: manual `std::env::args()` parsing, the same style the
//! rest of this crate's examples use.

use std::cell::RefCell;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::os::fd::{OwnedFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use hio::device::socket::{BindOpts, SockType, SocketDevice};
use hio::device::Capability;
use hio::net::{self, AcceptDispatch, Dispatcher, QxWorker};
use hio::reactor::StopReason;
use hio::skad::Skad;
use hio::sys::unix::qx;
use hio::Reactor;

const PORT: u16 = 9987;
const UNIX_SOCK_PATH: &str = "/tmp/t06.sck";

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signum: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

/// One of the three listen-socket families §6.3 lets `-s`/`-ss` pick between.
#[derive(Debug, Clone, Copy)]
enum ListenKind {
    Tcp,
    SctpStream,
    SctpSeqpacket,
}

impl ListenKind {
    fn sock_type(self, ipv6: bool) -> SockType {
        match (self, ipv6) {
            (ListenKind::Tcp, false) => SockType::Tcp4,
            (ListenKind::Tcp, true) => SockType::Tcp6,
            (ListenKind::SctpStream, false) => SockType::Sctp4,
            (ListenKind::SctpStream, true) => SockType::Sctp6,
            (ListenKind::SctpSeqpacket, false) => SockType::Sctp4Sp,
            (ListenKind::SctpSeqpacket, true) => SockType::Sctp6Sp,
        }
    }
}

struct Args {
    kind: ListenKind,
    workers: u32,
}

fn parse_args() -> Result<Args, String> {
    let mut kind = ListenKind::Tcp;
    let mut workers = 2u32;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-ss" => kind = ListenKind::SctpSeqpacket,
            "-s" => kind = ListenKind::SctpStream,
            "-t" => {
                let n = args
                    .next()
                    .ok_or_else(|| "-t requires a thread count".to_string())?;
                workers = n.parse::<u32>().map_err(|_| format!("invalid thread count: {n}"))?;
                if !(1..=256).contains(&workers) {
                    return Err(format!("thread count must be 1..=256, got {workers}"));
                }
            }
            other => return Err(format!("unrecognized argument: {other}")),
        }
    }
    Ok(Args { kind, workers })
}

/// Build the local child device for a connection handed over the QX
/// side-channel (§6.2): same shape as [`net::accept_child`], minus the
/// listener-lookup step since the worker never saw the listener itself.
fn on_new_conn(reactor: &mut Reactor<()>, ty: SockType, fd: RawFd, peer: Skad) {
    let mut child: SocketDevice<()> = SocketDevice::from_accepted_fd(ty, fd, None, peer.clone());
    child.set_on_read(move |data, _src| {
        log::trace!("t06: {} bytes from {peer}", data.len());
    });
    if let Err(e) = reactor.make_device(Box::new(child), Capability::IN) {
        log::warn!("t06: failed to register dispatched connection: {e}");
    }
}

fn run_worker(worker_half: OwnedFd) {
    let mut reactor: Reactor<()> = match Reactor::open() {
        Ok(r) => r,
        Err(e) => {
            log::error!("t06 worker: failed to open reactor: {e}");
            return;
        }
    };
    if let Err(e) = QxWorker::install(&mut reactor, worker_half, on_new_conn) {
        log::error!("t06 worker: failed to install QX side channel: {e}");
        return;
    }
    run_until_stopped(&mut reactor);
    reactor.close();
}

fn run_until_stopped<W: 'static>(reactor: &mut Reactor<W>) {
    loop {
        if STOP.load(Ordering::Relaxed) {
            reactor.request_stop(StopReason::Termination);
        }
        match reactor.run_once() {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                log::error!("t06: reactor iteration failed: {e}");
                break;
            }
        }
    }
}

/// Bind `kind`'s socket type on both `[::]:9987` and `0.0.0.0:9987`,
/// requiring at least one to succeed (§6.3).
fn bind_listeners(
    reactor: &mut Reactor<()>,
    kind: ListenKind,
    dispatcher: Rc<RefCell<Dispatcher<()>>>,
) -> Result<(), String> {
    let opts = BindOpts {
        reuseaddr: true,
        v6only: true,
        ..BindOpts::default()
    };

    let v6 = net::listen(
        reactor,
        kind.sock_type(true),
        &Skad::inet6(Ipv6Addr::UNSPECIFIED, PORT, 0),
        128,
        &opts,
    );
    let v4 = net::listen(
        reactor,
        kind.sock_type(false),
        &Skad::inet4(Ipv4Addr::UNSPECIFIED, PORT),
        128,
        &opts,
    );

    let mut bound_any = false;
    for (result, family, ty) in [
        (v6, "[::]:9987", kind.sock_type(true)),
        (v4, "0.0.0.0:9987", kind.sock_type(false)),
    ] {
        match result {
            Ok(idx) => {
                bound_any = true;
                install_dispatch(reactor, idx, ty, dispatcher.clone());
            }
            Err(e) => log::warn!("t06: failed to bind {family}: {e}"),
        }
    }

    if !bound_any {
        return Err("failed to bind either TCP listener".to_string());
    }

    let unix_addr = Skad::unix(PathBuf::from(UNIX_SOCK_PATH));
    match net::listen(reactor, SockType::Unix, &unix_addr, 128, &BindOpts::default()) {
        Ok(idx) => install_dispatch(reactor, idx, SockType::Unix, dispatcher),
        Err(e) => log::warn!("t06: failed to bind UNIX socket {UNIX_SOCK_PATH}: {e} (ignored)"),
    }

    Ok(())
}

fn install_dispatch(
    reactor: &mut Reactor<()>,
    listener: hio::device::DeviceIdx,
    ty: SockType,
    dispatcher: Rc<RefCell<Dispatcher<()>>>,
) {
    let result = AcceptDispatch::install(reactor, listener, move |reactor, _listener, fd, peer| {
        dispatcher.borrow_mut().dispatch(reactor, ty, fd, peer);
    });
    if let Err(e) = result {
        log::warn!("t06: failed to install accept dispatcher: {e}");
    }
}

fn main() {
    env_logger::init();

    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("t06: {e}");
            std::process::exit(-1);
        }
    };

    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        libc::signal(libc::SIGINT, on_sigint as usize);
    }

    let mut worker_halves = Vec::with_capacity(args.workers as usize);
    let mut worker_devices = Vec::with_capacity(args.workers as usize);
    let mut master: Reactor<()> = match Reactor::open() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("t06: failed to open master reactor: {e}");
            std::process::exit(-1);
        }
    };

    for _ in 0..args.workers {
        let (master_half, worker_half) = match qx::pair() {
            Ok(pair) => pair,
            Err(e) => {
                eprintln!("t06: failed to create QX side channel: {e}");
                std::process::exit(-1);
            }
        };
        let dev: SocketDevice<()> = SocketDevice::from_owned_fd(SockType::Qx, master_half);
        match master.make_device(Box::new(dev), Capability::IN) {
            Ok(idx) => worker_devices.push(idx),
            Err(e) => {
                eprintln!("t06: failed to register worker side channel: {e}");
                std::process::exit(-1);
            }
        }
        worker_halves.push(worker_half);
    }

    let dispatcher = Rc::new(RefCell::new(Dispatcher::new(worker_devices)));
    if let Err(e) = bind_listeners(&mut master, args.kind, dispatcher) {
        eprintln!("t06: {e}");
        std::process::exit(-1);
    }

    let handles: Vec<JoinHandle<()>> = worker_halves
        .into_iter()
        .map(|half| std::thread::spawn(move || run_worker(half)))
        .collect();

    run_until_stopped(&mut master);
    master.close();

    for handle in handles {
        let _ = handle.join();
    }

    // Give any last log lines a moment to flush before the process exits.
    std::thread::sleep(Duration::from_millis(1));
    std::process::exit(0);
}
