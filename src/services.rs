//! The service registry of §3 ("Service — base `{reactor, stop-fn,
//! prev/next}`..."): reactor-owned protocol services (the DNS client being
//! the only one implemented by this crate; HTTP/FastCGI/DHCP are external
//! collaborators per §1) register themselves here, and `Reactor::close`
//! stops them in reverse registration order (§5, "stopping the reactor
//! stops services in LIFO order").

use crate::reactor::Reactor;

/// A protocol service owned by a reactor. Generic over the same write
/// context `W` as the owning [`Reactor`], since a service's stop path may
/// need to finalize devices it owns (§5 "Services are owned by the reactor
/// through a doubly-linked list").
pub trait Service<W> {
    /// Release this service's resources (sockets, pending requests, timers).
    /// Called at most once, from `Reactor::close` or an explicit `stop`.
    fn stop(&mut self, reactor: &mut Reactor<W>);

    /// A short name for logging (`"dns-client"`, ...).
    fn name(&self) -> &str;

    /// Called once per loop iteration (§4.8 expansion), after timers fire
    /// and halted devices are reaped. A device's own event callbacks never
    /// see `&mut Reactor` (§6.4); a service that needs reactor-level effects
    /// in response to data its device callbacks observed — cancelling a
    /// reply timer, opening a fallback transport, invoking an application
    /// callback — stages that work in its own mailbox and drains it here.
    /// Most services never need this; the default is a no-op.
    fn poll(&mut self, _reactor: &mut Reactor<W>) {}
}

/// The reactor's list of registered services. A `Vec` doubling as the
/// doubly-linked list the original keeps on `hio_t`; iteration order is
/// registration order, and `stop_all` walks it in reverse.
pub struct ServiceList<W> {
    services: Vec<Box<dyn Service<W>>>,
}

impl<W> Default for ServiceList<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> ServiceList<W> {
    pub fn new() -> ServiceList<W> {
        ServiceList {
            services: Vec::new(),
        }
    }

    pub fn register(&mut self, service: Box<dyn Service<W>>) {
        log::debug!("registering service {}", service.name());
        self.services.push(service);
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Stop every registered service in LIFO order, leaving the list empty.
    pub fn stop_all(&mut self, reactor: &mut Reactor<W>) {
        while let Some(mut service) = self.services.pop() {
            log::debug!("stopping service {}", service.name());
            service.stop(reactor);
        }
    }

    /// Poll every registered service once, in registration order (§4.8
    /// expansion).
    pub fn poll_all(&mut self, reactor: &mut Reactor<W>) {
        for service in &mut self.services {
            service.poll(reactor);
        }
    }
}
