//! Cancel-safe frame management (§3, §9 "Deferred cleanup of thread-owned
//! resources"): a polled queue of nodes holding a resource that outlives a
//! device `kill`, most notably a worker thread that has not yet been
//! joined. The reactor drains this list once per loop iteration (§4.8 step
//! 6); it must never block, since that would stall the whole reactor.

/// One deferred-cleanup entry. `is_ready` is polled, never blocked on.
struct Node<R> {
    resource: R,
    is_ready: Box<dyn FnMut(&mut R) -> bool>,
}

/// The CFMB list. Generic over the resource type a given reactor needs to
/// defer-free; `hio`'s reactor instantiates this once for thread handles
/// (§4.5).
pub struct Cfmb<R> {
    nodes: Vec<Node<R>>,
}

impl<R> Default for Cfmb<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Cfmb<R> {
    pub fn new() -> Cfmb<R> {
        Cfmb { nodes: Vec::new() }
    }

    /// Register `resource`, to be freed once `is_ready` reports true.
    pub fn push<F>(&mut self, resource: R, is_ready: F)
    where
        F: FnMut(&mut R) -> bool + 'static,
    {
        self.nodes.push(Node {
            resource,
            is_ready: Box::new(is_ready),
        });
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Walk the list once, unlinking and returning every node whose
    /// predicate now reports ready. The caller is responsible for actually
    /// dropping/joining the returned resources.
    pub fn drain_ready(&mut self) -> Vec<R> {
        let mut ready = Vec::new();
        let mut i = 0;
        while i < self.nodes.len() {
            if (self.nodes[i].is_ready)(&mut self.nodes[i].resource) {
                ready.push(self.nodes.remove(i).resource);
            } else {
                i += 1;
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn ready_nodes_are_unlinked_and_returned() {
        let mut cfmb: Cfmb<u32> = Cfmb::new();
        cfmb.push(1u32, |_| false);
        cfmb.push(2u32, |_| true);
        cfmb.push(3u32, |_| false);

        let ready = cfmb.drain_ready();
        assert_eq!(ready, vec![2]);
        assert_eq!(cfmb.len(), 2);
    }

    #[test]
    fn predicate_can_flip_ready_over_successive_polls() {
        let tries = Rc::new(Cell::new(0));
        let tries2 = tries.clone();
        let mut cfmb: Cfmb<()> = Cfmb::new();
        cfmb.push((), move |_| {
            tries2.set(tries2.get() + 1);
            tries2.get() >= 3
        });

        assert!(cfmb.drain_ready().is_empty());
        assert!(cfmb.drain_ready().is_empty());
        assert_eq!(cfmb.drain_ready().len(), 1);
        assert!(cfmb.is_empty());
    }
}
