//! The proxy registry: remote actors as local handles.
//!
//! Each known remote actor is represented by exactly one live proxy
//! cell whose enqueue forwards into the BASP instance. The registry
//! holds weak references only: once every local strong handle is gone,
//! the proxy dies on its own and a later lookup re-creates it. Killing
//! a proxy (on `kill_proxy` or peer loss) terminates it like any other
//! actor, which is what delivers DOWN/EXIT to local observers.

use std::sync::{Arc, Weak};

use rustc_hash::FxHashMap;

use crate::actor::cell::{ActorCell, ActorId, ActorRef, ExitReason};
use crate::actor::link;
use crate::message::Envelope;
use crate::node::NodeId;
use crate::system::SystemCore;

/// Registry of proxies for one BASP instance.
#[derive(Default)]
pub struct ProxyRegistry {
    entries: FxHashMap<(NodeId, ActorId), Weak<ActorCell>>,
}

impl ProxyRegistry {
    pub fn new() -> ProxyRegistry {
        ProxyRegistry { entries: FxHashMap::default() }
    }

    /// The live proxy for `(node, id)`, if any.
    pub fn get(&self, node: NodeId, id: ActorId) -> Option<ActorRef> {
        self.entries
            .get(&(node, id))
            .and_then(Weak::upgrade)
            .map(ActorRef::from_cell)
    }

    /// Return the existing live proxy or create one whose enqueues run
    /// `forward`. The boolean reports whether a proxy was created (the
    /// caller then announces it to the origin node).
    pub fn get_or_create(
        &mut self,
        system: &Arc<SystemCore>,
        node: NodeId,
        id: ActorId,
        forward: impl Fn(Envelope) + Send + Sync + 'static,
    ) -> (ActorRef, bool) {
        if let Some(existing) = self.get(node, id) {
            return (existing, false);
        }
        let proxy = system.spawn_proxy(node, id, Box::new(forward));
        self.entries
            .insert((node, id), Arc::downgrade(proxy.cell()));
        (proxy, true)
    }

    /// Terminate and forget one proxy. Returns whether a live proxy was
    /// found.
    pub fn erase(&mut self, node: NodeId, id: ActorId, reason: ExitReason) -> bool {
        match self.entries.remove(&(node, id)) {
            Some(weak) => match weak.upgrade() {
                Some(cell) => {
                    link::terminate(&cell, reason);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    /// Terminate every proxy of `node` (peer loss). Returns how many
    /// live proxies were killed.
    pub fn erase_node(&mut self, node: NodeId, reason: ExitReason) -> usize {
        let keys: Vec<(NodeId, ActorId)> = self
            .entries
            .keys()
            .filter(|(n, _)| *n == node)
            .copied()
            .collect();
        let mut killed = 0;
        for key in keys {
            if let Some(cell) = self.entries.remove(&key).and_then(|w| w.upgrade()) {
                link::terminate(&cell, reason.clone());
                killed += 1;
            }
        }
        killed
    }

    /// Drop entries whose proxies died of refcount attrition.
    pub fn prune(&mut self) {
        self.entries.retain(|_, weak| weak.upgrade().is_some());
    }

    /// Number of tracked entries (live or not yet pruned).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
