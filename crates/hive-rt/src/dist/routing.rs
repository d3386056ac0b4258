//! The BASP routing table: node id to connection or next hop.
//!
//! Direct routes are added on successful handshakes; indirect routes
//! are learned from forwarded traffic. Losing a direct connection
//! invalidates it and, transitively, every indirect route whose next
//! hop became unreachable — the caller turns that node list into
//! `RemoteLinkUnreachable` consequences.

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;

use crate::node::NodeId;

/// Opaque handle the host uses to identify one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// How a node is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct(ConnectionId),
    Indirect(NodeId),
}

/// Node id to route mapping for one BASP instance.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: FxHashMap<NodeId, Route>,
}

impl RoutingTable {
    pub fn new() -> RoutingTable {
        RoutingTable { routes: FxHashMap::default() }
    }

    /// Install (or upgrade to) a direct route.
    pub fn add_direct(&mut self, node: NodeId, conn: ConnectionId) {
        self.routes.insert(node, Route::Direct(conn));
    }

    /// Learn an indirect route; never downgrades an existing direct
    /// route.
    pub fn add_indirect(&mut self, node: NodeId, via: NodeId) {
        if node == via {
            return;
        }
        match self.routes.get(&node) {
            Some(Route::Direct(_)) => {}
            _ => {
                self.routes.insert(node, Route::Indirect(via));
            }
        }
    }

    pub fn route(&self, node: NodeId) -> Option<Route> {
        self.routes.get(&node).copied()
    }

    /// Resolve `node` to the connection carrying its traffic, chasing
    /// next hops. Cycles and dead ends resolve to `None`.
    pub fn lookup(&self, node: NodeId) -> Option<ConnectionId> {
        let mut visited = FxHashSet::default();
        let mut current = node;
        loop {
            if !visited.insert(current) {
                return None;
            }
            match self.routes.get(&current)? {
                Route::Direct(conn) => return Some(*conn),
                Route::Indirect(via) => current = *via,
            }
        }
    }

    pub fn remove(&mut self, node: NodeId) {
        self.routes.remove(&node);
    }

    /// Drop the direct route(s) over `conn` and every route that only
    /// worked through them. Returns all nodes that became unreachable.
    pub fn erase_direct(&mut self, conn: ConnectionId) -> Vec<NodeId> {
        let mut lost: Vec<NodeId> = self
            .routes
            .iter()
            .filter(|(_, route)| matches!(route, Route::Direct(c) if *c == conn))
            .map(|(node, _)| *node)
            .collect();
        for node in &lost {
            self.routes.remove(node);
        }

        // Cascade: indirect routes whose next hop is gone.
        loop {
            let unreachable: Vec<NodeId> = self
                .routes
                .iter()
                .filter(|(_, route)| {
                    matches!(route, Route::Indirect(via) if !self.routes.contains_key(via))
                })
                .map(|(node, _)| *node)
                .collect();
            if unreachable.is_empty() {
                break;
            }
            for node in unreachable {
                self.routes.remove(&node);
                lost.push(node);
            }
        }
        lost
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
