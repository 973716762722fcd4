//! Registry of live tunnels
//!
//! Bound tunnels are indexed by node id, at most one per node. Unbound
//! tunnels are kept in a list. All access goes through one lock that is
//! never held across I/O; callers iterate over snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use tunnelmux_common::metrics::{self, TunnelStateLabel};

use crate::tunnel::Tunnel;

#[derive(Default)]
struct Indexes {
    bound: HashMap<u32, Arc<Tunnel>>,
    unbound: Vec<Arc<Tunnel>>,
}

impl Indexes {
    fn publish_counts(&self) {
        metrics::set_tunnel_count(TunnelStateLabel::Bound, self.bound.len() as i64);
        metrics::set_tunnel_count(TunnelStateLabel::Unbound, self.unbound.len() as i64);
    }
}

/// Bound and unbound tunnel indexes
#[derive(Default)]
pub struct TunnelRegistry {
    inner: RwLock<Indexes>,
}

impl TunnelRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tunnel under its node id, or to the unbound list
    ///
    /// A bound tunnel replaces any tunnel already registered for the same
    /// node. The replaced tunnel is returned and left running; it closes on
    /// its own schedule.
    pub fn register(&self, tunnel: Arc<Tunnel>) -> Option<Arc<Tunnel>> {
        let node_id = tunnel.node_id();
        let mut inner = self.inner.write();
        let replaced = if node_id != 0 {
            debug!(tunnel_id = tunnel.id(), node_id, "Registering bound tunnel");
            inner.bound.insert(node_id, tunnel)
        } else {
            debug!(tunnel_id = tunnel.id(), "Registering unbound tunnel");
            if !inner.unbound.iter().any(|t| t.id() == tunnel.id()) {
                inner.unbound.push(tunnel);
            }
            None
        };
        inner.publish_counts();
        replaced
    }

    /// Remove a tunnel if it is still the registered entry
    ///
    /// A newer tunnel registered for the same node is left alone.
    pub fn unregister(&self, tunnel: &Tunnel) {
        let id = tunnel.id();
        let mut inner = self.inner.write();

        let bound_key = inner
            .bound
            .iter()
            .find(|(_, t)| t.id() == id)
            .map(|(node_id, _)| *node_id);
        if let Some(node_id) = bound_key {
            inner.bound.remove(&node_id);
            debug!(tunnel_id = id, node_id, "Unregistered bound tunnel");
        }

        let before = inner.unbound.len();
        inner.unbound.retain(|t| t.id() != id);
        if inner.unbound.len() != before {
            debug!(tunnel_id = id, "Unregistered unbound tunnel");
        }
        inner.publish_counts();
    }

    /// Bound tunnel for a node
    pub fn find_by_node_id(&self, node_id: u32) -> Option<Arc<Tunnel>> {
        self.inner.read().bound.get(&node_id).cloned()
    }

    /// Any registered tunnel by its process-local id
    pub fn find_by_id(&self, tunnel_id: u32) -> Option<Arc<Tunnel>> {
        let inner = self.inner.read();
        inner
            .bound
            .values()
            .chain(inner.unbound.iter())
            .find(|t| t.id() == tunnel_id)
            .cloned()
    }

    /// Snapshot of bound tunnels
    pub fn bound(&self) -> Vec<Arc<Tunnel>> {
        self.inner.read().bound.values().cloned().collect()
    }

    /// Snapshot of unbound tunnels
    pub fn unbound(&self) -> Vec<Arc<Tunnel>> {
        self.inner.read().unbound.clone()
    }

    /// Snapshot of every registered tunnel, bound first, ordered by id
    pub fn all(&self) -> Vec<Arc<Tunnel>> {
        let inner = self.inner.read();
        let mut bound: Vec<Arc<Tunnel>> = inner.bound.values().cloned().collect();
        bound.sort_by_key(|t| t.id());
        let mut unbound = inner.unbound.clone();
        unbound.sort_by_key(|t| t.id());
        bound.extend(unbound);
        bound
    }

    /// Number of registered tunnels
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.bound.len() + inner.unbound.len()
    }

    /// Whether no tunnel is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
