//! Shared state handed to every tunnel
//!
//! One `TunnelContext` is built per [`crate::TunnelService`] and shared by
//! the listener, all tunnels and the lifecycle scheduler.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tunnelmux_common::TunnelConfig;
use tunnelmux_pki::CertificateAuthorityBundle;

use crate::events::{AuditLog, EventSink, RecordingAuditLog, RecordingEventSink, TracingAuditLog, TracingEventSink};
use crate::node_store::{InMemoryNodeStore, NodeStore};
use crate::registry::TunnelRegistry;

/// External collaborators the tunnel core talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Node records
    pub nodes: Arc<dyn NodeStore>,
    /// Tunnel event destination
    pub events: Arc<dyn EventSink>,
    /// Certificate audit destination
    pub audit: Arc<dyn AuditLog>,
}

impl Collaborators {
    /// In-memory node store with events and audit records written to the log
    pub fn in_memory() -> Self {
        Self {
            nodes: Arc::new(InMemoryNodeStore::new()),
            events: Arc::new(TracingEventSink),
            audit: Arc::new(TracingAuditLog),
        }
    }

    /// Collaborators whose state can be inspected afterwards
    pub fn recording(
        nodes: Arc<InMemoryNodeStore>,
        events: Arc<RecordingEventSink>,
        audit: Arc<RecordingAuditLog>,
    ) -> Self {
        Self {
            nodes,
            events,
            audit,
        }
    }
}

/// State shared by the listener, tunnels and scheduler
pub struct TunnelContext {
    /// Typed configuration
    pub config: TunnelConfig,
    /// Signing CA plus CAs trusted for validation
    pub ca: CertificateAuthorityBundle,
    /// Node records
    pub nodes: Arc<dyn NodeStore>,
    /// Tunnel event destination
    pub events: Arc<dyn EventSink>,
    /// Certificate audit destination
    pub audit: Arc<dyn AuditLog>,
    /// Bound and unbound tunnels
    pub registry: TunnelRegistry,
    next_tunnel_id: AtomicU32,
}

impl TunnelContext {
    /// Create a context with an empty registry
    pub fn new(config: TunnelConfig, ca: CertificateAuthorityBundle, collaborators: Collaborators) -> Self {
        Self {
            config,
            ca,
            nodes: collaborators.nodes,
            events: collaborators.events,
            audit: collaborators.audit,
            registry: TunnelRegistry::new(),
            next_tunnel_id: AtomicU32::new(1),
        }
    }

    /// Allocate a process-local tunnel id
    pub fn next_tunnel_id(&self) -> u32 {
        self.next_tunnel_id.fetch_add(1, Ordering::Relaxed)
    }
}
