//! Tunnelmux Cell - Agent tunnel server core
//!
//! This crate accepts TLS connections from monitoring agents and carries
//! many logical byte streams plus a control-plane message bus over each one:
//!
//! - **Listener**: TLS handshake and certificate-based node binding
//! - **Tunnel**: Frame reader, request correlation, setup, bind and renew
//! - **Channel**: Backpressured byte stream inside a tunnel
//! - **Registry**: Bound tunnels by node id, unbound tunnels by arrival
//! - **Lifecycle**: Idle unbound tunnel handling and certificate renewal
//! - **Service**: Start/stop wiring plus admin operations and their HTTP routes

pub mod admin;
pub mod channel;
pub mod context;
pub mod correlator;
pub mod events;
pub mod lifecycle;
pub mod listener;
pub mod node_store;
pub mod registry;
pub mod service;
pub mod tunnel;

#[cfg(test)]
mod test_support;

pub use admin::{admin_router, AdminError, BindRequest, UnbindRequest};
pub use channel::{Channel, PollResult};
pub use context::{Collaborators, TunnelContext};
pub use correlator::{DispatchError, RequestCorrelator};
pub use events::{
    AuditAction, AuditLog, AuditRecord, EventSink, RecordingAuditLog, RecordingEventSink,
    TracingAuditLog, TracingEventSink, TunnelEvent, TunnelEventKind, EVENT_AGENT_ID_MISMATCH,
    EVENT_TUNNEL_CLOSED, EVENT_TUNNEL_OPEN, EVENT_TUNNEL_UNBOUND,
};
pub use lifecycle::{matches_node, process_unbound_tunnels, renew_expiring_certificates};
pub use listener::{authorize, TunnelListener};
pub use node_store::{InMemoryNodeStore, LegacyAgentInfo, NewNode, Node, NodeStore, SharedNodeStore};
pub use registry::TunnelRegistry;
pub use service::TunnelService;
pub use tunnel::{Authorization, Tunnel, TunnelInfo, TunnelState};
