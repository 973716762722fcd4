//! Tunnel events and certificate audit records
//!
//! Both sinks are fire-and-forget: `post()` and `record()` never fail and
//! never block the caller on I/O. A sink that forwards somewhere remote is
//! expected to queue internally.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::tunnel::TunnelInfo;

/// Event name for a tunnel that finished setup as bound
pub const EVENT_TUNNEL_OPEN: &str = "tunnel.open";
/// Event name for a bound tunnel that shut down
pub const EVENT_TUNNEL_CLOSED: &str = "tunnel.closed";
/// Event name for an unbound tunnel past its idle timeout
pub const EVENT_TUNNEL_UNBOUND: &str = "tunnel.unbound";
/// Event name for an agent GUID that differs from the node's recorded one
pub const EVENT_AGENT_ID_MISMATCH: &str = "tunnel.agentIdMismatch";

/// What happened to a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TunnelEventKind {
    /// Bound tunnel finished setup
    Open,
    /// Bound tunnel shut down
    Closed,
    /// Unbound tunnel reached its idle timeout
    Unbound,
    /// Node's recorded agent GUID differs from the one the agent advertised
    AgentIdMismatch {
        /// Agent GUID recorded on the node
        node_agent_id: Uuid,
        /// Agent GUID advertised in SETUP
        tunnel_agent_id: Uuid,
    },
}

impl TunnelEventKind {
    /// Event name as posted to the event sink
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => EVENT_TUNNEL_OPEN,
            Self::Closed => EVENT_TUNNEL_CLOSED,
            Self::Unbound => EVENT_TUNNEL_UNBOUND,
            Self::AgentIdMismatch { .. } => EVENT_AGENT_ID_MISMATCH,
        }
    }
}

/// A named event with the tunnel's attributes at the time it was posted
#[derive(Debug, Clone, Serialize)]
pub struct TunnelEvent {
    /// What happened
    pub kind: TunnelEventKind,
    /// Tunnel attributes
    pub tunnel: TunnelInfo,
}

impl TunnelEvent {
    /// Create an event
    pub fn new(kind: TunnelEventKind, tunnel: TunnelInfo) -> Self {
        Self { kind, tunnel }
    }

    /// Event name
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Destination for tunnel events
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    /// Post an event
    fn post(&self, event: TunnelEvent);
}

/// Event sink that writes events to the log
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn post(&self, event: TunnelEvent) {
        let t = &event.tunnel;
        match &event.kind {
            TunnelEventKind::AgentIdMismatch {
                node_agent_id,
                tunnel_agent_id,
            } => warn!(
                event = event.name(),
                tunnel_id = t.id,
                node_id = t.node_id,
                %node_agent_id,
                %tunnel_agent_id,
                "Agent ID mismatch"
            ),
            _ => info!(
                event = event.name(),
                tunnel_id = t.id,
                node_id = t.node_id,
                peer = %t.peer_address,
                system_name = %t.system_name,
                hostname = %t.hostname,
                agent_version = %t.agent_version,
                agent_id = %t.agent_id,
                zone_uin = t.zone_uin,
                "Tunnel event"
            ),
        }
    }
}

/// Event sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<TunnelEvent>>,
}

impl RecordingEventSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of posted events in posting order
    pub fn events(&self) -> Vec<TunnelEvent> {
        self.events.lock().clone()
    }

    /// Number of posted events with the given name
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    /// Posted events with the given name for one tunnel
    pub fn for_tunnel(&self, name: &str, tunnel_id: u32) -> Vec<TunnelEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name() == name && e.tunnel.id == tunnel_id)
            .cloned()
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn post(&self, event: TunnelEvent) {
        self.events.lock().push(event);
    }
}

// ============================================================================
// Audit
// ============================================================================

/// Certificate action recorded in the audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    /// An agent certificate was issued (bind or renewal)
    IssueCertificate,
    /// A node's tunnel binding was revoked
    RevokeBinding,
}

impl AuditAction {
    /// Action name as written to the audit log
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IssueCertificate => "ISSUE_CERTIFICATE",
            Self::RevokeBinding => "REVOKE_BINDING",
        }
    }
}

/// One audit log entry
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    /// What was done
    pub action: AuditAction,
    /// User that initiated the action; 0 for the system
    pub user_id: u32,
    /// Node the action applies to
    pub node_id: u32,
    /// Human-readable detail
    pub message: String,
    /// When the action happened
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    /// Record timestamped now
    pub fn new(action: AuditAction, user_id: u32, node_id: u32, message: impl Into<String>) -> Self {
        Self {
            action,
            user_id,
            node_id,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Destination for audit records
#[cfg_attr(test, mockall::automock)]
pub trait AuditLog: Send + Sync {
    /// Record an action
    fn record(&self, record: AuditRecord);
}

/// Audit log that writes records to the log
#[derive(Debug, Default)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn record(&self, record: AuditRecord) {
        info!(
            audit = record.action.as_str(),
            user_id = record.user_id,
            node_id = record.node_id,
            timestamp = %record.timestamp.to_rfc3339(),
            "{}",
            record.message
        );
    }
}

/// Audit log that keeps every record in memory
#[derive(Debug, Default)]
pub struct RecordingAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl RecordingAuditLog {
    /// Empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of records in recording order
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }
}

impl AuditLog for RecordingAuditLog {
    fn record(&self, record: AuditRecord) {
        self.records.lock().push(record);
    }
}
