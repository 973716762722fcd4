//! Metrics for tunnel server observability
//!
//! Provides OpenTelemetry metrics for:
//! - Tunnel counts by state
//! - Certificate issuance
//! - Dropped channel data and failed handshakes

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("tunnelmux"));

// ============================================================================
// Tunnel Metrics
// ============================================================================

/// Gauge of registered tunnels by state
///
/// Labels:
/// - `state`: bound, unbound
pub static TUNNELS: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("tunnelmux_tunnels")
        .with_description("Number of registered agent tunnels by state")
        .with_unit("{tunnels}")
        .build()
});

/// Counter of CHANNEL_DATA frames addressed to channels that do not exist
pub static CHANNEL_DATA_DROPPED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("tunnelmux_channel_data_dropped_total")
        .with_description("Channel data frames dropped because the channel is unknown")
        .with_unit("{frames}")
        .build()
});

/// Counter of failed TLS handshakes
pub static HANDSHAKE_FAILURES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("tunnelmux_handshake_failures_total")
        .with_description("Total number of failed agent TLS handshakes")
        .with_unit("{handshakes}")
        .build()
});

// ============================================================================
// Certificate Metrics
// ============================================================================

/// Counter of agent certificates issued
///
/// Labels:
/// - `reason`: bind, renew
pub static CERTIFICATES_ISSUED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("tunnelmux_certificates_issued_total")
        .with_description("Total number of agent certificates issued")
        .with_unit("{certificates}")
        .build()
});

// ============================================================================
// Helper Types
// ============================================================================

/// Labels for tunnel state gauge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStateLabel {
    /// Tunnel is bound to a node
    Bound,
    /// Tunnel is connected but not bound
    Unbound,
}

impl TunnelStateLabel {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bound => "bound",
            Self::Unbound => "unbound",
        }
    }
}

/// Why a certificate was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueReason {
    /// Tunnel was bound to a node
    Bind,
    /// Bound tunnel's certificate was renewed
    Renew,
}

impl IssueReason {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bind => "bind",
            Self::Renew => "renew",
        }
    }
}

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Update tunnel state gauge
pub fn set_tunnel_count(state: TunnelStateLabel, count: i64) {
    TUNNELS.record(count, &[KeyValue::new("state", state.as_str())]);
}

/// Record a dropped CHANNEL_DATA frame
pub fn record_channel_data_dropped() {
    CHANNEL_DATA_DROPPED.add(1, &[]);
}

/// Record a failed handshake
pub fn record_handshake_failure() {
    HANDSHAKE_FAILURES.add(1, &[]);
}

/// Record an issued certificate
pub fn record_certificate_issued(reason: IssueReason) {
    CERTIFICATES_ISSUED.add(1, &[KeyValue::new("reason", reason.as_str())]);
}
