//! Common types for the agent tunnel multiplexer: errors, configuration and telemetry

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

use std::time::Duration;

pub use config::{ConfigProvider, EnvConfig, LayeredConfig, MapConfig, TunnelConfig, UnboundTunnelAction};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Certificates expiring within this window are renewed
pub const CERT_RENEWAL_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Install the process-wide rustls crypto provider
///
/// Safe to call more than once; later calls are ignored.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
