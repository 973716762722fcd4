//! Configuration for the tunnel server
//!
//! Values are looked up by dotted key (`AgentTunnels.ListenPort`) through a
//! [`ConfigProvider`], so tests can hand in a mock or a plain map and the
//! daemon can layer environment variables over a YAML file.
//!
//! [`TunnelConfig::load`] turns the raw strings into a typed config, filling
//! in defaults for anything that is not set.

use std::collections::HashMap;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;
use crate::Result;

/// Well-known configuration keys
pub mod keys {
    /// Listener bind address
    pub const LISTEN_ADDRESS: &str = "AgentTunnels.ListenAddress";
    /// Listener port
    pub const LISTEN_PORT: &str = "AgentTunnels.ListenPort";
    /// Seconds an unbound tunnel may idle before the timeout action runs
    pub const UNBOUND_TUNNEL_TIMEOUT: &str = "AgentTunnels.UnboundTunnelTimeout";
    /// Action taken on idle unbound tunnels
    pub const UNBOUND_TUNNEL_TIMEOUT_ACTION: &str = "AgentTunnels.UnboundTunnelTimeoutAction";
    /// Container name that auto-created nodes are attached to
    pub const NEW_NODES_CONTAINER: &str = "AgentTunnels.NewNodesContainer";
    /// TLS handshake timeout in seconds
    pub const HANDSHAKE_TIMEOUT: &str = "AgentTunnels.HandshakeTimeout";
    /// Seconds without any frame before the tunnel is dropped
    pub const READ_TIMEOUT: &str = "AgentTunnels.ReadTimeout";
    /// Seconds to wait for a control response
    pub const REQUEST_TIMEOUT: &str = "AgentTunnels.RequestTimeout";
    /// Maximum frame size in bytes
    pub const MAX_MESSAGE_SIZE: &str = "AgentTunnels.MaxMessageSize";
    /// Per-channel receive buffer high-water mark in bytes
    pub const CHANNEL_BUFFER_SIZE: &str = "AgentTunnels.ChannelBufferSize";
    /// Concurrent TLS handshakes
    pub const MAX_CONCURRENT_HANDSHAKES: &str = "AgentTunnels.MaxConcurrentHandshakes";
    /// Unbound tunnel check cadence in seconds
    pub const UNBOUND_CHECK_INTERVAL: &str = "AgentTunnels.UnboundCheckInterval";
    /// Certificate renewal check cadence in seconds
    pub const CERTIFICATE_RENEWAL_INTERVAL: &str = "AgentTunnels.CertificateRenewalInterval";
    /// Country attribute for issued agent certificates
    pub const CERTIFICATE_COUNTRY: &str = "AgentTunnels.Certificates.Country";
    /// Organization attribute for issued agent certificates
    pub const CERTIFICATE_ORGANIZATION: &str = "AgentTunnels.Certificates.Organization";
    /// Admin HTTP listen address
    pub const ADMIN_ADDRESS: &str = "AgentTunnels.AdminAddress";
    /// Server id sent to agents on bind
    pub const SERVER_ID: &str = "Server.Id";
}

/// Default listener port
pub const DEFAULT_LISTEN_PORT: u16 = 4703;

/// Default admin HTTP port
pub const DEFAULT_ADMIN_PORT: u16 = 4704;

/// Source of raw configuration values
#[cfg_attr(test, mockall::automock)]
pub trait ConfigProvider: Send + Sync {
    /// Look up a value by dotted key
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads configuration from environment variables
///
/// `AgentTunnels.ListenPort` is read from `AGENTTUNNELS_LISTENPORT`:
/// each dotted segment is upper-cased and the segments are joined with `_`.
#[derive(Clone, Default)]
pub struct EnvConfig;

impl EnvConfig {
    /// Environment variable name for a key
    pub fn var_name(key: &str) -> String {
        key.split('.')
            .map(|part| part.to_ascii_uppercase())
            .collect::<Vec<_>>()
            .join("_")
    }
}

impl ConfigProvider for EnvConfig {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(Self::var_name(key)).ok()
    }
}

/// In-memory configuration, optionally loaded from YAML
///
/// Keys are matched case-insensitively. Nested YAML mappings are flattened
/// into dotted keys, so both of these set `AgentTunnels.ListenPort`:
///
/// ```yaml
/// AgentTunnels.ListenPort: 4703
/// AgentTunnels:
///   ListenPort: 4703
/// ```
#[derive(Clone, Debug, Default)]
pub struct MapConfig {
    values: HashMap<String, String>,
}

impl MapConfig {
    /// Empty config
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert or replace a value
    pub fn insert(&mut self, key: &str, value: impl ToString) {
        self.values
            .insert(key.to_ascii_lowercase(), value.to_string());
    }

    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let doc: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config("<yaml>", format!("invalid YAML: {}", e)))?;
        let mut config = Self::new();
        match doc {
            serde_yaml::Value::Null => {}
            serde_yaml::Value::Mapping(map) => config.flatten("", &map)?,
            _ => {
                return Err(Error::config(
                    "<yaml>",
                    "top level of the configuration must be a mapping",
                ))
            }
        }
        Ok(config)
    }

    /// Load a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::config(path.display().to_string(), format!("cannot read: {}", e))
        })?;
        Self::from_yaml_str(&text)
    }

    fn flatten(&mut self, prefix: &str, map: &serde_yaml::Mapping) -> Result<()> {
        for (k, v) in map {
            let key = match k {
                serde_yaml::Value::String(s) => s.clone(),
                other => scalar_to_string(other).ok_or_else(|| {
                    Error::config(prefix.to_string(), "mapping keys must be scalars")
                })?,
            };
            let full = if prefix.is_empty() {
                key
            } else {
                format!("{}.{}", prefix, key)
            };
            match v {
                serde_yaml::Value::Mapping(nested) => self.flatten(&full, nested)?,
                serde_yaml::Value::Null => {}
                scalar => {
                    let value = scalar_to_string(scalar).ok_or_else(|| {
                        Error::config(full.clone(), "value must be a scalar")
                    })?;
                    self.insert(&full, value);
                }
            }
        }
        Ok(())
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl ConfigProvider for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(&key.to_ascii_lowercase()).cloned()
    }
}

/// First provider that has a key wins
#[derive(Default)]
pub struct LayeredConfig {
    layers: Vec<Box<dyn ConfigProvider>>,
}

impl LayeredConfig {
    /// Empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer with lower priority than the ones already added
    pub fn layer(mut self, provider: impl ConfigProvider + 'static) -> Self {
        self.layers.push(Box::new(provider));
        self
    }
}

impl ConfigProvider for LayeredConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.layers.iter().find_map(|layer| layer.get(key))
    }
}

/// What to do with an unbound tunnel that has been idle past its timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnboundTunnelAction {
    /// Close the tunnel
    Reset,
    /// Post `tunnel.unbound` and restart the idle clock
    GenerateEvent,
    /// Bind to a uniquely matching existing node
    BindToExistingNode,
    /// Bind to a uniquely matching node, creating one when none matches
    BindOrCreateNode,
}

impl UnboundTunnelAction {
    /// Config spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::GenerateEvent => "event",
            Self::BindToExistingNode => "bind",
            Self::BindOrCreateNode => "bindOrCreate",
        }
    }
}

impl FromStr for UnboundTunnelAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reset" | "0" => Ok(Self::Reset),
            "event" | "1" => Ok(Self::GenerateEvent),
            "bind" | "2" => Ok(Self::BindToExistingNode),
            "bindorcreate" | "3" => Ok(Self::BindOrCreateNode),
            other => Err(format!(
                "unknown action '{}', expected reset, event, bind or bindOrCreate",
                other
            )),
        }
    }
}

/// Typed tunnel server configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Listener address
    pub listen_addr: SocketAddr,
    /// Idle timeout for unbound tunnels; `None` disables unbound processing
    pub unbound_tunnel_timeout: Option<Duration>,
    /// Action for idle unbound tunnels
    pub unbound_tunnel_action: UnboundTunnelAction,
    /// Container for auto-created nodes
    pub new_nodes_container: Option<String>,
    /// TLS handshake deadline
    pub handshake_timeout: Duration,
    /// Maximum silence on a tunnel
    pub read_timeout: Duration,
    /// Control request response deadline
    pub request_timeout: Duration,
    /// Maximum frame size
    pub max_message_size: usize,
    /// Per-channel receive high-water mark
    pub channel_buffer_size: usize,
    /// Handshake worker pool size
    pub max_concurrent_handshakes: usize,
    /// Unbound tunnel check cadence
    pub unbound_check_interval: Duration,
    /// Certificate renewal check cadence
    pub certificate_renewal_interval: Duration,
    /// Country attribute for issued certificates
    pub certificate_country: Option<String>,
    /// Organization attribute for issued certificates
    pub certificate_organization: Option<String>,
    /// Admin HTTP address
    pub admin_addr: SocketAddr,
    /// Server id sent on bind
    pub server_id: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_LISTEN_PORT),
            unbound_tunnel_timeout: Some(Duration::from_secs(3600)),
            unbound_tunnel_action: UnboundTunnelAction::Reset,
            new_nodes_container: None,
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            max_message_size: tunnelmux_proto::DEFAULT_MAX_FRAME_SIZE,
            channel_buffer_size: 1024 * 1024,
            max_concurrent_handshakes: 64,
            unbound_check_interval: Duration::from_secs(60),
            certificate_renewal_interval: Duration::from_secs(86400),
            certificate_country: None,
            certificate_organization: None,
            admin_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_ADMIN_PORT),
            server_id: 0,
        }
    }
}

impl TunnelConfig {
    /// Build the typed config from a provider
    pub fn load(provider: &dyn ConfigProvider) -> Result<Self> {
        let defaults = Self::default();

        let listen_ip: IpAddr = parse_or(provider, keys::LISTEN_ADDRESS, defaults.listen_addr.ip())?;
        let listen_port: u16 = parse_or(provider, keys::LISTEN_PORT, DEFAULT_LISTEN_PORT)?;

        let unbound_secs: i64 = parse_or(provider, keys::UNBOUND_TUNNEL_TIMEOUT, 3600)?;
        let unbound_tunnel_timeout =
            (unbound_secs >= 0).then(|| Duration::from_secs(unbound_secs as u64));

        Ok(Self {
            listen_addr: SocketAddr::new(listen_ip, listen_port),
            unbound_tunnel_timeout,
            unbound_tunnel_action: parse_or(
                provider,
                keys::UNBOUND_TUNNEL_TIMEOUT_ACTION,
                defaults.unbound_tunnel_action,
            )?,
            new_nodes_container: non_empty(provider, keys::NEW_NODES_CONTAINER),
            handshake_timeout: secs_or(provider, keys::HANDSHAKE_TIMEOUT, defaults.handshake_timeout)?,
            read_timeout: secs_or(provider, keys::READ_TIMEOUT, defaults.read_timeout)?,
            request_timeout: secs_or(provider, keys::REQUEST_TIMEOUT, defaults.request_timeout)?,
            max_message_size: positive_or(provider, keys::MAX_MESSAGE_SIZE, defaults.max_message_size)?,
            channel_buffer_size: positive_or(
                provider,
                keys::CHANNEL_BUFFER_SIZE,
                defaults.channel_buffer_size,
            )?,
            max_concurrent_handshakes: positive_or(
                provider,
                keys::MAX_CONCURRENT_HANDSHAKES,
                defaults.max_concurrent_handshakes,
            )?,
            unbound_check_interval: secs_or(
                provider,
                keys::UNBOUND_CHECK_INTERVAL,
                defaults.unbound_check_interval,
            )?,
            certificate_renewal_interval: secs_or(
                provider,
                keys::CERTIFICATE_RENEWAL_INTERVAL,
                defaults.certificate_renewal_interval,
            )?,
            certificate_country: non_empty(provider, keys::CERTIFICATE_COUNTRY),
            certificate_organization: non_empty(provider, keys::CERTIFICATE_ORGANIZATION),
            admin_addr: parse_or(provider, keys::ADMIN_ADDRESS, defaults.admin_addr)?,
            server_id: parse_or(provider, keys::SERVER_ID, defaults.server_id)?,
        })
    }
}

fn parse_or<T>(provider: &dyn ConfigProvider, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match provider.get(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(key, format!("invalid value '{}': {}", raw, e))),
        _ => Ok(default),
    }
}

fn secs_or(provider: &dyn ConfigProvider, key: &str, default: Duration) -> Result<Duration> {
    let secs: u64 = parse_or(provider, key, default.as_secs())?;
    if secs == 0 {
        return Err(Error::config(key, "must be at least 1 second"));
    }
    Ok(Duration::from_secs(secs))
}

fn positive_or(provider: &dyn ConfigProvider, key: &str, default: usize) -> Result<usize> {
    let value: usize = parse_or(provider, key, default)?;
    if value == 0 {
        return Err(Error::config(key, "must be greater than zero"));
    }
    Ok(value)
}

fn non_empty(provider: &dyn ConfigProvider, key: &str) -> Option<String> {
    provider
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
