//! Agent tunnel: transport, channel table and control operations
//!
//! One `Tunnel` owns one accepted connection. A single reader task drains
//! frames and dispatches them by message code:
//!
//! | Code | Handling |
//! |------|----------|
//! | KEEPALIVE | echoed with the same id |
//! | SETUP_AGENT_TUNNEL | [`Tunnel`] leaves `Init` |
//! | REQUEST_CERTIFICATE | CSR signed for the pending bind or renewal |
//! | CHANNEL_DATA | appended to the channel's receive buffer |
//! | CLOSE_CHANNEL | channel closed remotely |
//! | anything else | handed to the request correlator |
//!
//! Writes go through one async mutex, so frames from concurrent senders
//! reach the agent whole and in the order the sends completed.
//!
//! When the reader exits for any reason the tunnel shuts down: pending
//! requests fail, every channel is shut down and the tunnel leaves the
//! registry.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use tunnelmux_common::metrics::{self, IssueReason};
use tunnelmux_common::{Error, Result, CERT_RENEWAL_WINDOW};
use tunnelmux_pki::{AgentSubject, IssuedCertificate, PkiError};
use tunnelmux_proto::{rcc, FieldId, FrameCodec, FrameError, Message, MessageCode};

use crate::channel::Channel;
use crate::context::TunnelContext;
use crate::correlator::RequestCorrelator;
use crate::events::{AuditAction, AuditRecord, TunnelEvent, TunnelEventKind};

type FrameReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, FrameCodec>;
type FrameWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, FrameCodec>;

/// Upper bound on flushing a close to an agent that stopped reading
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunnel state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TunnelState {
    /// Waiting for SETUP_AGENT_TUNNEL
    #[default]
    Init,
    /// Not associated with a node
    Unbound,
    /// Bound to a node by a verified certificate
    Bound,
    /// Closed or closing
    ShuttingDown,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Init => "init",
            Self::Unbound => "unbound",
            Self::Bound => "bound",
            Self::ShuttingDown => "shutting down",
        };
        f.write_str(s)
    }
}

/// Outcome of certificate inspection at handshake time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Authorization {
    /// Node the certificate binds to; 0 if unbound
    pub node_id: u32,
    /// Zone UIN of the node
    pub zone_uin: i32,
    /// Tunnel GUID from the certificate CN
    pub guid: Uuid,
    /// Certificate expiration (Unix timestamp); 0 if unknown
    pub cert_expiration: i64,
}

impl Authorization {
    /// Connection without a usable certificate
    pub fn unbound() -> Self {
        Self::default()
    }

    /// Connection whose certificate matches a node's current binding
    pub fn bound(node_id: u32, zone_uin: i32, guid: Uuid, cert_expiration: i64) -> Self {
        Self {
            node_id,
            zone_uin,
            guid,
            cert_expiration,
        }
    }

    /// Whether the connection is pre-authorized for a node
    pub fn is_bound(&self) -> bool {
        self.node_id != 0
    }
}

#[derive(Debug, Clone, Default)]
struct TunnelMetadata {
    guid: Uuid,
    node_id: u32,
    zone_uin: i32,
    hostname: String,
    system_name: String,
    platform_name: String,
    system_info: String,
    agent_version: String,
    agent_build_tag: String,
    agent_id: Uuid,
    hardware_id: Vec<u8>,
    cert_expiration: i64,
    start_time: i64,
    user_agent_installed: bool,
    agent_proxy: bool,
    snmp_proxy: bool,
    snmp_trap_proxy: bool,
}

/// Display attributes of a tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TunnelInfo {
    /// Process-local tunnel id
    pub id: u32,
    /// Tunnel GUID from the certificate; nil if unbound
    pub guid: Uuid,
    /// Current state
    pub state: TunnelState,
    /// Bound node; 0 if unbound
    pub node_id: u32,
    /// Remote address
    pub peer_address: String,
    /// Advertised system name
    pub system_name: String,
    /// Advertised host name
    pub hostname: String,
    /// Advertised platform
    pub platform_name: String,
    /// Advertised system description
    pub system_info: String,
    /// Agent version
    pub agent_version: String,
    /// Agent build tag
    pub agent_build_tag: String,
    /// Agent GUID
    pub agent_id: Uuid,
    /// Hardware id, hex encoded
    pub hardware_id: String,
    /// Zone UIN
    pub zone_uin: i32,
    /// Number of open channels
    pub channel_count: usize,
    /// Certificate expiration (Unix timestamp); 0 if unknown
    pub cert_expiration: i64,
    /// Last entry into Unbound or Bound (Unix timestamp)
    pub start_time: i64,
    /// User support agent present
    pub user_agent_installed: bool,
    /// Agent acts as proxy for other agents
    pub agent_proxy: bool,
    /// Agent acts as SNMP proxy
    pub snmp_proxy: bool,
    /// Agent forwards SNMP traps
    pub snmp_trap_proxy: bool,
}

struct PendingCertificate {
    subject: AgentSubject,
    issued: Option<IssuedCertificate>,
}

/// One agent tunnel
pub struct Tunnel {
    id: u32,
    ctx: Arc<TunnelContext>,
    peer_addr: SocketAddr,
    writer: tokio::sync::Mutex<Option<FrameWriter>>,
    reader: Mutex<Option<FrameReader>>,
    state: Mutex<TunnelState>,
    meta: RwLock<TunnelMetadata>,
    channels: DashMap<u32, Arc<Channel>>,
    pending: RequestCorrelator,
    next_request_id: AtomicU32,
    cancel: CancellationToken,
    open_posted: AtomicBool,
    shut_down: AtomicBool,
    pending_certificate: Mutex<Option<PendingCertificate>>,
    control_lock: tokio::sync::Mutex<()>,
    self_ref: Weak<Tunnel>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("id", &self.id)
            .field("peer", &self.peer_addr)
            .field("state", &self.state())
            .field("node_id", &self.node_id())
            .finish()
    }
}

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn pki_error(e: PkiError) -> Error {
    match e {
        PkiError::InvalidCsr(msg) => Error::invalid_argument(format!("invalid CSR: {}", msg)),
        other => Error::certificate(other.to_string()),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl Tunnel {
    /// Wrap an accepted connection
    ///
    /// The tunnel starts in `Init`. Call [`start`](Self::start) after
    /// registering it.
    pub fn new<S>(ctx: Arc<TunnelContext>, io: S, peer_addr: SocketAddr, auth: Authorization) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (rd, wr) = tokio::io::split(io);
        let codec = FrameCodec::with_max_frame_size(ctx.config.max_message_size);
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(rd);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(wr);
        let id = ctx.next_tunnel_id();

        Arc::new_cyclic(|self_ref| Self {
            id,
            peer_addr,
            writer: tokio::sync::Mutex::new(Some(FramedWrite::new(writer, codec))),
            reader: Mutex::new(Some(FramedRead::new(reader, codec))),
            state: Mutex::new(TunnelState::Init),
            meta: RwLock::new(TunnelMetadata {
                guid: auth.guid,
                node_id: auth.node_id,
                zone_uin: auth.zone_uin,
                cert_expiration: auth.cert_expiration,
                start_time: unix_now(),
                ..Default::default()
            }),
            channels: DashMap::new(),
            pending: RequestCorrelator::new(),
            next_request_id: AtomicU32::new(1),
            cancel: CancellationToken::new(),
            open_posted: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            pending_certificate: Mutex::new(None),
            control_lock: tokio::sync::Mutex::new(()),
            self_ref: self_ref.clone(),
            ctx,
        })
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Process-local tunnel id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Current state
    pub fn state(&self) -> TunnelState {
        *self.state.lock()
    }

    /// Whether the tunnel has not been shut down
    pub fn is_active(&self) -> bool {
        !self.shut_down.load(Ordering::SeqCst)
    }

    /// Bound node; 0 if unbound
    pub fn node_id(&self) -> u32 {
        self.meta.read().node_id
    }

    /// Zone UIN
    pub fn zone_uin(&self) -> i32 {
        self.meta.read().zone_uin
    }

    /// Tunnel GUID
    pub fn guid(&self) -> Uuid {
        self.meta.read().guid
    }

    /// Certificate expiration (Unix timestamp); 0 if unknown
    pub fn cert_expiration(&self) -> i64 {
        self.meta.read().cert_expiration
    }

    /// Last entry into Unbound or Bound (Unix timestamp)
    pub fn start_time(&self) -> i64 {
        self.meta.read().start_time
    }

    /// Restart the idle clock
    pub fn reset_start_time(&self) {
        self.meta.write().start_time = unix_now();
    }

    /// Number of open channels
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Open channel by id
    pub fn channel(&self, channel_id: u32) -> Option<Arc<Channel>> {
        self.channels.get(&channel_id).map(|c| c.value().clone())
    }

    /// Display attributes
    pub fn info(&self) -> TunnelInfo {
        self.snapshot(self.state())
    }

    fn snapshot(&self, state: TunnelState) -> TunnelInfo {
        let meta = self.meta.read();
        TunnelInfo {
            id: self.id,
            guid: meta.guid,
            state,
            node_id: meta.node_id,
            peer_address: self.peer_addr.ip().to_string(),
            system_name: meta.system_name.clone(),
            hostname: meta.hostname.clone(),
            platform_name: meta.platform_name.clone(),
            system_info: meta.system_info.clone(),
            agent_version: meta.agent_version.clone(),
            agent_build_tag: meta.agent_build_tag.clone(),
            agent_id: meta.agent_id,
            hardware_id: hex(&meta.hardware_id),
            zone_uin: meta.zone_uin,
            channel_count: self.channels.len(),
            cert_expiration: meta.cert_expiration,
            start_time: meta.start_time,
            user_agent_installed: meta.user_agent_installed,
            agent_proxy: meta.agent_proxy,
            snmp_proxy: meta.snmp_proxy,
            snmp_trap_proxy: meta.snmp_trap_proxy,
        }
    }

    fn next_request_id(&self) -> u32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    // ========================================================================
    // Transport
    // ========================================================================

    /// Start the reader task
    pub fn start(&self) {
        let Some(reader) = self.reader.lock().take() else {
            warn!(tunnel_id = self.id, "Tunnel reader already started");
            return;
        };
        let Some(tunnel) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(tunnel.run_reader(reader));
    }

    async fn run_reader(self: Arc<Self>, mut reader: FrameReader) {
        let read_timeout = self.ctx.config.read_timeout;
        debug!(tunnel_id = self.id, peer = %self.peer_addr, "Tunnel reader started");

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = tokio::time::timeout(read_timeout, reader.next()) => next,
            };

            let msg = match next {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => {
                    warn!(tunnel_id = self.id, error = %e, "Failed to read frame");
                    break;
                }
                Ok(None) => {
                    info!(tunnel_id = self.id, peer = %self.peer_addr, "Agent closed connection");
                    break;
                }
                Err(_) => {
                    warn!(tunnel_id = self.id, timeout = ?read_timeout, "No frames received within read timeout");
                    break;
                }
            };

            if let Err(e) = self.handle_message(msg).await {
                if e.is_terminal() || !self.is_active() {
                    warn!(tunnel_id = self.id, error = %e, "Terminating tunnel");
                    break;
                }
                debug!(tunnel_id = self.id, error = %e, "Message handling failed");
            }
        }

        self.shutdown();
    }

    async fn handle_message(&self, msg: Message) -> Result<()> {
        trace!(tunnel_id = self.id, code = %msg.code(), id = msg.id(), "Received frame");
        match msg.code() {
            MessageCode::Keepalive => {
                self.send_message(Message::new(MessageCode::Keepalive, msg.id()))
                    .await
            }
            MessageCode::SetupAgentTunnel => self.process_setup(msg).await,
            MessageCode::RequestCertificate => self.process_certificate_request(msg).await,
            MessageCode::ChannelData => {
                self.route_channel_data(msg).await;
                Ok(())
            }
            MessageCode::CloseChannel => {
                self.process_close_channel(&msg);
                Ok(())
            }
            _ => {
                if let Err(e) = self.pending.dispatch(msg) {
                    debug!(tunnel_id = self.id, error = %e, "Discarding unmatched response");
                }
                Ok(())
            }
        }
    }

    /// Send one message under the write lock
    ///
    /// A write failure shuts the tunnel down. A message too large for the
    /// configured frame limit is refused without touching the connection.
    /// Shutdown aborts a write stalled on an agent that stopped reading.
    pub async fn send_message(&self, msg: Message) -> Result<()> {
        if !self.is_active() {
            return Err(Error::shutdown(format!("tunnel {}", self.id)));
        }

        let mut guard = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::shutdown(format!("tunnel {}", self.id))),
            guard = self.writer.lock() => guard,
        };
        let writer = match guard.as_mut() {
            Some(writer) if self.is_active() => writer,
            _ => return Err(Error::shutdown(format!("tunnel {}", self.id))),
        };

        let sent = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::shutdown(format!("tunnel {}", self.id))),
            sent = writer.send(msg) => sent,
        };
        match sent {
            Ok(()) => Ok(()),
            Err(FrameError::TooLarge { size, limit }) => Err(Error::invalid_argument(format!(
                "message of {} bytes exceeds limit of {} bytes",
                size, limit
            ))),
            Err(e) => {
                drop(guard);
                let err = Error::from(e);
                warn!(tunnel_id = self.id, error = %err, "Write to agent failed");
                self.shutdown();
                Err(err)
            }
        }
    }

    /// Send opaque bytes on a channel as one CHANNEL_DATA frame
    pub async fn send_channel_data(&self, channel_id: u32, data: Bytes) -> Result<usize> {
        let len = data.len();
        self.send_message(Message::channel_data(channel_id, data))
            .await?;
        Ok(len)
    }

    async fn request(&self, msg: Message, context: &str) -> Result<Message> {
        let request_id = msg.id();
        let rx = self.pending.register(request_id)?;
        if let Err(e) = self.send_message(msg).await {
            self.pending.cancel(request_id);
            return Err(e);
        }
        self.pending
            .wait(request_id, rx, self.ctx.config.request_timeout, context)
            .await
    }

    // ========================================================================
    // Channels
    // ========================================================================

    async fn route_channel_data(&self, msg: Message) {
        let channel_id = msg.id();
        let Some(channel) = self.channel(channel_id) else {
            debug!(tunnel_id = self.id, channel_id, "Dropping data for unknown channel");
            metrics::record_channel_data_dropped();
            return;
        };

        let payload = msg.into_payload().unwrap_or_default();
        if !channel.push(payload).await {
            debug!(tunnel_id = self.id, channel_id, "Channel closed while delivering data");
        }
    }

    fn process_close_channel(&self, msg: &Message) {
        let Some(channel_id) = msg.get_u32(FieldId::CHANNEL_ID) else {
            debug!(tunnel_id = self.id, "CLOSE_CHANNEL without channel id");
            return;
        };
        match self.channels.remove(&channel_id) {
            Some((_, channel)) => {
                debug!(tunnel_id = self.id, channel_id, "Channel closed by agent");
                channel.shutdown();
            }
            None => debug!(tunnel_id = self.id, channel_id, "CLOSE_CHANNEL for unknown channel"),
        }
    }

    /// Ask the agent to open a channel
    pub async fn open_channel(&self) -> Result<Arc<Channel>> {
        let request = Message::new(MessageCode::CreateChannel, self.next_request_id());
        let response = self.request(request, "CREATE_CHANNEL").await?;

        let rcc = response.rcc();
        if rcc != rcc::SUCCESS {
            return Err(Error::agent("CREATE_CHANNEL", rcc));
        }
        let channel_id = response
            .get_u32(FieldId::CHANNEL_ID)
            .ok_or_else(|| Error::protocol("CREATE_CHANNEL", "response carries no channel id"))?;

        let channel = Arc::new(Channel::new(
            channel_id,
            self.self_ref.clone(),
            self.ctx.config.channel_buffer_size,
        ));
        if let Some(previous) = self.channels.insert(channel_id, channel.clone()) {
            warn!(tunnel_id = self.id, channel_id, "Agent reused id of an open channel");
            previous.shutdown();
        }
        // shutdown() may have drained the table while we were inserting
        if !self.is_active() {
            self.channels.remove(&channel_id);
            channel.shutdown();
            return Err(Error::shutdown(format!("tunnel {}", self.id)));
        }

        debug!(tunnel_id = self.id, channel_id, "Channel opened");
        Ok(channel)
    }

    /// Close a channel and tell the agent
    ///
    /// Closing a channel that is not open is a no-op.
    pub async fn close_channel(&self, channel_id: u32) -> Result<()> {
        let Some((_, channel)) = self.channels.remove(&channel_id) else {
            return Ok(());
        };
        channel.shutdown();
        debug!(tunnel_id = self.id, channel_id, "Closing channel");
        let msg = Message::new(MessageCode::CloseChannel, self.next_request_id())
            .with(FieldId::CHANNEL_ID, channel_id);
        self.send_message(msg).await
    }

    // ========================================================================
    // Setup
    // ========================================================================

    async fn process_setup(&self, msg: Message) -> Result<()> {
        if self.state() != TunnelState::Init {
            warn!(tunnel_id = self.id, state = %self.state(), "Duplicate SETUP_AGENT_TUNNEL");
            return self
                .send_message(Message::request_completed(msg.id(), rcc::OUT_OF_STATE))
                .await;
        }

        let node_id = {
            let mut meta = self.meta.write();
            let text = |field| msg.get_str(field).unwrap_or_default().to_string();
            meta.system_name = text(FieldId::SYS_NAME);
            meta.system_info = text(FieldId::SYS_DESCRIPTION);
            meta.platform_name = text(FieldId::PLATFORM_NAME);
            meta.hostname = text(FieldId::HOSTNAME);
            meta.agent_version = text(FieldId::AGENT_VERSION);
            meta.agent_build_tag = text(FieldId::AGENT_BUILD_TAG);
            meta.agent_id = msg.get_guid(FieldId::AGENT_ID).unwrap_or_default();
            meta.hardware_id = msg
                .get_binary(FieldId::HARDWARE_ID)
                .map(|b| b.to_vec())
                .unwrap_or_default();
            let flag = |field| msg.get_bool(field).unwrap_or(false);
            meta.user_agent_installed = flag(FieldId::USER_AGENT_INSTALLED);
            meta.agent_proxy = flag(FieldId::AGENT_PROXY);
            meta.snmp_proxy = flag(FieldId::SNMP_PROXY);
            meta.snmp_trap_proxy = flag(FieldId::SNMP_TRAP_PROXY);
            meta.node_id
        };
        let frame_zone = msg.get_i32(FieldId::ZONE_UIN).unwrap_or(0);

        let mut mismatch = None;
        let bound = if node_id == 0 {
            false
        } else {
            match self.ctx.nodes.find_by_id(node_id).await {
                Ok(Some(node)) => {
                    let mut meta = self.meta.write();
                    meta.zone_uin = node.zone_uin;
                    if !node.agent_id.is_nil() && node.agent_id != meta.agent_id {
                        mismatch = Some(TunnelEventKind::AgentIdMismatch {
                            node_agent_id: node.agent_id,
                            tunnel_agent_id: meta.agent_id,
                        });
                    }
                    true
                }
                Ok(None) => {
                    warn!(tunnel_id = self.id, node_id, "Bound node no longer exists, accepting tunnel as unbound");
                    false
                }
                Err(e) => {
                    warn!(tunnel_id = self.id, node_id, error = %e, "Node lookup failed, accepting tunnel as unbound");
                    false
                }
            }
        };

        if !bound {
            let mut meta = self.meta.write();
            meta.node_id = 0;
            meta.guid = Uuid::nil();
            meta.cert_expiration = 0;
            meta.zone_uin = frame_zone;
        }
        if node_id != 0 && !bound {
            self.ctx.registry.unregister(self);
            if let Some(me) = self.self_ref.upgrade() {
                self.ctx.registry.register(me);
            }
        }

        {
            let mut state = self.state.lock();
            if *state == TunnelState::ShuttingDown {
                return Ok(());
            }
            *state = if bound {
                TunnelState::Bound
            } else {
                TunnelState::Unbound
            };
            self.meta.write().start_time = unix_now();
            if bound {
                if let Some(kind) = mismatch {
                    warn!(tunnel_id = self.id, node_id, "Agent ID differs from the one recorded on the node");
                    self.ctx
                        .events
                        .post(TunnelEvent::new(kind, self.snapshot(*state)));
                }
                // posted under the state lock so tunnel.closed cannot overtake it
                self.open_posted.store(true, Ordering::SeqCst);
                self.ctx
                    .events
                    .post(TunnelEvent::new(TunnelEventKind::Open, self.snapshot(*state)));
            }
        }

        info!(
            tunnel_id = self.id,
            node_id = self.node_id(),
            peer = %self.peer_addr,
            bound,
            "Tunnel setup completed"
        );

        let response = Message::request_completed(msg.id(), rcc::SUCCESS)
            .with(FieldId::IS_ACTIVE, bound);
        self.send_message(response).await?;

        if bound {
            self.schedule_renewal_if_expiring();
        }
        Ok(())
    }

    fn schedule_renewal_if_expiring(&self) {
        let expiration = self.cert_expiration();
        if expiration == 0 || expiration - unix_now() > CERT_RENEWAL_WINDOW.as_secs() as i64 {
            return;
        }
        let Some(tunnel) = self.self_ref.upgrade() else {
            return;
        };
        info!(tunnel_id = self.id, expiration, "Certificate expires soon, scheduling renewal");
        tokio::spawn(async move {
            if let Err(e) = tunnel.renew_certificate().await {
                warn!(tunnel_id = tunnel.id, error = %e, "Certificate renewal failed");
            }
        });
    }

    // ========================================================================
    // Certificates
    // ========================================================================

    async fn process_certificate_request(&self, msg: Message) -> Result<()> {
        let mut response = Message::new(MessageCode::NewCertificate, msg.id());
        match self.sign_pending_request(&msg) {
            Ok(der) => {
                response.set(FieldId::RCC, rcc::SUCCESS);
                response.set(FieldId::CERTIFICATE, der);
            }
            Err(e) => {
                warn!(tunnel_id = self.id, error = %e, "Refusing certificate request");
                response.set(FieldId::RCC, e.rcc());
            }
        }
        self.send_message(response).await
    }

    fn sign_pending_request(&self, msg: &Message) -> Result<Vec<u8>> {
        let csr = msg
            .get_binary(FieldId::CERTIFICATE_REQUEST)
            .ok_or_else(|| Error::invalid_argument("REQUEST_CERTIFICATE carries no CSR"))?;

        let mut guard = self.pending_certificate.lock();
        let pending = guard.as_mut().ok_or_else(|| {
            Error::out_of_state("REQUEST_CERTIFICATE", "no bind or renewal in progress")
        })?;

        let issued = self
            .ctx
            .ca
            .sign_agent_csr(csr, &pending.subject)
            .map_err(pki_error)?;
        debug!(tunnel_id = self.id, subject = %issued.subject, "Signed agent certificate");
        let der = issued.der.clone();
        pending.issued = Some(issued);
        Ok(der)
    }

    /// Run BIND_AGENT_TUNNEL and collect the certificate the agent requested
    async fn issue_certificate(&self, node_guid: Uuid, tunnel_guid: Uuid) -> Result<IssuedCertificate> {
        let config = &self.ctx.config;
        let subject = AgentSubject {
            node_guid,
            tunnel_guid,
            country: config.certificate_country.clone(),
            organization: config.certificate_organization.clone(),
        };

        let mut request = Message::new(MessageCode::BindAgentTunnel, self.next_request_id())
            .with(FieldId::SERVER_ID, config.server_id)
            .with(FieldId::NODE_GUID, node_guid)
            .with(FieldId::TUNNEL_GUID, tunnel_guid);
        if let Some(country) = &subject.country {
            request.set(FieldId::COUNTRY, country.as_str());
        }
        if let Some(org) = &subject.organization {
            request.set(FieldId::ORGANIZATION, org.as_str());
        }

        *self.pending_certificate.lock() = Some(PendingCertificate {
            subject,
            issued: None,
        });
        let result = self.request(request, "BIND_AGENT_TUNNEL").await;
        let pending = self.pending_certificate.lock().take();

        let response = result?;
        let rcc = response.rcc();
        if rcc != rcc::SUCCESS {
            return Err(Error::agent("BIND_AGENT_TUNNEL", rcc));
        }
        pending.and_then(|p| p.issued).ok_or_else(|| {
            Error::certificate("agent completed bind without requesting a certificate")
        })
    }

    /// Bind this unbound tunnel to a node
    ///
    /// The agent is issued a certificate for the node, the binding is
    /// persisted on the node and the agent is told to reconnect with the new
    /// certificate. This tunnel is abandoned afterwards.
    #[instrument(skip(self), fields(tunnel_id = self.id))]
    pub async fn bind(&self, node_id: u32, user_id: u32) -> Result<()> {
        let state = self.state();
        if state != TunnelState::Unbound {
            return Err(Error::out_of_state("bind", format!("tunnel is {}", state)));
        }
        let _guard = self
            .control_lock
            .try_lock()
            .map_err(|_| Error::out_of_state("bind", "certificate operation already in progress"))?;

        let node = self
            .ctx
            .nodes
            .find_by_id(node_id)
            .await?
            .ok_or_else(|| Error::not_found("node", node_id))?;

        let tunnel_guid = Uuid::new_v4();
        let issued = self.issue_certificate(node.guid, tunnel_guid).await?;

        self.ctx
            .nodes
            .set_tunnel_binding(node_id, tunnel_guid, &issued.subject)
            .await?;
        self.ctx.audit.record(AuditRecord::new(
            AuditAction::IssueCertificate,
            user_id,
            node_id,
            format!(
                "Certificate issued for agent tunnel {} (subject {})",
                self.id, issued.subject
            ),
        ));
        metrics::record_certificate_issued(IssueReason::Bind);
        info!(node_id, %tunnel_guid, "Tunnel bound to node, requesting reconnect");

        if let Err(e) = self
            .send_message(Message::new(MessageCode::ResetTunnel, self.next_request_id()))
            .await
        {
            warn!(error = %e, "Failed to send RESET_TUNNEL");
        }
        Ok(())
    }

    /// Issue a fresh certificate for the bound node
    ///
    /// The new certificate carries a new tunnel GUID, so the one it replaces
    /// no longer authenticates.
    #[instrument(skip(self), fields(tunnel_id = self.id))]
    pub async fn renew_certificate(&self) -> Result<()> {
        let state = self.state();
        if state != TunnelState::Bound {
            return Err(Error::out_of_state("renew", format!("tunnel is {}", state)));
        }
        let _guard = self
            .control_lock
            .try_lock()
            .map_err(|_| Error::out_of_state("renew", "certificate operation already in progress"))?;

        let node_id = self.node_id();
        let node = self
            .ctx
            .nodes
            .find_by_id(node_id)
            .await?
            .ok_or_else(|| Error::not_found("node", node_id))?;

        let tunnel_guid = Uuid::new_v4();
        let issued = self.issue_certificate(node.guid, tunnel_guid).await?;

        self.ctx
            .nodes
            .set_tunnel_binding(node_id, tunnel_guid, &issued.subject)
            .await?;
        {
            let mut meta = self.meta.write();
            meta.guid = tunnel_guid;
            meta.cert_expiration = issued.not_after;
        }
        self.ctx.audit.record(AuditRecord::new(
            AuditAction::IssueCertificate,
            0,
            node_id,
            format!(
                "Certificate renewed for agent tunnel {} (subject {})",
                self.id, issued.subject
            ),
        ));
        metrics::record_certificate_issued(IssueReason::Renew);
        info!(node_id, %tunnel_guid, not_after = issued.not_after, "Agent certificate renewed");
        Ok(())
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Shut the tunnel down
    ///
    /// Fails pending requests, shuts down every channel, leaves the registry
    /// and closes the connection. Idempotent and callable from any task.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let open_posted = {
            let mut state = self.state.lock();
            *state = TunnelState::ShuttingDown;
            self.open_posted.load(Ordering::SeqCst)
        };

        self.cancel.cancel();
        self.pending.cancel_all();

        let channels: Vec<Arc<Channel>> = self.channels.iter().map(|c| c.value().clone()).collect();
        self.channels.clear();
        for channel in channels {
            channel.shutdown();
        }

        self.ctx.registry.unregister(self);
        info!(tunnel_id = self.id, peer = %self.peer_addr, node_id = self.node_id(), "Tunnel closed");

        if open_posted {
            self.ctx.events.post(TunnelEvent::new(
                TunnelEventKind::Closed,
                self.snapshot(TunnelState::ShuttingDown),
            ));
        }

        if let (Some(tunnel), Ok(handle)) = (
            self.self_ref.upgrade(),
            tokio::runtime::Handle::try_current(),
        ) {
            handle.spawn(async move {
                // dropping the writer releases the write half even if the flush stalls
                let Some(mut writer) = tunnel.writer.lock().await.take() else {
                    return;
                };
                match tokio::time::timeout(CLOSE_TIMEOUT, writer.get_mut().shutdown()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        trace!(tunnel_id = tunnel.id, error = %e, "Connection shutdown failed")
                    }
                    Err(_) => trace!(tunnel_id = tunnel.id, "Connection shutdown timed out"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tunnelmux_pki::AgentCertRequest;

    use crate::events::{EVENT_AGENT_ID_MISMATCH, EVENT_TUNNEL_CLOSED, EVENT_TUNNEL_OPEN};
    use crate::node_store::Node;
    use crate::test_support::{setup_message, FakeAgent, TestHarness};

    #[tokio::test]
    async fn test_keepalive_is_echoed() {
        let harness = TestHarness::new();
        let (_tunnel, mut agent) = harness.connect(Authorization::unbound());

        agent.send(Message::new(MessageCode::Keepalive, 77)).await;
        let reply = agent.recv().await;
        assert_eq!(reply.code(), MessageCode::Keepalive);
        assert_eq!(reply.id(), 77);
    }

    /// Story: an agent without a certificate sets up and is listed as unbound
    #[tokio::test]
    async fn story_unbound_setup() {
        let harness = TestHarness::new();
        let (tunnel, mut agent) = harness.connect(Authorization::unbound());
        assert_eq!(tunnel.state(), TunnelState::Init);

        let agent_id = Uuid::from_bytes([0x11; 16]);
        agent.send(setup_message(1, "node-a", agent_id, 0)).await;
        let reply = agent.recv().await;
        assert_eq!(reply.code(), MessageCode::RequestCompleted);
        assert_eq!(reply.rcc(), rcc::SUCCESS);
        assert_eq!(reply.get_bool(FieldId::IS_ACTIVE), Some(false));

        assert_eq!(tunnel.state(), TunnelState::Unbound);
        let info = tunnel.info();
        assert_eq!(info.system_name, "node-a");
        assert_eq!(info.hostname, "node-a.local");
        assert_eq!(info.platform_name, "linux-x86_64");
        assert_eq!(info.agent_version, "5.0");
        assert_eq!(info.agent_id, agent_id);
        assert_eq!(info.hardware_id, "01".repeat(16));

        let unbound = harness.ctx.registry.unbound();
        assert_eq!(unbound.len(), 1);
        assert_eq!(unbound[0].id(), tunnel.id());
        assert_eq!(harness.events.count(EVENT_TUNNEL_OPEN), 0);
    }

    #[tokio::test]
    async fn test_duplicate_setup_is_out_of_state() {
        let harness = TestHarness::new();
        let (tunnel, mut agent) = harness.connect(Authorization::unbound());

        agent.send(setup_message(1, "node-a", Uuid::new_v4(), 0)).await;
        agent.recv().await;
        agent.send(setup_message(2, "node-b", Uuid::new_v4(), 0)).await;
        let reply = agent.recv().await;
        assert_eq!(reply.id(), 2);
        assert_eq!(reply.rcc(), rcc::OUT_OF_STATE);
        assert_eq!(tunnel.info().system_name, "node-a");
        assert!(tunnel.is_active());
    }

    #[tokio::test]
    async fn test_bound_setup_takes_zone_from_node_and_posts_open() {
        let harness = TestHarness::new();
        let mut node = Node::new(42, "node-42", 5);
        node.agent_id = Uuid::from_bytes([0x22; 16]);
        harness.nodes.insert(node);

        let (tunnel, mut agent) = harness.connect(Authorization::bound(42, 0, Uuid::new_v4(), 0));
        agent.send(setup_message(1, "node-a", Uuid::from_bytes([0x11; 16]), 9)).await;
        let reply = agent.recv().await;
        assert_eq!(reply.get_bool(FieldId::IS_ACTIVE), Some(true));

        assert_eq!(tunnel.state(), TunnelState::Bound);
        assert_eq!(tunnel.zone_uin(), 5);
        assert_eq!(harness.events.count(EVENT_TUNNEL_OPEN), 1);

        let mismatch = harness.events.for_tunnel(EVENT_AGENT_ID_MISMATCH, tunnel.id());
        assert_eq!(mismatch.len(), 1);
        assert_eq!(
            mismatch[0].kind,
            TunnelEventKind::AgentIdMismatch {
                node_agent_id: Uuid::from_bytes([0x22; 16]),
                tunnel_agent_id: Uuid::from_bytes([0x11; 16]),
            }
        );
        let bound = harness.ctx.registry.find_by_node_id(42).expect("tunnel should be bound");
        assert_eq!(bound.id(), tunnel.id());
    }

    #[tokio::test]
    async fn test_bound_setup_for_missing_node_degrades_to_unbound() {
        let harness = TestHarness::new();
        let (tunnel, mut agent) = harness.connect(Authorization::bound(99, 0, Uuid::new_v4(), 0));

        agent.send(setup_message(1, "node-a", Uuid::new_v4(), 3)).await;
        let reply = agent.recv().await;
        assert_eq!(reply.get_bool(FieldId::IS_ACTIVE), Some(false));
        assert_eq!(tunnel.state(), TunnelState::Unbound);
        assert_eq!(tunnel.node_id(), 0);
        assert_eq!(tunnel.zone_uin(), 3);
        assert!(harness.ctx.registry.find_by_node_id(99).is_none());
        assert_eq!(harness.ctx.registry.unbound().len(), 1);
    }

    /// Story: open a channel, echo bytes through it, then close it
    #[tokio::test]
    async fn story_open_channel_and_echo() {
        let harness = TestHarness::new();
        let (tunnel, mut agent) = harness.connect(Authorization::unbound());
        agent.setup_unbound().await;

        let opener = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.open_channel().await })
        };
        let create = agent.recv().await;
        assert_eq!(create.code(), MessageCode::CreateChannel);
        agent
            .send(Message::request_completed(create.id(), rcc::SUCCESS).with(FieldId::CHANNEL_ID, 1u32))
            .await;
        let channel = opener
            .await
            .expect("open task should complete")
            .expect("open_channel should succeed");
        assert_eq!(channel.id(), 1);
        assert!(tunnel.channel(1).is_some());

        assert_eq!(channel.write(b"PING").await.expect("write should succeed"), 4);
        let data = agent.recv().await;
        assert_eq!(data.code(), MessageCode::ChannelData);
        assert_eq!(data.id(), 1);
        assert_eq!(data.payload().map(|p| p.as_ref()), Some(&b"PING"[..]));
        agent.send(Message::channel_data(1, Bytes::from_static(b"PING"))).await;

        let mut buf = [0u8; 16];
        let n = channel
            .read(&mut buf, Duration::from_secs(1))
            .await
            .expect("read should succeed");
        assert_eq!(&buf[..n], b"PING");

        channel.close().await.expect("close should succeed");
        let close = agent.recv().await;
        assert_eq!(close.code(), MessageCode::CloseChannel);
        assert_eq!(close.get_u32(FieldId::CHANNEL_ID), Some(1));
        assert_eq!(tunnel.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_open_channel_agent_error() {
        let harness = TestHarness::new();
        let (tunnel, mut agent) = harness.connect(Authorization::unbound());
        agent.setup_unbound().await;

        let opener = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.open_channel().await })
        };
        let create = agent.recv().await;
        agent.send(Message::request_completed(create.id(), rcc::ACCESS_DENIED)).await;
        let err = opener
            .await
            .expect("open task should complete")
            .expect_err("open_channel should fail");
        assert!(matches!(err, Error::AgentError { rcc: rcc::ACCESS_DENIED, .. }));
        assert_eq!(tunnel.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_open_channel_times_out() {
        let harness = TestHarness::with_config(|c| c.request_timeout = Duration::from_millis(50));
        let (tunnel, mut agent) = harness.connect(Authorization::unbound());
        agent.setup_unbound().await;

        let err = tunnel.open_channel().await.expect_err("open_channel should time out");
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(tunnel.is_active());
    }

    #[tokio::test]
    async fn test_remote_close_wakes_reader() {
        let harness = TestHarness::new();
        let (tunnel, mut agent) = harness.connect(Authorization::unbound());
        agent.setup_unbound().await;
        let channel = agent.open_channel(&tunnel, 4).await;

        agent
            .send(Message::new(MessageCode::CloseChannel, 900).with(FieldId::CHANNEL_ID, 4u32))
            .await;
        let mut buf = [0u8; 8];
        let n = channel
            .read(&mut buf, Duration::from_secs(1))
            .await
            .expect("closed read should succeed");
        assert_eq!(n, 0);
        assert!(!channel.is_active());
        assert_eq!(tunnel.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_data_for_unknown_channel_is_dropped() {
        let harness = TestHarness::new();
        let (tunnel, mut agent) = harness.connect(Authorization::unbound());
        agent.setup_unbound().await;

        agent.send(Message::channel_data(55, Bytes::from_static(b"stray"))).await;
        agent.send(Message::new(MessageCode::Keepalive, 3)).await;
        let reply = agent.recv().await;
        assert_eq!(reply.code(), MessageCode::Keepalive);
        assert!(tunnel.is_active());
    }

    /// Story: per-channel data arrives in order while other channels interleave
    #[tokio::test]
    async fn story_interleaved_channels_keep_order() {
        let harness = TestHarness::new();
        let (tunnel, mut agent) = harness.connect(Authorization::unbound());
        agent.setup_unbound().await;
        let a = agent.open_channel(&tunnel, 1).await;
        let b = agent.open_channel(&tunnel, 2).await;

        for i in 0..20u8 {
            agent.send(Message::channel_data(1, Bytes::from(vec![i]))).await;
            agent.send(Message::channel_data(2, Bytes::from(vec![100 + i]))).await;
        }

        let mut got_a = Vec::new();
        let mut got_b = Vec::new();
        let mut buf = [0u8; 64];
        while got_a.len() < 20 {
            let n = a.read(&mut buf, Duration::from_secs(1)).await.expect("read a");
            got_a.extend_from_slice(&buf[..n]);
        }
        while got_b.len() < 20 {
            let n = b.read(&mut buf, Duration::from_secs(1)).await.expect("read b");
            got_b.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got_a, (0..20u8).collect::<Vec<_>>());
        assert_eq!(got_b, (100..120u8).collect::<Vec<_>>());
    }

    /// Story: a stalled consumer stops the reader without losing data
    #[tokio::test]
    async fn story_backpressure_stalls_reader() {
        let harness = TestHarness::with_config(|c| c.channel_buffer_size = 8);
        let (tunnel, mut agent) = harness.connect(Authorization::unbound());
        agent.setup_unbound().await;
        let channel = agent.open_channel(&tunnel, 1).await;

        agent.send(Message::channel_data(1, Bytes::from_static(b"12345678"))).await;
        agent.send(Message::channel_data(1, Bytes::from_static(b"9"))).await;
        agent.send(Message::new(MessageCode::Keepalive, 44)).await;

        // the reader is parked on the full buffer, so the keepalive is not answered
        assert!(agent.try_recv(Duration::from_millis(100)).await.is_none());
        assert_eq!(channel.buffered_len(), 8);

        let mut buf = [0u8; 16];
        let n = channel.read(&mut buf, Duration::from_secs(1)).await.expect("read");
        assert_eq!(&buf[..n], b"12345678");

        let reply = agent.recv().await;
        assert_eq!(reply.id(), 44);
        let n = channel.read(&mut buf, Duration::from_secs(1)).await.expect("read");
        assert_eq!(&buf[..n], b"9");
    }

    /// Story: a stalled consumer on one tunnel leaves another tunnel unaffected
    #[tokio::test]
    async fn story_stalled_tunnel_does_not_affect_others() {
        let harness = TestHarness::with_config(|c| c.channel_buffer_size = 8);
        let (stalled, mut stalled_agent) = harness.connect(Authorization::unbound());
        stalled_agent.setup_unbound().await;
        let stalled_channel = stalled_agent.open_channel(&stalled, 1).await;
        stalled_agent
            .send(Message::channel_data(1, Bytes::from_static(b"12345678")))
            .await;
        stalled_agent
            .send(Message::channel_data(1, Bytes::from_static(b"9")))
            .await;
        stalled_agent.send(Message::new(MessageCode::Keepalive, 10)).await;
        assert!(stalled_agent.try_recv(Duration::from_millis(100)).await.is_none());

        let (other, mut other_agent) = harness.connect_from(
            "127.0.0.2:40000".parse().expect("address should parse"),
            Authorization::unbound(),
        );
        other_agent.setup_unbound().await;
        let channel = other_agent.open_channel(&other, 7).await;
        other_agent
            .send(Message::channel_data(7, Bytes::from_static(b"hello")))
            .await;
        let mut buf = [0u8; 16];
        let n = channel
            .read(&mut buf, Duration::from_secs(1))
            .await
            .expect("read should succeed");
        assert_eq!(&buf[..n], b"hello");

        other_agent.send(Message::new(MessageCode::Keepalive, 11)).await;
        assert_eq!(other_agent.recv().await.id(), 11);

        assert!(stalled.is_active());
        assert_eq!(stalled_channel.buffered_len(), 8);
    }

    /// Story: concurrent writers each reach the agent as whole frames, in call order per writer
    #[tokio::test]
    async fn story_concurrent_writes_arrive_whole() {
        const WRITERS: u8 = 8;
        const FRAMES: u8 = 10;
        const FRAME_LEN: usize = 4096;

        let harness = TestHarness::new();
        let (tunnel, mut agent) = harness.connect(Authorization::unbound());
        agent.setup_unbound().await;
        let channel = agent.open_channel(&tunnel, 1).await;

        let writers: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let channel = channel.clone();
                tokio::spawn(async move {
                    for seq in 0..FRAMES {
                        let mut data = vec![writer; FRAME_LEN];
                        data[1] = seq;
                        channel.write(&data).await.expect("write should succeed");
                    }
                })
            })
            .collect();

        let mut next_seq = vec![0u8; WRITERS as usize];
        for _ in 0..(WRITERS as usize * FRAMES as usize) {
            let msg = agent.recv().await;
            assert_eq!(msg.code(), MessageCode::ChannelData);
            assert_eq!(msg.id(), 1);
            let payload = msg.into_payload().expect("data frame should carry a payload");
            assert_eq!(payload.len(), FRAME_LEN);

            let writer = payload[0];
            assert!(payload[2..].iter().all(|b| *b == writer), "frame bytes interleaved");
            assert_eq!(payload[1], next_seq[writer as usize], "frames of one writer reordered");
            next_seq[writer as usize] += 1;
        }

        for writer in writers {
            writer.await.expect("writer task should complete");
        }
        assert!(next_seq.iter().all(|n| *n == FRAMES));
    }

    /// Story: shutdown releases a writer blocked on an agent that stopped reading
    #[tokio::test]
    async fn story_shutdown_releases_stalled_writer() {
        let harness = TestHarness::new();
        let (tunnel, mut agent) = harness.connect(Authorization::unbound());
        agent.setup_unbound().await;
        let channel = agent.open_channel(&tunnel, 1).await;

        // larger than the transport buffer; the agent never drains it
        let writer = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.write(&vec![0u8; 512 * 1024]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        tunnel.shutdown();
        let err = tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("write should return after shutdown")
            .expect("writer task should complete")
            .expect_err("stalled write should fail");
        assert!(matches!(err, Error::Shutdown { .. }));
        assert!(
            agent.wait_closed(Duration::from_secs(2)).await,
            "connection should be closed"
        );
    }

    /// Story: shutdown during a blocked read wakes it and posts tunnel.closed once
    #[tokio::test]
    async fn story_shutdown_during_read() {
        let harness = TestHarness::new();
        harness.nodes.insert(Node::new(42, "node-42", 0));
        let (tunnel, mut agent) = harness.connect(Authorization::bound(42, 0, Uuid::new_v4(), 0));
        agent.send(setup_message(1, "node-a", Uuid::new_v4(), 0)).await;
        agent.recv().await;
        let channel = agent.open_channel(&tunnel, 1).await;

        let reader = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                channel.read(&mut buf, Duration::from_secs(30)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let closer = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.shutdown() })
        };
        closer.await.expect("shutdown task should complete");
        tunnel.shutdown();

        let n = tokio::time::timeout(Duration::from_millis(100), reader)
            .await
            .expect("read should return promptly")
            .expect("reader task should complete")
            .expect("closed read should succeed");
        assert_eq!(n, 0);
        assert_eq!(tunnel.state(), TunnelState::ShuttingDown);
        assert!(harness.ctx.registry.find_by_node_id(42).is_none());
        assert_eq!(harness.events.for_tunnel(EVENT_TUNNEL_CLOSED, tunnel.id()).len(), 1);

        let err = tunnel
            .send_message(Message::new(MessageCode::Keepalive, 1))
            .await
            .expect_err("send after shutdown should fail");
        assert!(matches!(err, Error::Shutdown { .. }));
    }

    #[tokio::test]
    async fn test_agent_disconnect_shuts_down_tunnel() {
        let harness = TestHarness::new();
        let (tunnel, mut agent) = harness.connect(Authorization::unbound());
        agent.setup_unbound().await;
        drop(agent);

        tokio::time::timeout(Duration::from_secs(1), async {
            while tunnel.is_active() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("tunnel should shut down after disconnect");
        assert!(harness.ctx.registry.unbound().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_terminates_tunnel() {
        let harness = TestHarness::with_config(|c| c.max_message_size = 1024);
        let (tunnel, mut agent) = harness.connect(Authorization::unbound());
        agent.setup_unbound().await;
        let channel = agent.open_channel(&tunnel, 1).await;

        agent.send(Message::channel_data(1, Bytes::from(vec![0u8; 4096]))).await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while tunnel.is_active() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("oversized frame should terminate the tunnel");
        assert_eq!(channel.buffered_len(), 0);
        assert!(!channel.is_active());
    }

    #[tokio::test]
    async fn test_read_timeout_terminates_tunnel() {
        let harness = TestHarness::with_config(|c| c.read_timeout = Duration::from_millis(50));
        let (tunnel, _agent) = harness.connect(Authorization::unbound());

        tokio::time::timeout(Duration::from_secs(1), async {
            while tunnel.is_active() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("silent tunnel should time out");
    }

    #[tokio::test]
    async fn test_bind_requires_unbound_state() {
        let harness = TestHarness::new();
        harness.nodes.insert(Node::new(42, "node-42", 0));
        let (tunnel, _agent) = harness.connect(Authorization::unbound());

        let err = tunnel.bind(42, 7).await.expect_err("bind in Init should fail");
        assert!(matches!(err, Error::OutOfState { .. }));
    }

    #[tokio::test]
    async fn test_bind_unknown_node_is_invalid_argument() {
        let harness = TestHarness::new();
        let (tunnel, mut agent) = harness.connect(Authorization::unbound());
        agent.setup_unbound().await;

        let err = tunnel.bind(42, 7).await.expect_err("bind should fail");
        assert!(matches!(err, Error::InvalidArgument { not_found: true, .. }));
    }

    #[tokio::test]
    async fn test_certificate_request_without_pending_bind() {
        let harness = TestHarness::new();
        let (_tunnel, mut agent) = harness.connect(Authorization::unbound());
        agent.setup_unbound().await;

        let csr = AgentCertRequest::new("agent").expect("CSR generation should succeed");
        agent
            .send(
                Message::new(MessageCode::RequestCertificate, 31)
                    .with(FieldId::CERTIFICATE_REQUEST, csr.csr_der()),
            )
            .await;
        let reply = agent.recv().await;
        assert_eq!(reply.code(), MessageCode::NewCertificate);
        assert_eq!(reply.id(), 31);
        assert_eq!(reply.rcc(), rcc::OUT_OF_STATE);
        assert!(!reply.has(FieldId::CERTIFICATE));
    }

    /// Story: bind issues a node-scoped certificate and resets the tunnel
    #[tokio::test]
    async fn story_bind_issues_certificate() {
        let harness = TestHarness::new();
        let mut node = Node::new(42, "node-42", 0);
        node.guid = Uuid::from_bytes([0xAA; 16]);
        harness.nodes.insert(node);

        let (tunnel, mut agent) = harness.connect(Authorization::unbound());
        agent.setup_unbound().await;

        let binder = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.bind(42, 7).await })
        };

        let bind = agent.recv().await;
        assert_eq!(bind.code(), MessageCode::BindAgentTunnel);
        assert_eq!(bind.get_guid(FieldId::NODE_GUID), Some(Uuid::from_bytes([0xAA; 16])));
        let new_guid = bind.get_guid(FieldId::TUNNEL_GUID).expect("tunnel GUID should be sent");

        let identity = agent.complete_certificate_exchange(&bind).await;
        assert_eq!(identity.node_guid, Uuid::from_bytes([0xAA; 16]));
        assert_eq!(identity.tunnel_guid, new_guid);

        binder
            .await
            .expect("bind task should complete")
            .expect("bind should succeed");
        let reset = agent.recv().await;
        assert_eq!(reset.code(), MessageCode::ResetTunnel);

        let node = harness.nodes.get(42).expect("node should exist");
        assert_eq!(node.tunnel_id, new_guid);
        assert!(node.cert_subject.is_some());

        let records = harness.audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, AuditAction::IssueCertificate);
        assert_eq!(records[0].user_id, 7);
        assert_eq!(records[0].node_id, 42);
    }

    #[tokio::test]
    async fn test_bind_rejected_by_agent() {
        let harness = TestHarness::new();
        harness.nodes.insert(Node::new(42, "node-42", 0));
        let (tunnel, mut agent) = harness.connect(Authorization::unbound());
        agent.setup_unbound().await;

        let binder = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.bind(42, 7).await })
        };
        let bind = agent.recv().await;
        agent.send(Message::request_completed(bind.id(), rcc::INTERNAL_ERROR)).await;

        let err = binder
            .await
            .expect("bind task should complete")
            .expect_err("bind should fail");
        assert!(matches!(err, Error::AgentError { rcc: rcc::INTERNAL_ERROR, .. }));
        assert!(harness.nodes.get(42).expect("node").tunnel_id.is_nil());
        assert!(harness.audit.records().is_empty());
    }

    /// Story: renewal replaces the tunnel GUID recorded on the node
    #[tokio::test]
    async fn story_renew_rotates_tunnel_guid() {
        let harness = TestHarness::new();
        let old_guid = Uuid::new_v4();
        let mut node = Node::new(42, "node-42", 0);
        node.tunnel_id = old_guid;
        harness.nodes.insert(node.clone());

        let (tunnel, mut agent) = harness.connect(Authorization::bound(42, 0, old_guid, 0));
        agent.send(setup_message(1, "node-a", Uuid::new_v4(), 0)).await;
        agent.recv().await;

        let renewer = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.renew_certificate().await })
        };
        let bind = agent.recv().await;
        assert_eq!(bind.get_guid(FieldId::NODE_GUID), Some(node.guid));
        let identity = agent.complete_certificate_exchange(&bind).await;
        renewer
            .await
            .expect("renew task should complete")
            .expect("renew should succeed");

        let stored = harness.nodes.get(42).expect("node should exist");
        assert_eq!(stored.tunnel_id, identity.tunnel_guid);
        assert_ne!(stored.tunnel_id, old_guid);
        assert_eq!(tunnel.guid(), identity.tunnel_guid);
        assert!(tunnel.cert_expiration() > unix_now());
        assert_eq!(harness.audit.records()[0].user_id, 0);
    }

    #[tokio::test]
    async fn test_expiring_certificate_renewed_after_setup() {
        let harness = TestHarness::new();
        harness.nodes.insert(Node::new(42, "node-42", 0));
        let expiring = unix_now() + 3600;
        let (_tunnel, mut agent) = harness.connect(Authorization::bound(42, 0, Uuid::new_v4(), expiring));

        agent.send(setup_message(1, "node-a", Uuid::new_v4(), 0)).await;
        let setup_reply = agent.recv().await;
        assert_eq!(setup_reply.code(), MessageCode::RequestCompleted);

        let bind = agent.recv().await;
        assert_eq!(bind.code(), MessageCode::BindAgentTunnel);
    }
}
