//! In-process fixtures: a tunnel over `tokio::io::duplex` and a scripted agent

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;
use uuid::Uuid;
use zeroize::Zeroizing;

use tunnelmux_common::TunnelConfig;
use tunnelmux_pki::{
    AgentCertRequest, AgentIdentity, CertificateAuthority, CertificateAuthorityBundle, PkiMaterial,
};
use tunnelmux_proto::{rcc, FieldId, FrameCodec, Message, MessageCode};

use crate::channel::Channel;
use crate::context::{Collaborators, TunnelContext};
use crate::events::{RecordingAuditLog, RecordingEventSink};
use crate::node_store::InMemoryNodeStore;
use crate::tunnel::{Authorization, Tunnel};

const DUPLEX_BUFFER: usize = 64 * 1024;

/// SETUP_AGENT_TUNNEL as a test agent sends it
pub(crate) fn setup_message(id: u32, system_name: &str, agent_id: Uuid, zone_uin: i32) -> Message {
    Message::new(MessageCode::SetupAgentTunnel, id)
        .with(FieldId::SYS_NAME, system_name)
        .with(FieldId::HOSTNAME, format!("{}.local", system_name))
        .with(FieldId::PLATFORM_NAME, "linux-x86_64")
        .with(FieldId::AGENT_VERSION, "5.0")
        .with(FieldId::AGENT_ID, agent_id)
        .with(FieldId::ZONE_UIN, zone_uin)
        .with(FieldId::HARDWARE_ID, vec![0x01u8; 16])
}

/// Fresh CA with a listener certificate for localhost
pub(crate) fn pki_material() -> PkiMaterial {
    let ca = CertificateAuthority::new("Test CA").expect("CA creation should succeed");
    let (cert, key) = ca
        .generate_server_cert(&["localhost", "127.0.0.1"])
        .expect("server certificate should be generated");
    PkiMaterial {
        bundle: CertificateAuthorityBundle::new(ca),
        server_cert_pem: cert,
        server_key_pem: Zeroizing::new(key),
    }
}

pub(crate) struct TestHarness {
    pub ctx: Arc<TunnelContext>,
    pub nodes: Arc<InMemoryNodeStore>,
    pub events: Arc<RecordingEventSink>,
    pub audit: Arc<RecordingAuditLog>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(configure: impl FnOnce(&mut TunnelConfig)) -> Self {
        let mut config = TunnelConfig::default();
        configure(&mut config);

        let ca = CertificateAuthority::new("Test CA").expect("CA creation should succeed");
        let nodes = Arc::new(InMemoryNodeStore::new());
        let events = Arc::new(RecordingEventSink::new());
        let audit = Arc::new(RecordingAuditLog::new());
        let collaborators = Collaborators::recording(nodes.clone(), events.clone(), audit.clone());

        Self {
            ctx: Arc::new(TunnelContext::new(
                config,
                CertificateAuthorityBundle::new(ca),
                collaborators,
            )),
            nodes,
            events,
            audit,
        }
    }

    /// Register and start a tunnel from 127.0.0.1
    pub fn connect(&self, auth: Authorization) -> (Arc<Tunnel>, FakeAgent) {
        self.connect_from("127.0.0.1:40000".parse().expect("address should parse"), auth)
    }

    pub fn connect_from(&self, peer: SocketAddr, auth: Authorization) -> (Arc<Tunnel>, FakeAgent) {
        let (server, client) = tokio::io::duplex(DUPLEX_BUFFER);
        let tunnel = Tunnel::new(self.ctx.clone(), server, peer, auth);
        self.ctx.registry.register(tunnel.clone());
        tunnel.start();
        (
            tunnel,
            FakeAgent {
                framed: Framed::new(client, FrameCodec::new()),
            },
        )
    }
}

/// Agent end of a duplex tunnel
pub(crate) struct FakeAgent {
    framed: Framed<DuplexStream, FrameCodec>,
}

impl FakeAgent {
    pub async fn send(&mut self, msg: Message) {
        self.framed
            .send(msg)
            .await
            .expect("agent send should succeed");
    }

    pub async fn recv(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("agent should receive a frame in time")
            .expect("connection should be open")
            .expect("frame should decode")
    }

    pub async fn try_recv(&mut self, wait: Duration) -> Option<Message> {
        match tokio::time::timeout(wait, self.framed.next()).await {
            Ok(Some(Ok(msg))) => Some(msg),
            _ => None,
        }
    }

    /// Discard frames until the server closes the connection
    pub async fn wait_closed(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, async {
            while let Some(Ok(_)) = self.framed.next().await {}
        })
        .await
        .is_ok()
    }

    /// Send SETUP and consume the reply
    pub async fn setup_unbound(&mut self) {
        self.send(setup_message(1, "node-a", Uuid::new_v4(), 0)).await;
        let reply = self.recv().await;
        assert_eq!(reply.code(), MessageCode::RequestCompleted);
    }

    /// Drive `Tunnel::open_channel`, answering with `channel_id`
    pub async fn open_channel(&mut self, tunnel: &Arc<Tunnel>, channel_id: u32) -> Arc<Channel> {
        let opener = {
            let tunnel = tunnel.clone();
            tokio::spawn(async move { tunnel.open_channel().await })
        };
        let create = self.recv().await;
        assert_eq!(create.code(), MessageCode::CreateChannel);
        self.send(
            Message::request_completed(create.id(), rcc::SUCCESS)
                .with(FieldId::CHANNEL_ID, channel_id),
        )
        .await;
        opener
            .await
            .expect("open task should complete")
            .expect("open_channel should succeed")
    }

    /// Answer a BIND_AGENT_TUNNEL the way a real agent does
    pub async fn complete_certificate_exchange(&mut self, bind: &Message) -> AgentIdentity {
        let csr = AgentCertRequest::new("agent").expect("CSR generation should succeed");
        self.send(
            Message::new(MessageCode::RequestCertificate, 5000)
                .with(FieldId::CERTIFICATE_REQUEST, csr.csr_der()),
        )
        .await;
        let issued = self.recv().await;
        assert_eq!(issued.code(), MessageCode::NewCertificate);
        assert_eq!(issued.rcc(), rcc::SUCCESS);
        let der = issued
            .get_binary(FieldId::CERTIFICATE)
            .expect("certificate should be returned");
        let identity = AgentIdentity::from_der(der).expect("certificate should parse");

        self.send(Message::request_completed(bind.id(), rcc::SUCCESS)).await;
        identity
    }
}
