//! TLS listener for agent connections
//!
//! Each accepted connection gets its own handshake task. The number of
//! handshakes running at once is capped by a semaphore, and each one has a
//! deadline. A connection that fails the handshake never becomes a tunnel.
//!
//! After the handshake the presented certificate, if any, decides whether
//! the tunnel starts bound: the certificate must verify against the CA
//! bundle, its OU must name an existing node, and its CN must equal the
//! tunnel GUID currently recorded on that node. Anything else is admitted
//! as unbound.

use std::net::SocketAddr;
use std::sync::Arc;

use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnelmux_common::metrics;
use tunnelmux_common::{Error, Result};

use crate::context::TunnelContext;
use crate::tunnel::{Authorization, Tunnel};

/// Accepts agent connections and turns them into registered tunnels
pub struct TunnelListener {
    ctx: Arc<TunnelContext>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handshakes: Arc<Semaphore>,
}

impl TunnelListener {
    /// Bind the configured listen address
    pub async fn bind(ctx: Arc<TunnelContext>, tls: Arc<ServerConfig>) -> Result<Self> {
        let addr = ctx.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::io(format!("bind {}", addr), e.to_string()))?;
        let handshakes = Arc::new(Semaphore::new(ctx.config.max_concurrent_handshakes));

        Ok(Self {
            acceptor: TlsAcceptor::from(tls),
            listener,
            handshakes,
            ctx,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| Error::io("listener", e.to_string()))
    }

    /// Accept connections until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        info!(addr = ?self.listener.local_addr().ok(), "Agent tunnel listener started");
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted agent connection");
                    tokio::spawn(handle_connection(
                        self.ctx.clone(),
                        self.acceptor.clone(),
                        self.handshakes.clone(),
                        stream,
                        peer,
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                }
            }
        }
        info!("Agent tunnel listener stopped");
    }
}

async fn handle_connection(
    ctx: Arc<TunnelContext>,
    acceptor: TlsAcceptor,
    handshakes: Arc<Semaphore>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let Ok(permit) = handshakes.acquire_owned().await else {
        return;
    };

    let tls = match tokio::time::timeout(ctx.config.handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "TLS handshake failed");
            metrics::record_handshake_failure();
            return;
        }
        Err(_) => {
            warn!(peer = %peer, timeout = ?ctx.config.handshake_timeout, "TLS handshake timed out");
            metrics::record_handshake_failure();
            return;
        }
    };
    drop(permit);

    let peer_cert = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.as_ref().to_vec());

    let auth = match peer_cert {
        Some(der) => authorize(&ctx, &der, peer).await,
        None => {
            debug!(peer = %peer, "No client certificate, accepting as unbound");
            Authorization::unbound()
        }
    };

    let tunnel = Tunnel::new(ctx.clone(), tls, peer, auth);
    info!(
        tunnel_id = tunnel.id(),
        peer = %peer,
        node_id = auth.node_id,
        "Agent tunnel established"
    );
    ctx.registry.register(tunnel.clone());
    tunnel.start();
}

/// Decide whether a presented certificate binds the connection to a node
pub async fn authorize(ctx: &TunnelContext, cert_der: &[u8], peer: SocketAddr) -> Authorization {
    let verification = match ctx.ca.verify_agent_cert(cert_der) {
        Ok(verification) => verification,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Cannot parse client certificate, accepting as unbound");
            return Authorization::unbound();
        }
    };
    if !verification.valid {
        warn!(
            peer = %peer,
            reason = verification.reason.as_deref().unwrap_or("unknown"),
            "Client certificate rejected, accepting as unbound"
        );
        return Authorization::unbound();
    }
    let Some(identity) = verification.identity else {
        return Authorization::unbound();
    };

    match ctx.nodes.find_by_guid(identity.node_guid).await {
        Ok(Some(node)) if node.tunnel_id == identity.tunnel_guid => {
            debug!(peer = %peer, node_id = node.id, "Client certificate matches node binding");
            Authorization::bound(node.id, node.zone_uin, identity.tunnel_guid, identity.not_after)
        }
        Ok(Some(node)) => {
            warn!(
                peer = %peer,
                node_id = node.id,
                presented = %identity.tunnel_guid,
                recorded = %node.tunnel_id,
                "Certificate is not the node's current one, accepting as unbound"
            );
            Authorization::unbound()
        }
        Ok(None) => {
            warn!(peer = %peer, node_guid = %identity.node_guid, "No node for certificate, accepting as unbound");
            Authorization::unbound()
        }
        Err(e) => {
            warn!(peer = %peer, error = %e, "Node lookup failed, accepting as unbound");
            Authorization::unbound()
        }
    }
}
