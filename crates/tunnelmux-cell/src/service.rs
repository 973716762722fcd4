//! Tunnel service
//!
//! Owns the shared context and the background tasks: the listener accept
//! loop and both lifecycle loops. Constructed once at startup; the daemon
//! calls [`TunnelService::start`] and [`TunnelService::stop`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use tunnelmux_common::{Error, Result, TunnelConfig};
use tunnelmux_pki::{CertificateAuthorityBundle, ServerMtlsConfig};

use crate::context::{Collaborators, TunnelContext};
use crate::events::{AuditAction, AuditRecord};
use crate::lifecycle;
use crate::listener::TunnelListener;
use crate::tunnel::{Tunnel, TunnelInfo};

struct Running {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// The agent tunnel server
pub struct TunnelService {
    ctx: Arc<TunnelContext>,
    server_tls: ServerMtlsConfig,
    running: Mutex<Option<Running>>,
}

impl TunnelService {
    /// Create a stopped service
    ///
    /// `server_tls` is the listener's own identity; `ca` signs agent
    /// certificates and validates the ones agents present.
    pub fn new(
        config: TunnelConfig,
        ca: CertificateAuthorityBundle,
        server_tls: ServerMtlsConfig,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            ctx: Arc::new(TunnelContext::new(config, ca, collaborators)),
            server_tls,
            running: Mutex::new(None),
        }
    }

    /// Service around an existing context, with a throwaway listener identity
    #[cfg(test)]
    pub(crate) fn for_context(ctx: Arc<TunnelContext>) -> Self {
        let material = crate::test_support::pki_material();
        Self {
            server_tls: material.server_tls(),
            running: Mutex::new(None),
            ctx,
        }
    }

    /// Shared context
    pub fn context(&self) -> &Arc<TunnelContext> {
        &self.ctx
    }

    /// Bind the listener and start the background tasks
    ///
    /// Idempotent: a running service returns the address it is bound to.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            return Ok(running.local_addr);
        }

        let tls = self
            .server_tls
            .to_rustls_config()
            .map_err(|e| Error::certificate(format!("listener TLS configuration: {}", e)))?;
        let listener = TunnelListener::bind(self.ctx.clone(), tls).await?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(listener.run(cancel.clone())),
            tokio::spawn(lifecycle::run_unbound_processing(self.ctx.clone(), cancel.clone())),
            tokio::spawn(lifecycle::run_certificate_renewal(self.ctx.clone(), cancel.clone())),
        ];

        info!(addr = %local_addr, "Tunnel service started");
        *running = Some(Running {
            local_addr,
            cancel,
            tasks,
        });
        Ok(local_addr)
    }

    /// Whether [`start`](Self::start) has run without a matching stop
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Stop accepting, stop the scheduler and shut down every tunnel
    ///
    /// Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        info!("Stopping tunnel service");

        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Tunnel service task ended abnormally");
            }
        }

        let tunnels = self.ctx.registry.all();
        let count = tunnels.len();
        for tunnel in tunnels {
            tunnel.shutdown();
        }
        info!(tunnels = count, "Tunnel service stopped");
    }

    // ========================================================================
    // Admin operations
    // ========================================================================

    /// Display attributes of every registered tunnel, bound first
    pub fn list_tunnels(&self) -> Vec<TunnelInfo> {
        self.ctx.registry.all().iter().map(|t| t.info()).collect()
    }

    /// Bound tunnel for a node
    pub fn find_by_node_id(&self, node_id: u32) -> Option<Arc<Tunnel>> {
        self.ctx.registry.find_by_node_id(node_id)
    }

    /// Registered tunnel by id
    pub fn find_by_id(&self, tunnel_id: u32) -> Option<Arc<Tunnel>> {
        self.ctx.registry.find_by_id(tunnel_id)
    }

    /// Bind an unbound tunnel to a node on behalf of `user_id`
    pub async fn bind_tunnel(&self, tunnel_id: u32, node_id: u32, user_id: u32) -> Result<()> {
        let tunnel = self
            .find_by_id(tunnel_id)
            .ok_or_else(|| Error::not_found("tunnel", tunnel_id))?;
        tunnel.bind(node_id, user_id).await
    }

    /// Revoke a node's tunnel binding
    ///
    /// The node's current certificate stops authenticating, and the tunnel
    /// bound to it, if any, is shut down.
    #[instrument(skip(self))]
    pub async fn unbind_node(&self, node_id: u32, user_id: u32) -> Result<()> {
        let node = self
            .ctx
            .nodes
            .find_by_id(node_id)
            .await?
            .ok_or_else(|| Error::not_found("node", node_id))?;

        self.ctx.nodes.clear_tunnel_binding(node_id).await?;
        self.ctx.audit.record(AuditRecord::new(
            AuditAction::RevokeBinding,
            user_id,
            node_id,
            format!("Agent tunnel binding revoked for node {}", node.name),
        ));

        if let Some(tunnel) = self.find_by_node_id(node_id) {
            info!(tunnel_id = tunnel.id(), "Closing tunnel of unbound node");
            tunnel.shutdown();
        }
        Ok(())
    }
}
