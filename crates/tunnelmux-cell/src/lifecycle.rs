//! Periodic tunnel maintenance
//!
//! Two loops run for the lifetime of the service. One acts on unbound
//! tunnels that have idled past the configured timeout, the other renews
//! agent certificates that are close to expiry.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnelmux_common::config::UnboundTunnelAction;
use tunnelmux_common::{Result, CERT_RENEWAL_WINDOW};

use crate::context::TunnelContext;
use crate::events::{TunnelEvent, TunnelEventKind};
use crate::node_store::{LegacyAgentInfo, NewNode, Node};
use crate::tunnel::{unix_now, Tunnel, TunnelInfo, TunnelState};

// ============================================================================
// Loops
// ============================================================================

/// Process unbound tunnels every `unbound_check_interval` until cancelled
///
/// Returns immediately when no unbound timeout is configured.
pub async fn run_unbound_processing(ctx: Arc<TunnelContext>, cancel: CancellationToken) {
    if ctx.config.unbound_tunnel_timeout.is_none() {
        info!("Unbound tunnel processing disabled");
        return;
    }
    run_periodic(ctx.config.unbound_check_interval, cancel, || {
        process_unbound_tunnels(&ctx)
    })
    .await;
}

/// Renew expiring certificates every `certificate_renewal_interval` until cancelled
pub async fn run_certificate_renewal(ctx: Arc<TunnelContext>, cancel: CancellationToken) {
    run_periodic(ctx.config.certificate_renewal_interval, cancel, || {
        renew_expiring_certificates(&ctx)
    })
    .await;
}

async fn run_periodic<F, Fut>(period: Duration, cancel: CancellationToken, mut task: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = task() => {}
        }
    }
}

// ============================================================================
// Unbound tunnels
// ============================================================================

/// Apply the configured action to every unbound tunnel past its idle timeout
pub async fn process_unbound_tunnels(ctx: &TunnelContext) {
    let Some(timeout) = ctx.config.unbound_tunnel_timeout else {
        return;
    };
    let now = unix_now();
    let expired: Vec<Arc<Tunnel>> = ctx
        .registry
        .unbound()
        .into_iter()
        .filter(|t| t.state() == TunnelState::Unbound)
        .filter(|t| t.start_time() + timeout.as_secs() as i64 <= now)
        .collect();
    if expired.is_empty() {
        return;
    }

    let action = ctx.config.unbound_tunnel_action;
    debug!(count = expired.len(), ?action, "Processing idle unbound tunnels");
    join_all(expired.iter().map(|tunnel| process_unbound_tunnel(ctx, tunnel, action))).await;
}

async fn process_unbound_tunnel(ctx: &TunnelContext, tunnel: &Arc<Tunnel>, action: UnboundTunnelAction) {
    match action {
        UnboundTunnelAction::Reset => {
            info!(tunnel_id = tunnel.id(), "Unbound tunnel idle timeout, closing");
            tunnel.shutdown();
        }
        UnboundTunnelAction::GenerateEvent => {
            ctx.events
                .post(TunnelEvent::new(TunnelEventKind::Unbound, tunnel.info()));
            tunnel.reset_start_time();
        }
        UnboundTunnelAction::BindToExistingNode | UnboundTunnelAction::BindOrCreateNode => {
            if let Err(e) = auto_bind(ctx, tunnel, action).await {
                warn!(tunnel_id = tunnel.id(), error = %e, "Automatic bind failed");
            }
        }
    }
}

async fn auto_bind(ctx: &TunnelContext, tunnel: &Arc<Tunnel>, action: UnboundTunnelAction) -> Result<()> {
    let info = tunnel.info();
    let candidates = find_candidates(ctx, &info, tunnel.peer_addr().ip()).await?;

    let node_id = match candidates.as_slice() {
        [node] => {
            info!(tunnel_id = info.id, node_id = node.id, "Found matching node for unbound tunnel");
            node.id
        }
        [] if action == UnboundTunnelAction::BindOrCreateNode => {
            let node = ctx.nodes.create_node(new_node_for(ctx, &info, tunnel.peer_addr().ip())).await?;
            info!(tunnel_id = info.id, node_id = node.id, name = %node.name, "Created node for unbound tunnel");
            node.id
        }
        [] => {
            debug!(tunnel_id = info.id, "No matching node for unbound tunnel");
            return Ok(());
        }
        nodes => {
            warn!(
                tunnel_id = info.id,
                candidates = ?nodes.iter().map(|n| n.id).collect::<Vec<_>>(),
                "Multiple nodes match unbound tunnel, not binding"
            );
            tunnel.reset_start_time();
            return Ok(());
        }
    };

    tunnel.bind(node_id, 0).await
}

fn new_node_for(ctx: &TunnelContext, info: &TunnelInfo, peer: IpAddr) -> NewNode {
    let name = [&info.system_name, &info.hostname]
        .into_iter()
        .find(|s| !s.is_empty())
        .cloned()
        .unwrap_or_else(|| peer.to_string());
    let mut node = NewNode::unmanaged(name, info.zone_uin, info.agent_id);
    node.container = ctx.config.new_nodes_container.clone();
    node
}

async fn find_candidates(ctx: &TunnelContext, info: &TunnelInfo, peer: IpAddr) -> Result<Vec<Node>> {
    let mut candidates = Vec::new();
    for node in ctx.nodes.nodes_in_zone(info.zone_uin).await? {
        match match_node(info, peer, &node) {
            None => continue,
            Some(NodeMatch::AgentId) => {}
            Some(NodeMatch::AddressOrName) => {
                if !legacy_agent_allows(ctx, info, &node).await {
                    continue;
                }
            }
        }
        candidates.push(node);
    }
    Ok(candidates)
}

/// Cross-check an address or name match against the node's legacy agent, if one answers
async fn legacy_agent_allows(ctx: &TunnelContext, info: &TunnelInfo, node: &Node) -> bool {
    match ctx.nodes.legacy_agent_info(node.id).await {
        Ok(Some(legacy)) if !legacy_agent_agrees(info, &legacy) => {
            debug!(tunnel_id = info.id, node_id = node.id, "Legacy agent on node disagrees with tunnel");
            false
        }
        Ok(_) => true,
        Err(e) => {
            warn!(tunnel_id = info.id, node_id = node.id, error = %e, "Legacy agent query failed, skipping node");
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeMatch {
    AgentId,
    AddressOrName,
}

/// Whether an unbound tunnel plausibly belongs to a node
pub fn matches_node(info: &TunnelInfo, peer: IpAddr, node: &Node) -> bool {
    match_node(info, peer, node).is_some()
}

fn match_node(info: &TunnelInfo, peer: IpAddr, node: &Node) -> Option<NodeMatch> {
    if node.zone_uin != info.zone_uin {
        return None;
    }
    if !info.agent_id.is_nil() && node.agent_id == info.agent_id {
        return Some(NodeMatch::AgentId);
    }
    if node.address == Some(peer) {
        return Some(NodeMatch::AddressOrName);
    }
    let names = [&node.primary_host_name, &node.name];
    [&info.hostname, &info.system_name]
        .into_iter()
        .filter(|s| !s.is_empty())
        .any(|s| names.iter().any(|n| n.eq_ignore_ascii_case(s)))
        .then_some(NodeMatch::AddressOrName)
}

fn legacy_agent_agrees(info: &TunnelInfo, legacy: &LegacyAgentInfo) -> bool {
    legacy.agent_version == info.agent_version
        && legacy.system_name == info.system_name
        && legacy.fqdn == info.hostname
}

// ============================================================================
// Certificate renewal
// ============================================================================

/// Renew the certificate of every bound tunnel expiring within the renewal window
pub async fn renew_expiring_certificates(ctx: &TunnelContext) {
    renew_expiring_at(ctx, unix_now()).await;
}

pub(crate) async fn renew_expiring_at(ctx: &TunnelContext, now: i64) {
    let window = CERT_RENEWAL_WINDOW.as_secs() as i64;
    let expiring: Vec<Arc<Tunnel>> = ctx
        .registry
        .bound()
        .into_iter()
        .filter(|t| t.state() == TunnelState::Bound)
        .filter(|t| t.cert_expiration() != 0 && t.cert_expiration() - now <= window)
        .collect();
    if expiring.is_empty() {
        return;
    }

    info!(count = expiring.len(), "Renewing expiring agent certificates");
    join_all(expiring.iter().map(|tunnel| async move {
        if let Err(e) = tunnel.renew_certificate().await {
            warn!(tunnel_id = tunnel.id(), error = %e, "Certificate renewal failed");
        }
    }))
    .await;
}
