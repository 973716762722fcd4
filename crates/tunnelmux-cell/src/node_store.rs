//! Node store interface
//!
//! The tunnel server does not own node records. It looks them up, creates
//! unmanaged ones for auto-registered agents, and persists the tunnel
//! binding (tunnel GUID and certificate subject) on them.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use tunnelmux_common::{Error, Result};

/// A managed node record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    /// Node id (non-zero)
    pub id: u32,
    /// Persistent node GUID, written as OU of issued certificates
    pub guid: Uuid,
    /// Display name
    pub name: String,
    /// Primary host name
    pub primary_host_name: String,
    /// Primary IP address
    pub address: Option<IpAddr>,
    /// Zone UIN
    pub zone_uin: i32,
    /// Agent GUID last reported for this node; nil if unknown
    pub agent_id: Uuid,
    /// Tunnel GUID of the currently valid agent certificate; nil if none
    pub tunnel_id: Uuid,
    /// Subject of the currently valid agent certificate
    pub cert_subject: Option<String>,
}

impl Node {
    /// Node with a fresh GUID and no binding
    pub fn new(id: u32, name: impl Into<String>, zone_uin: i32) -> Self {
        let name = name.into();
        Self {
            id,
            guid: Uuid::new_v4(),
            primary_host_name: name.clone(),
            name,
            address: None,
            zone_uin,
            agent_id: Uuid::nil(),
            tunnel_id: Uuid::nil(),
            cert_subject: None,
        }
    }
}

/// Parameters for an auto-created node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNode {
    /// Node name (the agent's advertised system name)
    pub name: String,
    /// Primary address
    pub address: IpAddr,
    /// Zone UIN of the tunnel
    pub zone_uin: i32,
    /// Agent GUID of the tunnel
    pub agent_id: Uuid,
    /// Container the node is attached under
    pub container: Option<String>,
}

impl NewNode {
    /// Unmanaged node with the unspecified address
    pub fn unmanaged(name: impl Into<String>, zone_uin: i32, agent_id: Uuid) -> Self {
        Self {
            name: name.into(),
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            zone_uin,
            agent_id,
            container: None,
        }
    }
}

/// What an agent reachable over the legacy (non-tunnel) protocol reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyAgentInfo {
    /// Agent version string
    pub agent_version: String,
    /// System name
    pub system_name: String,
    /// Fully qualified domain name
    pub fqdn: String,
}

/// Node record storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Look up a node by id
    async fn find_by_id(&self, node_id: u32) -> Result<Option<Node>>;

    /// Look up a node by its persistent GUID
    async fn find_by_guid(&self, guid: Uuid) -> Result<Option<Node>>;

    /// All nodes in a zone
    async fn nodes_in_zone(&self, zone_uin: i32) -> Result<Vec<Node>>;

    /// Info from the node's legacy agent connection, if it has one
    async fn legacy_agent_info(&self, node_id: u32) -> Result<Option<LegacyAgentInfo>>;

    /// Persist the tunnel GUID and certificate subject on a node
    async fn set_tunnel_binding(
        &self,
        node_id: u32,
        tunnel_guid: Uuid,
        cert_subject: &str,
    ) -> Result<()>;

    /// Remove any tunnel binding from a node
    async fn clear_tunnel_binding(&self, node_id: u32) -> Result<()>;

    /// Create an unmanaged node
    async fn create_node(&self, node: NewNode) -> Result<Node>;
}

/// Shared node store handle
pub type SharedNodeStore = Arc<dyn NodeStore>;

/// Node store kept in process memory
#[derive(Default)]
pub struct InMemoryNodeStore {
    nodes: RwLock<HashMap<u32, Node>>,
    legacy: RwLock<HashMap<u32, LegacyAgentInfo>>,
    containers: RwLock<HashMap<String, Vec<u32>>>,
    next_id: AtomicU32,
}

impl InMemoryNodeStore {
    /// Empty store; auto-created nodes get ids from 1000 upwards
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1000),
            ..Default::default()
        }
    }

    /// Insert or replace a node
    pub fn insert(&self, node: Node) {
        self.nodes.write().insert(node.id, node);
    }

    /// Snapshot of a node
    pub fn get(&self, node_id: u32) -> Option<Node> {
        self.nodes.read().get(&node_id).cloned()
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    /// Make a node look reachable over the legacy agent protocol
    pub fn set_legacy_agent_info(&self, node_id: u32, info: LegacyAgentInfo) {
        self.legacy.write().insert(node_id, info);
    }

    /// Node ids attached under a container
    pub fn container_members(&self, container: &str) -> Vec<u32> {
        self.containers
            .read()
            .get(container)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl NodeStore for InMemoryNodeStore {
    async fn find_by_id(&self, node_id: u32) -> Result<Option<Node>> {
        Ok(self.get(node_id))
    }

    async fn find_by_guid(&self, guid: Uuid) -> Result<Option<Node>> {
        Ok(self.nodes.read().values().find(|n| n.guid == guid).cloned())
    }

    async fn nodes_in_zone(&self, zone_uin: i32) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.zone_uin == zone_uin)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    async fn legacy_agent_info(&self, node_id: u32) -> Result<Option<LegacyAgentInfo>> {
        Ok(self.legacy.read().get(&node_id).cloned())
    }

    async fn set_tunnel_binding(
        &self,
        node_id: u32,
        tunnel_guid: Uuid,
        cert_subject: &str,
    ) -> Result<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(&node_id)
            .ok_or_else(|| Error::not_found("node", node_id))?;
        node.tunnel_id = tunnel_guid;
        node.cert_subject = Some(cert_subject.to_string());
        Ok(())
    }

    async fn clear_tunnel_binding(&self, node_id: u32) -> Result<()> {
        let mut nodes = self.nodes.write();
        let node = nodes
            .get_mut(&node_id)
            .ok_or_else(|| Error::not_found("node", node_id))?;
        node.tunnel_id = Uuid::nil();
        node.cert_subject = None;
        Ok(())
    }

    async fn create_node(&self, new: NewNode) -> Result<Node> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let node = Node {
            id,
            guid: Uuid::new_v4(),
            primary_host_name: new.name.clone(),
            name: new.name,
            address: Some(new.address),
            zone_uin: new.zone_uin,
            agent_id: new.agent_id,
            tunnel_id: Uuid::nil(),
            cert_subject: None,
        };
        self.nodes.write().insert(id, node.clone());
        if let Some(container) = new.container {
            self.containers.write().entry(container).or_default().push(id);
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_binding_roundtrip() {
        let store = InMemoryNodeStore::new();
        store.insert(Node::new(42, "node-42", 0));
        let tunnel = Uuid::new_v4();

        store
            .set_tunnel_binding(42, tunnel, "OU=x,CN=y")
            .await
            .expect("binding should be stored");
        let node = store.get(42).expect("node should exist");
        assert_eq!(node.tunnel_id, tunnel);
        assert_eq!(node.cert_subject.as_deref(), Some("OU=x,CN=y"));

        store
            .clear_tunnel_binding(42)
            .await
            .expect("binding should be cleared");
        let node = store.get(42).expect("node should exist");
        assert!(node.tunnel_id.is_nil());
        assert!(node.cert_subject.is_none());
    }

    #[tokio::test]
    async fn test_binding_unknown_node_is_not_found() {
        let store = InMemoryNodeStore::new();
        let err = store
            .set_tunnel_binding(7, Uuid::new_v4(), "CN=x")
            .await
            .expect_err("unknown node should fail");
        assert!(matches!(err, Error::InvalidArgument { not_found: true, .. }));
    }

    #[tokio::test]
    async fn test_create_node_attaches_to_container() {
        let store = InMemoryNodeStore::new();
        let agent = Uuid::new_v4();
        let mut new = NewNode::unmanaged("node-a", 3, agent);
        new.container = Some("Agents".to_string());

        let node = store.create_node(new).await.expect("create should succeed");
        assert_eq!(node.name, "node-a");
        assert_eq!(node.zone_uin, 3);
        assert_eq!(node.agent_id, agent);
        assert_eq!(node.address, Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        assert_eq!(store.container_members("Agents"), vec![node.id]);

        let found = store
            .find_by_guid(node.guid)
            .await
            .expect("lookup should succeed");
        assert_eq!(found.map(|n| n.id), Some(node.id));
    }

    #[tokio::test]
    async fn test_nodes_in_zone_filters() {
        let store = InMemoryNodeStore::new();
        store.insert(Node::new(1, "a", 0));
        store.insert(Node::new(2, "b", 1));
        store.insert(Node::new(3, "c", 0));

        let ids: Vec<u32> = store
            .nodes_in_zone(0)
            .await
            .expect("lookup should succeed")
            .into_iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
