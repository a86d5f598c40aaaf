use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
}

/// Declared capability of a node. Placement reads these.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    ClusterManager,
    Data,
    Ml,
    Ingest,
}

impl FromStr for NodeRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cluster_manager" | "cluster-manager" | "master" => Ok(NodeRole::ClusterManager),
            "data" => Ok(NodeRole::Data),
            "ml" => Ok(NodeRole::Ml),
            "ingest" => Ok(NodeRole::Ingest),
            other => Err(format!("unknown node role: {}", other)),
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeRole::ClusterManager => "cluster_manager",
            NodeRole::Data => "data",
            NodeRole::Ml => "ml",
            NodeRole::Ingest => "ingest",
        };
        f.write_str(name)
    }
}

/// Represents a single member in the cluster.
///
/// Contains identity, declared roles, network addressing, and current lifecycle state.
/// The `incarnation` field is a logical clock used to order updates and resolve conflicts
/// (e.g., refuting a false "Suspect" claim).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub roles: BTreeSet<NodeRole>,
    /// Optional placement tag.
    pub group: Option<String>,
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub state: NodeState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

impl Node {
    pub fn is_alive(&self) -> bool {
        self.state == NodeState::Alive
    }

    pub fn has_role(&self, role: NodeRole) -> bool {
        self.roles.contains(&role)
    }

    /// True for a node that only coordinates the cluster and holds no data or models.
    pub fn is_cluster_manager_only(&self) -> bool {
        self.roles.len() == 1 && self.has_role(NodeRole::ClusterManager)
    }
}

/// What the local process says about itself when it joins.
#[derive(Debug, Clone)]
pub struct LocalNodeSpec {
    pub name: String,
    pub roles: BTreeSet<NodeRole>,
    pub group: Option<String>,
    pub http_addr: SocketAddr,
}

/// The wire protocol for inter-node communication.
///
/// - `Ping/Ack`: Used for liveness checks and state synchronization.
/// - `Join`: Sent by new nodes to seed nodes to enter the cluster.
/// - `Suspect/Alive`: Disseminates changes in node health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        node: Node,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
    },

    Join {
        node: Node,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },
}

/// Topology changes published to interested components (the sync reconciler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeJoined(NodeId),
    NodeDead(NodeId),
}
