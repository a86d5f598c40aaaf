use super::types::{Node, NodeId};

/// Read-only view of cluster membership used by placement, dispatch and sync.
pub trait MembershipProvider: Send + Sync {
    fn local_node(&self) -> Node;

    /// Members currently considered alive, the local node included.
    fn current_nodes(&self) -> Vec<Node>;

    fn local_node_id(&self) -> NodeId {
        self.local_node().id
    }

    fn get_member(&self, id: &NodeId) -> Option<Node> {
        self.current_nodes().into_iter().find(|node| &node.id == id)
    }
}
