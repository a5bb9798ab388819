/// A conversation: identity, checkout pointer, and the owned graph.
///
/// The conversation record is what the store persists and what the service
/// locks. Mutating operations delegate the structural work to the graph and
/// keep the checkout pointer consistent with it.
use crate::error::ForkyResult;
use crate::graph::ConversationGraph;
use crate::types::{
    BranchInfo, ConversationId, ConversationSummary, GraphView, Node, NodeId, NodeView, Role,
    new_id,
};
use chrono::{DateTime, Utc};
use tracing::info;

/// One conversation and its DAG.
#[derive(Debug, Clone)]
pub struct Conversation {
    /// Opaque identity
    pub id: ConversationId,
    /// Display name
    pub name: String,
    /// When the conversation was created
    pub created_at: DateTime<Utc>,
    /// At most one conversation is active per process (CLI convenience)
    pub is_active: bool,
    /// The checkout pointer; always references a live node
    pub current_node_id: NodeId,
    /// The dialogue DAG
    pub graph: ConversationGraph,
}

impl Conversation {
    /// Create a new conversation with a fresh root; the pointer starts at
    /// the root.
    pub fn new(name: impl Into<String>) -> Self {
        let graph = ConversationGraph::new();
        let current_node_id = graph.root_id().clone();
        let conversation = Self {
            id: new_id(),
            name: name.into(),
            created_at: Utc::now(),
            is_active: false,
            current_node_id,
            graph,
        };
        info!(conversation = %conversation.id, name = %conversation.name, "created conversation");
        conversation
    }

    /// Append a node under `parent_id` and move the pointer to it.
    pub fn append(
        &mut self,
        parent_id: &str,
        role: Role,
        content: impl Into<String>,
        attachments: Vec<String>,
    ) -> ForkyResult<NodeId> {
        let id = self.graph.append(parent_id, role, content, attachments)?;
        self.current_node_id = id.clone();
        Ok(id)
    }

    /// Append a node under the current checkout.
    pub fn append_current(
        &mut self,
        role: Role,
        content: impl Into<String>,
        attachments: Vec<String>,
    ) -> ForkyResult<NodeId> {
        let parent = self.current_node_id.clone();
        self.append(&parent, role, content, attachments)
    }

    /// Insert a fork marker under `from_id` and move the pointer to it.
    /// The next append begins the divergent chain.
    pub fn fork(&mut self, from_id: &str, branch_name: &str) -> ForkyResult<NodeId> {
        let marker = self.graph.fork(from_id, branch_name)?;
        self.current_node_id = marker.clone();
        Ok(marker)
    }

    /// Move the pointer to a node id or branch name.
    pub fn checkout(&mut self, identifier: &str) -> ForkyResult<NodeId> {
        let target = self.graph.resolve_identifier(identifier)?;
        info!(conversation = %self.id, node = %target, "checkout");
        self.current_node_id = target.clone();
        Ok(target)
    }

    /// Linearized history from the root to the current checkout, fork
    /// markers filtered.
    pub fn history_to_current(&self) -> ForkyResult<Vec<Node>> {
        self.graph.history(&self.current_node_id)
    }

    /// Delete a node; children inherit its parents, and the pointer falls
    /// back to the node's first surviving parent when it pointed at the
    /// deleted node.
    pub fn delete_node(&mut self, node_id: &str) -> ForkyResult<()> {
        if let Some(new_current) = self.graph.delete_node(node_id, &self.current_node_id)? {
            info!(conversation = %self.id, node = %node_id, fallback = %new_current,
                "deleted current node, pointer repositioned");
            self.current_node_id = new_current;
        }
        Ok(())
    }

    /// Branch label to display for the current checkout: the branch name of
    /// the nearest fork marker on the primary ancestor chain, if any.
    pub fn current_branch_name(&self) -> Option<String> {
        let mut current = self.current_node_id.as_str();
        loop {
            let node = self.graph.node(current)?;
            if let Some(name) = &node.branch_name {
                return Some(name.clone());
            }
            current = node.parent_ids.first()?.as_str();
        }
    }

    /// Named branch points in this conversation.
    pub fn branches(&self) -> Vec<BranchInfo> {
        self.graph.branches()
    }

    /// One-row summary for listings.
    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
            is_active: self.is_active,
            node_count: self.graph.node_count(),
            last_activity: self.graph.last_activity(),
            branch: self.current_branch_name(),
        }
    }

    /// Whole-graph projection for rendering.
    pub fn graph_view(&self) -> GraphView {
        let mut nodes: Vec<NodeView> = self
            .graph
            .nodes()
            .map(|node| NodeView {
                id: node.id.clone(),
                role: node.role,
                content: node.content.clone(),
                parent_ids: node.parent_ids.clone(),
                branch_name: node.branch_name.clone(),
                is_current: node.id == self.current_node_id,
            })
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        GraphView {
            nodes,
            current_node_id: self.current_node_id.clone(),
        }
    }
}
