/// Conversation graph: the DAG of dialogue.
///
/// This module implements the per-conversation graph structure. Every
/// committed turn is a node; edges run parent → child and are derived from
/// each node's ordered parent list. The graph starts as a chain, becomes a
/// tree on the first fork, and becomes a DAG on the first merge.
///
/// ## Key Operations
///
/// - `append` / `fork` / `insert_merge`: grow the graph
/// - `ancestor_set` / `descendant_set`: reachability queries
/// - `lca`: lowest common ancestor with deterministic tie-breaking
/// - `history`: linearize one ancestor chain, root-first
/// - `resolve_identifier`: checkout resolution by node id or branch name
/// - `delete_node`: remove a node, rewiring its children to its parents
/// - `validate`: the structural invariants, checked on load
///
/// ## Ordinals
///
/// Parent lists are ordered. Position 0 is the left (primary) parent: the
/// edge that `history` follows through a merge node, so that linearization
/// is deterministic through multi-parent regions of the graph.
use crate::error::{ForkyError, ForkyResult};
use crate::types::{BranchInfo, Node, NodeId, Role};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// The DAG of one conversation.
///
/// All traversals are BFS with a visited set, O(|V|+|E|). Conversation
/// graphs are small (hundreds of nodes), so there is no secondary indexing;
/// callers that issue several ancestry queries against the same snapshot
/// (the merge pipeline) reuse `ancestor_set` results instead.
#[derive(Debug, Clone)]
pub struct ConversationGraph {
    /// All nodes, indexed by id
    nodes: HashMap<NodeId, Node>,

    /// For each node, its children (derived from parent lists)
    children: HashMap<NodeId, Vec<NodeId>>,

    /// The unique parentless node
    root_id: NodeId,
}

/// Ordering key used by every tie-break in this module: newest first,
/// lexicographically greatest id first among equals.
fn created_key(node: &Node) -> (DateTime<Utc>, &str) {
    (node.created_at, node.id.as_str())
}

impl ConversationGraph {
    /// Create a new graph containing only the root node.
    pub fn new() -> Self {
        let root = Node::root();
        let root_id = root.id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(root_id.clone(), root);
        Self {
            nodes,
            children: HashMap::new(),
            root_id,
        }
    }

    /// Rebuild a graph from a persisted node table.
    ///
    /// Every structural invariant is checked; any violation is reported as
    /// `CorruptStore` so the caller can fail the load as a whole.
    pub fn from_nodes(node_list: Vec<Node>) -> ForkyResult<Self> {
        let mut nodes: HashMap<NodeId, Node> = HashMap::with_capacity(node_list.len());
        for node in node_list {
            if nodes.insert(node.id.clone(), node).is_some() {
                return Err(ForkyError::CorruptStore {
                    reason: "duplicate node id in snapshot".to_string(),
                });
            }
        }

        let mut children: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for node in nodes.values() {
            for parent in &node.parent_ids {
                children
                    .entry(parent.clone())
                    .or_default()
                    .push(node.id.clone());
            }
        }

        let mut roots = nodes.values().filter(|n| n.is_root());
        let root_id = match (roots.next(), roots.next()) {
            (Some(root), None) => root.id.clone(),
            (None, _) => {
                return Err(ForkyError::CorruptStore {
                    reason: "conversation has no root node".to_string(),
                })
            }
            (Some(_), Some(_)) => {
                return Err(ForkyError::CorruptStore {
                    reason: "conversation has more than one root node".to_string(),
                })
            }
        };

        let graph = Self {
            nodes,
            children,
            root_id,
        };
        graph.validate()?;
        Ok(graph)
    }

    /// The root node's id.
    pub fn root_id(&self) -> &NodeId {
        &self.root_id
    }

    /// Look up a node.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Look up a node, failing with `UnknownNode`.
    pub fn get(&self, id: &str) -> ForkyResult<&Node> {
        self.nodes.get(id).ok_or_else(|| ForkyError::UnknownNode {
            id: id.to_string(),
        })
    }

    /// Check whether a node exists.
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Iterate over all nodes, in no particular order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges in the graph.
    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|n| n.parent_ids.len()).sum()
    }

    /// Timestamp of the most recently created node.
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.nodes.values().map(|n| n.created_at).max()
    }

    /// Append an ordinary node under `parent_id`.
    ///
    /// Fails with `InvalidParent` if the parent is missing.
    pub fn append(
        &mut self,
        parent_id: &str,
        role: Role,
        content: impl Into<String>,
        attachments: Vec<String>,
    ) -> ForkyResult<NodeId> {
        if !self.contains(parent_id) {
            return Err(ForkyError::InvalidParent {
                parent_id: parent_id.to_string(),
            });
        }
        let mut node = Node::child_of(parent_id.to_string(), role, content);
        node.attachments = attachments;
        let id = node.id.clone();
        self.insert(node);
        debug!(node = %id, parent = %parent_id, %role, "appended node");
        Ok(id)
    }

    /// Insert a `<FORK>` marker under `from_id` recording a named branch
    /// point.
    pub fn fork(&mut self, from_id: &str, branch_name: &str) -> ForkyResult<NodeId> {
        if !self.contains(from_id) {
            return Err(ForkyError::InvalidParent {
                parent_id: from_id.to_string(),
            });
        }
        let marker = Node::fork_marker(from_id.to_string(), branch_name);
        let id = marker.id.clone();
        self.insert(marker);
        debug!(marker = %id, from = %from_id, branch = %branch_name, "forked");
        Ok(id)
    }

    /// Insert a merge node joining `left_id` and `right_id`.
    ///
    /// Eligibility is the merge executor's concern; the graph only requires
    /// that both parents exist and differ.
    pub fn insert_merge(
        &mut self,
        left_id: &str,
        right_id: &str,
        content: impl Into<String>,
        lca_id: NodeId,
        conflicts: Vec<crate::types::ConflictRecord>,
    ) -> ForkyResult<NodeId> {
        debug_assert_ne!(left_id, right_id, "merge parents must differ");
        for parent in [left_id, right_id] {
            if !self.contains(parent) {
                return Err(ForkyError::InvalidParent {
                    parent_id: parent.to_string(),
                });
            }
        }
        let node = Node::merge(
            left_id.to_string(),
            right_id.to_string(),
            content,
            lca_id,
            conflicts,
        );
        let id = node.id.clone();
        self.insert(node);
        debug!(merge = %id, left = %left_id, right = %right_id, "inserted merge node");
        Ok(id)
    }

    fn insert(&mut self, node: Node) {
        for parent in &node.parent_ids {
            self.children
                .entry(parent.clone())
                .or_default()
                .push(node.id.clone());
        }
        self.nodes.insert(node.id.clone(), node);
    }

    /// All ancestors of a node, including the node itself.
    pub fn ancestor_set(&self, id: &str) -> HashSet<NodeId> {
        self.reachable(id, |node_id| {
            self.nodes
                .get(node_id)
                .map(|n| n.parent_ids.clone())
                .unwrap_or_default()
        })
    }

    /// All descendants of a node, including the node itself.
    pub fn descendant_set(&self, id: &str) -> HashSet<NodeId> {
        self.reachable(id, |node_id| {
            self.children.get(node_id).cloned().unwrap_or_default()
        })
    }

    fn reachable(&self, id: &str, next: impl Fn(&str) -> Vec<NodeId>) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        if !self.contains(id) {
            return seen;
        }
        let mut queue = VecDeque::new();
        seen.insert(id.to_string());
        queue.push_back(id.to_string());
        while let Some(current) = queue.pop_front() {
            for neighbor in next(&current) {
                if seen.insert(neighbor.clone()) {
                    queue.push_back(neighbor);
                }
            }
        }
        seen
    }

    /// Whether `a` is an ancestor of `b` (every node is its own ancestor).
    pub fn is_ancestor(&self, a: &str, b: &str) -> bool {
        self.ancestor_set(b).contains(a)
    }

    /// Lowest common ancestor of `a` and `b`.
    ///
    /// Among the common ancestors, the candidates are those with no
    /// descendant also in the common set; ties are broken by highest
    /// `created_at`, then lexicographic id order, yielding a single
    /// canonical answer. Returns `None` only when the nodes share no
    /// ancestor, which a valid single-rooted conversation cannot produce
    /// but corrupted input can.
    pub fn lca(&self, a: &str, b: &str) -> Option<NodeId> {
        if !self.contains(a) || !self.contains(b) {
            return None;
        }
        let ancestors_a = self.ancestor_set(a);
        let ancestors_b = self.ancestor_set(b);
        self.lca_from_sets(&ancestors_a, &ancestors_b)
    }

    /// LCA computed from precomputed ancestor sets.
    ///
    /// The merge pipeline computes each side's ancestor set once and feeds
    /// it to every check that needs one, rather than re-walking the graph.
    pub fn lca_from_sets(
        &self,
        ancestors_a: &HashSet<NodeId>,
        ancestors_b: &HashSet<NodeId>,
    ) -> Option<NodeId> {
        let common: HashSet<&NodeId> = ancestors_a.intersection(ancestors_b).collect();
        if common.is_empty() {
            return None;
        }

        // Ancestor sets are closed under taking parents, so the common set
        // is too; a member is non-minimal exactly when one of its direct
        // children is also common.
        common
            .iter()
            .filter(|id| {
                self.children
                    .get(id.as_str())
                    .map(|ch| !ch.iter().any(|c| common.contains(c)))
                    .unwrap_or(true)
            })
            .filter_map(|id| self.nodes.get(id.as_str()))
            .max_by_key(|node| created_key(node))
            .map(|node| node.id.clone())
    }

    /// Resolve a checkout identifier to a node id.
    ///
    /// A node id wins outright. Otherwise the identifier is treated as a
    /// branch name: the most recent matching fork marker is selected
    /// (highest `created_at`, ties by id), and if the marker has any
    /// descendants the result is the branch tip, else the marker itself.
    pub fn resolve_identifier(&self, identifier: &str) -> ForkyResult<NodeId> {
        if self.contains(identifier) {
            return Ok(identifier.to_string());
        }

        let marker = self
            .nodes
            .values()
            .filter(|n| n.is_fork_marker() && n.branch_name.as_deref() == Some(identifier))
            .max_by_key(|node| created_key(node));

        match marker {
            Some(marker) => Ok(self.branch_tip(&marker.id)),
            None => Err(ForkyError::UnknownIdentifier {
                identifier: identifier.to_string(),
            }),
        }
    }

    /// The deepest node reached from `start` by repeatedly taking the
    /// latest-created child (ties by id).
    pub fn branch_tip(&self, start: &str) -> NodeId {
        let mut current = start.to_string();
        let mut seen = HashSet::new();
        seen.insert(current.clone());
        loop {
            let next = self
                .children
                .get(&current)
                .into_iter()
                .flatten()
                .filter_map(|id| self.nodes.get(id))
                .max_by_key(|node| created_key(node));
            match next {
                Some(child) => {
                    // The seen-guard only trips on corrupted (cyclic) input.
                    if !seen.insert(child.id.clone()) {
                        return current;
                    }
                    current = child.id.clone();
                }
                None => return current,
            }
        }
    }

    /// All fork markers carrying a branch name, as branch listings.
    pub fn branches(&self) -> Vec<BranchInfo> {
        let mut markers: Vec<&Node> = self
            .nodes
            .values()
            .filter(|n| n.is_fork_marker() && n.branch_name.is_some())
            .collect();
        markers.sort_by(|a, b| created_key(a).cmp(&created_key(b)));
        markers
            .into_iter()
            .map(|marker| BranchInfo {
                name: marker.branch_name.clone().unwrap_or_default(),
                marker_id: marker.id.clone(),
                tip_id: self.branch_tip(&marker.id),
            })
            .collect()
    }

    /// Linearize the history of `node_id`, root-first.
    ///
    /// The path walks parents backward, taking the ordinal-0 (left) parent
    /// at every multi-parent node; the other parent of a merge contributes
    /// context only through the merge node's content. `<FORK>` markers are
    /// filtered out: they are graph structure, not dialogue.
    pub fn history(&self, node_id: &str) -> ForkyResult<Vec<Node>> {
        let mut path = Vec::new();
        let mut seen = HashSet::new();
        let mut current = node_id.to_string();
        loop {
            if !seen.insert(current.clone()) {
                return Err(ForkyError::CorruptStore {
                    reason: format!("cycle through '{current}' while linearizing history"),
                });
            }
            let node = self.get(&current)?;
            path.push(node.clone());
            match node.parent_ids.first() {
                Some(parent) => current = parent.clone(),
                None => break,
            }
        }
        path.reverse();
        path.retain(|node| !node.is_fork_marker());
        Ok(path)
    }

    /// Delete a node, rewiring its children onto its parents.
    ///
    /// Each child's parent list has the deleted id replaced in place by the
    /// deleted node's parents (ordinal order preserved, duplicates
    /// collapsed to the first occurrence). The root is undeletable. When
    /// `current` is the deleted node the checkout pointer falls back to the
    /// deleted node's first surviving parent; `Some(new_current)` reports
    /// the move. The graph is only mutated once every rewired parent list
    /// has been checked, so a failed delete leaves it untouched.
    pub fn delete_node(&mut self, id: &str, current: &str) -> ForkyResult<Option<NodeId>> {
        let node = self.get(id)?;
        if node.is_root() {
            return Err(ForkyError::CannotDeleteRoot);
        }
        let inherited = node.parent_ids.clone();

        let new_current = if current == id {
            match inherited.first() {
                Some(parent) => Some(parent.clone()),
                None => {
                    return Err(ForkyError::CannotDeleteCurrent { id: id.to_string() });
                }
            }
        } else {
            None
        };

        // Plan the rewiring before touching anything.
        let child_ids = self.children.get(id).cloned().unwrap_or_default();
        let mut rewired: Vec<(NodeId, Vec<NodeId>)> = Vec::with_capacity(child_ids.len());
        for child_id in &child_ids {
            let child = self.get(child_id)?;
            // Fork markers stay single-parent: they inherit only the
            // deleted node's primary parent.
            let inherit_for_child = if child.is_fork_marker() {
                &inherited[..1]
            } else {
                &inherited[..]
            };
            let mut parents = Vec::with_capacity(child.parent_ids.len() + inherited.len());
            for parent in &child.parent_ids {
                if parent == id {
                    for grandparent in inherit_for_child {
                        if !parents.contains(grandparent) {
                            parents.push(grandparent.clone());
                        }
                    }
                } else if !parents.contains(parent) {
                    parents.push(parent.clone());
                }
            }
            if parents.is_empty() {
                return Err(ForkyError::CannotDeleteCurrent { id: id.to_string() });
            }
            rewired.push((child_id.clone(), parents));
        }

        // Commit: children inherit, adjacency follows the rewired lists,
        // node goes away.
        for (child_id, parents) in &rewired {
            if let Some(child) = self.nodes.get_mut(child_id) {
                child.parent_ids = parents.clone();
            }
        }
        self.children.remove(id);
        for parent in &inherited {
            if let Some(list) = self.children.get_mut(parent) {
                list.retain(|existing| existing != id);
            }
        }
        for (child_id, parents) in &rewired {
            for parent in parents {
                let list = self.children.entry(parent.clone()).or_default();
                if !list.contains(child_id) {
                    list.push(child_id.clone());
                }
            }
        }
        self.nodes.remove(id);
        debug!(node = %id, children = child_ids.len(), "deleted node");
        Ok(new_current)
    }

    /// Kahn's algorithm over the whole graph.
    ///
    /// Fails with `CorruptStore` if the edges contain a cycle.
    pub fn topological_order(&self) -> ForkyResult<Vec<NodeId>> {
        let mut indegree: HashMap<&str, usize> = self
            .nodes
            .values()
            .map(|n| (n.id.as_str(), n.parent_ids.len()))
            .collect();
        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(current) = queue.pop_front() {
            order.push(current.to_string());
            for child in self.children.get(current).into_iter().flatten() {
                if let Some(degree) = indegree.get_mut(child.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child.as_str());
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(ForkyError::CorruptStore {
                reason: "conversation graph contains a cycle".to_string(),
            });
        }
        Ok(order)
    }

    /// Check every structural invariant.
    ///
    /// Called on load and usable by tests after any mutation sequence:
    /// unique root, all parent references live and duplicate-free,
    /// acyclicity, marker shape, and merge-node shape. Merge metadata may
    /// reference ancestors that later deletions removed; only live
    /// references are checked.
    pub fn validate(&self) -> ForkyResult<()> {
        let mut root_count = 0usize;
        for node in self.nodes.values() {
            if node.is_root() {
                root_count += 1;
            }
            let mut seen_parents = HashSet::new();
            for parent in &node.parent_ids {
                if !self.nodes.contains_key(parent) {
                    return Err(ForkyError::CorruptStore {
                        reason: format!("node '{}' references missing parent '{parent}'", node.id),
                    });
                }
                if !seen_parents.insert(parent) {
                    return Err(ForkyError::CorruptStore {
                        reason: format!("node '{}' lists parent '{parent}' twice", node.id),
                    });
                }
            }

            if node.is_fork_marker() {
                if node.parent_ids.len() != 1 || node.is_merge() {
                    return Err(ForkyError::CorruptStore {
                        reason: format!("fork marker '{}' is malformed", node.id),
                    });
                }
            }

            if let Some(metadata) = &node.merge_metadata {
                if node.role != Role::Assistant {
                    return Err(ForkyError::CorruptStore {
                        reason: format!("merge node '{}' is not assistant-authored", node.id),
                    });
                }
                // Committed with exactly two distinct parents; deletion of
                // an adjacent node may have collapsed or spliced the list
                // since, but it can never go empty.
                if node.parent_ids.is_empty() {
                    return Err(ForkyError::CorruptStore {
                        reason: format!("merge node '{}' has no parents", node.id),
                    });
                }
                if self.nodes.contains_key(&metadata.lca_id) {
                    for parent in &node.parent_ids {
                        if !self.is_ancestor(&metadata.lca_id, parent) {
                            return Err(ForkyError::CorruptStore {
                                reason: format!(
                                    "merge node '{}' records an LCA that is not an ancestor of \
                                     its parents",
                                    node.id
                                ),
                            });
                        }
                    }
                }
            }
        }

        if root_count != 1 {
            return Err(ForkyError::CorruptStore {
                reason: format!("conversation has {root_count} root nodes"),
            });
        }
        if !self.nodes.contains_key(&self.root_id) || !self.nodes[&self.root_id].is_root() {
            return Err(ForkyError::CorruptStore {
                reason: "root pointer does not reference the root node".to_string(),
            });
        }

        self.topological_order().map(|_| ())
    }
}

impl Default for ConversationGraph {
    fn default() -> Self {
        Self::new()
    }
}
