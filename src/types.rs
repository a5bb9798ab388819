/// Common types used throughout Forky.
///
/// This module defines the core data structures of the conversation engine:
/// role-tagged nodes, merge metadata, summarized state records, semantic
/// diffs, conflict records, and the read-only views handed to front-ends.
/// Node records are immutable after commit; the only structural mutation
/// the engine ever performs on them is parent rewiring during deletion of a
/// third node.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A unique identifier for a conversation.
pub type ConversationId = String;

/// A unique identifier for a node in a conversation graph.
pub type NodeId = String;

/// Mint a fresh opaque identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Content of every conversation's root node.
pub const ROOT_CONTENT: &str = "Root";

/// Content of fork-marker nodes. Markers record a named branching point and
/// carry no model-visible content.
pub const FORK_MARKER_CONTENT: &str = "<FORK>";

/// The speaker of a conversation node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Engine-authored structure: the root and fork markers
    System,
    /// The human side of the dialogue
    User,
    /// Model-authored turns, including merge nodes
    Assistant,
}

impl Role {
    /// The lowercase wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata recorded on a merge node at commit time.
///
/// This is a historical record: it is never rewritten, even if later
/// deletions rewire the merge node's parents or remove the ancestor it
/// names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeMetadata {
    /// The lowest common ancestor the three-way merge was computed against
    pub lca_id: NodeId,
    /// The left (current at merge time) parent
    pub left_parent_id: NodeId,
    /// The right (target) parent
    pub right_parent_id: NodeId,
    /// Conflicts detected between the two sides' diffs
    pub conflicts: Vec<ConflictRecord>,
}

/// A node in a conversation graph.
///
/// Ordinary nodes have one parent, the root has none, merge nodes have two.
/// `parent_ids` is ordered: position 0 is the left/primary parent, which is
/// the edge history linearization follows through multi-parent nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier, assigned on creation
    pub id: NodeId,
    /// Who authored this node
    pub role: Role,
    /// Textual payload (empty or marker text for structural nodes)
    pub content: String,
    /// Ordered parent ids; ordinal 0 is the left parent
    pub parent_ids: Vec<NodeId>,
    /// When this node was created
    pub created_at: DateTime<Utc>,
    /// Branch label, set on fork markers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    /// Present on merge nodes only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_metadata: Option<MergeMetadata>,
    /// External references, opaque to the engine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

impl Node {
    /// Create the root node of a new conversation.
    pub fn root() -> Self {
        Self {
            id: new_id(),
            role: Role::System,
            content: ROOT_CONTENT.to_string(),
            parent_ids: Vec::new(),
            created_at: Utc::now(),
            branch_name: None,
            merge_metadata: None,
            attachments: Vec::new(),
        }
    }

    /// Create an ordinary single-parent node.
    pub fn child_of(parent_id: NodeId, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
            parent_ids: vec![parent_id],
            created_at: Utc::now(),
            branch_name: None,
            merge_metadata: None,
            attachments: Vec::new(),
        }
    }

    /// Create a fork marker recording a named branching point.
    pub fn fork_marker(parent_id: NodeId, branch_name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role: Role::System,
            content: FORK_MARKER_CONTENT.to_string(),
            parent_ids: vec![parent_id],
            created_at: Utc::now(),
            branch_name: Some(branch_name.into()),
            merge_metadata: None,
            attachments: Vec::new(),
        }
    }

    /// Create a merge node joining two branches.
    pub fn merge(
        left_parent_id: NodeId,
        right_parent_id: NodeId,
        content: impl Into<String>,
        lca_id: NodeId,
        conflicts: Vec<ConflictRecord>,
    ) -> Self {
        let metadata = MergeMetadata {
            lca_id,
            left_parent_id: left_parent_id.clone(),
            right_parent_id: right_parent_id.clone(),
            conflicts,
        };
        Self {
            id: new_id(),
            role: Role::Assistant,
            content: content.into(),
            parent_ids: vec![left_parent_id, right_parent_id],
            created_at: Utc::now(),
            branch_name: None,
            merge_metadata: Some(metadata),
            attachments: Vec::new(),
        }
    }

    /// Whether this node is a fork marker.
    pub fn is_fork_marker(&self) -> bool {
        self.role == Role::System && self.content == FORK_MARKER_CONTENT
    }

    /// Whether this node is a merge node.
    pub fn is_merge(&self) -> bool {
        self.merge_metadata.is_some()
    }

    /// Whether this node is a conversation root.
    pub fn is_root(&self) -> bool {
        self.parent_ids.is_empty()
    }
}

/// The four state categories the summarizer extracts from a branch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Facts,
    Decisions,
    OpenQuestions,
    Assumptions,
}

impl Category {
    /// All categories, in diff and classification order.
    pub const ALL: [Category; 4] = [
        Category::Facts,
        Category::Decisions,
        Category::OpenQuestions,
        Category::Assumptions,
    ];

    /// The snake_case wire name of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Facts => "facts",
            Category::Decisions => "decisions",
            Category::OpenQuestions => "open_questions",
            Category::Assumptions => "assumptions",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured summary of one conversation branch.
///
/// Produced by the summarizer from a linearized history. Order within each
/// list is summarizer-chosen and significant; the engine does not
/// deduplicate items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Established facts
    #[serde(default)]
    pub facts: Vec<String>,
    /// Decisions taken
    #[serde(default)]
    pub decisions: Vec<String>,
    /// Questions still open
    #[serde(default)]
    pub open_questions: Vec<String>,
    /// Working assumptions
    #[serde(default)]
    pub assumptions: Vec<String>,
    /// One-line topic of the branch
    #[serde(default)]
    pub topic: String,
    /// Set when the summarizer exhausted its retries and returned an empty
    /// record; the merge pipeline downgrades to structural-only mode
    #[serde(skip)]
    pub summarization_failed: bool,
}

impl StateRecord {
    /// The empty record returned when summarization exhausts its retries.
    pub fn failed() -> Self {
        Self {
            topic: "unknown".to_string(),
            summarization_failed: true,
            ..Default::default()
        }
    }

    /// Items of one category.
    pub fn items(&self, category: Category) -> &[String] {
        match category {
            Category::Facts => &self.facts,
            Category::Decisions => &self.decisions,
            Category::OpenQuestions => &self.open_questions,
            Category::Assumptions => &self.assumptions,
        }
    }

}

/// A `changed` diff entry: the same handle, different full text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedItem {
    /// The item as the base state had it
    pub before: String,
    /// The item as the side state has it
    pub after: String,
}

/// Added/removed/changed items between two state records, per category.
///
/// Categories with no entries are absent from the maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDiff {
    /// Items present in the side but not the base
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub added: BTreeMap<Category, Vec<String>>,
    /// Items present in the base but not the side
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub removed: BTreeMap<Category, Vec<String>>,
    /// Items whose handle matched but whose full text differs
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub changed: BTreeMap<Category, Vec<ChangedItem>>,
}

impl StateDiff {
    /// Whether the diff records no differences at all.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Added items of one category (empty slice when absent).
    pub fn added_in(&self, category: Category) -> &[String] {
        self.added.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Removed items of one category (empty slice when absent).
    pub fn removed_in(&self, category: Category) -> &[String] {
        self.removed
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Changed items of one category (empty slice when absent).
    pub fn changed_in(&self, category: Category) -> &[ChangedItem] {
        self.changed
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// How two branch diffs overlap on one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// One side added what the other removed
    Contradicts,
    /// Both sides added different items under the same handle
    Diverges,
    /// Both sides changed the same base item to different text
    BothModified,
}

/// A detected overlap between the two sides' diffs that cannot be
/// mechanically reconciled. Surfaced to the model, never auto-resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// The state category the conflict occurred in
    pub category: Category,
    /// The left side's version of the item
    pub left_item: String,
    /// The right side's version of the item
    pub right_item: String,
    /// How the overlap was classified
    pub kind: ConflictKind,
}

/// Read-only projection of a node for front-ends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub id: NodeId,
    pub role: Role,
    pub content: String,
    pub parent_ids: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    pub is_current: bool,
}

/// The whole graph of one conversation, projected for rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphView {
    pub nodes: Vec<NodeView>,
    pub current_node_id: NodeId,
}

/// One row of `list_conversations`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    /// Number of nodes in the graph, markers included
    pub node_count: usize,
    /// Timestamp of the most recent node
    pub last_activity: Option<DateTime<Utc>>,
    /// Branch name inherited by the current checkout, for display
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

/// A named branching point and the tip checkout-by-name would land on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub marker_id: NodeId,
    /// Deepest descendant reached by latest-child descent from the marker
    pub tip_id: NodeId,
}

/// One full-text search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub conversation_id: ConversationId,
    pub conversation_name: String,
    pub node_id: NodeId,
    pub role: Role,
    /// Content excerpt around the first match
    pub snippet: String,
}

/// Result of a merge eligibility check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EligibilityReport {
    pub eligible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<crate::error::MergeRejection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lca_id: Option<NodeId>,
}

/// Result of a committed merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub new_node_id: NodeId,
    pub has_conflicts: bool,
    pub conflicts: Vec<ConflictRecord>,
}
