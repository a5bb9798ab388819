/// Error types for Forky operations.
///
/// This module provides the error hierarchy covering every failure mode in
/// the conversation engine. All errors are well-typed and can be
/// pattern-matched for precise handling; expected user errors additionally
/// carry a stable reason code so front-ends can branch without parsing
/// display strings.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The main error type for Forky operations.
///
/// All fallible operations in Forky return `Result<T, ForkyError>`.
/// This provides a unified error handling interface across the entire API.
#[derive(Error, Debug)]
pub enum ForkyError {
    /// Conversation id does not resolve to a known conversation
    #[error("Conversation '{id}' not found")]
    UnknownConversation {
        /// The conversation id that was queried
        id: String,
    },

    /// Node id does not resolve to a node in the conversation
    #[error("Node '{id}' not found in conversation")]
    UnknownNode {
        /// The node id that was queried
        id: String,
    },

    /// Checkout identifier matches neither a node id nor a branch name
    #[error("No node or branch matches '{identifier}'")]
    UnknownIdentifier {
        /// The identifier that failed to resolve
        identifier: String,
    },

    /// Append targets a parent node that does not exist
    #[error("Append parent '{parent_id}' does not exist")]
    InvalidParent {
        /// The missing parent id
        parent_id: String,
    },

    /// The root node is undeletable
    #[error("The root node cannot be deleted")]
    CannotDeleteRoot,

    /// Deleting the node would leave the checkout pointer with no
    /// surviving parent to fall back to
    #[error("Cannot delete '{id}': checkout pointer has no surviving ancestor")]
    CannotDeleteCurrent {
        /// The node whose deletion was refused
        id: String,
    },

    /// The requested merge fails one of the eligibility checks
    #[error("Merge rejected: {reason}")]
    MergeIneligible {
        /// The named rejection reason
        reason: MergeRejection,
    },

    /// The model provider reported a failure
    #[error("Model error: {0}")]
    ModelError(String),

    /// The model call exceeded its deadline; nothing was committed
    #[error("Model call timed out after {seconds}s")]
    ModelTimeout {
        /// The deadline that elapsed
        seconds: u64,
    },

    /// No model is available to serve the request
    #[error("Model unavailable: {0}")]
    ModelUnavailable(String),

    /// The summarizer exhausted its retries producing a structured state
    #[error("Summarization failed: {0}")]
    SummarizationFailed(String),

    /// A persisted conversation violates an invariant or failed its checksum
    #[error("Corrupt store: {reason}")]
    CorruptStore {
        /// Description of the violation detected on load
        reason: String,
    },

    /// The conversation lock was held past the soft deadline
    #[error("Conversation '{id}' is busy")]
    Busy {
        /// The contended conversation
        id: String,
    },

    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error when converting data to/from JSON
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ForkyError {
    /// Stable machine-readable code for UI branching.
    ///
    /// Display strings may be reworded; these codes are part of the API.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ForkyError::UnknownConversation { .. } => "unknown_conversation",
            ForkyError::UnknownNode { .. } => "unknown_node",
            ForkyError::UnknownIdentifier { .. } => "unknown_identifier",
            ForkyError::InvalidParent { .. } => "invalid_parent",
            ForkyError::CannotDeleteRoot => "cannot_delete_root",
            ForkyError::CannotDeleteCurrent { .. } => "cannot_delete_current",
            ForkyError::MergeIneligible { reason } => reason.as_str(),
            ForkyError::ModelError(_) => "model_error",
            ForkyError::ModelTimeout { .. } => "model_timeout",
            ForkyError::ModelUnavailable(_) => "model_unavailable",
            ForkyError::SummarizationFailed(_) => "summarization_failed",
            ForkyError::CorruptStore { .. } => "corrupt_store",
            ForkyError::Busy { .. } => "busy",
            ForkyError::Storage(_) => "storage_error",
            ForkyError::Serialization(_) => "serialization_error",
        }
    }
}

/// The named reasons a merge request can be rejected.
///
/// Rejections are surfaced verbatim through eligibility reports so callers
/// can branch on them; the serialized form is the snake_case reason string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRejection {
    /// Both sides of the merge are the same node
    CannotMergeNodeWithItself,
    /// One side is an ancestor of the other; the merge would be a no-op
    CannotMergeAncestorWithDescendant,
    /// The two nodes share no ancestor (corrupted input)
    NoCommonAncestorFound,
}

impl MergeRejection {
    /// The stable snake_case reason string.
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeRejection::CannotMergeNodeWithItself => "cannot_merge_node_with_itself",
            MergeRejection::CannotMergeAncestorWithDescendant => {
                "cannot_merge_ancestor_with_descendant"
            }
            MergeRejection::NoCommonAncestorFound => "no_common_ancestor_found",
        }
    }
}

impl std::fmt::Display for MergeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type alias for Forky operations.
///
/// This is a convenience alias for `Result<T, ForkyError>` that makes
/// function signatures more concise throughout the codebase.
pub type ForkyResult<T> = Result<T, ForkyError>;
