//! # Forky — Conversations with Branches
//!
//! Forky manages AI assistant conversations as persistent, versioned
//! directed acyclic graphs with git-style branching and a semantic
//! three-way merge:
//!
//! - **Every turn is a node** - role-tagged, immutable once committed
//! - **Fork anywhere** - named branch points, checkout by id or name
//! - **Merge branches** - three-way against the lowest common ancestor,
//!   with model-summarized state, semantic diffing, and conflict
//!   classification
//! - **Crash-safe persistence** - atomic, checksummed per-conversation
//!   snapshots, validated on load
//!
//! ## Quick Start
//!
//! ```ignore
//! use forky::{ConversationService, ServiceConfig};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Arc::new(my_provider::Client::from_env()?);
//!     let service = ConversationService::open(ServiceConfig::default(), client).await?;
//!
//!     let id = service.create_conversation(Some("plan".into())).await?;
//!
//!     // Chat on the trunk
//!     let mut chunks = service.chat(&id, "pick a database", "gpt-large", vec![]).await?;
//!     while let Some(chunk) = chunks.next().await {
//!         print!("{}", chunk?);
//!     }
//!
//!     // Branch, diverge, and merge back
//!     service.fork(&id, Some("alt".into())).await?;
//!     let mut chunks = service.chat(&id, "what about sqlite instead?", "gpt-large", vec![]).await?;
//!     while let Some(chunk) = chunks.next().await {
//!         print!("{}", chunk?);
//!     }
//!     let outcome = service.merge_branches(&id, &trunk_tip, "reconcile the two options").await?;
//!     println!("merged into {} ({} conflicts)", outcome.new_node_id, outcome.conflicts.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Forky is built in layers, leaves first:
//!
//! 1. **Graph** ([`graph::ConversationGraph`]) - the in-memory DAG:
//!    ancestry, LCA, checkout resolution, history linearization,
//!    delete-with-inheritance
//! 2. **Store** ([`store::ConversationStore`]) - atomic per-conversation
//!    snapshots with integrity checks
//! 3. **Merge pipeline** ([`merge`], [`summarizer`], [`diff`]) -
//!    eligibility, state summarization, semantic diff, conflict
//!    classification, final completion
//! 4. **Service** ([`ConversationService`]) - the façade front-ends call,
//!    enforcing one writer per conversation
//!
//! The engine never speaks to an LLM provider directly; it requires a
//! [`ModelClient`] and treats every call through it as a suspension point.
//!
//! ## Thread Safety
//!
//! The service serializes writes per conversation behind an async mutex
//! and holds the lock across a whole merge or streamed chat turn, so a
//! reader that observes a committed operation observes all of it.
//! Operations on different conversations run concurrently.

pub mod conversation;
pub mod diff;
pub mod error;
pub mod graph;
pub mod merge;
pub mod model;
pub mod service;
pub mod store;
pub mod summarizer;
pub mod types;

pub use conversation::Conversation;
pub use error::{ForkyError, ForkyResult, MergeRejection};
pub use graph::ConversationGraph;
pub use model::{ChatMessage, ChunkStream, ModelClient, ModelInfo};
pub use service::{ConversationService, ServiceConfig};
pub use store::{ConversationStore, StoreConfig};
pub use types::{
    BranchInfo, Category, ChangedItem, ConflictKind, ConflictRecord, ConversationId,
    ConversationSummary, EligibilityReport, GraphView, MergeMetadata, MergeOutcome, Node, NodeId,
    NodeView, Role, SearchHit, StateDiff, StateRecord,
};

/// Convenience re-exports for embedders.
pub mod prelude {
    pub use crate::error::{ForkyError, ForkyResult, MergeRejection};
    pub use crate::model::{ChatMessage, ModelClient, ModelInfo};
    pub use crate::service::{ConversationService, ServiceConfig};
    pub use crate::store::StoreConfig;
    pub use crate::types::{
        ConflictKind, ConflictRecord, MergeOutcome, Node, NodeId, Role, StateRecord,
    };
}
