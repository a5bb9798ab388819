/// Persistence layer for Forky - atomic per-conversation snapshots.
///
/// Each conversation is persisted as one JSON document. A save serializes
/// the whole record (metadata, pointer, node table with ordered parent
/// ids), writes it to a temporary file in the same directory, fsyncs, and
/// renames it over the previous snapshot. Either the entire new snapshot is
/// durable or the previous one survives; there is no partial-write window.
///
/// # Storage Layout
///
/// ```text
/// <data_dir>/
/// └── conversations/
///     ├── <conversation-id>.json
///     └── <conversation-id>.json
/// ```
///
/// # Snapshot Format
///
/// ```json
/// {"version":1,"checksum":"crc32:9ae0daaf","body":{"id":"…","name":"…","nodes":[…]}}
/// ```
///
/// The checksum covers the serialized body. On load the checksum, the
/// format version, and every structural invariant of the graph are
/// verified; any violation surfaces as `CorruptStore`. Unknown format
/// versions fail closed - schema evolution across incompatible formats is
/// out of scope.
use crate::conversation::Conversation;
use crate::error::{ForkyError, ForkyResult};
use crate::graph::ConversationGraph;
use crate::types::{ConversationId, ConversationSummary, Node, NodeId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Current snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base directory for all persisted data
    pub data_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("forky");
        Self { data_dir }
    }
}

/// A persisted conversation snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    /// Snapshot format version
    version: u32,
    /// CRC32 of the serialized body, "crc32:XXXXXXXX"
    checksum: String,
    /// The conversation record
    body: SnapshotBody,
}

/// The serializable shape of one conversation.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotBody {
    id: ConversationId,
    name: String,
    created_at: DateTime<Utc>,
    is_active: bool,
    current_node_id: NodeId,
    /// The full node table; parent order within each node is the ordinal
    /// order (position 0 = left parent)
    nodes: Vec<Node>,
}

/// Calculate CRC32 checksum for snapshot integrity.
fn calculate_checksum(data: &str) -> String {
    let crc = crc32fast::hash(data.as_bytes());
    format!("crc32:{:08x}", crc)
}

/// Durable storage for conversations.
///
/// The store performs whole-file atomic replacement per conversation, so
/// saves of different conversations are independent. Serializing writers on
/// the *same* conversation is the service's job.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    conversations_dir: PathBuf,
}

impl ConversationStore {
    /// Open (and create if needed) a store rooted at the configured data
    /// directory.
    pub async fn open(config: &StoreConfig) -> ForkyResult<Self> {
        let conversations_dir = config.data_dir.join("conversations");
        fs::create_dir_all(&conversations_dir)
            .await
            .map_err(|e| ForkyError::Storage(format!("Failed to create store dir: {e}")))?;
        debug!(dir = %conversations_dir.display(), "opened conversation store");
        Ok(Self { conversations_dir })
    }

    fn snapshot_path(&self, id: &str) -> PathBuf {
        self.conversations_dir.join(format!("{id}.json"))
    }

    /// Persist the entire conversation atomically.
    pub async fn save(&self, conversation: &Conversation) -> ForkyResult<()> {
        let mut nodes: Vec<Node> = conversation.graph.nodes().cloned().collect();
        // Stable on-disk order keeps snapshots diffable.
        nodes.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let body = SnapshotBody {
            id: conversation.id.clone(),
            name: conversation.name.clone(),
            created_at: conversation.created_at,
            is_active: conversation.is_active,
            current_node_id: conversation.current_node_id.clone(),
            nodes,
        };
        let body_json = serde_json::to_string(&body)?;
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            checksum: calculate_checksum(&body_json),
            body,
        };
        let payload = serde_json::to_vec(&snapshot)?;

        let final_path = self.snapshot_path(&conversation.id);
        let tmp_path = self.conversations_dir.join(format!("{}.tmp", conversation.id));

        fs::write(&tmp_path, &payload)
            .await
            .map_err(|e| ForkyError::Storage(format!("Failed to write snapshot: {e}")))?;

        // Flush file contents before the rename makes them visible.
        let file = fs::File::open(&tmp_path)
            .await
            .map_err(|e| ForkyError::Storage(format!("Failed to reopen snapshot: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| ForkyError::Storage(format!("Failed to sync snapshot: {e}")))?;
        drop(file);

        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| ForkyError::Storage(format!("Failed to install snapshot: {e}")))?;

        debug!(conversation = %conversation.id, bytes = payload.len(), "saved snapshot");
        Ok(())
    }

    /// Load a conversation, validating checksum, format version, and every
    /// graph invariant.
    pub async fn load(&self, id: &str) -> ForkyResult<Conversation> {
        let path = self.snapshot_path(id);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ForkyError::UnknownConversation { id: id.to_string() });
            }
            Err(e) => {
                return Err(ForkyError::Storage(format!("Failed to read snapshot: {e}")));
            }
        };

        let snapshot: Snapshot =
            serde_json::from_str(&raw).map_err(|e| ForkyError::CorruptStore {
                reason: format!("snapshot for '{id}' is not valid JSON: {e}"),
            })?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(ForkyError::CorruptStore {
                reason: format!(
                    "snapshot for '{id}' has unsupported format version {}",
                    snapshot.version
                ),
            });
        }

        let body_json = serde_json::to_string(&snapshot.body)?;
        if calculate_checksum(&body_json) != snapshot.checksum {
            return Err(ForkyError::CorruptStore {
                reason: format!("snapshot for '{id}' failed its checksum"),
            });
        }

        let body = snapshot.body;
        if body.id != id {
            return Err(ForkyError::CorruptStore {
                reason: format!("snapshot for '{id}' contains conversation '{}'", body.id),
            });
        }

        let graph = ConversationGraph::from_nodes(body.nodes)?;
        if !graph.contains(&body.current_node_id) {
            return Err(ForkyError::CorruptStore {
                reason: format!(
                    "snapshot for '{id}' points its checkout at missing node '{}'",
                    body.current_node_id
                ),
            });
        }

        Ok(Conversation {
            id: body.id,
            name: body.name,
            created_at: body.created_at,
            is_active: body.is_active,
            current_node_id: body.current_node_id,
            graph,
        })
    }

    /// Whether a snapshot exists for the id.
    pub async fn exists(&self, id: &str) -> bool {
        fs::try_exists(self.snapshot_path(id)).await.unwrap_or(false)
    }

    /// List summaries of every stored conversation.
    ///
    /// Unreadable snapshots are skipped with a warning rather than failing
    /// the whole listing.
    pub async fn list(&self) -> ForkyResult<Vec<ConversationSummary>> {
        let mut entries = fs::read_dir(&self.conversations_dir)
            .await
            .map_err(|e| ForkyError::Storage(format!("Failed to list store: {e}")))?;

        let mut summaries = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ForkyError::Storage(format!("Failed to list store: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(id).await {
                Ok(conversation) => summaries.push(conversation.summary()),
                Err(e) => {
                    warn!(conversation = %id, error = %e, "skipping unreadable snapshot");
                }
            }
        }

        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Delete a conversation and all its nodes.
    pub async fn delete(&self, id: &str) -> ForkyResult<()> {
        match fs::remove_file(self.snapshot_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ForkyError::UnknownConversation { id: id.to_string() })
            }
            Err(e) => Err(ForkyError::Storage(format!(
                "Failed to delete snapshot: {e}"
            ))),
        }
    }

    /// Rename a conversation (load, mutate, save).
    pub async fn rename(&self, id: &str, name: &str) -> ForkyResult<()> {
        let mut conversation = self.load(id).await?;
        conversation.name = name.to_string();
        self.save(&conversation).await
    }
}

/// A store path helper for tests and embedders: a store rooted directly at
/// `path` rather than the platform data directory.
pub fn store_config_at(path: impl AsRef<Path>) -> StoreConfig {
    StoreConfig {
        data_dir: path.as_ref().to_path_buf(),
    }
}
