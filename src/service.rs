/// The conversation service façade.
///
/// Front-ends (HTTP layers, CLIs) talk to this type only. It owns the
/// store, a registry of loaded conversations, and the model client, and it
/// enforces the concurrency model: one writer per conversation at a time,
/// serialized by a conversation-scoped async mutex whose acquisition is
/// bounded by a soft deadline (`Busy` on expiry). The merge pipeline and a
/// streamed chat turn hold the lock end to end, so the pointer and the
/// graph always mutate atomically with respect to other writers; work on
/// other conversations proceeds unimpeded.
use crate::conversation::Conversation;
use crate::error::{ForkyError, ForkyResult};
use crate::merge;
use crate::model::{messages_from_history, ChunkStream, ModelClient};
use crate::store::{ConversationStore, StoreConfig};
use crate::summarizer;
use crate::types::{
    BranchInfo, ConversationId, ConversationSummary, EligibilityReport, GraphView, MergeOutcome,
    Node, NodeId, Role, SearchHit, StateRecord,
};
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Store location
    pub store: StoreConfig,
    /// Soft deadline for acquiring a conversation lock
    pub lock_timeout: Duration,
    /// Capacity of the bounded chat chunk channel
    pub chat_buffer: usize,
    /// Model used for summarization and merge completions; `None` selects
    /// the provider's first available model
    pub model: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            lock_timeout: Duration::from_secs(5),
            chat_buffer: 32,
            model: None,
        }
    }
}

/// The façade exposing every conversation operation.
///
/// Cheap to share: internals are reference-counted, and the registry maps
/// each conversation id to its own lock.
pub struct ConversationService {
    config: ServiceConfig,
    store: ConversationStore,
    client: Arc<dyn ModelClient>,
    conversations: DashMap<ConversationId, Arc<Mutex<Conversation>>>,
}

impl ConversationService {
    /// Open the service: open the store and load every persisted
    /// conversation into the registry. Unreadable snapshots are skipped
    /// with a warning.
    pub async fn open(config: ServiceConfig, client: Arc<dyn ModelClient>) -> ForkyResult<Self> {
        let store = ConversationStore::open(&config.store).await?;
        let conversations = DashMap::new();
        for summary in store.list().await? {
            match store.load(&summary.id).await {
                Ok(conversation) => {
                    conversations.insert(summary.id, Arc::new(Mutex::new(conversation)));
                }
                Err(e) => warn!(conversation = %summary.id, error = %e, "skipping conversation"),
            }
        }
        info!(loaded = conversations.len(), "conversation service ready");
        Ok(Self {
            config,
            store,
            client,
            conversations,
        })
    }

    /// Acquire a conversation's write lock within the soft deadline.
    async fn lock(&self, id: &str) -> ForkyResult<OwnedMutexGuard<Conversation>> {
        let handle = self
            .conversations
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ForkyError::UnknownConversation { id: id.to_string() })?;
        tokio::time::timeout(self.config.lock_timeout, handle.lock_owned())
            .await
            .map_err(|_| ForkyError::Busy { id: id.to_string() })
    }

    /// The model to drive summarization and merges with.
    async fn resolve_model(&self) -> ForkyResult<String> {
        if let Some(model) = &self.config.model {
            return Ok(model.clone());
        }
        self.client
            .available_models()
            .await?
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| ForkyError::ModelUnavailable("provider lists no models".to_string()))
    }

    /// Summaries of all conversations, newest first.
    pub async fn list_conversations(&self) -> ForkyResult<Vec<ConversationSummary>> {
        let handles: Vec<Arc<Mutex<Conversation>>> = self
            .conversations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.lock().await.summary());
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Create a conversation and persist its (root-only) graph.
    pub async fn create_conversation(&self, name: Option<String>) -> ForkyResult<ConversationId> {
        let conversation = Conversation::new(name.unwrap_or_else(|| "New conversation".to_string()));
        let id = conversation.id.clone();
        self.store.save(&conversation).await?;
        self.conversations
            .insert(id.clone(), Arc::new(Mutex::new(conversation)));
        Ok(id)
    }

    /// Delete a conversation and all its nodes.
    pub async fn delete_conversation(&self, id: &str) -> ForkyResult<()> {
        // Hold the lock while deleting so no writer races the removal.
        let guard = self.lock(id).await?;
        self.store.delete(id).await?;
        drop(guard);
        self.conversations.remove(id);
        info!(conversation = %id, "deleted conversation");
        Ok(())
    }

    /// Rename a conversation.
    pub async fn rename_conversation(&self, id: &str, name: &str) -> ForkyResult<()> {
        let mut guard = self.lock(id).await?;
        guard.name = name.to_string();
        self.store.save(&guard).await
    }

    /// Mark a conversation active (and every other one inactive) for CLI
    /// convenience, and return its summary.
    pub async fn load_conversation(&self, id: &str) -> ForkyResult<ConversationSummary> {
        let others: Vec<Arc<Mutex<Conversation>>> = self
            .conversations
            .iter()
            .filter(|entry| entry.key() != id)
            .map(|entry| entry.value().clone())
            .collect();
        for other in others {
            let mut guard = other.lock().await;
            if guard.is_active {
                guard.is_active = false;
                self.store.save(&guard).await?;
            }
        }

        let mut guard = self.lock(id).await?;
        guard.is_active = true;
        self.store.save(&guard).await?;
        Ok(guard.summary())
    }

    /// The whole graph of a conversation, projected for rendering.
    pub async fn get_graph(&self, id: &str) -> ForkyResult<GraphView> {
        Ok(self.lock(id).await?.graph_view())
    }

    /// Root-to-current history, fork markers filtered.
    pub async fn get_history(&self, id: &str) -> ForkyResult<Vec<Node>> {
        self.lock(id).await?.history_to_current()
    }

    /// Named branch points of a conversation.
    pub async fn list_branches(&self, id: &str) -> ForkyResult<Vec<BranchInfo>> {
        Ok(self.lock(id).await?.branches())
    }

    /// Move the checkout pointer to a node id or branch name.
    pub async fn checkout(&self, id: &str, identifier: &str) -> ForkyResult<NodeId> {
        let mut guard = self.lock(id).await?;
        let node_id = guard.checkout(identifier)?;
        self.store.save(&guard).await?;
        Ok(node_id)
    }

    /// Fork from the current checkout, minting a branch name when the
    /// caller does not supply one.
    pub async fn fork(&self, id: &str, branch_name: Option<String>) -> ForkyResult<NodeId> {
        let mut guard = self.lock(id).await?;
        let name = branch_name
            .unwrap_or_else(|| format!("branch-{}", &crate::types::new_id()[..8]));
        let from = guard.current_node_id.clone();
        let marker = guard.fork(&from, &name)?;
        self.store.save(&guard).await?;
        Ok(marker)
    }

    /// Check whether two nodes can be merged.
    pub async fn check_merge_eligibility(
        &self,
        id: &str,
        a: &str,
        b: &str,
    ) -> ForkyResult<EligibilityReport> {
        let guard = self.lock(id).await?;
        merge::check_eligibility(&guard.graph, a, b)
    }

    /// Merge the target branch into the current checkout.
    ///
    /// The current checkout is always the left parent. The lock is held
    /// for the entire pipeline, so the graph and pointer commit atomically
    /// with respect to other writers.
    pub async fn merge_branches(
        &self,
        id: &str,
        target_id: &str,
        merge_prompt: &str,
    ) -> ForkyResult<MergeOutcome> {
        let model = self.resolve_model().await?;
        let mut guard = self.lock(id).await?;
        let outcome =
            merge::execute_merge(&mut guard, target_id, merge_prompt, &model, &*self.client)
                .await?;
        self.store.save(&guard).await?;
        Ok(outcome)
    }

    /// Summarize the current branch into a state record.
    pub async fn summarize_current(&self, id: &str) -> ForkyResult<StateRecord> {
        let model = self.resolve_model().await?;
        let guard = self.lock(id).await?;
        let history = guard.history_to_current()?;
        drop(guard);
        summarizer::summarize(&history, &model, &*self.client).await
    }

    /// Delete a node from a conversation.
    pub async fn delete_node(&self, id: &str, node_id: &str) -> ForkyResult<()> {
        let mut guard = self.lock(id).await?;
        guard.delete_node(node_id)?;
        self.store.save(&guard).await
    }

    /// Append a user turn and stream the assistant's reply.
    ///
    /// The user node is committed before the model is called. The
    /// conversation lock rides inside the streaming task and is released
    /// when the assistant node commits, so no other writer can interleave
    /// with a turn in flight. If the caller drops the stream mid-reply the
    /// chunks accumulated so far are still committed - a truncated turn
    /// may be exactly what the user wanted to keep. If the provider fails
    /// mid-stream, no assistant node is committed.
    pub async fn chat(
        &self,
        id: &str,
        message: &str,
        model: &str,
        attachments: Vec<String>,
    ) -> ForkyResult<ChunkStream> {
        let mut guard = self.lock(id).await?;
        guard.append_current(Role::User, message, attachments)?;
        self.store.save(&guard).await?;

        let history = guard.history_to_current()?;
        let messages = messages_from_history(&history);
        let mut upstream = self.client.complete_stream(&messages, model).await?;

        let (tx, rx) = mpsc::channel::<ForkyResult<String>>(self.config.chat_buffer);
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut accumulated = String::new();
            let mut provider_failed = false;
            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(text) => {
                        accumulated.push_str(&text);
                        if tx.send(Ok(text)).await.is_err() {
                            // Caller went away; keep what already arrived.
                            break;
                        }
                    }
                    Err(e) => {
                        provider_failed = true;
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }

            if !provider_failed && !accumulated.is_empty() {
                match guard.append_current(Role::Assistant, accumulated.as_str(), Vec::new()) {
                    Ok(_) => {
                        if let Err(e) = store.save(&guard).await {
                            error!(conversation = %guard.id, error = %e, "failed to persist assistant turn");
                        }
                    }
                    Err(e) => {
                        error!(conversation = %guard.id, error = %e, "failed to append assistant turn")
                    }
                }
            }
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
        .boxed())
    }

    /// Case-insensitive substring search across every conversation.
    pub async fn search(&self, query: &str) -> ForkyResult<Vec<SearchHit>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let pattern = regex::Regex::new(&format!("(?i){}", regex::escape(query)))
            .map_err(|e| ForkyError::Storage(format!("bad search pattern: {e}")))?;

        let handles: Vec<Arc<Mutex<Conversation>>> = self
            .conversations
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut hits = Vec::new();
        for handle in handles {
            let guard = handle.lock().await;
            let mut nodes: Vec<&Node> = guard
                .graph
                .nodes()
                .filter(|node| !node.is_fork_marker())
                .collect();
            nodes.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
            for node in nodes {
                if let Some(found) = pattern.find(&node.content) {
                    hits.push(SearchHit {
                        conversation_id: guard.id.clone(),
                        conversation_name: guard.name.clone(),
                        node_id: node.id.clone(),
                        role: node.role,
                        snippet: snippet(&node.content, found.start(), found.end()),
                    });
                }
            }
        }
        Ok(hits)
    }
}

/// Characters of context kept on each side of a match.
const SNIPPET_CONTEXT: usize = 40;

/// Excerpt `content` around a match, clamped to char boundaries.
fn snippet(content: &str, start: usize, end: usize) -> String {
    let mut from = start.saturating_sub(SNIPPET_CONTEXT);
    while from > 0 && !content.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (end + SNIPPET_CONTEXT).min(content.len());
    while to < content.len() && !content.is_char_boundary(to) {
        to += 1;
    }

    let mut excerpt = String::new();
    if from > 0 {
        excerpt.push('…');
    }
    excerpt.push_str(&content[from..to]);
    if to < content.len() {
        excerpt.push('…');
    }
    excerpt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snippet_short_content() {
        assert_eq!(snippet("hello world", 0, 5), "hello world");
    }

    #[test]
    fn test_snippet_elides_long_content() {
        let content = "a".repeat(200);
        let excerpt = snippet(&content, 100, 105);
        assert!(excerpt.starts_with('…'));
        assert!(excerpt.ends_with('…'));
        assert!(excerpt.len() < content.len());
    }

    #[test]
    fn test_snippet_respects_char_boundaries() {
        let content = "é".repeat(100);
        let excerpt = snippet(&content, 100, 102);
        assert!(excerpt.contains('é'));
    }

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert!(config.model.is_none());
        assert!(config.chat_buffer > 0);
    }
}
