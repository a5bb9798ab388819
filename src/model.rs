/// The model capability boundary.
///
/// The engine never talks to an LLM provider directly; it requires a
/// `ModelClient` and hands it role-tagged messages. Provider adapters
/// (HTTP, local inference, test doubles) implement the trait outside this
/// crate. Every call into a client is a suspension point for the
/// conversation holding the lock.
use crate::error::ForkyResult;
use crate::types::{Node, Role};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Default deadline for a single model call, in seconds.
///
/// Adapters are expected to give up and report `ModelTimeout` no later than
/// this; nothing is committed for a timed-out call.
pub const MODEL_TIMEOUT_SECS: u64 = 45;

/// One role-tagged message handed to a model.
///
/// Merge nodes travel as their own variant so adapters can render them
/// distinctly (most flatten them to assistant turns).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatMessage {
    System { content: String },
    User { content: String },
    Assistant { content: String },
    Merge { content: String },
}

impl ChatMessage {
    /// The message text.
    pub fn content(&self) -> &str {
        match self {
            ChatMessage::System { content }
            | ChatMessage::User { content }
            | ChatMessage::Assistant { content }
            | ChatMessage::Merge { content } => content,
        }
    }

    fn append_content(&mut self, more: &str) {
        match self {
            ChatMessage::System { content }
            | ChatMessage::User { content }
            | ChatMessage::Assistant { content }
            | ChatMessage::Merge { content } => {
                content.push_str("\n\n");
                content.push_str(more);
            }
        }
    }

    fn kind(&self) -> u8 {
        match self {
            ChatMessage::System { .. } => 0,
            ChatMessage::User { .. } => 1,
            ChatMessage::Assistant { .. } => 2,
            ChatMessage::Merge { .. } => 3,
        }
    }

    fn from_node(node: &Node) -> Self {
        let content = node.content.clone();
        if node.is_merge() {
            return ChatMessage::Merge { content };
        }
        match node.role {
            Role::System => ChatMessage::System { content },
            Role::User => ChatMessage::User { content },
            Role::Assistant => ChatMessage::Assistant { content },
        }
    }
}

/// Convert a linearized history into the message list a model sees.
///
/// Consecutive entries of the same kind are coalesced with a blank line so
/// providers that reject repeated roles always see a clean alternation.
/// Fork markers never reach this function: `history` filters them.
pub fn messages_from_history(history: &[Node]) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = Vec::with_capacity(history.len());
    for node in history {
        let message = ChatMessage::from_node(node);
        match messages.last_mut() {
            Some(last) if last.kind() == message.kind() => {
                last.append_content(message.content());
            }
            _ => messages.push(message),
        }
    }
    messages
}

/// An available model, as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Provider-side identifier, passed back in completion requests
    pub id: String,
    /// Human-readable name
    pub name: String,
}

/// A stream of completion chunks.
pub type ChunkStream = BoxStream<'static, ForkyResult<String>>;

/// The capability the engine requires from an LLM provider.
///
/// Implementations resolve attachments to model-native representations,
/// enforce their own deadlines (`MODEL_TIMEOUT_SECS` is the expected
/// ceiling), and report failures through the error taxonomy
/// (`ModelError`, `ModelTimeout`, `ModelUnavailable`).
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Complete a conversation and return the full assistant text.
    async fn complete(&self, messages: &[ChatMessage], model: &str) -> ForkyResult<String>;

    /// Complete a conversation as a stream of text chunks.
    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> ForkyResult<ChunkStream>;

    /// The models this provider can serve.
    async fn available_models(&self) -> ForkyResult<Vec<ModelInfo>>;
}
