//! Shared test fixtures: a scripted model client and service builders.
#![allow(dead_code)]

use async_trait::async_trait;
use forky::{
    ChatMessage, ChunkStream, ConversationService, ForkyError, ForkyResult, ModelClient,
    ModelInfo, ServiceConfig, StateRecord,
};
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// One scripted reply from the fake provider.
pub enum ScriptedResponse {
    /// Full text, also streamable word by word
    Text(String),
    /// Fail the call before anything streams
    Error(ForkyError),
    /// Stream some chunks, then fail
    MidStreamError {
        prefix: Vec<String>,
        error: ForkyError,
    },
}

/// A model client that replays a scripted response queue.
///
/// Every `complete`/`complete_stream` call pops the next entry; running
/// off the end of the script is a test bug and reported as a model error.
/// Prompts are recorded for assertions.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    pub prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<ScriptedResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn with_texts(texts: &[&str]) -> Arc<Self> {
        Self::new(texts.iter().map(|t| ScriptedResponse::Text(t.to_string())).collect())
    }

    fn pop(&self, messages: &[ChatMessage]) -> ScriptedResponse {
        self.prompts.lock().unwrap().push(messages.to_vec());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                ScriptedResponse::Error(ForkyError::ModelError("script exhausted".to_string()))
            })
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, messages: &[ChatMessage], _model: &str) -> ForkyResult<String> {
        match self.pop(messages) {
            ScriptedResponse::Text(text) => Ok(text),
            ScriptedResponse::Error(error) => Err(error),
            ScriptedResponse::MidStreamError { error, .. } => Err(error),
        }
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        _model: &str,
    ) -> ForkyResult<ChunkStream> {
        match self.pop(messages) {
            ScriptedResponse::Text(text) => {
                let chunks: Vec<ForkyResult<String>> = text
                    .split_inclusive(' ')
                    .map(|piece| Ok(piece.to_string()))
                    .collect();
                Ok(futures::stream::iter(chunks).boxed())
            }
            ScriptedResponse::Error(error) => Err(error),
            ScriptedResponse::MidStreamError { prefix, error } => {
                let mut chunks: Vec<ForkyResult<String>> =
                    prefix.into_iter().map(Ok).collect();
                chunks.push(Err(error));
                Ok(futures::stream::iter(chunks).boxed())
            }
        }
    }

    async fn available_models(&self) -> ForkyResult<Vec<ModelInfo>> {
        Ok(vec![ModelInfo {
            id: "scripted-small".to_string(),
            name: "Scripted Small".to_string(),
        }])
    }
}

/// Serialize a state record the way the summarizer expects to parse one.
pub fn state_json(record: &StateRecord) -> String {
    serde_json::to_string(record).unwrap()
}

/// Build a state record from category slices.
pub fn state(facts: &[&str], decisions: &[&str], topic: &str) -> StateRecord {
    StateRecord {
        facts: facts.iter().map(|s| s.to_string()).collect(),
        decisions: decisions.iter().map(|s| s.to_string()).collect(),
        topic: topic.to_string(),
        ..Default::default()
    }
}

/// Route engine logs through the test harness; `RUST_LOG` controls
/// verbosity. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A service over a temp-dir store and the given model script.
pub async fn service_with(
    responses: Vec<ScriptedResponse>,
) -> (tempfile::TempDir, Arc<ScriptedModel>, ConversationService) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let model = ScriptedModel::new(responses);
    let config = ServiceConfig {
        store: forky::store::store_config_at(dir.path()),
        ..Default::default()
    };
    let service = ConversationService::open(config, model.clone()).await.unwrap();
    (dir, model, service)
}
