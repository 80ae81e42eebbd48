//! ClusterLoop wire types
//!
//! Message bodies exchanged over the job bus and the request/response shapes
//! of the local inference engine's REST API. Transport lives elsewhere; this
//! crate only describes what goes over the wire.

use serde::{Deserialize, Serialize};

/// Role of a single chat turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One role/content pair in a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

// Bus bodies

/// A chat job as published on `in.chat.<conversation>.<thread>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingJob {
    pub conversation_id: String,
    pub thread_id: i64,

    /// Model the requester wants; mirrors the capability header
    #[serde(rename = "model")]
    pub requested_model: String,

    /// Optional system prompt. Producers send an empty string for "none".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Conversation so far, oldest first
    #[serde(default, rename = "messages")]
    pub message_history: Vec<ChatMessage>,
}

impl IncomingJob {
    /// System prompt with empty strings treated as absent
    pub fn effective_system_prompt(&self) -> Option<&str> {
        self.system_prompt
            .as_deref()
            .filter(|prompt| !prompt.is_empty())
    }

    /// Subject this job is published on
    pub fn subject(&self, prefix: &str) -> String {
        format!("{}.{}.{}", prefix, self.conversation_id, self.thread_id)
    }
}

/// Response published on `out.chat.<conversation>.<thread>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub conversation_id: String,
    pub thread_id: i64,
    pub content: String,
}

impl InferenceResult {
    /// Subject addressing the original requester
    pub fn subject(&self, prefix: &str) -> String {
        format!("{}.{}.{}", prefix, self.conversation_id, self.thread_id)
    }
}

/// Announcement that a node can serve a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSyncMessage {
    pub name: String,
}

// Inference engine REST shapes

/// `POST /api/chat` request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

/// `POST /api/chat` response body (non-streaming)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub created_at: String,
    pub message: ChatMessage,
    #[serde(default)]
    pub done: bool,
}

/// `POST /api/chat` body that asks the engine to drop a model now
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnloadRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub keep_alive: u64,
}

impl UnloadRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            keep_alive: 0,
        }
    }
}

/// Entry of `GET /api/ps`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedModelEntry {
    pub name: String,
}

/// `GET /api/ps` response body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadedModelsResponse {
    #[serde(default)]
    pub models: Vec<LoadedModelEntry>,
}

/// Model metadata reported by `GET /api/tags`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDetails {
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub families: Option<Vec<String>>,
    #[serde(default)]
    pub parameter_size: String,
    #[serde(default)]
    pub quantization_level: String,
}

/// An installed model; also the record format of the node's catalog file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledModel {
    pub name: String,
    #[serde(default)]
    pub modified_at: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub details: ModelDetails,
}

/// `GET /api/tags` response body and catalog file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstalledModelsResponse {
    #[serde(default)]
    pub models: Vec<InstalledModel>,
}
