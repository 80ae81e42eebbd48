//! Local inference engine client
//!
//! The node talks to an Ollama-compatible REST API for four things: listing
//! installed models, listing loaded models, running a non-streaming chat and
//! unloading a model (a chat call with `keep_alive: 0`).

use async_trait::async_trait;
use clusterloop_common::{ClusterLoopError, Result};
use clusterloop_proto::{
    ChatRequest, ChatResponse, InstalledModel, InstalledModelsResponse, LoadedModelEntry,
    LoadedModelsResponse, UnloadRequest,
};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

const TAGS_PATH: &str = "/api/tags";
const PS_PATH: &str = "/api/ps";
const CHAT_PATH: &str = "/api/chat";

/// Operations the node needs from the inference engine
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Models installed on disk (`GET /api/tags`)
    async fn list_installed(&self) -> Result<Vec<InstalledModel>>;

    /// Models currently resident in memory (`GET /api/ps`)
    async fn list_loaded(&self) -> Result<Vec<LoadedModelEntry>>;

    /// Synchronous chat completion
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse>;

    /// Ask the engine to drop `model` from memory now
    async fn unload(&self, model: &str) -> Result<()>;
}

/// HTTP client for an Ollama-compatible engine
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    timeout: Option<Duration>,
}

impl OllamaClient {
    /// Create a client. `timeout` of `None` waits forever on every call.
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| ClusterLoopError::transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_timeout(&self, request: RequestBuilder) -> RequestBuilder {
        match self.timeout {
            Some(timeout) => request.timeout(timeout),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        let response = self
            .with_timeout(request)
            .send()
            .await
            .map_err(|e| map_reqwest_error(what, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClusterLoopError::transport(format!(
                "{} returned {}: {}",
                what, status, body
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| map_reqwest_error(what, e))
    }
}

fn map_reqwest_error(what: &str, err: reqwest::Error) -> ClusterLoopError {
    if err.is_timeout() {
        ClusterLoopError::timeout(format!("{}: {}", what, err))
    } else {
        ClusterLoopError::transport(format!("{}: {}", what, err))
    }
}

#[async_trait]
impl InferenceEngine for OllamaClient {
    async fn list_installed(&self) -> Result<Vec<InstalledModel>> {
        let response: InstalledModelsResponse = self
            .send(self.client.get(self.endpoint(TAGS_PATH)), "list installed models")
            .await?;
        Ok(response.models)
    }

    async fn list_loaded(&self) -> Result<Vec<LoadedModelEntry>> {
        let response: LoadedModelsResponse = self
            .send(self.client.get(self.endpoint(PS_PATH)), "list loaded models")
            .await?;

        debug!(
            "Engine reports {} loaded model(s): {:?}",
            response.models.len(),
            response.models.iter().map(|m| m.name.as_str()).collect::<Vec<_>>()
        );
        Ok(response.models)
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Sending chat request to engine"
        );
        self.send(
            self.client.post(self.endpoint(CHAT_PATH)).json(&request),
            "chat",
        )
        .await
    }

    async fn unload(&self, model: &str) -> Result<()> {
        let response = self
            .with_timeout(
                self.client
                    .post(self.endpoint(CHAT_PATH))
                    .json(&UnloadRequest::new(model)),
            )
            .send()
            .await
            .map_err(|e| map_reqwest_error("unload", e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClusterLoopError::transport(format!(
                "unload of {} returned {}: {}",
                model, status, body
            )));
        }
        Ok(())
    }
}
