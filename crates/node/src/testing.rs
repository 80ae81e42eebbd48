//! In-memory engine and bus doubles for unit tests

use crate::bus::{Delivery, JobSource, ResultPublisher};
use crate::engine::InferenceEngine;
use async_trait::async_trait;
use clusterloop_common::{ClusterLoopError, Result};
use clusterloop_proto::{
    ChatMessage, ChatRequest, ChatResponse, InferenceResult, InstalledModel, LoadedModelEntry,
    ModelDetails,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

pub fn installed(name: &str) -> InstalledModel {
    InstalledModel {
        name: name.to_string(),
        modified_at: String::new(),
        size: 0,
        digest: String::new(),
        details: ModelDetails::default(),
    }
}

pub fn job_body(conversation_id: &str, thread_id: i64, model: &str) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "conversation_id": conversation_id,
        "thread_id": thread_id,
        "model": model,
        "messages": [{"role": "user", "content": "hi"}]
    }))
    .unwrap()
}

#[derive(Default)]
struct EngineState {
    loaded: Vec<String>,
    installed: Vec<InstalledModel>,
    unloads: Vec<String>,
    chats: Vec<ChatRequest>,
    fail_list: bool,
    fail_unload: bool,
    fail_chat: bool,
}

/// Engine that echoes the last message back and tracks what is loaded
pub struct FakeEngine {
    state: Mutex<EngineState>,
    held: watch::Sender<bool>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            held: watch::channel(false).0,
        }
    }
}

impl FakeEngine {
    pub fn with_loaded(models: &[&str]) -> Self {
        let engine = Self::default();
        engine.set_loaded(models);
        engine
    }

    pub fn set_loaded(&self, models: &[&str]) {
        self.state.lock().loaded = models.iter().map(|m| m.to_string()).collect();
    }

    pub fn set_installed(&self, models: Vec<InstalledModel>) {
        self.state.lock().installed = models;
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.lock().fail_list = fail;
    }

    pub fn fail_unload(&self, fail: bool) {
        self.state.lock().fail_unload = fail;
    }

    pub fn fail_chat(&self, fail: bool) {
        self.state.lock().fail_chat = fail;
    }

    /// Park chat calls until [`FakeEngine::release_chats`]
    pub fn hold_chats(&self) {
        self.held.send_replace(true);
    }

    pub fn release_chats(&self) {
        self.held.send_replace(false);
    }

    pub fn unloads(&self) -> Vec<String> {
        self.state.lock().unloads.clone()
    }

    pub fn chats(&self) -> Vec<ChatRequest> {
        self.state.lock().chats.clone()
    }
}

#[async_trait]
impl InferenceEngine for FakeEngine {
    async fn list_installed(&self) -> Result<Vec<InstalledModel>> {
        let state = self.state.lock();
        if state.fail_list {
            return Err(ClusterLoopError::transport("engine down"));
        }
        Ok(state.installed.clone())
    }

    async fn list_loaded(&self) -> Result<Vec<LoadedModelEntry>> {
        let state = self.state.lock();
        if state.fail_list {
            return Err(ClusterLoopError::transport("engine down"));
        }
        Ok(state
            .loaded
            .iter()
            .map(|name| LoadedModelEntry { name: name.clone() })
            .collect())
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        let mut state = self.state.lock();
        state.chats.push(request.clone());
        if state.fail_chat {
            return Err(ClusterLoopError::transport("engine returned 500"));
        }

        if !state.loaded.contains(&request.model) {
            state.loaded.push(request.model.clone());
        }

        let last = request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        Ok(ChatResponse {
            model: request.model.clone(),
            created_at: String::new(),
            message: ChatMessage::assistant(format!("echo: {}", last)),
            done: true,
        })
    }

    async fn unload(&self, model: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.unloads.push(model.to_string());
        if state.fail_unload {
            return Err(ClusterLoopError::transport("unload refused"));
        }
        state.loaded.retain(|m| m != model);
        Ok(())
    }
}

/// Publisher that keeps everything it is given
#[derive(Default)]
pub struct FakePublisher {
    published: Mutex<Vec<InferenceResult>>,
    fail: AtomicBool,
}

impl FakePublisher {
    pub fn published(&self) -> Vec<InferenceResult> {
        self.published.lock().clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ResultPublisher for FakePublisher {
    async fn publish_result(&self, result: &InferenceResult) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ClusterLoopError::timeout("publish timed out"));
        }
        self.published.lock().push(result.clone());
        Ok(())
    }
}

pub struct FakeDelivery {
    subject: String,
    headers: HashMap<String, String>,
    payload: Vec<u8>,
    acked: Arc<AtomicBool>,
    progress: Arc<AtomicUsize>,
}

impl FakeDelivery {
    pub fn with_model(model: &str, payload: Vec<u8>) -> Self {
        let mut delivery = Self::without_header(payload);
        delivery.headers.insert("model".to_string(), model.to_string());
        delivery
    }

    pub fn without_header(payload: Vec<u8>) -> Self {
        Self {
            subject: "in.chat.test.1".to_string(),
            headers: HashMap::new(),
            payload,
            acked: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Flag set once the delivery is acked
    pub fn acked(&self) -> Arc<AtomicBool> {
        self.acked.clone()
    }

    /// Count of in-progress acks sent
    pub fn progress(&self) -> Arc<AtomicUsize> {
        self.progress.clone()
    }
}

#[async_trait]
impl Delivery for FakeDelivery {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn header(&self, name: &str) -> Option<String> {
        self.headers.get(name).cloned()
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<()> {
        self.acked.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn in_progress(&self) -> Result<()> {
        self.progress.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Queue of deliveries handed out in order
#[derive(Default)]
pub struct FakeSource {
    queue: Mutex<VecDeque<FakeDelivery>>,
    fetch_sizes: Mutex<Vec<usize>>,
}

impl FakeSource {
    pub fn push(&self, delivery: FakeDelivery) {
        self.queue.lock().push_back(delivery);
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn fetch_sizes(&self) -> Vec<usize> {
        self.fetch_sizes.lock().clone()
    }
}

#[async_trait]
impl JobSource for FakeSource {
    async fn fetch(&self, max_messages: usize) -> Result<Vec<Box<dyn Delivery>>> {
        self.fetch_sizes.lock().push(max_messages);
        let mut queue = self.queue.lock();
        let take = max_messages.min(queue.len());
        Ok(queue
            .drain(..take)
            .map(|d| Box::new(d) as Box<dyn Delivery>)
            .collect())
    }
}
