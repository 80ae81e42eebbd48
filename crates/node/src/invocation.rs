//! Inference invocation and result publication
//!
//! Per accepted job: make room for the model (best effort), run the chat call,
//! record the use, and publish the answer addressed by conversation and thread.

use crate::bus::ResultPublisher;
use crate::engine::InferenceEngine;
use crate::job::assemble_messages;
use crate::residency::ResidencyCache;
use clusterloop_common::{Result, METRICS};
use clusterloop_proto::{ChatRequest, IncomingJob, InferenceResult};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Invoker {
    engine: Arc<dyn InferenceEngine>,
    residency: Arc<ResidencyCache>,
    publisher: Arc<dyn ResultPublisher>,
}

impl Invoker {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        residency: Arc<ResidencyCache>,
        publisher: Arc<dyn ResultPublisher>,
    ) -> Self {
        Self {
            engine,
            residency,
            publisher,
        }
    }

    pub fn residency(&self) -> &Arc<ResidencyCache> {
        &self.residency
    }

    /// Run one job end to end.
    ///
    /// Failures to make room are only logged; the engine is allowed to try
    /// and fail on its own. Engine and publish failures are returned.
    pub async fn invoke(&self, job: &IncomingJob, request_id: &str) -> Result<InferenceResult> {
        let model = job.requested_model.as_str();

        match self.residency.ensure_room(model, Some(request_id)).await {
            Ok(outcome) => {
                for eviction in outcome.unload_failures() {
                    warn!(
                        "Evicted {} for {} but the engine did not confirm the unload",
                        eviction.model, model
                    );
                }
            }
            Err(e) => warn!("Could not make room for model {}: {}", model, e),
        }

        let request = ChatRequest {
            model: model.to_string(),
            messages: assemble_messages(job),
            stream: false,
        };

        let timer = METRICS.engine.request_duration.start_timer();
        let response = match self.engine.chat(request).await {
            Ok(response) => {
                timer.observe_duration();
                response
            }
            Err(e) => {
                timer.stop_and_discard();
                METRICS.engine.request_failures.inc();
                self.residency.abandon(model, request_id);
                return Err(e);
            }
        };

        self.residency.mark_used(model);
        debug!(
            "Engine answered with {} characters (done={})",
            response.message.content.len(),
            response.done
        );

        let result = InferenceResult {
            conversation_id: job.conversation_id.clone(),
            thread_id: job.thread_id,
            content: response.message.content,
        };

        self.publisher.publish_result(&result).await?;
        Ok(result)
    }
}
