//! Job bus adapter
//!
//! Every node binds to the same durable pull consumer on the same subject
//! pattern, which turns the stream into a work queue: a message goes to one
//! member at a time and is redelivered to some member if it is not acked
//! within the ack-wait window. The intake pipeline only sees the traits below;
//! [`NatsBus`] implements them over NATS JetStream.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy, PullConsumer},
    AckKind,
    stream::{RetentionPolicy, StorageType},
};
use async_nats::HeaderMap;
use async_trait::async_trait;
use bytes::Bytes;
use clusterloop_common::config::BusConfig;
use clusterloop_common::{ClusterLoopError, Result};
use clusterloop_proto::{IncomingJob, InferenceResult, ModelSyncMessage};
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::catalog::ModelCatalog;

/// One message pulled from the bus
#[async_trait]
pub trait Delivery: Send + Sync {
    fn subject(&self) -> &str;

    /// Value of header `name`, if present
    fn header(&self, name: &str) -> Option<String>;

    fn payload(&self) -> &[u8];

    /// Acknowledge: the message will not be redelivered
    async fn ack(&self) -> Result<()>;

    /// Still working on it: restart the redelivery timer
    async fn in_progress(&self) -> Result<()>;
}

/// Source of candidate jobs
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Pull at most `max_messages`. An empty batch is not an error.
    async fn fetch(&self, max_messages: usize) -> Result<Vec<Box<dyn Delivery>>>;
}

/// Sink for inference results
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish_result(&self, result: &InferenceResult) -> Result<()>;
}

/// JetStream connection plus the subjects this node uses
#[derive(Clone)]
pub struct NatsBus {
    jetstream: jetstream::Context,
    config: BusConfig,
}

impl NatsBus {
    /// Connect, retrying a bounded number of times
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        let attempts = config.connect_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let options = async_nats::ConnectOptions::new()
                .connection_timeout(Duration::from_secs(config.connect_timeout_secs));

            match options.connect(config.nats_url.as_str()).await {
                Ok(client) => {
                    info!("Connected to NATS at {}", config.nats_url);
                    return Ok(Self {
                        jetstream: jetstream::new(client),
                        config: config.clone(),
                    });
                }
                Err(e) => {
                    warn!(
                        "Failed to connect to NATS at {} (attempt {}/{}): {}",
                        config.nats_url, attempt, attempts, e
                    );
                    last_error = Some(e.to_string());
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(config.connect_retry_delay_ms))
                            .await;
                    }
                }
            }
        }

        Err(ClusterLoopError::transport(format!(
            "could not connect to NATS at {} after {} attempts: {}",
            config.nats_url,
            attempts,
            last_error.unwrap_or_default()
        )))
    }

    /// Create the job/result stream and the nodes stream if missing
    pub async fn provision_streams(&self) -> Result<()> {
        let result_subjects = format!("{}.>", self.config.result_subject_prefix);

        self.ensure_stream(
            &self.config.stream_name,
            vec![self.config.job_subject.clone(), result_subjects],
        )
        .await?;
        self.ensure_stream(&self.config.nodes_stream, vec!["config.>".to_string()])
            .await?;
        Ok(())
    }

    async fn ensure_stream(&self, name: &str, subjects: Vec<String>) -> Result<()> {
        let stream = self
            .jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: name.to_string(),
                subjects,
                retention: RetentionPolicy::WorkQueue,
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| ClusterLoopError::transport(format!("stream {}: {}", name, e)))?;

        debug!("Stream {} ready: {:?}", name, stream.cached_info().config.subjects);
        Ok(())
    }

    /// Bind to the shared durable consumer
    pub async fn job_source(&self) -> Result<NatsJobSource> {
        let group = &self.config.consumer_group;

        let stream = self
            .jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| {
                ClusterLoopError::transport(format!("stream {}: {}", self.config.stream_name, e))
            })?;

        let consumer: PullConsumer = stream
            .get_or_create_consumer(
                group,
                pull::Config {
                    durable_name: Some(group.clone()),
                    filter_subject: self.config.job_subject.clone(),
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy: DeliverPolicy::All,
                    ack_wait: self.config.ack_wait(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| ClusterLoopError::transport(format!("consumer {}: {}", group, e)))?;

        info!(
            "Bound to consumer group {} on {}",
            group, self.config.job_subject
        );

        Ok(NatsJobSource {
            consumer,
            expiry: Duration::from_millis(self.config.fetch_expiry_ms),
        })
    }

    /// Publish and wait for the stream's ack, bounded by the publish deadline
    async fn publish(&self, subject: String, headers: HeaderMap, payload: Bytes) -> Result<u64> {
        let deadline = self.config.publish_timeout();

        let publish = async {
            let pending = self
                .jetstream
                .publish_with_headers(subject.clone(), headers, payload)
                .await
                .map_err(|e| ClusterLoopError::transport(format!("publish to {}: {}", subject, e)))?;

            pending
                .await
                .map_err(|e| ClusterLoopError::transport(format!("publish ack for {}: {}", subject, e)))
        };

        let ack = tokio::time::timeout(deadline, publish).await.map_err(|_| {
            ClusterLoopError::timeout(format!("publish to {} exceeded {:?}", subject, deadline))
        })??;

        debug!("Published to {}, sequence {}", subject, ack.sequence);
        Ok(ack.sequence)
    }

    /// Submit a job the way a requester does, with the capability header set
    pub async fn publish_job(&self, job: &IncomingJob, model_header: &str) -> Result<u64> {
        let prefix = self.config.job_subject.trim_end_matches(".>");
        let mut headers = HeaderMap::new();
        headers.insert(model_header, job.requested_model.as_str());

        let payload = Bytes::from(serde_json::to_vec(job)?);
        self.publish(job.subject(prefix), headers, payload).await
    }

    /// Announce every catalog model on the model-sync subject
    pub async fn announce_models(&self, catalog: &ModelCatalog) -> Result<usize> {
        let mut announced = 0;
        for name in catalog.names() {
            let payload = Bytes::from(serde_json::to_vec(&ModelSyncMessage {
                name: name.to_string(),
            })?);

            self.publish(self.config.model_sync_subject.clone(), HeaderMap::new(), payload)
                .await?;
            announced += 1;
        }

        info!("Announced {} model(s) on {}", announced, self.config.model_sync_subject);
        Ok(announced)
    }
}

#[async_trait]
impl ResultPublisher for NatsBus {
    async fn publish_result(&self, result: &InferenceResult) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(result)?);
        self.publish(
            result.subject(&self.config.result_subject_prefix),
            HeaderMap::new(),
            payload,
        )
        .await?;
        Ok(())
    }
}

/// Pull side of the shared durable consumer
pub struct NatsJobSource {
    consumer: PullConsumer,
    expiry: Duration,
}

#[async_trait]
impl JobSource for NatsJobSource {
    async fn fetch(&self, max_messages: usize) -> Result<Vec<Box<dyn Delivery>>> {
        let mut messages = self
            .consumer
            .fetch()
            .max_messages(max_messages)
            .expires(self.expiry)
            .messages()
            .await
            .map_err(|e| ClusterLoopError::transport(format!("fetch: {}", e)))?;

        let mut batch: Vec<Box<dyn Delivery>> = Vec::new();
        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => batch.push(Box::new(NatsDelivery::new(message))),
                Err(e) => {
                    // Whatever arrived before the error is still handed out
                    if batch.is_empty() {
                        return Err(ClusterLoopError::transport(format!("fetch: {}", e)));
                    }
                    warn!("Fetch ended early: {}", e);
                    break;
                }
            }
        }

        Ok(batch)
    }
}

struct NatsDelivery {
    subject: String,
    message: jetstream::Message,
}

impl NatsDelivery {
    fn new(message: jetstream::Message) -> Self {
        Self {
            subject: message.subject.to_string(),
            message,
        }
    }
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn subject(&self) -> &str {
        &self.subject
    }

    fn header(&self, name: &str) -> Option<String> {
        self.message
            .headers
            .as_ref()
            .and_then(|headers| headers.get(name))
            .map(|value| value.as_str().to_string())
    }

    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| ClusterLoopError::transport(format!("ack on {}: {}", self.subject, e)))
    }

    async fn in_progress(&self) -> Result<()> {
        self.message.ack_with(AckKind::Progress).await.map_err(|e| {
            ClusterLoopError::transport(format!("progress ack on {}: {}", self.subject, e))
        })
    }
}
