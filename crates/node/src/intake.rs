//! Job intake and routing
//!
//! A fixed-interval poll loop pulls at most as many messages as there are free
//! admission slots, and nothing while the node is full. Each message then walks
//! `Fetched -> HeaderValidated -> CapabilityChecked -> Admitted -> Processing`
//! and ends either acked or not acked. Messages this node declines are simply
//! not acked, which hands them back to the consumer group for another member.
//! Admitted jobs send periodic in-progress acks so the bus does not redeliver
//! them while the engine is still working.

use crate::admission::{AdmissionController, AdmissionPermit};
use crate::bus::{Delivery, JobSource};
use crate::catalog::ModelCatalog;
use crate::invocation::Invoker;
use crate::job::{check_header_model, decode_job};
use clusterloop_common::{NodeConfig, Result, METRICS};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, field, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Why a message was left for another consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclineReason {
    /// No capability header naming a model
    MissingHeader,

    /// Requested model is not in this node's catalog
    CapabilityMiss,

    /// Capacity exceeded right now
    AdmissionDenied,
}

impl DeclineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeclineReason::MissingHeader => "missing_header",
            DeclineReason::CapabilityMiss => "capability_miss",
            DeclineReason::AdmissionDenied => "admission_denied",
        }
    }
}

/// Routing decision for one fetched message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    Declined(DeclineReason),

    /// A worker was spawned for the job
    Admitted { request_id: String, model: String },
}

/// Terminal state of an admitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Acked,
    NotAcked,
}

/// Poll loop tuning
#[derive(Debug, Clone)]
pub struct IntakeSettings {
    pub poll_interval: Duration,
    pub max_fetch_batch: usize,
    pub model_header: String,
    pub shutdown_grace: Duration,
    pub progress_interval: Duration,
}

impl IntakeSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_fetch_batch: config.intake.max_fetch_batch,
            model_header: config.intake.model_header.clone(),
            shutdown_grace: config.shutdown_grace(),
            progress_interval: config.progress_interval(),
        }
    }
}

/// Per-node job router
pub struct JobRouter {
    source: Arc<dyn JobSource>,
    catalog: Arc<ModelCatalog>,
    admission: Arc<AdmissionController>,
    invoker: Arc<Invoker>,
    settings: IntakeSettings,
}

impl JobRouter {
    pub fn new(
        source: Arc<dyn JobSource>,
        catalog: Arc<ModelCatalog>,
        admission: Arc<AdmissionController>,
        invoker: Arc<Invoker>,
        settings: IntakeSettings,
    ) -> Self {
        Self {
            source,
            catalog,
            admission,
            invoker,
            settings,
        }
    }

    /// Size of the next fetch, or `None` when every slot is taken
    pub fn next_batch_size(&self) -> Option<usize> {
        match self.admission.available_slots() {
            0 => None,
            slots => Some(slots.min(self.settings.max_fetch_batch)),
        }
    }

    /// One poll cycle: fetch a bounded batch and route every message in it.
    /// A full node fetches nothing, leaving the messages to its peers.
    pub async fn poll_once(&self, workers: &mut JoinSet<JobOutcome>) -> Result<Vec<RouteDecision>> {
        let Some(batch_size) = self.next_batch_size() else {
            return Ok(Vec::new());
        };
        let deliveries = self.source.fetch(batch_size).await?;
        if !deliveries.is_empty() {
            debug!("Fetched {} message(s) (batch size {})", deliveries.len(), batch_size);
        }
        METRICS.intake.jobs_fetched.inc_by(deliveries.len() as u64);

        Ok(deliveries
            .into_iter()
            .map(|delivery| self.route(delivery, workers))
            .collect())
    }

    /// Decide what happens to one message; spawns a worker when admitted
    pub fn route(
        &self,
        delivery: Box<dyn Delivery>,
        workers: &mut JoinSet<JobOutcome>,
    ) -> RouteDecision {
        let Some(model) = delivery
            .header(&self.settings.model_header)
            .filter(|m| !m.is_empty())
        else {
            return self.decline(delivery.subject(), DeclineReason::MissingHeader);
        };

        if !self.catalog.contains(&model) {
            return self.decline(delivery.subject(), DeclineReason::CapabilityMiss);
        }

        let Some(permit) = self.admission.try_acquire() else {
            return self.decline(delivery.subject(), DeclineReason::AdmissionDenied);
        };

        METRICS.intake.jobs_admitted.inc();
        let request_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "job",
            request_id = %request_id,
            model = %model,
            conversation_id = field::Empty,
            thread_id = field::Empty
        );

        let job = AdmittedJob {
            delivery,
            permit,
            request_id: request_id.clone(),
            model: model.clone(),
        };
        workers.spawn(
            process(
                Arc::clone(&self.invoker),
                job,
                self.settings.progress_interval,
            )
            .instrument(span),
        );

        RouteDecision::Admitted { request_id, model }
    }

    fn decline(&self, subject: &str, reason: DeclineReason) -> RouteDecision {
        debug!("Leaving {} for another consumer: {}", subject, reason.as_str());
        METRICS
            .intake
            .jobs_declined
            .with_label_values(&[reason.as_str()])
            .inc();
        RouteDecision::Declined(reason)
    }

    /// Poll until `shutdown` resolves, then give in-flight jobs the grace
    /// period to finish.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut workers = JoinSet::new();
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            "Job intake running: poll every {:?}, up to {} per fetch",
            self.settings.poll_interval, self.settings.max_fetch_batch
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    while let Some(joined) = workers.try_join_next() {
                        log_join(joined);
                    }

                    if let Err(e) = self.poll_once(&mut workers).await {
                        error!("Error fetching messages: {}", e);
                    }
                }
            }
        }

        self.drain(workers).await;
        Ok(())
    }

    async fn drain(&self, mut workers: JoinSet<JobOutcome>) {
        if workers.is_empty() {
            return;
        }

        info!("Waiting for {} in-flight job(s)", workers.len());
        let drained = tokio::time::timeout(self.settings.shutdown_grace, async {
            while let Some(joined) = workers.join_next().await {
                log_join(joined);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                "Shutdown grace of {:?} elapsed, abandoning {} job(s) for redelivery",
                self.settings.shutdown_grace,
                workers.len()
            );
            workers.abort_all();
        }
    }
}

fn log_join(joined: std::result::Result<JobOutcome, tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Job worker panicked: {}", e);
        }
    }
}

/// A message that passed routing, with the slot it holds
struct AdmittedJob {
    delivery: Box<dyn Delivery>,
    permit: AdmissionPermit,
    request_id: String,

    /// Model named by the capability header
    model: String,
}

/// Worker body. The permit is held for the whole job and released on every
/// exit path when it drops.
async fn process(
    invoker: Arc<Invoker>,
    admitted: AdmittedJob,
    progress_interval: Duration,
) -> JobOutcome {
    let AdmittedJob {
        delivery,
        permit: _permit,
        request_id,
        model,
    } = admitted;

    let job = match decode_job(delivery.payload())
        .and_then(|job| check_header_model(&job, &model).map(|()| job))
    {
        Ok(job) => job,
        Err(e) => {
            error!("Dropping undecodable job on {}: {}", delivery.subject(), e);
            METRICS.intake.jobs_failed.inc();
            return JobOutcome::NotAcked;
        }
    };

    let span = Span::current();
    span.record("conversation_id", job.conversation_id.as_str());
    span.record("thread_id", job.thread_id);
    info!("Processing job");

    let invocation = invoker.invoke(&job, &request_id);
    tokio::pin!(invocation);
    let mut heartbeat =
        tokio::time::interval_at(Instant::now() + progress_interval, progress_interval);

    let invoked = loop {
        tokio::select! {
            result = &mut invocation => break result,
            _ = heartbeat.tick() => {
                if let Err(e) = delivery.in_progress().await {
                    warn!("Failed to extend claim on {}: {}", delivery.subject(), e);
                }
            }
        }
    };

    if let Err(e) = invoked {
        error!("Error processing job: {}", e);
        METRICS.intake.jobs_failed.inc();
        return JobOutcome::NotAcked;
    }

    match delivery.ack().await {
        Ok(()) => {
            METRICS.intake.jobs_acked.inc();
            info!("Job completed and acknowledged");
            JobOutcome::Acked
        }
        Err(e) => {
            // Result is already out; a redelivery will produce a duplicate
            warn!("Result published but ack failed: {}", e);
            METRICS.intake.jobs_failed.inc();
            JobOutcome::NotAcked
        }
    }
}
