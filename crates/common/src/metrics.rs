//! Metrics collection for ClusterLoop
//!
//! This module provides Prometheus metrics for the node's intake pipeline,
//! its loaded-model cache and its calls into the inference engine.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metrics registry for ClusterLoop
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub intake: IntakeMetrics,
    pub residency: ResidencyMetrics,
    pub engine: EngineMetrics,
}

/// Job intake metrics
#[derive(Debug, Clone)]
pub struct IntakeMetrics {
    /// Messages pulled from the bus
    pub jobs_fetched: IntCounter,

    /// Messages left for another consumer, by reason
    pub jobs_declined: IntCounterVec,

    /// Messages that passed admission
    pub jobs_admitted: IntCounter,

    /// Jobs acknowledged after a published result
    pub jobs_acked: IntCounter,

    /// Admitted jobs that ended without an ack
    pub jobs_failed: IntCounter,

    /// Jobs currently holding an admission slot
    pub jobs_in_flight: IntGauge,
}

/// Loaded-model cache metrics
#[derive(Debug, Clone)]
pub struct ResidencyMetrics {
    /// Models currently tracked as resident
    pub resident_models: IntGauge,

    /// Evictions executed
    pub evictions: IntCounter,

    /// Unload calls that failed
    pub unload_failures: IntCounter,
}

/// Inference engine metrics
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    /// Chat call duration
    pub request_duration: Histogram,

    /// Chat calls that failed
    pub request_failures: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Intake metrics
        let jobs_fetched = IntCounter::new(
            "intake_jobs_fetched_total",
            "Total number of messages pulled from the job bus"
        ).unwrap();

        let jobs_declined = IntCounterVec::new(
            Opts::new(
                "intake_jobs_declined_total",
                "Messages left for another consumer"
            ),
            &["reason"]
        ).unwrap();

        let jobs_admitted = IntCounter::new(
            "intake_jobs_admitted_total",
            "Total number of jobs that passed admission"
        ).unwrap();

        let jobs_acked = IntCounter::new(
            "intake_jobs_acked_total",
            "Total number of jobs acknowledged on the bus"
        ).unwrap();

        let jobs_failed = IntCounter::new(
            "intake_jobs_failed_total",
            "Total number of admitted jobs that were not acknowledged"
        ).unwrap();

        let jobs_in_flight = IntGauge::new(
            "intake_jobs_in_flight",
            "Current number of jobs holding an admission slot"
        ).unwrap();

        // Residency metrics
        let resident_models = IntGauge::new(
            "residency_resident_models",
            "Models currently tracked as loaded in the engine"
        ).unwrap();

        let evictions = IntCounter::new(
            "residency_model_evictions_total",
            "Total number of least-recently-used evictions"
        ).unwrap();

        let unload_failures = IntCounter::new(
            "residency_model_unload_failures_total",
            "Total number of unload calls that failed"
        ).unwrap();

        // Engine metrics
        let request_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "engine_request_duration_seconds",
                "Inference engine chat call duration in seconds"
            ).buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0])
        ).unwrap();

        let request_failures = IntCounter::new(
            "engine_request_failures_total",
            "Total number of failed inference engine chat calls"
        ).unwrap();

        // Register all metrics
        registry.register(Box::new(jobs_fetched.clone())).unwrap();
        registry.register(Box::new(jobs_declined.clone())).unwrap();
        registry.register(Box::new(jobs_admitted.clone())).unwrap();
        registry.register(Box::new(jobs_acked.clone())).unwrap();
        registry.register(Box::new(jobs_failed.clone())).unwrap();
        registry.register(Box::new(jobs_in_flight.clone())).unwrap();

        registry.register(Box::new(resident_models.clone())).unwrap();
        registry.register(Box::new(evictions.clone())).unwrap();
        registry.register(Box::new(unload_failures.clone())).unwrap();

        registry.register(Box::new(request_duration.clone())).unwrap();
        registry.register(Box::new(request_failures.clone())).unwrap();

        let intake = IntakeMetrics {
            jobs_fetched,
            jobs_declined,
            jobs_admitted,
            jobs_acked,
            jobs_failed,
            jobs_in_flight,
        };

        let residency = ResidencyMetrics {
            resident_models,
            evictions,
            unload_failures,
        };

        let engine = EngineMetrics {
            request_duration,
            request_failures,
        };

        MetricsRegistry {
            registry,
            intake,
            residency,
            engine,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# failed to encode metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
