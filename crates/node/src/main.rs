//! ClusterLoop Node - Main Entry Point
//!
//! Loads the node's capacity record and model catalog, connects to the job bus
//! and the local inference engine, then competes for chat jobs until ctrl-c.

use anyhow::Context;
use clusterloop_common::{NodeConfig, METRICS};
use clusterloop_node::{
    AdmissionController, CapacitySettings, IntakeSettings, InferenceEngine, Invoker, JobRouter,
    ModelCatalog, NatsBus, OllamaClient, ResidencyCache,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config_path = std::env::var("CLUSTERLOOP_CONFIG")
        .unwrap_or_else(|_| "configs/node-config.yaml".to_string());

    let config = NodeConfig::from_file(&config_path)
        .and_then(NodeConfig::with_env_overrides)
        .with_context(|| format!("loading configuration from {}", config_path))?;

    // Initialize logging
    let structured = config.observability.structured_logging;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("clusterloop_node={}", config.observability.log_level).into()
            }),
        )
        .with(structured.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!structured).then(tracing_subscriber::fmt::layer))
        .init();

    info!(
        "Starting ClusterLoop node {} (engine {}, bus {})",
        config.node_id, config.engine.base_url, config.bus.nats_url
    );

    // Capacity record
    if config.capacity.provision_on_start {
        let provisioned = CapacitySettings::from_host(Duration::from_millis(
            config.capacity.default_message_delay_ms,
        ));
        provisioned
            .persist(&config.capacity.settings_path)
            .context("provisioning capacity settings")?;
    }
    let capacity = CapacitySettings::load(&config.capacity.settings_path)
        .context("capacity settings are required to start")?;

    // Inference engine
    let engine: Arc<dyn InferenceEngine> = Arc::new(
        OllamaClient::new(config.engine.base_url.clone(), config.engine_timeout())
            .context("creating engine client")?,
    );

    // Model catalog
    let catalog = if config.catalog.sync_on_start {
        match ModelCatalog::sync_from_engine(engine.as_ref(), &config.catalog.path).await {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!("Catalog sync failed, using the file on disk: {}", e);
                ModelCatalog::load(&config.catalog.path).context("loading model catalog")?
            }
        }
    } else {
        ModelCatalog::load(&config.catalog.path).context("loading model catalog")?
    };

    if catalog.is_empty() {
        warn!("Model catalog is empty, every job will be left for other nodes");
    }
    info!("Serving {} model(s): {:?}", catalog.len(), catalog.names().collect::<Vec<_>>());

    // Job bus
    let bus = NatsBus::connect(&config.bus)
        .await
        .context("connecting to the job bus")?;
    bus.provision_streams().await.context("provisioning streams")?;

    if config.catalog.announce_on_start {
        if let Err(e) = bus.announce_models(&catalog).await {
            warn!("Failed to announce models: {}", e);
        }
    }

    let source = bus.job_source().await.context("binding consumer group")?;

    // Pipeline
    let residency = Arc::new(ResidencyCache::new(
        Arc::clone(&engine),
        config.residency.max_resident_models,
    ));
    let admission = Arc::new(AdmissionController::new(capacity));
    let invoker = Arc::new(Invoker::new(engine, residency, Arc::new(bus)));

    let router = JobRouter::new(
        Arc::new(source),
        Arc::new(catalog),
        admission,
        invoker,
        IntakeSettings::from_config(&config),
    );

    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
    };

    router.run(shutdown).await?;

    debug!("Final metrics:\n{}", METRICS.gather());
    info!("ClusterLoop node shutdown complete");
    Ok(())
}
