//! Configuration structures for ClusterLoop
//!
//! This module defines the node configuration. It is loaded from a YAML file
//! and a handful of fields can be overridden by environment variables.
//! Capacity tunables are NOT part of this file: they live in a separate
//! persisted record referenced by `capacity.settings_path`.

use crate::error::{ClusterLoopError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for a ClusterLoop node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identifier used in logs
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Job bus configuration
    pub bus: BusConfig,

    /// Local inference engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Where the capacity record lives
    pub capacity: CapacityConfig,

    /// Loaded-model budget
    #[serde(default)]
    pub residency: ResidencyConfig,

    /// Model catalog file
    pub catalog: CatalogConfig,

    /// Poll loop tuning
    #[serde(default)]
    pub intake: IntakeConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Job bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// NATS server URL
    pub nats_url: String,

    /// Stream holding job and result subjects
    #[serde(default = "default_stream_name")]
    pub stream_name: String,

    /// Subject pattern jobs are published under
    #[serde(default = "default_job_subject")]
    pub job_subject: String,

    /// Prefix of result subjects (`<prefix>.<conversation>.<thread>`)
    #[serde(default = "default_result_subject_prefix")]
    pub result_subject_prefix: String,

    /// Durable consumer name shared by every node
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Stream for node-level configuration traffic
    #[serde(default = "default_nodes_stream")]
    pub nodes_stream: String,

    /// Subject models are announced on
    #[serde(default = "default_model_sync_subject")]
    pub model_sync_subject: String,

    /// Connection attempts before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,

    /// Delay between connection attempts
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,

    /// Timeout of a single connection attempt
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Deadline for a publish to be acknowledged by the stream
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,

    /// How long a fetch waits for messages
    #[serde(default = "default_fetch_expiry_ms")]
    pub fetch_expiry_ms: u64,

    /// Redelivery window for un-acked jobs
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
}

impl BusConfig {
    /// Get publish deadline as Duration
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    /// Get redelivery window as Duration
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }
}

/// Inference engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the engine's REST API
    #[serde(default = "default_engine_url")]
    pub base_url: String,

    /// Per-call timeout in seconds (0 = wait forever)
    #[serde(default = "default_engine_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_engine_url(),
            request_timeout_secs: default_engine_timeout(),
        }
    }
}

/// Capacity record location and provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityConfig {
    /// Path of the persisted capacity record
    pub settings_path: PathBuf,

    /// Compute capacity from host RAM and persist it before loading
    #[serde(default)]
    pub provision_on_start: bool,

    /// Delay between admissions written when provisioning
    #[serde(default = "default_message_delay_ms")]
    pub default_message_delay_ms: u64,
}

/// Loaded-model budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidencyConfig {
    /// Maximum models resident in the engine at once
    #[serde(default = "default_max_resident_models")]
    pub max_resident_models: usize,
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        Self {
            max_resident_models: default_max_resident_models(),
        }
    }
}

/// Model catalog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Catalog JSON file
    pub path: PathBuf,

    /// Rewrite the catalog from the engine's installed models on start
    #[serde(default = "default_true")]
    pub sync_on_start: bool,

    /// Publish every catalog model on the model-sync subject on start
    #[serde(default = "default_true")]
    pub announce_on_start: bool,
}

/// Poll loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// Ticker period of the poll loop
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Hard cap on a single fetch
    #[serde(default = "default_max_fetch_batch")]
    pub max_fetch_batch: usize,

    /// Header carrying the requested model
    #[serde(default = "default_model_header")]
    pub model_header: String,

    /// Time allowed for in-flight jobs on shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Period of in-progress acks while a job runs; must be below `bus.ack_wait_secs`
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_fetch_batch: default_max_fetch_batch(),
            model_header: default_model_header(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            progress_interval_secs: default_progress_interval_secs(),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: false,
        }
    }
}

/// Default value functions
fn default_node_id() -> String {
    "node".to_string()
}

fn default_stream_name() -> String {
    "messages".to_string()
}

fn default_job_subject() -> String {
    "in.chat.>".to_string()
}

fn default_result_subject_prefix() -> String {
    "out.chat".to_string()
}

fn default_consumer_group() -> String {
    "message_processors".to_string()
}

fn default_nodes_stream() -> String {
    "nodes".to_string()
}

fn default_model_sync_subject() -> String {
    "config.sync.models".to_string()
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_connect_retry_delay_ms() -> u64 {
    2000
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_publish_timeout_secs() -> u64 {
    5
}

fn default_fetch_expiry_ms() -> u64 {
    100
}

fn default_ack_wait_secs() -> u64 {
    30
}

fn default_engine_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_engine_timeout() -> u64 {
    300
}

fn default_message_delay_ms() -> u64 {
    500
}

fn default_max_resident_models() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_fetch_batch() -> usize {
    16
}

fn default_model_header() -> String {
    "model".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_progress_interval_secs() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl NodeConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path).map_err(|e| {
            ClusterLoopError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::from_yaml(&content).map_err(|e| match e {
            ClusterLoopError::Config(msg) => {
                ClusterLoopError::Config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: NodeConfig = serde_yaml::from_str(content)
            .map_err(|e| ClusterLoopError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("CLUSTERLOOP_NATS_URL") {
            self.bus.nats_url = url;
        }
        if let Some(url) = lookup("CLUSTERLOOP_ENGINE_URL") {
            self.engine.base_url = url;
        }
        if let Some(id) = lookup("CLUSTERLOOP_NODE_ID") {
            self.node_id = id;
        }

        self.validate()?;
        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.bus.nats_url.trim().is_empty() {
            return Err(ClusterLoopError::config("bus.nats_url must not be empty"));
        }
        if self.bus.consumer_group.trim().is_empty() {
            return Err(ClusterLoopError::config("bus.consumer_group must not be empty"));
        }
        if self.bus.job_subject.trim().is_empty() {
            return Err(ClusterLoopError::config("bus.job_subject must not be empty"));
        }
        if self.bus.connect_attempts == 0 {
            return Err(ClusterLoopError::config("bus.connect_attempts must be at least 1"));
        }
        if self.engine.base_url.trim().is_empty() {
            return Err(ClusterLoopError::config("engine.base_url must not be empty"));
        }
        if self.residency.max_resident_models == 0 {
            return Err(ClusterLoopError::config(
                "residency.max_resident_models must be at least 1",
            ));
        }
        if self.intake.poll_interval_ms == 0 {
            return Err(ClusterLoopError::config("intake.poll_interval_ms must be positive"));
        }
        if self.intake.max_fetch_batch == 0 {
            return Err(ClusterLoopError::config("intake.max_fetch_batch must be positive"));
        }
        if self.intake.model_header.trim().is_empty() {
            return Err(ClusterLoopError::config("intake.model_header must not be empty"));
        }
        // A running job must be kept claimed before the bus redelivers it
        if self.intake.progress_interval_secs == 0
            || self.intake.progress_interval_secs >= self.bus.ack_wait_secs
        {
            return Err(ClusterLoopError::config(format!(
                "intake.progress_interval_secs must be between 1 and bus.ack_wait_secs ({}) exclusive",
                self.bus.ack_wait_secs
            )));
        }
        Ok(())
    }

    /// Get poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.intake.poll_interval_ms)
    }

    /// Get in-progress ack period as Duration
    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.intake.progress_interval_secs)
    }

    /// Get engine call timeout, `None` when unbounded
    pub fn engine_timeout(&self) -> Option<Duration> {
        match self.engine.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Get shutdown grace period as Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.intake.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const MINIMAL: &str = r#"
bus:
  nats_url: "nats://127.0.0.1:4222"
capacity:
  settings_path: "/tmp/node-config.json"
catalog:
  path: "/tmp/models.json"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = NodeConfig::from_yaml(MINIMAL).unwrap();

        assert_eq!(config.bus.stream_name, "messages");
        assert_eq!(config.bus.job_subject, "in.chat.>");
        assert_eq!(config.bus.consumer_group, "message_processors");
        assert_eq!(config.bus.connect_attempts, 5);
        assert_eq!(config.engine.base_url, "http://localhost:11434");
        assert_eq!(config.residency.max_resident_models, 2);
        assert_eq!(config.intake.model_header, "model");
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.bus.publish_timeout(), Duration::from_secs(5));
        assert_eq!(config.progress_interval(), Duration::from_secs(10));
        assert!(config.progress_interval() < config.bus.ack_wait());
        assert!(config.catalog.sync_on_start);
        assert!(!config.capacity.provision_on_start);
    }

    #[test]
    fn test_zero_engine_timeout_is_unbounded() {
        let mut config = NodeConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.engine_timeout(), Some(Duration::from_secs(300)));

        config.engine.request_timeout_secs = 0;
        assert_eq!(config.engine_timeout(), None);
    }

    #[test]
    fn test_config_validation_zero_residency() {
        let mut config = NodeConfig::from_yaml(MINIMAL).unwrap();
        config.residency.max_resident_models = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_progress_interval_must_beat_ack_wait() {
        let mut config = NodeConfig::from_yaml(MINIMAL).unwrap();

        config.intake.progress_interval_secs = config.bus.ack_wait_secs;
        assert!(config.validate().is_err());

        config.intake.progress_interval_secs = 0;
        assert!(config.validate().is_err());

        config.intake.progress_interval_secs = config.bus.ack_wait_secs - 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_empty_url() {
        let yaml = MINIMAL.replace("nats://127.0.0.1:4222", "");
        assert!(matches!(
            NodeConfig::from_yaml(&yaml),
            Err(ClusterLoopError::Config(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("CLUSTERLOOP_NATS_URL", "nats://10.0.0.1:4222"),
            ("CLUSTERLOOP_NODE_ID", "gpu-box"),
        ]
        .into_iter()
        .collect();

        let config = NodeConfig::from_yaml(MINIMAL)
            .unwrap()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.bus.nats_url, "nats://10.0.0.1:4222");
        assert_eq!(config.node_id, "gpu-box");
        assert_eq!(config.engine.base_url, "http://localhost:11434");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.catalog.path, PathBuf::from("/tmp/models.json"));
    }

    #[test]
    fn test_from_missing_file() {
        let err = NodeConfig::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ClusterLoopError::Config(_)));
    }
}
