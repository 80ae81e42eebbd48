//! Capacity settings
//!
//! The two admission tunables of a node. They are read once at startup from a
//! small JSON record on local disk and never change afterwards. The record can
//! be provisioned from host memory before it is loaded.

use clusterloop_common::{ClusterLoopError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use sysinfo::System;
use tracing::info;

const GIB: u64 = 1024 * 1024 * 1024;

/// Immutable-after-load admission tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySettings {
    /// Maximum jobs processed at once
    #[serde(rename = "max_parallel_requests")]
    pub max_in_flight_requests: usize,

    /// Minimum spacing between two admissions
    #[serde(rename = "message_delay_ms", with = "duration_ms")]
    pub min_interval_between_admissions: Duration,
}

impl CapacitySettings {
    pub fn new(max_in_flight_requests: usize, min_interval_between_admissions: Duration) -> Self {
        Self {
            max_in_flight_requests,
            min_interval_between_admissions,
        }
    }

    /// Read the persisted record. A missing file is a startup error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            ClusterLoopError::config(format!(
                "Failed to read capacity settings {}: {}",
                path.display(),
                e
            ))
        })?;

        let settings: CapacitySettings = serde_json::from_slice(&data).map_err(|e| {
            ClusterLoopError::config(format!(
                "Failed to parse capacity settings {}: {}",
                path.display(),
                e
            ))
        })?;

        info!(
            max_in_flight = settings.max_in_flight_requests,
            min_interval_ms = settings.min_interval_between_admissions.as_millis() as u64,
            "Capacity settings loaded from {}",
            path.display()
        );

        Ok(settings)
    }

    /// Write the record, creating parent directories as needed
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_vec(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Half a parallel request per GiB of host RAM
    pub fn from_host(message_delay: Duration) -> Self {
        let mut system = System::new();
        system.refresh_memory();

        Self::from_total_memory(system.total_memory(), message_delay)
    }

    fn from_total_memory(total_bytes: u64, message_delay: Duration) -> Self {
        let ram_gib = total_bytes / GIB;
        Self::new((ram_gib / 2) as usize, message_delay)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persist_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend").join("node-config.json");

        let settings = CapacitySettings::new(8, Duration::from_millis(500));
        settings.persist(&path).unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["max_parallel_requests"], 8);
        assert_eq!(raw["message_delay_ms"], 500);

        assert_eq!(CapacitySettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = CapacitySettings::load(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ClusterLoopError::Config(_)));
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-config.json");
        std::fs::write(&path, b"{\"max_parallel_requests\": -1}").unwrap();

        assert!(matches!(
            CapacitySettings::load(&path),
            Err(ClusterLoopError::Config(_))
        ));
    }

    #[test]
    fn test_host_sizing() {
        let settings =
            CapacitySettings::from_total_memory(32 * GIB + 123, Duration::from_millis(500));
        assert_eq!(settings.max_in_flight_requests, 16);

        let tiny = CapacitySettings::from_total_memory(GIB, Duration::ZERO);
        assert_eq!(tiny.max_in_flight_requests, 0);
    }
}
