//! Model catalog
//!
//! The set of models this node is allowed to claim jobs for. It is read from a
//! node-local JSON file at startup (optionally rewritten from the engine's
//! installed-model list first) and never mutated by the intake pipeline.

use crate::engine::InferenceEngine;
use clusterloop_common::{ClusterLoopError, Result};
use clusterloop_proto::{InstalledModel, InstalledModelsResponse};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

/// Models installable/invocable on this node
#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: Vec<InstalledModel>,
    names: HashSet<String>,
}

impl ModelCatalog {
    pub fn from_models(models: Vec<InstalledModel>) -> Self {
        let names = models.iter().map(|m| m.name.clone()).collect();
        Self { models, names }
    }

    /// Read the catalog file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            ClusterLoopError::config(format!(
                "Failed to read model catalog {}: {}",
                path.display(),
                e
            ))
        })?;

        let response: InstalledModelsResponse = serde_json::from_slice(&data).map_err(|e| {
            ClusterLoopError::config(format!(
                "Failed to parse model catalog {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(Self::from_models(response.models))
    }

    /// Rewrite the catalog file from the engine's installed models and load it
    pub async fn sync_from_engine(
        engine: &dyn InferenceEngine,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let models = engine.list_installed().await?;

        let catalog = Self::from_models(models);
        catalog.write(path)?;

        info!(
            "Model catalog synced from engine: {} model(s) written to {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Write the catalog as pretty-printed JSON
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let body = InstalledModelsResponse {
            models: self.models.clone(),
        };
        std::fs::write(path, serde_json::to_vec_pretty(&body)?)?;
        Ok(())
    }

    /// Whether this node may claim jobs for `model`
    pub fn contains(&self, model: &str) -> bool {
        self.names.contains(model)
    }

    pub fn models(&self) -> &[InstalledModel] {
        &self.models
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|m| m.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Read one metadata field of a model by its wire name
    pub fn field(&self, model: &str, field: &str) -> Result<String> {
        let entry = self
            .models
            .iter()
            .find(|m| m.name == model)
            .ok_or_else(|| ClusterLoopError::internal(format!("model not found: {}", model)))?;

        let value = match field {
            "name" => entry.name.clone(),
            "modified_at" => entry.modified_at.clone(),
            "size" => entry.size.to_string(),
            "digest" => entry.digest.clone(),
            "format" => entry.details.format.clone(),
            "family" => entry.details.family.clone(),
            "parameter_size" => entry.details.parameter_size.clone(),
            "quantization_level" => entry.details.quantization_level.clone(),
            other => {
                return Err(ClusterLoopError::internal(format!("unknown field: {}", other)));
            }
        };
        Ok(value)
    }
}
