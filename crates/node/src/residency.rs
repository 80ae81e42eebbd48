//! Loaded-model residency cache
//!
//! Tracks which models the local engine holds in memory and keeps that set
//! within the node's residency budget. Eviction is least-recently-used by last
//! successful use and only happens when a model that is not tracked is about
//! to be requested. The engine may evict models on its own; [`ResidencyCache::refresh`]
//! reconciles local tracking with what the engine reports.

use crate::engine::InferenceEngine;
use clusterloop_common::{ClusterLoopError, Result, METRICS};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One model considered loaded in the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidentModel {
    pub name: String,
    pub loaded_at: Instant,
    pub last_used_at: Instant,

    /// Job that started loading this model and has not finished yet
    pub in_flight_request_id: Option<String>,
}

#[derive(Debug)]
struct TrackedModel {
    model: ResidentModel,

    /// First-seen order, breaks `last_used_at` ties
    seq: u64,
}

#[derive(Debug, Default)]
struct ResidencyState {
    models: HashMap<String, TrackedModel>,
    next_seq: u64,
}

impl ResidencyState {
    fn track(&mut self, name: &str, now: Instant, request_id: Option<&str>) {
        let seq = self.next_seq;
        self.next_seq += 1;

        self.models.insert(
            name.to_string(),
            TrackedModel {
                model: ResidentModel {
                    name: name.to_string(),
                    loaded_at: now,
                    last_used_at: now,
                    in_flight_request_id: request_id.map(str::to_string),
                },
                seq,
            },
        );
    }

    /// Eviction candidate, never `keep`
    fn least_recently_used(&self, keep: &str) -> Option<String> {
        self.models
            .values()
            .filter(|tracked| tracked.model.name != keep)
            .min_by_key(|tracked| (tracked.model.last_used_at, tracked.seq))
            .map(|tracked| tracked.model.name.clone())
    }

    fn ordered(&self) -> Vec<ResidentModel> {
        let mut tracked: Vec<&TrackedModel> = self.models.values().collect();
        tracked.sort_by_key(|t| t.seq);
        tracked.into_iter().map(|t| t.model.clone()).collect()
    }

    fn publish_gauge(&self) {
        METRICS.residency.resident_models.set(self.models.len() as i64);
    }
}

/// One model removed to make room
#[derive(Debug)]
pub struct Eviction {
    pub model: String,

    /// Set when the engine did not confirm the unload; tracking was dropped anyway
    pub unload_error: Option<ClusterLoopError>,
}

/// What [`ResidencyCache::ensure_room`] did
#[derive(Debug, Default)]
pub struct EnsureRoomOutcome {
    /// The model was tracked already, before the call or once reconciled
    /// with the engine
    pub already_resident: bool,

    pub evictions: Vec<Eviction>,
}

impl EnsureRoomOutcome {
    /// Evictions whose unload call failed
    pub fn unload_failures(&self) -> impl Iterator<Item = &Eviction> {
        self.evictions.iter().filter(|e| e.unload_error.is_some())
    }
}

/// Residency cache over one inference engine
pub struct ResidencyCache {
    engine: Arc<dyn InferenceEngine>,
    max_resident_models: usize,
    state: Mutex<ResidencyState>,
}

impl ResidencyCache {
    /// Create an empty cache. A budget of zero is treated as one.
    pub fn new(engine: Arc<dyn InferenceEngine>, max_resident_models: usize) -> Self {
        Self {
            engine,
            max_resident_models: max_resident_models.max(1),
            state: Mutex::new(ResidencyState::default()),
        }
    }

    pub fn max_resident_models(&self) -> usize {
        self.max_resident_models
    }

    /// Reconcile tracking with the engine's loaded list.
    ///
    /// Unknown models are added with `now` as both timestamps, known ones keep
    /// their timestamps. Models the engine no longer reports are dropped unless
    /// a load started by this node is still in flight for them.
    pub async fn refresh(&self) -> Result<Vec<ResidentModel>> {
        let reported = self.engine.list_loaded().await?;
        let now = Instant::now();

        let mut state = self.state.lock();
        let reported_names: HashSet<&str> = reported.iter().map(|m| m.name.as_str()).collect();

        state.models.retain(|name, tracked| {
            let keep = reported_names.contains(name.as_str())
                || tracked.model.in_flight_request_id.is_some();
            if !keep {
                debug!("Model {} no longer loaded in engine, dropping it", name);
            }
            keep
        });

        for entry in &reported {
            if !state.models.contains_key(&entry.name) {
                debug!("Tracking model {} reported loaded by engine", entry.name);
                state.track(&entry.name, now, None);
            }
        }

        state.publish_gauge();
        Ok(state.ordered())
    }

    /// Make sure `requested_model` can be loaded without exceeding the budget.
    ///
    /// A tracked model within budget returns immediately. Otherwise tracking
    /// is refreshed and least-recently-used models other than the requested
    /// one are evicted until it fits: a free slot for a new model, or the
    /// budget itself when the engine already holds it. A failed unload does
    /// not stop the eviction: it is logged and reported in the outcome.
    pub async fn ensure_room(
        &self,
        requested_model: &str,
        request_id: Option<&str>,
    ) -> Result<EnsureRoomOutcome> {
        let fits = {
            let state = self.state.lock();
            state.models.contains_key(requested_model)
                && state.models.len() <= self.max_resident_models
        };
        if fits {
            return Ok(EnsureRoomOutcome {
                already_resident: true,
                evictions: Vec::new(),
            });
        }

        self.refresh().await?;

        let mut outcome = EnsureRoomOutcome::default();
        loop {
            let victim = {
                let mut state = self.state.lock();

                let tracked = state.models.contains_key(requested_model);
                let count = state.models.len();

                if tracked && count <= self.max_resident_models {
                    outcome.already_resident = true;
                    break;
                }

                if !tracked && count < self.max_resident_models {
                    state.track(requested_model, Instant::now(), request_id);
                    state.publish_gauge();
                    break;
                }

                let Some(victim) = state.least_recently_used(requested_model) else {
                    break;
                };
                state.models.remove(&victim);
                state.publish_gauge();
                victim
            };

            info!(
                "Evicting least recently used model {} to make room for {}",
                victim, requested_model
            );
            METRICS.residency.evictions.inc();

            let unload_error = self.unload(&victim).await.err();
            if let Some(err) = &unload_error {
                warn!("Unload of evicted model {} failed: {}", victim, err);
            }

            outcome.evictions.push(Eviction {
                model: victim,
                unload_error,
            });
        }

        Ok(outcome)
    }

    /// Record a successful use. Unknown names are ignored.
    pub fn mark_used(&self, model_name: &str) {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(tracked) = state.models.get_mut(model_name) {
            if now > tracked.model.last_used_at {
                tracked.model.last_used_at = now;
            }
            tracked.model.in_flight_request_id = None;
        }
    }

    /// Clear the in-flight marker a failed request left behind
    pub fn abandon(&self, model_name: &str, request_id: &str) {
        let mut state = self.state.lock();

        if let Some(tracked) = state.models.get_mut(model_name) {
            if tracked.model.in_flight_request_id.as_deref() == Some(request_id) {
                tracked.model.in_flight_request_id = None;
            }
        }
    }

    /// Unload `model_name` from the engine and stop tracking it, whether or
    /// not the call succeeded.
    pub async fn unload(&self, model_name: &str) -> Result<()> {
        let result = self.engine.unload(model_name).await;
        if result.is_err() {
            METRICS.residency.unload_failures.inc();
        }

        let mut state = self.state.lock();
        state.models.remove(model_name);
        state.publish_gauge();

        result
    }

    pub fn contains(&self, model_name: &str) -> bool {
        self.state.lock().models.contains_key(model_name)
    }

    pub fn get(&self, model_name: &str) -> Option<ResidentModel> {
        self.state
            .lock()
            .models
            .get(model_name)
            .map(|tracked| tracked.model.clone())
    }

    /// Tracked models in first-seen order
    pub fn tracked(&self) -> Vec<ResidentModel> {
        self.state.lock().ordered()
    }

    pub fn len(&self) -> usize {
        self.state.lock().models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
