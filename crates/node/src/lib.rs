//! ClusterLoop Node
//!
//! Per-node job intake for distributed LLM inference. A node competes with its
//! peers for chat jobs on a shared durable consumer, claims only jobs it can
//! serve and has room for, keeps the local engine's resident models within
//! budget, and publishes each answer back to the conversation it belongs to.

pub mod admission;
pub mod bus;
pub mod capacity;
pub mod catalog;
pub mod engine;
pub mod intake;
pub mod invocation;
pub mod job;
pub mod residency;

#[cfg(test)]
mod testing;

pub use admission::{AdmissionController, AdmissionPermit};
pub use bus::{Delivery, JobSource, NatsBus, ResultPublisher};
pub use capacity::CapacitySettings;
pub use catalog::ModelCatalog;
pub use engine::{InferenceEngine, OllamaClient};
pub use intake::{DeclineReason, IntakeSettings, JobOutcome, JobRouter, RouteDecision};
pub use invocation::Invoker;
pub use residency::{ResidencyCache, ResidentModel};
