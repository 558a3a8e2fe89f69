//! Replica-count changes under StatusHA gating, and the start-quorum gate.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use coh_core::DeploymentIdentity;
use coh_probe::Member;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod coordinator;
mod quorum;

pub use coordinator::{AbortCause, Coordinator, CoordinatorConfig, ScaleError, ScaleOutcome, ScaleRequest, ScalingPlan};
pub use quorum::{evaluate, QuorumVerdict, UnmetEdge};

/// Live replica counts of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaState {
    /// Desired count recorded on the workload.
    pub spec_replicas: i32,
    /// Pods currently existing.
    pub replicas: i32,
    pub ready: i32,
}

impl ReplicaState {
    pub fn settled_at(&self, n: i32) -> bool {
        self.spec_replicas == n && self.replicas == n && self.ready == n
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("conflict updating {0}")]
    Conflict(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Read and write the replica count of a deployment's workload.
#[async_trait]
pub trait ReplicaControl: Send + Sync {
    /// `None` when the workload does not exist.
    async fn observe(&self, id: &DeploymentIdentity) -> Result<Option<ReplicaState>, ControlError>;
    /// Returns once the write is acknowledged by the API.
    async fn write_replicas(&self, id: &DeploymentIdentity, replicas: i32) -> Result<(), ControlError>;
    async fn members(&self, id: &DeploymentIdentity) -> Result<Vec<Member>, ControlError>;
}
