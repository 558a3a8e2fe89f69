//! Reconcile driver: synthesize, diff, apply, scale, report.

#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use coh_apply::{ApplyReport, SinkError};
use coh_core::{ClusterSpec, DeploymentIdentity, StatusRecord};
use coh_ops::{ControlError, CoordinatorConfig, ScaleError};
use coh_persist::StoreError;
use thiserror::Error;

mod controller;
mod locks;
mod reconciler;

pub use controller::Controller;
pub use locks::{IdentityLocks, LockGuard};
pub use reconciler::{Ports, Reconciler};

/// A cluster spec as read for one cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpecSnapshot {
    pub spec: ClusterSpec,
    pub generation: i64,
    /// Marked for deletion and waiting on this operator to release it.
    pub deleting: bool,
    /// Skip service suspension while finalizing.
    pub skip_suspend: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("reading cluster spec: {0}")]
    Transport(String),
}

#[async_trait]
pub trait SpecSource: Send + Sync {
    /// `None` once the custom resource is gone.
    async fn get(&self, id: &DeploymentIdentity) -> Result<Option<SpecSnapshot>, SourceError>;

    /// Let a resource marked for deletion go; a no-op when it is already gone.
    async fn release(&self, id: &DeploymentIdentity) -> Result<(), SourceError>;
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Apply(#[from] SinkError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Scale(#[from] ScaleError),
    #[error("suspending services: {0}")]
    Suspend(String),
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Apply(e) => e.is_retryable(),
            ReconcileError::Store(e) => e.is_retryable(),
            ReconcileError::Scale(e) => e.is_retryable(),
            ReconcileError::Source(_) | ReconcileError::Control(_) | ReconcileError::Suspend(_) => true,
        }
    }
}

/// Exponential retry delays for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub ceiling: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_millis(500), ceiling: Duration::from_secs(60), max_attempts: 8 }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based). Past `max_attempts` it is the ceiling.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt >= self.max_attempts {
            return self.ceiling;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.ceiling)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// Requeue delay while scaling is held by StatusHA.
    pub status_ha_retry: Duration,
    /// Requeue delay while the start quorum is unmet.
    pub quorum_retry: Duration,
    /// Requeue delay while members are still becoming ready.
    pub ready_poll: Duration,
    /// Requeue delay when another worker holds the deployment.
    pub busy_retry: Duration,
    /// Unmet quorum observations before the status is marked stalled.
    pub max_quorum_observations: u32,
    /// Failed suspensions tolerated while finalizing before deletion proceeds anyway.
    pub max_suspend_failures: u32,
    pub coordinator: CoordinatorConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            status_ha_retry: Duration::from_secs(60),
            quorum_retry: Duration::from_secs(30),
            ready_poll: Duration::from_secs(10),
            busy_retry: Duration::from_secs(1),
            max_quorum_observations: 60,
            max_suspend_failures: 3,
            coordinator: CoordinatorConfig::default(),
        }
    }
}

/// What one cycle did and when it wants to run again.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// `None` when the cycle did not run (busy) or the deployment is gone.
    pub status: Option<StatusRecord>,
    pub applied: ApplyReport,
    pub requeue: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let b = Backoff { base: Duration::from_secs(1), ceiling: Duration::from_secs(10), max_attempts: 6 };
        let delays: Vec<u64> = (0..7).map(|n| b.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10, 10]);
        assert_eq!(b.delay(40), Duration::from_secs(10));
    }

    #[test]
    fn rejected_apply_is_terminal() {
        let e = ReconcileError::Apply(SinkError::Transport("eof".into()));
        assert!(e.is_retryable());
        let e = ReconcileError::Apply(SinkError::Rejected {
            reference: coh_core::ResourceRef::new(coh_core::ResourceKind::Service, "x"),
            message: "invalid".into(),
        });
        assert!(!e.is_retryable());
        assert!(ReconcileError::Store(StoreError::Conflict { expected: 1, found: 2 }).is_retryable());
    }
}
