use std::sync::Arc;
use std::time::Duration;

use coh_core::{DeploymentIdentity, ProbeSpec, ScalingPhase, ScalingPolicy};
use coh_probe::{probe_members, HealthVerdict, Prober};
use metrics::counter;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ControlError, ReplicaControl};

/// Step plan fixed once per coordinator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingPlan {
    pub current: i32,
    pub target: i32,
    pub policy: ScalingPolicy,
    pub step: i32,
}

impl ScalingPlan {
    pub fn new(current: i32, target: i32, policy: ScalingPolicy) -> Self {
        let delta = (target - current).abs().max(1);
        let step = match policy {
            ScalingPolicy::Safe => 1,
            ScalingPolicy::Parallel => delta,
            ScalingPolicy::ParallelUpSafeDown if target > current => delta,
            ScalingPolicy::ParallelUpSafeDown => 1,
        };
        Self { current, target, policy, step }
    }

    /// Down-steps are gated by StatusHA probes.
    pub fn gated(&self) -> bool {
        self.target < self.current && self.policy != ScalingPolicy::Parallel
    }

    fn next(&self, from: i32) -> i32 {
        if self.target < from {
            (from - self.step).max(self.target)
        } else {
            (from + self.step).min(self.target)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScaleRequest {
    pub id: DeploymentIdentity,
    pub target: i32,
    pub policy: ScalingPolicy,
    pub probe: ProbeSpec,
    pub allow_endangered: Vec<String>,
    /// Spec generation this request was planned from.
    pub generation: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    Superseded,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScaleOutcome {
    Done { replicas: i32, final_verdict: Option<HealthVerdict> },
    /// Held before a step because the members are not safe to shrink.
    Blocked { replicas: i32, reason: String },
    /// A step was written but did not settle in time.
    Pending { replicas: i32, reason: String },
    Aborted { replicas: i32, cause: AbortCause },
}

impl ScaleOutcome {
    pub fn phase(&self) -> ScalingPhase {
        match self {
            ScaleOutcome::Done { .. } => ScalingPhase::Done,
            ScaleOutcome::Blocked { .. } => ScalingPhase::StepWait,
            ScaleOutcome::Pending { .. } => ScalingPhase::Settling,
            ScaleOutcome::Aborted { .. } => ScalingPhase::Aborted,
        }
    }

    pub fn replicas(&self) -> i32 {
        match self {
            ScaleOutcome::Done { replicas, .. }
            | ScaleOutcome::Blocked { replicas, .. }
            | ScaleOutcome::Pending { replicas, .. }
            | ScaleOutcome::Aborted { replicas, .. } => *replicas,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScaleError {
    #[error("workload for {0} does not exist")]
    WorkloadMissing(DeploymentIdentity),
    #[error(transparent)]
    Control(#[from] ControlError),
}

impl ScaleError {
    pub fn is_retryable(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub settle_timeout: Duration,
    pub settle_poll: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { settle_timeout: Duration::from_secs(300), settle_poll: Duration::from_secs(2) }
    }
}

enum Settle {
    Done,
    TimedOut,
    Interrupted(AbortCause),
}

pub struct Coordinator {
    control: Arc<dyn ReplicaControl>,
    prober: Arc<dyn Prober>,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(control: Arc<dyn ReplicaControl>, prober: Arc<dyn Prober>, config: CoordinatorConfig) -> Self {
        Self { control, prober, config }
    }

    /// Drive the live replica count toward `req.target`.
    ///
    /// The live count is re-read on entry. A newer generation on `generation`
    /// or cancellation interrupts any in-flight probe, write or settle wait.
    pub async fn run(
        &self,
        req: &ScaleRequest,
        generation: &watch::Receiver<i64>,
        cancel: &CancellationToken,
    ) -> Result<ScaleOutcome, ScaleError> {
        let id = &req.id;
        let state = self.control.observe(id).await?.ok_or_else(|| ScaleError::WorkloadMissing(id.clone()))?;
        let mut current = state.spec_replicas;
        let plan = ScalingPlan::new(current, req.target, req.policy);
        debug!(deployment = %id, phase = ?ScalingPhase::Planning, ?plan, "scaling plan");
        if current == req.target {
            return Ok(ScaleOutcome::Done { replicas: current, final_verdict: None });
        }
        info!(deployment = %id, from = current, to = req.target, policy = ?req.policy, "scaling");
        let mut gen_rx = generation.clone();

        while current != req.target {
            if cancel.is_cancelled() {
                return Ok(self.aborted(id, current, AbortCause::Cancelled));
            }
            if *gen_rx.borrow() > req.generation {
                return Ok(self.aborted(id, current, AbortCause::Superseded));
            }

            if plan.gated() && current > 1 {
                debug!(deployment = %id, phase = ?ScalingPhase::StepWait, replicas = current, "probing before step");
                let verdict = tokio::select! {
                    cause = interrupted(cancel, &mut gen_rx, req.generation) => {
                        return Ok(self.aborted(id, current, cause));
                    }
                    v = self.probe(req, current) => v?,
                };
                if !verdict.is_safe() {
                    counter!("scale_blocked", 1u64);
                    let reason = format!("scaling blocked: {verdict}");
                    warn!(deployment = %id, replicas = current, reason = %reason, "scale down held");
                    return Ok(ScaleOutcome::Blocked { replicas: current, reason });
                }
            }

            let next = plan.next(current);
            debug!(deployment = %id, phase = ?ScalingPhase::StepApply, from = current, to = next, "writing replicas");
            tokio::select! {
                cause = interrupted(cancel, &mut gen_rx, req.generation) => {
                    // the write may or may not have landed; the next cycle re-reads the live count
                    return Ok(self.aborted(id, current, cause));
                }
                r = self.control.write_replicas(id, next) => r?,
            }
            counter!("scale_steps", 1u64);
            current = next;

            match self.settle(id, current, cancel, &mut gen_rx, req.generation).await? {
                Settle::Done => {}
                Settle::Interrupted(cause) => return Ok(self.aborted(id, current, cause)),
                Settle::TimedOut => {
                    let reason = format!("waiting for {current} replicas to settle");
                    return Ok(ScaleOutcome::Pending { replicas: current, reason });
                }
            }
        }

        let final_verdict = if plan.gated() && current > 1 {
            tokio::select! {
                _ = interrupted(cancel, &mut gen_rx, req.generation) => None,
                v = self.probe(req, current) => Some(v?),
            }
        } else {
            None
        };
        info!(deployment = %id, replicas = current, final = ?final_verdict, "scaling done");
        Ok(ScaleOutcome::Done { replicas: current, final_verdict })
    }

    fn aborted(&self, id: &DeploymentIdentity, replicas: i32, cause: AbortCause) -> ScaleOutcome {
        if cause == AbortCause::Superseded {
            info!(deployment = %id, replicas, "scaling superseded by newer spec");
            counter!("scale_superseded", 1u64);
        }
        ScaleOutcome::Aborted { replicas, cause }
    }

    async fn probe(&self, req: &ScaleRequest, replicas: i32) -> Result<HealthVerdict, ScaleError> {
        let members = self.control.members(&req.id).await?;
        Ok(probe_members(self.prober.as_ref(), &members, replicas, &req.probe, &req.allow_endangered).await)
    }

    async fn settle(
        &self,
        id: &DeploymentIdentity,
        replicas: i32,
        cancel: &CancellationToken,
        gen_rx: &mut watch::Receiver<i64>,
        generation: i64,
    ) -> Result<Settle, ScaleError> {
        debug!(deployment = %id, phase = ?ScalingPhase::Settling, replicas, "awaiting settle");
        let deadline = Instant::now() + self.config.settle_timeout;
        loop {
            if let Some(state) = self.control.observe(id).await? {
                if state.settled_at(replicas) {
                    return Ok(Settle::Done);
                }
            }
            if Instant::now() >= deadline {
                return Ok(Settle::TimedOut);
            }
            tokio::select! {
                cause = interrupted(cancel, gen_rx, generation) => return Ok(Settle::Interrupted(cause)),
                _ = tokio::time::sleep(self.config.settle_poll) => {}
            }
        }
    }
}

/// Resolves on shutdown or once a generation newer than `generation` is observed.
/// A dropped sender means no newer generation can arrive.
async fn interrupted(cancel: &CancellationToken, gen_rx: &mut watch::Receiver<i64>, generation: i64) -> AbortCause {
    let newer = async {
        loop {
            if *gen_rx.borrow_and_update() > generation {
                return;
            }
            if gen_rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => AbortCause::Cancelled,
        _ = newer => AbortCause::Superseded,
    }
}
