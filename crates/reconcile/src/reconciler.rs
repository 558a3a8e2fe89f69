use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use coh_apply::{apply_changes, plan_changes, ApplyReport, ApplySink, Change, SinkError};
use coh_core::{
    Catalog, ClusterSpec, ConfigError, DeploymentIdentity, Phase, Resource, ResourceKind, ResourcePayload, ResourceRef,
    ResourceSet, ScalingPhase, StartQuorumEdge, StatusRecord,
};
use coh_ops::{evaluate, AbortCause, Coordinator, ReplicaControl, ReplicaState, ScaleOutcome, ScaleRequest};
use coh_persist::StateStore;
use coh_probe::{probe_members, HealthVerdict, Prober};
use coh_store::{GenerationBook, StatusSink};
use coh_synth::{synthesize, workload_name};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{CycleReport, IdentityLocks, ReconcileError, ReconcilerConfig, SpecSnapshot, SpecSource};

/// The outside world as seen by the reconciler.
#[derive(Clone)]
pub struct Ports {
    pub source: Arc<dyn SpecSource>,
    pub sink: Arc<dyn ApplySink>,
    pub control: Arc<dyn ReplicaControl>,
    pub prober: Arc<dyn Prober>,
    pub store: Arc<dyn StateStore>,
    pub status: Arc<dyn StatusSink>,
    pub generations: Arc<GenerationBook>,
}

/// Per-deployment bookkeeping that lives only as long as the process.
#[derive(Default)]
struct Memory {
    quorum_observations: FxHashMap<DeploymentIdentity, u32>,
    failed_generation: FxHashMap<DeploymentIdentity, i64>,
    suspend_failures: FxHashMap<DeploymentIdentity, u32>,
    last_status: FxHashMap<DeploymentIdentity, StatusRecord>,
}

pub struct Reconciler {
    ports: Ports,
    catalog: Arc<Catalog>,
    config: ReconcilerConfig,
    coordinator: Coordinator,
    locks: IdentityLocks,
    memory: Mutex<Memory>,
}

struct WorkloadStep {
    phase: Phase,
    scaling_phase: ScalingPhase,
    replicas: i32,
    ready: i32,
    requeue: Option<Duration>,
    blocked_reason: Option<String>,
    message: Option<String>,
}

impl WorkloadStep {
    fn settled(phase: Phase, state: Option<ReplicaState>, requeue: Option<Duration>) -> Self {
        let state = state.unwrap_or_default();
        Self {
            phase,
            scaling_phase: ScalingPhase::Idle,
            replicas: state.spec_replicas,
            ready: state.ready,
            requeue,
            blocked_reason: None,
            message: None,
        }
    }
}

impl Reconciler {
    pub fn new(ports: Ports, catalog: Arc<Catalog>, config: ReconcilerConfig) -> Self {
        let coordinator = Coordinator::new(Arc::clone(&ports.control), Arc::clone(&ports.prober), config.coordinator);
        Self { ports, catalog, config, coordinator, locks: IdentityLocks::new(), memory: Mutex::new(Memory::default()) }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// One reconcile cycle. A deployment already being reconciled elsewhere is
    /// not waited for; the report asks for a short requeue instead.
    pub async fn reconcile(&self, id: &DeploymentIdentity, cancel: &CancellationToken) -> Result<CycleReport, ReconcileError> {
        let Some(_guard) = self.locks.try_lock(id) else {
            debug!(deployment = %id, "reconcile already in flight");
            counter!("reconcile_busy", 1u64);
            return Ok(CycleReport { requeue: Some(self.config.busy_retry), ..Default::default() });
        };
        let started = Instant::now();
        counter!("reconcile_total", 1u64);
        let res = self.cycle(id, cancel).await;
        histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        if res.is_err() {
            counter!("reconcile_errors", 1u64);
        }
        res
    }

    /// Surface a failed cycle in the status, keeping the last known phase.
    pub async fn report_error(&self, id: &DeploymentIdentity, err: &ReconcileError) {
        let mut record = self.memory().last_status.get(id).cloned().unwrap_or_default();
        if !err.is_retryable() {
            record.phase = Phase::Failed;
        }
        record.message = Some(err.to_string());
        self.publish(id, record).await;
    }

    async fn cycle(&self, id: &DeploymentIdentity, cancel: &CancellationToken) -> Result<CycleReport, ReconcileError> {
        let Some(snapshot) = self.ports.source.get(id).await? else {
            self.cleanup(id).await?;
            return Ok(CycleReport::default());
        };
        if snapshot.deleting {
            self.finalize(id, &snapshot).await?;
            return Ok(CycleReport::default());
        }
        let generation = snapshot.generation;
        let spec = &snapshot.spec;
        self.ports.generations.observe(id, generation);

        if self.memory().failed_generation.get(id) == Some(&generation) {
            debug!(deployment = %id, generation, "generation already failed; waiting for a new one");
            return Ok(CycleReport::default());
        }

        let desired = match synthesize(spec, id, &self.catalog) {
            Ok(set) => set,
            Err(e) => return Ok(self.fail(id, generation, e).await),
        };
        let previous = self.ports.store.load(id).await?.unwrap_or_else(ResourceSet::empty);
        let live = self.ports.control.observe(id).await?;
        debug!(deployment = %id, generation, desired = desired.len(), previous = previous.len(), live = ?live, "cycle inputs");

        if desired.workload().is_none() && live.is_some() && spec.suspend_services_on_shutdown() {
            self.suspend(id, spec).await?;
        }

        let changes: Vec<Change> = plan_changes(&previous, &desired)
            .into_iter()
            .filter(|c| c.resource.kind() != ResourceKind::StatefulSet)
            .collect();
        let mut applied = apply_changes(self.ports.sink.as_ref(), id, &changes).await?;

        let gate = self.workload_gate(id, spec, &desired, &previous, live, &mut applied).await?;

        // a deferred update must be retried, so the recorded workload stays the old one
        let desired = match (&gate, previous.workload()) {
            (Gate::Deferred { .. }, Some(prior)) => desired.with_resource(prior.clone()),
            (Gate::Deferred { .. }, None) => {
                desired.without(&ResourceRef::new(ResourceKind::StatefulSet, workload_name(id)))
            }
            _ => desired,
        };
        let applied_version = if previous.items() == desired.items() {
            previous.version
        } else {
            let v = self.ports.store.record(id, &desired, previous.version).await?;
            debug!(deployment = %id, version = v, "recorded applied set");
            v
        };

        let mut record = StatusRecord { observed_generation: Some(generation), applied_version, ..Default::default() };
        let step = match gate {
            Gate::Held { step, unmet, observations } => {
                record.unmet_quorum = unmet;
                record.quorum_observations = observations;
                record.quorum_stalled = observations > self.config.max_quorum_observations;
                step
            }
            Gate::Deferred { step } => step,
            Gate::Open { target, state: Some(state) } if target != state.spec_replicas => {
                self.scale(id, spec, target, generation, cancel).await?
            }
            Gate::Open { target, state } => {
                let ready = state.is_some_and(|s| s.settled_at(target));
                let mut step = if ready {
                    WorkloadStep::settled(Phase::Ready, state, None)
                } else {
                    WorkloadStep::settled(Phase::Created, state, Some(self.config.ready_poll))
                };
                if state.is_none() {
                    step.replicas = target;
                }
                step
            }
            Gate::Stopped => WorkloadStep::settled(Phase::Stopped, None, None),
        };

        record.phase = step.phase;
        record.scaling_phase = step.scaling_phase;
        record.replicas = step.replicas;
        record.ready_replicas = step.ready;
        record.blocked_reason = step.blocked_reason;
        record.message = step.message;
        info!(
            deployment = %id,
            generation,
            phase = ?record.phase,
            replicas = record.replicas,
            ready = record.ready_replicas,
            changes = applied.total(),
            "reconciled"
        );
        self.publish(id, record.clone()).await;
        Ok(CycleReport { status: Some(record), applied, requeue: step.requeue })
    }

    /// Create, update or delete the workload. Creation and scaling up wait for the
    /// start quorum; an update waits for the cluster to be StatusHA.
    async fn workload_gate(
        &self,
        id: &DeploymentIdentity,
        spec: &ClusterSpec,
        desired: &ResourceSet,
        previous: &ResourceSet,
        live: Option<ReplicaState>,
        applied: &mut ApplyReport,
    ) -> Result<Gate, ReconcileError> {
        let Some(workload) = desired.workload() else {
            if live.is_some() || previous.workload().is_some() {
                let reference = ResourceRef::new(ResourceKind::StatefulSet, workload_name(id));
                match self.ports.sink.delete(id, &reference).await {
                    Ok(()) => applied.deleted += 1,
                    Err(SinkError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                info!(deployment = %id, "workload removed");
            }
            return Ok(Gate::Stopped);
        };
        let target = workload.payload.as_ref().and_then(|p| p.replicas()).unwrap_or_else(|| spec.replicas(&self.catalog));

        match live {
            None => {
                if let Some(held) = self.check_quorum(id, spec).await? {
                    return Ok(held);
                }
                self.ports.sink.apply(id, workload).await?;
                applied.created += 1;
                info!(deployment = %id, replicas = target, "workload created");
                Ok(Gate::Open { target, state: None })
            }
            Some(state) => {
                let unchanged = previous
                    .workload()
                    .and_then(|p| p.payload.as_ref())
                    .zip(workload.payload.as_ref())
                    .is_some_and(|(p, c)| self.shape(p) == self.shape(c));
                if !unchanged {
                    if spec.ha_before_update() {
                        if let Some(step) = self.check_update(id, spec, state).await? {
                            return Ok(Gate::Deferred { step });
                        }
                    } else {
                        warn!(deployment = %id, "updating workload without a StatusHA check");
                    }
                    if state.ready == 1 && spec.suspend_services_on_shutdown() {
                        self.suspend(id, spec).await?;
                    }
                    let payload = workload.payload.as_ref().map(|p| p.with_replicas(state.spec_replicas));
                    let update = Resource { reference: workload.reference.clone(), payload, hash: workload.hash };
                    self.ports.sink.apply(id, &update).await?;
                    applied.updated += 1;
                    info!(deployment = %id, replicas = state.spec_replicas, "workload updated at live replica count");
                }
                if target > state.spec_replicas {
                    if let Some(Gate::Held { mut step, unmet, observations }) = self.check_quorum(id, spec).await? {
                        step.replicas = state.spec_replicas;
                        step.ready = state.ready;
                        return Ok(Gate::Held { step, unmet, observations });
                    }
                }
                Ok(Gate::Open { target, state: Some(state) })
            }
        }
    }

    /// `None` when every replica is ready and no service would be endangered by a rolling restart.
    async fn check_update(
        &self,
        id: &DeploymentIdentity,
        spec: &ClusterSpec,
        state: ReplicaState,
    ) -> Result<Option<WorkloadStep>, ReconcileError> {
        let reason = if state.ready != state.spec_replicas {
            Some(format!("update waiting for {} of {} replicas to be ready", state.ready, state.spec_replicas))
        } else if state.spec_replicas > 1 {
            let members = self.ports.control.members(id).await?;
            let probe = spec.scaling_probe(&self.catalog);
            let allow = &spec.allow_endangered_for_status_ha;
            let verdict = probe_members(self.ports.prober.as_ref(), &members, state.spec_replicas, &probe, allow).await;
            (!verdict.is_safe()).then(|| format!("update blocked: {verdict}"))
        } else {
            None
        };
        let Some(reason) = reason else { return Ok(None) };
        info!(deployment = %id, reason = %reason, "workload update deferred");
        counter!("update_deferred", 1u64);
        Ok(Some(WorkloadStep {
            phase: Phase::Blocked,
            scaling_phase: ScalingPhase::Idle,
            replicas: state.spec_replicas,
            ready: state.ready,
            requeue: Some(self.config.status_ha_retry),
            blocked_reason: Some(reason.clone()),
            message: Some(reason),
        }))
    }

    async fn check_quorum(&self, id: &DeploymentIdentity, spec: &ClusterSpec) -> Result<Option<Gate>, ReconcileError> {
        if spec.start_quorum.is_empty() {
            return Ok(None);
        }
        let mut counts = HashMap::new();
        for edge in &spec.start_quorum {
            let target = edge.target(&id.namespace);
            if let Some(state) = self.ports.control.observe(&target).await? {
                counts.insert(target, state);
            }
        }
        let verdict = evaluate(&id.namespace, &spec.start_quorum, &counts);
        if verdict.ready {
            self.memory().quorum_observations.remove(id);
            return Ok(None);
        }

        let observations = {
            let mut mem = self.memory();
            let n = mem.quorum_observations.entry(id.clone()).or_insert(0);
            *n += 1;
            *n
        };
        let reason = verdict.reason().unwrap_or_default();
        if observations > self.config.max_quorum_observations {
            warn!(deployment = %id, observations, reason = %reason, "start quorum stalled");
        } else {
            info!(deployment = %id, observations, reason = %reason, "start quorum not met");
        }
        counter!("quorum_unmet", 1u64);
        let step = WorkloadStep {
            phase: Phase::Waiting,
            scaling_phase: ScalingPhase::Idle,
            replicas: 0,
            ready: 0,
            requeue: Some(self.config.quorum_retry),
            blocked_reason: Some(reason.clone()),
            message: Some(reason),
        };
        let unmet = verdict.unmet.into_iter().map(|u| u.edge).collect();
        Ok(Some(Gate::Held { step, unmet, observations }))
    }

    async fn scale(
        &self,
        id: &DeploymentIdentity,
        spec: &ClusterSpec,
        target: i32,
        generation: i64,
        cancel: &CancellationToken,
    ) -> Result<WorkloadStep, ReconcileError> {
        let req = ScaleRequest {
            id: id.clone(),
            target,
            policy: spec.effective_scaling_policy(),
            probe: spec.scaling_probe(&self.catalog),
            allow_endangered: spec.allow_endangered_for_status_ha.clone(),
            generation,
        };
        let rx = self.ports.generations.subscribe(id, generation);
        let outcome = self.coordinator.run(&req, &rx, cancel).await?;
        let state = self.ports.control.observe(id).await?.unwrap_or_default();

        let mut step = WorkloadStep {
            phase: Phase::Scaling,
            scaling_phase: outcome.phase(),
            replicas: outcome.replicas(),
            ready: state.ready,
            requeue: None,
            blocked_reason: None,
            message: None,
        };
        match outcome {
            ScaleOutcome::Done { final_verdict, .. } => {
                step.phase = if state.settled_at(target) { Phase::Ready } else { Phase::Scaling };
                if step.phase != Phase::Ready {
                    step.requeue = Some(self.config.ready_poll);
                }
                if let Some(v @ (HealthVerdict::Unsafe { .. } | HealthVerdict::Unknown(_))) = final_verdict {
                    step.message = Some(format!("scaled to {target}; {v}"));
                }
            }
            ScaleOutcome::Blocked { reason, .. } => {
                step.phase = Phase::Blocked;
                step.requeue = Some(self.config.status_ha_retry);
                step.message = Some(reason.clone());
                step.blocked_reason = Some(reason);
            }
            ScaleOutcome::Pending { reason, .. } => {
                step.requeue = Some(self.config.ready_poll);
                step.message = Some(reason);
            }
            ScaleOutcome::Aborted { cause: AbortCause::Superseded, .. } => {
                step.requeue = Some(Duration::ZERO);
                step.message = Some("superseded by a newer spec".to_string());
            }
            ScaleOutcome::Aborted { cause: AbortCause::Cancelled, .. } => {
                step.message = Some("scaling interrupted by shutdown".to_string());
            }
        }
        Ok(step)
    }

    /// Ask a ready member to suspend the cluster's services before the workload goes away.
    async fn suspend(&self, id: &DeploymentIdentity, spec: &ClusterSpec) -> Result<(), ReconcileError> {
        let probe = spec.suspend_probe(&self.catalog);
        let members = self.ports.control.members(id).await?;
        let mut last = None;
        for member in members.iter().filter(|m| m.ready) {
            match self.ports.prober.probe(member, &probe).await {
                HealthVerdict::Safe => {
                    info!(deployment = %id, member = %member.name, "services suspended");
                    return Ok(());
                }
                other => {
                    debug!(deployment = %id, member = %member.name, verdict = %other, "suspend attempt failed");
                    last = Some(format!("{}: {other}", member.name));
                }
            }
        }
        match last {
            Some(reason) => Err(ReconcileError::Suspend(reason)),
            None => {
                warn!(deployment = %id, "no ready members to suspend; removing workload anyway");
                Ok(())
            }
        }
    }

    async fn fail(&self, id: &DeploymentIdentity, generation: i64, err: ConfigError) -> CycleReport {
        warn!(deployment = %id, generation, error = %err, "configuration rejected");
        counter!("reconcile_config_errors", 1u64);
        self.memory().failed_generation.insert(id.clone(), generation);
        let record = StatusRecord {
            observed_generation: Some(generation),
            phase: Phase::Failed,
            message: Some(err.to_string()),
            ..Default::default()
        };
        self.publish(id, record.clone()).await;
        CycleReport { status: Some(record), ..Default::default() }
    }

    /// Suspend services of a deployment marked for deletion, then release it.
    /// Repeated suspension failures stop blocking the deletion.
    async fn finalize(&self, id: &DeploymentIdentity, snapshot: &SpecSnapshot) -> Result<(), ReconcileError> {
        let spec = &snapshot.spec;
        let wants_suspend = !snapshot.skip_suspend && spec.suspend_services_on_shutdown() && spec.replicas(&self.catalog) > 0;
        let live = self.ports.control.observe(id).await?;
        if wants_suspend && live.is_some_and(|s| s.ready > 0) {
            if let Err(e) = self.suspend(id, spec).await {
                let failures = {
                    let mut mem = self.memory();
                    let n = mem.suspend_failures.entry(id.clone()).or_insert(0);
                    *n += 1;
                    *n
                };
                if failures <= self.config.max_suspend_failures {
                    return Err(e);
                }
                warn!(deployment = %id, failures, error = %e, "suspension keeps failing; releasing anyway");
            }
        } else if snapshot.skip_suspend {
            info!(deployment = %id, "suspension bypassed for deletion");
        }
        self.ports.source.release(id).await?;
        debug!(deployment = %id, "finalizer released");
        self.cleanup(id).await
    }

    async fn cleanup(&self, id: &DeploymentIdentity) -> Result<(), ReconcileError> {
        self.ports.store.destroy(id).await?;
        self.ports.generations.forget(id);
        self.ports.status.forget(id).await;
        {
            let mut mem = self.memory();
            mem.quorum_observations.remove(id);
            mem.failed_generation.remove(id);
            mem.suspend_failures.remove(id);
            mem.last_status.remove(id);
        }
        info!(deployment = %id, "deployment removed; state cleared");
        Ok(())
    }

    async fn publish(&self, id: &DeploymentIdentity, record: StatusRecord) {
        if let Err(e) = self.ports.status.publish(id, &record).await {
            warn!(deployment = %id, error = %e, "status not written");
        }
        self.memory().last_status.insert(id.clone(), record);
    }

    /// A workload payload without the parts that change with the replica count alone.
    fn shape(&self, payload: &ResourcePayload) -> ResourcePayload {
        let mut out = payload.with_replicas(0);
        out.set_label(&self.catalog.labels.hash, String::new());
        out
    }

    fn memory(&self) -> std::sync::MutexGuard<'_, Memory> {
        self.memory.lock().unwrap_or_else(|p| p.into_inner())
    }
}

enum Gate {
    /// Start quorum unmet.
    Held { step: WorkloadStep, unmet: Vec<StartQuorumEdge>, observations: u32 },
    /// Workload update postponed until the cluster is StatusHA.
    Deferred { step: WorkloadStep },
    Open { target: i32, state: Option<ReplicaState> },
    Stopped,
}
