//! Resource-set diffing and ordered application through an [`ApplySink`].

#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use coh_core::{DeploymentIdentity, Resource, ResourceKind, ResourceRef, ResourceSet};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Changes of one kind plus the number of `kind` resources in `previous`.
///
/// Deletions come first as tombstones, then additions and updates in the
/// order of `current`. Hash equality never skips the structural comparison.
pub fn diff(kind: ResourceKind, previous: &ResourceSet, current: &ResourceSet) -> (Vec<Resource>, usize) {
    let mut out = Vec::new();
    let mut prev_count = 0usize;

    for p in previous.of_kind(kind).filter(|r| r.is_present()) {
        prev_count += 1;
        let still_wanted = current.get(&p.reference).is_some_and(|c| c.is_present());
        if !still_wanted {
            out.push(Resource::tombstone(p.reference.clone()));
        }
    }

    for c in current.of_kind(kind).filter(|r| r.is_present()) {
        match previous.get(&c.reference).filter(|p| p.is_present()) {
            None => out.push(c.clone()),
            Some(p) => {
                let changed = match (p.hash, c.hash) {
                    (Some(a), Some(b)) if a != b => true,
                    _ => p.payload != c.payload,
                };
                if changed {
                    out.push(c.clone());
                }
            }
        }
    }
    (out, prev_count)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub op: ChangeOp,
    pub resource: Resource,
}

/// Every change between two sets, kinds in apply order, deletions of a kind before its additions.
pub fn plan_changes(previous: &ResourceSet, current: &ResourceSet) -> Vec<Change> {
    let mut out = Vec::new();
    for kind in ResourceKind::APPLY_ORDER {
        let (changes, _) = diff(kind, previous, current);
        for resource in changes {
            let op = if !resource.is_present() {
                ChangeOp::Delete
            } else if previous.get(&resource.reference).is_some_and(|p| p.is_present()) {
                ChangeOp::Update
            } else {
                ChangeOp::Create
            };
            out.push(Change { op, resource });
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("conflict applying {0}")]
    Conflict(ResourceRef),
    #[error("{0} already exists")]
    AlreadyExists(ResourceRef),
    #[error("{0} not found")]
    NotFound(ResourceRef),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{reference} rejected: {message}")]
    Rejected { reference: ResourceRef, message: String },
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SinkError::Rejected { .. })
    }
}

/// Where desired state goes. Implementations claim ownership of what they create.
#[async_trait]
pub trait ApplySink: Send + Sync {
    async fn apply(&self, id: &DeploymentIdentity, resource: &Resource) -> Result<(), SinkError>;
    async fn delete(&self, id: &DeploymentIdentity, reference: &ResourceRef) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl ApplyReport {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

/// Push changes to the sink in order; the first failure stops the run.
pub async fn apply_changes(
    sink: &dyn ApplySink,
    id: &DeploymentIdentity,
    changes: &[Change],
) -> Result<ApplyReport, SinkError> {
    let mut report = ApplyReport::default();
    for change in changes {
        let t0 = Instant::now();
        let res = match change.op {
            ChangeOp::Delete => match sink.delete(id, &change.resource.reference).await {
                Err(SinkError::NotFound(_)) => Ok(()),
                other => other,
            },
            ChangeOp::Create | ChangeOp::Update => sink.apply(id, &change.resource).await,
        };
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(()) => {
                counter!("apply_ok", 1u64);
                debug!(deployment = %id, resource = %change.resource.reference, op = ?change.op, "applied");
                match change.op {
                    ChangeOp::Create => report.created += 1,
                    ChangeOp::Update => report.updated += 1,
                    ChangeOp::Delete => report.deleted += 1,
                }
            }
            Err(e) => {
                counter!("apply_err", 1u64);
                warn!(deployment = %id, resource = %change.resource.reference, error = %e, "apply failed");
                return Err(e);
            }
        }
    }
    if report.total() > 0 {
        info!(deployment = %id, created = report.created, updated = report.updated, deleted = report.deleted, "changes applied");
    }
    Ok(report)
}

/// In-memory sink that records calls; used by tests and `render --dry-run` style paths.
#[derive(Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<(ChangeOp, ResourceRef)>>,
    fail_on: Mutex<Option<(ResourceRef, SinkError)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call touching `reference` fail with `err`.
    pub fn fail_next(&self, reference: ResourceRef, err: SinkError) {
        if let Ok(mut g) = self.fail_on.lock() {
            *g = Some((reference, err));
        }
    }

    pub fn calls(&self) -> Vec<(ChangeOp, ResourceRef)> {
        self.calls.lock().map(|g| g.clone()).unwrap_or_default()
    }

    fn check(&self, reference: &ResourceRef) -> Result<(), SinkError> {
        let mut g = self.fail_on.lock().map_err(|e| SinkError::Transport(e.to_string()))?;
        match g.take() {
            Some((r, err)) if &r == reference => Err(err),
            other => {
                *g = other;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ApplySink for RecordingSink {
    async fn apply(&self, _id: &DeploymentIdentity, resource: &Resource) -> Result<(), SinkError> {
        self.check(&resource.reference)?;
        if let Ok(mut g) = self.calls.lock() {
            g.push((ChangeOp::Update, resource.reference.clone()));
        }
        Ok(())
    }

    async fn delete(&self, _id: &DeploymentIdentity, reference: &ResourceRef) -> Result<(), SinkError> {
        self.check(reference)?;
        if let Ok(mut g) = self.calls.lock() {
            g.push((ChangeOp::Delete, reference.clone()));
        }
        Ok(())
    }
}

/// Drop server-populated fields before comparing a live object with a desired one.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
            obj.remove("ownerReferences");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Field-level counts between two JSON documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                let n = aa.len().min(bb.len());
                s.updates += (0..n).filter(|i| aa[*i] != bb[*i]).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use coh_core::ResourcePayload;
    use k8s_openapi::api::core::v1::{Service, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn svc(name: &str, ip: &str) -> Resource {
        let s = Service {
            metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
            spec: Some(ServiceSpec { cluster_ip: Some(ip.into()), ..Default::default() }),
            ..Default::default()
        };
        Resource::present(name, ResourcePayload::Service(s), "h")
    }

    fn set(items: Vec<Resource>) -> ResourceSet {
        ResourceSet::new(1, items).unwrap()
    }

    #[test]
    fn diff_yields_tombstones_then_changes() {
        let prev = set(vec![svc("a", "None"), svc("b", "None"), svc("c", "None")]);
        let cur = set(vec![svc("a", "None"), svc("c", "1.2.3.4"), svc("d", "None")]);
        let (changes, prev_count) = diff(ResourceKind::Service, &prev, &cur);
        assert_eq!(prev_count, 3);
        let refs: Vec<_> = changes.iter().map(|r| (r.name().to_string(), r.is_present())).collect();
        assert_eq!(refs, vec![("b".into(), false), ("c".into(), true), ("d".into(), true)]);
        assert!(diff(ResourceKind::StatefulSet, &prev, &cur).0.is_empty());
    }

    #[test]
    fn equal_hash_still_compares_payloads() {
        let a = svc("a", "None");
        let mut b = svc("a", "10.0.0.1");
        b.hash = a.hash;
        let (changes, _) = diff(ResourceKind::Service, &set(vec![a]), &set(vec![b]));
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn identical_sets_produce_no_changes() {
        let s = set(vec![svc("a", "None"), svc("b", "None")]);
        assert!(plan_changes(&s, &s).is_empty());
    }

    #[tokio::test]
    async fn apply_changes_stops_at_first_failure() {
        let prev = ResourceSet::empty();
        let cur = set(vec![svc("a", "None"), svc("b", "None"), svc("c", "None")]);
        let changes = plan_changes(&prev, &cur);
        assert!(changes.iter().all(|c| c.op == ChangeOp::Create));

        let sink = RecordingSink::new();
        let b = ResourceRef::new(ResourceKind::Service, "b");
        sink.fail_next(b.clone(), SinkError::Conflict(b.clone()));
        let id = DeploymentIdentity::new("ns", "x");
        let err = apply_changes(&sink, &id, &changes).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(sink.calls().len(), 1);
    }

    #[tokio::test]
    async fn missing_object_on_delete_is_not_an_error() {
        let prev = set(vec![svc("a", "None")]);
        let changes = plan_changes(&prev, &ResourceSet::empty());
        let sink = RecordingSink::new();
        let a = ResourceRef::new(ResourceKind::Service, "a");
        sink.fail_next(a.clone(), SinkError::NotFound(a));
        let report = apply_changes(&sink, &DeploymentIdentity::new("ns", "x"), &changes).await.unwrap();
        assert_eq!(report.deleted, 1);
    }

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = serde_json::json!({
            "metadata": {"name": "x", "managedFields": [], "resourceVersion": "1", "uid": "u"},
            "status": {"ready": true},
            "spec": {}
        });
        let pruned = strip_noisy(v);
        let meta = pruned["metadata"].as_object().unwrap();
        assert_eq!(meta.len(), 1);
        assert!(pruned.get("status").is_none());
    }

    #[test]
    fn diff_summary_counts_adds_updates_removes() {
        let base = serde_json::json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3]});
        let target = serde_json::json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 1 });
    }
}
