use async_trait::async_trait;
use coh_core::{Coherence, DeploymentIdentity, StatusRecord};
use coh_reconcile::{SourceError, SpecSnapshot, SpecSource};
use coh_store::{PublishError, StatusSink};
use kube::{
    api::{Api, Patch, PatchParams},
    Client, ResourceExt,
};
use serde_json::{json, Value as Json};
use tracing::debug;

use crate::api_code;

/// Held on every Coherence resource so services can be suspended before deletion.
pub const FINALIZER: &str = "coherence.oracle.com/operator";
/// Present on a resource being deleted: skip service suspension.
pub const FINALIZER_BYPASS_ANNOTATION: &str = "coherence.oracle.com/finalizer-bypass";

/// Reads Coherence resources and keeps the operator's finalizer on them.
pub struct KubeSpecSource {
    client: Client,
}

impl KubeSpecSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

pub(crate) fn snapshot(cr: &Coherence) -> SpecSnapshot {
    SpecSnapshot {
        spec: cr.spec.clone(),
        generation: cr.metadata.generation.unwrap_or(0),
        deleting: cr.metadata.deletion_timestamp.is_some(),
        skip_suspend: cr.annotations().contains_key(FINALIZER_BYPASS_ANNOTATION),
    }
}

/// Merge patch adding (or removing) the finalizer; `None` when nothing changes.
/// The resource version makes a concurrent edit fail with a conflict.
pub(crate) fn finalizer_patch(cr: &Coherence, present: bool) -> Option<Json> {
    let current = cr.finalizers();
    if current.iter().any(|f| f == FINALIZER) == present {
        return None;
    }
    let mut next: Vec<&str> = current.iter().map(String::as_str).filter(|f| *f != FINALIZER).collect();
    if present {
        next.push(FINALIZER);
    }
    Some(json!({ "metadata": { "finalizers": next, "resourceVersion": cr.resource_version() } }))
}

impl KubeSpecSource {
    async fn patch(&self, api: &Api<Coherence>, cr: &Coherence, present: bool) -> Result<(), SourceError> {
        let Some(patch) = finalizer_patch(cr, present) else { return Ok(()) };
        match api.patch(&cr.name_any(), &PatchParams::default(), &Patch::Merge(&patch)).await {
            Ok(_) => {
                debug!(name = %cr.name_any(), present, "finalizer patched");
                Ok(())
            }
            Err(e) if api_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(SourceError::Transport(e.to_string())),
        }
    }
}

#[async_trait]
impl SpecSource for KubeSpecSource {
    async fn get(&self, id: &DeploymentIdentity) -> Result<Option<SpecSnapshot>, SourceError> {
        let api: Api<Coherence> = Api::namespaced(self.client.clone(), &id.namespace);
        let Some(cr) = api.get_opt(&id.name).await.map_err(|e| SourceError::Transport(e.to_string()))? else {
            return Ok(None);
        };
        let snap = snapshot(&cr);
        if !snap.deleting {
            self.patch(&api, &cr, true).await?;
        }
        Ok(Some(snap))
    }

    async fn release(&self, id: &DeploymentIdentity) -> Result<(), SourceError> {
        let api: Api<Coherence> = Api::namespaced(self.client.clone(), &id.namespace);
        match api.get_opt(&id.name).await.map_err(|e| SourceError::Transport(e.to_string()))? {
            Some(cr) => self.patch(&api, &cr, false).await,
            None => Ok(()),
        }
    }
}

/// Writes StatusRecords to the `status` subresource.
pub struct KubeStatusSink {
    client: Client,
}

impl KubeStatusSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusSink for KubeStatusSink {
    async fn publish(&self, id: &DeploymentIdentity, record: &StatusRecord) -> Result<(), PublishError> {
        let api: Api<Coherence> = Api::namespaced(self.client.clone(), &id.namespace);
        let patch = json!({ "status": record });
        match api.patch_status(&id.name, &PatchParams::default(), &Patch::Merge(&patch)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(PublishError::NotFound(id.clone())),
            Err(e) => Err(PublishError::Transport(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coh_core::ClusterSpec;

    #[test]
    fn deleting_resources_are_flagged() {
        let mut cr = Coherence::new("storage", ClusterSpec { replicas: Some(2), ..Default::default() });
        cr.metadata.generation = Some(4);
        let s = snapshot(&cr);
        assert_eq!(s.generation, 4);
        assert_eq!(s.spec.replicas, Some(2));
        assert!(!s.deleting && !s.skip_suspend);

        cr.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            k8s_openapi::chrono::Utc::now(),
        ));
        cr.annotations_mut().insert(FINALIZER_BYPASS_ANNOTATION.to_string(), String::new());
        let s = snapshot(&cr);
        assert!(s.deleting && s.skip_suspend);
    }

    #[test]
    fn finalizer_patch_keeps_foreign_finalizers() {
        let mut cr = Coherence::new("storage", ClusterSpec::default());
        cr.metadata.resource_version = Some("17".into());
        cr.metadata.finalizers = Some(vec!["example.com/other".into()]);

        let add = finalizer_patch(&cr, true).unwrap();
        assert_eq!(add["metadata"]["finalizers"], json!(["example.com/other", FINALIZER]));
        assert_eq!(add["metadata"]["resourceVersion"], "17");
        assert!(finalizer_patch(&cr, false).is_none());

        cr.finalizers_mut().push(FINALIZER.to_string());
        assert!(finalizer_patch(&cr, true).is_none());
        let remove = finalizer_patch(&cr, false).unwrap();
        assert_eq!(remove["metadata"]["finalizers"], json!(["example.com/other"]));
    }
}
