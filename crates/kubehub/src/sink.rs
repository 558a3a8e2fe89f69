use async_trait::async_trait;
use coh_apply::{ApplySink, SinkError};
use coh_core::{Coherence, DeploymentIdentity, Resource, ResourceKind, ResourcePayload, ResourceRef};
use k8s_openapi::api::{
    apps::v1::StatefulSet,
    core::v1::{PersistentVolumeClaim, Service},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client, Resource as _,
};
use serde_json::{json, Value};
use tracing::debug;

/// Server-side apply of generated objects, each owned by its Coherence resource.
pub struct KubeSink {
    client: Client,
    field_manager: String,
}

impl KubeSink {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self { client, field_manager: field_manager.into() }
    }

    fn api(&self, namespace: &str, kind: ResourceKind) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(kind))
    }

    async fn owner(&self, id: &DeploymentIdentity) -> Result<OwnerReference, SinkError> {
        let api: Api<Coherence> = Api::namespaced(self.client.clone(), &id.namespace);
        let cr = api.get_opt(&id.name).await.map_err(|e| SinkError::Transport(e.to_string()))?;
        cr.and_then(|cr| cr.controller_owner_ref(&()))
            .ok_or_else(|| SinkError::Transport(format!("owner {id} is gone")))
    }
}

pub(crate) fn api_resource(kind: ResourceKind) -> ApiResource {
    match kind {
        ResourceKind::Service => ApiResource::erase::<Service>(&()),
        ResourceKind::PersistentVolumeClaim => ApiResource::erase::<PersistentVolumeClaim>(&()),
        ResourceKind::StatefulSet => ApiResource::erase::<StatefulSet>(&()),
        ResourceKind::ServiceMonitor => {
            ApiResource::from_gvk(&GroupVersionKind::gvk("monitoring.coreos.com", "v1", "ServiceMonitor"))
        }
    }
}

/// The object to apply: payload JSON with name, namespace and, when known, the owner filled in.
pub fn manifest(
    id: &DeploymentIdentity,
    name: &str,
    payload: &ResourcePayload,
    owner: Option<&OwnerReference>,
) -> serde_json::Result<Value> {
    let mut obj = match payload {
        ResourcePayload::Service(o) => serde_json::to_value(o)?,
        ResourcePayload::PersistentVolumeClaim(o) => serde_json::to_value(o)?,
        ResourcePayload::StatefulSet(o) => serde_json::to_value(o)?,
        ResourcePayload::ServiceMonitor(v) => v.clone(),
    };
    if let Some(map) = obj.as_object_mut() {
        let meta = map.entry("metadata").or_insert_with(|| json!({}));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("name".into(), json!(name));
            meta.insert("namespace".into(), json!(id.namespace));
            if let Some(owner) = owner {
                meta.insert("ownerReferences".into(), json!([owner]));
            }
            meta.remove("managedFields");
            meta.remove("resourceVersion");
        }
    }
    Ok(obj)
}

pub(crate) fn sink_error(reference: &ResourceRef, e: kube::Error) -> SinkError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            409 if ae.reason == "AlreadyExists" => SinkError::AlreadyExists(reference.clone()),
            409 => SinkError::Conflict(reference.clone()),
            404 => SinkError::NotFound(reference.clone()),
            400 | 422 => SinkError::Rejected { reference: reference.clone(), message: ae.message },
            _ => SinkError::Transport(ae.message),
        },
        other => SinkError::Transport(other.to_string()),
    }
}

#[async_trait]
impl ApplySink for KubeSink {
    async fn apply(&self, id: &DeploymentIdentity, resource: &Resource) -> Result<(), SinkError> {
        let Some(payload) = resource.payload.as_ref() else {
            return self.delete(id, &resource.reference).await;
        };
        let reference = &resource.reference;
        let owner = self.owner(id).await?;
        let obj = manifest(id, reference.name.as_str(), payload, Some(&owner))
            .map_err(|e| SinkError::Rejected { reference: reference.clone(), message: e.to_string() })?;
        let pp = PatchParams::apply(&self.field_manager).force();
        self.api(&id.namespace, reference.kind)
            .patch(&reference.name, &pp, &Patch::Apply(&obj))
            .await
            .map_err(|e| sink_error(reference, e))?;
        debug!(deployment = %id, resource = %reference, "applied");
        Ok(())
    }

    async fn delete(&self, id: &DeploymentIdentity, reference: &ResourceRef) -> Result<(), SinkError> {
        self.api(&id.namespace, reference.kind)
            .delete(&reference.name, &DeleteParams::background())
            .await
            .map_err(|e| sink_error(reference, e))?;
        debug!(deployment = %id, resource = %reference, "deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "m".into(), reason: reason.into(), code })
    }

    #[test]
    fn api_errors_map_to_sink_errors() {
        let r = ResourceRef::new(ResourceKind::Service, "storage-sts");
        assert_eq!(sink_error(&r, api_err(409, "Conflict")), SinkError::Conflict(r.clone()));
        assert_eq!(sink_error(&r, api_err(409, "AlreadyExists")), SinkError::AlreadyExists(r.clone()));
        assert_eq!(sink_error(&r, api_err(404, "NotFound")), SinkError::NotFound(r.clone()));
        assert!(!sink_error(&r, api_err(422, "Invalid")).is_retryable());
        assert!(sink_error(&r, api_err(500, "InternalError")).is_retryable());
    }

    #[test]
    fn manifest_carries_identity_and_owner() {
        let id = DeploymentIdentity::new("ns", "storage");
        let owner = OwnerReference {
            api_version: "coherence.oracle.com/v1".into(),
            kind: "Coherence".into(),
            name: "storage".into(),
            uid: "1234".into(),
            controller: Some(true),
            ..Default::default()
        };
        let obj = manifest(&id, "storage-sts", &ResourcePayload::Service(Service::default()), Some(&owner)).unwrap();
        assert_eq!(obj["kind"], "Service");
        assert_eq!(obj["apiVersion"], "v1");
        assert_eq!(obj["metadata"]["name"], "storage-sts");
        assert_eq!(obj["metadata"]["namespace"], "ns");
        assert_eq!(obj["metadata"]["ownerReferences"][0]["uid"], "1234");
        assert_eq!(api_resource(ResourceKind::ServiceMonitor).plural, "servicemonitors");

        let bare = manifest(&id, "storage-sts", &ResourcePayload::Service(Service::default()), None).unwrap();
        assert!(bare["metadata"].get("ownerReferences").is_none());
    }
}
