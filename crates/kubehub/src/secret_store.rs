use std::collections::BTreeMap;

use async_trait::async_trait;
use coh_core::{Coherence, DeploymentIdentity, ResourceSet};
use coh_persist::{StateStore, StoreError};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::{
    api::{Api, DeleteParams, PostParams},
    Client, Resource as _,
};
use metrics::counter;
use tracing::debug;

use crate::api_code;

const KEY_LATEST: &str = "latest";
const KEY_PREVIOUS: &str = "previous";
const STORE_LABEL: &str = "coherence-storage";
const VERSION_ANNOTATION: &str = "coherence.oracle.com/store-version";

/// Last-applied sets kept in a Secret named after the deployment.
///
/// `latest` holds the current set and `previous` the one before it. Writes are
/// guarded twice: by the version annotation and by the Secret's resourceVersion.
pub struct SecretStateStore {
    client: Client,
}

impl SecretStateStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn fetch(&self, id: &DeploymentIdentity) -> Result<Option<Secret>, StoreError> {
        self.secrets(&id.namespace).get_opt(&id.name).await.map_err(|e| StoreError::Backend(e.to_string()))
    }
}

pub(crate) fn stored_version(secret: &Secret) -> u64 {
    secret.metadata.annotations.as_ref().and_then(|a| a.get(VERSION_ANNOTATION)).and_then(|v| v.parse().ok()).unwrap_or(0)
}

pub(crate) fn latest(secret: &Secret) -> Result<Option<ResourceSet>, StoreError> {
    match secret.data.as_ref().and_then(|d| d.get(KEY_LATEST)) {
        Some(bytes) if !bytes.0.is_empty() => {
            serde_json::from_slice(&bytes.0).map(Some).map_err(|e| StoreError::Corrupt(e.to_string()))
        }
        _ => Ok(None),
    }
}

/// Rotate `latest` into `previous` and stamp the new version.
pub(crate) fn next_secret(current: Option<Secret>, id: &DeploymentIdentity, set: &ResourceSet, version: u64) -> Result<Secret, StoreError> {
    let body = serde_json::to_vec(&set.clone().with_version(version)).map_err(|e| StoreError::Backend(e.to_string()))?;
    let mut secret = current.unwrap_or_else(|| {
        let mut s = Secret::default();
        s.metadata.name = Some(id.name.clone());
        s.metadata.namespace = Some(id.namespace.clone());
        s
    });
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    if let Some(old) = data.remove(KEY_LATEST) {
        data.insert(KEY_PREVIOUS.to_string(), old);
    }
    data.insert(KEY_LATEST.to_string(), ByteString(body));
    secret.metadata.labels.get_or_insert_with(BTreeMap::new).insert(STORE_LABEL.to_string(), "true".to_string());
    secret
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(VERSION_ANNOTATION.to_string(), version.to_string());
    Ok(secret)
}

#[async_trait]
impl StateStore for SecretStateStore {
    async fn load(&self, id: &DeploymentIdentity) -> Result<Option<ResourceSet>, StoreError> {
        match self.fetch(id).await? {
            Some(secret) => latest(&secret),
            None => Ok(None),
        }
    }

    async fn record(&self, id: &DeploymentIdentity, set: &ResourceSet, expected_version: u64) -> Result<u64, StoreError> {
        let current = self.fetch(id).await?;
        let found = current.as_ref().map(stored_version).unwrap_or(0);
        if found != expected_version {
            counter!("persist_conflict_total", 1u64);
            return Err(StoreError::Conflict { expected: expected_version, found });
        }
        let version = expected_version + 1;
        let exists = current.is_some();
        let mut secret = next_secret(current, id, set, version)?;
        let api = self.secrets(&id.namespace);
        let res = if exists {
            api.replace(&id.name, &PostParams::default(), &secret).await
        } else {
            let owners: Api<Coherence> = Api::namespaced(self.client.clone(), &id.namespace);
            if let Some(owner) = owners.get_opt(&id.name).await.ok().flatten().and_then(|cr| cr.controller_owner_ref(&())) {
                secret.metadata.owner_references = Some(vec![owner]);
            }
            api.create(&PostParams::default(), &secret).await
        };
        match res {
            Ok(_) => {
                counter!("persist_put_total", 1u64);
                debug!(deployment = %id, version, "recorded resource set in secret");
                Ok(version)
            }
            Err(e) if api_code(&e) == Some(409) => {
                counter!("persist_conflict_total", 1u64);
                let found = self.fetch(id).await?.as_ref().map(stored_version).unwrap_or(0);
                Err(StoreError::Conflict { expected: expected_version, found })
            }
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn destroy(&self, id: &DeploymentIdentity) -> Result<(), StoreError> {
        match self.secrets(&id.namespace).delete(&id.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if api_code(&e) == Some(404) => Ok(()),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }
}
