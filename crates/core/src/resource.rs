//! Kinded, named resources and the versioned sets the diff engine compares.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use serde::{Deserialize, Serialize};

use crate::InvariantError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Service,
    ServiceMonitor,
    PersistentVolumeClaim,
    StatefulSet,
}

impl ResourceKind {
    /// Kinds in the order their changes are applied.
    pub const APPLY_ORDER: [ResourceKind; 4] = [
        ResourceKind::Service,
        ResourceKind::ServiceMonitor,
        ResourceKind::PersistentVolumeClaim,
        ResourceKind::StatefulSet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Service => "Service",
            ResourceKind::ServiceMonitor => "ServiceMonitor",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::StatefulSet => "StatefulSet",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self { kind, name: name.into() }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Closed set of objects the operator manages. ServiceMonitor stays untyped (no CRD types in tree).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "object")]
pub enum ResourcePayload {
    Service(Service),
    ServiceMonitor(serde_json::Value),
    PersistentVolumeClaim(PersistentVolumeClaim),
    StatefulSet(StatefulSet),
}

impl ResourcePayload {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourcePayload::Service(_) => ResourceKind::Service,
            ResourcePayload::ServiceMonitor(_) => ResourceKind::ServiceMonitor,
            ResourcePayload::PersistentVolumeClaim(_) => ResourceKind::PersistentVolumeClaim,
            ResourcePayload::StatefulSet(_) => ResourceKind::StatefulSet,
        }
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        match self {
            ResourcePayload::Service(o) => o.metadata.labels.clone().unwrap_or_default(),
            ResourcePayload::PersistentVolumeClaim(o) => o.metadata.labels.clone().unwrap_or_default(),
            ResourcePayload::StatefulSet(o) => o.metadata.labels.clone().unwrap_or_default(),
            ResourcePayload::ServiceMonitor(v) => v
                .pointer("/metadata/labels")
                .and_then(|l| serde_json::from_value(l.clone()).ok())
                .unwrap_or_default(),
        }
    }

    pub fn set_label(&mut self, key: &str, value: String) {
        let labels = match self {
            ResourcePayload::Service(o) => o.metadata.labels.get_or_insert_with(BTreeMap::new),
            ResourcePayload::PersistentVolumeClaim(o) => o.metadata.labels.get_or_insert_with(BTreeMap::new),
            ResourcePayload::StatefulSet(o) => o.metadata.labels.get_or_insert_with(BTreeMap::new),
            ResourcePayload::ServiceMonitor(v) => {
                if let Some(obj) = v.as_object_mut() {
                    let meta = obj.entry("metadata").or_insert_with(|| serde_json::json!({}));
                    if let Some(meta) = meta.as_object_mut() {
                        let labels = meta.entry("labels").or_insert_with(|| serde_json::json!({}));
                        if let Some(labels) = labels.as_object_mut() {
                            labels.insert(key.to_string(), serde_json::Value::String(value));
                        }
                    }
                }
                return;
            }
        };
        labels.insert(key.to_string(), value);
    }

    /// Replica count of a workload; `None` for other kinds.
    pub fn replicas(&self) -> Option<i32> {
        match self {
            ResourcePayload::StatefulSet(s) => s.spec.as_ref().and_then(|s| s.replicas),
            _ => None,
        }
    }

    /// Copy of this payload with the workload replica count replaced.
    pub fn with_replicas(&self, replicas: i32) -> ResourcePayload {
        let mut out = self.clone();
        if let ResourcePayload::StatefulSet(s) = &mut out {
            if let Some(spec) = s.spec.as_mut() {
                spec.replicas = Some(replicas);
            }
        }
        out
    }
}

/// 64-bit FNV-1a over the JSON encoding of a payload.
pub fn content_hash(payload: &ResourcePayload) -> u64 {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut h: u64 = 0xcbf29ce484222325;
    for b in &bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

/// A desired resource, or a tombstone when `payload` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub reference: ResourceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ResourcePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<u64>,
}

impl Resource {
    /// Hash the payload, then stamp the hash into it under `hash_label`.
    pub fn present(name: impl Into<String>, mut payload: ResourcePayload, hash_label: &str) -> Self {
        let hash = content_hash(&payload);
        payload.set_label(hash_label, format!("{hash:016x}"));
        Self { reference: ResourceRef::new(payload.kind(), name), payload: Some(payload), hash: Some(hash) }
    }

    pub fn tombstone(reference: ResourceRef) -> Self {
        Self { reference, payload: None, hash: None }
    }

    pub fn is_present(&self) -> bool {
        self.payload.is_some()
    }

    pub fn kind(&self) -> ResourceKind {
        self.reference.kind
    }

    pub fn name(&self) -> &str {
        &self.reference.name
    }
}

#[derive(Deserialize)]
struct RawResourceSet {
    version: u64,
    #[serde(default)]
    items: Vec<Resource>,
}

/// Versioned, ordered resources of one deployment. Refs are unique.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawResourceSet")]
pub struct ResourceSet {
    pub version: u64,
    items: Vec<Resource>,
}

impl TryFrom<RawResourceSet> for ResourceSet {
    type Error = InvariantError;

    fn try_from(raw: RawResourceSet) -> Result<Self, Self::Error> {
        ResourceSet::new(raw.version, raw.items)
    }
}

impl ResourceSet {
    pub fn new(version: u64, items: Vec<Resource>) -> Result<Self, InvariantError> {
        let mut seen = HashSet::with_capacity(items.len());
        for r in &items {
            if let Some(p) = &r.payload {
                if p.kind() != r.reference.kind {
                    return Err(InvariantError::KindMismatch(r.reference.clone()));
                }
            }
            if !seen.insert(&r.reference) {
                return Err(InvariantError::DuplicateRef(r.reference.clone()));
            }
        }
        Ok(Self { version, items })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn items(&self) -> &[Resource] {
        &self.items
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.items.iter()
    }

    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &Resource> {
        self.items.iter().filter(move |r| r.reference.kind == kind)
    }

    pub fn get(&self, reference: &ResourceRef) -> Option<&Resource> {
        self.items.iter().find(|r| &r.reference == reference)
    }

    pub fn workload(&self) -> Option<&Resource> {
        self.of_kind(ResourceKind::StatefulSet).next()
    }

    /// Replace the entry with the same ref, or append.
    pub fn with_resource(mut self, resource: Resource) -> Self {
        match self.items.iter_mut().find(|r| r.reference == resource.reference) {
            Some(slot) => *slot = resource,
            None => self.items.push(resource),
        }
        self
    }

    pub fn without(mut self, reference: &ResourceRef) -> Self {
        self.items.retain(|r| &r.reference != reference);
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
