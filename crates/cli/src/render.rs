//! Offline commands: synthesize a spec file and compare against a stored set.

use std::path::Path;

use anyhow::{bail, Context, Result};
use coh_apply::{diff_summary, plan_changes, ChangeOp, DiffSummary};
use coh_core::{Catalog, ClusterSpec, Coherence, DeploymentIdentity, ResourceSet};
use coh_kubehub::manifest;
use serde::Serialize;
use serde_json::Value as Json;

const DEFAULT_NAMESPACE: &str = "default";

/// Read a Coherence manifest or a bare spec. `id` (`ns/name` or `name`) wins over metadata.
pub fn parse_spec(text: &str, id: Option<&str>) -> Result<(DeploymentIdentity, ClusterSpec)> {
    let doc: serde_yaml::Value = serde_yaml::from_str(text).context("parsing spec YAML")?;
    let (meta_id, spec) = if doc.get("kind").is_some() {
        let cr: Coherence = serde_yaml::from_value(doc).context("reading Coherence resource")?;
        let meta_id = cr.metadata.name.clone().map(|name| {
            DeploymentIdentity::new(cr.metadata.namespace.clone().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()), name)
        });
        (meta_id, cr.spec)
    } else {
        (None, serde_yaml::from_value(doc).context("reading cluster spec")?)
    };
    let id = match id {
        Some(key) => DeploymentIdentity::parse(key, DEFAULT_NAMESPACE).with_context(|| format!("invalid identity '{key}'"))?,
        None => match meta_id {
            Some(id) => id,
            None => bail!("bare spec needs --id <namespace/name>"),
        },
    };
    Ok((id, spec))
}

pub fn load_spec(path: &Path, id: Option<&str>) -> Result<(DeploymentIdentity, ClusterSpec)> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_spec(&text, id)
}

pub fn synthesize(spec: &ClusterSpec, id: &DeploymentIdentity, catalog: &Catalog) -> Result<ResourceSet> {
    coh_synth::synthesize(spec, id, catalog).with_context(|| format!("synthesizing {id}"))
}

/// A set written by `render --set` or read out of a state store.
pub fn load_set(path: &Path) -> Result<ResourceSet> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing resource set {}", path.display()))
}

/// Applyable objects for every present resource, in set order.
pub fn manifests(id: &DeploymentIdentity, set: &ResourceSet) -> Result<Vec<Json>> {
    let mut out = Vec::with_capacity(set.len());
    for r in set.iter() {
        if let Some(payload) = &r.payload {
            out.push(manifest(id, r.name(), payload, None).with_context(|| format!("serializing {}", r.reference))?);
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffLine {
    pub op: ChangeOp,
    pub resource: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<DiffSummary>,
}

impl DiffLine {
    pub fn render(&self) -> String {
        let sign = match self.op {
            ChangeOp::Create => '+',
            ChangeOp::Update => '~',
            ChangeOp::Delete => '-',
        };
        match &self.fields {
            Some(f) => format!("{sign} {} (adds={} updates={} removes={})", self.resource, f.adds, f.updates, f.removes),
            None => format!("{sign} {}", self.resource),
        }
    }
}

/// Planned changes from `previous` to `current`, with field counts for updates.
pub fn diff_lines(id: &DeploymentIdentity, previous: &ResourceSet, current: &ResourceSet) -> Result<Vec<DiffLine>> {
    let mut out = Vec::new();
    for change in plan_changes(previous, current) {
        let reference = &change.resource.reference;
        let fields = match (change.op, &change.resource.payload, previous.get(reference).and_then(|p| p.payload.as_ref())) {
            (ChangeOp::Update, Some(now), Some(before)) => {
                let now = manifest(id, &reference.name, now, None)?;
                let before = manifest(id, &reference.name, before, None)?;
                Some(diff_summary(&now, &before))
            }
            _ => None,
        };
        out.push(DiffLine { op: change.op, resource: reference.to_string(), fields });
    }
    Ok(out)
}
