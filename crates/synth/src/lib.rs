//! Desired-state synthesis: cluster spec in, ordered resource set out.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};

use coh_core::prelude::*;
use coh_core::{ConfigError, DeploymentIdentity, NamedPortSpec};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, Service, ServicePort, ServiceSpec,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

mod workload;

pub use workload::workload_name;

/// Build the full desired resource set for one deployment.
///
/// Pure: identical inputs give byte-identical output. The returned set has
/// version 0; the state store assigns versions when it is recorded.
pub fn synthesize(spec: &ClusterSpec, id: &DeploymentIdentity, catalog: &Catalog) -> Result<ResourceSet, ConfigError> {
    if spec.replicas(catalog) <= 0 {
        return Ok(ResourceSet::empty());
    }
    check_ports(spec, catalog)?;

    let hash_label = catalog.labels.hash.as_str();
    let mut items = Vec::new();

    if spec.requires_wka_service() {
        let name = format!("{}{}", id.name, catalog.wka_suffix);
        items.push(Resource::present(name, ResourcePayload::Service(wka_service(spec, id, catalog)), hash_label));
    }

    let headless = format!("{}{}", id.name, catalog.headless_suffix);
    items.push(Resource::present(headless, ResourcePayload::Service(headless_service(spec, id, catalog)), hash_label));

    if let Some(snap) = spec.persistence.as_ref().and_then(|p| p.snapshots.as_ref()) {
        let pvc = snapshot_claim(spec, id, catalog, snap)?;
        let name = format!("{}{}", id.name, catalog.snapshot_suffix);
        items.push(Resource::present(name, ResourcePayload::PersistentVolumeClaim(pvc), hash_label));
    }

    let sts = workload::statefulset(spec, id, catalog)?;
    items.push(Resource::present(workload_name(id), ResourcePayload::StatefulSet(sts), hash_label));

    for port in &spec.ports {
        if !port.service_enabled() {
            continue;
        }
        let svc = port_service(spec, id, catalog, port)?;
        items.push(Resource::present(port.service_name(id), ResourcePayload::Service(svc), hash_label));
        if port.service_monitor_enabled() {
            let sm = service_monitor(spec, id, catalog, port);
            items.push(Resource::present(port.service_name(id), ResourcePayload::ServiceMonitor(sm), hash_label));
        }
    }

    debug!(deployment = %id, count = items.len(), "synthesized resources");
    Ok(ResourceSet::new(0, items)?)
}

fn check_ports(spec: &ClusterSpec, catalog: &Catalog) -> Result<(), ConfigError> {
    let mut seen: HashSet<&str> = HashSet::new();
    seen.insert(catalog.port_name_coherence.as_str());
    seen.insert(catalog.port_name_health.as_str());
    for p in &spec.ports {
        if !seen.insert(p.name.as_str()) {
            return Err(ConfigError::DuplicatePort { name: p.name.clone() });
        }
        p.resolve_port(spec, catalog)?;
    }
    Ok(())
}

/// Labels every generated object carries.
pub fn common_labels(spec: &ClusterSpec, id: &DeploymentIdentity, catalog: &Catalog) -> BTreeMap<String, String> {
    BTreeMap::from([
        (catalog.labels.deployment.clone(), id.name.clone()),
        (catalog.labels.cluster.clone(), spec.cluster_name(id).to_string()),
        (catalog.labels.role.clone(), spec.role_name(id).to_string()),
    ])
}

/// Selector matching this deployment's member pods.
pub fn pod_selector(spec: &ClusterSpec, id: &DeploymentIdentity, catalog: &Catalog) -> BTreeMap<String, String> {
    let mut labels = common_labels(spec, id, catalog);
    labels.insert(catalog.labels.component.clone(), catalog.components.pod.clone());
    labels
}

fn with_component(mut labels: BTreeMap<String, String>, catalog: &Catalog, component: &str) -> BTreeMap<String, String> {
    labels.insert(catalog.labels.component.clone(), component.to_string());
    labels
}

fn meta(id: &DeploymentIdentity, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta { name: Some(name), namespace: Some(id.namespace.clone()), labels: Some(labels), ..ObjectMeta::default() }
}

fn cluster_port(catalog: &Catalog) -> ServicePort {
    ServicePort {
        name: Some(format!("tcp-{}", catalog.port_name_coherence)),
        protocol: Some("TCP".to_string()),
        port: catalog.coherence_port,
        target_port: Some(IntOrString::Int(catalog.coherence_port)),
        ..ServicePort::default()
    }
}

fn wka_service(spec: &ClusterSpec, id: &DeploymentIdentity, catalog: &Catalog) -> Service {
    let labels = with_component(common_labels(spec, id, catalog), catalog, &catalog.components.wka);
    let selector = BTreeMap::from([
        (catalog.labels.cluster.clone(), spec.cluster_name(id).to_string()),
        (catalog.labels.component.clone(), catalog.components.pod.clone()),
        (catalog.labels.wka_member.clone(), "true".to_string()),
    ]);
    let mut metadata = meta(id, format!("{}{}", id.name, catalog.wka_suffix), labels);
    metadata.annotations = Some(BTreeMap::from([(
        "service.alpha.kubernetes.io/tolerate-unready-endpoints".to_string(),
        "true".to_string(),
    )]));
    Service {
        metadata,
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            ports: Some(vec![cluster_port(catalog)]),
            selector: Some(selector),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

fn headless_service(spec: &ClusterSpec, id: &DeploymentIdentity, catalog: &Catalog) -> Service {
    let labels = with_component(common_labels(spec, id, catalog), catalog, &catalog.components.headless);
    Service {
        metadata: meta(id, format!("{}{}", id.name, catalog.headless_suffix), labels),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            ports: Some(vec![cluster_port(catalog)]),
            selector: Some(pod_selector(spec, id, catalog)),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

pub(crate) fn claim_spec(pvc: &coh_core::PvcSpec) -> Result<PersistentVolumeClaimSpec, ConfigError> {
    if pvc.storage.trim().is_empty() {
        return Err(ConfigError::Persistence("volume storage size must be set".to_string()));
    }
    let access_modes = if pvc.access_modes.is_empty() { vec!["ReadWriteOnce".to_string()] } else { pvc.access_modes.clone() };
    Ok(PersistentVolumeClaimSpec {
        access_modes: Some(access_modes),
        storage_class_name: pvc.storage_class_name.clone(),
        resources: Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([("storage".to_string(), Quantity(pvc.storage.clone()))])),
            ..VolumeResourceRequirements::default()
        }),
        ..PersistentVolumeClaimSpec::default()
    })
}

fn snapshot_claim(
    spec: &ClusterSpec,
    id: &DeploymentIdentity,
    catalog: &Catalog,
    pvc: &coh_core::PvcSpec,
) -> Result<PersistentVolumeClaim, ConfigError> {
    let labels = with_component(common_labels(spec, id, catalog), catalog, &catalog.components.volume);
    Ok(PersistentVolumeClaim {
        metadata: meta(id, format!("{}{}", id.name, catalog.snapshot_suffix), labels),
        spec: Some(claim_spec(pvc)?),
        ..PersistentVolumeClaim::default()
    })
}

fn port_service(
    spec: &ClusterSpec,
    id: &DeploymentIdentity,
    catalog: &Catalog,
    port: &NamedPortSpec,
) -> Result<Service, ConfigError> {
    let svc_spec = port.service.clone().unwrap_or_default();
    let mut labels = with_component(common_labels(spec, id, catalog), catalog, &catalog.components.port_service);
    labels.insert(catalog.labels.port.clone(), port.name.clone());
    labels.extend(svc_spec.labels.clone());

    let target = port.resolve_port(spec, catalog)?;
    let service_port = ServicePort {
        name: Some(svc_spec.port_name.clone().unwrap_or_else(|| port.name.clone())),
        protocol: Some(port.protocol().to_string()),
        app_protocol: port.app_protocol.clone(),
        port: port.service_port(spec, catalog)?,
        target_port: Some(IntOrString::Int(target)),
        node_port: port.node_port,
        ..ServicePort::default()
    };

    let mut metadata = meta(id, port.service_name(id), labels);
    if !svc_spec.annotations.is_empty() {
        metadata.annotations = Some(svc_spec.annotations.clone());
    }
    Ok(Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: svc_spec.type_.clone(),
            ports: Some(vec![service_port]),
            selector: Some(pod_selector(spec, id, catalog)),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    })
}

fn service_monitor(
    spec: &ClusterSpec,
    id: &DeploymentIdentity,
    catalog: &Catalog,
    port: &NamedPortSpec,
) -> serde_json::Value {
    let sm = port.service_monitor.clone().unwrap_or_default();
    let mut labels = with_component(common_labels(spec, id, catalog), catalog, &catalog.components.service_monitor);
    labels.extend(sm.labels.clone());

    let mut selector = with_component(common_labels(spec, id, catalog), catalog, &catalog.components.port_service);
    selector.insert(catalog.labels.port.clone(), port.name.clone());

    let mut endpoint = serde_json::json!({
        "port": port.name,
        "relabelings": [{"action": "labeldrop", "regex": "(endpoint|instance|job|service)"}],
    });
    if let Some(interval) = &sm.interval {
        endpoint["interval"] = serde_json::Value::String(interval.clone());
    }
    serde_json::json!({
        "apiVersion": "monitoring.coreos.com/v1",
        "kind": "ServiceMonitor",
        "metadata": {
            "name": port.service_name(id),
            "namespace": id.namespace,
            "labels": labels,
        },
        "spec": {
            "selector": {"matchLabels": selector},
            "endpoints": [endpoint],
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use coh_core::{PortServiceSpec, ServiceMonitorSpec, WkaSpec};

    fn id() -> DeploymentIdentity {
        DeploymentIdentity::new("ns", "storage")
    }

    fn names(set: &ResourceSet) -> Vec<String> {
        set.iter().map(|r| r.reference.to_string()).collect()
    }

    #[test]
    fn emits_in_dependency_order() {
        let spec = ClusterSpec {
            ports: vec![NamedPortSpec {
                name: "metrics".into(),
                service_monitor: Some(ServiceMonitorSpec { enabled: Some(true), ..Default::default() }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let set = synthesize(&spec, &id(), &Catalog::default()).unwrap();
        assert_eq!(
            names(&set),
            vec![
                "Service/storage-wka",
                "Service/storage-sts",
                "StatefulSet/storage",
                "Service/storage-metrics",
                "ServiceMonitor/storage-metrics",
            ]
        );
    }

    #[test]
    fn zero_replicas_yield_nothing() {
        let spec = ClusterSpec { replicas: Some(0), ..Default::default() };
        assert!(synthesize(&spec, &id(), &Catalog::default()).unwrap().is_empty());
    }

    #[test]
    fn external_wka_skips_wka_service_and_disabled_ports_skip_services() {
        let spec = ClusterSpec {
            wka: Some(WkaSpec { deployment: "other".into(), namespace: None }),
            ports: vec![NamedPortSpec {
                name: "extend".into(),
                port: Some(20000),
                service: Some(PortServiceSpec { enabled: Some(false), ..Default::default() }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let set = synthesize(&spec, &id(), &Catalog::default()).unwrap();
        assert_eq!(names(&set), vec!["Service/storage-sts", "StatefulSet/storage"]);
    }

    #[test]
    fn duplicate_and_unresolved_ports_are_config_errors() {
        let dup = ClusterSpec {
            ports: vec![
                NamedPortSpec { name: "a".into(), port: Some(1), ..Default::default() },
                NamedPortSpec { name: "a".into(), port: Some(2), ..Default::default() },
            ],
            ..Default::default()
        };
        assert_eq!(synthesize(&dup, &id(), &Catalog::default()), Err(ConfigError::DuplicatePort { name: "a".into() }));

        let unresolved = ClusterSpec {
            ports: vec![NamedPortSpec { name: "extend".into(), ..Default::default() }],
            ..Default::default()
        };
        assert_eq!(
            synthesize(&unresolved, &id(), &Catalog::default()),
            Err(ConfigError::UnresolvedPort { name: "extend".into() })
        );
    }
}
