use std::collections::BTreeMap;

use coh_core::prelude::*;
use coh_core::{ConfigError, DeploymentIdentity};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, Probe, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::{claim_spec, common_labels, pod_selector};

const PERSISTENCE_VOLUME: &str = "persistence-volume";
const SNAPSHOT_VOLUME: &str = "snapshot-volume";

pub fn workload_name(id: &DeploymentIdentity) -> String {
    id.name.clone()
}

pub(crate) fn statefulset(spec: &ClusterSpec, id: &DeploymentIdentity, catalog: &Catalog) -> Result<StatefulSet, ConfigError> {
    let mut labels = common_labels(spec, id, catalog);
    labels.insert(catalog.labels.component.clone(), catalog.components.statefulset.clone());

    let mut pod_labels = pod_selector(spec, id, catalog);
    pod_labels.insert(catalog.labels.wka_member.clone(), spec.is_wka_member().to_string());
    pod_labels.extend(spec.labels.clone());

    let mut container = coherence_container(spec, id, catalog)?;
    let mut volumes = Vec::new();
    let mut claim_templates = Vec::new();

    let persistence = spec.persistence.clone().unwrap_or_default();
    if let Some(vol) = &persistence.volume {
        claim_templates.push(PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(PERSISTENCE_VOLUME.to_string()),
                labels: Some(BTreeMap::from([(
                    catalog.labels.component.clone(),
                    catalog.components.volume.clone(),
                )])),
                ..ObjectMeta::default()
            },
            spec: Some(claim_spec(vol)?),
            ..PersistentVolumeClaim::default()
        });
        push_mount(&mut container, PERSISTENCE_VOLUME, &catalog.persistence_mount);
    }
    if persistence.snapshots.is_some() {
        volumes.push(Volume {
            name: SNAPSHOT_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: format!("{}{}", id.name, catalog.snapshot_suffix),
                read_only: None,
            }),
            ..Volume::default()
        });
        push_mount(&mut container, SNAPSHOT_VOLUME, &catalog.snapshot_mount);
    }

    Ok(StatefulSet {
        metadata: ObjectMeta {
            name: Some(workload_name(id)),
            namespace: Some(id.namespace.clone()),
            labels: Some(labels),
            annotations: (!spec.annotations.is_empty()).then(|| spec.annotations.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(spec.replicas(catalog)),
            pod_management_policy: Some("Parallel".to_string()),
            update_strategy: Some(StatefulSetUpdateStrategy { type_: Some("RollingUpdate".to_string()), rolling_update: None }),
            revision_history_limit: Some(catalog.revision_history_limit),
            service_name: format!("{}{}", id.name, catalog.headless_suffix),
            selector: LabelSelector { match_labels: Some(pod_selector(spec, id, catalog)), ..LabelSelector::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: (!spec.annotations.is_empty()).then(|| spec.annotations.clone()),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: (!volumes.is_empty()).then_some(volumes),
                    ..PodSpec::default()
                }),
            },
            volume_claim_templates: (!claim_templates.is_empty()).then_some(claim_templates),
            ..StatefulSetSpec::default()
        }),
        ..StatefulSet::default()
    })
}

fn push_mount(container: &mut Container, name: &str, path: &str) {
    container.volume_mounts.get_or_insert_with(Vec::new).push(VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..VolumeMount::default()
    });
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar { name: name.to_string(), value: Some(value.into()), value_from: None }
}

fn http_probe(path: &str, port: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            scheme: Some("HTTP".to_string()),
            ..HTTPGetAction::default()
        }),
        initial_delay_seconds: Some(30),
        period_seconds: Some(60),
        timeout_seconds: Some(30),
        success_threshold: Some(1),
        failure_threshold: Some(50),
        ..Probe::default()
    }
}

fn coherence_container(spec: &ClusterSpec, id: &DeploymentIdentity, catalog: &Catalog) -> Result<Container, ConfigError> {
    let health = spec.health_port(catalog);
    let names = &catalog.env;

    let mut envs = vec![
        env(&names.cluster_name, spec.cluster_name(id)),
        env(&names.role, spec.role_name(id)),
        env(&names.wka, spec.wka_address(id, catalog)),
        env(&names.storage_enabled, spec.storage_enabled().to_string()),
        env(&names.health_port, health.to_string()),
        env(&names.metrics_enabled, spec.metrics_enabled().to_string()),
        env(&names.metrics_port, spec.metrics_port(catalog).to_string()),
        env(&names.management_enabled, spec.management_enabled().to_string()),
        env(&names.management_port, spec.management_port(catalog).to_string()),
    ];
    if !spec.allow_endangered_for_status_ha.is_empty() {
        envs.push(env(&names.allow_endangered, spec.allow_endangered_for_status_ha.join(",")));
    }
    if let Some(mode) = spec.persistence.as_ref().and_then(|p| p.mode.clone()) {
        envs.push(env(&names.persistence_mode, mode));
    }

    let mut ports = vec![
        ContainerPort {
            name: Some(catalog.port_name_coherence.clone()),
            container_port: catalog.coherence_port,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        },
        ContainerPort {
            name: Some(catalog.port_name_health.clone()),
            container_port: health,
            protocol: Some("TCP".to_string()),
            ..ContainerPort::default()
        },
    ];
    for p in &spec.ports {
        ports.push(ContainerPort {
            name: Some(p.name.clone()),
            container_port: p.resolve_port(spec, catalog)?,
            protocol: Some(p.protocol().to_string()),
            ..ContainerPort::default()
        });
    }

    Ok(Container {
        name: catalog.container_name.clone(),
        image: Some(spec.image(catalog).to_string()),
        env: Some(envs),
        ports: Some(ports),
        readiness_probe: Some(http_probe(&catalog.readiness_path, health)),
        liveness_probe: Some(http_probe(&catalog.liveness_path, health)),
        ..Container::default()
    })
}
