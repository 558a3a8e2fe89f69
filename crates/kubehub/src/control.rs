use std::collections::BTreeMap;

use async_trait::async_trait;
use coh_core::DeploymentIdentity;
use coh_ops::{ControlError, ReplicaControl, ReplicaState};
use coh_probe::{ExecRunner, Member};
use coh_synth::workload_name;
use k8s_openapi::api::{apps::v1::StatefulSet, core::v1::Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::{
    api::{Api, AttachParams, ListParams, Patch, PatchParams},
    Client, ResourceExt,
};
use serde_json::json;
use tracing::debug;

/// Replica reads and writes through the StatefulSet and its scale subresource.
pub struct KubeReplicaControl {
    client: Client,
}

impl KubeReplicaControl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn statefulsets(&self, namespace: &str) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn control_error(what: String, e: kube::Error) -> ControlError {
    match e {
        kube::Error::Api(ae) if ae.code == 409 => ControlError::Conflict(what),
        kube::Error::Api(ae) if ae.code == 404 => ControlError::NotFound(what),
        other => ControlError::Transport(format!("{what}: {other}")),
    }
}

pub(crate) fn replica_state(sts: &StatefulSet) -> ReplicaState {
    let status = sts.status.as_ref();
    ReplicaState {
        spec_replicas: sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
        replicas: status.map(|s| s.replicas).unwrap_or(0),
        ready: status.and_then(|s| s.ready_replicas).unwrap_or(0),
    }
}

pub(crate) fn member(pod: &Pod) -> Member {
    let status = pod.status.as_ref();
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|c| c.iter().any(|c| c.type_ == "Ready" && c.status == "True"));
    let mut ports = BTreeMap::new();
    for container in pod.spec.iter().flat_map(|s| s.containers.iter()) {
        for p in container.ports.iter().flatten() {
            if let Some(name) = &p.name {
                ports.insert(name.clone(), p.container_port);
            }
        }
    }
    Member {
        name: pod.name_any(),
        namespace: pod.namespace().unwrap_or_default(),
        ip: status.and_then(|s| s.pod_ip.clone()),
        ready,
        ports,
    }
}

fn selector(sts: &StatefulSet) -> Option<String> {
    let labels = sts.spec.as_ref()?.selector.match_labels.as_ref()?;
    if labels.is_empty() {
        return None;
    }
    Some(labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(","))
}

#[async_trait]
impl ReplicaControl for KubeReplicaControl {
    async fn observe(&self, id: &DeploymentIdentity) -> Result<Option<ReplicaState>, ControlError> {
        let name = workload_name(id);
        let sts = self
            .statefulsets(&id.namespace)
            .get_opt(&name)
            .await
            .map_err(|e| control_error(format!("StatefulSet {id}"), e))?;
        Ok(sts.as_ref().map(replica_state))
    }

    async fn write_replicas(&self, id: &DeploymentIdentity, replicas: i32) -> Result<(), ControlError> {
        let name = workload_name(id);
        let patch = json!({ "spec": { "replicas": replicas } });
        self.statefulsets(&id.namespace)
            .patch_scale(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| control_error(format!("scale of {id}"), e))?;
        debug!(deployment = %id, replicas, "scale written");
        Ok(())
    }

    async fn members(&self, id: &DeploymentIdentity) -> Result<Vec<Member>, ControlError> {
        let name = workload_name(id);
        let sts = self
            .statefulsets(&id.namespace)
            .get_opt(&name)
            .await
            .map_err(|e| control_error(format!("StatefulSet {id}"), e))?;
        let Some(selector) = sts.as_ref().and_then(selector) else {
            return Ok(Vec::new());
        };
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &id.namespace);
        let list = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| control_error(format!("pods of {id}"), e))?;
        let mut out: Vec<Member> = list.items.iter().filter(|p| p.metadata.deletion_timestamp.is_none()).map(member).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

/// Exec probes run through the pod `exec` subresource.
pub struct KubeExec {
    client: Client,
}

impl KubeExec {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Exit code from the status the API server sends when an exec stream ends.
pub(crate) fn exit_code(status: &Status) -> i32 {
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| causes.iter().find(|c| c.reason.as_deref() == Some("ExitCode")))
        .and_then(|c| c.message.as_deref())
        .and_then(|m| m.trim().parse().ok())
        .unwrap_or(1)
}

#[async_trait]
impl ExecRunner for KubeExec {
    async fn exec(&self, member: &Member, container: &str, command: &[String]) -> Result<i32, String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &member.namespace);
        let params = AttachParams::default().container(container).stdin(false).stdout(false).stderr(true);
        let mut process = pods.exec(&member.name, command.to_vec(), &params).await.map_err(|e| e.to_string())?;
        let status = match process.take_status() {
            Some(fut) => fut.await,
            None => None,
        };
        process.join().await.map_err(|e| e.to_string())?;
        match status {
            Some(s) => Ok(exit_code(&s)),
            None => Err(format!("no exit status from {}", member.name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{StatefulSetSpec, StatefulSetStatus};
    use k8s_openapi::api::core::v1::{Container, ContainerPort, PodCondition, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, StatusCause, StatusDetails};

    #[test]
    fn replica_state_reads_spec_and_status() {
        let sts = StatefulSet {
            spec: Some(StatefulSetSpec { replicas: Some(5), ..Default::default() }),
            status: Some(StatefulSetStatus { replicas: 4, ready_replicas: Some(3), ..Default::default() }),
            ..Default::default()
        };
        assert_eq!(replica_state(&sts), ReplicaState { spec_replicas: 5, replicas: 4, ready: 3 });
    }

    #[test]
    fn pods_become_members() {
        let mut pod = Pod {
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "coherence".into(),
                    ports: Some(vec![ContainerPort { name: Some("health".into()), container_port: 6676, ..Default::default() }]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ip: Some("10.0.0.7".into()),
                conditions: Some(vec![PodCondition { type_: "Ready".into(), status: "True".into(), ..Default::default() }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        pod.metadata.name = Some("storage-0".into());
        pod.metadata.namespace = Some("ns".into());
        let m = member(&pod);
        assert!(m.ready);
        assert_eq!(m.ip.as_deref(), Some("10.0.0.7"));
        assert_eq!(m.ports.get("health"), Some(&6676));
    }

    #[test]
    fn selector_comes_from_match_labels() {
        let sts = StatefulSet {
            spec: Some(StatefulSetSpec {
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())])),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(selector(&sts).as_deref(), Some("a=1,b=2"));
    }

    #[test]
    fn exit_codes_from_exec_status() {
        assert_eq!(exit_code(&Status { status: Some("Success".into()), ..Default::default() }), 0);
        let failed = Status {
            status: Some("Failure".into()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause {
                    reason: Some("ExitCode".into()),
                    message: Some("3".into()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code(&failed), 3);
        assert_eq!(exit_code(&Status::default()), 1);
    }
}
