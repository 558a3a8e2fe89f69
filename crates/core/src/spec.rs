//! The `Coherence` custom resource and the defaulting rules read off it.

use std::collections::BTreeMap;
use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Catalog, ConfigError, DeploymentIdentity, StatusRecord};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "coherence.oracle.com",
    version = "v1",
    kind = "Coherence",
    plural = "coherence",
    shortname = "coh",
    namespaced,
    status = "StatusRecord",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Desired member count; unset means the catalog default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Cluster name shared by several deployments; defaults to the deployment name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_from_wka: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wka: Option<WkaSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SubsystemSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub management: Option<SubsystemSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<ScalingSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend_probe: Option<ProbeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend_services_on_shutdown: Option<bool>,
    /// Require StatusHA before rolling a workload update; unset means true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ha_before_update: Option<bool>,
    /// Services whose endangered status does not block scaling down.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_endangered_for_status_ha: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<NamedPortSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub start_quorum: Vec<StartQuorumEdge>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ScalingPolicy {
    Safe,
    Parallel,
    ParallelUpSafeDown,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScalingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<ScalingPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeSpec>,
}

/// Points a deployment at another deployment's WKA service instead of its own.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WkaSpec {
    pub deployment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubsystemSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceSpec {
    /// `on-demand` or `active`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Per-member claim template for active persistence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<PvcSpec>,
    /// Standalone claim shared by all members for snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<PvcSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvcSpec {
    pub storage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamedPortSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<PortServiceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_monitor: Option<ServiceMonitorSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortServiceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMonitorSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

/// This deployment may not start until `deployment` has `pod_count` ready members.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartQuorumEdge {
    pub deployment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Zero or negative means every replica of the prerequisite must be ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_count: Option<i32>,
}

impl StartQuorumEdge {
    pub fn target(&self, own_namespace: &str) -> DeploymentIdentity {
        let ns = self.namespace.as_deref().filter(|s| !s.is_empty()).unwrap_or(own_namespace);
        DeploymentIdentity::new(ns, self.deployment.clone())
    }

    pub fn required_pods(&self) -> i32 {
        self.pod_count.unwrap_or(0)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProbeSpec {
    #[serde(flatten)]
    pub handler: ProbeHandler,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i32>,
}

impl ProbeSpec {
    /// Unset or non-positive timeouts fall back to one second.
    pub fn timeout(&self) -> Duration {
        match self.timeout_seconds {
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            _ => Duration::from_secs(1),
        }
    }
}

/// Exactly one probe transport.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ProbeHandler {
    HttpGet(HttpGetAction),
    TcpSocket(TcpSocketAction),
    Exec(ExecAction),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpGetAction {
    #[serde(default)]
    pub path: String,
    pub port: PortRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TcpSocketAction {
    pub port: PortRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ExecAction {
    pub command: Vec<String>,
}

/// A probe port given as a number or as a container port name.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(untagged)]
pub enum PortRef {
    Number(i32),
    Name(String),
}

impl ClusterSpec {
    pub fn replicas(&self, catalog: &Catalog) -> i32 {
        self.replicas.unwrap_or(catalog.default_replicas)
    }

    pub fn storage_enabled(&self) -> bool {
        self.storage_enabled.unwrap_or(true)
    }

    pub fn effective_scaling_policy(&self) -> ScalingPolicy {
        match self.scaling.as_ref().and_then(|s| s.policy) {
            Some(p) => p,
            None if self.storage_enabled() => ScalingPolicy::Safe,
            None => ScalingPolicy::Parallel,
        }
    }

    pub fn scaling_probe(&self, catalog: &Catalog) -> ProbeSpec {
        match self.scaling.as_ref().and_then(|s| s.probe.clone()) {
            Some(p) => p,
            None => health_probe(catalog, &catalog.status_ha_path, catalog.scaling_probe_timeout_secs),
        }
    }

    pub fn suspend_probe(&self, catalog: &Catalog) -> ProbeSpec {
        self.suspend_probe
            .clone()
            .unwrap_or_else(|| health_probe(catalog, &catalog.suspend_path, catalog.suspend_probe_timeout_secs))
    }

    pub fn suspend_services_on_shutdown(&self) -> bool {
        self.suspend_services_on_shutdown.unwrap_or(true)
    }

    pub fn ha_before_update(&self) -> bool {
        self.ha_before_update.unwrap_or(true)
    }

    pub fn cluster_name<'a>(&'a self, id: &'a DeploymentIdentity) -> &'a str {
        self.cluster.as_deref().filter(|s| !s.is_empty()).unwrap_or(&id.name)
    }

    pub fn role_name<'a>(&'a self, id: &'a DeploymentIdentity) -> &'a str {
        self.role.as_deref().filter(|s| !s.is_empty()).unwrap_or(&id.name)
    }

    pub fn image<'a>(&'a self, catalog: &'a Catalog) -> &'a str {
        self.image.as_deref().unwrap_or(&catalog.default_image)
    }

    fn external_wka(&self) -> Option<&WkaSpec> {
        self.wka.as_ref().filter(|w| !w.deployment.is_empty())
    }

    /// Members advertise themselves for discovery unless excluded or using another deployment's WKA.
    pub fn is_wka_member(&self) -> bool {
        !self.exclude_from_wka.unwrap_or(false) && self.external_wka().is_none()
    }

    pub fn requires_wka_service(&self) -> bool {
        self.external_wka().is_none()
    }

    /// Name of the WKA service members use to find peers: own or external.
    pub fn wka_address(&self, id: &DeploymentIdentity, catalog: &Catalog) -> String {
        match self.external_wka() {
            Some(w) => {
                let ns = w.namespace.as_deref().unwrap_or(&id.namespace);
                format!("{}{}.{}.svc", w.deployment, catalog.wka_suffix, ns)
            }
            None => format!("{}{}.{}.svc", id.name, catalog.wka_suffix, id.namespace),
        }
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics.as_ref().and_then(|m| m.enabled).unwrap_or(false)
    }

    pub fn management_enabled(&self) -> bool {
        self.management.as_ref().and_then(|m| m.enabled).unwrap_or(false)
    }

    pub fn metrics_port(&self, catalog: &Catalog) -> i32 {
        self.metrics.as_ref().and_then(|m| m.port).unwrap_or(catalog.metrics_port)
    }

    pub fn management_port(&self, catalog: &Catalog) -> i32 {
        self.management.as_ref().and_then(|m| m.port).unwrap_or(catalog.management_port)
    }

    pub fn health_port(&self, catalog: &Catalog) -> i32 {
        match self.health_port {
            Some(p) if p > 0 => p,
            _ => catalog.health_port,
        }
    }
}

fn health_probe(catalog: &Catalog, path: &str, timeout_secs: i32) -> ProbeSpec {
    ProbeSpec {
        handler: ProbeHandler::HttpGet(HttpGetAction {
            path: path.to_string(),
            port: PortRef::Name(catalog.port_name_health.clone()),
            host: None,
            scheme: None,
            headers: BTreeMap::new(),
        }),
        timeout_seconds: Some(timeout_secs),
    }
}

impl NamedPortSpec {
    /// Container port: explicit wins, then the metrics/management well-known ports.
    pub fn resolve_port(&self, spec: &ClusterSpec, catalog: &Catalog) -> Result<i32, ConfigError> {
        if let Some(p) = self.port.filter(|p| *p > 0) {
            return Ok(p);
        }
        let lower = self.name.to_ascii_lowercase();
        if lower == catalog.port_name_metrics {
            Ok(spec.metrics_port(catalog))
        } else if lower == catalog.port_name_management {
            Ok(spec.management_port(catalog))
        } else {
            Err(ConfigError::UnresolvedPort { name: self.name.clone() })
        }
    }

    /// Port exposed by the Service; a service-level override wins.
    pub fn service_port(&self, spec: &ClusterSpec, catalog: &Catalog) -> Result<i32, ConfigError> {
        match self.service.as_ref().and_then(|s| s.port) {
            Some(p) => Ok(p),
            None => self.resolve_port(spec, catalog),
        }
    }

    pub fn service_enabled(&self) -> bool {
        self.service.as_ref().and_then(|s| s.enabled).unwrap_or(true)
    }

    pub fn service_monitor_enabled(&self) -> bool {
        self.service_enabled() && self.service_monitor.as_ref().and_then(|m| m.enabled).unwrap_or(false)
    }

    pub fn service_name(&self, id: &DeploymentIdentity) -> String {
        match self.service.as_ref().and_then(|s| s.name.clone()) {
            Some(n) => n,
            None => format!("{}-{}", id.name, self.name),
        }
    }

    pub fn protocol(&self) -> &str {
        self.protocol.as_deref().unwrap_or("TCP")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, port: Option<i32>) -> NamedPortSpec {
        NamedPortSpec { name: name.to_string(), port, ..Default::default() }
    }

    #[test]
    fn metrics_port_resolves_even_when_subsystem_disabled() {
        let cat = Catalog::default();
        let spec = ClusterSpec { metrics: Some(SubsystemSpec { enabled: Some(false), port: None }), ..Default::default() };
        assert_eq!(port("metrics", None).resolve_port(&spec, &cat), Ok(9612));
        assert_eq!(port("Management", None).resolve_port(&spec, &cat), Ok(30000));
        assert_eq!(port("metrics", Some(1234)).resolve_port(&spec, &cat), Ok(1234));
        assert_eq!(
            port("extend", None).resolve_port(&spec, &cat),
            Err(ConfigError::UnresolvedPort { name: "extend".into() })
        );
    }

    #[test]
    fn service_port_prefers_override() {
        let cat = Catalog::default();
        let spec = ClusterSpec { metrics: Some(SubsystemSpec { enabled: None, port: Some(9000) }), ..Default::default() };
        let mut p = port("metrics", None);
        assert_eq!(p.service_port(&spec, &cat), Ok(9000));
        p.service = Some(PortServiceSpec { port: Some(80), ..Default::default() });
        assert_eq!(p.service_port(&spec, &cat), Ok(80));
        assert_eq!(p.resolve_port(&spec, &cat), Ok(9000));
    }

    #[test]
    fn policy_defaults_follow_storage_flag() {
        let mut spec = ClusterSpec::default();
        assert_eq!(spec.effective_scaling_policy(), ScalingPolicy::Safe);
        spec.storage_enabled = Some(false);
        assert_eq!(spec.effective_scaling_policy(), ScalingPolicy::Parallel);
        spec.scaling = Some(ScalingSpec { policy: Some(ScalingPolicy::ParallelUpSafeDown), probe: None });
        assert_eq!(spec.effective_scaling_policy(), ScalingPolicy::ParallelUpSafeDown);
    }

    #[test]
    fn default_probes_target_health_port() {
        let cat = Catalog::default();
        let spec = ClusterSpec::default();
        let p = spec.scaling_probe(&cat);
        assert_eq!(p.timeout(), Duration::from_secs(10));
        match p.handler {
            ProbeHandler::HttpGet(h) => {
                assert_eq!(h.path, "/ha");
                assert_eq!(h.port, PortRef::Name("health".into()));
            }
            other => panic!("unexpected handler {other:?}"),
        }
        assert_eq!(spec.suspend_probe(&cat).timeout(), Duration::from_secs(60));
    }

    #[test]
    fn probe_timeout_floor_is_one_second() {
        let mut p = ClusterSpec::default().scaling_probe(&Catalog::default());
        p.timeout_seconds = Some(0);
        assert_eq!(p.timeout(), Duration::from_secs(1));
        p.timeout_seconds = None;
        assert_eq!(p.timeout(), Duration::from_secs(1));
    }

    #[test]
    fn wka_membership_rules() {
        let mut spec = ClusterSpec::default();
        assert!(spec.is_wka_member() && spec.requires_wka_service());
        spec.exclude_from_wka = Some(true);
        assert!(!spec.is_wka_member());
        assert!(spec.requires_wka_service());
        spec.exclude_from_wka = None;
        spec.wka = Some(WkaSpec { deployment: "storage".into(), namespace: Some("data".into()) });
        assert!(!spec.is_wka_member() && !spec.requires_wka_service());
        let id = DeploymentIdentity::new("ns", "web");
        assert_eq!(spec.wka_address(&id, &Catalog::default()), "storage-wka.data.svc");
    }

    #[test]
    fn spec_parses_from_yaml() {
        let yaml = r#"
replicas: 5
scaling:
  policy: Safe
  probe:
    tcpSocket:
      port: 7000
    timeoutSeconds: 3
ports:
  - name: metrics
    serviceMonitor:
      enabled: true
startQuorum:
  - deployment: storage
    podCount: 2
"#;
        let spec: ClusterSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.replicas(&Catalog::default()), 5);
        let probe = spec.scaling_probe(&Catalog::default());
        assert_eq!(probe.handler, ProbeHandler::TcpSocket(TcpSocketAction { port: PortRef::Number(7000), host: None }));
        assert_eq!(probe.timeout(), Duration::from_secs(3));
        assert!(spec.ports[0].service_monitor_enabled());
        assert_eq!(spec.start_quorum[0].target("ns"), DeploymentIdentity::new("ns", "storage"));
    }

    #[test]
    fn ha_before_update_defaults_on() {
        assert!(ClusterSpec::default().ha_before_update());
        let spec: ClusterSpec = serde_yaml::from_str("haBeforeUpdate: false\n").unwrap();
        assert!(!spec.ha_before_update());
    }
}
