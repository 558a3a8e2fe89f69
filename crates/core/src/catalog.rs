//! Immutable table of defaults (ports, labels, names) injected into synthesis.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelKeys {
    pub deployment: String,
    pub cluster: String,
    pub role: String,
    pub component: String,
    pub wka_member: String,
    pub port: String,
    pub hash: String,
}

/// Values of the component label, one per generated object role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Components {
    pub pod: String,
    pub statefulset: String,
    pub headless: String,
    pub wka: String,
    pub port_service: String,
    pub service_monitor: String,
    pub volume: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvNames {
    pub cluster_name: String,
    pub role: String,
    pub wka: String,
    pub storage_enabled: String,
    pub health_port: String,
    pub allow_endangered: String,
    pub metrics_enabled: String,
    pub metrics_port: String,
    pub management_enabled: String,
    pub management_port: String,
    pub persistence_mode: String,
}

/// Fields missing from a serialized catalog keep their built-in values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Catalog {
    pub default_replicas: i32,
    pub default_image: String,
    pub container_name: String,
    pub coherence_port: i32,
    pub health_port: i32,
    pub metrics_port: i32,
    pub management_port: i32,
    pub port_name_coherence: String,
    pub port_name_health: String,
    pub port_name_metrics: String,
    pub port_name_management: String,
    pub wka_suffix: String,
    pub headless_suffix: String,
    pub snapshot_suffix: String,
    pub status_ha_path: String,
    pub suspend_path: String,
    pub scaling_probe_timeout_secs: i32,
    pub suspend_probe_timeout_secs: i32,
    pub revision_history_limit: i32,
    pub readiness_path: String,
    pub liveness_path: String,
    pub persistence_mount: String,
    pub snapshot_mount: String,
    pub labels: LabelKeys,
    pub components: Components,
    pub env: EnvNames,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            default_replicas: 3,
            default_image: "ghcr.io/oracle/coherence-ce:22.06".to_string(),
            container_name: "coherence".to_string(),
            coherence_port: 7,
            health_port: 6676,
            metrics_port: 9612,
            management_port: 30000,
            port_name_coherence: "coherence".to_string(),
            port_name_health: "health".to_string(),
            port_name_metrics: "metrics".to_string(),
            port_name_management: "management".to_string(),
            wka_suffix: "-wka".to_string(),
            headless_suffix: "-sts".to_string(),
            snapshot_suffix: "-snapshots".to_string(),
            status_ha_path: "/ha".to_string(),
            suspend_path: "/suspend".to_string(),
            scaling_probe_timeout_secs: 10,
            suspend_probe_timeout_secs: 60,
            revision_history_limit: 5,
            readiness_path: "/ready".to_string(),
            liveness_path: "/healthz".to_string(),
            persistence_mount: "/coherence-operator/persistence".to_string(),
            snapshot_mount: "/coherence-operator/snapshot".to_string(),
            labels: LabelKeys {
                deployment: "coherenceDeployment".to_string(),
                cluster: "coherenceCluster".to_string(),
                role: "coherenceRole".to_string(),
                component: "coherenceComponent".to_string(),
                wka_member: "coherenceWKAMember".to_string(),
                port: "coherencePort".to_string(),
                hash: "coherence-hash".to_string(),
            },
            components: Components {
                pod: "coherencePod".to_string(),
                statefulset: "coherence".to_string(),
                headless: "coherence-headless".to_string(),
                wka: "coherenceWkaService".to_string(),
                port_service: "coherence-service".to_string(),
                service_monitor: "coherence-service-monitor".to_string(),
                volume: "coherence-volume".to_string(),
            },
            env: EnvNames {
                cluster_name: "COH_CLUSTER_NAME".to_string(),
                role: "COH_ROLE".to_string(),
                wka: "COH_WKA".to_string(),
                storage_enabled: "COH_STORAGE_ENABLED".to_string(),
                health_port: "COH_HEALTH_PORT".to_string(),
                allow_endangered: "COH_ALLOW_ENDANGERED".to_string(),
                metrics_enabled: "COH_METRICS_ENABLED".to_string(),
                metrics_port: "COH_METRICS_PORT".to_string(),
                management_enabled: "COH_MGMT_ENABLED".to_string(),
                management_port: "COH_MGMT_PORT".to_string(),
                persistence_mode: "COH_PERSISTENCE_MODE".to_string(),
            },
        }
    }
}
