//! StatusHA probing: is it safe to remove a member right now?

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use coh_core::ProbeSpec;
use serde::{Deserialize, Serialize};

mod transport;

pub use transport::{ExecRunner, StatusHaProber};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthVerdict {
    Safe,
    Unsafe { endangered: Vec<String> },
    Unknown(String),
}

impl HealthVerdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, HealthVerdict::Safe)
    }
}

impl fmt::Display for HealthVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthVerdict::Safe => f.write_str("safe"),
            HealthVerdict::Unsafe { endangered } if endangered.is_empty() => f.write_str("StatusHA check failed"),
            HealthVerdict::Unsafe { endangered } => write!(f, "service {} endangered", endangered.join(", ")),
            HealthVerdict::Unknown(reason) => write!(f, "StatusHA unknown: {reason}"),
        }
    }
}

/// One running pod of a deployment, as seen at probe time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub namespace: String,
    pub ip: Option<String>,
    pub ready: bool,
    /// Container port numbers by name, for named probe ports.
    pub ports: BTreeMap<String, i32>,
}

#[async_trait]
pub trait Prober: Send + Sync {
    /// Never fails: transport problems come back as `Unknown`.
    async fn probe(&self, member: &Member, probe: &ProbeSpec) -> HealthVerdict;
}

/// Apply the allow-list: Unsafe is tolerated only when it names services and every one is allowed.
pub fn tolerate(verdict: HealthVerdict, allow: &[String]) -> HealthVerdict {
    match verdict {
        HealthVerdict::Unsafe { endangered }
            if !endangered.is_empty() && endangered.iter().all(|s| allow.iter().any(|a| a == s)) =>
        {
            HealthVerdict::Safe
        }
        other => other,
    }
}

/// Probe every member; all must be ready and their count must equal `replicas`.
pub async fn probe_members(
    prober: &dyn Prober,
    members: &[Member],
    replicas: i32,
    probe: &ProbeSpec,
    allow: &[String],
) -> HealthVerdict {
    if members.len() as i32 != replicas {
        return HealthVerdict::Unknown(format!("expected {replicas} members, found {}", members.len()));
    }
    if let Some(m) = members.iter().find(|m| !m.ready) {
        return HealthVerdict::Unknown(format!("member {} is not ready", m.name));
    }

    let verdicts = futures::future::join_all(members.iter().map(|m| prober.probe(m, probe))).await;

    let mut endangered: Vec<String> = Vec::new();
    let mut unsafe_seen = false;
    for (member, verdict) in members.iter().zip(verdicts) {
        match tolerate(verdict, allow) {
            HealthVerdict::Safe => {}
            HealthVerdict::Unknown(reason) => {
                return HealthVerdict::Unknown(format!("{}: {reason}", member.name));
            }
            HealthVerdict::Unsafe { endangered: list } => {
                unsafe_seen = true;
                for s in list {
                    if !endangered.contains(&s) {
                        endangered.push(s);
                    }
                }
            }
        }
    }
    if unsafe_seen {
        HealthVerdict::Unsafe { endangered }
    } else {
        HealthVerdict::Safe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coh_core::{Catalog, ClusterSpec};
    use std::sync::Mutex;

    struct Scripted(Mutex<BTreeMap<String, HealthVerdict>>);

    #[async_trait]
    impl Prober for Scripted {
        async fn probe(&self, member: &Member, _probe: &ProbeSpec) -> HealthVerdict {
            self.0.lock().unwrap().get(&member.name).cloned().unwrap_or(HealthVerdict::Safe)
        }
    }

    fn members(n: usize) -> Vec<Member> {
        (0..n).map(|i| Member { name: format!("p-{i}"), ready: true, ..Default::default() }).collect()
    }

    fn unsafe_(s: &[&str]) -> HealthVerdict {
        HealthVerdict::Unsafe { endangered: s.iter().map(|x| x.to_string()).collect() }
    }

    #[test]
    fn tolerance_requires_every_service_allowed() {
        let allow = vec!["cache-a".to_string()];
        assert_eq!(tolerate(unsafe_(&["cache-a"]), &allow), HealthVerdict::Safe);
        assert_eq!(tolerate(unsafe_(&["cache-a", "cache-b"]), &allow), unsafe_(&["cache-a", "cache-b"]));
        assert_eq!(tolerate(unsafe_(&[]), &allow), unsafe_(&[]));
        let unknown = HealthVerdict::Unknown("x".into());
        assert_eq!(tolerate(unknown.clone(), &allow), unknown);
    }

    #[tokio::test]
    async fn member_count_and_readiness_gate_the_probe() {
        let prober = Scripted(Mutex::new(BTreeMap::new()));
        let probe = ClusterSpec::default().scaling_probe(&Catalog::default());
        assert!(matches!(probe_members(&prober, &members(2), 3, &probe, &[]).await, HealthVerdict::Unknown(_)));
        let mut ms = members(3);
        ms[1].ready = false;
        assert!(matches!(probe_members(&prober, &ms, 3, &probe, &[]).await, HealthVerdict::Unknown(_)));
        assert_eq!(probe_members(&prober, &members(3), 3, &probe, &[]).await, HealthVerdict::Safe);
    }

    #[tokio::test]
    async fn unsafe_verdicts_merge_and_unknown_wins() {
        let script = BTreeMap::from([("p-0".to_string(), unsafe_(&["a"])), ("p-2".to_string(), unsafe_(&["b", "a"]))]);
        let prober = Scripted(Mutex::new(script));
        let probe = ClusterSpec::default().scaling_probe(&Catalog::default());
        assert_eq!(probe_members(&prober, &members(3), 3, &probe, &[]).await, unsafe_(&["a", "b"]));
        assert_eq!(probe_members(&prober, &members(3), 3, &probe, &["a".into(), "b".into()]).await, HealthVerdict::Safe);

        prober.0.lock().unwrap().insert("p-1".into(), HealthVerdict::Unknown("timeout".into()));
        assert!(matches!(probe_members(&prober, &members(3), 3, &probe, &[]).await, HealthVerdict::Unknown(_)));
    }

    #[test]
    fn verdict_renders_reason_text() {
        assert_eq!(unsafe_(&["PartitionedCache"]).to_string(), "service PartitionedCache endangered");
    }
}
