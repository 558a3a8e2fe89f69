use std::collections::HashMap;

use coh_core::{DeploymentIdentity, StartQuorumEdge};
use serde::{Deserialize, Serialize};

use crate::ReplicaState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmetEdge {
    pub edge: StartQuorumEdge,
    pub target: DeploymentIdentity,
    pub ready: i32,
}

impl UnmetEdge {
    fn describe(&self) -> String {
        let required = self.edge.required_pods();
        if required <= 0 {
            format!("deployment '{}' to be ready", self.target.name)
        } else {
            format!("deployment '{}' to have {} ready Pods (ready={})", self.target.name, required, self.ready)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QuorumVerdict {
    pub ready: bool,
    pub unmet: Vec<UnmetEdge>,
}

impl QuorumVerdict {
    pub fn reason(&self) -> Option<String> {
        if self.unmet.is_empty() {
            return None;
        }
        let parts: Vec<String> = self.unmet.iter().map(UnmetEdge::describe).collect();
        Some(format!("Waiting for creation quorum to be met: \"{}\"", parts.join("\" and \"")))
    }
}

/// Check every edge against a snapshot of prerequisite replica counts. Never waits.
pub fn evaluate(
    own_namespace: &str,
    edges: &[StartQuorumEdge],
    counts: &HashMap<DeploymentIdentity, ReplicaState>,
) -> QuorumVerdict {
    let mut unmet = Vec::new();
    for edge in edges {
        let target = edge.target(own_namespace);
        let state = counts.get(&target);
        let ready = state.map(|s| s.ready).unwrap_or(0);
        let met = match (state, edge.required_pods()) {
            (None, _) => false,
            (Some(s), n) if n <= 0 => s.spec_replicas > 0 && s.ready >= s.spec_replicas,
            (Some(s), n) => s.ready >= n,
        };
        if !met {
            unmet.push(UnmetEdge { edge: edge.clone(), target, ready });
        }
    }
    QuorumVerdict { ready: unmet.is_empty(), unmet }
}
