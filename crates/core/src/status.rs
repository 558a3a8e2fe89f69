use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::StartQuorumEdge;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum Phase {
    #[default]
    Initialized,
    Created,
    Waiting,
    Scaling,
    Blocked,
    Ready,
    Stopped,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum ScalingPhase {
    #[default]
    Idle,
    Planning,
    StepWait,
    StepApply,
    Settling,
    Done,
    Aborted,
}

/// What the operator last did for a deployment. Written for humans; never read back for decisions.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub applied_version: u64,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub scaling_phase: ScalingPhase,
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unmet_quorum: Vec<StartQuorumEdge>,
    #[serde(default)]
    pub quorum_observations: u32,
    #[serde(default)]
    pub quorum_stalled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusRecord {
    pub fn is_blocked(&self) -> bool {
        self.phase == Phase::Blocked || self.phase == Phase::Waiting
    }
}
