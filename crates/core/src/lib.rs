//! Coherence operator core types: cluster spec, resource sets and status.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod catalog;
pub mod error;
pub mod resource;
pub mod spec;
pub mod status;

pub use catalog::Catalog;
pub use error::{ConfigError, InvariantError};
pub use resource::{content_hash, Resource, ResourceKind, ResourcePayload, ResourceRef, ResourceSet};
pub use spec::{
    ClusterSpec, Coherence, ExecAction, HttpGetAction, NamedPortSpec, PersistenceSpec, PortRef,
    PortServiceSpec, ProbeHandler, ProbeSpec, PvcSpec, ScalingPolicy, ScalingSpec, ServiceMonitorSpec,
    StartQuorumEdge, SubsystemSpec, TcpSocketAction, WkaSpec,
};
pub use status::{Phase, ScalingPhase, StatusRecord};

pub mod prelude {
    pub use super::{
        Catalog, ClusterSpec, DeploymentIdentity, Resource, ResourceKind, ResourcePayload, ResourceRef,
        ResourceSet, ScalingPolicy, StartQuorumEdge, StatusRecord,
    };
}

/// Namespace + name of one Coherence deployment. Reconciles are serialized per identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentIdentity {
    pub namespace: String,
    pub name: String,
}

impl DeploymentIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Parse `ns/name`; a bare `name` lands in `default_ns`.
    pub fn parse(key: &str, default_ns: &str) -> Option<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Some(Self::new(default_ns, *name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Some(Self::new(*ns, *name)),
            _ => None,
        }
    }
}

impl fmt::Display for DeploymentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_parses_qualified_and_bare_keys() {
        assert_eq!(DeploymentIdentity::parse("ns/a", "x"), Some(DeploymentIdentity::new("ns", "a")));
        assert_eq!(DeploymentIdentity::parse("a", "x"), Some(DeploymentIdentity::new("x", "a")));
        assert!(DeploymentIdentity::parse("", "x").is_none());
        assert!(DeploymentIdentity::parse("a/b/c", "x").is_none());
        assert_eq!(DeploymentIdentity::new("ns", "a").to_string(), "ns/a");
    }
}
