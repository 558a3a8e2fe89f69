use thiserror::Error;

use crate::ResourceRef;

/// The cluster spec cannot be turned into resources. Terminal for the generation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("port '{name}' has no port number and is not a well-known port")]
    UnresolvedPort { name: String },
    #[error("port name '{name}' is declared more than once")]
    DuplicatePort { name: String },
    #[error("invalid persistence settings: {0}")]
    Persistence(String),
    #[error("resource set invariant: {0}")]
    Invariant(#[from] InvariantError),
}

/// Internal invariant violations. A cycle that hits one must not apply anything.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantError {
    #[error("duplicate resource {0} in one resource set")]
    DuplicateRef(ResourceRef),
    #[error("resource {0} payload kind does not match its reference")]
    KindMismatch(ResourceRef),
}
