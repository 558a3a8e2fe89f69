use std::sync::Arc;

use async_trait::async_trait;
use coh_core::{DeploymentIdentity, StatusRecord};
use thiserror::Error;

use crate::StatusBoard;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("{0} is gone")]
    NotFound(DeploymentIdentity),
    #[error("status write failed: {0}")]
    Transport(String),
}

/// Where reconcile outcomes are reported. Never read back for decisions.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, id: &DeploymentIdentity, record: &StatusRecord) -> Result<(), PublishError>;

    /// The deployment is gone.
    async fn forget(&self, _id: &DeploymentIdentity) {}
}

#[async_trait]
impl StatusSink for StatusBoard {
    async fn publish(&self, id: &DeploymentIdentity, record: &StatusRecord) -> Result<(), PublishError> {
        StatusBoard::publish(self, id, record.clone());
        Ok(())
    }

    async fn forget(&self, id: &DeploymentIdentity) {
        self.remove(id);
    }
}

/// Publishes to every inner sink; the first error is returned after all were tried.
pub struct TeeSink(pub Vec<Arc<dyn StatusSink>>);

#[async_trait]
impl StatusSink for TeeSink {
    async fn publish(&self, id: &DeploymentIdentity, record: &StatusRecord) -> Result<(), PublishError> {
        let mut first = None;
        for sink in &self.0 {
            if let Err(e) = sink.publish(id, record).await {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    async fn forget(&self, id: &DeploymentIdentity) {
        for sink in &self.0 {
            sink.forget(id).await;
        }
    }
}
