//! Last-applied resource sets, one per deployment, written with optimistic concurrency.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use coh_core::{DeploymentIdentity, ResourceSet};
use metrics::{counter, histogram};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("stale write: expected version {expected}, store has {found}")]
    Conflict { expected: u64, found: u64 },
    #[error("store backend: {0}")]
    Backend(String),
    #[error("stored resource set is unreadable: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Corrupt(_))
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Latest recorded set, if any.
    async fn load(&self, id: &DeploymentIdentity) -> Result<Option<ResourceSet>, StoreError>;

    /// Record `set` as last applied if the stored version still equals `expected_version`
    /// (0 when nothing is stored). Returns the new version.
    async fn record(&self, id: &DeploymentIdentity, set: &ResourceSet, expected_version: u64) -> Result<u64, StoreError>;

    async fn destroy(&self, id: &DeploymentIdentity) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    sets: Mutex<HashMap<DeploymentIdentity, ResourceSet>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self, id: &DeploymentIdentity) -> Result<Option<ResourceSet>, StoreError> {
        let g = self.sets.lock().map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(g.get(id).cloned())
    }

    async fn record(&self, id: &DeploymentIdentity, set: &ResourceSet, expected_version: u64) -> Result<u64, StoreError> {
        let mut g = self.sets.lock().map_err(|e| StoreError::Backend(e.to_string()))?;
        let found = g.get(id).map(|s| s.version).unwrap_or(0);
        if found != expected_version {
            counter!("persist_conflict_total", 1u64);
            return Err(StoreError::Conflict { expected: expected_version, found });
        }
        let version = found + 1;
        g.insert(id.clone(), set.clone().with_version(version));
        Ok(version)
    }

    async fn destroy(&self, id: &DeploymentIdentity) -> Result<(), StoreError> {
        let mut g = self.sets.lock().map_err(|e| StoreError::Backend(e.to_string()))?;
        g.remove(id);
        Ok(())
    }
}

/// SQLite-backed store keeping the three newest versions per deployment.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).map_err(|e| StoreError::Backend(format!("opening sqlite db at {path}: {e}")))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS resource_sets (
                ns      TEXT NOT NULL,
                name    TEXT NOT NULL,
                version INTEGER NOT NULL,
                ts      INTEGER NOT NULL,
                body    BLOB NOT NULL,
                PRIMARY KEY (ns, name, version)
            )",
            [],
        )
        .map_err(backend)?;
        let me = Self { db: Mutex::new(db) };
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(me)
    }

    /// Up to `limit` versions for a deployment, newest first.
    pub fn history(&self, id: &DeploymentIdentity, limit: usize) -> Result<Vec<ResourceSet>, StoreError> {
        let db = self.db.lock().map_err(backend)?;
        let mut stmt = db
            .prepare("SELECT body FROM resource_sets WHERE ns = ?1 AND name = ?2 ORDER BY version DESC LIMIT ?3")
            .map_err(backend)?;
        let mut rows = stmt.query((&id.namespace, &id.name, limit as i64)).map_err(backend)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(backend)? {
            let body: Vec<u8> = row.get(0).map_err(backend)?;
            out.push(decode(&body)?);
        }
        Ok(out)
    }
}

fn decode(body: &[u8]) -> Result<ResourceSet, StoreError> {
    serde_json::from_slice(&maybe_decompress(body)).map_err(|e| StoreError::Corrupt(e.to_string()))
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn load(&self, id: &DeploymentIdentity) -> Result<Option<ResourceSet>, StoreError> {
        let started = std::time::Instant::now();
        let latest = self.history(id, 1)?.into_iter().next();
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(latest)
    }

    async fn record(&self, id: &DeploymentIdentity, set: &ResourceSet, expected_version: u64) -> Result<u64, StoreError> {
        let started = std::time::Instant::now();
        let mut db = self.db.lock().map_err(backend)?;
        let tx = db.transaction().map_err(backend)?;
        let found: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM resource_sets WHERE ns = ?1 AND name = ?2",
                (&id.namespace, &id.name),
                |r| r.get(0),
            )
            .map_err(backend)?;
        if found as u64 != expected_version {
            counter!("persist_conflict_total", 1u64);
            return Err(StoreError::Conflict { expected: expected_version, found: found as u64 });
        }
        let version = expected_version + 1;
        let body = serde_json::to_vec(&set.clone().with_version(version)).map_err(backend)?;
        tx.execute(
            "INSERT INTO resource_sets(ns, name, version, ts, body) VALUES (?1, ?2, ?3, ?4, ?5)",
            (&id.namespace, &id.name, version as i64, now_ts(), maybe_compress(&body)),
        )
        .map_err(backend)?;
        tx.execute(
            "DELETE FROM resource_sets
             WHERE ns = ?1 AND name = ?2
               AND version NOT IN (
                   SELECT version FROM resource_sets WHERE ns = ?1 AND name = ?2 ORDER BY version DESC LIMIT 3
               )",
            (&id.namespace, &id.name),
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        debug!(deployment = %id, version, "recorded resource set");
        Ok(version)
    }

    async fn destroy(&self, id: &DeploymentIdentity) -> Result<(), StoreError> {
        let db = self.db.lock().map_err(backend)?;
        db.execute("DELETE FROM resource_sets WHERE ns = ?1 AND name = ?2", (&id.namespace, &id.name))
            .map_err(backend)?;
        Ok(())
    }
}

pub fn now_ts() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

pub fn maybe_compress(body: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        return zstd::encode_all(body, 3).unwrap_or_else(|_| body.to_vec());
    }
    #[allow(unreachable_code)]
    body.to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use coh_core::{Resource, ResourcePayload};
    use k8s_openapi::api::core::v1::Service;

    fn sample(name: &str) -> ResourceSet {
        let r = Resource::present(name, ResourcePayload::Service(Service::default()), "h");
        ResourceSet::new(0, vec![r]).unwrap()
    }

    fn id() -> DeploymentIdentity {
        DeploymentIdentity::new("ns", "storage")
    }

    async fn exercise(store: &dyn StateStore) {
        assert!(store.load(&id()).await.unwrap().is_none());
        assert_eq!(store.record(&id(), &sample("a"), 0).await.unwrap(), 1);
        assert_eq!(store.record(&id(), &sample("b"), 1).await.unwrap(), 2);
        let err = store.record(&id(), &sample("c"), 1).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict { expected: 1, found: 2 });
        assert!(err.is_retryable());

        let latest = store.load(&id()).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.items()[0].name(), "b");

        store.destroy(&id()).await.unwrap();
        assert!(store.load(&id()).await.unwrap().is_none());
        assert_eq!(store.record(&id(), &sample("d"), 0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_store_compare_and_swap() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_compare_and_swap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        exercise(&SqliteStore::open(path.to_str().unwrap()).unwrap()).await;
    }

    #[tokio::test]
    async fn sqlite_keeps_three_versions() {
        let dir = tempfile::tempdir().unwrap();
        let s = SqliteStore::open(dir.path().join("state.db").to_str().unwrap()).unwrap();
        for v in 0..5u64 {
            s.record(&id(), &sample(&format!("r{v}")), v).await.unwrap();
        }
        let versions: Vec<u64> = s.history(&id(), 10).unwrap().iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![5, 4, 3]);
    }
}
