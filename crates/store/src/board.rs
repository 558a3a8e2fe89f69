use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use coh_core::{DeploymentIdentity, StatusRecord};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoardEntry {
    pub record: StatusRecord,
    pub updated_at: DateTime<Utc>,
}

/// Immutable view of the latest status per deployment.
#[derive(Debug, Clone, Default)]
pub struct BoardSnapshot {
    pub epoch: u64,
    pub entries: FxHashMap<DeploymentIdentity, BoardEntry>,
}

impl BoardSnapshot {
    /// Entries sorted by identity.
    pub fn sorted(&self) -> Vec<(&DeploymentIdentity, &BoardEntry)> {
        let mut v: Vec<_> = self.entries.iter().collect();
        v.sort_by(|a, b| a.0.namespace.cmp(&b.0.namespace).then_with(|| a.0.name.cmp(&b.0.name)));
        v
    }
}

/// Latest StatusRecord per deployment, swapped atomically for readers.
pub struct StatusBoard {
    snap: ArcSwap<BoardSnapshot>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { snap: ArcSwap::from_pointee(BoardSnapshot::default()), epoch_tx }
    }

    pub fn current(&self) -> Arc<BoardSnapshot> {
        self.snap.load_full()
    }

    pub fn get(&self, id: &DeploymentIdentity) -> Option<StatusRecord> {
        self.snap.load().entries.get(id).map(|e| e.record.clone())
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    pub fn publish(&self, id: &DeploymentIdentity, record: StatusRecord) {
        let entry = BoardEntry { record, updated_at: Utc::now() };
        self.swap(|entries| {
            entries.insert(id.clone(), entry.clone());
        });
    }

    pub fn remove(&self, id: &DeploymentIdentity) {
        self.swap(|entries| {
            entries.remove(id);
        });
    }

    fn swap(&self, edit: impl Fn(&mut FxHashMap<DeploymentIdentity, BoardEntry>)) {
        let prev = self.snap.rcu(|cur| {
            let mut entries = cur.entries.clone();
            edit(&mut entries);
            Arc::new(BoardSnapshot { epoch: cur.epoch + 1, entries })
        });
        self.epoch_tx.send_replace(prev.epoch + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coh_core::Phase;

    #[test]
    fn publish_replaces_and_bumps_epoch() {
        let board = StatusBoard::new();
        let rx = board.subscribe_epoch();
        let id = DeploymentIdentity::new("ns", "storage");
        board.publish(&id, StatusRecord { phase: Phase::Created, ..Default::default() });
        board.publish(&id, StatusRecord { phase: Phase::Ready, replicas: 3, ..Default::default() });
        let snap = board.current();
        assert_eq!(snap.epoch, 2);
        assert_eq!(snap.entries.len(), 1);
        assert_eq!(board.get(&id).map(|r| r.phase), Some(Phase::Ready));
        assert_eq!(*rx.borrow(), 2);

        board.remove(&id);
        assert!(board.get(&id).is_none());
        assert_eq!(*rx.borrow(), 3);
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let board = StatusBoard::new();
        let a = DeploymentIdentity::new("ns", "a");
        board.publish(&a, StatusRecord::default());
        let held = board.current();
        board.publish(&DeploymentIdentity::new("ns", "b"), StatusRecord::default());
        assert_eq!(held.entries.len(), 1);
        let snapshot = board.current();
        let names: Vec<&str> = snapshot.sorted().iter().map(|(id, _)| id.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
