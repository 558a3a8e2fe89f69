use std::sync::Mutex;

use coh_core::DeploymentIdentity;
use rustc_hash::FxHashMap;
use tokio::sync::watch;

/// Highest spec generation seen per deployment, observable by running scale plans.
#[derive(Default)]
pub struct GenerationBook {
    senders: Mutex<FxHashMap<DeploymentIdentity, watch::Sender<i64>>>,
}

impl GenerationBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `generation`; lower values than the one already seen are ignored.
    pub fn observe(&self, id: &DeploymentIdentity, generation: i64) {
        let mut g = self.senders.lock().unwrap_or_else(|p| p.into_inner());
        match g.get(id) {
            Some(tx) => {
                tx.send_if_modified(|cur| {
                    if generation > *cur {
                        *cur = generation;
                        true
                    } else {
                        false
                    }
                });
            }
            None => {
                let (tx, _) = watch::channel(generation);
                g.insert(id.clone(), tx);
            }
        }
    }

    pub fn latest(&self, id: &DeploymentIdentity) -> Option<i64> {
        let g = self.senders.lock().unwrap_or_else(|p| p.into_inner());
        g.get(id).map(|tx| *tx.borrow())
    }

    /// Receiver for `id`, starting at `floor` when nothing was observed yet.
    pub fn subscribe(&self, id: &DeploymentIdentity, floor: i64) -> watch::Receiver<i64> {
        let mut g = self.senders.lock().unwrap_or_else(|p| p.into_inner());
        g.entry(id.clone()).or_insert_with(|| watch::channel(floor).0).subscribe()
    }

    pub fn forget(&self, id: &DeploymentIdentity) {
        let mut g = self.senders.lock().unwrap_or_else(|p| p.into_inner());
        g.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generations_only_move_forward() {
        let book = GenerationBook::new();
        let id = DeploymentIdentity::new("ns", "storage");
        let rx = book.subscribe(&id, 2);
        book.observe(&id, 4);
        book.observe(&id, 3);
        assert_eq!(*rx.borrow(), 4);
        assert_eq!(book.latest(&id), Some(4));
        book.forget(&id);
        assert_eq!(book.latest(&id), None);
    }
}
