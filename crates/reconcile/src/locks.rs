use std::sync::Mutex;

use coh_core::DeploymentIdentity;
use rustc_hash::FxHashSet;

/// At most one holder per deployment; a busy deployment is skipped, never awaited.
#[derive(Default)]
pub struct IdentityLocks {
    held: Mutex<FxHashSet<DeploymentIdentity>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_lock(&self, id: &DeploymentIdentity) -> Option<LockGuard<'_>> {
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if !held.insert(id.clone()) {
            return None;
        }
        Some(LockGuard { locks: self, id: id.clone() })
    }

    pub fn is_locked(&self, id: &DeploymentIdentity) -> bool {
        self.held.lock().unwrap_or_else(|p| p.into_inner()).contains(id)
    }
}

pub struct LockGuard<'a> {
    locks: &'a IdentityLocks,
    id: DeploymentIdentity,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let locks = IdentityLocks::new();
        let a = DeploymentIdentity::new("ns", "a");
        let g = locks.try_lock(&a).unwrap();
        assert!(locks.try_lock(&a).is_none());
        assert!(locks.try_lock(&DeploymentIdentity::new("ns", "b")).is_some());
        drop(g);
        assert!(!locks.is_locked(&a));
        assert!(locks.try_lock(&a).is_some());
    }
}
