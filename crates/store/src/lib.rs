//! Coalescing work queue for reconcile requests, and the status board.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coh_core::DeploymentIdentity;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

mod board;
mod generations;
mod status;

pub use board::{BoardEntry, BoardSnapshot, StatusBoard};
pub use generations::GenerationBook;
pub use status::{PublishError, StatusSink, TeeSink};

/// Why a deployment was queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    /// The custom resource changed; carries its `metadata.generation`.
    Spec { generation: i64 },
    /// A requeue timer fired.
    Timer,
    /// The custom resource is gone.
    Deleted,
}

impl Trigger {
    /// Merge a newer trigger into a pending one. Deletion is sticky and a
    /// timer never hides a pending spec change.
    fn merge(self, newer: Trigger) -> Trigger {
        match (self, newer) {
            (Trigger::Deleted, Trigger::Spec { .. }) | (Trigger::Deleted, Trigger::Timer) => Trigger::Deleted,
            (Trigger::Spec { generation: a }, Trigger::Spec { generation: b }) => {
                Trigger::Spec { generation: a.max(b) }
            }
            (spec @ Trigger::Spec { .. }, Trigger::Timer) => spec,
            (_, newer) => newer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: DeploymentIdentity,
    pub trigger: Trigger,
}

impl WorkItem {
    pub fn new(id: DeploymentIdentity, trigger: Trigger) -> Self {
        Self { id, trigger }
    }
}

/// Coalescing queue keyed by deployment with FIFO order and fixed capacity.
///
/// A deployment appears at most once; pushing it again merges the trigger and
/// keeps its original position.
pub struct Coalescer {
    map: FxHashMap<DeploymentIdentity, Trigger>,
    order: VecDeque<DeploymentIdentity>,
    cap: usize,
    dropped: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn push(&mut self, item: WorkItem) {
        let WorkItem { id, trigger } = item;
        if let Some(pending) = self.map.get_mut(&id) {
            *pending = pending.merge(trigger);
            return;
        }
        if self.order.len() >= self.cap {
            // deletions are never evicted; their cleanup has no other trigger
            let victim = self.order.iter().position(|k| self.map.get(k).is_some_and(|t| *t != Trigger::Deleted));
            match victim.and_then(|i| self.order.remove(i)) {
                Some(old) => {
                    self.map.remove(&old);
                    self.dropped += 1;
                    warn!(deployment = %old, cap = self.cap, "work queue full; dropped oldest request");
                }
                None => warn!(cap = self.cap, "work queue full of deletions; growing past capacity"),
            }
        }
        self.order.push_back(id.clone());
        self.map.insert(id, trigger);
    }

    pub fn pop(&mut self) -> Option<WorkItem> {
        while let Some(id) = self.order.pop_front() {
            if let Some(trigger) = self.map.remove(&id) {
                return Some(WorkItem { id, trigger });
            }
        }
        None
    }

    pub fn drain_ready(&mut self) -> Vec<WorkItem> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(item) = self.pop() {
            out.push(item);
        }
        out
    }
}

/// Shared, async front of a [`Coalescer`] consumed by the reconcile workers.
pub struct WorkQueue {
    inner: Mutex<Coalescer>,
    notify: Notify,
    closed: AtomicBool,
}

impl WorkQueue {
    pub fn new(cap: usize) -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(Coalescer::with_capacity(cap)), notify: Notify::new(), closed: AtomicBool::new(false) })
    }

    pub fn push(&self, item: WorkItem) {
        if self.is_closed() {
            return;
        }
        {
            let mut q = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            q.push(item);
            gauge!("queue_depth", q.len() as f64);
        }
        self.notify.notify_one();
    }

    /// Queue `item` once `delay` has elapsed, unless the queue is closed by then.
    pub fn push_after(self: &Arc<Self>, item: WorkItem, delay: Duration) {
        if delay.is_zero() {
            self.push(item);
            return;
        }
        debug!(deployment = %item.id, delay_ms = delay.as_millis() as u64, "requeue scheduled");
        counter!("queue_requeue_total", 1u64);
        let me = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            me.push(item);
        });
    }

    /// Next pending item; `None` once the queue is closed.
    pub async fn next(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return None;
            }
            if let Some(item) = self.pop() {
                return Some(item);
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().map(|q| q.dropped()).unwrap_or(0)
    }

    fn pop(&self) -> Option<WorkItem> {
        let mut q = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let item = q.pop();
        gauge!("queue_depth", q.len() as f64);
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, trigger: Trigger) -> WorkItem {
        WorkItem::new(DeploymentIdentity::new("ns", name), trigger)
    }

    #[test]
    fn duplicates_collapse_in_place() {
        let mut c = Coalescer::with_capacity(8);
        c.push(item("a", Trigger::Spec { generation: 1 }));
        c.push(item("b", Trigger::Timer));
        c.push(item("a", Trigger::Spec { generation: 3 }));
        c.push(item("a", Trigger::Timer));
        assert_eq!(c.len(), 2);
        let out = c.drain_ready();
        assert_eq!(out, vec![item("a", Trigger::Spec { generation: 3 }), item("b", Trigger::Timer)]);
        assert!(c.is_empty());
    }

    #[test]
    fn deletion_is_sticky() {
        let mut c = Coalescer::with_capacity(8);
        c.push(item("a", Trigger::Deleted));
        c.push(item("a", Trigger::Spec { generation: 2 }));
        assert_eq!(c.pop(), Some(item("a", Trigger::Deleted)));
        c.push(item("a", Trigger::Spec { generation: 2 }));
        c.push(item("a", Trigger::Deleted));
        assert_eq!(c.pop(), Some(item("a", Trigger::Deleted)));
    }

    #[test]
    fn overflow_never_drops_a_deletion() {
        let mut c = Coalescer::with_capacity(2);
        c.push(item("gone", Trigger::Deleted));
        c.push(item("a", Trigger::Timer));
        c.push(item("b", Trigger::Spec { generation: 1 }));
        assert_eq!(c.dropped(), 1);
        let out = c.drain_ready();
        assert_eq!(out, vec![item("gone", Trigger::Deleted), item("b", Trigger::Spec { generation: 1 })]);

        c.push(item("x", Trigger::Deleted));
        c.push(item("y", Trigger::Deleted));
        c.push(item("z", Trigger::Deleted));
        assert_eq!(c.dropped(), 1);
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut c = Coalescer::with_capacity(2);
        c.push(item("a", Trigger::Timer));
        c.push(item("b", Trigger::Timer));
        c.push(item("c", Trigger::Timer));
        assert_eq!(c.dropped(), 1);
        let names: Vec<String> = c.drain_ready().into_iter().map(|i| i.id.name).collect();
        assert_eq!(names, vec!["b", "c"]);
    }
}
