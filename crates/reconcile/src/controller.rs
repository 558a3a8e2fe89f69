use std::sync::{Arc, Mutex};

use coh_core::DeploymentIdentity;
use coh_store::{Trigger, WorkItem, WorkQueue};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{Backoff, Reconciler};

/// Worker pool pulling deployments off the queue and running reconcile cycles.
pub struct Controller {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    workers: usize,
    backoff: Backoff,
    attempts: Mutex<FxHashMap<DeploymentIdentity, u32>>,
}

impl Controller {
    pub fn new(reconciler: Arc<Reconciler>, queue: Arc<WorkQueue>, workers: usize, backoff: Backoff) -> Arc<Self> {
        Arc::new(Self { reconciler, queue, workers: workers.max(1), backoff, attempts: Mutex::new(FxHashMap::default()) })
    }

    /// Run until `cancel` fires, then close the queue and wait for in-flight cycles.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(workers = self.workers, "controller started");
        let mut handles = Vec::with_capacity(self.workers);
        for worker in 0..self.workers {
            let me = Arc::clone(&self);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                while let Some(item) = me.queue.next().await {
                    me.handle(item, &cancel).await;
                }
                tracing::debug!(worker, "worker exited");
            }));
        }
        cancel.cancelled().await;
        self.queue.close();
        for h in handles {
            if let Err(e) = h.await {
                error!(error = %e, "worker panicked");
            }
        }
        info!("controller stopped");
    }

    /// Reconcile one queued deployment and schedule whatever follow-up it needs.
    pub async fn handle(&self, item: WorkItem, cancel: &CancellationToken) {
        let cycle = Uuid::new_v4();
        let span = info_span!("reconcile", %cycle, deployment = %item.id, trigger = ?item.trigger);
        async {
            let id = item.id;
            match self.reconciler.reconcile(&id, cancel).await {
                Ok(report) => {
                    self.attempts().remove(&id);
                    if let Some(delay) = report.requeue {
                        self.queue.push_after(WorkItem::new(id, Trigger::Timer), delay);
                    }
                }
                Err(e) if e.is_retryable() => {
                    let attempt = {
                        let mut attempts = self.attempts();
                        let n = attempts.entry(id.clone()).or_insert(0);
                        *n += 1;
                        *n
                    };
                    let delay = self.backoff.delay(attempt - 1);
                    counter!("reconcile_retries", 1u64);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "reconcile failed; retrying");
                    self.reconciler.report_error(&id, &e).await;
                    if !cancel.is_cancelled() {
                        self.queue.push_after(WorkItem::new(id, Trigger::Timer), delay);
                    }
                }
                Err(e) => {
                    error!(error = %e, "reconcile failed permanently");
                    self.attempts().remove(&id);
                    self.reconciler.report_error(&id, &e).await;
                }
            }
        }
        .instrument(span)
        .await
    }

    fn attempts(&self) -> std::sync::MutexGuard<'_, FxHashMap<DeploymentIdentity, u32>> {
        self.attempts.lock().unwrap_or_else(|p| p.into_inner())
    }
}
