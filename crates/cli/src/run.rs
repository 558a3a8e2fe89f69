use std::sync::Arc;

use anyhow::{Context, Result};
use coh_core::Catalog;
use coh_kubehub::{KubeExec, KubeReplicaControl, KubeSink, KubeSpecSource, KubeStatusSink, SecretStateStore};
use coh_persist::{SqliteStore, StateStore};
use coh_probe::StatusHaProber;
use coh_reconcile::{Controller, Ports, Reconciler};
use coh_store::{GenerationBook, StatusBoard, StatusSink, TeeSink, WorkQueue};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{OperatorConfig, StoreBackend};

/// Wire the kube adapters into a controller and run until Ctrl-C or the watch fails.
pub async fn run(cfg: OperatorConfig, catalog: Catalog) -> Result<()> {
    let client = coh_kubehub::connect().await?;

    let store: Arc<dyn StateStore> = match cfg.store {
        StoreBackend::Secret => Arc::new(SecretStateStore::new(client.clone())),
        StoreBackend::Sqlite => {
            let path = cfg.store_path.to_string_lossy();
            Arc::new(SqliteStore::open(&path).with_context(|| format!("opening state store {path}"))?)
        }
    };
    let board = Arc::new(StatusBoard::new());
    let kube_status: Arc<dyn StatusSink> = Arc::new(KubeStatusSink::new(client.clone()));
    let board_status: Arc<dyn StatusSink> = board.clone();
    let status: Arc<dyn StatusSink> = Arc::new(TeeSink(vec![kube_status, board_status]));
    let prober = StatusHaProber::new(catalog.container_name.clone()).with_exec(Arc::new(KubeExec::new(client.clone())));
    let generations = Arc::new(GenerationBook::new());
    let queue = WorkQueue::new(cfg.queue_capacity);

    let ports = Ports {
        source: Arc::new(KubeSpecSource::new(client.clone())),
        sink: Arc::new(KubeSink::new(client.clone(), cfg.field_manager.clone())),
        control: Arc::new(KubeReplicaControl::new(client.clone())),
        prober: Arc::new(prober),
        store,
        status,
        generations: generations.clone(),
    };
    let reconciler = Arc::new(Reconciler::new(ports, Arc::new(catalog), cfg.reconciler_config()));
    let controller = Controller::new(reconciler, queue.clone(), cfg.workers, cfg.backoff());

    let cancel = CancellationToken::new();
    let controller_handle = tokio::spawn(controller.run(cancel.clone()));
    let mut watcher_handle = tokio::spawn({
        let ns = cfg.namespace.clone();
        async move { coh_kubehub::start_watcher(client, ns.as_deref(), queue, generations).await }
    });
    info!(ns = ?cfg.namespace, workers = cfg.workers, store = ?cfg.store, "operator started");

    let outcome = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received; shutting down");
            Ok(())
        }
        res = &mut watcher_handle => match res {
            Ok(Ok(())) => {
                warn!("watcher ended; shutting down");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = ?e, "watcher failed");
                Err(e)
            }
            Err(e) => Err(anyhow::Error::new(e).context("watcher task")),
        },
    };

    cancel.cancel();
    watcher_handle.abort();
    if let Err(e) = controller_handle.await {
        warn!(error = %e, "controller task did not stop cleanly");
    }
    for (id, entry) in board.current().sorted() {
        info!(deployment = %id, phase = ?entry.record.phase, replicas = entry.record.replicas, "last status");
    }
    outcome
}
