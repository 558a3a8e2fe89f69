//! Kubernetes adapters: watch intake, apply sink, replica control, exec,
//! Secret-backed state store and status writer.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use coh_core::{Coherence, DeploymentIdentity};
use coh_store::{GenerationBook, Trigger, WorkItem, WorkQueue};
use futures::TryStreamExt;
use kube::{
    api::Api,
    runtime::watcher::{self, Event},
    Client, ResourceExt,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

mod control;
mod secret_store;
mod sink;
mod source;

pub use control::{KubeExec, KubeReplicaControl};
pub use secret_store::SecretStateStore;
pub use sink::{manifest, KubeSink};
pub use source::{KubeSpecSource, KubeStatusSink, FINALIZER, FINALIZER_BYPASS_ANNOTATION};

/// Field manager used for server-side apply unless configured otherwise.
pub const DEFAULT_FIELD_MANAGER: &str = "coherence-operator";

pub async fn connect() -> Result<Client> {
    Client::try_default().await.context("building kube client from environment")
}

pub(crate) fn api_code(e: &kube::Error) -> Option<u16> {
    match e {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    }
}

fn identity_of(obj: &Coherence) -> Option<DeploymentIdentity> {
    Some(DeploymentIdentity::new(obj.namespace()?, obj.name_any()))
}

/// Turns watch events into queued work, skipping status-only updates.
struct Intake {
    seen: FxHashMap<DeploymentIdentity, i64>,
    queue: Arc<WorkQueue>,
    generations: Arc<GenerationBook>,
}

impl Intake {
    fn applied(&mut self, obj: &Coherence, force: bool) {
        let Some(id) = identity_of(obj) else { return };
        let generation = obj.metadata.generation.unwrap_or(0);
        let prior = self.seen.insert(id.clone(), generation);
        // a deletion mark is queued even without a generation bump
        let deleting = obj.metadata.deletion_timestamp.is_some();
        if !force && !deleting && prior == Some(generation) {
            return;
        }
        self.generations.observe(&id, generation);
        counter!("watch_events", 1u64);
        self.queue.push(WorkItem::new(id, Trigger::Spec { generation }));
    }

    fn deleted(&mut self, obj: &Coherence) {
        let Some(id) = identity_of(obj) else { return };
        debug!(deployment = %id, "custom resource deleted");
        self.seen.remove(&id);
        self.queue.push(WorkItem::new(id, Trigger::Deleted));
    }
}

/// List+watch Coherence resources and queue a reconcile for every spec change.
pub async fn start_watcher(
    client: Client,
    namespace: Option<&str>,
    queue: Arc<WorkQueue>,
    generations: Arc<GenerationBook>,
) -> Result<()> {
    let api: Api<Coherence> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let mut intake = Intake { seen: FxHashMap::default(), queue, generations };

    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "watcher started");
    while let Some(ev) = stream.try_next().await.context("watching Coherence resources")? {
        match ev {
            Event::Applied(o) => intake.applied(&o, false),
            Event::Deleted(o) => intake.deleted(&o),
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                for o in list.iter() {
                    intake.applied(o, true);
                }
            }
        }
    }
    warn!("watcher stream ended");
    Ok(())
}
