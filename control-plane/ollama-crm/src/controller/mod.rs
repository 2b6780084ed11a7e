use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Client,
    api::Api,
    runtime::{
        Controller,
        controller::{self, Action},
        reflector::ObjectRef,
        watcher,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CrmConfig;
use crate::crd::model::Model;
use crate::registry::KindRegistry;
use crate::store::{KubeStore, ObjectKey, ObjectStore, StoreError};
use crate::templates::ServerTemplate;

mod converge;
pub mod mapper;
pub mod patch;
pub mod queue;
mod reconcile;
mod teardown;

pub use mapper::pod_to_models;
pub use patch::{ModelPatch, merge_from};
pub use reconcile::Reconciler;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("model {0} has no uid")]
    MissingUid(ObjectKey),
    #[error("reconciliation cancelled")]
    Cancelled,
}

impl From<StoreError> for ReconcileErr {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Cancelled => ReconcileErr::Cancelled,
            other => ReconcileErr::Store(other),
        }
    }
}

pub struct ControllerContext {
    pub reconciler: Reconciler,
    pub cfg: CrmConfig,
    pub shutdown: CancellationToken,
    // consecutive failures per key, for backoff
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl ControllerContext {
    pub fn new(
        reconciler: Reconciler,
        cfg: CrmConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            reconciler,
            cfg,
            shutdown,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_failure(&self, key: &ObjectKey) -> u32 {
        let mut f = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        let n = f.entry(key.clone()).or_insert(0);
        *n = n.saturating_add(1);
        *n
    }

    pub fn clear_failures(&self, key: &ObjectKey) {
        self.failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
    }
}

pub async fn run_controller(
    client: Client,
    cfg: CrmConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let registry = Arc::new(KindRegistry::new());
    let store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client.clone()));
    let template = ServerTemplate::new(Some(cfg.server_image()));
    let reconciler = Reconciler::new(store, template, registry.clone());

    let (models, pods): (Api<Model>, Api<Pod>) = match cfg.k8s_namespace.as_deref() {
        Some(ns) => (
            Api::namespaced(client.clone(), ns),
            Api::namespaced(client, ns),
        ),
        None => (Api::all(client.clone()), Api::all(client)),
    };
    info!(namespace = ?cfg.k8s_namespace, concurrency = cfg.concurrency, "controller: starting");

    let concurrency = cfg.concurrency;
    let stop = shutdown.clone();
    let ctx = Arc::new(ControllerContext::new(reconciler, cfg, shutdown));
    let outcomes = ctx.clone();
    Controller::new(models, watcher::Config::default())
        .watches(pods, watcher::Config::default(), move |pod: Pod| {
            pod_to_models(&registry, &pod)
                .into_iter()
                .map(|k| ObjectRef::<Model>::new(&k.name).within(&k.namespace))
                .collect::<Vec<_>>()
        })
        .with_config(controller::Config::default().concurrency(concurrency))
        .graceful_shutdown_on(async move { stop.cancelled().await })
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            observe(&outcomes, res);
            futures_util::future::ready(())
        })
        .await;

    info!("controller: stopped");
    Ok(())
}

type RunResult = Result<
    (ObjectRef<Model>, Action),
    controller::Error<ReconcileErr, watcher::Error>,
>;

fn observe(ctx: &ControllerContext, res: RunResult) {
    match res {
        Ok((obj_ref, _action)) => debug!(%obj_ref, "reconciled"),
        // erased while a retry was pending; no pass will clear it
        Err(controller::Error::ObjectNotFound(obj_ref)) => {
            let key = ObjectKey::new(
                obj_ref.namespace.as_deref().unwrap_or("default"),
                obj_ref.name.as_str(),
            );
            debug!(%key, "model gone; dropping retry state");
            ctx.clear_failures(&key);
        }
        Err(e) => warn!(error = %e, "reconcile error"),
    }
}

async fn reconcile(
    obj: Arc<Model>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let key = ObjectKey::of(obj.as_ref());
    let cancel = ctx.shutdown.child_token();
    ctx.reconciler.reconcile(&key, &cancel).await?;
    ctx.clear_failures(&key);
    Ok(Action::await_change())
}

fn error_policy(
    obj: Arc<Model>,
    error: &ReconcileErr,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = ObjectKey::of(obj.as_ref());
    let failures = ctx.record_failure(&key);
    let delay = ctx.cfg.backoff.delay(failures);
    warn!(%key, failures, ?delay, error = %error, "reconcile failed; requeueing");
    Action::requeue(delay)
}
