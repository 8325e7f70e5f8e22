use crate::api::cluster::Cluster;
use crate::controllers::{
    client::KubeSandboxClient, controller::Context, credentials::NodeSelector,
    generator::CLUSTER_LABEL,
};
use crate::metrics::Diagnostics;
use crate::{predicates, Error, Metrics};

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        reflector, watcher, WatchStreamExt,
    },
};
use std::sync::Arc;
use tokio::{sync::RwLock, time::Duration};
use tracing::*;

fn error_policy(cluster: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {:?}", error);
    ctx.metrics.reconcile_failure(&cluster, error);
    Action::requeue(Duration::from_secs(5 * 60))
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
    metrics: Metrics,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new() -> prometheus::Result<Self> {
        let registry = prometheus::Registry::default();
        let metrics = Metrics::new()?.register(&registry)?;

        Ok(Self {
            diagnostics: Default::default(),
            registry,
            metrics,
        })
    }

    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub async fn to_context(
        &self,
        client: Client,
        node_selector: Arc<dyn NodeSelector>,
    ) -> Arc<Context> {
        let recorder = self.diagnostics.read().await.recorder(client.clone());

        Arc::new(Context {
            sandbox: Arc::new(KubeSandboxClient::new(client, recorder)),
            node_selector,
            diagnostics: self.diagnostics.clone(),
            metrics: self.metrics.clone(),
        })
    }
}

/// Initialize the sandbox cluster controller (given the crd is installed)
pub async fn run_cluster_controller(
    state: State,
    client: Client,
    node_selector: Arc<dyn NodeSelector>,
) {
    let clusters = Api::<Cluster>::all(client.clone());
    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("Clusters are not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    // Status writes do not bump the generation and must not retrigger.
    let (reader, writer) = reflector::store();
    let clusters = watcher(clusters, watcher::Config::default().any_semantic())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(predicates::generation_with_deletion);

    let children = watcher::Config::default().labels(CLUSTER_LABEL);

    Controller::for_stream(clusters, reader)
        .owns(Api::<ConfigMap>::all(client.clone()), children.clone())
        .owns(Api::<Service>::all(client.clone()), children.clone())
        .owns(Api::<Pod>::all(client.clone()), children.clone())
        .owns(Api::<Secret>::all(client.clone()), children)
        .shutdown_on_signal()
        .run(
            Cluster::reconcile,
            error_policy,
            state.to_context(client, node_selector).await,
        )
        .for_each(|res| async move {
            match res {
                Ok((cluster, _)) => debug!(name = %cluster.name, "Reconciled"),
                Err(e) => debug!("Reconcile stream error: {e}"),
            }
        })
        .await;
}
