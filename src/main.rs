use std::sync::Arc;

use actix_web::{
    get, middleware,
    web::{Data, Query},
    App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use kaas_operator::{
    api::cluster::list_clusters,
    controllers::credentials::{
        FirstNodeSelector, NodeSelector, RandomNodeSelector, DEFAULT_NODE_SEED,
    },
    telemetry, State,
};
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use tracing::{error, info};

/// Provisions throwaway Kubernetes clusters inside privileged pods.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address the metrics and health server listens on
    #[arg(long, env = "KAAS_BIND", default_value = "0.0.0.0:8443")]
    bind: String,

    /// Seed for picking the node a node-port sandbox is reached through
    #[arg(long, env = "KAAS_NODE_SEED", default_value_t = DEFAULT_NODE_SEED)]
    node_seed: u64,

    /// Always use the first listed node instead of a seeded random one
    #[arg(long, env = "KAAS_FIRST_NODE")]
    first_node: bool,
}

impl Args {
    fn node_selector(&self) -> Arc<dyn NodeSelector> {
        if self.first_node {
            Arc::new(FirstNodeSelector)
        } else {
            Arc::new(RandomNodeSelector::seeded(self.node_seed))
        }
    }
}

#[derive(Deserialize)]
struct ListQuery {
    namespace: Option<String>,
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

/// Read-only listing of sandbox clusters, optionally within one namespace.
#[get("/clusters")]
async fn clusters(client: Data<Client>, query: Query<ListQuery>) -> impl Responder {
    match list_clusters(client.get_ref().clone(), query.namespace.as_deref()).await {
        Ok(clusters) => HttpResponse::Ok().json(clusters),
        Err(e) => {
            error!("Cluster listing failed: {e}");
            HttpResponse::InternalServerError().body(e.to_string())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init()?;

    // Init k8s controller state
    let state = State::new()?;
    let client = Client::try_default().await?;
    let cluster_controller = kaas_operator::run_cluster_controller(
        state.clone(),
        client.clone(),
        args.node_selector(),
    );

    info!(bind = %args.bind, "Starting web server");
    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .app_data(Data::new(client.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
            .service(clusters)
    })
    .bind(&args.bind)?
    .shutdown_timeout(5)
    .run();

    tokio::join!(cluster_controller, server).1?;
    Ok(())
}
