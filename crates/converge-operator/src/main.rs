use anyhow::{Context, Result};
use kube::{Api, Client};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use converge_operator::reconciler::{KubeStatusWriter, NewResourceReconciler};
use converge_operator::resource::NewResource;
use converge_runtime::{
    KubeLeaseStore, KubeListWatch, Manager, ManagerConfig, Shutdown, TypeRegistry,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON formatting for production
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                .with_current_span(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("newresource-controller starting");

    let config = ManagerConfig::from_env().context("Invalid configuration")?;

    let mut registry = TypeRegistry::new();
    registry.register::<NewResource>();

    let kube_client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    info!("Connected to Kubernetes cluster");

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(%addr, "Serving metrics");
    }

    let source = KubeListWatch::new(Api::<NewResource>::all(kube_client.clone()));
    let reconciler = NewResourceReconciler::new(KubeStatusWriter::new(kube_client.clone()));

    let election = config.leader_election.clone();
    let mut manager = Manager::new(config, &registry, source, reconciler)
        .context("Failed to set up manager")?;
    if election.enabled() {
        info!(
            lease = election.lease_name(),
            namespace = election.namespace(),
            identity = election.holder_id(),
            "Leader election enabled"
        );
        manager = manager.with_lease_store(KubeLeaseStore::new(
            kube_client.clone(),
            election.namespace(),
        ));
    }

    // Setup signal handlers
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    let shutdown = Shutdown::new();
    let run = manager.run(shutdown.signal());
    tokio::pin!(run);

    select! {
        result = &mut run => {
            // Manager failure should trigger pod restart
            return result.context("Manager failure");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
        }
    }

    shutdown.trigger();
    run.await.context("Manager failure during shutdown")?;
    info!("Shutdown complete");

    Ok(())
}
