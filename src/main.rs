//! Module H, process bootstrap.
//!
//! Loads configuration, builds the cluster client, wires a reconciler per
//! mirrored kind to its own kind's watch loop and to the shared namespace
//! watch loop, then runs until a shutdown signal arrives (spec.md §6).

use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use reflector_lib::config::{build_client, ConfigLoader};
use reflector_lib::errors::EngineResult;
use reflector_lib::gateway::{KubeGateway, KubeNamespaceGateway};
use reflector_lib::indices::ReflectionIndices;
use reflector_lib::reconciler::Reconciler;
use reflector_lib::watch_loop::{NamespaceHandler, NamespaceWatchLoop, ResourceHandler, ResourceWatchLoop};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

async fn run(shutdown: CancellationToken) -> EngineResult<()> {
    let config = ConfigLoader::new().load()?;
    tracing::info!(
        timeout_secs = config.watcher_timeout.as_secs(),
        queue_capacity = config.watcher_queue_capacity,
        "loaded configuration"
    );

    let client = build_client().await?;

    let secret_gateway = Arc::new(KubeGateway::<Secret>::new(client.clone()));
    let configmap_gateway = Arc::new(KubeGateway::<ConfigMap>::new(client.clone()));
    let namespace_gateway = Arc::new(KubeNamespaceGateway::new(client));

    let secret_indices = Arc::new(ReflectionIndices::new());
    let configmap_indices = Arc::new(ReflectionIndices::new());

    let secret_reconciler = Arc::new(Reconciler::new(secret_gateway.clone(), secret_indices));
    let configmap_reconciler = Arc::new(Reconciler::new(configmap_gateway.clone(), configmap_indices));

    let secret_handlers: Vec<Arc<dyn ResourceHandler<Secret>>> = vec![secret_reconciler.clone()];
    let configmap_handlers: Vec<Arc<dyn ResourceHandler<ConfigMap>>> = vec![configmap_reconciler.clone()];
    let namespace_handlers: Vec<Arc<dyn NamespaceHandler>> = vec![secret_reconciler.clone(), configmap_reconciler.clone()];

    let secret_loop = ResourceWatchLoop::new(
        secret_gateway,
        secret_handlers,
        config.watcher_timeout,
        config.watcher_queue_capacity,
    );
    let configmap_loop = ResourceWatchLoop::new(
        configmap_gateway,
        configmap_handlers,
        config.watcher_timeout,
        config.watcher_queue_capacity,
    );
    let namespace_loop = NamespaceWatchLoop::new(
        namespace_gateway,
        namespace_handlers,
        config.watcher_timeout,
        config.watcher_queue_capacity,
    );

    tokio::join!(
        secret_loop.run(shutdown.clone()),
        configmap_loop.run(shutdown.clone()),
        namespace_loop.run(shutdown.clone()),
    );

    Ok(())
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown signal received");
        shutdown_for_signal.cancel();
    });

    match run(shutdown).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "fatal startup error");
            std::process::ExitCode::FAILURE
        }
    }
}
