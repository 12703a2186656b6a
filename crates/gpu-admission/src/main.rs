use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use utils::version;

use gpu_admission::api::server::run_debug_server;
use gpu_admission::api::ApiServer;
use gpu_admission::config::Cli;
use gpu_admission::config::ExtenderConfig;
use gpu_admission::k8s::init_kube_client;
use gpu_admission::k8s::ClusterClient;
use gpu_admission::k8s::KubeClusterClient;
use gpu_admission::scheduling::GpuFilter;
use gpu_admission::scheduling::QuotaStore;

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init();

    let cli = Cli::parse();
    tracing::info!("Starting gpu-admission {}", &**version::VERSION);

    let config = match &cli.config {
        Some(path) => ExtenderConfig::load(path)
            .await
            .context("failed to load extender config")?,
        None => ExtenderConfig::default(),
    };

    let client = init_kube_client(cli.kubeconfig.clone(), cli.master.clone(), cli.incluster_mode)
        .await
        .map_err(|e| anyhow::anyhow!("failed to build kubernetes client: {e:?}"))?;
    let cluster: Arc<dyn ClusterClient> = Arc::new(
        KubeClusterClient::new(client)
            .await
            .map_err(|e| anyhow::anyhow!("failed to start cluster caches: {e:?}"))?,
    );

    let quota = Arc::new(QuotaStore::new(
        &config.quota_config_map_name,
        &config.quota_config_map_namespace,
    ));

    let token = CancellationToken::new();

    let refresher = tokio::spawn(quota.clone().run(cluster.clone(), token.clone()));

    if let Some(debug_addr) = cli.pprof_address.clone() {
        let debug_token = token.clone();
        tokio::spawn(async move {
            if let Err(e) = run_debug_server(debug_addr, debug_token).await {
                tracing::error!("debug server failed: {e:?}");
            }
        });
    }

    let filter = Arc::new(GpuFilter::new(cluster, quota, config));
    let server = ApiServer::new(filter, cli.address.clone());

    let signal_token = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    let result = server
        .run(token.clone())
        .await
        .map_err(|e| anyhow::anyhow!("extender server failed: {e:?}"));

    token.cancel();
    let _ = refresher.await;

    result
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::signal;
        use tokio::signal::unix::SignalKind;

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {e}");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    tracing::error!("failed to listen for Ctrl+C: {e}");
                    return;
                }
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {e}");
            return;
        }
        tracing::info!("Received Ctrl+C, initiating graceful shutdown");
    }
}
