use std::process::ExitCode;
use std::sync::Arc;

use podterm::config::AppConfig;
use podterm::kubernetes::{KubeClient, KubeExecutor};
use podterm::server;
use podterm::terminal::Bridge;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!("Starting podterm v{}", env!("CARGO_PKG_VERSION"));

    // kube's TLS stack needs a process-wide provider when several are compiled in
    if rustls::crypto::aws_lc_rs::default_provider().install_default().is_err() {
        tracing::debug!("TLS crypto provider already installed");
    }

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = AppConfig::load()?;
    config.validate()?;

    let client = KubeClient::connect(&config.kube).await?;
    match client.server_version().await {
        Ok(version) => {
            tracing::info!("Connected to {} (Kubernetes {})", client.context_name(), version)
        }
        // Not fatal: the cluster may come up after us
        Err(e) => tracing::warn!("Kubernetes API not reachable yet: {}", e),
    }

    let executor = Arc::new(KubeExecutor::new(client.inner().clone()));
    let bridge = Arc::new(Bridge::new(executor, config.shell_command.clone()));

    server::serve(&config, bridge, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
