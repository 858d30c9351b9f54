//! shuffle-proxy
//!
//! Runs one tunnel backend per region on consecutive loopback ports and
//! load-balances client connections across them from a single listener.
//!
//! - **Shuffle mode** (default): the full region pool behind `--bind`
//! - **Single-region mode** (`--region`): one backend bound on `--bind`

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use shuffle_proxy::config::{BackendKind, Cli};
use shuffle_proxy::{Backend, CommandBackend, InstanceSpec, Manager, MockBackend};
use shuffle_regions::{is_known, RegionCode};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Prefer RUST_LOG, fall back to --log-level / --verbose
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_filter().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    cli.validate()?;

    match cli.backend {
        BackendKind::Mock => run(&cli, Arc::new(MockBackend::new())).await,
        BackendKind::Command => {
            let backend = CommandBackend::new(cli.command_backend_config()?);
            run(&cli, Arc::new(backend)).await
        }
    }
}

async fn run<B: Backend>(cli: &Cli, backend: Arc<B>) -> Result<()> {
    match cli.region {
        Some(region) => run_single(cli, region, backend).await,
        None => run_pool(cli, backend).await,
    }
}

async fn run_pool<B: Backend>(cli: &Cli, backend: Arc<B>) -> Result<()> {
    let pool = cli.pool().context("invalid region pool")?;
    for region in pool.regions().iter().filter(|r| !is_known(r)) {
        warn!(region = %region, "Region not in region table");
    }

    info!(
        bind_addr = %cli.bind,
        regions = pool.len(),
        backend = backend.name(),
        "Starting shuffle-proxy"
    );

    let manager = Arc::new(Manager::new(cli.manager_config(), pool, backend));
    let mut manager_task = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.start().await }
    });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
            manager.stop();
        }
        result = &mut manager_task => {
            result.context("manager task panicked")??;
            return Ok(());
        }
    }

    manager_task.await.context("manager task panicked")??;
    info!("Shutdown complete");
    Ok(())
}

async fn run_single<B: Backend>(cli: &Cli, region: RegionCode, backend: Arc<B>) -> Result<()> {
    let spec = InstanceSpec {
        region,
        addr: cli.bind,
        generation: 1,
    };

    info!(
        bind_addr = %cli.bind,
        region = %region,
        label = region.label(),
        backend = backend.name(),
        "Starting single-region proxy"
    );

    let mut handle = backend
        .start(&spec)
        .await
        .with_context(|| format!("failed to start backend for region {}", region))?;

    info!(bind_addr = %cli.bind, region = %region, "Proxy is running");

    tokio::select! {
        _ = shutdown_signal() => {
            info!(region = %region, "Proxy is shutting down");
            handle.stop().await.context("backend did not stop cleanly")?;
        }
        result = handle.exited() => {
            result.context("backend failed")?;
            bail!("backend for region {} exited unexpectedly", region);
        }
    }

    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
