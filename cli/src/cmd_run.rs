//! `chainevent run`

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tracing::info;

use chainevent_service::{build_from_config, init_tracing, Config};

pub async fn run(path: &Path, verbose: bool) -> Result<()> {
    let config = Config::load(path)
        .with_context(|| format!("failed to load config {}", path.display()))?;

    let mut log = config.log.clone();
    if verbose {
        log.level = "debug".into();
    }
    init_tracing(&log).map_err(|e| anyhow!("failed to initialise logging: {e}"))?;

    let manager = build_from_config(&config).await?;
    info!(
        subscriptions = manager.aliases().len(),
        rpc = %config.chain.rpc_node,
        "chainevent starting"
    );

    let stop = manager.shutdown_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("signal received, shutting down");
        stop.cancel();
    });

    manager.run().await?;
    info!("chainevent stopped");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
