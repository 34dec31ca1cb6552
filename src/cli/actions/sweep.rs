use crate::cli::{actions::connect, globals::GlobalArgs};
use crate::identity::{
    sweeper::{spawn_sweeper, sweep_once, SweeperConfig},
    EngineConfig,
};
use crate::store::RecordStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
    pub engine: EngineConfig,
    pub sweeper: SweeperConfig,
    pub once: bool,
}

/// Sweep expired records once, or periodically until interrupted.
/// # Errors
/// Returns an error if the database is unreachable, migrations fail, or a
/// single sweep fails.
pub async fn execute(args: Args) -> Result<()> {
    let store = connect(&args.globals, args.engine.expiry()).await?;
    store.migrate().await?;

    if args.once {
        let report = sweep_once(&store).await?;
        info!(removed = report.total(), "sweep complete");
        return Ok(());
    }

    info!(
        interval_seconds = args.sweeper.interval().as_secs(),
        "starting expiry sweeper"
    );
    let store: Arc<dyn RecordStore> = Arc::new(store);
    let handle = spawn_sweeper(store, args.sweeper);

    shutdown_signal().await?;
    info!("shutting down expiry sweeper");
    handle.stop().await;

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")
}
