use crate::cli::{actions::connect, globals::GlobalArgs};
use crate::identity::EngineConfig;
use anyhow::Result;
use tracing::info;

#[derive(Debug)]
pub struct Args {
    pub globals: GlobalArgs,
}

/// Apply pending migrations and exit.
/// # Errors
/// Returns an error if the database is unreachable or a migration fails.
pub async fn execute(args: Args) -> Result<()> {
    let store = connect(&args.globals, EngineConfig::default().expiry()).await?;
    store.migrate().await?;
    info!("database schema is up to date");
    Ok(())
}
