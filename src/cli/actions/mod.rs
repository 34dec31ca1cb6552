pub mod migrate;
pub mod sweep;

// Internal "interpreter" for `Action`.
mod run;

use crate::cli::globals::GlobalArgs;
use crate::store::{postgres::PgStore, Expiry};
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::debug;

#[derive(Debug)]
pub enum Action {
    Migrate(migrate::Args),
    Sweep(sweep::Args),
}

impl Action {
    /// Execute the action.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> Result<()> {
        run::execute(self).await
    }
}

/// Open a pool and wrap it in a store with the given expiry.
pub(crate) async fn connect(globals: &GlobalArgs, expiry: Expiry) -> Result<PgStore> {
    debug!("Global args: {:?}", globals);

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(globals.max_connections)
        .max_lifetime(Duration::from_secs(60 * 30))
        .test_before_acquire(true)
        .connect(&globals.connection_url()?)
        .await
        .context("Failed to connect to database")?;

    Ok(PgStore::new(pool, expiry))
}
