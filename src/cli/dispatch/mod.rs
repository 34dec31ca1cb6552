//! Map validated CLI arguments to the action the binary runs.

use crate::cli::actions::{migrate, sweep, Action};
use crate::cli::commands::{
    database, engine, ARG_ONCE, ARG_SWEEP_INTERVAL_SECONDS, CMD_MIGRATE, CMD_SWEEP,
};
use crate::cli::globals::GlobalArgs;
use crate::identity::sweeper::{SweeperConfig, DEFAULT_SWEEP_INTERVAL_SECONDS};
use anyhow::{bail, Result};

/// Map validated CLI matches to an action.
///
/// # Errors
/// Returns an error if required arguments are missing or no subcommand was given.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let globals = GlobalArgs::from(database::Options::parse(matches)?);

    match matches.subcommand() {
        Some((CMD_MIGRATE, _)) => Ok(Action::Migrate(migrate::Args { globals })),
        Some((CMD_SWEEP, sub_m)) => {
            let interval = sub_m
                .get_one::<u64>(ARG_SWEEP_INTERVAL_SECONDS)
                .copied()
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECONDS);

            Ok(Action::Sweep(sweep::Args {
                globals,
                engine: engine::parse(matches)?,
                sweeper: SweeperConfig::new().with_interval_seconds(interval),
                once: sub_m.get_flag(ARG_ONCE),
            }))
        }
        Some((other, _)) => bail!("unknown subcommand: {other}"),
        None => bail!("missing subcommand, try `signet --help`"),
    }
}
